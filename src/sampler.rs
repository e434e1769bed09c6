use crate::config::ValidationSettings;
use dashmap::DashMap;
use nostr::RelayUrl;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Lowest probability ever returned, so a trusted relay is still spot-checked.
const MIN_VALIDATION_PROBABILITY: f64 = 0.01;

#[derive(Debug, Default)]
struct RelayStats {
    valid: AtomicU64,
    invalid: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationStats {
    pub valid: u64,
    pub invalid: u64,
}

impl ValidationStats {
    pub fn total(&self) -> u64 {
        self.valid + self.invalid
    }

    pub fn trust_ratio(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.valid as f64 / self.total() as f64
    }
}

/// Per-relay signature trust statistics.
///
/// Relays earn a lower verification rate by delivering valid signatures.
/// Below `min_samples` every event is verified.
#[derive(Debug)]
pub struct ValidationSampler {
    stats: DashMap<RelayUrl, RelayStats>,
    min_samples: u64,
    max_trust_reduction: f64,
}

impl ValidationSampler {
    pub fn new(settings: &ValidationSettings) -> Self {
        Self {
            stats: DashMap::new(),
            min_samples: settings.min_samples,
            max_trust_reduction: settings.max_trust_reduction.clamp(0.0, 1.0),
        }
    }

    pub fn stats(&self, relay: &RelayUrl) -> ValidationStats {
        self.stats
            .get(relay)
            .map(|stats| ValidationStats {
                valid: stats.valid.load(Ordering::Relaxed),
                invalid: stats.invalid.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn validation_probability(&self, relay: &RelayUrl) -> f64 {
        let stats = self.stats(relay);
        if stats.total() < self.min_samples {
            return 1.0;
        }
        let probability = 1.0 - stats.trust_ratio() * self.max_trust_reduction;
        probability.clamp(MIN_VALIDATION_PROBABILITY, 1.0)
    }

    pub fn should_validate(&self, relay: &RelayUrl) -> bool {
        let probability = self.validation_probability(relay);
        if probability >= 1.0 {
            return true;
        }
        rand::thread_rng().gen_bool(probability)
    }

    pub fn record_validation(&self, relay: &RelayUrl, valid: bool) {
        let stats = self.stats.entry(relay.clone()).or_default();
        if valid {
            stats.valid.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset_relay(&self, relay: &RelayUrl) {
        if self.stats.remove(relay).is_some() {
            debug!("[{}] Validation stats reset", relay);
        }
    }

    pub fn reset(&self) {
        self.stats.clear();
        debug!("All validation stats reset");
    }
}
