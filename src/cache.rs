//! Local persistence boundary.

use crate::error::Error;
use crate::event::EventExt;
use crate::filter::Filter;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use nostr::Event;
use std::fmt;
use tracing::trace;

#[async_trait]
pub trait EventCache: Send + Sync + fmt::Debug {
    async fn store(&self, event: &Event) -> Result<(), Error>;

    /// Lazily yields stored events matching `filter`, newest first.
    fn query(&self, filter: &Filter) -> BoxStream<'_, Event>;
}

/// In-process cache keyed by dedup key, so a replaceable event only keeps its
/// newest version.
#[derive(Debug, Default)]
pub struct MemoryCache {
    events: DashMap<String, Event>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventCache for MemoryCache {
    async fn store(&self, event: &Event) -> Result<(), Error> {
        if event.is_ephemeral() {
            trace!("Not caching ephemeral event {}", event.id);
            return Ok(());
        }

        self.events
            .entry(event.dedup_key())
            .and_modify(|stored| {
                if event.created_at > stored.created_at {
                    *stored = event.clone();
                }
            })
            .or_insert_with(|| event.clone());
        Ok(())
    }

    fn query(&self, filter: &Filter) -> BoxStream<'_, Event> {
        let mut matches: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.get_limit() {
            matches.truncate(limit);
        }
        stream::iter(matches).boxed()
    }
}
