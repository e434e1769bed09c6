use crate::cache::EventCache;
use crate::config::EngineSettings;
use crate::dedup::DedupIndex;
use crate::error::Error;
use crate::event::EventExt;
use crate::filter::Filter;
use crate::grouping::Grouper;
use crate::message::RelayMessage;
use crate::metrics;
use crate::relay::SharedRelay;
use crate::sampler::ValidationSampler;
use crate::stream::{EventStream, OverflowPolicy, StreamReceiver};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::timer::{Timer, TokioTimer};
use dashmap::DashMap;
use futures::StreamExt;
use nostr::{Event, RelayUrl, SubscriptionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tracing_futures::Instrument;

/// An accepted event and the relay that delivered it first.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub event: Arc<Event>,
    pub relay: RelayUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { recipients: usize },
    Duplicate,
    Rejected,
}

pub struct ManagerBuilder {
    settings: EngineSettings,
    timer: Option<Arc<dyn Timer>>,
    cache: Option<Arc<dyn EventCache>>,
}

impl ManagerBuilder {
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn EventCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> SubscriptionManager {
        let settings = self.settings;
        let timer = self
            .timer
            .unwrap_or_else(|| Arc::new(TokioTimer::new()) as Arc<dyn Timer>);

        SubscriptionManager {
            subscriptions: Arc::new(DashMap::new()),
            grouper: Grouper::new(settings.group_delay, timer),
            dedup: Arc::new(DedupIndex::new(settings.dedup_capacity)),
            sampler: Arc::new(ValidationSampler::new(&settings.validation)),
            cache: self.cache,
            global: Arc::new(EventStream::new(
                settings.global_buffer,
                OverflowPolicy::DropNewest,
            )),
            next_id: Arc::new(AtomicU64::new(1)),
            token: CancellationToken::new(),
            settings: Arc::new(settings),
        }
    }
}

/// Entry point for every event and EOSE a relay delivers, and owner of every
/// live subscription.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    settings: Arc<EngineSettings>,
    subscriptions: Arc<DashMap<SubscriptionId, Arc<Subscription>>>,
    grouper: Arc<Grouper>,
    dedup: Arc<DedupIndex>,
    sampler: Arc<ValidationSampler>,
    cache: Option<Arc<dyn EventCache>>,
    global: Arc<EventStream<RelayEvent>>,
    next_id: Arc<AtomicU64>,
    token: CancellationToken,
}

impl SubscriptionManager {
    pub fn new(settings: EngineSettings) -> Self {
        Self::builder(settings).build()
    }

    pub fn builder(settings: EngineSettings) -> ManagerBuilder {
        ManagerBuilder {
            settings,
            timer: None,
            cache: None,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn sampler(&self) -> &ValidationSampler {
        &self.sampler
    }

    pub fn grouper(&self) -> &Arc<Grouper> {
        &self.grouper
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn get_subscription(&self, subscription_id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions
            .get(subscription_id)
            .map(|entry| entry.value().clone())
    }

    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Arc<Subscription>, Error> {
        self.subscribe_with(filters, SubscriptionOptions::default())
    }

    /// Registers a subscription. No relay traffic happens until it is started
    /// or enqueued for grouping.
    pub fn subscribe_with(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<Arc<Subscription>, Error> {
        if filters.is_empty() {
            return Err(Error::invalid_filter("at least one filter is required"));
        }
        for filter in &filters {
            filter.validate()?;
        }

        let id = SubscriptionId::new(format!(
            "sub-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let subscription = Arc::new(Subscription::new(
            id.clone(),
            filters,
            options,
            self.settings.subscription_buffer,
        ));
        self.subscriptions.insert(id.clone(), subscription.clone());
        metrics::active_subscriptions().increment(1.0);
        debug!(
            "[{}] Registered with {} filter(s)",
            id,
            subscription.filters().len()
        );
        Ok(subscription)
    }

    /// Delivers cached matches, then subscribes directly on `relays`.
    pub async fn start(&self, subscription: &Arc<Subscription>, relays: Vec<SharedRelay>) {
        self.load_from_cache(subscription).await;
        subscription.start(relays);
    }

    /// Delivers cached matches, then hands the subscription to the grouper.
    pub async fn enqueue_for_grouping(
        &self,
        subscription: &Arc<Subscription>,
        relays: Vec<SharedRelay>,
    ) {
        self.load_from_cache(subscription).await;
        if subscription.is_stopped() {
            return;
        }
        self.grouper.enqueue(subscription.clone(), relays);
    }

    async fn load_from_cache(&self, subscription: &Arc<Subscription>) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !subscription.options().use_cache {
            return;
        }

        let mut loaded = 0;
        for filter in subscription.filters() {
            let mut events = cache.query(&filter.without_time_bounds());
            while let Some(event) = events.next().await {
                if subscription.matches(&event) && subscription.emit(Arc::new(event)) {
                    loaded += 1;
                }
            }
        }
        subscription.set_cache_delivered();
        debug!("[{}] Delivered {} cached event(s)", subscription.id(), loaded);
    }

    /// Routes one event delivered by `relay` on `subscription_id`.
    ///
    /// Repeated deliveries of the same dedup key are dropped before any other
    /// work. Signatures are checked as often as the relay's trust allows; an
    /// invalid event does not claim its dedup key so a valid copy can still
    /// arrive from another relay.
    pub async fn dispatch_event(
        &self,
        event: Event,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
    ) -> DispatchOutcome {
        let key = event.dedup_key();
        if self.dedup.contains(&key) {
            trace!("[{}] Duplicate {} from {}", subscription_id, key, relay);
            metrics::duplicate_events().increment(1);
            return DispatchOutcome::Duplicate;
        }

        if self.sampler.should_validate(relay) {
            let candidate = event.clone();
            let checked = tokio::task::spawn_blocking(move || candidate.verify().is_ok()).await;
            let Some(valid) = self.record_signature_check(relay, checked) else {
                return DispatchOutcome::Rejected;
            };
            if !valid {
                warn!(
                    "[{}] Invalid signature on event {} from {}",
                    subscription_id, event.id, relay
                );
                metrics::invalid_events().increment(1);
                return DispatchOutcome::Rejected;
            }
        } else {
            metrics::signature_checks_skipped().increment(1);
        }

        // Another relay may have won while the signature was being checked
        if !self.dedup.insert(key) {
            metrics::duplicate_events().increment(1);
            return DispatchOutcome::Duplicate;
        }
        metrics::events_received().increment(1);

        let event = Arc::new(event);
        self.persist(&event);
        self.global.publish(RelayEvent {
            event: event.clone(),
            relay: relay.clone(),
        });

        let mut recipients = 0;
        if self.grouper.is_group(subscription_id) {
            recipients += self.grouper.dispatch_to_group(&event, relay, subscription_id);
        }
        recipients += self.dispatch_to_individuals(&event);

        trace!(
            "[{}] Event {} from {} delivered to {} subscription(s)",
            subscription_id,
            event.id,
            relay,
            recipients
        );
        DispatchOutcome::Delivered { recipients }
    }

    /// Feeds a finished signature check into the relay's trust statistics.
    /// A check that never ran says nothing about the relay, so it is not
    /// recorded and yields `None`.
    fn record_signature_check(
        &self,
        relay: &RelayUrl,
        checked: Result<bool, JoinError>,
    ) -> Option<bool> {
        match checked {
            Ok(valid) => {
                self.sampler.record_validation(relay, valid);
                Some(valid)
            }
            Err(e) => {
                error!("[{}] Signature check task failed: {}", relay, e);
                None
            }
        }
    }

    /// Scans every subscription that is not served by a group. Stopped ones
    /// are dropped from the table on the way.
    ///
    /// Subscriptions still waiting in the grouping window are included. Once
    /// their group forms, a relay's copy of an event seen here is dropped as a
    /// duplicate, so this is their only chance to receive it.
    fn dispatch_to_individuals(&self, event: &Arc<Event>) -> usize {
        let mut candidates = Vec::new();
        let mut stale = Vec::new();
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if subscription.is_stopped() {
                stale.push(entry.key().clone());
            } else if !subscription.is_grouped() {
                candidates.push(subscription.clone());
            }
        }

        for subscription_id in stale {
            if self
                .subscriptions
                .remove_if(&subscription_id, |_, subscription| subscription.is_stopped())
                .is_some()
            {
                metrics::active_subscriptions().decrement(1.0);
            }
        }

        candidates
            .into_iter()
            .filter(|subscription| subscription.matches(event) && subscription.emit(event.clone()))
            .count()
    }

    /// Stores `event` in the background. Without a runtime to run on, the
    /// write is skipped.
    fn persist(&self, event: &Arc<Event>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!("No runtime available, event {} not stored", event.id);
            return;
        };
        let event = event.clone();
        let span = tracing::debug_span!("persist_event", event_id = %event.id);
        runtime.spawn(
            async move {
                if let Err(e) = cache.store(&event).await {
                    error!("Failed to store event {}: {}", event.id, e);
                }
            }
            .instrument(span),
        );
    }

    /// Forwards EOSE to the named group's members or to the named subscription.
    pub fn dispatch_eose(&self, relay: &RelayUrl, subscription_id: &SubscriptionId) {
        if self.grouper.dispatch_eose_to_group(relay, subscription_id) {
            return;
        }
        match self.get_subscription(subscription_id) {
            Some(subscription) => subscription.mark_eose(relay),
            None => trace!("[{}] EOSE from {} for unknown subscription", subscription_id, relay),
        }
    }

    /// Feeds one parsed relay message into the engine. Returns the dispatch
    /// outcome for events.
    pub async fn handle_relay_message(
        &self,
        relay: &RelayUrl,
        message: RelayMessage,
    ) -> Option<DispatchOutcome> {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => Some(self.dispatch_event(*event, relay, &subscription_id).await),
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                self.dispatch_eose(relay, &subscription_id);
                None
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!("[{}] Closed by {}: {}", subscription_id, relay, message);
                self.dispatch_eose(relay, &subscription_id);
                None
            }
            RelayMessage::Notice(notice) => {
                info!("[{}] NOTICE: {}", relay, notice);
                None
            }
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => {
                debug!("[{}] OK {} {} {}", relay, event_id, status, message);
                None
            }
            RelayMessage::Auth { challenge } => {
                debug!("[{}] AUTH challenge {}", relay, challenge);
                None
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                debug!("[{}] COUNT {} for {}", relay, count, subscription_id);
                None
            }
        }
    }

    /// Stops a subscription and detaches it from any group. Returns false if
    /// the id is not registered.
    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(subscription_id) else {
            return false;
        };
        subscription.stop();
        self.grouper.remove(subscription_id);
        metrics::active_subscriptions().decrement(1.0);
        debug!("[{}] Unsubscribed", subscription_id);
        true
    }

    /// Returns the first event matching `filters`, or `None` once every relay
    /// has sent EOSE without one. Cached matches short-circuit relay traffic.
    pub async fn fetch_event(
        &self,
        filters: Vec<Filter>,
        relays: Vec<SharedRelay>,
    ) -> Result<Option<Arc<Event>>, Error> {
        let options = SubscriptionOptions {
            close_on_eose: true,
            use_cache: true,
        };
        let subscription = self.subscribe_with(filters, options)?;
        let result = subscription.begin_fetch();

        self.load_from_cache(&subscription).await;
        if relays.is_empty() {
            subscription.stop();
        } else {
            subscription.start(relays);
        }

        let event = tokio::select! {
            event = result => event.unwrap_or(None),
            _ = self.token.cancelled() => None,
        };
        self.unsubscribe(subscription.id());
        Ok(event)
    }

    /// Sends `event` to every relay. Relay echoes of it are treated as
    /// duplicates. Fails only if no relay accepted the request.
    pub fn publish(&self, event: Event, relays: &[SharedRelay]) -> Result<(), Error> {
        let event = Arc::new(event);
        if self.dedup.insert(event.dedup_key()) {
            self.persist(&event);
        } else {
            debug!("Publishing already seen event {}", event.id);
        }

        let mut failures = 0;
        for relay in relays {
            if let Err(e) = relay.publish(&event) {
                warn!("[{}] Publish of {} failed: {}", relay.url(), event.id, e);
                failures += 1;
            }
        }
        if !relays.is_empty() && failures == relays.len() {
            return Err(Error::relay(format!(
                "event {} was rejected by every relay",
                event.id
            )));
        }
        Ok(())
    }

    pub fn global_events(&self) -> StreamReceiver<RelayEvent> {
        self.global.subscribe()
    }

    /// Cancels the grouping window and stops every subscription.
    pub fn shutdown(&self) {
        info!("Shutting down subscription manager");
        self.token.cancel();
        self.grouper.shutdown();

        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.subscriptions.clear();
        for subscription in &subscriptions {
            subscription.stop();
        }
        metrics::active_subscriptions().decrement(subscriptions.len() as f64);
        self.global.close();
    }
}
