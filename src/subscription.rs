use crate::dedup::DedupIndex;
use crate::filter::Filter;
use crate::grouping::Grouper;
use crate::relay::SharedRelay;
use crate::stream::{EventStream, OverflowPolicy, StreamReceiver};
use nostr::{Event, RelayUrl, SubscriptionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

const FILTER_LIST_SEPARATOR: &str = ";";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Stop once every attached relay has sent EOSE.
    pub close_on_eose: bool,
    /// Deliver matching cached events before any relay traffic.
    pub use_cache: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            close_on_eose: false,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Waiting,
    EventFound,
    AllEosedNoEvent,
}

#[derive(Debug, Clone)]
pub(crate) struct GroupLink {
    pub(crate) grouper: Weak<Grouper>,
    pub(crate) group_id: SubscriptionId,
}

#[derive(Debug)]
struct Fetch {
    state: FetchState,
    responder: Option<oneshot::Sender<Option<Arc<Event>>>>,
}

#[derive(Debug, Default)]
struct State {
    relays: HashMap<RelayUrl, SharedRelay>,
    eosed: HashMap<RelayUrl, bool>,
    stopped: bool,
    emitted: u64,
    group: Option<GroupLink>,
    fetch: Option<Fetch>,
}

impl State {
    fn all_relays_eosed(&self) -> bool {
        !self.eosed.is_empty() && self.eosed.values().all(|eosed| *eosed)
    }

    /// Moves a waiting fetch to `next`, handing `result` to the caller.
    /// Returns true if the fetch was waiting.
    fn resolve_fetch(&mut self, next: FetchState, result: Option<Arc<Event>>) -> bool {
        let Some(fetch) = self.fetch.as_mut() else {
            return false;
        };
        if fetch.state != FetchState::Waiting {
            return false;
        }
        fetch.state = next;
        if let Some(responder) = fetch.responder.take() {
            let _ = responder.send(result);
        }
        true
    }
}

/// One consumer's live view over the relays it is attached to.
///
/// Filters are fixed at creation. Relays can be attached at any time until the
/// subscription is stopped, after which nothing is delivered.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filters: Vec<Filter>,
    options: SubscriptionOptions,
    events: EventStream<Arc<Event>>,
    seen: DedupIndex,
    cache_delivered: AtomicBool,
    eose: watch::Sender<bool>,
    state: Mutex<State>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        buffer: usize,
    ) -> Self {
        let (eose, _) = watch::channel(false);
        Self {
            id,
            filters,
            options,
            events: EventStream::new(buffer, OverflowPolicy::DropOldest),
            seen: DedupIndex::new(buffer),
            cache_delivered: AtomicBool::new(false),
            eose,
            state: Mutex::new(State::default()),
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn options(&self) -> SubscriptionOptions {
        self.options
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }

    /// Order-independent key over every filter's fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut fingerprints: Vec<String> = self.filters.iter().map(Filter::fingerprint).collect();
        fingerprints.sort();
        fingerprints.join(FILTER_LIST_SEPARATOR)
    }

    /// Filters ordered by fingerprint, so equivalent subscriptions line up
    /// position by position.
    pub(crate) fn sorted_filters(&self) -> Vec<Filter> {
        let mut filters = self.filters.clone();
        filters.sort_by_cached_key(Filter::fingerprint);
        filters
    }

    /// Sorted filters with bounds cleared. Group members must agree on this.
    pub(crate) fn selection(&self) -> Vec<Filter> {
        self.sorted_filters().iter().map(Filter::selection).collect()
    }

    pub fn events(&self) -> StreamReceiver<Arc<Event>> {
        self.events.subscribe()
    }

    /// Events still held in the replay buffer.
    pub fn buffered(&self) -> Vec<Arc<Event>> {
        self.events.buffered()
    }

    pub fn relays(&self) -> Vec<RelayUrl> {
        self.state.lock().relays.keys().cloned().collect()
    }

    pub fn eose_received(&self, relay: &RelayUrl) -> bool {
        self.state.lock().eosed.get(relay).copied().unwrap_or(false)
    }

    pub fn all_relays_eosed(&self) -> bool {
        self.state.lock().all_relays_eosed()
    }

    pub fn cache_delivered(&self) -> bool {
        self.cache_delivered.load(Ordering::Acquire)
    }

    pub(crate) fn set_cache_delivered(&self) {
        self.cache_delivered.store(true, Ordering::Release);
    }

    pub fn emitted(&self) -> u64 {
        self.state.lock().emitted
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_grouped(&self) -> bool {
        self.state.lock().group.is_some()
    }

    pub fn group_id(&self) -> Option<SubscriptionId> {
        self.state
            .lock()
            .group
            .as_ref()
            .map(|link| link.group_id.clone())
    }

    pub fn fetch_state(&self) -> Option<FetchState> {
        self.state.lock().fetch.as_ref().map(|fetch| fetch.state)
    }

    /// Resolves once every attached relay has sent EOSE, or the subscription
    /// stops.
    pub async fn wait_for_eose(&self) {
        let mut receiver = self.eose.subscribe();
        let _ = receiver.wait_for(|complete| *complete).await;
    }

    pub fn start(&self, relays: Vec<SharedRelay>) {
        debug!("[{}] Starting on {} relay(s)", self.id, relays.len());
        self.add_relays(relays);
    }

    /// Attaches relays that are not attached yet. New relays get a subscribe
    /// call, or are handed to the shared group when this subscription is grouped.
    pub fn add_relays(&self, relays: Vec<SharedRelay>) {
        let (added, group) = {
            let mut state = self.state.lock();
            if state.stopped {
                trace!("[{}] Ignoring relays for stopped subscription", self.id);
                return;
            }
            let mut added = Vec::new();
            for relay in relays {
                let url = relay.url().clone();
                if state.relays.contains_key(&url) {
                    continue;
                }
                state.eosed.insert(url.clone(), false);
                state.relays.insert(url, relay.clone());
                added.push(relay);
            }
            (added, state.group.clone())
        };

        if added.is_empty() {
            return;
        }
        self.eose.send_replace(false);

        match group {
            Some(link) => {
                if let Some(grouper) = link.grouper.upgrade() {
                    grouper.attach_relays(&link.group_id, added);
                }
            }
            None => {
                for relay in added {
                    if let Err(e) = relay.subscribe(&self.id, &self.filters) {
                        warn!("[{}] Subscribe failed: {}", self.id, e);
                    }
                }
            }
        }
    }

    /// Records relays served by a shared group without issuing any request.
    /// Returns false if the subscription was stopped in the meantime.
    pub(crate) fn join_group(&self, link: GroupLink, relays: &[SharedRelay]) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        debug!("[{}] Joining group {}", self.id, link.group_id);
        for relay in relays {
            let url = relay.url().clone();
            state.eosed.entry(url.clone()).or_insert(false);
            state.relays.entry(url).or_insert_with(|| relay.clone());
        }
        state.group = Some(link);
        true
    }

    /// Delivers `event` to consumers. Returns false if the subscription is
    /// stopped or already delivered this event.
    pub fn emit(&self, event: Arc<Event>) -> bool {
        let finished_fetch = {
            let mut state = self.state.lock();
            if state.stopped || !self.seen.insert(event.id.to_hex()) {
                return false;
            }
            self.events.publish(event.clone());
            state.emitted += 1;
            state.resolve_fetch(FetchState::EventFound, Some(event))
        };

        if finished_fetch {
            self.stop();
        }
        true
    }

    /// Marks `relay` complete. EOSE from relays that are not attached is ignored.
    pub fn mark_eose(&self, relay: &RelayUrl) {
        let stop = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            match state.eosed.get_mut(relay) {
                Some(eosed) => *eosed = true,
                None => {
                    trace!("[{}] EOSE from unattached relay {}", self.id, relay);
                    return;
                }
            }
            if !state.all_relays_eosed() {
                return;
            }
            let fetch_done = state.resolve_fetch(FetchState::AllEosedNoEvent, None);
            fetch_done || self.options.close_on_eose
        };

        debug!("[{}] All relays sent EOSE", self.id);
        self.eose.send_replace(true);
        if stop {
            self.stop();
        }
    }

    pub(crate) fn begin_fetch(&self) -> oneshot::Receiver<Option<Arc<Event>>> {
        let (responder, receiver) = oneshot::channel();
        self.state.lock().fetch = Some(Fetch {
            state: FetchState::Waiting,
            responder: Some(responder),
        });
        receiver
    }

    /// Detaches every relay and ends the output stream. Idempotent.
    pub fn stop(&self) {
        let (relays, group) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            if let Some(responder) = state
                .fetch
                .as_mut()
                .and_then(|fetch| fetch.responder.take())
            {
                let _ = responder.send(None);
            }
            state.eosed.clear();
            let relays: Vec<SharedRelay> = state.relays.drain().map(|(_, relay)| relay).collect();
            (relays, state.group.take())
        };

        debug!("[{}] Stopping", self.id);
        self.events.close();
        self.eose.send_replace(true);

        match group {
            Some(link) => {
                if let Some(grouper) = link.grouper.upgrade() {
                    grouper.remove(&self.id);
                }
            }
            None => {
                for relay in relays {
                    if let Err(e) = relay.unsubscribe(&self.id) {
                        warn!("[{}] Unsubscribe failed: {}", self.id, e);
                    }
                }
            }
        }
    }
}
