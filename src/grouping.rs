//! Batches subscriptions with equivalent filters into one relay-level
//! subscription.
//!
//! New subscriptions wait in a pending queue for a short window. When the
//! window closes, subscriptions sharing a fingerprint are merged into a group
//! whose filters carry the widest bounds of all members. Relays only ever see
//! the group id; each member re-applies its own filters on delivery.

use crate::filter::Filter;
use crate::metrics;
use crate::relay::SharedRelay;
use crate::subscription::{GroupLink, Subscription};
use crate::timer::Timer;
use nostr::{Event, RelayUrl, SubscriptionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

struct PendingEntry {
    subscription: Arc<Subscription>,
    relays: Vec<SharedRelay>,
}

#[derive(Default)]
struct Pending {
    entries: Vec<PendingEntry>,
    scheduled: bool,
}

#[derive(Debug)]
struct GroupedSubscription {
    fingerprint: String,
    filters: Vec<Filter>,
    relays: HashMap<RelayUrl, SharedRelay>,
    eosed: HashSet<RelayUrl>,
    members: HashMap<SubscriptionId, Arc<Subscription>>,
}

#[derive(Debug, Default)]
struct GroupTable {
    groups: HashMap<SubscriptionId, GroupedSubscription>,
    by_fingerprint: HashMap<String, SubscriptionId>,
    by_member: HashMap<SubscriptionId, SubscriptionId>,
}

/// Work decided under the table lock and carried out after releasing it.
struct JoinPlan {
    group_id: SubscriptionId,
    filters: Vec<Filter>,
    joiners: Vec<Arc<Subscription>>,
    existing_members: Vec<Arc<Subscription>>,
    eosed: Vec<RelayUrl>,
    request: Vec<SharedRelay>,
}

pub struct Grouper {
    delay: Duration,
    timer: Arc<dyn Timer>,
    this: Weak<Grouper>,
    pending: Mutex<Pending>,
    table: Mutex<GroupTable>,
    next_group: AtomicU64,
}

impl std::fmt::Debug for Grouper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grouper")
            .field("delay", &self.delay)
            .field("pending", &self.pending.lock().entries.len())
            .field("groups", &self.table.lock().groups.len())
            .finish()
    }
}

impl Grouper {
    pub fn new(delay: Duration, timer: Arc<dyn Timer>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            delay,
            timer,
            this: this.clone(),
            pending: Mutex::new(Pending::default()),
            table: Mutex::new(GroupTable::default()),
            next_group: AtomicU64::new(1),
        })
    }

    /// Queues `subscription` for the current window, opening one if needed.
    pub fn enqueue(&self, subscription: Arc<Subscription>, relays: Vec<SharedRelay>) {
        debug!(
            "[{}] Queued for grouping on {} relay(s)",
            subscription.id(),
            relays.len()
        );
        let open_window = {
            let mut pending = self.pending.lock();
            pending.entries.push(PendingEntry {
                subscription,
                relays,
            });
            !std::mem::replace(&mut pending.scheduled, true)
        };

        if open_window {
            let this = self.this.clone();
            self.timer.schedule(
                self.delay,
                Box::new(move || {
                    if let Some(grouper) = this.upgrade() {
                        grouper.process_pending();
                    }
                }),
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Closes the current window and starts or merges everything queued in it.
    pub fn process_pending(&self) {
        let entries = {
            let mut pending = self.pending.lock();
            pending.scheduled = false;
            std::mem::take(&mut pending.entries)
        };

        let mut batches: BTreeMap<String, Vec<PendingEntry>> = BTreeMap::new();
        for entry in entries {
            if entry.subscription.is_stopped() {
                trace!("[{}] Dropping stopped subscription", entry.subscription.id());
                continue;
            }
            batches
                .entry(entry.subscription.fingerprint())
                .or_default()
                .push(entry);
        }

        for (fingerprint, batch) in batches {
            self.process_batch(fingerprint, batch);
        }
    }

    fn process_batch(&self, fingerprint: String, batch: Vec<PendingEntry>) {
        let (plan, direct) = {
            let mut table = self.table.lock();
            let existing = table
                .by_fingerprint
                .get(&fingerprint)
                .and_then(|group_id| table.groups.get(group_id))
                .map(|group| group.filters.iter().map(Filter::selection).collect::<Vec<_>>());
            let grouped = existing.is_some();
            let reference = existing
                .or_else(|| batch.first().map(|entry| entry.subscription.selection()))
                .unwrap_or_default();

            let (compatible, mut direct): (Vec<_>, Vec<_>) = batch
                .into_iter()
                .partition(|entry| entry.subscription.selection() == reference);
            for entry in &direct {
                debug!(
                    "[{}] Filters differ from others keyed {:?}, starting directly",
                    entry.subscription.id(),
                    fingerprint
                );
            }

            if grouped || compatible.len() > 1 {
                (self.plan_join(&mut table, fingerprint, compatible), direct)
            } else {
                direct.extend(compatible);
                (None, direct)
            }
        };

        for entry in direct {
            entry.subscription.start(entry.relays);
        }
        if let Some(plan) = plan {
            self.execute(plan);
        }
    }

    /// Attaches `joiners` to the group for `fingerprint`, creating it if
    /// needed. Joiners are linked to the group before the table lock is
    /// released, so relay traffic for the group always finds them attached.
    fn plan_join(
        &self,
        table: &mut GroupTable,
        fingerprint: String,
        joiners: Vec<PendingEntry>,
    ) -> Option<JoinPlan> {
        let GroupTable {
            groups,
            by_fingerprint,
            by_member,
        } = table;

        let existing = by_fingerprint.get(&fingerprint).cloned();
        let created = existing.is_none();
        let group_id = existing.unwrap_or_else(|| {
            SubscriptionId::new(format!(
                "group-{}",
                self.next_group.fetch_add(1, Ordering::Relaxed)
            ))
        });

        let joiners: Vec<PendingEntry> = joiners
            .into_iter()
            .filter(|entry| {
                let link = GroupLink {
                    grouper: self.this.clone(),
                    group_id: group_id.clone(),
                };
                entry.subscription.join_group(link, &entry.relays)
            })
            .collect();
        let first = joiners.first()?;

        if created {
            debug!("[{}] Created group for fingerprint {:?}", group_id, fingerprint);
            groups.insert(
                group_id.clone(),
                GroupedSubscription {
                    fingerprint: fingerprint.clone(),
                    filters: first.subscription.sorted_filters(),
                    relays: HashMap::new(),
                    eosed: HashSet::new(),
                    members: HashMap::new(),
                },
            );
            by_fingerprint.insert(fingerprint, group_id.clone());
            metrics::active_groups().increment(1.0);
        }
        let group = groups.get_mut(&group_id)?;
        let existing_members: Vec<Arc<Subscription>> = group.members.values().cloned().collect();

        let mut widened = false;
        let mut new_relays = Vec::new();
        for entry in &joiners {
            let subscription = &entry.subscription;
            for (merged, filter) in group
                .filters
                .iter_mut()
                .zip(subscription.sorted_filters().iter())
            {
                let before = merged.clone();
                merged.widen_bounds(filter);
                widened |= *merged != before;
            }
            group
                .members
                .insert(subscription.id().clone(), subscription.clone());
            by_member.insert(subscription.id().clone(), group_id.clone());

            for relay in &entry.relays {
                if !group.relays.contains_key(relay.url()) {
                    group.relays.insert(relay.url().clone(), relay.clone());
                    new_relays.push(relay.clone());
                }
            }
        }

        let request = if widened && !created {
            debug!("[{}] Filters widened, re-requesting on every relay", group_id);
            group.eosed.clear();
            group.relays.values().cloned().collect()
        } else {
            new_relays
        };
        debug!(
            "[{}] {} member(s) after merging {} new",
            group_id,
            group.members.len(),
            joiners.len()
        );
        Some(JoinPlan {
            group_id,
            filters: group.filters.clone(),
            eosed: group.eosed.iter().cloned().collect(),
            existing_members,
            joiners: joiners.into_iter().map(|entry| entry.subscription).collect(),
            request,
        })
    }

    fn execute(&self, plan: JoinPlan) {
        for subscription in &plan.joiners {
            // Stored events already delivered to the group will not come back
            for member in &plan.existing_members {
                for event in member.buffered() {
                    if subscription.matches(&event) {
                        subscription.emit(event);
                    }
                }
            }
            for relay in &plan.eosed {
                subscription.mark_eose(relay);
            }
        }

        for relay in &plan.request {
            if let Err(e) = relay.subscribe(&plan.group_id, &plan.filters) {
                warn!("[{}] Subscribe failed: {}", plan.group_id, e);
            }
        }
    }

    /// Adds relays to a group on behalf of one of its members.
    pub(crate) fn attach_relays(&self, group_id: &SubscriptionId, relays: Vec<SharedRelay>) {
        let (filters, added) = {
            let mut table = self.table.lock();
            let Some(group) = table.groups.get_mut(group_id) else {
                return;
            };
            let mut added = Vec::new();
            for relay in relays {
                if !group.relays.contains_key(relay.url()) {
                    group.relays.insert(relay.url().clone(), relay.clone());
                    added.push(relay);
                }
            }
            (group.filters.clone(), added)
        };

        for relay in added {
            if let Err(e) = relay.subscribe(group_id, &filters) {
                warn!("[{}] Subscribe failed: {}", group_id, e);
            }
        }
    }

    /// Detaches a member, pending or grouped. Tears the group down when its
    /// last member leaves.
    pub fn remove(&self, subscription_id: &SubscriptionId) {
        self.pending
            .lock()
            .entries
            .retain(|entry| entry.subscription.id() != subscription_id);

        let (group_id, emptied) = {
            let mut table = self.table.lock();
            let Some(group_id) = table.by_member.remove(subscription_id) else {
                return;
            };
            let Some(group) = table.groups.get_mut(&group_id) else {
                return;
            };
            group.members.remove(subscription_id);
            if !group.members.is_empty() {
                return;
            }
            let emptied = table.groups.remove(&group_id);
            if let Some(group) = &emptied {
                table.by_fingerprint.remove(&group.fingerprint);
                metrics::active_groups().decrement(1.0);
            }
            (group_id, emptied)
        };

        if let Some(group) = emptied {
            debug!("[{}] Last member left, closing", group_id);
            for relay in group.relays.values() {
                if let Err(e) = relay.unsubscribe(&group_id) {
                    warn!("[{}] Unsubscribe failed: {}", group_id, e);
                }
            }
        }
    }

    pub fn is_group(&self, subscription_id: &SubscriptionId) -> bool {
        self.table.lock().groups.contains_key(subscription_id)
    }

    pub fn group_count(&self) -> usize {
        self.table.lock().groups.len()
    }

    pub fn group_of(&self, member_id: &SubscriptionId) -> Option<SubscriptionId> {
        self.table.lock().by_member.get(member_id).cloned()
    }

    pub fn group_filters(&self, group_id: &SubscriptionId) -> Option<Vec<Filter>> {
        self.table
            .lock()
            .groups
            .get(group_id)
            .map(|group| group.filters.clone())
    }

    fn members(&self, group_id: &SubscriptionId) -> Vec<Arc<Subscription>> {
        self.table
            .lock()
            .groups
            .get(group_id)
            .map(|group| group.members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers an event received on a group id to every member whose own
    /// filters match. Returns how many members took it.
    pub fn dispatch_to_group(
        &self,
        event: &Arc<Event>,
        relay: &RelayUrl,
        group_id: &SubscriptionId,
    ) -> usize {
        let delivered = self
            .members(group_id)
            .into_iter()
            .filter(|member| member.matches(event) && member.emit(event.clone()))
            .count();
        trace!(
            "[{}] Event {} from {} reached {} member(s)",
            group_id,
            event.id,
            relay,
            delivered
        );
        delivered
    }

    /// Forwards EOSE to every member. Returns false if `group_id` is unknown.
    pub fn dispatch_eose_to_group(&self, relay: &RelayUrl, group_id: &SubscriptionId) -> bool {
        let members = {
            let mut table = self.table.lock();
            let Some(group) = table.groups.get_mut(group_id) else {
                return false;
            };
            group.eosed.insert(relay.clone());
            group.members.values().cloned().collect::<Vec<_>>()
        };

        for member in members {
            member.mark_eose(relay);
        }
        true
    }

    /// Cancels the open window and forgets pending subscriptions.
    pub fn shutdown(&self) {
        self.timer.shutdown();
        let mut pending = self.pending.lock();
        pending.entries.clear();
        pending.scheduled = false;
    }
}
