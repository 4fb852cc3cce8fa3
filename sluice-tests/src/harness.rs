//! Simulated-time driver for scheduler scenarios.
//!
//! [`SchedSim`] owns one fair group and one shard's fair queue, advances a
//! virtual clock, and mirrors every operation into an
//! [`InvariantChecker`](crate::properties::InvariantChecker) so scenarios
//! can assert the accounting invariants after any step.

use std::collections::HashMap;
use std::sync::Arc;

use sluice_flow::{
    Capacity, ClassId, EntryId, FairGroup, FairGroupConfig, FairQueue, FairQueueConfig,
    FairQueueEntry, Ticket, RATE_RESOLUTION_US,
};

use crate::properties::{InvariantChecker, PropertyViolation};

/// Payload threaded through the queue so dispatch records carry their class
/// and identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimPayload {
    /// Class the entry was queued under.
    pub class_id: ClassId,
    /// Scenario-chosen unique sequence number.
    pub seq: u64,
}

/// One dispatched entry as observed by the sink.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRecord {
    /// Class the entry was queued under.
    pub class_id: ClassId,
    /// Scenario-chosen sequence number.
    pub seq: u64,
    /// Ticket at dispatch time; zero for cancelled entries.
    pub ticket: Ticket,
    /// True if the entry was cancelled before dispatch reached it.
    pub cancelled: bool,
    /// Virtual time of the dispatch in microseconds.
    pub time_us: u64,
}

/// Virtual-clock driver owning one fair group and one shard's fair queue.
pub struct SchedSim {
    group: Arc<FairGroup>,
    queue: FairQueue<SimPayload>,
    checker: InvariantChecker,
    /// Entry handles of still-queued entries, keyed by sequence number.
    live: HashMap<u64, EntryId>,
    records: Vec<DispatchRecord>,
    /// Tickets dispatched but not yet completed.
    in_flight: Vec<Ticket>,
    now_us: u64,
}

impl SchedSim {
    /// Creates a simulation with a fresh group at virtual time zero.
    #[must_use]
    pub fn new(group_config: &FairGroupConfig, queue_config: FairQueueConfig) -> Self {
        Self::with_group(Arc::new(FairGroup::new(group_config, 0)), queue_config)
    }

    /// Creates a simulation for one shard of an existing, possibly shared,
    /// group.
    #[must_use]
    pub fn with_group(group: Arc<FairGroup>, queue_config: FairQueueConfig) -> Self {
        let queue = FairQueue::new(Arc::clone(&group), queue_config);
        Self {
            group,
            queue,
            checker: InvariantChecker::new(),
            live: HashMap::new(),
            records: Vec::new(),
            in_flight: Vec::new(),
            now_us: 0,
        }
    }

    /// The group this shard draws on.
    #[must_use]
    pub const fn group(&self) -> &Arc<FairGroup> {
        &self.group
    }

    /// The shard's queue.
    #[must_use]
    pub const fn queue(&self) -> &FairQueue<SimPayload> {
        &self.queue
    }

    /// Current virtual time in microseconds.
    #[must_use]
    pub const fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Registers a priority class.
    ///
    /// # Panics
    ///
    /// Panics on registration errors; scenarios register classes up front.
    pub fn register_class(&mut self, id: ClassId, shares: u32) {
        self.queue
            .register_priority_class(id, shares)
            .expect("register class");
    }

    /// Replaces a class's share weight.
    ///
    /// # Panics
    ///
    /// Panics if the class is unknown.
    pub fn update_shares(&mut self, id: ClassId, shares: u32) {
        self.queue
            .update_shares_for_class(id, shares)
            .expect("update shares");
    }

    /// Enqueues an entry under a scenario-unique sequence number.
    ///
    /// # Panics
    ///
    /// Panics if the class is unknown.
    pub fn offer(&mut self, class_id: ClassId, seq: u64, ticket: Ticket) {
        let entry = FairQueueEntry::new(ticket, SimPayload { class_id, seq });
        let id = self.queue.queue(class_id, entry).expect("queue entry");
        self.live.insert(seq, id);
        self.checker.on_queue(class_id, seq, ticket);
    }

    /// Cancels the entry queued under `seq`; a no-op if it has already been
    /// dispatched.
    pub fn cancel(&mut self, seq: u64) {
        if let Some(&id) = self.live.get(&seq) {
            self.queue.notify_request_cancelled(id);
            self.checker.on_cancel(seq);
        }
    }

    /// Advances the clock by whole ticks and replenishes the group.
    pub fn advance_ticks(&mut self, ticks: u64) {
        self.now_us += ticks * RATE_RESOLUTION_US;
        self.group.replenish_capacity(self.now_us);
    }

    /// Runs one dispatch pass, returning the records it produced.
    pub fn dispatch(&mut self) -> &[DispatchRecord] {
        let mut batch = Vec::new();
        self.queue.dispatch_requests(|entry| {
            batch.push((*entry.payload(), entry.ticket(), entry.is_cancelled()));
        });

        let start = self.records.len();
        for (payload, ticket, cancelled) in batch {
            self.live.remove(&payload.seq);
            let capacity = self.group.ticket_capacity(ticket);
            self.checker
                .on_dispatch(payload.class_id, payload.seq, ticket, capacity);
            self.in_flight.push(ticket);
            self.records.push(DispatchRecord {
                class_id: payload.class_id,
                seq: payload.seq,
                ticket,
                cancelled,
                time_us: self.now_us,
            });
        }
        &self.records[start..]
    }

    /// Completes every dispatched request, returning capacity to the group.
    pub fn complete_all(&mut self) {
        for ticket in std::mem::take(&mut self.in_flight) {
            self.queue.notify_request_finished(ticket);
            let capacity = self.group.ticket_capacity(ticket);
            self.checker.on_finish(ticket, capacity);
        }
    }

    /// All dispatch records so far.
    #[must_use]
    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    /// Entries of `class_id` served so far, cancelled ones excluded.
    #[must_use]
    pub fn served(&self, class_id: ClassId) -> usize {
        self.records
            .iter()
            .filter(|r| r.class_id == class_id && !r.cancelled)
            .count()
    }

    /// Total fixed-point capacity of all dispatched records.
    #[must_use]
    pub fn dispatched_capacity(&self) -> Capacity {
        self.records
            .iter()
            .map(|r| self.group.ticket_capacity(r.ticket))
            .sum()
    }

    /// Checks every accounting invariant against the live queue and group.
    ///
    /// Not meaningful while several simulations share one group; the rover
    /// expectations assume this shard is the group's only tenant.
    #[must_use]
    pub fn verify(&self) -> Vec<PropertyViolation> {
        let queue_stats = self.queue.stats();
        let pending_capacity = queue_stats
            .pending_reservation
            .map_or(0, |ticket| self.group.ticket_capacity(ticket));
        self.checker.check(
            &queue_stats,
            &self.group.stats(),
            pending_capacity,
            self.group.maximum_capacity(),
        )
    }
}
