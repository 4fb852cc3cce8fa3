//! Per-shard fair dispatch across priority classes.
//!
//! A [`FairQueue`] belongs to exactly one shard and schedules that shard's
//! requests against the budget of a shared [`FairGroup`]. Each registered
//! priority class carries a virtual-time cursor; the class furthest behind
//! its fair share (smallest cursor) is served first, and serving a request
//! advances the cursor by the request's normalized cost divided by the
//! class's shares. More shares therefore mean a slower cursor and more
//! frequent service.
//!
//! Producers enqueue entries under a class id, a periodic driver calls
//! [`FairQueue::dispatch_requests`], and completions are reported back with
//! [`FairQueue::notify_request_finished`], which returns capacity to the
//! group.

use std::cmp;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::group::{Capacity, FairGroup, RATE_RESOLUTION_US};
use crate::ticket::Ticket;

/// Identifier of a priority class within one queue.
pub type ClassId = u32;

/// Stable handle to an entry while it waits in a queue.
///
/// Handles are never reused, so cancelling an entry that has already been
/// dispatched is a harmless no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// A queued request: its cost ticket plus a caller payload.
///
/// The queue holds the entry from [`FairQueue::queue`] until dispatch hands
/// it back to the caller through the sink.
#[derive(Debug)]
pub struct FairQueueEntry<T> {
    ticket: Ticket,
    payload: T,
}

impl<T> FairQueueEntry<T> {
    /// Creates an entry from a cost ticket and a payload.
    #[must_use]
    pub const fn new(ticket: Ticket, payload: T) -> Self {
        Self { ticket, payload }
    }

    /// The entry's cost ticket. Zeroed by cancellation.
    #[must_use]
    pub const fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// True once the entry has been cancelled; the sink should drop it.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.ticket.is_zero()
    }

    /// Borrows the payload.
    #[must_use]
    pub const fn payload(&self) -> &T {
        &self.payload
    }

    /// Mutably borrows the payload.
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    /// Consumes the entry, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Configuration for a [`FairQueue`].
#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    /// Fairness window in microseconds. Bounds how much missed service a
    /// class returning from idle may claim at once.
    pub tau_us: u64,

    /// Bound on the class-id space; ids at or beyond this fail to register.
    pub max_priority_classes: u32,
}

impl FairQueueConfig {
    /// Creates a configuration with the given fairness window.
    #[must_use]
    pub const fn new(tau_us: u64) -> Self {
        Self {
            tau_us,
            max_priority_classes: 1024,
        }
    }

    /// Sets the bound on the class-id space.
    #[must_use]
    pub const fn with_max_priority_classes(mut self, max: u32) -> Self {
        self.max_priority_classes = max;
        self
    }

    /// Creates a configuration for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            tau_us: 5_000,
            max_priority_classes: 64,
        }
    }
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self::new(5_000)
    }
}

/// Read-only snapshot of a queue's accounting counters.
#[derive(Debug, Clone, Copy)]
pub struct FairQueueStats {
    /// Requests waiting in class queues.
    pub requests_queued: u64,
    /// Requests dispatched but not yet reported finished.
    pub requests_executing: u64,
    /// Componentwise sum of waiting tickets.
    pub resources_queued: Ticket,
    /// Componentwise sum of in-flight tickets.
    pub resources_executing: Ticket,
    /// Ticket of the capacity reservation currently riding the group's
    /// rover, if dispatch is paused on one.
    pub pending_reservation: Option<Ticket>,
}

/// A capacity slot taken from the group's tail rover but not yet granted by
/// the head rover.
#[derive(Debug, Clone, Copy)]
struct PendingReservation {
    head: Capacity,
    ticket: Ticket,
}

/// Per-class scheduling state.
#[derive(Debug)]
struct PriorityClassData {
    shares: u32,
    /// Virtual-time cursor; smallest across classes is served first.
    accumulated: f64,
    queue: VecDeque<EntryId>,
    /// True iff the class currently sits in the priority heap.
    queued: bool,
}

impl PriorityClassData {
    fn new(shares: u32) -> Self {
        Self {
            shares: shares.max(1),
            accumulated: 0.0,
            queue: VecDeque::new(),
            queued: false,
        }
    }

    fn update_shares(&mut self, shares: u32) {
        self.shares = shares.max(1);
    }
}

/// Heap key for a class: the cursor snapshot taken when it was pushed.
///
/// A class's cursor only changes while the class is out of the heap, except
/// across a runaway rebase, after which the heap is rebuilt, so snapshots
/// stay in step with the live cursors.
#[derive(Debug, Clone, Copy)]
struct ClassHandle {
    accumulated: f64,
    id: ClassId,
}

impl PartialEq for ClassHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for ClassHandle {}

impl PartialOrd for ClassHandle {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClassHandle {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // BinaryHeap is a max-heap; reverse both keys so the smallest
        // cursor surfaces first.
        other
            .accumulated
            .total_cmp(&self.accumulated)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Shard-local scheduler drawing on a shared [`FairGroup`] budget.
///
/// All methods take `&mut self`; a queue is owned by its shard and never
/// shared. Only the group handle crosses shards.
#[derive(Debug)]
pub struct FairQueue<T> {
    config: FairQueueConfig,
    group: Arc<FairGroup>,
    /// Sparse class table indexed by class id.
    priority_classes: Vec<Option<PriorityClassData>>,
    /// Min-heap of classes with waiting entries, keyed by cursor.
    handles: BinaryHeap<ClassHandle>,
    /// Largest cursor observed at dispatch; re-seats returning classes.
    last_accumulated: f64,
    pending: Option<PendingReservation>,
    entries: HashMap<EntryId, FairQueueEntry<T>>,
    next_entry_id: u64,
    resources_executing: Ticket,
    resources_queued: Ticket,
    requests_executing: u64,
    requests_queued: u64,
}

impl<T> FairQueue<T> {
    /// Creates a queue bound to `group`.
    #[must_use]
    pub fn new(group: Arc<FairGroup>, config: FairQueueConfig) -> Self {
        Self {
            config,
            group,
            priority_classes: Vec::new(),
            handles: BinaryHeap::new(),
            last_accumulated: 0.0,
            pending: None,
            entries: HashMap::new(),
            next_entry_id: 0,
            resources_executing: Ticket::default(),
            resources_queued: Ticket::default(),
            requests_executing: 0,
            requests_queued: 0,
        }
    }

    /// Creates a priority class under `id` with the given shares (clamped
    /// to at least 1).
    ///
    /// # Errors
    ///
    /// Fails if `id` is already registered or lies beyond the configured
    /// class-id bound.
    pub fn register_priority_class(&mut self, id: ClassId, shares: u32) -> FlowResult<()> {
        if id >= self.config.max_priority_classes {
            return Err(FlowError::TooManyClasses {
                class_id: id,
                max_classes: self.config.max_priority_classes,
            });
        }
        let index = id as usize;
        if index >= self.priority_classes.len() {
            self.priority_classes.resize_with(index + 1, || None);
        }
        if self.priority_classes[index].is_some() {
            return Err(FlowError::ClassAlreadyRegistered { class_id: id });
        }
        self.priority_classes[index] = Some(PriorityClassData::new(shares));
        debug!(class_id = id, shares, "registered priority class");
        Ok(())
    }

    /// Removes the class under `id`.
    ///
    /// # Errors
    ///
    /// Fails if the class is unknown or still has queued entries.
    pub fn unregister_priority_class(&mut self, id: ClassId) -> FlowResult<()> {
        let pc = self.class(id)?;
        if !pc.queue.is_empty() {
            return Err(FlowError::ClassNotEmpty {
                class_id: id,
                waiting: pc.queue.len() as u64,
            });
        }
        self.priority_classes[id as usize] = None;
        debug!(class_id = id, "unregistered priority class");
        Ok(())
    }

    /// Replaces the share weight of class `id` (clamped to at least 1).
    /// Takes effect on the next dispatch.
    ///
    /// # Errors
    ///
    /// Fails if the class is unknown.
    pub fn update_shares_for_class(&mut self, id: ClassId, shares: u32) -> FlowResult<()> {
        self.class_mut(id)?.update_shares(shares);
        Ok(())
    }

    /// Appends `entry` to class `id`, returning a handle usable for
    /// cancellation.
    ///
    /// A class returning from idle is re-seated no further than the
    /// fairness window `tau` behind the most recently served cursor, so it
    /// cannot monopolize dispatch with credit hoarded while idle.
    ///
    /// # Errors
    ///
    /// Fails if the class is unknown.
    pub fn queue(&mut self, id: ClassId, entry: FairQueueEntry<T>) -> FlowResult<EntryId> {
        let last_accumulated = self.last_accumulated;
        let deviation_unit = self
            .group
            .cost_capacity()
            .normalize(self.group.shares_capacity());
        let tau_ticks = self.config.tau_us as f64 / RATE_RESOLUTION_US as f64;
        let entry_id = EntryId(self.next_entry_id);
        let ticket = entry.ticket;

        let pc = self.class_mut(id)?;
        let mut revived = None;
        if !pc.queued {
            let max_deviation = deviation_unit / f64::from(pc.shares) * tau_ticks;
            pc.accumulated = pc.accumulated.max(last_accumulated - max_deviation);
            pc.queued = true;
            revived = Some(ClassHandle {
                accumulated: pc.accumulated,
                id,
            });
        }
        pc.queue.push_back(entry_id);

        if let Some(handle) = revived {
            self.handles.push(handle);
        }
        self.entries.insert(entry_id, entry);
        self.next_entry_id += 1;
        self.resources_queued += ticket;
        self.requests_queued += 1;
        Ok(entry_id)
    }

    /// Reports completion of a dispatched request, returning its capacity
    /// to the group as replenishment headroom.
    pub fn notify_request_finished(&mut self, ticket: Ticket) {
        debug_assert!(self.requests_executing > 0);
        self.resources_executing -= ticket;
        self.requests_executing -= 1;
        self.group.release_capacity(self.group.ticket_capacity(ticket));
    }

    /// Cancels a waiting entry.
    ///
    /// The entry keeps its slot in the class FIFO but its ticket is zeroed,
    /// so reaching it charges no capacity; the sink receives it flagged as
    /// cancelled and drops it. Unknown or already-dispatched handles are
    /// ignored.
    pub fn notify_request_cancelled(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.resources_queued -= entry.ticket;
            entry.ticket = Ticket::default();
        }
    }

    /// Dispatches eligible entries to `sink` until the heap drains, the
    /// group denies further capacity, or this shard's per-call capacity
    /// quota is spent.
    ///
    /// Entries are handed to the sink by value; ownership returns to the
    /// caller. The sink must not re-enter this queue.
    pub fn dispatch_requests<F>(&mut self, mut sink: F)
    where
        F: FnMut(FairQueueEntry<T>),
    {
        let quota = self.group.per_shard_capacity();
        let mut dispatched: Capacity = 0;

        while dispatched < quota {
            let Some(&top) = self.handles.peek() else {
                break;
            };
            let id = top.id;

            let pc = self.resident_class(id);
            let Some(&front) = pc.queue.front() else {
                pc.queued = false;
                self.handles.pop();
                continue;
            };
            let ticket = self
                .entries
                .get(&front)
                .expect("queued entry is present in the entry table")
                .ticket;

            if !self.grab_capacity(ticket) {
                break;
            }

            let pc = self.resident_class(id);
            let shares = pc.shares;
            let old_accumulated = pc.accumulated;
            pc.queued = false;
            pc.queue.pop_front();
            self.last_accumulated = self.last_accumulated.max(old_accumulated);
            self.handles.pop();

            let entry = self
                .entries
                .remove(&front)
                .expect("queued entry is present in the entry table");
            self.resources_executing += ticket;
            self.resources_queued -= ticket;
            self.requests_executing += 1;
            self.requests_queued -= 1;

            let req_cost = ticket.normalize(self.group.shares_capacity()) / f64::from(shares);
            let mut next_accumulated = old_accumulated + req_cost;
            if !next_accumulated.is_finite() {
                self.rebase_accumulators(old_accumulated);
                // The dispatching class was just rebased to zero.
                next_accumulated = req_cost;
            }

            let pc = self.resident_class(id);
            pc.accumulated = next_accumulated;
            if !pc.queue.is_empty() {
                pc.queued = true;
                self.handles.push(ClassHandle {
                    accumulated: next_accumulated,
                    id,
                });
            }

            dispatched += self.group.ticket_capacity(ticket);
            sink(entry);
        }
    }

    /// Number of requests waiting to be dispatched.
    #[must_use]
    pub const fn waiters(&self) -> u64 {
        self.requests_queued
    }

    /// Number of requests dispatched but not yet reported finished.
    #[must_use]
    pub const fn requests_currently_executing(&self) -> u64 {
        self.requests_executing
    }

    /// Componentwise sum of waiting tickets.
    #[must_use]
    pub const fn resources_currently_waiting(&self) -> Ticket {
        self.resources_queued
    }

    /// Componentwise sum of in-flight tickets.
    #[must_use]
    pub const fn resources_currently_executing(&self) -> Ticket {
        self.resources_executing
    }

    /// Snapshots the accounting counters.
    #[must_use]
    pub fn stats(&self) -> FairQueueStats {
        FairQueueStats {
            requests_queued: self.requests_queued,
            requests_executing: self.requests_executing,
            resources_queued: self.resources_queued,
            resources_executing: self.resources_executing,
            pending_reservation: self.pending.map(|p| p.ticket),
        }
    }

    /// Attempts to secure capacity for a request with the given ticket.
    ///
    /// On denial the reservation stays in the group's rover as `pending`;
    /// no further grabs happen until it matures.
    fn grab_capacity(&mut self, ticket: Ticket) -> bool {
        if self.pending.is_some() {
            return self.grab_pending_capacity(ticket);
        }

        let cap = self.group.ticket_capacity(ticket);
        let want_head = self.group.grab_capacity(cap).wrapping_add(cap);
        if self.group.capacity_deficiency(want_head) > 0 {
            self.pending = Some(PendingReservation {
                head: want_head,
                ticket,
            });
            return false;
        }
        true
    }

    /// Resolves a matured (or still immature) pending reservation against
    /// the request now at the front.
    fn grab_pending_capacity(&mut self, ticket: Ticket) -> bool {
        let pending = self.pending.expect("pending reservation present");
        if self.group.capacity_deficiency(pending.head) > 0 {
            return false;
        }

        if ticket == pending.ticket {
            self.pending = None;
        } else {
            // A different request floated to the top while the reservation
            // matured; charge it fresh and slide the reserved slot forward.
            let cap = self.group.ticket_capacity(ticket);
            self.group.grab_capacity(cap);
            self.pending = Some(PendingReservation {
                head: pending.head.wrapping_add(cap),
                ticket: pending.ticket,
            });
        }
        true
    }

    /// Shifts every cursor down so the next addition lands in finite range,
    /// preserving the relative order of queued classes.
    ///
    /// Queued classes drop by the dispatching class's old cursor; idle
    /// classes reset to zero and are re-seated by the fairness window when
    /// they return.
    fn rebase_accumulators(&mut self, origin: f64) {
        for pc in self.priority_classes.iter_mut().flatten() {
            if pc.queued {
                pc.accumulated -= origin;
            } else {
                pc.accumulated = 0.0;
            }
        }
        self.last_accumulated = 0.0;

        // Heap keys are snapshots; rebuild them from the rebased cursors.
        self.handles = self
            .priority_classes
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().filter(|pc| pc.queued).map(|pc| ClassHandle {
                    accumulated: pc.accumulated,
                    id: index as ClassId,
                })
            })
            .collect();
    }

    fn class(&self, id: ClassId) -> FlowResult<&PriorityClassData> {
        self.priority_classes
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(FlowError::ClassNotRegistered { class_id: id })
    }

    fn class_mut(&mut self, id: ClassId) -> FlowResult<&mut PriorityClassData> {
        self.priority_classes
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(FlowError::ClassNotRegistered { class_id: id })
    }

    /// Class named by a live heap handle; the heap never outlives a class.
    fn resident_class(&mut self, id: ClassId) -> &mut PriorityClassData {
        self.class_mut(id)
            .expect("heap handle names a registered class")
    }

    #[cfg(test)]
    fn accumulated(&self, id: ClassId) -> f64 {
        self.class(id).expect("class registered").accumulated
    }

    #[cfg(test)]
    fn force_accumulated(&mut self, id: ClassId, value: f64) {
        self.class_mut(id).expect("class registered").accumulated = value;
    }

    #[cfg(test)]
    const fn last_accumulated(&self) -> f64 {
        self.last_accumulated
    }
}
