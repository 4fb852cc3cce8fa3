//! Accounting invariants for scheduler state.
//!
//! The [`InvariantChecker`] mirrors every scheduler operation into a shadow
//! model and compares the model against live queue and group snapshots.
//! Scenarios call the `on_*` hooks as they drive the scheduler and
//! [`InvariantChecker::check`] wherever the invariants must hold.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use sluice_flow::{Capacity, ClassId, FairGroupStats, FairQueueStats, Ticket};

/// A violation of a scheduler accounting invariant.
#[derive(Debug, Clone)]
pub enum PropertyViolation {
    /// The queued-request counter disagrees with the sum of class queues.
    QueuedCountMismatch {
        /// Entries the shadow model holds as queued.
        expected: u64,
        /// The live counter.
        actual: u64,
    },
    /// The queued-resources ticket disagrees with the queued tickets.
    QueuedResourcesMismatch {
        /// Componentwise sum over the shadow model.
        expected: Ticket,
        /// The live ticket total.
        actual: Ticket,
    },
    /// The executing-request counter disagrees with dispatch/finish pairing.
    ExecutingCountMismatch {
        /// Dispatches minus completions in the shadow model.
        expected: u64,
        /// The live counter.
        actual: u64,
    },
    /// The executing-resources ticket disagrees with in-flight tickets.
    ExecutingResourcesMismatch {
        /// Componentwise sum over the shadow model.
        expected: Ticket,
        /// The live ticket total.
        actual: Ticket,
    },
    /// An entry left its class queue out of arrival order.
    FifoOrderViolation {
        /// The class whose queue misordered.
        class_id: ClassId,
        /// The sequence number the model expected next.
        expected_seq: Option<u64>,
        /// The sequence number actually dispatched.
        actual_seq: u64,
    },
    /// Grabbed capacity no longer matches dispatched work plus the live
    /// reservation: capacity leaked or was double-charged.
    CapacityLeak {
        /// The group's reservation frontier.
        grabbed: Capacity,
        /// Dispatched capacity plus the pending reservation.
        expected: Capacity,
    },
    /// Released capacity no longer matches completed work.
    ReleaseMismatch {
        /// The group's release ceiling.
        released: Capacity,
        /// Burst limit plus the capacity of all completions.
        expected: Capacity,
    },
}

impl fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueuedCountMismatch { expected, actual } => {
                write!(f, "queued count {actual}, expected {expected}")
            }
            Self::QueuedResourcesMismatch { expected, actual } => {
                write!(f, "queued resources {actual}, expected {expected}")
            }
            Self::ExecutingCountMismatch { expected, actual } => {
                write!(f, "executing count {actual}, expected {expected}")
            }
            Self::ExecutingResourcesMismatch { expected, actual } => {
                write!(f, "executing resources {actual}, expected {expected}")
            }
            Self::FifoOrderViolation {
                class_id,
                expected_seq,
                actual_seq,
            } => {
                write!(
                    f,
                    "class {class_id} dispatched seq {actual_seq}, expected {expected_seq:?}"
                )
            }
            Self::CapacityLeak { grabbed, expected } => {
                write!(f, "grabbed capacity {grabbed}, expected {expected}")
            }
            Self::ReleaseMismatch { released, expected } => {
                write!(f, "release ceiling {released}, expected {expected}")
            }
        }
    }
}

/// Shadow model of one shard's scheduler, compared against live snapshots.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    /// Tickets of entries currently queued, keyed by sequence number.
    queued_tickets: HashMap<u64, Ticket>,
    /// Arrival order per class.
    class_fifos: HashMap<ClassId, VecDeque<u64>>,
    /// Dispatches minus completions.
    executing_requests: u64,
    /// Componentwise sum of in-flight tickets.
    executing_resources: Ticket,
    /// Capacity of everything ever dispatched.
    dispatched_capacity: Capacity,
    /// Capacity of everything ever completed.
    released_capacity: Capacity,
    /// Violations observed at event time (ordering).
    event_violations: Vec<PropertyViolation>,
}

impl InvariantChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry joining a class queue.
    pub fn on_queue(&mut self, class_id: ClassId, seq: u64, ticket: Ticket) {
        self.queued_tickets.insert(seq, ticket);
        self.class_fifos.entry(class_id).or_default().push_back(seq);
    }

    /// Records a cancellation; the entry keeps its queue slot with a zero
    /// ticket.
    pub fn on_cancel(&mut self, seq: u64) {
        if let Some(ticket) = self.queued_tickets.get_mut(&seq) {
            *ticket = Ticket::default();
        }
    }

    /// Records a dispatch, verifying arrival order within the class.
    pub fn on_dispatch(&mut self, class_id: ClassId, seq: u64, ticket: Ticket, capacity: Capacity) {
        let front = self
            .class_fifos
            .entry(class_id)
            .or_default()
            .pop_front();
        if front != Some(seq) {
            self.event_violations.push(PropertyViolation::FifoOrderViolation {
                class_id,
                expected_seq: front,
                actual_seq: seq,
            });
        }
        self.queued_tickets.remove(&seq);
        self.executing_requests += 1;
        self.executing_resources += ticket;
        self.dispatched_capacity += capacity;
    }

    /// Records a completion.
    pub fn on_finish(&mut self, ticket: Ticket, capacity: Capacity) {
        self.executing_requests = self.executing_requests.saturating_sub(1);
        self.executing_resources -= ticket;
        self.released_capacity += capacity;
    }

    /// Compares the shadow model against live snapshots, returning every
    /// violated invariant.
    ///
    /// `pending_capacity` is the capacity of the queue's live reservation
    /// (zero if none); `burst_limit` is the group's maximum capacity, which
    /// seeds the release ceiling.
    #[must_use]
    pub fn check(
        &self,
        queue_stats: &FairQueueStats,
        group_stats: &FairGroupStats,
        pending_capacity: Capacity,
        burst_limit: Capacity,
    ) -> Vec<PropertyViolation> {
        let mut violations = self.event_violations.clone();

        let expected_queued = self.queued_tickets.len() as u64;
        if queue_stats.requests_queued != expected_queued {
            violations.push(PropertyViolation::QueuedCountMismatch {
                expected: expected_queued,
                actual: queue_stats.requests_queued,
            });
        }

        let expected_resources = self
            .queued_tickets
            .values()
            .fold(Ticket::default(), |total, &ticket| total + ticket);
        if queue_stats.resources_queued != expected_resources {
            violations.push(PropertyViolation::QueuedResourcesMismatch {
                expected: expected_resources,
                actual: queue_stats.resources_queued,
            });
        }

        if queue_stats.requests_executing != self.executing_requests {
            violations.push(PropertyViolation::ExecutingCountMismatch {
                expected: self.executing_requests,
                actual: queue_stats.requests_executing,
            });
        }
        if queue_stats.resources_executing != self.executing_resources {
            violations.push(PropertyViolation::ExecutingResourcesMismatch {
                expected: self.executing_resources,
                actual: queue_stats.resources_executing,
            });
        }

        let expected_tail = self.dispatched_capacity + pending_capacity;
        if group_stats.capacity_tail != expected_tail {
            violations.push(PropertyViolation::CapacityLeak {
                grabbed: group_stats.capacity_tail,
                expected: expected_tail,
            });
        }

        let expected_ceil = burst_limit + self.released_capacity;
        if group_stats.capacity_ceil != expected_ceil {
            violations.push(PropertyViolation::ReleaseMismatch {
                released: group_stats.capacity_ceil,
                expected: expected_ceil,
            });
        }

        violations
    }
}
