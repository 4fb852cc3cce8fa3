//! Fair I/O scheduling for Sluice.
//!
//! This crate decides *when* a request may proceed against a shared,
//! rate-limited resource (typically a block device). It never performs I/O
//! itself and never inspects payloads. Two pieces compose:
//!
//! - **[`FairGroup`]**: the process-wide capacity accountant. One group per
//!   resource, shared by every shard through atomic rovers; a timer-driven
//!   replenisher regenerates capacity at a fixed rate up to a burst ceiling.
//! - **[`FairQueue`]**: the per-shard scheduler. Holds priority classes and
//!   their pending entries, serves the class furthest behind its fair share
//!   first, and consults the group before every dispatch.
//!
//! # Architecture
//!
//! ```text
//!  shard 0                shard 1                shard N
//!  ┌────────────┐         ┌────────────┐         ┌────────────┐
//!  │ FairQueue  │         │ FairQueue  │   ...   │ FairQueue  │
//!  │  classes   │         │  classes   │         │  classes   │
//!  └─────┬──────┘         └─────┬──────┘         └─────┬──────┘
//!        │  grab / release / replenish (atomic rovers) │
//!        └──────────────────────┼──────────────────────┘
//!                        ┌──────┴──────┐
//!                        │  FairGroup  │
//!                        └─────────────┘
//! ```
//!
//! # Cost model
//!
//! Every request carries a [`Ticket`]: an `(operations, bytes)` pair. A
//! ticket rated against the group's per-tick budget yields a fixed-point
//! [`Capacity`](group::Capacity); rated against the in-flight budget and
//! divided by a class's shares it yields the virtual-time step that drives
//! fairness. Classes with more shares advance their cursor more slowly per
//! unit of work and are therefore served more often.
//!
//! # Time
//!
//! All time-dependent operations accept `now_us` as a parameter rather than
//! reading a clock. This keeps every behavior reproducible under
//! deterministic simulation; production drivers pass a monotonic timestamp.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sluice_flow::{
//!     FairGroup, FairGroupConfig, FairQueue, FairQueueConfig, FairQueueEntry, Ticket,
//! };
//!
//! let group = Arc::new(FairGroup::new(&FairGroupConfig::for_testing(), 0));
//! let mut queue = FairQueue::new(Arc::clone(&group), FairQueueConfig::for_testing());
//!
//! queue.register_priority_class(0, 100).unwrap();
//! queue
//!     .queue(0, FairQueueEntry::new(Ticket::new(1, 4096), "read block 7"))
//!     .unwrap();
//!
//! // One tick of simulated time earns the first grant.
//! group.replenish_capacity(1_000);
//!
//! let mut served = Vec::new();
//! queue.dispatch_requests(|entry| served.push(entry));
//! assert_eq!(served.len(), 1);
//!
//! // Completion returns the capacity to the group.
//! let ticket = served[0].ticket();
//! queue.notify_request_finished(ticket);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod group;
pub mod queue;
pub mod ticket;

// Re-export main types for convenience.
pub use error::{FlowError, FlowResult};
pub use group::{
    Capacity, FairGroup, FairGroupConfig, FairGroupStats, FIXED_POINT_FACTOR, RATE_RESOLUTION_US,
};
pub use queue::{ClassId, EntryId, FairQueue, FairQueueConfig, FairQueueEntry, FairQueueStats};
pub use ticket::{wrapping_difference, Ticket};
