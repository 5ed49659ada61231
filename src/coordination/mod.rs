//! Relay orchestration
//!
//! The federator:
//! 1. Scans the source chain from its checkpoint to the head
//! 2. Defers events that lack the confirmations their amount requires
//! 3. Relays ready events the destination has not processed yet
//! 4. Advances the checkpoint over the contiguous resolved prefix
//!
//! The scheduler drives both directions on a fixed period.

pub mod federator;
pub mod scheduler;

pub use federator::Federator;
pub use scheduler::Scheduler;
