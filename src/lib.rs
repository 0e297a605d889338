//! Congestion-aware multipath flow scheduler for SDN-managed leaf/spine
//! fabrics.
//!
//! Every epoch the daemon polls flow and port counters from the controller,
//! turns them into per-epoch deltas, hashes flows into a fixed number of
//! groups and greedily places the heaviest groups onto the least loaded
//! egress ports. The resulting assignment is pushed back to the controller.

pub mod agent;
pub mod config;
pub mod error;
pub mod export;
pub mod fabric;
pub mod gateway;
pub mod publish;
pub mod sched;
pub mod version;
