//! Change-group subscription machinery.
//!
//! A change group is a named, ordered set of control paths plus a
//! polling cadence. The registry owns group lifecycle; each active
//! group gets a dedicated timer task that diffs current values against
//! the last snapshot and emits change signals.

mod poller;
pub mod registry;

pub use registry::{
    validate_rate, AddOutcome, ChangeGroupRegistry, GroupInfo, DEFAULT_POLL_RATE, MAX_POLL_RATE,
    MIN_POLL_RATE,
};
