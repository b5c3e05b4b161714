//! Internal implementation details.

pub(crate) mod guarded;
pub(crate) mod wait;

pub(crate) use guarded::{panic_message, run_guarded};
pub(crate) use wait::{wait, WaitStep};
