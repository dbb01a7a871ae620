//! Event model: authentication events, sessions and aggregate statistics
//!
//! Pure data and transition logic, no I/O.

pub mod event;
pub mod session;
pub mod stats;

pub use event::{AuthEvent, AuthStatus};
pub use session::Session;
pub use stats::{Counters, Stats};
