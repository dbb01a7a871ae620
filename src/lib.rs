pub mod alerting;
pub mod config;
pub mod input;
pub mod models;
pub mod output;
pub mod persistence;
pub mod tracking;

// Re-export commonly used types
pub use alerting::{NotifyQueue, SessionNotifier};
pub use config::Config;
pub use models::{AuthEvent, AuthStatus, Session, Stats};
pub use persistence::{PersistenceError, SessionRepository, StatsRepository, Store};
pub use tracking::{Consistency, Tracker, TrackingError};
