//! Client side of the beacon protocol.
//!
//! [`ConnectionManager`] owns one logical socket: it authenticates, subscribes
//! to the configured topics, reconnects with [`Backoff`], and correlates tool
//! results through a [`RequestCorrelator`]. [`StateStore`] folds the event
//! stream into an immutable [`AppState`] snapshot using the pure [`reduce`].

pub mod backoff;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod listeners;
pub mod state;

pub use backoff::{Backoff, BackoffPolicy};
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use correlator::{RequestCorrelator, ResponseHandle};
pub use error::{ClientError, RequestError};
pub use listeners::{Listeners, Subscription};
pub use state::{reduce, AppState, StateStore};
