//! Realtime state-synchronization client for the phase/condition
//! progression server.
//!
//! [`SyncSession`] is the entry point. It keeps a [`ConnectionManager`]
//! socket alive, feeds every inbound payload through the
//! [`SyncController`], and publishes the resulting [`ViewModel`] and
//! [`StatusNotice`]s to subscribers.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod hierarchy;
pub mod notice;
pub mod scheduler;
pub mod session;

pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionState, Connector, ReconnectPolicy};
pub use controller::{SyncController, ViewModel};
pub use error::ClientError;
pub use gateway::ActionGateway;
pub use hierarchy::{build_hierarchy, phase_context, PhaseContext, PhaseNode};
pub use notice::{Severity, StatusNotice};
pub use scheduler::{Countdown, TransitionScheduler};
pub use session::SyncSession;
