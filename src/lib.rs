//! trajcast - realtime vehicle trajectories over a multiplexed WebSocket.
//!
//! This crate provides the client side of a realtime transit feed: the
//! channel protocol, typed channel subscriptions, debounced aggregation and
//! an engine that animates vehicles along their trajectories.
//!
//! # Architecture
//!
//! Data flows from the socket up to rendered frames:
//!
//! - **Channel** - one socket, many logical channels; reconnects and replays
//! - **Api** - named channels, viewport and projection control
//! - **Aggregate** - debounced collections (departures, per-id updates)
//! - **Engine** - trajectory store, interpolation, render worker, hit-testing
//! - **Interaction** - click and hover capabilities for map adapters
//!
//! # Modules
//!
//! - [`channel`] - Channel protocol client
//! - [`api`] - Realtime channel API
//! - [`engine`] - Trajectory engine
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod aggregate;
pub mod api;
pub mod channel;
pub mod engine;
pub mod interaction;
pub mod ws;

pub mod config;
pub mod constants;

// Re-export commonly used types
pub use api::{Bbox, RealtimeApi, RealtimeMode};
pub use channel::{ChannelClient, ConnectionState, InboundMessage};
pub use config::Config;
pub use engine::{RealtimeEngine, Trajectory, TrajectoryFilter, ViewState};
pub use interaction::RealtimeController;
