//! Application-wide constants for trajcast.
//!
//! This module centralizes timing and sizing defaults so the channel
//! client, aggregators and engine agree on them. Constants are grouped
//! by domain.
//!
//! # Categories
//!
//! - **Connection**: keepalive and reconnect timing
//! - **Aggregation**: debounce windows and departure age
//! - **Engine**: frame pacing, trajectory lifetime, sprite cache

use std::time::Duration;

// ============================================================================
// Connection
// ============================================================================

/// Interval between `PING` keepalive messages while the socket is open.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before reconnecting after the server closed the socket.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default realtime endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.geops.io/tracker-ws/v1/";

/// Default map projection sent with `PROJECTION`.
pub const DEFAULT_PROJECTION: &str = "EPSG:3857";

// ============================================================================
// Aggregation
// ============================================================================

/// Idle window after which a burst of per-id messages is delivered.
pub const DEBOUNCE_TIMEOUT: Duration = Duration::from_millis(100);

/// Departures further than this many minutes from now are dropped.
pub const MAX_DEPARTURE_AGE_MINUTES: i64 = 30;

/// Two departures of the same line and destination closer than this
/// are considered duplicates.
pub const DUPLICATE_DEPARTURE_WINDOW_MS: i64 = 1000;

// ============================================================================
// Engine
// ============================================================================

/// Animation tick (approximately 60fps).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Trajectories not updated for this long are evicted.
pub const TRAJECTORY_TTL: Duration = Duration::from_secs(60);

/// Maximum number of vehicle sprites kept in the style cache.
pub const STYLE_CACHE_CAPACITY: usize = 512;

/// Default hit-test tolerance in CSS pixels.
pub const HIT_TOLERANCE_PX: f64 = 10.0;
