//! Channel protocol client for the realtime WebSocket API.
//!
//! One socket carries many logical channels. Callers register listeners per
//! channel key; the client turns that into `GET`/`SUB`/`DEL` commands,
//! demultiplexes inbound JSON frames back to the listeners and replays every
//! subscription after a reconnect.
//!
//! # Architecture
//!
//! ```text
//!   ChannelClient (Clone)            Registry (sync state machine)
//!         │  subscribe/get/send ────►  subscriptions, pending requests,
//!         │                            subscribed set, send queue
//!         ▼                                   ▲
//!   Background socket task ── dispatch(text) ─┘
//!   (connect, flush, ping, reconnect)
//! ```
//!
//! The registry never calls listeners while locked. It returns
//! [`Delivery`] values which the caller runs after releasing the lock, so a
//! listener may subscribe or unsubscribe from inside its callback.

pub mod client;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

pub use client::{ChannelClient, ClientOptions};
pub use protocol::{Command, InboundMessage, RequestParams};
pub use registry::{Delivery, Registry};

/// Connection state of the channel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket. Messages sent now wait for the next open.
    #[default]
    Disconnected,
    /// Socket is being opened. Messages sent now are queued.
    Connecting,
    /// Socket is open and messages go straight to the wire.
    Open,
    /// Caller asked to close; the socket is being torn down.
    Closing,
}

/// Errors surfaced to error listeners.
///
/// These are never returned from the client API; transport failures are
/// retried locally and reported through the registered error callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to establish the connection.
    ConnectionFailed(String),
    /// Writing to the socket failed.
    SendFailed(String),
    /// The socket was closed.
    Closed,
    /// An inbound frame could not be parsed.
    Parse(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
            Self::Parse(msg) => write!(f, "Malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

type MessageFn = dyn Fn(&InboundMessage) + Send + Sync;
type ErrorFn = dyn Fn(&ChannelError) + Send + Sync;

/// Callback receiving messages of one channel.
///
/// Identity matters: two `Listener`s are the same listener only if one is a
/// clone of the other. Subscribing the same listener twice to a channel
/// replaces the first registration.
#[derive(Clone)]
pub struct Listener(Arc<MessageFn>);

impl Listener {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Whether both handles refer to the same callback.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn call(&self, msg: &InboundMessage) {
        (self.0)(msg);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0).cast::<()>())
    }
}

/// Callback receiving transport errors for a subscription or request.
#[derive(Clone)]
pub struct ErrorListener(Arc<ErrorFn>);

impl ErrorListener {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&ChannelError) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, err: &ChannelError) {
        (self.0)(err);
    }
}

impl std::fmt::Debug for ErrorListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ErrorListener({:p})", Arc::as_ptr(&self.0).cast::<()>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_identity() {
        let a = Listener::new(|_| {});
        let b = Listener::new(|_| {});
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ChannelError::Closed.to_string(), "Channel closed");
        assert_eq!(
            ChannelError::ConnectionFailed("refused".into()).to_string(),
            "Connection failed: refused"
        );
    }

    #[test]
    fn test_default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
