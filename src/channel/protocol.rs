//! Wire grammar of the realtime channel protocol.
//!
//! Outbound frames are single text lines:
//!
//! ```text
//! <VERB> <channel>[ <args>][ <id>]
//! BBOX minX minY maxX maxY[ extra...]
//! PROJECTION <code>
//! BUFFER <x> <y>
//! PING | RESET
//! ```
//!
//! Inbound frames are JSON objects `{source, timestamp, client_reference,
//! content}`. A frame with `source == "buffer"` batches several of those in
//! its `content` array.

use serde::{Deserialize, Serialize};

use super::ChannelError;

/// Source name of server-side batched frames.
pub const BUFFER_SOURCE: &str = "buffer";

/// Addressing of one channel request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RequestParams {
    /// Channel name, including mode suffix, tenant and id parts.
    pub channel: String,
    /// Optional channel arguments (e.g. a station UIC).
    pub args: Option<String>,
    /// Optional correlation id echoed back as `client_reference`.
    pub id: Option<String>,
}

impl RequestParams {
    /// Params for a bare channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            args: None,
            id: None,
        }
    }

    /// Attach channel arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into()).filter(|a: &String| !a.is_empty());
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into()).filter(|i: &String| !i.is_empty());
        self
    }

    /// Key inbound messages are matched against: `<channel>[ <args>]`.
    #[must_use]
    pub fn channel_key(&self) -> String {
        match &self.args {
            Some(args) => format!("{} {}", self.channel, args),
            None => self.channel.clone(),
        }
    }

    /// Request target as written on the wire: `<channel>[ <args>][ <id>]`.
    #[must_use]
    pub fn request_string(&self) -> String {
        let mut out = self.channel_key();
        if let Some(id) = &self.id {
            out.push(' ');
            out.push_str(id);
        }
        out
    }
}

/// One outbound protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    /// One-shot read of a channel's current state.
    Get(&'a RequestParams),
    /// Subscribe to channel updates.
    Sub(&'a RequestParams),
    /// Drop a subscription server-side. Takes the channel key.
    Del(&'a str),
    /// Keepalive.
    Ping,
    /// Restrict updates to an extent plus optional extra tokens.
    Bbox {
        /// `[minX, minY, maxX, maxY]`.
        extent: [f64; 4],
        /// Extra tokens appended verbatim (zoom, `tenant=`, `gen=`).
        extra: &'a [String],
    },
    /// Coordinate reference system of served geometries.
    Projection(&'a str),
    /// Server-side buffering of outgoing updates.
    Buffer(u32, u32),
    /// Drop trajectory subscriptions server-side.
    Reset,
}

impl std::fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get(params) => write!(f, "GET {}", params.request_string()),
            Self::Sub(params) => write!(f, "SUB {}", params.request_string()),
            Self::Del(key) => write!(f, "DEL {key}"),
            Self::Ping => f.write_str("PING"),
            Self::Bbox { extent, extra } => {
                write!(
                    f,
                    "BBOX {} {} {} {}",
                    extent[0], extent[1], extent[2], extent[3]
                )?;
                for token in *extra {
                    write!(f, " {token}")?;
                }
                Ok(())
            }
            Self::Projection(code) => write!(f, "PROJECTION {code}"),
            Self::Buffer(x, y) => write!(f, "BUFFER {x} {y}"),
            Self::Reset => f.write_str("RESET"),
        }
    }
}

/// One inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel key this message belongs to.
    pub source: String,
    /// Server timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Correlation id of the request that caused this message.
    #[serde(default)]
    pub client_reference: Option<serde_json::Value>,
    /// Channel-specific payload.
    #[serde(default)]
    pub content: serde_json::Value,
}

impl InboundMessage {
    /// Whether this message answers a request for `key` with optional `id`.
    #[must_use]
    pub fn matches(&self, key: &str, id: Option<&str>) -> bool {
        if self.source != key {
            return false;
        }
        match id {
            None => true,
            Some(id) => self.client_reference_is(id),
        }
    }

    fn client_reference_is(&self, id: &str) -> bool {
        match &self.client_reference {
            Some(serde_json::Value::String(s)) => s == id,
            Some(serde_json::Value::Number(n)) => n.to_string() == id,
            _ => false,
        }
    }
}

/// Parse one text frame into the messages it carries.
///
/// Buffer frames are unwrapped; inner entries that are not valid messages
/// are skipped with a warning.
pub fn parse_frame(text: &str) -> Result<Vec<InboundMessage>, ChannelError> {
    let msg: InboundMessage =
        serde_json::from_str(text).map_err(|e| ChannelError::Parse(e.to_string()))?;

    if msg.source != BUFFER_SOURCE {
        return Ok(vec![msg]);
    }

    let serde_json::Value::Array(items) = msg.content else {
        return Err(ChannelError::Parse(
            "buffer frame without array content".to_string(),
        ));
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<InboundMessage>(item) {
            Ok(inner) => Some(inner),
            Err(e) => {
                log::warn!("[Channel] Skipping malformed buffered message: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_key_and_request_string() {
        let params = RequestParams::new("station").with_args("8503000").with_id("7");
        assert_eq!(params.channel_key(), "station 8503000");
        assert_eq!(params.request_string(), "station 8503000 7");

        let bare = RequestParams::new("trajectory");
        assert_eq!(bare.channel_key(), "trajectory");
        assert_eq!(bare.request_string(), "trajectory");
    }

    #[test]
    fn test_empty_args_are_ignored() {
        let params = RequestParams::new("healthcheck").with_args("");
        assert_eq!(params.args, None);
        assert_eq!(params.channel_key(), "healthcheck");
    }

    #[test]
    fn test_command_formatting() {
        let params = RequestParams::new("timetable_8002491");
        assert_eq!(Command::Get(&params).to_string(), "GET timetable_8002491");
        assert_eq!(Command::Sub(&params).to_string(), "SUB timetable_8002491");
        assert_eq!(Command::Del("timetable_8002491").to_string(), "DEL timetable_8002491");
        assert_eq!(Command::Ping.to_string(), "PING");
        assert_eq!(Command::Reset.to_string(), "RESET");
        assert_eq!(Command::Projection("EPSG:3857").to_string(), "PROJECTION EPSG:3857");
        assert_eq!(Command::Buffer(100, 100).to_string(), "BUFFER 100 100");

        let extra = vec!["12".to_string(), "tenant=sbb".to_string()];
        let bbox = Command::Bbox {
            extent: [1.5, 2.0, 3.0, 4.25],
            extra: &extra,
        };
        assert_eq!(bbox.to_string(), "BBOX 1.5 2 3 4.25 12 tenant=sbb");
    }

    #[test]
    fn test_matches_by_source_and_reference() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "source": "full_trajectory_sbb_1",
            "timestamp": 1.0,
            "client_reference": 42,
            "content": null
        }))
        .unwrap();

        assert!(msg.matches("full_trajectory_sbb_1", None));
        assert!(msg.matches("full_trajectory_sbb_1", Some("42")));
        assert!(!msg.matches("full_trajectory_sbb_1", Some("43")));
        assert!(!msg.matches("trajectory", None));
    }

    #[test]
    fn test_parse_frame_plain() {
        let frame = r#"{"source":"trajectory","timestamp":1,"client_reference":null,"content":{"a":1}}"#;
        let msgs = parse_frame(frame).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].source, "trajectory");
        assert_eq!(msgs[0].content["a"], 1);
    }

    #[test]
    fn test_parse_frame_unwraps_buffer() {
        let frame = json!({
            "source": "buffer",
            "timestamp": 1,
            "client_reference": null,
            "content": [
                {"source": "trajectory", "timestamp": 1, "client_reference": null, "content": {}},
                {"source": "deleted_vehicles", "timestamp": 2, "client_reference": null, "content": "x"},
                "garbage"
            ]
        })
        .to_string();

        let msgs = parse_frame(&frame).unwrap();
        let sources: Vec<_> = msgs.iter().map(|m| m.source.as_str()).collect();
        assert_eq!(sources, ["trajectory", "deleted_vehicles"]);
    }

    #[test]
    fn test_parse_frame_rejects_malformed_json() {
        assert!(matches!(parse_frame("{not json"), Err(ChannelError::Parse(_))));
    }
}
