//! State of the `extra_geoms` channel.
//!
//! The server streams GeoJSON features keyed by `properties.ref`. A
//! `Feature` message inserts or replaces the entry for its ref; any other
//! message type removes it.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::channel::InboundMessage;

/// Current extra geometries, keyed by ref.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraGeoms {
    features: BTreeMap<String, Value>,
}

impl ExtraGeoms {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message. Returns `false` if the message carried no ref.
    pub fn apply(&mut self, msg: &InboundMessage) -> bool {
        let content = &msg.content;
        let Some(key) = feature_ref(content) else {
            log::debug!("[Realtime] extra_geoms message without ref ignored");
            return false;
        };

        if content.get("type").and_then(Value::as_str) == Some("Feature") {
            self.features.insert(key, content.clone());
        } else {
            self.features.remove(&key);
        }
        true
    }

    /// Feature stored for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.features.get(key)
    }

    /// Every feature, ordered by ref.
    pub fn features(&self) -> impl Iterator<Item = &Value> {
        self.features.values()
    }

    /// Number of stored features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn feature_ref(content: &Value) -> Option<String> {
    match content.get("properties")?.get("ref")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(content: Value) -> InboundMessage {
        InboundMessage {
            source: "extra_geoms".to_string(),
            timestamp: None,
            client_reference: None,
            content,
        }
    }

    #[test]
    fn test_feature_upserts_by_ref() {
        let mut geoms = ExtraGeoms::new();
        assert!(geoms.apply(&msg(json!({"type": "Feature", "properties": {"ref": "a", "v": 1}}))));
        assert!(geoms.apply(&msg(json!({"type": "Feature", "properties": {"ref": "a", "v": 2}}))));
        assert_eq!(geoms.len(), 1);
        assert_eq!(geoms.get("a").unwrap()["properties"]["v"], 2);
    }

    #[test]
    fn test_other_type_removes() {
        let mut geoms = ExtraGeoms::new();
        geoms.apply(&msg(json!({"type": "Feature", "properties": {"ref": 7}})));
        assert_eq!(geoms.len(), 1);
        geoms.apply(&msg(json!({"type": "DeleteFeature", "properties": {"ref": 7}})));
        assert!(geoms.is_empty());
    }

    #[test]
    fn test_message_without_ref_is_ignored() {
        let mut geoms = ExtraGeoms::new();
        assert!(!geoms.apply(&msg(json!({"type": "Feature", "properties": {}}))));
        assert!(!geoms.apply(&msg(Value::Null)));
        assert!(geoms.is_empty());
    }
}
