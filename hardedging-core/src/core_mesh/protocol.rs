//! Asset protocol carried over an open peer channel.
//!
//! One JSON object per frame:
//! `{"type":"ASSET_REQUEST","id":...,"priority"?}` and
//! `{"type":"ASSET_RESPONSE","id":...,"found":...,"dataBase64"?,"contentType"?,"peerId"?}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::types::{AssetId, AssetRecord, PeerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssetMessage {
    #[serde(rename = "ASSET_REQUEST")]
    Request(AssetRequest),
    #[serde(rename = "ASSET_RESPONSE")]
    Response(AssetResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    pub id: AssetId,
    /// Only consulted by the `priority` queue policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetResponse {
    pub id: AssetId,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

impl AssetResponse {
    pub fn found(record: &AssetRecord, from: &PeerId) -> Self {
        AssetResponse {
            id: record.id.clone(),
            found: true,
            data_base64: Some(BASE64.encode(&record.bytes)),
            content_type: Some(record.content_type.clone()),
            peer_id: Some(from.clone()),
        }
    }

    pub fn not_found(id: &str, from: &PeerId) -> Self {
        AssetResponse {
            id: id.to_string(),
            found: false,
            data_base64: None,
            content_type: None,
            peer_id: Some(from.clone()),
        }
    }

    /// Decoded payload, if this is a usable hit no larger than `max_bytes`
    pub fn payload(&self, max_bytes: usize) -> Option<Vec<u8>> {
        if !self.found {
            return None;
        }
        let encoded = self.data_base64.as_deref()?;
        // Cheap upper bound before decoding anything.
        if encoded.len() / 4 * 3 > max_bytes + 2 {
            return None;
        }
        let bytes = BASE64.decode(encoded).ok()?;
        (bytes.len() <= max_bytes).then_some(bytes)
    }
}

impl AssetMessage {
    pub fn request(id: impl Into<AssetId>, priority: Option<i32>) -> Self {
        AssetMessage::Request(AssetRequest { id: id.into(), priority })
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// `None` for anything that is not a well-formed asset message
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let bytes = AssetMessage::request("/img.png", None).encode();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"type":"ASSET_REQUEST","id":"/img.png"}));

        let with_priority = AssetMessage::decode(br#"{"type":"ASSET_REQUEST","id":"/a","priority":3}"#).unwrap();
        assert_eq!(with_priority, AssetMessage::request("/a", Some(3)));
    }

    #[test]
    fn test_found_response_carries_base64_payload() {
        let record = AssetRecord::new("/img.png", vec![1, 2, 3, 4], "image/png");
        let response = AssetResponse::found(&record, &PeerId::new("peer_a"));
        let value = serde_json::to_value(AssetMessage::Response(response.clone())).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "ASSET_RESPONSE",
                "id": "/img.png",
                "found": true,
                "dataBase64": "AQIDBA==",
                "contentType": "image/png",
                "peerId": "peer_a"
            })
        );
        assert_eq!(response.payload(4), Some(vec![1, 2, 3, 4]));
        assert_eq!(response.payload(3), None);
    }

    #[test]
    fn test_not_found_and_bad_payloads_yield_nothing() {
        let miss = AssetResponse::not_found("/x", &PeerId::new("peer_a"));
        assert_eq!(miss.payload(100), None);
        let value = serde_json::to_value(AssetMessage::Response(miss)).unwrap();
        assert_eq!(value, json!({"type":"ASSET_RESPONSE","id":"/x","found":false,"peerId":"peer_a"}));

        let garbage = AssetResponse {
            id: "/x".into(),
            found: true,
            data_base64: Some("***".into()),
            content_type: None,
            peer_id: None,
        };
        assert_eq!(garbage.payload(100), None);
    }

    #[test]
    fn test_malformed_frames_decode_to_none() {
        assert!(AssetMessage::decode(b"hello").is_none());
        assert!(AssetMessage::decode(br#"{"type":"ASSET_PING","id":"/a"}"#).is_none());
        assert!(AssetMessage::decode(br#"{"type":"ASSET_RESPONSE","id":"/a"}"#).is_none());
    }
}
