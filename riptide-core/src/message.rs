//! Message model: payloads, per-registry message types and the broadcast
//! descriptor handed to `cast`/`broadcast`.

use crate::error::{Result, RiptideError};
use crate::wire::WireFrame;
use bytes::Bytes;

/// Frame encoding selected per Router / per Dynamic at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Raw bytes on binary frames (text frames are accepted inbound and
    /// flattened to bytes).
    #[default]
    Octet,
    /// Structured values serialized with `serde_json` on text frames.
    Json,
}

impl MessageType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Json => "json",
        }
    }
}

/// An application payload, inbound or outbound.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Opaque bytes
    Octet(Bytes),
    /// Structured JSON value
    Json(serde_json::Value),
}

impl Payload {
    /// Text convenience constructor (stored as bytes).
    pub fn text(text: impl Into<String>) -> Self {
        Self::Octet(Bytes::from(text.into()))
    }

    #[must_use]
    pub const fn is_octet(&self) -> bool {
        matches!(self, Self::Octet(_))
    }

    #[must_use]
    pub fn as_octet(&self) -> Option<&Bytes> {
        match self {
            Self::Octet(b) => Some(b),
            Self::Json(_) => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Octet(_) => None,
        }
    }

    /// Encode for the outbound path of a registry with the given message
    /// type. Octet registries emit binary frames; Json registries emit text
    /// frames and reject byte payloads that are not valid UTF-8.
    pub fn encode(&self, message_type: MessageType) -> Result<WireFrame> {
        match (self, message_type) {
            (Self::Octet(b), MessageType::Octet) => Ok(WireFrame::Binary(b.clone())),
            (Self::Json(v), MessageType::Octet) => {
                Ok(WireFrame::Binary(Bytes::from(serde_json::to_vec(v)?)))
            }
            (Self::Json(v), MessageType::Json) => Ok(WireFrame::Text(serde_json::to_string(v)?)),
            (Self::Octet(b), MessageType::Json) => {
                let text = std::str::from_utf8(b)
                    .map_err(|e| RiptideError::Encode(e.to_string()))?
                    .to_owned();
                Ok(WireFrame::Text(text))
            }
        }
    }

    /// Decode an inbound frame under the registry's message type.
    pub fn decode(frame: WireFrame, message_type: MessageType) -> Result<Self> {
        match message_type {
            MessageType::Octet => Ok(Self::Octet(frame.into_bytes())),
            MessageType::Json => match frame {
                WireFrame::Text(t) => Ok(Self::Json(serde_json::from_str(&t)?)),
                WireFrame::Binary(b) => Ok(Self::Json(serde_json::from_slice(&b)?)),
            },
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Octet(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Octet(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(b: &'static [u8]) -> Self {
        Self::Octet(Bytes::from_static(b))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Broadcast descriptor.
///
/// Targeting dimensions compose: `conn_ids` and (for groups) `owner_ids`
/// restrict the receiver set, `bucket_ids` restricts a router cast to a
/// subset of shards. All empty means "every member".
///
/// ```
/// use riptide_core::message::MsgData;
/// use bytes::Bytes;
///
/// let msg = MsgData::new(Bytes::from_static(b"tick"))
///     .with_conn_ids([3, 7])
///     .with_queue_write(true);
/// assert_eq!(msg.conn_ids, vec![3, 7]);
/// ```
#[derive(Debug, Clone)]
pub struct MsgData {
    pub payload: Payload,
    /// Target connection ids; empty means all members.
    pub conn_ids: Vec<u64>,
    /// Target owner ids, resolved through the group owner index. Group only.
    pub owner_ids: Vec<u64>,
    /// Route through each connector's bounded write queue as raw bytes
    /// instead of the direct synchronous write path.
    pub queue_write: bool,
    /// Restrict a router cast to these shards. Router only.
    pub bucket_ids: Vec<usize>,
}

impl MsgData {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            conn_ids: Vec::new(),
            owner_ids: Vec::new(),
            queue_write: false,
            bucket_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_conn_ids(mut self, conn_ids: impl IntoIterator<Item = u64>) -> Self {
        self.conn_ids = conn_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_owner_ids(mut self, owner_ids: impl IntoIterator<Item = u64>) -> Self {
        self.owner_ids = owner_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_queue_write(mut self, queue_write: bool) -> Self {
        self.queue_write = queue_write;
        self
    }

    #[must_use]
    pub fn with_bucket_ids(mut self, bucket_ids: impl IntoIterator<Item = usize>) -> Self {
        self.bucket_ids = bucket_ids.into_iter().collect();
        self
    }

    /// Registration-time invariant: the queued path carries raw bytes only.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_write && !self.payload.is_octet() {
            return Err(RiptideError::InvalidParameter(
                "queue_write requires an octet payload",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn octet_round_trip() {
        let payload = Payload::from(Bytes::from_static(b"hello"));
        let frame = payload.encode(MessageType::Octet).unwrap();
        assert_eq!(frame, WireFrame::Binary(Bytes::from_static(b"hello")));

        let back = Payload::decode(frame, MessageType::Octet).unwrap();
        assert_eq!(back.as_octet().unwrap(), &Bytes::from_static(b"hello"));
    }

    #[test]
    fn json_encodes_to_text() {
        let payload = Payload::from(json!({"op": "join", "room": 42}));
        let frame = payload.encode(MessageType::Json).unwrap();
        match frame {
            WireFrame::Text(t) => {
                let v: serde_json::Value = serde_json::from_str(&t).unwrap();
                assert_eq!(v["room"], 42);
            }
            WireFrame::Binary(_) => panic!("json payload must encode as text"),
        }
    }

    #[test]
    fn json_decode_rejects_garbage() {
        let frame = WireFrame::Text("{not json".into());
        assert!(Payload::decode(frame, MessageType::Json).is_err());
    }

    #[test]
    fn octet_payload_on_json_registry_must_be_utf8() {
        let payload = Payload::from(Bytes::from_static(&[0xff, 0xfe]));
        assert!(payload.encode(MessageType::Json).is_err());
    }

    #[test]
    fn text_frame_flattens_on_octet_registry() {
        let frame = WireFrame::Text("plain".into());
        let payload = Payload::decode(frame, MessageType::Octet).unwrap();
        assert_eq!(payload.as_octet().unwrap(), &Bytes::from_static(b"plain"));
    }

    #[test]
    fn msg_data_builder() {
        let msg = MsgData::new(json!([1, 2, 3]))
            .with_owner_ids([9])
            .with_bucket_ids([0, 2]);
        assert!(msg.conn_ids.is_empty());
        assert_eq!(msg.owner_ids, vec![9]);
        assert_eq!(msg.bucket_ids, vec![0, 2]);
        assert!(!msg.queue_write);
    }

    #[test]
    fn queued_path_is_bytes_only() {
        let msg = MsgData::new(json!({"a": 1})).with_queue_write(true);
        assert!(msg.validate().is_err());

        let msg = MsgData::new(Bytes::from_static(b"raw")).with_queue_write(true);
        assert!(msg.validate().is_ok());
    }
}
