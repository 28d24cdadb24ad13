//! The wire envelope shared by every subsystem.
//!
//! All traffic between peers - connection establishment, gossip exchanges,
//! media transfers - travels as a single JSON envelope ([`Message`]) tagged
//! with a [`MessageType`]. Connection-related messages are forwardable
//! through the mesh and carry a TTL plus the list of peers that have
//! handled them; everything else is exchanged only between directly
//! connected pairs.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while validating or (de)serializing an envelope.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A required envelope field is missing or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The envelope violates a structural invariant.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// JSON (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// An opaque peer identity, assigned by the signaling service on first
/// contact. Ordering is lexicographic, which the handshake tie-break and
/// the signaling replay guard rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// The broadcast sentinel, uniformly the string `"-1"` on the wire.
const BROADCAST: &str = "-1";

/// The reserved id of the signaling link in the connection registry.
const SIGNAL: &str = "signal";

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The broadcast destination (`"-1"`).
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    /// The distinguished signaling-link id.
    pub fn signal() -> Self {
        Self(SIGNAL.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    pub fn is_signal(&self) -> bool {
        self.0 == SIGNAL
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The closed set of wire tags.
///
/// - *Connection-related* (`request-peer`, `offer`, `answer`,
///   `icecandidate`): forwardable, must carry `ttl` and `forwardBy`.
/// - *Gossip* (`first-view`, `gossip:*`): exchanged only between already
///   connected pairs, never forwarded.
/// - *Media* (`media:*`): never forwarded.
/// - *Internal events* (`connected`, `disconnected`): dispatched locally
///   only.
///
/// Application-defined tags are carried as [`MessageType::Other`] and are
/// treated like media messages (not forwardable).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    RequestPeer,
    Offer,
    Answer,
    IceCandidate,
    FirstView,
    GossipRequestExchange,
    GossipAnswerExchange,
    GossipViewUpdate,
    GossipDescriptorUpdate,
    MediaRequestMetadata,
    MediaMetadata,
    MediaRequestHead,
    MediaHead,
    MediaRequestPart,
    MediaPart,
    Connected,
    Disconnected,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::RequestPeer => "request-peer",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "icecandidate",
            MessageType::FirstView => "first-view",
            MessageType::GossipRequestExchange => "gossip:request-exchange",
            MessageType::GossipAnswerExchange => "gossip:answer-exchange",
            MessageType::GossipViewUpdate => "gossip:view-update",
            MessageType::GossipDescriptorUpdate => "gossip:descriptor-update",
            MessageType::MediaRequestMetadata => "media:request-metadata",
            MessageType::MediaMetadata => "media:metadata",
            MessageType::MediaRequestHead => "media:request-head",
            MessageType::MediaHead => "media:head",
            MessageType::MediaRequestPart => "media:request-part",
            MessageType::MediaPart => "media:part",
            MessageType::Connected => "connected",
            MessageType::Disconnected => "disconnected",
            MessageType::Other(tag) => tag,
        }
    }

    /// Returns `true` for the connection-related types that may travel
    /// through intermediate peers.
    pub fn is_forwardable(&self) -> bool {
        matches!(
            self,
            MessageType::RequestPeer
                | MessageType::Offer
                | MessageType::Answer
                | MessageType::IceCandidate
        )
    }

    /// Returns `true` for internal events that never cross the wire.
    pub fn is_local_only(&self) -> bool {
        matches!(self, MessageType::Connected | MessageType::Disconnected)
    }

    /// Returns `true` for gossip-layer types routed to the RPS engine.
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            MessageType::FirstView
                | MessageType::GossipRequestExchange
                | MessageType::GossipAnswerExchange
                | MessageType::GossipViewUpdate
                | MessageType::GossipDescriptorUpdate
        )
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "request-peer" => MessageType::RequestPeer,
            "offer" => MessageType::Offer,
            "answer" => MessageType::Answer,
            "icecandidate" => MessageType::IceCandidate,
            "first-view" => MessageType::FirstView,
            "gossip:request-exchange" => MessageType::GossipRequestExchange,
            "gossip:answer-exchange" => MessageType::GossipAnswerExchange,
            "gossip:view-update" => MessageType::GossipViewUpdate,
            "gossip:descriptor-update" => MessageType::GossipDescriptorUpdate,
            "media:request-metadata" => MessageType::MediaRequestMetadata,
            "media:metadata" => MessageType::MediaMetadata,
            "media:request-head" => MessageType::MediaRequestHead,
            "media:head" => MessageType::MediaHead,
            "media:request-part" => MessageType::MediaRequestPart,
            "media:part" => MessageType::MediaPart,
            "connected" => MessageType::Connected,
            "disconnected" => MessageType::Disconnected,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(MessageType::from(tag.as_str()))
    }
}

/// The single on-wire envelope.
///
/// # Examples
///
/// ```
/// use swarmcast::message::{Message, MessageType, PeerId};
///
/// let request = Message::broadcast(MessageType::RequestPeer, PeerId::new("a"), 3);
/// let bytes = request.encode().unwrap();
/// let parsed = Message::decode(&bytes).unwrap();
/// assert_eq!(parsed, request);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The wire tag.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The originating peer.
    pub from: PeerId,
    /// Destination peer id, or the broadcast sentinel `"-1"`.
    pub to: PeerId,
    /// Residual forwards. Required for forwardable types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    /// Peers that have handled this message, excluding the origin.
    #[serde(rename = "forwardBy", default)]
    pub forward_by: Vec<PeerId>,
    /// Type-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Media URL, for media messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Part number, `"P"` or `"P:C:N"`, for media messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    /// Inverse-path hops for offers and answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Vec<PeerId>>,
}

impl Message {
    /// Creates an envelope with no payload and no TTL.
    pub fn new(kind: MessageType, from: PeerId, to: PeerId) -> Self {
        Self {
            kind,
            from,
            to,
            ttl: None,
            forward_by: Vec::new(),
            data: None,
            url: None,
            number: None,
            route: None,
        }
    }

    /// Creates a forwardable broadcast envelope with the given TTL.
    pub fn broadcast(kind: MessageType, from: PeerId, ttl: u32) -> Self {
        let mut message = Self::new(kind, from, PeerId::broadcast());
        message.ttl = Some(ttl);
        message
    }

    /// Attaches a serializable payload.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self, MessageError> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Deserializes the payload into a concrete type.
    pub fn typed_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, MessageError> {
        let data = self
            .data
            .clone()
            .ok_or(MessageError::MissingField("data"))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Serializes the envelope as one JSON transport frame.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Returns `true` if `id` originated or already handled this message.
    pub fn handled_by(&self, id: &PeerId) -> bool {
        self.from == *id || self.forward_by.contains(id)
    }

    /// Checks the envelope invariants.
    ///
    /// Every message must carry a non-empty type, origin and destination;
    /// forwardable messages must additionally carry a TTL. The origin must
    /// not appear in its own forward history.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.kind.as_str().is_empty() {
            return Err(MessageError::MissingField("type"));
        }
        if self.from.is_empty() {
            return Err(MessageError::MissingField("from"));
        }
        if self.to.is_empty() {
            return Err(MessageError::MissingField("to"));
        }
        if self.kind.is_forwardable() && self.ttl.is_none() {
            return Err(MessageError::MissingField("ttl"));
        }
        if self.forward_by.contains(&self.from) {
            return Err(MessageError::MalformedEnvelope(
                "origin present in forwardBy".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_round_trip() {
        let tags = [
            "request-peer",
            "offer",
            "answer",
            "icecandidate",
            "first-view",
            "gossip:request-exchange",
            "gossip:answer-exchange",
            "gossip:view-update",
            "gossip:descriptor-update",
            "media:request-metadata",
            "media:metadata",
            "media:request-head",
            "media:head",
            "media:request-part",
            "media:part",
            "connected",
            "disconnected",
            "queuetest",
        ];

        for tag in tags {
            assert_eq!(MessageType::from(tag).as_str(), tag);
        }
    }

    #[test]
    fn test_forwardable_classification() {
        assert!(MessageType::RequestPeer.is_forwardable());
        assert!(MessageType::Offer.is_forwardable());
        assert!(MessageType::Answer.is_forwardable());
        assert!(MessageType::IceCandidate.is_forwardable());

        assert!(!MessageType::FirstView.is_forwardable());
        assert!(!MessageType::GossipRequestExchange.is_forwardable());
        assert!(!MessageType::MediaPart.is_forwardable());
        assert!(!MessageType::Other("queuetest".to_string()).is_forwardable());

        assert!(MessageType::Connected.is_local_only());
        assert!(MessageType::Disconnected.is_local_only());
        assert!(!MessageType::Offer.is_local_only());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut message = Message::broadcast(MessageType::RequestPeer, PeerId::new("a"), 3);
        message.forward_by = vec![PeerId::new("b"), PeerId::new("c")];

        let encoded = message.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, message);

        let offer = Message::new(MessageType::Offer, PeerId::new("b"), PeerId::new("a"));
        let mut offer = offer
            .with_data(&serde_json::json!({"kind": "offer", "blob": "sdp"}))
            .unwrap();
        offer.ttl = Some(3);
        offer.route = Some(vec![PeerId::new("x")]);

        let decoded = Message::decode(&offer.encode().unwrap()).unwrap();
        assert_eq!(decoded, offer);
    }

    #[test]
    fn test_wire_field_names() {
        let mut message = Message::broadcast(MessageType::RequestPeer, PeerId::new("a"), 3);
        message.forward_by = vec![PeerId::new("b")];

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "request-peer");
        assert_eq!(value["forwardBy"][0], "b");
        assert_eq!(value["to"], "-1");
    }

    #[test]
    fn test_validate_requires_ttl_on_forwardable() {
        let mut message = Message::new(MessageType::Offer, PeerId::new("b"), PeerId::new("a"));
        assert!(message.validate().is_err());

        message.ttl = Some(0);
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_origin_in_forward_history() {
        let mut message = Message::broadcast(MessageType::RequestPeer, PeerId::new("a"), 3);
        message.forward_by = vec![PeerId::new("a")];
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_identities() {
        let message = Message::new(
            MessageType::Other("queuetest".to_string()),
            PeerId::new(""),
            PeerId::new("a"),
        );
        assert!(message.validate().is_err());

        let message = Message::new(
            MessageType::Other(String::new()),
            PeerId::new("a"),
            PeerId::new("b"),
        );
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_broadcast_sentinel_is_string() {
        let message = Message::broadcast(MessageType::RequestPeer, PeerId::new("a"), 3);
        let json = String::from_utf8(message.encode().unwrap().to_vec()).unwrap();
        assert!(json.contains(r#""to":"-1""#));
        assert!(message.to.is_broadcast());
    }
}
