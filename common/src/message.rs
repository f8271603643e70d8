//! Wire messages and the datagram codec.
//!
//! Two message families travel between peers, distinguished by their numeric
//! `event` tag: the restore/liveness family (events 0 to 3) and the order
//! protocol family (events 4 to 10). Datagrams are self-describing JSON;
//! recipients dispatch on `event` first and validate structure second.
//! Anything that fails to decode or validate is dropped by the transport.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calls::CallMap;
use crate::elevator::{ElevState, Floor, HallButton};
use crate::PeerId;

/// Restore and liveness message kinds (wire events 0 to 3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RestoreKind {
    /// Periodic liveness beacon, carrying the sender's cabin state.
    IAmAlive,
    /// Piggybacked state backup: cabin state plus the full hall-call map.
    BackupState,
    /// A restarted peer asking the fleet for its previous state.
    RequestingState,
    /// Reply to [`RestoreKind::RequestingState`], sent to the asker only.
    RestoredStateReturned,
}

impl From<RestoreKind> for u8 {
    fn from(kind: RestoreKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for RestoreKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::IAmAlive),
            1 => Ok(Self::BackupState),
            2 => Ok(Self::RequestingState),
            3 => Ok(Self::RestoredStateReturned),
            other => Err(format!("invalid restore event {}", other)),
        }
    }
}

/// Order protocol message kinds (wire events 4 to 10).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OrderKind {
    /// A hall call was claimed for the named assignee.
    NewOrder,
    /// Acknowledges a claim.
    AckNewOrder,
    /// Every active peer acknowledged the claim; execution begins.
    OrderConfirmed,
    /// Acknowledges a confirmation.
    AckOrderConfirmed,
    /// The assignee served the call.
    OrderDone,
    /// Acknowledges a completion.
    AckOrderDone,
    /// An execution watchdog fired; the call is handed to a new assignee.
    ReassignOrder,
}

impl From<OrderKind> for u8 {
    fn from(kind: OrderKind) -> u8 {
        kind as u8 + 4
    }
}

impl TryFrom<u8> for OrderKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Self::NewOrder),
            5 => Ok(Self::AckNewOrder),
            6 => Ok(Self::OrderConfirmed),
            7 => Ok(Self::AckOrderConfirmed),
            8 => Ok(Self::OrderDone),
            9 => Ok(Self::AckOrderDone),
            10 => Ok(Self::ReassignOrder),
            other => Err(format!("invalid order event {}", other)),
        }
    }
}

/// A restore/liveness message. Fields not meaningful for a given kind are
/// simply absent from the encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreMessage {
    /// Message kind, doubling as the wire event tag.
    #[serde(rename = "event")]
    pub kind: RestoreKind,
    /// The peer asking for its state, for requests and replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asker: Option<PeerId>,
    /// The peer speaking: beacon/backup sender, or the replier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<PeerId>,
    /// A cabin state: the responder's own for beacons and backups, the
    /// asker's remembered one for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ElevState>,
    /// The responder's hall-call map, for backups and replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls: Option<CallMap>,
}

/// An order protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    /// Message kind, doubling as the wire event tag.
    #[serde(rename = "event")]
    pub kind: OrderKind,
    /// Floor of the hall call.
    pub floor: Floor,
    /// Direction of the hall call.
    pub button: HallButton,
    /// The peer responsible for serving the call.
    pub assigned_to: PeerId,
    /// The peer driving the acknowledgement rounds for this call.
    pub origin: PeerId,
    /// The peer this message came from.
    pub sender: PeerId,
}

/// Any message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// Restore/liveness family.
    Restore(RestoreMessage),
    /// Order protocol family.
    Order(OrderMessage),
}

impl From<RestoreMessage> for Message {
    fn from(msg: RestoreMessage) -> Self {
        Self::Restore(msg)
    }
}

impl From<OrderMessage> for Message {
    fn from(msg: OrderMessage) -> Self {
        Self::Order(msg)
    }
}

/// Why an inbound datagram was rejected.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Not valid JSON, or not the expected shape.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The `event` tag is missing or not an integer.
    #[error("missing event tag")]
    MissingEvent,
    /// The `event` tag is outside both families.
    #[error("unknown event {0}")]
    UnknownEvent(u64),
    /// A floor outside the building.
    #[error("floor {0} out of range")]
    FloorOutOfRange(Floor),
    /// Structurally valid, but inconsistent for its kind.
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

impl Message {
    /// Decode and validate a datagram. `floors` is the number of floors
    /// served, bounding any floor field.
    pub fn decode(data: &[u8], floors: usize) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let event = value
            .get("event")
            .and_then(serde_json::Value::as_u64)
            .ok_or(DecodeError::MissingEvent)?;

        let message = match event {
            0..=3 => Message::Restore(serde_json::from_value(value)?),
            4..=10 => Message::Order(serde_json::from_value(value)?),
            other => return Err(DecodeError::UnknownEvent(other)),
        };
        message.validate(floors)?;

        Ok(message)
    }

    /// Encode for transmission.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing a message never fails")
    }

    /// The peer this message came from, when it names one.
    pub fn sender(&self) -> Option<PeerId> {
        match self {
            Self::Order(msg) => Some(msg.sender),
            Self::Restore(msg) => match msg.kind {
                RestoreKind::RequestingState => msg.asker,
                _ => msg.responder,
            },
        }
    }

    /// Check structural constraints beyond what decoding enforces.
    pub fn validate(&self, floors: usize) -> Result<(), DecodeError> {
        match self {
            Self::Order(msg) => {
                if msg.floor >= floors {
                    return Err(DecodeError::FloorOutOfRange(msg.floor));
                }
            }
            Self::Restore(msg) => {
                if let Some(floor) = msg.state.as_ref().map(|s| s.last_floor) {
                    if floor >= floors {
                        return Err(DecodeError::FloorOutOfRange(floor));
                    }
                }
                match msg.kind {
                    RestoreKind::IAmAlive => {
                        if msg.responder.is_none() || msg.state.is_none() {
                            return Err(DecodeError::Invalid("beacon without sender or state"));
                        }
                    }
                    RestoreKind::BackupState => {
                        if msg.responder.is_none() || msg.state.is_none() || msg.calls.is_none() {
                            return Err(DecodeError::Invalid("incomplete state backup"));
                        }
                    }
                    RestoreKind::RequestingState => {
                        if msg.asker.is_none() {
                            return Err(DecodeError::Invalid("state request without asker"));
                        }
                    }
                    RestoreKind::RestoredStateReturned => {
                        if msg.asker.is_none() || msg.responder.is_none() {
                            return Err(DecodeError::Invalid("restore reply without addresses"));
                        }
                        if msg.asker == msg.responder {
                            return Err(DecodeError::Invalid("restore reply echoed to its sender"));
                        }
                        if msg.state.is_none() || msg.calls.is_none() {
                            return Err(DecodeError::Invalid("incomplete restore reply"));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(n: u8) -> PeerId {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn test_order_message_codec() {
        let msg = Message::Order(OrderMessage {
            kind: OrderKind::NewOrder,
            floor: 2,
            button: HallButton::Down,
            assigned_to: peer(2),
            origin: peer(1),
            sender: peer(1),
        });
        let decoded = Message::decode(&msg.encode(), 4).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender(), Some(peer(1)));
    }

    #[test]
    fn test_restore_message_codec() {
        let msg = Message::Restore(RestoreMessage {
            kind: RestoreKind::BackupState,
            asker: None,
            responder: Some(peer(3)),
            state: Some(ElevState::new(peer(3), 1)),
            calls: Some(CallMap::new(4)),
        });
        let decoded = Message::decode(&msg.encode(), 4).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender(), Some(peer(3)));
    }

    #[test]
    fn test_event_tags_are_stable() {
        let msg = Message::Order(OrderMessage {
            kind: OrderKind::ReassignOrder,
            floor: 0,
            button: HallButton::Up,
            assigned_to: peer(1),
            origin: peer(1),
            sender: peer(1),
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();

        assert_eq!(value["event"], 10);
        assert_eq!(value["button"], 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json", 4),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode(b"{\"floor\": 1}", 4),
            Err(DecodeError::MissingEvent)
        ));
        assert!(matches!(
            Message::decode(b"{\"event\": 11}", 4),
            Err(DecodeError::UnknownEvent(11))
        ));
    }

    #[test]
    fn test_decode_rejects_out_of_range_floor() {
        let msg = Message::Order(OrderMessage {
            kind: OrderKind::NewOrder,
            floor: 7,
            button: HallButton::Up,
            assigned_to: peer(2),
            origin: peer(1),
            sender: peer(1),
        });
        assert!(matches!(
            Message::decode(&msg.encode(), 4),
            Err(DecodeError::FloorOutOfRange(7))
        ));
    }

    #[test]
    fn test_decode_rejects_echoed_restore_reply() {
        let msg = Message::Restore(RestoreMessage {
            kind: RestoreKind::RestoredStateReturned,
            asker: Some(peer(1)),
            responder: Some(peer(1)),
            state: Some(ElevState::new(peer(1), 0)),
            calls: Some(CallMap::new(4)),
        });
        assert!(Message::decode(&msg.encode(), 4).is_err());
    }
}
