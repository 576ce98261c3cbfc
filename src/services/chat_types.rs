use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::chat_connection::ConnectionState;
use crate::error::{ChatError, Result};

// ── Wire sentinels ─────────────────────────────────────────────

/// `content` of a presence frame.
pub const PRESENCE_CONTENT: &str = "status_update";
/// `content` of a delivery receipt.
pub const DELIVERED_CONTENT: &str = "delivered";
/// `content` of a read receipt.
pub const READ_CONTENT: &str = "read";

pub const DELIVERY_ID_PREFIX: &str = "delivery_";
pub const READ_ID_PREFIX: &str = "read_";

/// Whether `content` collides with a control sentinel and would be misread as one.
pub fn is_reserved_content(content: &str) -> bool {
    matches!(content, PRESENCE_CONTENT | DELIVERED_CONTENT | READ_CONTENT)
}

// ── Stored types ───────────────────────────────────────────────

/// Delivery state of a message. Ordered: a message only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as stored and shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// New outbound message with a fresh id, stamped now.
    pub fn new(from_id: &str, to_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.from_id, &self.to_id)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.from_id == user_id || self.to_id == user_id
    }

    /// Move the status forward. Returns false (and changes nothing) for
    /// backward or same-state transitions.
    pub fn advance(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }
}

/// Canonical key of a two-party conversation: the participant ids in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    low: String,
    high: String,
}

impl ConversationKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The other participant, if `user_id` is one of the two.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }

    /// File stem used by the on-disk message log. Distinct keys never share a stem.
    pub(crate) fn file_stem(&self) -> String {
        format!(
            "msg_{}_to_{}",
            encode_file_component(&self.low),
            encode_file_component(&self.high)
        )
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Known local identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub last_active_at: DateTime<Utc>,
}

/// Someone a local user recently talked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentContact {
    pub user_id: String,
    pub last_interaction_at: DateTime<Utc>,
}

// ── Wire protocol types ────────────────────────────────────────

/// Acknowledgement of a data message, addressed back to its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Id of the acknowledged message, prefix stripped.
    pub message_id: String,
    /// The acknowledging party.
    pub from_id: String,
    /// The original sender.
    pub to_id: String,
}

/// One decoded transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Message),
    DeliveryReceipt(Receipt),
    ReadReceipt(Receipt),
    Presence { user_id: String, online: bool },
}

/// JSON shape shared by every frame on the socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from_id: String,
    #[serde(default)]
    to_id: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default)]
    delivered: bool,
    #[serde(default)]
    read_status: bool,
}

impl WireFrame {
    fn receipt(id: String, receipt: &Receipt, content: &str, status: MessageStatus) -> Self {
        Self {
            id,
            from_id: receipt.from_id.clone(),
            to_id: receipt.to_id.clone(),
            content: content.to_string(),
            timestamp: Some(Utc::now().to_rfc3339()),
            status: Some(status.as_str().to_string()),
            delivered: true,
            read_status: status == MessageStatus::Read,
        }
    }

    /// Explicit `status` wins; otherwise fall back to the legacy booleans.
    fn message_status(&self) -> MessageStatus {
        if let Some(status) = self.status.as_deref().and_then(MessageStatus::parse) {
            return status;
        }
        if self.read_status {
            MessageStatus::Read
        } else if self.delivered {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }
}

impl Frame {
    /// Decode a text frame, classifying it by its `content` sentinel.
    pub fn decode(text: &str) -> Result<Frame> {
        let wire: WireFrame = serde_json::from_str(text)
            .map_err(|e| ChatError::InvalidMessage(format!("Parse frame: {}", e)))?;

        match wire.content.as_str() {
            PRESENCE_CONTENT => Ok(Frame::Presence {
                user_id: wire.from_id,
                online: wire.status.as_deref() == Some("online"),
            }),
            DELIVERED_CONTENT => Ok(Frame::DeliveryReceipt(Receipt {
                message_id: strip_id_prefix(&wire.id, DELIVERY_ID_PREFIX),
                from_id: wire.from_id,
                to_id: wire.to_id,
            })),
            READ_CONTENT => Ok(Frame::ReadReceipt(Receipt {
                message_id: strip_id_prefix(&wire.id, READ_ID_PREFIX),
                from_id: wire.from_id,
                to_id: wire.to_id,
            })),
            _ => {
                if wire.id.is_empty() {
                    return Err(ChatError::InvalidMessage(
                        "Data frame without id".to_string(),
                    ));
                }
                let status = wire.message_status();
                let timestamp = match wire.timestamp.as_deref() {
                    Some(ts) => DateTime::parse_from_rfc3339(ts)
                        .map_err(|e| {
                            ChatError::InvalidMessage(format!("Bad timestamp on {}: {}", wire.id, e))
                        })?
                        .with_timezone(&Utc),
                    None => Utc::now(),
                };
                Ok(Frame::Data(Message {
                    id: wire.id,
                    from_id: wire.from_id,
                    to_id: wire.to_id,
                    content: wire.content,
                    timestamp,
                    status,
                }))
            }
        }
    }

    /// Encode for the socket. Receipts are stamped with the current time.
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Frame::Data(msg) => WireFrame {
                id: msg.id.clone(),
                from_id: msg.from_id.clone(),
                to_id: msg.to_id.clone(),
                content: msg.content.clone(),
                timestamp: Some(msg.timestamp.to_rfc3339()),
                status: Some(msg.status.as_str().to_string()),
                delivered: msg.status >= MessageStatus::Delivered,
                read_status: msg.status == MessageStatus::Read,
            },
            Frame::DeliveryReceipt(r) => WireFrame::receipt(
                format!("{}{}", DELIVERY_ID_PREFIX, r.message_id),
                r,
                DELIVERED_CONTENT,
                MessageStatus::Delivered,
            ),
            Frame::ReadReceipt(r) => WireFrame::receipt(
                format!("{}{}", READ_ID_PREFIX, r.message_id),
                r,
                READ_CONTENT,
                MessageStatus::Read,
            ),
            Frame::Presence { user_id, online } => WireFrame {
                id: format!("status_{}", user_id),
                from_id: user_id.clone(),
                to_id: String::new(),
                content: PRESENCE_CONTENT.to_string(),
                timestamp: None,
                status: Some(if *online { "online" } else { "offline" }.to_string()),
                delivered: false,
                read_status: false,
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

fn strip_id_prefix(id: &str, prefix: &str) -> String {
    id.strip_prefix(prefix).unwrap_or(id).to_string()
}

// ── Host-facing events ─────────────────────────────────────────

/// Notifications pushed to the host UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    MessageReceived {
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        message_id: String,
        status: MessageStatus,
    },
    #[serde(rename_all = "camelCase")]
    DeliveryFailed {
        message_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        user_id: String,
        online: bool,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
}

/// Percent-encode an id for use in a file name. `_` is escaped as well so
/// the `_to_` separator of conversation files only ever appears once.
pub(crate) fn encode_file_component(id: &str) -> String {
    urlencoding::encode(id).replace('_', "%5F")
}
