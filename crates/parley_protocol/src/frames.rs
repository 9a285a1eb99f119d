#![forbid(unsafe_code)]

use parley_domain::{GroupId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Frame kind strings carried in `Envelope.type`.
pub mod kind {
	pub const AUTH: &str = "auth";
	pub const CONNECTED: &str = "connected";
	pub const PING: &str = "ping";
	pub const PONG: &str = "pong";
	pub const CHAT: &str = "chat";
	pub const GROUP_CHAT: &str = "group_chat";
	pub const ACK: &str = "ack";
	pub const READ: &str = "read";
	pub const ERROR: &str = "error";
	pub const ONLINE: &str = "online";
	pub const OFFLINE: &str = "offline";
	pub const OFFLINE_SUMMARY: &str = "offline_summary";
}

/// Wire envelope: `{"type": ..., "data": ...}`.
///
/// `data` is kept as raw JSON so unknown kinds (bridge passthrough events)
/// can be forwarded without a typed struct for every event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: String,

	#[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
	pub data: serde_json::Value,
}

impl Envelope {
	/// Build an envelope from any serializable payload.
	pub fn new<T: Serialize>(kind: &str, data: &T) -> Result<Self, serde_json::Error> {
		Ok(Self {
			kind: kind.to_string(),
			data: serde_json::to_value(data)?,
		})
	}

	/// Build an envelope with no payload (`ping`/`pong`).
	pub fn bare(kind: &str) -> Self {
		Self {
			kind: kind.to_string(),
			data: serde_json::Value::Null,
		}
	}

	/// Decode the payload into a typed frame struct.
	pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_value(self.data.clone())
	}
}

/// First inbound frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
	pub token: String,
}

/// Sent once after successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedFrame {
	pub user_id: UserId,
	pub online_count: usize,
}

/// Private chat message. Inbound frames omit the server-filled fields;
/// outbound frames carry all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub msg_id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from_user_id: Option<UserId>,

	pub to_user_id: UserId,

	pub content: String,

	#[serde(default)]
	pub content_type: i32,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<i64>,
}

/// Group chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub msg_id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from_user_id: Option<UserId>,

	pub group_id: GroupId,

	pub content: String,

	#[serde(default)]
	pub content_type: i32,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_at: Option<i64>,

	/// Per-group delivery sequence, assigned at persistence time.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seq: Option<i64>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub at_user_ids: Vec<UserId>,

	#[serde(default)]
	pub is_at_me: bool,
}

impl GroupChatFrame {
	/// Whether the mention list targets `user`, explicitly or via "everyone".
	pub fn mentions(&self, user: UserId) -> bool {
		self.at_user_ids.iter().any(|id| id.is_everyone() || *id == user)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
	Sent,
	Delivered,
	Read,
	Failed,
}

/// Delivery acknowledgement for a message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
	pub msg_id: String,

	pub status: AckStatus,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,

	pub timestamp: i64,
}

/// Inbound read report: the sender has read messages from `peer_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReport {
	pub peer_id: UserId,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub msg_ids: Vec<String>,
}

/// Outbound read receipt delivered to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
	pub user_id: UserId,
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub msg_id: Option<String>,

	pub message: String,
}

/// `online` / `offline` presence notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceFrame {
	pub user_id: UserId,
	pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineKind {
	Private,
	Group,
}

/// Announces a batch of offline messages about to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSummaryFrame {
	pub total_count: usize,
	pub push_count: usize,
	pub has_more: bool,
	pub remain_count: usize,
	pub message_type: OfflineKind,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_wire_shape() {
		let env = Envelope::new(
			kind::ACK,
			&AckFrame {
				msg_id: "m1".to_string(),
				status: AckStatus::Sent,
				reason: None,
				timestamp: 1_700_000_000_000,
			},
		)
		.expect("build envelope");

		let json = serde_json::to_value(&env).expect("to_value");
		assert_eq!(json["type"], "ack");
		assert_eq!(json["data"]["msgId"], "m1");
		assert_eq!(json["data"]["status"], "sent");
		assert!(json["data"].get("reason").is_none());
	}

	#[test]
	fn bare_envelope_omits_data() {
		let json = serde_json::to_string(&Envelope::bare(kind::PONG)).expect("to_string");
		assert_eq!(json, r#"{"type":"pong"}"#);

		let parsed: Envelope = serde_json::from_str(r#"{"type":"ping"}"#).expect("parse");
		assert_eq!(parsed.kind, kind::PING);
		assert!(parsed.data.is_null());
	}

	#[test]
	fn chat_frame_camel_case_fields() {
		let parsed: ChatFrame = serde_json::from_str(r#"{"toUserId":7,"content":"hi"}"#).expect("parse");
		assert_eq!(parsed.to_user_id, UserId(7));
		assert_eq!(parsed.content, "hi");
		assert_eq!(parsed.content_type, 0);
		assert!(parsed.msg_id.is_none());
		assert!(parsed.from_user_id.is_none());
	}

	#[test]
	fn group_chat_mentions_explicit_and_everyone() {
		let mut frame: GroupChatFrame =
			serde_json::from_str(r#"{"groupId":"g1","content":"x","atUserIds":[3,4]}"#).expect("parse");
		assert!(frame.mentions(UserId(3)));
		assert!(!frame.mentions(UserId(9)));

		frame.at_user_ids = vec![UserId::AT_ALL];
		assert!(frame.mentions(UserId(9)));
	}

	#[test]
	fn decode_data_typed() {
		let env: Envelope = serde_json::from_str(r#"{"type":"read","data":{"peerId":12,"msgIds":["a","b"]}}"#).expect("parse");
		assert_eq!(env.kind, kind::READ);

		let report: ReadReport = env.decode_data().expect("decode read report");
		assert_eq!(report.peer_id, UserId(12));
		assert_eq!(report.msg_ids, vec!["a".to_string(), "b".to_string()]);
	}

	#[test]
	fn offline_summary_message_type_strings() {
		let json = serde_json::to_value(OfflineKind::Private).expect("to_value");
		assert_eq!(json, "private");
		let json = serde_json::to_value(OfflineKind::Group).expect("to_value");
		assert_eq!(json, "group");
	}
}
