#![forbid(unsafe_code)]

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_domain::{GroupId, MsgId, Role, UserId};
use thiserror::Error;

/// Errors surfaced by collaborator-service calls.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error("call timed out after {0:?}")]
	Timeout(Duration),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("remote error: {0}")]
	Remote(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A persisted private message.
#[derive(Debug, Clone, PartialEq)]
pub struct PrivateMessage {
	pub msg_id: MsgId,
	pub from_user_id: UserId,
	pub to_user_id: UserId,
	pub content: String,
	pub content_type: i32,
	pub created_at: i64,
}

/// A persisted group message with its delivery sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessage {
	pub msg_id: MsgId,
	pub from_user_id: UserId,
	pub group_id: GroupId,
	pub content: String,
	pub content_type: i32,
	pub created_at: i64,
	pub seq: i64,
	pub at_user_ids: Vec<UserId>,
}

/// Result of persisting a private message.
#[derive(Debug, Clone, Copy)]
pub struct SendReceipt {
	pub created_at: i64,
}

/// Result of persisting a group message.
#[derive(Debug, Clone, Copy)]
pub struct GroupSendReceipt {
	pub created_at: i64,
	pub seq: i64,
}

/// Authoritative membership answer for one `(group, user)` pair.
#[derive(Debug, Clone, Copy)]
pub struct Membership {
	pub is_member: bool,
	pub role: Option<Role>,
	pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendEntry {
	pub friend_id: UserId,
	/// Blocked friendships are excluded from presence and offline pushes.
	pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedGroup {
	pub group_id: GroupId,
	/// Highest group sequence this user has confirmed reading.
	pub read_seq: i64,
}

/// Message persistence collaborator.
#[async_trait]
pub trait MessageService: Send + Sync {
	async fn send_message(
		&self,
		from: UserId,
		to: UserId,
		msg_id: &MsgId,
		content: &str,
		content_type: i32,
	) -> ServiceResult<SendReceipt>;

	async fn send_group_message(
		&self,
		from: UserId,
		group: &GroupId,
		msg_id: &MsgId,
		content: &str,
		content_type: i32,
		at_user_ids: &[UserId],
	) -> ServiceResult<GroupSendReceipt>;

	/// Unread private messages sent by `peer` to `user`, oldest first.
	async fn unread_messages(&self, user: UserId, peer: UserId) -> ServiceResult<Vec<PrivateMessage>>;

	/// Group messages with `seq` strictly greater than `after_seq`.
	async fn group_messages_after(&self, group: &GroupId, after_seq: i64) -> ServiceResult<Vec<GroupMessage>>;

	/// Mark private messages from `peer` as read. An empty id list means
	/// "everything from that peer". Returns the number of rows affected.
	async fn mark_as_read(&self, user: UserId, peer: UserId, msg_ids: &[String]) -> ServiceResult<u64>;
}

/// Friend-graph collaborator.
#[async_trait]
pub trait FriendService: Send + Sync {
	async fn friend_list(&self, user: UserId) -> ServiceResult<Vec<FriendEntry>>;
}

/// Group-membership collaborator.
#[async_trait]
pub trait GroupService: Send + Sync {
	async fn check_membership(&self, group: &GroupId, user: UserId) -> ServiceResult<Membership>;

	async fn joined_groups(&self, user: UserId) -> ServiceResult<Vec<JoinedGroup>>;

	async fn member_list(&self, group: &GroupId) -> ServiceResult<Vec<UserId>>;

	/// Advance the user's read sequence for a group. Implementations keep
	/// the stored value monotonic: a stale (lower) report is a no-op.
	async fn report_read_seq(&self, group: &GroupId, user: UserId, seq: i64) -> ServiceResult<()>;
}

/// Bundle of collaborator clients plus the shared client-side call timeout.
#[derive(Clone)]
pub struct Services {
	pub messages: Arc<dyn MessageService>,
	pub friends: Arc<dyn FriendService>,
	pub groups: Arc<dyn GroupService>,
	pub rpc_timeout: Duration,
}

impl Services {
	/// Wrap a collaborator call in the configured timeout.
	pub async fn call<T, F>(&self, fut: F) -> ServiceResult<T>
	where
		F: Future<Output = ServiceResult<T>>,
	{
		match tokio::time::timeout(self.rpc_timeout, fut).await {
			Ok(res) => res,
			Err(_) => Err(ServiceError::Timeout(self.rpc_timeout)),
		}
	}
}
