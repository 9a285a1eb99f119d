#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use parley_domain::{GroupId, MsgId, Role, SecretString, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
	FriendEntry, FriendService, GroupMessage, GroupSendReceipt, GroupService, JoinedGroup, Membership, MessageService,
	PrivateMessage, SendReceipt, ServiceError, ServiceResult,
};

/// Header carrying the shared secret for internal service calls.
pub const SHARED_SECRET_HEADER: &str = "X-Parley-Internal-Secret";

/// HTTP clients for the message, friend and group services.
///
/// Every method is a JSON POST against the owning service; responses use
/// the `{code, message, data}` internal-API shape with `code == 0` on
/// success.
pub struct HttpBackend {
	client: reqwest::Client,
	message_url: String,
	friend_url: String,
	group_url: String,
	shared_secret: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
	code: i32,
	#[serde(default)]
	message: String,
	data: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageReq<'a> {
	msg_id: &'a str,
	from_user_id: UserId,
	to_user_id: UserId,
	content: &'a str,
	content_type: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendGroupMessageReq<'a> {
	msg_id: &'a str,
	from_user_id: UserId,
	group_id: &'a str,
	content: &'a str,
	content_type: i32,
	at_user_ids: &'a [UserId],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResp {
	created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendGroupMessageResp {
	created_at: i64,
	seq: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserPeerReq {
	user_id: UserId,
	peer_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadReq<'a> {
	user_id: UserId,
	peer_id: UserId,
	msg_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResp {
	affected: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupAfterReq<'a> {
	group_id: &'a str,
	after_seq: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserReq {
	user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupReq<'a> {
	group_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupUserReq<'a> {
	group_id: &'a str,
	user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportReadSeqReq<'a> {
	group_id: &'a str,
	user_id: UserId,
	seq: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateMessageDto {
	msg_id: String,
	from_user_id: UserId,
	to_user_id: UserId,
	content: String,
	#[serde(default)]
	content_type: i32,
	created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupMessageDto {
	msg_id: String,
	from_user_id: UserId,
	group_id: String,
	content: String,
	#[serde(default)]
	content_type: i32,
	created_at: i64,
	seq: i64,
	#[serde(default)]
	at_user_ids: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendEntryDto {
	friend_id: UserId,
	#[serde(default)]
	blocked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipDto {
	is_member: bool,
	#[serde(default)]
	role: i32,
	#[serde(default)]
	muted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinedGroupDto {
	group_id: String,
	#[serde(default)]
	read_seq: i64,
}

impl HttpBackend {
	pub fn new(
		message_url: String,
		friend_url: String,
		group_url: String,
		shared_secret: Option<SecretString>,
		request_timeout: Duration,
	) -> ServiceResult<Self> {
		let client = reqwest::Client::builder()
			.timeout(request_timeout)
			.build()
			.map_err(|e| ServiceError::Transport(e.to_string()))?;

		Ok(Self {
			client,
			message_url: message_url.trim_end_matches('/').to_string(),
			friend_url: friend_url.trim_end_matches('/').to_string(),
			group_url: group_url.trim_end_matches('/').to_string(),
			shared_secret,
		})
	}

	async fn post<B: Serialize, T: DeserializeOwned>(&self, base: &str, path: &str, body: &B) -> ServiceResult<T> {
		let url = format!("{base}{path}");
		debug!(%url, "service call");

		let mut req = self.client.post(&url).json(body);
		if let Some(secret) = self.shared_secret.as_ref() {
			req = req.header(SHARED_SECRET_HEADER, secret.expose());
		}

		let resp = req.send().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
		let status = resp.status();
		if !status.is_success() {
			return Err(ServiceError::Remote(format!("{url}: http status {status}")));
		}

		let parsed: ApiResponse<T> = resp.json().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
		if parsed.code != 0 {
			return Err(ServiceError::Remote(format!("{url}: code={} {}", parsed.code, parsed.message)));
		}

		parsed
			.data
			.ok_or_else(|| ServiceError::Remote(format!("{url}: missing response data")))
	}

	/// POST where the caller only cares about `code == 0`.
	async fn post_expect_ok<B: Serialize>(&self, base: &str, path: &str, body: &B) -> ServiceResult<()> {
		let url = format!("{base}{path}");
		debug!(%url, "service call");

		let mut req = self.client.post(&url).json(body);
		if let Some(secret) = self.shared_secret.as_ref() {
			req = req.header(SHARED_SECRET_HEADER, secret.expose());
		}

		let resp = req.send().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
		let status = resp.status();
		if !status.is_success() {
			return Err(ServiceError::Remote(format!("{url}: http status {status}")));
		}

		let parsed: ApiResponse<serde_json::Value> = resp.json().await.map_err(|e| ServiceError::Transport(e.to_string()))?;
		if parsed.code != 0 {
			return Err(ServiceError::Remote(format!("{url}: code={} {}", parsed.code, parsed.message)));
		}
		Ok(())
	}
}

fn parse_msg_id(raw: String) -> ServiceResult<MsgId> {
	MsgId::new(raw).map_err(|e| ServiceError::Remote(format!("bad msg id in response: {e}")))
}

fn parse_group_id(raw: String) -> ServiceResult<GroupId> {
	GroupId::new(raw).map_err(|e| ServiceError::Remote(format!("bad group id in response: {e}")))
}

#[async_trait]
impl MessageService for HttpBackend {
	async fn send_message(
		&self,
		from: UserId,
		to: UserId,
		msg_id: &MsgId,
		content: &str,
		content_type: i32,
	) -> ServiceResult<SendReceipt> {
		let resp: SendMessageResp = self
			.post(
				&self.message_url,
				"/internal/message/send",
				&SendMessageReq {
					msg_id: msg_id.as_str(),
					from_user_id: from,
					to_user_id: to,
					content,
					content_type,
				},
			)
			.await?;
		Ok(SendReceipt {
			created_at: resp.created_at,
		})
	}

	async fn send_group_message(
		&self,
		from: UserId,
		group: &GroupId,
		msg_id: &MsgId,
		content: &str,
		content_type: i32,
		at_user_ids: &[UserId],
	) -> ServiceResult<GroupSendReceipt> {
		let resp: SendGroupMessageResp = self
			.post(
				&self.message_url,
				"/internal/message/send_group",
				&SendGroupMessageReq {
					msg_id: msg_id.as_str(),
					from_user_id: from,
					group_id: group.as_str(),
					content,
					content_type,
					at_user_ids,
				},
			)
			.await?;
		Ok(GroupSendReceipt {
			created_at: resp.created_at,
			seq: resp.seq,
		})
	}

	async fn unread_messages(&self, user: UserId, peer: UserId) -> ServiceResult<Vec<PrivateMessage>> {
		let dtos: Vec<PrivateMessageDto> = self
			.post(
				&self.message_url,
				"/internal/message/unread",
				&UserPeerReq {
					user_id: user,
					peer_id: peer,
				},
			)
			.await?;

		dtos.into_iter()
			.map(|dto| {
				Ok(PrivateMessage {
					msg_id: parse_msg_id(dto.msg_id)?,
					from_user_id: dto.from_user_id,
					to_user_id: dto.to_user_id,
					content: dto.content,
					content_type: dto.content_type,
					created_at: dto.created_at,
				})
			})
			.collect()
	}

	async fn group_messages_after(&self, group: &GroupId, after_seq: i64) -> ServiceResult<Vec<GroupMessage>> {
		let dtos: Vec<GroupMessageDto> = self
			.post(
				&self.message_url,
				"/internal/message/group_after",
				&GroupAfterReq {
					group_id: group.as_str(),
					after_seq,
				},
			)
			.await?;

		dtos.into_iter()
			.map(|dto| {
				Ok(GroupMessage {
					msg_id: parse_msg_id(dto.msg_id)?,
					from_user_id: dto.from_user_id,
					group_id: parse_group_id(dto.group_id)?,
					content: dto.content,
					content_type: dto.content_type,
					created_at: dto.created_at,
					seq: dto.seq,
					at_user_ids: dto.at_user_ids,
				})
			})
			.collect()
	}

	async fn mark_as_read(&self, user: UserId, peer: UserId, msg_ids: &[String]) -> ServiceResult<u64> {
		let resp: MarkReadResp = self
			.post(
				&self.message_url,
				"/internal/message/mark_read",
				&MarkReadReq {
					user_id: user,
					peer_id: peer,
					msg_ids,
				},
			)
			.await?;
		Ok(resp.affected)
	}
}

#[async_trait]
impl FriendService for HttpBackend {
	async fn friend_list(&self, user: UserId) -> ServiceResult<Vec<FriendEntry>> {
		let dtos: Vec<FriendEntryDto> = self
			.post(&self.friend_url, "/internal/friend/list", &UserReq { user_id: user })
			.await?;
		Ok(dtos
			.into_iter()
			.map(|dto| FriendEntry {
				friend_id: dto.friend_id,
				blocked: dto.blocked,
			})
			.collect())
	}
}

#[async_trait]
impl GroupService for HttpBackend {
	async fn check_membership(&self, group: &GroupId, user: UserId) -> ServiceResult<Membership> {
		let dto: MembershipDto = self
			.post(
				&self.group_url,
				"/internal/group/check_membership",
				&GroupUserReq {
					group_id: group.as_str(),
					user_id: user,
				},
			)
			.await?;
		Ok(Membership {
			is_member: dto.is_member,
			role: Role::from_code(dto.role),
			muted: dto.muted,
		})
	}

	async fn joined_groups(&self, user: UserId) -> ServiceResult<Vec<JoinedGroup>> {
		let dtos: Vec<JoinedGroupDto> = self
			.post(&self.group_url, "/internal/group/joined", &UserReq { user_id: user })
			.await?;

		dtos.into_iter()
			.map(|dto| {
				Ok(JoinedGroup {
					group_id: parse_group_id(dto.group_id)?,
					read_seq: dto.read_seq,
				})
			})
			.collect()
	}

	async fn member_list(&self, group: &GroupId) -> ServiceResult<Vec<UserId>> {
		self.post(&self.group_url, "/internal/group/members", &GroupReq { group_id: group.as_str() })
			.await
	}

	async fn report_read_seq(&self, group: &GroupId, user: UserId, seq: i64) -> ServiceResult<()> {
		self.post_expect_ok(
			&self.group_url,
			"/internal/group/report_read_seq",
			&ReportReadSeqReq {
				group_id: group.as_str(),
				user_id: user,
				seq,
			},
		)
		.await
	}
}
