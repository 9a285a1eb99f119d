#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{MsgId, UserId};
use parley_protocol::frames::{
	AckFrame, AckStatus, ChatFrame, Envelope, ErrorFrame, GroupChatFrame, ReadReceipt, ReadReport, kind,
};
use tracing::{debug, warn};

use crate::server::connection::ConnectionHandle;
use crate::server::hub::Hub;
use crate::services::Services;
use crate::util::time::unix_ms_now;

/// Dispatches authenticated inbound envelopes by kind.
pub struct Router {
	hub: Arc<Hub>,
	services: Services,
}

impl Router {
	pub fn new(hub: Arc<Hub>, services: Services) -> Arc<Self> {
		Arc::new(Self { hub, services })
	}

	pub async fn handle_frame(&self, handle: &ConnectionHandle, env: Envelope) {
		let user = handle.user_id();

		match env.kind.as_str() {
			kind::PING => {
				handle.enqueue(Envelope::bare(kind::PONG));
			}
			// Reply to our own heartbeat; receipt already reset the liveness clock.
			kind::PONG => {}
			kind::CHAT => match env.decode_data::<ChatFrame>() {
				Ok(frame) => self.handle_chat(user, handle, frame).await,
				Err(e) => {
					warn!(%user, error = %e, "malformed chat frame");
					send_error(handle, None, "malformed chat frame");
				}
			},
			kind::GROUP_CHAT => match env.decode_data::<GroupChatFrame>() {
				Ok(frame) => self.handle_group_chat(user, handle, frame).await,
				Err(e) => {
					warn!(%user, error = %e, "malformed group chat frame");
					send_error(handle, None, "malformed group chat frame");
				}
			},
			kind::ACK => {
				// Client-side delivery confirmations are informational only.
				debug!(%user, "client ack received");
			}
			kind::READ => match env.decode_data::<ReadReport>() {
				Ok(report) => self.handle_read(user, handle, report).await,
				Err(e) => {
					warn!(%user, error = %e, "malformed read report");
					send_error(handle, None, "malformed read report");
				}
			},
			other => {
				metrics::counter!("parley_server_unknown_frames_total").increment(1);
				warn!(%user, kind = other, "dropping frame of unknown kind");
			}
		}
	}

	async fn handle_chat(&self, user: UserId, handle: &ConnectionHandle, mut frame: ChatFrame) {
		metrics::counter!("parley_server_chat_frames_total").increment(1);

		let msg_id = client_or_fresh_msg_id(frame.msg_id.as_deref());
		let to = frame.to_user_id;
		if frame.content_type <= 0 {
			frame.content_type = 1;
		}

		let persisted = self
			.services
			.call(
				self.services
					.messages
					.send_message(user, to, &msg_id, &frame.content, frame.content_type),
			)
			.await;

		let receipt = match persisted {
			Ok(receipt) => receipt,
			Err(e) => {
				warn!(%user, %to, error = %e, "private message persistence failed");
				send_ack(handle, msg_id.as_str(), AckStatus::Failed, Some("rpc_error"), unix_ms_now());
				send_error(handle, Some(msg_id.as_str()), "message could not be stored");
				return;
			}
		};

		send_ack(handle, msg_id.as_str(), AckStatus::Sent, None, receipt.created_at);

		// Sender identity always comes from the session, never the frame.
		frame.msg_id = Some(msg_id.as_str().to_string());
		frame.from_user_id = Some(user);
		frame.created_at = Some(receipt.created_at);

		let delivered = match Envelope::new(kind::CHAT, &frame) {
			Ok(env) => self.hub.send_to_user(to, env).await,
			Err(e) => {
				warn!(error = %e, "chat frame encode failed");
				false
			}
		};

		if delivered {
			send_ack(handle, msg_id.as_str(), AckStatus::Delivered, None, unix_ms_now());
		}
	}

	async fn handle_group_chat(&self, user: UserId, handle: &ConnectionHandle, mut frame: GroupChatFrame) {
		metrics::counter!("parley_server_group_chat_frames_total").increment(1);

		let msg_id = client_or_fresh_msg_id(frame.msg_id.as_deref());
		let group = frame.group_id.clone();
		if frame.content_type <= 0 {
			frame.content_type = 1;
		}

		// Authoritative check first; nothing is persisted for a rejected frame.
		let membership = match self.services.call(self.services.groups.check_membership(&group, user)).await {
			Ok(membership) => membership,
			Err(e) => {
				warn!(%user, %group, error = %e, "membership check failed");
				self.reject_group(handle, msg_id.as_str(), "check_failed");
				return;
			}
		};

		if !membership.is_member {
			self.reject_group(handle, msg_id.as_str(), "not_member");
			return;
		}
		if membership.muted {
			self.reject_group(handle, msg_id.as_str(), "muted");
			return;
		}
		if frame.at_user_ids.iter().any(|id| id.is_everyone())
			&& !membership.role.is_some_and(|role| role.can_at_all())
		{
			self.reject_group(handle, msg_id.as_str(), "at_all_denied");
			return;
		}

		let persisted = self
			.services
			.call(self.services.messages.send_group_message(
				user,
				&group,
				&msg_id,
				&frame.content,
				frame.content_type,
				&frame.at_user_ids,
			))
			.await;

		let receipt = match persisted {
			Ok(receipt) => receipt,
			Err(e) => {
				warn!(%user, %group, error = %e, "group message persistence failed");
				send_ack(handle, msg_id.as_str(), AckStatus::Failed, Some("rpc_error"), unix_ms_now());
				send_error(handle, Some(msg_id.as_str()), "message could not be stored");
				return;
			}
		};

		send_ack(handle, msg_id.as_str(), AckStatus::Sent, None, receipt.created_at);

		frame.msg_id = Some(msg_id.into_string());
		frame.from_user_id = Some(user);
		frame.created_at = Some(receipt.created_at);
		frame.seq = Some(receipt.seq);
		frame.is_at_me = false;

		match Envelope::new(kind::GROUP_CHAT, &frame) {
			Ok(env) => self.hub.send_to_group(group, env, Some(user)).await,
			Err(e) => warn!(error = %e, "group chat frame encode failed"),
		}
	}

	async fn handle_read(&self, user: UserId, handle: &ConnectionHandle, report: ReadReport) {
		let peer = report.peer_id;
		let result = self
			.services
			.call(self.services.messages.mark_as_read(user, peer, &report.msg_ids))
			.await;

		match result {
			Ok(affected) => {
				debug!(%user, %peer, affected, "read report applied");
				let receipt = ReadReceipt {
					user_id: user,
					timestamp: unix_ms_now(),
				};
				match Envelope::new(kind::READ, &receipt) {
					Ok(env) => {
						self.hub.send_to_user(peer, env).await;
					}
					Err(e) => warn!(error = %e, "read receipt encode failed"),
				}
			}
			Err(e) => {
				warn!(%user, %peer, error = %e, "read report persistence failed");
				send_error(handle, None, "read report could not be applied");
			}
		}
	}

	fn reject_group(&self, handle: &ConnectionHandle, msg_id: &str, reason: &str) {
		metrics::counter!("parley_server_group_rejections_total", "reason" => reason.to_string()).increment(1);
		send_ack(handle, msg_id, AckStatus::Failed, Some(reason), unix_ms_now());
		send_error(handle, Some(msg_id), reason);
	}
}

/// Keep a non-empty client-supplied message id, otherwise mint one.
fn client_or_fresh_msg_id(supplied: Option<&str>) -> MsgId {
	supplied
		.and_then(|id| MsgId::new(id).ok())
		.unwrap_or_else(MsgId::generate)
}

fn send_ack(handle: &ConnectionHandle, msg_id: &str, status: AckStatus, reason: Option<&str>, timestamp: i64) {
	let ack = AckFrame {
		msg_id: msg_id.to_string(),
		status,
		reason: reason.map(str::to_string),
		timestamp,
	};
	match Envelope::new(kind::ACK, &ack) {
		Ok(env) => {
			handle.enqueue(env);
		}
		Err(e) => warn!(error = %e, "ack frame encode failed"),
	}
}

fn send_error(handle: &ConnectionHandle, msg_id: Option<&str>, message: &str) {
	let frame = ErrorFrame {
		msg_id: msg_id.map(str::to_string),
		message: message.to_string(),
	};
	match Envelope::new(kind::ERROR, &frame) {
		Ok(env) => {
			handle.enqueue(env);
		}
		Err(e) => warn!(error = %e, "error frame encode failed"),
	}
}
