#![forbid(unsafe_code)]

use std::time::Duration;

use parley_protocol::frames::{ChatFrame, Envelope, GroupChatFrame, OfflineKind, OfflineSummaryFrame, kind};
use tracing::{debug, warn};

use crate::server::connection::{ConnectionHandle, Enqueue};
use crate::services::{GroupMessage, PrivateMessage, Services};

/// Gap between queued backlog frames, so a large backlog does not land as
/// one burst on a freshly woken client.
const PUSH_PACING: Duration = Duration::from_millis(5);

/// Replay the user's backlog onto a fresh session: private messages first,
/// then group messages. Runs detached so registration never waits on the
/// collaborator services.
pub fn spawn_offline_push(services: Services, handle: ConnectionHandle, limit: usize) {
	tokio::spawn(async move {
		push_private_backlog(&services, &handle, limit).await;
		if handle.is_closed() {
			return;
		}
		push_group_backlog(&services, &handle, limit).await;
	});
}

async fn push_private_backlog(services: &Services, handle: &ConnectionHandle, limit: usize) {
	let user = handle.user_id();

	let friends = match services.call(services.friends.friend_list(user)).await {
		Ok(friends) => friends,
		Err(e) => {
			warn!(%user, error = %e, "friend list fetch failed; skipping private backlog");
			return;
		}
	};

	let mut backlog: Vec<PrivateMessage> = Vec::new();
	for friend in friends {
		if friend.blocked {
			continue;
		}
		match services.call(services.messages.unread_messages(user, friend.friend_id)).await {
			Ok(mut messages) => backlog.append(&mut messages),
			// One unreachable peer never blocks the rest of the replay.
			Err(e) => warn!(%user, peer = %friend.friend_id, error = %e, "unread fetch failed; skipping peer"),
		}
	}

	if backlog.is_empty() {
		return;
	}

	backlog.sort_by_key(|m| m.created_at);
	let total = backlog.len();
	let push: Vec<PrivateMessage> = trim_to_newest(backlog, limit);

	if !send_summary(handle, total, push.len(), OfflineKind::Private) {
		return;
	}

	for message in push {
		let frame = ChatFrame {
			msg_id: Some(message.msg_id.into_string()),
			from_user_id: Some(message.from_user_id),
			to_user_id: message.to_user_id,
			content: message.content,
			content_type: message.content_type,
			created_at: Some(message.created_at),
		};
		if !enqueue_frame(handle, kind::CHAT, &frame) {
			return;
		}
		tokio::time::sleep(PUSH_PACING).await;
	}

	debug!(%user, "private backlog replayed");
}

async fn push_group_backlog(services: &Services, handle: &ConnectionHandle, limit: usize) {
	let user = handle.user_id();

	let groups = match services.call(services.groups.joined_groups(user)).await {
		Ok(groups) => groups,
		Err(e) => {
			warn!(%user, error = %e, "joined groups fetch failed; skipping group backlog");
			return;
		}
	};

	let mut backlog: Vec<GroupMessage> = Vec::new();
	for joined in groups {
		match services
			.call(services.messages.group_messages_after(&joined.group_id, joined.read_seq))
			.await
		{
			Ok(messages) => backlog.extend(messages.into_iter().filter(|m| m.from_user_id != user)),
			Err(e) => warn!(%user, group = %joined.group_id, error = %e, "group backlog fetch failed; skipping group"),
		}
	}

	if backlog.is_empty() {
		return;
	}

	// Stable order across groups; seq breaks created-at ties within a group.
	backlog.sort_by_key(|m| (m.created_at, m.seq));
	let total = backlog.len();
	let push: Vec<GroupMessage> = trim_to_newest(backlog, limit);

	if !send_summary(handle, total, push.len(), OfflineKind::Group) {
		return;
	}

	for message in push {
		let mut frame = GroupChatFrame {
			msg_id: Some(message.msg_id.into_string()),
			from_user_id: Some(message.from_user_id),
			group_id: message.group_id,
			content: message.content,
			content_type: message.content_type,
			created_at: Some(message.created_at),
			seq: Some(message.seq),
			at_user_ids: message.at_user_ids,
			is_at_me: false,
		};
		frame.is_at_me = frame.mentions(user);
		if !enqueue_frame(handle, kind::GROUP_CHAT, &frame) {
			return;
		}
		tokio::time::sleep(PUSH_PACING).await;
	}

	debug!(%user, "group backlog replayed");
	// Read sequences only move on an explicit client read report, so a
	// replay that the client never renders is pushed again next session.
}

/// Keep the newest `limit` entries of an ascending-sorted backlog, still in
/// ascending order.
fn trim_to_newest<T>(mut backlog: Vec<T>, limit: usize) -> Vec<T> {
	if backlog.len() > limit {
		backlog.drain(..backlog.len() - limit);
	}
	backlog
}

fn send_summary(handle: &ConnectionHandle, total: usize, push: usize, message_type: OfflineKind) -> bool {
	let summary = OfflineSummaryFrame {
		total_count: total,
		push_count: push,
		has_more: total > push,
		remain_count: total - push,
		message_type,
	};
	enqueue_frame(handle, kind::OFFLINE_SUMMARY, &summary)
}

fn enqueue_frame<T: serde::Serialize>(handle: &ConnectionHandle, frame_kind: &str, frame: &T) -> bool {
	let env = match Envelope::new(frame_kind, frame) {
		Ok(env) => env,
		Err(e) => {
			warn!(error = %e, "offline frame encode failed");
			return false;
		}
	};

	match handle.enqueue(env) {
		Enqueue::Accepted => true,
		Enqueue::Full => {
			metrics::counter!("parley_server_send_queue_full_disconnects_total").increment(1);
			warn!(user = %handle.user_id(), "outbound queue full during backlog replay; disconnecting");
			handle.close();
			false
		}
		Enqueue::Closed => false,
	}
}
