#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parley_domain::{GroupId, MsgId, Role, UserId};
use tokio::sync::Mutex;

use super::{
	FriendEntry, FriendService, GroupMessage, GroupSendReceipt, GroupService, JoinedGroup, Membership, MessageService,
	PrivateMessage, SendReceipt, ServiceError, ServiceResult,
};
use crate::util::time::unix_ms_now;

/// In-memory stand-in for the external message/friend/group services.
///
/// Used for local development (no collaborator deployment required) and as
/// the test double for router/offline tests. Call counters let tests assert
/// which collaborator calls were (not) made.
#[derive(Default)]
pub struct MemoryBackend {
	state: Mutex<State>,
	fail_sends: AtomicBool,

	send_message_calls: AtomicU64,
	send_group_message_calls: AtomicU64,
	check_membership_calls: AtomicU64,
	member_list_calls: AtomicU64,
	friend_list_calls: AtomicU64,
	mark_as_read_calls: AtomicU64,
}

#[derive(Default)]
struct State {
	private_log: Vec<PrivateMessage>,
	/// msg ids already read, keyed by `(owner, peer)`.
	read_ids: HashMap<(UserId, UserId), HashSet<String>>,
	friends: HashMap<UserId, Vec<FriendEntry>>,
	groups: HashMap<GroupId, GroupState>,
}

#[derive(Default)]
struct GroupState {
	roles: HashMap<UserId, Role>,
	muted: HashSet<UserId>,
	next_seq: i64,
	log: Vec<GroupMessage>,
	read_seq: HashMap<UserId, i64>,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make subsequent persistence calls fail with a remote error.
	pub fn set_fail_sends(&self, fail: bool) {
		self.fail_sends.store(fail, Ordering::Relaxed);
	}

	/// Seed a bidirectional friendship.
	pub async fn add_friends(&self, a: UserId, b: UserId) {
		let mut st = self.state.lock().await;
		st.friends.entry(a).or_default().push(FriendEntry { friend_id: b, blocked: false });
		st.friends.entry(b).or_default().push(FriendEntry { friend_id: a, blocked: false });
	}

	/// Seed a blocked friendship edge (as seen from `owner`).
	pub async fn add_blocked_friend(&self, owner: UserId, blocked: UserId) {
		let mut st = self.state.lock().await;
		st.friends.entry(owner).or_default().push(FriendEntry {
			friend_id: blocked,
			blocked: true,
		});
	}

	/// Seed a group with the given members and roles.
	pub async fn create_group(&self, group: &GroupId, members: &[(UserId, Role)]) {
		let mut st = self.state.lock().await;
		let entry = st.groups.entry(group.clone()).or_default();
		for (user, role) in members {
			entry.roles.insert(*user, *role);
		}
	}

	pub async fn mute_member(&self, group: &GroupId, user: UserId) {
		let mut st = self.state.lock().await;
		if let Some(entry) = st.groups.get_mut(group) {
			entry.muted.insert(user);
		}
	}

	pub fn send_message_calls(&self) -> u64 {
		self.send_message_calls.load(Ordering::Relaxed)
	}
	pub fn send_group_message_calls(&self) -> u64 {
		self.send_group_message_calls.load(Ordering::Relaxed)
	}
	pub fn check_membership_calls(&self) -> u64 {
		self.check_membership_calls.load(Ordering::Relaxed)
	}
	pub fn member_list_calls(&self) -> u64 {
		self.member_list_calls.load(Ordering::Relaxed)
	}
	pub fn friend_list_calls(&self) -> u64 {
		self.friend_list_calls.load(Ordering::Relaxed)
	}
	pub fn mark_as_read_calls(&self) -> u64 {
		self.mark_as_read_calls.load(Ordering::Relaxed)
	}

	pub async fn read_seq_for(&self, group: &GroupId, user: UserId) -> i64 {
		let st = self.state.lock().await;
		st.groups
			.get(group)
			.and_then(|g| g.read_seq.get(&user).copied())
			.unwrap_or(0)
	}

	fn check_fail(&self) -> ServiceResult<()> {
		if self.fail_sends.load(Ordering::Relaxed) {
			return Err(ServiceError::Remote("injected persistence failure".to_string()));
		}
		Ok(())
	}
}

#[async_trait]
impl MessageService for MemoryBackend {
	async fn send_message(
		&self,
		from: UserId,
		to: UserId,
		msg_id: &MsgId,
		content: &str,
		content_type: i32,
	) -> ServiceResult<SendReceipt> {
		self.send_message_calls.fetch_add(1, Ordering::Relaxed);
		self.check_fail()?;

		let created_at = unix_ms_now();
		let mut st = self.state.lock().await;
		st.private_log.push(PrivateMessage {
			msg_id: msg_id.clone(),
			from_user_id: from,
			to_user_id: to,
			content: content.to_string(),
			content_type,
			created_at,
		});
		Ok(SendReceipt { created_at })
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
		self.send_group_message_calls.fetch_add(1, Ordering::Relaxed);
		self.check_fail()?;

		let created_at = unix_ms_now();
		let mut st = self.state.lock().await;
		let entry = st.groups.entry(group.clone()).or_default();
		entry.next_seq += 1;
		let seq = entry.next_seq;
		entry.log.push(GroupMessage {
			msg_id: msg_id.clone(),
			from_user_id: from,
			group_id: group.clone(),
			content: content.to_string(),
			content_type,
			created_at,
			seq,
			at_user_ids: at_user_ids.to_vec(),
		});
		Ok(GroupSendReceipt { created_at, seq })
	}

	async fn unread_messages(&self, user: UserId, peer: UserId) -> ServiceResult<Vec<PrivateMessage>> {
		let st = self.state.lock().await;
		let read = st.read_ids.get(&(user, peer));
		Ok(st
			.private_log
			.iter()
			.filter(|m| {
				m.to_user_id == user
					&& m.from_user_id == peer
					&& !read.is_some_and(|ids| ids.contains(m.msg_id.as_str()))
			})
			.cloned()
			.collect())
	}

	async fn group_messages_after(&self, group: &GroupId, after_seq: i64) -> ServiceResult<Vec<GroupMessage>> {
		let st = self.state.lock().await;
		Ok(st
			.groups
			.get(group)
			.map(|g| g.log.iter().filter(|m| m.seq > after_seq).cloned().collect())
			.unwrap_or_default())
	}

	async fn mark_as_read(&self, user: UserId, peer: UserId, msg_ids: &[String]) -> ServiceResult<u64> {
		self.mark_as_read_calls.fetch_add(1, Ordering::Relaxed);
		self.check_fail()?;

		let mut st = self.state.lock().await;
		let candidates: Vec<String> = if msg_ids.is_empty() {
			st.private_log
				.iter()
				.filter(|m| m.to_user_id == user && m.from_user_id == peer)
				.map(|m| m.msg_id.as_str().to_string())
				.collect()
		} else {
			msg_ids.to_vec()
		};

		let read = st.read_ids.entry((user, peer)).or_default();
		let mut affected = 0;
		for id in candidates {
			if read.insert(id) {
				affected += 1;
			}
		}
		Ok(affected)
	}
}

#[async_trait]
impl FriendService for MemoryBackend {
	async fn friend_list(&self, user: UserId) -> ServiceResult<Vec<FriendEntry>> {
		self.friend_list_calls.fetch_add(1, Ordering::Relaxed);
		let st = self.state.lock().await;
		Ok(st.friends.get(&user).cloned().unwrap_or_default())
	}
}

#[async_trait]
impl GroupService for MemoryBackend {
	async fn check_membership(&self, group: &GroupId, user: UserId) -> ServiceResult<Membership> {
		self.check_membership_calls.fetch_add(1, Ordering::Relaxed);
		let st = self.state.lock().await;
		let Some(entry) = st.groups.get(group) else {
			return Ok(Membership {
				is_member: false,
				role: None,
				muted: false,
			});
		};

		Ok(Membership {
			is_member: entry.roles.contains_key(&user),
			role: entry.roles.get(&user).copied(),
			muted: entry.muted.contains(&user),
		})
	}

	async fn joined_groups(&self, user: UserId) -> ServiceResult<Vec<JoinedGroup>> {
		let st = self.state.lock().await;
		Ok(st
			.groups
			.iter()
			.filter(|(_, g)| g.roles.contains_key(&user))
			.map(|(id, g)| JoinedGroup {
				group_id: id.clone(),
				read_seq: g.read_seq.get(&user).copied().unwrap_or(0),
			})
			.collect())
	}

	async fn member_list(&self, group: &GroupId) -> ServiceResult<Vec<UserId>> {
		self.member_list_calls.fetch_add(1, Ordering::Relaxed);
		let st = self.state.lock().await;
		let mut members: Vec<UserId> = st
			.groups
			.get(group)
			.map(|g| g.roles.keys().copied().collect())
			.unwrap_or_default();
		members.sort();
		Ok(members)
	}

	async fn report_read_seq(&self, group: &GroupId, user: UserId, seq: i64) -> ServiceResult<()> {
		let mut st = self.state.lock().await;
		let entry = st.groups.entry(group.clone()).or_default();
		let current = entry.read_seq.entry(user).or_insert(0);
		if seq > *current {
			*current = seq;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn group(id: &str) -> GroupId {
		GroupId::new(id).expect("valid group id")
	}

	#[tokio::test]
	async fn group_seq_is_monotonic_per_group() {
		let backend = MemoryBackend::new();
		let g1 = group("g1");
		let g2 = group("g2");

		let a = backend
			.send_group_message(UserId(1), &g1, &MsgId::generate(), "one", 1, &[])
			.await
			.expect("send");
		let b = backend
			.send_group_message(UserId(1), &g1, &MsgId::generate(), "two", 1, &[])
			.await
			.expect("send");
		let other = backend
			.send_group_message(UserId(1), &g2, &MsgId::generate(), "first in g2", 1, &[])
			.await
			.expect("send");

		assert_eq!(a.seq, 1);
		assert_eq!(b.seq, 2);
		assert_eq!(other.seq, 1);
	}

	#[tokio::test]
	async fn read_seq_keeps_maximum_in_either_order() {
		let backend = MemoryBackend::new();
		let g = group("g1");
		let user = UserId(5);

		backend.report_read_seq(&g, user, 3).await.expect("report");
		backend.report_read_seq(&g, user, 7).await.expect("report");
		assert_eq!(backend.read_seq_for(&g, user).await, 7);

		// Stale report arriving late must not move the value backwards.
		backend.report_read_seq(&g, user, 5).await.expect("report");
		assert_eq!(backend.read_seq_for(&g, user).await, 7);
	}

	#[tokio::test]
	async fn mark_as_read_without_ids_clears_peer_backlog() {
		let backend = MemoryBackend::new();
		let (alice, bob) = (UserId(1), UserId(2));

		for n in 0..3 {
			backend
				.send_message(bob, alice, &MsgId::generate(), &format!("m{n}"), 1)
				.await
				.expect("send");
		}
		assert_eq!(backend.unread_messages(alice, bob).await.expect("unread").len(), 3);

		let affected = backend.mark_as_read(alice, bob, &[]).await.expect("mark");
		assert_eq!(affected, 3);
		assert!(backend.unread_messages(alice, bob).await.expect("unread").is_empty());
	}

	#[tokio::test]
	async fn injected_failure_propagates() {
		let backend = MemoryBackend::new();
		backend.set_fail_sends(true);

		let err = backend
			.send_message(UserId(1), UserId(2), &MsgId::generate(), "x", 1)
			.await
			.unwrap_err();
		assert!(matches!(err, ServiceError::Remote(_)));
	}
}
