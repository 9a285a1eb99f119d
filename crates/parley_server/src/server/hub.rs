#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::{GroupId, UserId};
use parley_protocol::frames::{Envelope, PresenceFrame, kind};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

use crate::server::connection::{ConnectionHandle, Enqueue};
use crate::server::member_cache::MemberCache;
use crate::services::Services;
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct HubConfig {
	pub fanout_workers: usize,
	pub fanout_queue_capacity: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			fanout_workers: 4,
			fanout_queue_capacity: 256,
		}
	}
}

enum HubCommand {
	Register { handle: ConnectionHandle },
	Unregister { conn_id: u64, user_id: UserId },
}

enum FanoutJob {
	Group {
		group: GroupId,
		envelope: Envelope,
		exclude: Option<UserId>,
	},
	Presence {
		user_id: UserId,
		online: bool,
	},
}

/// Session registry: at most one live connection per user.
///
/// The client map is read-mostly; all mutations funnel through the owner
/// loop so register/unregister ordering is serialized. Group fanout and
/// presence notifications run on a small worker pool so a slow membership
/// lookup never blocks the routing path.
pub struct Hub {
	clients: RwLock<HashMap<UserId, ConnectionHandle>>,
	control_tx: mpsc::Sender<HubCommand>,
	fanout_tx: mpsc::Sender<FanoutJob>,
}

impl Hub {
	pub fn new(cfg: HubConfig, services: Services, member_cache: Arc<MemberCache>) -> Arc<Self> {
		let (control_tx, control_rx) = mpsc::channel(64);
		let (fanout_tx, fanout_rx) = mpsc::channel(cfg.fanout_queue_capacity);

		let hub = Arc::new(Self {
			clients: RwLock::new(HashMap::new()),
			control_tx,
			fanout_tx,
		});

		tokio::spawn(owner_loop(Arc::clone(&hub), control_rx));

		let fanout_rx = Arc::new(Mutex::new(fanout_rx));
		for worker in 0..cfg.fanout_workers.max(1) {
			tokio::spawn(fanout_worker(
				worker,
				Arc::clone(&hub),
				services.clone(),
				Arc::clone(&member_cache),
				Arc::clone(&fanout_rx),
			));
		}

		hub
	}

	pub async fn register(&self, handle: ConnectionHandle) {
		let _ = self.control_tx.send(HubCommand::Register { handle }).await;
	}

	pub async fn unregister(&self, conn_id: u64, user_id: UserId) {
		let _ = self.control_tx.send(HubCommand::Unregister { conn_id, user_id }).await;
	}

	pub async fn is_online(&self, user_id: UserId) -> bool {
		self.clients.read().await.contains_key(&user_id)
	}

	pub async fn online_count(&self) -> usize {
		self.clients.read().await.len()
	}

	/// Enqueue an envelope for one user. Returns `false` when the user is
	/// offline or the frame could not be queued. A full queue tears the
	/// connection down: the consumer has stopped draining.
	pub async fn send_to_user(&self, user_id: UserId, envelope: Envelope) -> bool {
		let handle = match self.clients.read().await.get(&user_id) {
			Some(handle) => handle.clone(),
			None => return false,
		};

		match handle.enqueue(envelope) {
			Enqueue::Accepted => true,
			Enqueue::Full => {
				metrics::counter!("parley_server_send_queue_full_disconnects_total").increment(1);
				warn!(%user_id, conn_id = handle.conn_id(), "outbound queue full; disconnecting slow consumer");
				handle.close();
				let _ = self.control_tx.try_send(HubCommand::Unregister {
					conn_id: handle.conn_id(),
					user_id,
				});
				false
			}
			Enqueue::Closed => false,
		}
	}

	/// Fan an envelope out to every connected group member, optionally
	/// excluding one user (usually the sender).
	pub async fn send_to_group(&self, group: GroupId, envelope: Envelope, exclude: Option<UserId>) {
		let job = FanoutJob::Group { group, envelope, exclude };
		if self.fanout_tx.send(job).await.is_err() {
			warn!("fanout workers gone; dropping group envelope");
		}
	}

	/// Relay an out-of-band group event (join, leave, dismiss, ...) to the
	/// group's connected members as-is.
	pub async fn notify_group_event(&self, group: GroupId, kind: &str, data: serde_json::Value) {
		let envelope = Envelope {
			kind: kind.to_string(),
			data,
		};
		self.send_to_group(group, envelope, None).await;
	}
}

async fn owner_loop(hub: Arc<Hub>, mut control_rx: mpsc::Receiver<HubCommand>) {
	while let Some(cmd) = control_rx.recv().await {
		match cmd {
			HubCommand::Register { handle } => {
				let user_id = handle.user_id();
				let conn_id = handle.conn_id();

				let old = {
					let mut clients = hub.clients.write().await;
					clients.insert(user_id, handle)
				};

				if let Some(old) = old {
					if old.conn_id() != conn_id {
						// Same user reconnected elsewhere; the newest session wins.
						metrics::counter!("parley_server_sessions_superseded_total").increment(1);
						debug!(%user_id, old_conn = old.conn_id(), new_conn = conn_id, "superseding session");
						old.close();
					}
				} else {
					metrics::gauge!("parley_server_registered_users").increment(1.0);
				}

				// Friends hear about every register, a superseding one included.
				let _ = hub.fanout_tx.try_send(FanoutJob::Presence { user_id, online: true });
			}
			HubCommand::Unregister { conn_id, user_id } => {
				let removed = {
					let mut clients = hub.clients.write().await;
					match clients.get(&user_id) {
						// A newer session may have replaced this entry already.
						Some(current) if current.conn_id() == conn_id => clients.remove(&user_id),
						_ => None,
					}
				};

				if let Some(handle) = removed {
					handle.close();
					metrics::gauge!("parley_server_registered_users").decrement(1.0);
					let _ = hub.fanout_tx.try_send(FanoutJob::Presence { user_id, online: false });
				}
			}
		}
	}
}

async fn fanout_worker(
	worker: usize,
	hub: Arc<Hub>,
	services: Services,
	member_cache: Arc<MemberCache>,
	fanout_rx: Arc<Mutex<mpsc::Receiver<FanoutJob>>>,
) {
	loop {
		let job = {
			let mut rx = fanout_rx.lock().await;
			rx.recv().await
		};
		let Some(job) = job else { return };

		match job {
			FanoutJob::Group { group, envelope, exclude } => {
				let members = match member_cache.resolve_members(&group).await {
					Ok(members) => members,
					Err(e) => {
						warn!(worker, %group, error = %e, "member resolve failed; dropping fanout job");
						continue;
					}
				};

				for member in members.iter().copied() {
					if Some(member) == exclude {
						continue;
					}
					hub.send_to_user(member, envelope.clone()).await;
				}
			}
			FanoutJob::Presence { user_id, online } => {
				let friends = match services.call(services.friends.friend_list(user_id)).await {
					Ok(friends) => friends,
					Err(e) => {
						warn!(worker, %user_id, error = %e, "friend list fetch failed; skipping presence notify");
						continue;
					}
				};

				let frame = PresenceFrame {
					user_id,
					timestamp: unix_ms_now(),
				};
				let event_kind = if online { kind::ONLINE } else { kind::OFFLINE };
				let envelope = match Envelope::new(event_kind, &frame) {
					Ok(envelope) => envelope,
					Err(e) => {
						warn!(worker, error = %e, "presence frame encode failed");
						continue;
					}
				};

				for friend in friends {
					if friend.blocked {
						continue;
					}
					hub.send_to_user(friend.friend_id, envelope.clone()).await;
				}
			}
		}
	}
}
