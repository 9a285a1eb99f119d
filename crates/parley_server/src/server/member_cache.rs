#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{GroupId, UserId};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::services::{ServiceResult, Services};

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

struct CacheEntry {
	members: Arc<Vec<UserId>>,
	expires_at: Instant,
}

/// TTL cache over [`crate::services::GroupService::member_list`].
///
/// Group rosters change rarely compared to how often fanout reads them, so
/// entries live for a long TTL and are dropped eagerly when the bridge
/// relays a membership-changing event.
pub struct MemberCache {
	services: Services,
	ttl: Duration,
	entries: RwLock<HashMap<GroupId, CacheEntry>>,
}

impl MemberCache {
	pub fn new(services: Services, ttl: Duration) -> Self {
		Self {
			services,
			ttl,
			entries: RwLock::new(HashMap::new()),
		}
	}

	/// Resolve the member list, consulting the authoritative service on a
	/// miss or an expired entry.
	pub async fn resolve_members(&self, group: &GroupId) -> ServiceResult<Arc<Vec<UserId>>> {
		{
			let entries = self.entries.read().await;
			if let Some(entry) = entries.get(group)
				&& entry.expires_at > Instant::now()
			{
				metrics::counter!("parley_server_member_cache_hits_total").increment(1);
				return Ok(Arc::clone(&entry.members));
			}
		}

		metrics::counter!("parley_server_member_cache_misses_total").increment(1);
		let members = Arc::new(self.services.call(self.services.groups.member_list(group)).await?);

		let mut entries = self.entries.write().await;
		entries.insert(
			group.clone(),
			CacheEntry {
				members: Arc::clone(&members),
				expires_at: Instant::now() + self.ttl,
			},
		);
		Ok(members)
	}

	/// Drop the cached roster so the next fanout refetches it.
	pub async fn invalidate(&self, group: &GroupId) {
		if self.entries.write().await.remove(group).is_some() {
			debug!(%group, "member cache entry invalidated");
		}
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	/// Periodically evict entries whose TTL lapsed without being touched.
	pub fn spawn_pruner(self: &Arc<Self>) {
		let cache = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;

				let now = Instant::now();
				let mut entries = cache.entries.write().await;
				let before = entries.len();
				entries.retain(|_, entry| entry.expires_at > now);
				let evicted = before - entries.len();
				if evicted > 0 {
					debug!(evicted, "pruned expired member cache entries");
				}
			}
		});
	}
}
