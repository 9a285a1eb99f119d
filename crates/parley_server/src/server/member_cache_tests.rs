#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{GroupId, Role, UserId};

use crate::server::member_cache::MemberCache;
use crate::services::Services;
use crate::services::memory::MemoryBackend;

fn services_with(backend: Arc<MemoryBackend>) -> Services {
	Services {
		messages: backend.clone(),
		friends: backend.clone(),
		groups: backend,
		rpc_timeout: Duration::from_millis(500),
	}
}

fn group(id: &str) -> GroupId {
	GroupId::new(id).expect("valid group id")
}

async fn seeded_backend(g: &GroupId) -> Arc<MemoryBackend> {
	let backend = Arc::new(MemoryBackend::new());
	backend
		.create_group(g, &[(UserId(1), Role::Owner), (UserId(2), Role::Member)])
		.await;
	backend
}

#[tokio::test]
async fn repeated_resolves_hit_the_cache() {
	let g = group("g1");
	let backend = seeded_backend(&g).await;
	let cache = MemberCache::new(services_with(backend.clone()), Duration::from_secs(60));

	let first = cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(first.as_slice(), &[UserId(1), UserId(2)]);
	assert_eq!(backend.member_list_calls(), 1);

	let second = cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(second.as_slice(), first.as_slice());
	assert_eq!(backend.member_list_calls(), 1, "fresh entry must not refetch");
}

#[tokio::test]
async fn expired_entry_is_refetched() {
	let g = group("g1");
	let backend = seeded_backend(&g).await;
	let cache = MemberCache::new(services_with(backend.clone()), Duration::from_millis(20));

	cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(backend.member_list_calls(), 1);

	tokio::time::sleep(Duration::from_millis(40)).await;

	cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(backend.member_list_calls(), 2, "expired entry must refetch");
}

#[tokio::test]
async fn invalidate_forces_a_refetch() {
	let g = group("g1");
	let backend = seeded_backend(&g).await;
	let cache = MemberCache::new(services_with(backend.clone()), Duration::from_secs(60));

	cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(cache.len().await, 1);

	cache.invalidate(&g).await;
	assert_eq!(cache.len().await, 0);

	// Roster changed while the entry was invalid.
	backend.create_group(&g, &[(UserId(3), Role::Member)]).await;

	let members = cache.resolve_members(&g).await.expect("resolve");
	assert_eq!(members.as_slice(), &[UserId(1), UserId(2), UserId(3)]);
	assert_eq!(backend.member_list_calls(), 2);
}
