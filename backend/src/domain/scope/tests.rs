//! Tests for scope resolution.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rstest::{fixture, rstest};

use super::*;
use crate::domain::ports::MockRootProvisioner;
use crate::domain::{ErrorCode, PersistentUserId};
use crate::outbound::memory::InMemoryIdentityRepository;
use crate::test_support::MutableClock;

fn thread(raw: &str) -> ThreadId {
    ThreadId::new(raw).expect("valid thread id")
}

fn group(raw: &str) -> GroupId {
    GroupId::new(raw).expect("valid group id")
}

#[fixture]
fn registry() -> IdentityRegistry {
    IdentityRegistry::new(
        Arc::new(InMemoryIdentityRepository::default()),
        Arc::new(MutableClock::new(Utc::now())),
    )
}

fn resolver_with(
    registry: IdentityRegistry,
    admins: AdminAllowList,
    provisioner: MockRootProvisioner,
) -> ScopeResolver {
    ScopeResolver::new(
        registry,
        StorageLayout::new("data"),
        admins,
        Arc::new(provisioner),
    )
}

fn idle_provisioner() -> MockRootProvisioner {
    let mut provisioner = MockRootProvisioner::new();
    provisioner.expect_ensure().times(0);
    provisioner
}

#[rstest]
#[tokio::test]
async fn group_context_resolves_to_group_root(registry: IdentityRegistry) {
    let resolver = resolver_with(registry, AdminAllowList::default(), idle_provisioner());
    let thread_id = thread("telegram:111");

    let in_group = resolver
        .resolve(&RequestContext::new(thread_id.clone()).with_group(group("eng")))
        .await
        .expect("group scope");
    assert_eq!(in_group.kind(), ScopeKind::Group);
    assert_eq!(in_group.root(), PathBuf::from("data/groups/eng"));

    let direct = resolver
        .resolve(&RequestContext::new(thread_id))
        .await
        .expect("user scope");
    assert_eq!(direct.kind(), ScopeKind::User);
    assert_eq!(direct.root(), PathBuf::from("data/users/anon_telegram_111"));
}

#[rstest]
#[tokio::test]
async fn shared_request_ignores_thread_and_group(registry: IdentityRegistry) {
    let resolver = resolver_with(registry, AdminAllowList::default(), idle_provisioner());
    let context = RequestContext::new(thread("telegram:111"))
        .with_group(group("eng"))
        .with_scope(ScopeRequest::Shared);

    let resolved = resolver.resolve(&context).await.expect("shared scope");
    assert_eq!(resolved.kind(), ScopeKind::Shared);
    assert_eq!(resolved.root(), PathBuf::from("data/shared"));
}

#[rstest]
#[case::group(RequestContext::new(thread("telegram:111")).with_group(group("eng")))]
#[case::shared(RequestContext::new(thread("telegram:111")).with_scope(ScopeRequest::Shared))]
#[tokio::test]
async fn every_scope_registers_the_thread(
    registry: IdentityRegistry,
    #[case] context: RequestContext,
) {
    let resolver = resolver_with(registry.clone(), AdminAllowList::default(), idle_provisioner());

    resolver.resolve(&context).await.expect("resolved");

    let identity = registry
        .resolve(context.thread_id())
        .await
        .expect("thread registered");
    assert_eq!(identity.identity_id.as_ref(), "anon_telegram_111");
}

#[rstest]
#[tokio::test]
async fn resolution_is_stable_until_verification(registry: IdentityRegistry) {
    let resolver = resolver_with(registry.clone(), AdminAllowList::default(), idle_provisioner());
    let thread_id = thread("telegram:111");
    let context = RequestContext::new(thread_id.clone());

    let first = resolver.resolve(&context).await.expect("first");
    let second = resolver.resolve(&context).await.expect("second");
    assert_eq!(first, second);

    let persistent = PersistentUserId::mint();
    registry
        .mark_verified(&thread_id, &persistent)
        .await
        .expect("verified");
    let after = resolver.resolve(&context).await.expect("after verify");
    assert_eq!(after.key(), persistent.as_ref());
    assert_eq!(after.root(), PathBuf::from("data/users").join(persistent.as_ref()));
}

#[rstest]
#[tokio::test]
async fn shared_write_without_admin_is_denied(registry: IdentityRegistry) {
    let resolver = resolver_with(registry, AdminAllowList::default(), idle_provisioner());
    let context = RequestContext::new(thread("telegram:111")).with_scope(ScopeRequest::Shared);

    let error = resolver
        .prepare_write(&context)
        .await
        .expect_err("non-admin shared write");
    assert_eq!(error.code(), ErrorCode::PermissionDenied);
}

#[rstest]
#[tokio::test]
async fn admin_shared_write_provisions_shared_root(registry: IdentityRegistry) {
    let mut provisioner = MockRootProvisioner::new();
    provisioner
        .expect_ensure()
        .withf(|scope| scope.kind() == ScopeKind::Shared)
        .times(1)
        .returning(|_| Ok(()));
    let admins = AdminAllowList::new([thread("telegram:1")]);
    let resolver = resolver_with(registry, admins, provisioner);
    let context = RequestContext::new(thread("telegram:1")).with_scope(ScopeRequest::Shared);

    let resolved = resolver.prepare_write(&context).await.expect("admin write");
    assert_eq!(resolved.root(), PathBuf::from("data/shared"));
}

#[rstest]
#[tokio::test]
async fn provisioning_runs_off_the_async_thread(registry: IdentityRegistry) {
    let caller = std::thread::current().id();
    let mut provisioner = MockRootProvisioner::new();
    provisioner
        .expect_ensure()
        .times(1)
        .returning(move |_| {
            assert_ne!(std::thread::current().id(), caller);
            Ok(())
        });
    let resolver = resolver_with(registry, AdminAllowList::default(), provisioner);

    resolver
        .prepare_write(&RequestContext::new(thread("telegram:111")))
        .await
        .expect("provisioned");
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_is_internal(registry: IdentityRegistry) {
    let mut provisioner = MockRootProvisioner::new();
    provisioner
        .expect_ensure()
        .times(1)
        .returning(|_| Err(RootProvisionerError::io("read-only file system")));
    let resolver = resolver_with(registry, AdminAllowList::default(), provisioner);

    let error = resolver
        .prepare_write(&RequestContext::new(thread("telegram:111")))
        .await
        .expect_err("provisioning fails");
    assert_eq!(error.code(), ErrorCode::InternalError);
}

#[rstest]
#[case("eng", true)]
#[case("team.alpha-1_b", true)]
#[case("", false)]
#[case(".hidden", false)]
#[case("..", false)]
#[case("a/b", false)]
fn group_ids_are_directory_safe(#[case] raw: &str, #[case] valid: bool) {
    assert_eq!(GroupId::new(raw).is_ok(), valid);
}

#[rstest]
fn category_directories_follow_layout() {
    let scope = ResolvedScope::new(ScopeKind::Group, "eng", PathBuf::from("data/groups/eng"));
    let dirs: Vec<_> = StorageCategory::ALL
        .iter()
        .map(|category| scope.category_dir(*category))
        .collect();
    assert_eq!(
        dirs,
        vec![
            PathBuf::from("data/groups/eng/files"),
            PathBuf::from("data/groups/eng/db"),
            PathBuf::from("data/groups/eng/vs"),
            PathBuf::from("data/groups/eng/mem"),
        ]
    );
    assert_eq!(
        scope.manifest_path(),
        PathBuf::from("data/groups/eng/manifest.json")
    );
}

#[rstest]
fn admin_list_skips_invalid_entries() {
    let admins = AdminAllowList::parse_csv(" telegram:1 ,\u{7},,sms:2");
    assert_eq!(admins.len(), 2);
    assert!(admins.is_admin(&thread("sms:2")));
    assert!(!admins.is_admin(&thread("telegram:3")));
}
