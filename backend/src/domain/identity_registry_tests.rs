//! Tests for the identity registry service.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rstest::{fixture, rstest};

use super::*;
use crate::domain::ErrorCode;
use crate::domain::VerificationStatus;
use crate::domain::ports::MockIdentityRepository;
use crate::outbound::memory::InMemoryIdentityRepository;
use crate::test_support::MutableClock;

fn thread(raw: &str) -> ThreadId {
    ThreadId::new(raw).expect("valid thread id")
}

fn email(raw: &str) -> Contact {
    Contact::new(VerificationMethod::Email, raw).expect("valid contact")
}

#[fixture]
fn clock() -> Arc<MutableClock> {
    let start = Utc
        .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .expect("valid timestamp");
    Arc::new(MutableClock::new(start))
}

fn registry(clock: Arc<MutableClock>) -> IdentityRegistry {
    IdentityRegistry::new(Arc::new(InMemoryIdentityRepository::default()), clock)
}

#[rstest]
#[tokio::test]
async fn create_or_get_is_idempotent(clock: Arc<MutableClock>) {
    let registry = registry(clock.clone());
    let thread_id = thread("telegram:111");

    let first = registry.ensure(&thread_id).await.expect("first call");
    clock.advance_seconds(30);
    let second = registry.ensure(&thread_id).await.expect("second call");

    assert_eq!(first, second);
    assert_eq!(first.identity_id.as_ref(), "anon_telegram_111");
    assert_eq!(first.verification_status, VerificationStatus::Anonymous);
}

#[rstest]
#[tokio::test]
async fn resolve_unknown_thread_is_not_found(clock: Arc<MutableClock>) {
    let registry = registry(clock);
    let error = registry
        .resolve(&thread("telegram:404"))
        .await
        .expect_err("unknown thread");
    assert_eq!(error.code(), ErrorCode::NotFound);
}

#[rstest]
#[tokio::test]
async fn mark_pending_reports_already_verified(clock: Arc<MutableClock>) {
    let registry = registry(clock);
    let thread_id = thread("telegram:111");
    let contact = email("a@example.com");
    registry.ensure(&thread_id).await.expect("identity");

    let outcome = registry
        .mark_pending(&thread_id, VerificationMethod::Email, &contact)
        .await
        .expect("pending");
    assert!(matches!(outcome, MarkPendingOutcome::Pending(ref identity)
        if identity.verification_status == VerificationStatus::Pending));

    let persistent = PersistentUserId::mint();
    registry
        .mark_verified(&thread_id, &persistent)
        .await
        .expect("verified");

    let outcome = registry
        .mark_pending(&thread_id, VerificationMethod::Email, &contact)
        .await
        .expect("already verified is not an error");
    assert_eq!(outcome, MarkPendingOutcome::AlreadyVerified(persistent));
}

#[rstest]
#[tokio::test]
async fn verified_identity_keeps_its_persistent_user(clock: Arc<MutableClock>) {
    let registry = registry(clock);
    let thread_id = thread("telegram:111");
    registry.ensure(&thread_id).await.expect("identity");

    let first = PersistentUserId::mint();
    registry
        .mark_verified(&thread_id, &first)
        .await
        .expect("verified");
    let again = registry
        .mark_verified(&thread_id, &PersistentUserId::mint())
        .await
        .expect("second verification");

    assert_eq!(again.persistent_user_id, Some(first));
}

#[rstest]
#[tokio::test]
async fn lists_threads_linked_to_a_user(clock: Arc<MutableClock>) {
    let registry = registry(clock);
    let owner = thread("telegram:111");
    let other = thread("sms:+447700900123");
    let stranger = thread("telegram:999");
    for id in [&owner, &other, &stranger] {
        registry.ensure(id).await.expect("identity");
    }

    let persistent = PersistentUserId::mint();
    registry
        .mark_verified(&owner, &persistent)
        .await
        .expect("verified");
    let linked = registry
        .link_to_user(&other, &persistent, &owner)
        .await
        .expect("linked");
    assert_eq!(linked.merged_into_thread_id, Some(owner.clone()));

    let threads: Vec<_> = registry
        .list_threads_for_user(&persistent)
        .await
        .expect("list")
        .into_iter()
        .map(|identity| identity.thread_id)
        .collect();
    assert_eq!(threads, vec![owner, other]);
}

#[rstest]
#[case(
    IdentityRepositoryError::connection("refused"),
    ErrorCode::ServiceUnavailable
)]
#[case(IdentityRepositoryError::query("syntax"), ErrorCode::InternalError)]
#[case(IdentityRepositoryError::conflict("duplicate"), ErrorCode::InternalError)]
#[tokio::test]
async fn repository_errors_map_to_domain_codes(
    clock: Arc<MutableClock>,
    #[case] failure: IdentityRepositoryError,
    #[case] expected: ErrorCode,
) {
    let mut repository = MockIdentityRepository::new();
    repository
        .expect_find_by_thread()
        .times(1)
        .return_once(move |_| Err(failure));
    let registry = IdentityRegistry::new(Arc::new(repository), clock);

    let error = registry
        .resolve(&thread("telegram:111"))
        .await
        .expect_err("repository failure");
    assert_eq!(error.code(), expected);
}
