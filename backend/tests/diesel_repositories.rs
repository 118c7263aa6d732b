//! Diesel identity and verification-code repositories against embedded
//! PostgreSQL.
//!
//! Each test owns a Tokio runtime and a freshly migrated database. Cluster
//! bootstrap is blocking, so it runs before the runtime is entered.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use identity_isolation::domain::ports::{
    IdentityRepository, IdentityRepositoryError, VerificationCodeRepository,
};
use identity_isolation::domain::{
    Contact, IdentityId, NewIdentity, PersistentUserId, ThreadId, VerificationCode,
    VerificationConfig, VerificationMethod, VerificationStatus,
};
use identity_isolation::outbound::persistence::{
    DbPool, DieselIdentityRepository, DieselVerificationCodeRepository, PoolConfig,
};
use pg_embedded_setup_unpriv::TemporaryDatabase;
use rstest::{fixture, rstest};
use tokio::runtime::Runtime;

mod support;

use support::{handle_cluster_setup_failure, provision_database, shared_cluster};

struct Database {
    runtime: Runtime,
    identities: DieselIdentityRepository,
    codes: DieselVerificationCodeRepository,
    _database: TemporaryDatabase,
}

fn setup_database() -> Result<Database, String> {
    let cluster = shared_cluster()?;
    let database = provision_database(cluster)?;
    let runtime = Runtime::new().map_err(|err| err.to_string())?;
    let config = PoolConfig::new(database.url())
        .with_max_size(2)
        .with_min_idle(Some(1));
    let pool = runtime
        .block_on(DbPool::new(config))
        .map_err(|err| err.to_string())?;
    Ok(Database {
        runtime,
        identities: DieselIdentityRepository::new(pool.clone()),
        codes: DieselVerificationCodeRepository::new(pool),
        _database: database,
    })
}

#[fixture]
fn database() -> Option<Database> {
    match setup_database() {
        Ok(database) => Some(database),
        Err(reason) => handle_cluster_setup_failure(reason),
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 12, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn thread(raw: &str) -> ThreadId {
    ThreadId::new(raw).expect("thread id")
}

fn email(raw: &str) -> Contact {
    Contact::new(VerificationMethod::Email, raw).expect("contact")
}

fn new_identity(raw: &str, created_at: DateTime<Utc>) -> NewIdentity {
    let thread_id = thread(raw);
    NewIdentity {
        identity_id: IdentityId::derive(&thread_id, thread_id.channel(), thread_id.identifier()),
        channel: thread_id.channel().to_owned(),
        identifier: thread_id.identifier().to_owned(),
        thread_id,
        created_at,
    }
}

fn code_for(raw: &str, code: &str, issued_at: DateTime<Utc>) -> VerificationCode {
    VerificationCode::issue(
        thread(raw),
        code.to_owned(),
        email("a@example.com"),
        VerificationMethod::Email,
        issued_at,
        &VerificationConfig::default(),
    )
}

#[rstest]
fn create_or_get_keeps_the_first_row(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let first = db
            .identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        let second = db
            .identities
            .create_or_get(&new_identity("telegram:111", at(5)))
            .await
            .expect("fetched");

        assert_eq!(first, second);
        assert_eq!(second.created_at, at(0));
        assert_eq!(second.verification_status, VerificationStatus::Anonymous);
    });
}

#[rstest]
fn identity_ids_are_unique_across_threads(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        db.identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        let mut clash = new_identity("telegram:222", at(1));
        clash.identity_id = IdentityId::derive(&thread("telegram:111"), "telegram", "111");

        let error = db
            .identities
            .create_or_get(&clash)
            .await
            .expect_err("duplicate identity id");

        assert!(matches!(error, IdentityRepositoryError::Conflict { .. }));
    });
}

#[rstest]
fn verified_rows_are_never_rewritten(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let thread_id = thread("telegram:111");
        db.identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        let owner = PersistentUserId::mint();
        db.identities
            .mark_verified(&thread_id, &owner, at(1))
            .await
            .expect("verified")
            .expect("row exists");

        let other = PersistentUserId::mint();
        let after_verify = db
            .identities
            .mark_verified(&thread_id, &other, at(2))
            .await
            .expect("guarded update")
            .expect("row exists");
        let after_pending = db
            .identities
            .mark_pending(&thread_id, VerificationMethod::Email, &email("b@example.com"))
            .await
            .expect("guarded update")
            .expect("row exists");
        let after_link = db
            .identities
            .link_to_user(&thread_id, &other, &thread("http:9"), at(3))
            .await
            .expect("guarded update")
            .expect("row exists");

        for row in [after_verify, after_pending, after_link] {
            assert_eq!(row.persistent_user_id.as_ref(), Some(&owner));
            assert_eq!(row.verified_at, Some(at(1)));
        }
    });
}

#[rstest]
fn linked_rows_do_not_vouch_for_their_contact(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let owner_thread = thread("telegram:111");
        let pulled_in = thread("http:222");
        for raw in ["telegram:111", "http:222"] {
            db.identities
                .create_or_get(&new_identity(raw, at(0)))
                .await
                .expect("created");
        }
        let owner = PersistentUserId::mint();
        db.identities
            .mark_pending(&owner_thread, VerificationMethod::Email, &email("a@example.com"))
            .await
            .expect("pending");
        db.identities
            .mark_verified(&owner_thread, &owner, at(1))
            .await
            .expect("verified");
        db.identities
            .mark_pending(&pulled_in, VerificationMethod::Email, &email("victim@example.com"))
            .await
            .expect("pending");

        let linked = db
            .identities
            .link_to_user(&pulled_in, &owner, &owner_thread, at(2))
            .await
            .expect("linked")
            .expect("row exists");

        assert!(linked.verification_contact.is_none());
        assert_eq!(linked.merged_into_thread_id.as_ref(), Some(&owner_thread));
        let by_victim = db
            .identities
            .find_verified_by_contact(&email("victim@example.com"))
            .await
            .expect("lookup");
        assert!(by_victim.is_none());
        let by_owner = db
            .identities
            .find_verified_by_contact(&email("a@example.com"))
            .await
            .expect("lookup")
            .expect("owner row");
        assert_eq!(by_owner.thread_id, owner_thread);
        let linked_threads = db
            .identities
            .list_by_persistent_user(&owner)
            .await
            .expect("listed");
        assert_eq!(linked_threads.len(), 2);
    });
}

#[rstest]
fn replacing_a_code_leaves_one_active(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let thread_id = thread("telegram:111");
        db.identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        db.codes
            .replace_active(&code_for("telegram:111", "AAA111", at(0)))
            .await
            .expect("first code");
        db.codes
            .replace_active(&code_for("telegram:111", "BBB222", at(1)))
            .await
            .expect("second code");

        let active = db
            .codes
            .find_active(&thread_id)
            .await
            .expect("lookup")
            .expect("active code");
        assert_eq!(active.code, "BBB222");
        let consumed_stale = db
            .codes
            .consume(&thread_id, "AAA111", &PersistentUserId::mint(), at(2))
            .await
            .expect("consume");
        assert!(!consumed_stale);
    });
}

#[rstest]
fn consumed_codes_can_be_reinstated_with_their_reservation(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let thread_id = thread("telegram:111");
        db.identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        db.codes
            .replace_active(&code_for("telegram:111", "AAA111", at(0)))
            .await
            .expect("issued");
        let reserved = PersistentUserId::mint();

        assert!(db
            .codes
            .consume(&thread_id, "AAA111", &reserved, at(1))
            .await
            .expect("consume"));
        assert!(!db
            .codes
            .consume(&thread_id, "AAA111", &PersistentUserId::mint(), at(1))
            .await
            .expect("replay"));
        assert!(db.codes.find_active(&thread_id).await.expect("lookup").is_none());

        assert!(db.codes.reinstate(&thread_id, "AAA111").await.expect("reinstate"));
        let active = db
            .codes
            .find_active(&thread_id)
            .await
            .expect("lookup")
            .expect("active again");
        assert_eq!(active.reserved_user_id.as_ref(), Some(&reserved));
    });
}

#[rstest]
fn issued_codes_store_a_carried_reservation(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        let thread_id = thread("telegram:111");
        db.identities
            .create_or_get(&new_identity("telegram:111", at(0)))
            .await
            .expect("created");
        let reserved = PersistentUserId::mint();
        let mut code = code_for("telegram:111", "AAA111", at(0));
        code.reserved_user_id = Some(reserved.clone());

        db.codes.replace_active(&code).await.expect("issued");

        let active = db
            .codes
            .find_active(&thread_id)
            .await
            .expect("lookup")
            .expect("active code");
        assert_eq!(active.reserved_user_id, Some(reserved));
    });
}

#[rstest]
fn purge_removes_only_expired_codes(database: Option<Database>) {
    let Some(db) = database else { return };
    db.runtime.block_on(async {
        for raw in ["telegram:111", "telegram:222"] {
            db.identities
                .create_or_get(&new_identity(raw, at(0)))
                .await
                .expect("created");
        }
        db.codes
            .replace_active(&code_for("telegram:111", "AAA111", at(0)))
            .await
            .expect("old code");
        db.codes
            .replace_active(&code_for("telegram:222", "BBB222", at(30)))
            .await
            .expect("fresh code");

        let purged = db
            .codes
            .purge_expired(at(0) + TimeDelta::minutes(20))
            .await
            .expect("purged");

        assert_eq!(purged, 1);
        assert!(db
            .codes
            .find_active(&thread("telegram:222"))
            .await
            .expect("lookup")
            .is_some());
    });
}
