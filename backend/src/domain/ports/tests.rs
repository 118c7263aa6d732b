//! Regression coverage for port error helpers.
use super::*;
use crate::domain::StorageCategory;
use rstest::rstest;

#[rstest]
#[case(StorageMergeError::io(StorageCategory::Database, "disk full"), true)]
#[case(StorageMergeError::conflict(StorageCategory::Files, "a.txt"), false)]
#[case(StorageMergeError::manifest("EROFS"), true)]
fn only_io_merge_failures_are_retryable(
    #[case] error: StorageMergeError,
    #[case] retryable: bool,
) {
    assert_eq!(error.is_retryable(), retryable);
}

#[rstest]
fn merge_errors_name_their_category() {
    let error = StorageMergeError::io(StorageCategory::VectorStore, "EIO");
    assert_eq!(error.category(), Some(StorageCategory::VectorStore));
    assert_eq!(error.stage(), "vs");
    assert_eq!(StorageMergeError::manifest("EROFS").stage(), "manifest");
    assert_eq!(error.to_string(), "moving vs failed: EIO");
}

#[rstest]
fn conflict_message_points_at_the_item() {
    let error = StorageMergeError::conflict(StorageCategory::Memory, "notes");
    assert_eq!(
        error.to_string(),
        "cannot place mem/notes: destination names are taken"
    );
}

#[rstest]
fn repository_errors_render_context() {
    let error = IdentityRepositoryError::connection("pool exhausted");
    assert_eq!(
        error.to_string(),
        "identity repository connection failed: pool exhausted"
    );
    let error = VerificationCodeRepositoryError::query("syntax");
    assert_eq!(
        error.to_string(),
        "verification code repository query failed: syntax"
    );
}
