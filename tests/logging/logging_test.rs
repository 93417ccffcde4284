//! Tests for `src/logging.rs`.

use confcom::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn file_logging_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // The global subscriber can be installed once per process; this is the
    // only test in this binary that installs it.
    let guard = confcom::logging::init_with_file(&logs_dir);
    assert!(guard.is_ok());
    assert!(logs_dir.exists(), "logs directory should be created");
    tracing::info!("signed fragment");
}
