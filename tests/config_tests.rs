/// Configuration tests
///
/// Loading `EngineConfig` from JSON files and its effect on a request.
/// Run with: cargo test --test config_tests

mod common;

use common::{Library, scope_as};
use datagate::{
    Deny, EngineConfig, EngineError, PermissionKind, PersistentResource, SecurityMode, User,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_config_from_file() {
    let file = write_config(
        r#"{
            "security_mode": "bypass",
            "verbose_errors": true,
            "max_trigger_drain_rounds": 16,
            "audit_enabled": false
        }"#,
    );

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.security_mode, SecurityMode::Bypass);
    assert!(config.verbose_errors);
    assert_eq!(config.max_trigger_drain_rounds, 16);
    assert!(!config.audit_enabled);
}

#[test]
fn test_load_rejects_bad_files() {
    let missing = tempfile::tempdir().unwrap().path().join("engine.json");
    assert!(matches!(
        EngineConfig::load(&missing),
        Err(EngineError::Configuration(_))
    ));

    let garbage = write_config("security_mode = bypass");
    assert!(matches!(
        EngineConfig::load(garbage.path()),
        Err(EngineError::Configuration(_))
    ));

    let unknown_mode = write_config(r#"{ "security_mode": "lenient" }"#);
    assert!(EngineConfig::load(unknown_mode.path()).is_err());
}

#[test]
fn test_loaded_bypass_config_governs_request() {
    let store = Library::new()
        .checks(|builder| builder.check("deny", Deny))
        .book(|book| book.permission(PermissionKind::Read, "deny"))
        .store();
    let file = write_config(r#"{ "security_mode": "bypass" }"#);
    let config = EngineConfig::load(file.path()).unwrap();

    let mut scope = scope_as(&store, User::anonymous(), config);
    assert!(PersistentResource::load_record("book", "1", &mut scope).is_ok());

    let mut scope = scope_as(&store, User::anonymous(), EngineConfig::default());
    assert!(PersistentResource::load_record("book", "1", &mut scope).is_err());
}
