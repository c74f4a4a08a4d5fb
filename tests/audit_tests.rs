/// Audit tests
///
/// Template rendering against lineage, buffering until commit and the
/// audit switch in the engine configuration.
/// Run with: cargo test --test audit_tests

mod common;

use common::{Library, scope, scope_as};
use datagate::{
    AuditBinding, EngineConfig, EngineError, InMemoryAuditLogger, Operation, PersistentResource,
    User, Value,
};
use std::sync::Arc;

fn audited() -> Library {
    Library::new()
        .chapter(|chapter| {
            chapter.audit(
                AuditBinding::new(Operation::Update, 42, "Chapter {0} of {1} renamed by {2}")
                    .on_field("title")
                    .expression("${chapter.title}")
                    .expression("${book.title}")
                    .expression("${opaqueUser}"),
            )
        })
        .book(|book| {
            book.audit(
                AuditBinding::new(Operation::Create, 7, "{0} catalogued book {1}")
                    .expression("${opaqueUser}")
                    .expression("${book.id}"),
            )
            .audit(AuditBinding::new(Operation::Delete, 9, "Book withdrawn"))
        })
}

#[test]
fn test_field_audit_resolves_lineage() {
    let store = audited().store();
    let logger = Arc::new(InMemoryAuditLogger::new());
    let mut scope = scope(&store).with_audit_logger(logger.clone());

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let chapter = book.get_relation_by_id("chapters", "2", &mut scope).unwrap();
    chapter.update_attribute("title", "Desert", &mut scope).unwrap();

    assert_eq!(scope.pending_audit_messages().len(), 1);
    assert!(logger.messages().unwrap().is_empty());

    scope.complete().unwrap();

    let messages = logger.messages().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "Chapter Desert of Dune renamed by alice");
    assert_eq!(messages[0].operation_code, 42);
    assert_eq!(messages[0].type_name, "chapter");
    assert_eq!(messages[0].field.as_deref(), Some("title"));
    assert_eq!(messages[0].user, "alice");
}

#[test]
fn test_audit_without_lineage_fails_to_resolve() {
    let store = audited().store();
    let mut scope = scope(&store);

    let chapter = PersistentResource::load_record("chapter", "1", &mut scope).unwrap();
    let err = chapter.update_attribute("title", "Overture", &mut scope).unwrap_err();
    assert!(matches!(err, EngineError::InvalidSyntax(_)));

    assert_eq!(
        chapter.get_attribute("title", &mut scope).unwrap(),
        Value::from("Prologue")
    );
    assert!(scope.dirty_objects().is_empty());
    assert!(scope.pending_audit_messages().is_empty());
}

#[test]
fn test_class_audits_for_create_and_delete() {
    let store = audited().store();
    let logger = Arc::new(InMemoryAuditLogger::new());
    let mut scope = scope_as(&store, User::new("librarian"), EngineConfig::default())
        .with_audit_logger(logger.clone());

    PersistentResource::create_object(None, "book", &mut scope, None).unwrap();
    let dune = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    dune.delete_resource(&mut scope).unwrap();
    scope.complete().unwrap();

    let messages: Vec<String> = logger
        .messages()
        .unwrap()
        .into_iter()
        .map(|m| m.message)
        .collect();
    assert_eq!(messages, vec!["librarian catalogued book ", "Book withdrawn"]);
}

#[test]
fn test_aborted_request_logs_nothing() {
    let store = audited().store();
    let logger = Arc::new(InMemoryAuditLogger::new());
    let mut scope = scope(&store).with_audit_logger(logger.clone());

    PersistentResource::create_object(None, "book", &mut scope, None).unwrap();
    assert_eq!(scope.pending_audit_messages().len(), 1);
    scope.abort();

    assert!(logger.messages().unwrap().is_empty());
}

#[test]
fn test_disabled_audit_renders_nothing() {
    let store = audited().store();
    let logger = Arc::new(InMemoryAuditLogger::new());
    let config = EngineConfig::new().audit_enabled(false);
    let mut scope = scope_as(&store, User::new("alice"), config).with_audit_logger(logger.clone());

    let chapter = PersistentResource::load_record("chapter", "1", &mut scope).unwrap();
    chapter.update_attribute("title", "Overture", &mut scope).unwrap();
    scope.complete().unwrap();

    assert!(logger.messages().unwrap().is_empty());
}
