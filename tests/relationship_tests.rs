/// Relationship tests
///
/// Both-sides maintenance, the readable-subset diff on collection updates,
/// share checks and uninitialized collections.
/// Run with: cargo test --test relationship_tests

mod common;

use common::{Library, Recorder, scope};
use datagate::transaction::CallKind;
use std::sync::{Arc, Mutex};
use datagate::{
    AuditBinding, Deny, EngineError, FnCheck, HookBinding, InMemoryStore, ObjectId, Operation, PermissionKind,
    PersistentResource, RelationValue, RequestScope, StoredRecord, TransactionPhase, Value,
};

fn ids_of(scope: &RequestScope, members: &[ObjectId]) -> Vec<String> {
    members
        .iter()
        .map(|member| scope.arena().record(*member).unwrap().id.clone().unwrap())
        .collect()
}

fn members(scope: &RequestScope, resource: &PersistentResource, field: &str) -> Vec<String> {
    let value = resource.record(scope).unwrap().relation(field).cloned().unwrap();
    ids_of(scope, &value.members())
}

#[test]
fn test_add_relation_updates_both_sides() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    assert!(book.add_relation("authors", &author, &mut scope).unwrap());
    assert_eq!(members(&scope, &book, "authors"), vec!["1", "2"]);
    assert_eq!(members(&scope, &author, "books"), vec!["1"]);
    assert!(scope.dirty_objects().contains(&book.object()));
    assert!(scope.dirty_objects().contains(&author.object()));

    scope.complete().unwrap();

    let stored = store.get("author", "2").unwrap().unwrap();
    assert_eq!(stored.member_ids("books"), vec!["1"]);
}

#[test]
fn test_add_existing_member_is_noop() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "1", &mut scope).unwrap();

    assert!(!book.add_relation("authors", &author, &mut scope).unwrap());
    assert!(scope.dirty_objects().is_empty());
    assert!(scope.queued_triggers(TransactionPhase::PreCommit).is_empty());
}

#[test]
fn test_remove_relation_updates_both_sides() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "1", &mut scope).unwrap();
    let stranger = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    assert!(!book.remove_relation("authors", &stranger, &mut scope).unwrap());
    assert!(book.remove_relation("authors", &author, &mut scope).unwrap());

    assert!(members(&scope, &book, "authors").is_empty());
    assert!(members(&scope, &author, "books").is_empty());
}

#[test]
fn test_to_one_update_moves_inverse() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let old = PersistentResource::load_record("publisher", "1", &mut scope).unwrap();
    let mut tor = PersistentResource::create_object(None, "publisher", &mut scope, None).unwrap();
    tor.set_id("2", &mut scope).unwrap();
    tor.update_attribute("name", "Tor", &mut scope).unwrap();

    assert!(book.update_relation("publisher", &[tor.clone()], &mut scope).unwrap());
    assert!(members(&scope, &old, "books").is_empty());
    assert_eq!(members(&scope, &tor, "books"), vec!["1"]);
    assert_eq!(members(&scope, &book, "publisher"), vec!["2"]);

    scope.complete().unwrap();

    let stored = store.get("book", "1").unwrap().unwrap();
    assert_eq!(stored.member_ids("publisher"), vec!["2"]);
    let stored = store.get("publisher", "1").unwrap().unwrap();
    assert!(stored.member_ids("books").is_empty());
}

#[test]
fn test_to_one_rejects_several_targets() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let publisher = PersistentResource::load_record("publisher", "1", &mut scope).unwrap();

    let err = book
        .update_relation("publisher", &[publisher.clone(), publisher], &mut scope)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidValue(_)));
}

#[test]
fn test_rejects_target_of_wrong_type() {
    let store = Library::new().store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let chapter = PersistentResource::load_record("chapter", "1", &mut scope).unwrap();

    let err = book.add_relation("authors", &chapter, &mut scope).unwrap_err();
    assert!(matches!(err, EngineError::InvalidValue(_)));
}

fn hidden_author_store() -> InMemoryStore {
    hidden_author_store_with(Library::new())
}

/// book 10 is written by authors 1..=5; authors 4 and 5 are hidden from
/// everyone, author 6 has written nothing yet.
fn hidden_author_store_with(library: Library) -> InMemoryStore {
    let dictionary = library
        .checks(|builder| {
            builder.check(
                "author is visible",
                FnCheck::immediate(|ctx| {
                    ctx.attribute("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| !name.starts_with("Hidden"))
                }),
            )
        })
        .author(|author| author.permission(PermissionKind::Read, "author is visible"))
        .build();
    let store = InMemoryStore::new(dictionary);

    for id in 1..=6 {
        let name = if id == 4 || id == 5 {
            format!("Hidden {}", id)
        } else {
            format!("Author {}", id)
        };
        let books: Vec<&str> = if id == 6 { vec![] } else { vec!["10"] };
        store
            .insert(
                StoredRecord::new("author", id.to_string())
                    .attribute("name", name)
                    .to_many("books", books),
            )
            .unwrap();
    }
    store
        .insert(
            StoredRecord::new("book", "10")
                .attribute("title", "Anthology")
                .to_many("authors", ["1", "2", "3", "4", "5"]),
        )
        .unwrap();
    store
}

#[test]
fn test_update_collection_replaces_only_readable_members() {
    let store = hidden_author_store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "10", &mut scope).unwrap();
    let visible: Vec<String> = book
        .get_relation("authors", &mut scope)
        .unwrap()
        .iter()
        .filter_map(|author| author.id().map(str::to_string))
        .collect();
    assert_eq!(visible, vec!["1", "2", "3"]);

    let third = PersistentResource::load_record("author", "3", &mut scope).unwrap();
    let sixth = PersistentResource::load_record("author", "6", &mut scope).unwrap();
    assert!(book.update_relation("authors", &[third, sixth], &mut scope).unwrap());

    assert_eq!(members(&scope, &book, "authors"), vec!["3", "4", "5", "6"]);

    scope.complete().unwrap();

    let stored = store.get("book", "10").unwrap().unwrap();
    assert_eq!(stored.member_ids("authors"), vec!["3", "4", "5", "6"]);
    for (id, expected) in [("1", 0), ("2", 0), ("3", 1), ("4", 1), ("5", 1), ("6", 1)] {
        let author = store.get("author", id).unwrap().unwrap();
        assert_eq!(author.member_ids("books").len(), expected, "author {}", id);
    }
}

#[test]
fn test_update_collection_leaves_kept_and_hidden_members_alone() {
    let touched: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&touched);
    let store = hidden_author_store_with(Library::new().author(move |author| {
        author.hook(
            HookBinding::from_fn(Operation::Update, TransactionPhase::PreCommit, move |_, resource, _| {
                sink.lock().unwrap().push(resource.id().unwrap_or_default().to_string());
                Ok(())
            })
            .on_field("books")
            .per_change(),
        )
    }));
    let journal = store.journal();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "10", &mut scope).unwrap();
    let third = PersistentResource::load_record("author", "3", &mut scope).unwrap();
    let sixth = PersistentResource::load_record("author", "6", &mut scope).unwrap();
    book.update_relation("authors", &[third, sixth], &mut scope).unwrap();
    scope.complete().unwrap();

    let mut saved: Vec<String> = journal
        .calls_of(CallKind::Save)
        .unwrap()
        .into_iter()
        .map(|call| format!("{}/{}", call.type_name.unwrap(), call.id.unwrap()))
        .collect();
    saved.sort();
    assert_eq!(saved, vec!["author/1", "author/2", "author/6", "book/10"]);

    let mut hooked = touched.lock().unwrap().clone();
    hooked.sort();
    assert_eq!(hooked, vec!["1", "2", "6"]);
}

#[test]
fn test_update_collection_with_same_readable_members_is_noop() {
    let store = hidden_author_store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "10", &mut scope).unwrap();
    let readable = book.get_relation("authors", &mut scope).unwrap();

    assert!(!book.update_relation("authors", &readable, &mut scope).unwrap());
    assert!(scope.dirty_objects().is_empty());
}

#[test]
fn test_clear_relation_keeps_unreadable_members() {
    let store = hidden_author_store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "10", &mut scope).unwrap();
    assert!(book.clear_relation("authors", &mut scope).unwrap());
    assert_eq!(members(&scope, &book, "authors"), vec!["4", "5"]);
    assert!(!book.clear_relation("authors", &mut scope).unwrap());
}

#[test]
fn test_failed_inverse_check_applies_nothing() {
    let store = Library::new()
        .checks(|builder| builder.check("deny", Deny))
        .author(|author| author.field_permission("books", PermissionKind::Update, "deny"))
        .store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    let err = book.add_relation("authors", &author, &mut scope).unwrap_err();
    assert!(err.is_forbidden());
    assert_eq!(members(&scope, &book, "authors"), vec!["1"]);
    assert!(members(&scope, &author, "books").is_empty());
    assert!(scope.dirty_objects().is_empty());
}

#[test]
fn test_failed_audit_render_applies_nothing() {
    let store = Library::new()
        .book(|book| {
            book.audit(
                AuditBinding::new(Operation::Update, 3, "Credits of {0} changed")
                    .on_field("authors")
                    .expression("${publisher.name}"),
            )
        })
        .store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    let err = book.add_relation("authors", &author, &mut scope).unwrap_err();
    assert!(matches!(err, EngineError::InvalidSyntax(_)));
    assert_eq!(members(&scope, &book, "authors"), vec!["1"]);
    assert!(members(&scope, &author, "books").is_empty());
    assert!(scope.dirty_objects().is_empty());
    assert!(scope.queued_triggers(TransactionPhase::PreCommit).is_empty());
    assert!(scope.pending_audit_messages().is_empty());
}

#[test]
fn test_linking_non_transferable_existing_object_is_forbidden() {
    let store = Library::new()
        .author(|author| author.transferable(false))
        .store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let existing = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    let err = book.add_relation("authors", &existing, &mut scope).unwrap_err();
    match err {
        EngineError::ForbiddenAccess(access) => {
            assert_eq!(access.permission, PermissionKind::Share);
            assert_eq!(access.type_name, "author");
        }
        other => panic!("expected ForbiddenAccess, got {:?}", other),
    }

    let mut fresh = PersistentResource::create_object(None, "author", &mut scope, None).unwrap();
    fresh.set_id("9", &mut scope).unwrap();
    assert!(book.add_relation("authors", &fresh, &mut scope).unwrap());
}

#[test]
fn test_share_permission_is_checked_on_existing_targets() {
    let store = Library::new()
        .checks(|builder| builder.check("deny", Deny))
        .author(|author| author.permission(PermissionKind::Share, "deny"))
        .store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "2", &mut scope).unwrap();

    let err = book.add_relation("authors", &author, &mut scope).unwrap_err();
    assert!(err.is_forbidden());
}

#[test]
fn test_uninitialized_inverse_collection_records_two_changes() {
    let recorder = Recorder::new();
    let store = Library::new()
        .author(|author| {
            author
                .hook(
                    recorder
                        .binding("each change", Operation::Update, TransactionPhase::PreCommit)
                        .on_field("books")
                        .per_change(),
                )
                .hook(
                    recorder
                        .binding("once", Operation::Update, TransactionPhase::PreCommit)
                        .on_field("books"),
                )
        })
        .store();
    let mut scope = scope(&store);

    let book = PersistentResource::load_record("book", "1", &mut scope).unwrap();
    let author = PersistentResource::load_record("author", "3", &mut scope).unwrap();
    assert_eq!(
        author.record(&scope).unwrap().relation("books"),
        Some(&RelationValue::ToMany(None))
    );

    book.add_relation("authors", &author, &mut scope).unwrap();
    scope.complete().unwrap();

    assert_eq!(recorder.count("each change"), 2);
    assert_eq!(recorder.count("once"), 1);

    let stored = store.get("author", "3").unwrap().unwrap();
    assert_eq!(stored.member_ids("books"), vec!["1"]);
    assert_eq!(store.journal().count(CallKind::Save).unwrap(), 2);
}
