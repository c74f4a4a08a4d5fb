//! Shared fixtures for the integration tests
//!
//! A small library model:
//!
//!   author  <-- books / authors -->  book  <-- books / publisher --  publisher
//!                                     |
//!                                     +-- chapters / book (cascade) --> chapter
//!
//! `novel` is a subtype of `book`.

#![allow(dead_code)]

use datagate::{
    DataType, EngineConfig, EntityBinding, EntityDictionary, HookBinding, InMemoryStore,
    Operation, RelationshipBinding, RelationshipType, RequestScope, StoredRecord,
    TransactionPhase, User,
};
use datagate::dictionary::DictionaryBuilder;
use std::sync::{Arc, Mutex};

pub fn author_entity() -> EntityBinding {
    EntityBinding::new("author")
        .attribute("name", DataType::Text)
        .relationship(
            RelationshipBinding::new("books", "book", RelationshipType::ManyToMany).inverse("authors"),
        )
}

pub fn book_entity() -> EntityBinding {
    EntityBinding::new("book")
        .id_generated(true)
        .attribute("title", DataType::Text)
        .attribute("genre", DataType::Text)
        .relationship(
            RelationshipBinding::new("authors", "author", RelationshipType::ManyToMany).inverse("books"),
        )
        .relationship(RelationshipBinding::to_one("publisher", "publisher").inverse("books"))
        .relationship(
            RelationshipBinding::to_many("chapters", "chapter")
                .inverse("book")
                .cascade_delete(),
        )
}

pub fn novel_entity() -> EntityBinding {
    EntityBinding::new("novel")
        .superclass("book")
        .id_generated(true)
        .attribute("series", DataType::Text)
}

pub fn publisher_entity() -> EntityBinding {
    EntityBinding::new("publisher")
        .attribute("name", DataType::Text)
        .relationship(RelationshipBinding::to_many("books", "book").inverse("publisher"))
}

pub fn chapter_entity() -> EntityBinding {
    EntityBinding::new("chapter")
        .attribute("title", DataType::Text)
        .relationship(RelationshipBinding::to_one("book", "book").inverse("chapters"))
}

/// Builder preloaded with every library entity except the given overrides.
pub struct Library {
    author: EntityBinding,
    book: EntityBinding,
    publisher: EntityBinding,
    chapter: EntityBinding,
    builder: DictionaryBuilder,
}

impl Library {
    pub fn new() -> Self {
        Self {
            author: author_entity(),
            book: book_entity(),
            publisher: publisher_entity(),
            chapter: chapter_entity(),
            builder: EntityDictionary::builder(),
        }
    }

    pub fn author(mut self, f: impl FnOnce(EntityBinding) -> EntityBinding) -> Self {
        self.author = f(self.author);
        self
    }

    pub fn book(mut self, f: impl FnOnce(EntityBinding) -> EntityBinding) -> Self {
        self.book = f(self.book);
        self
    }

    pub fn publisher(mut self, f: impl FnOnce(EntityBinding) -> EntityBinding) -> Self {
        self.publisher = f(self.publisher);
        self
    }

    pub fn chapter(mut self, f: impl FnOnce(EntityBinding) -> EntityBinding) -> Self {
        self.chapter = f(self.chapter);
        self
    }

    pub fn checks(mut self, f: impl FnOnce(DictionaryBuilder) -> DictionaryBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    pub fn build(self) -> Arc<EntityDictionary> {
        self.builder
            .entity(self.author)
            .entity(self.book)
            .entity(novel_entity())
            .entity(self.publisher)
            .entity(self.chapter)
            .build()
            .unwrap()
    }

    /// Builds the dictionary and a store seeded with [`seed`].
    pub fn store(self) -> InMemoryStore {
        let store = InMemoryStore::new(self.build());
        seed(&store);
        store
    }
}

/// Seeds:
///
/// - author 1 "Frank Herbert" wrote book 1
/// - author 2 "Ursula K. Le Guin" wrote nothing
/// - author 3 "Octavia Butler" with an uninitialized `books` collection
/// - publisher 1 "Ace" published book 1
/// - book 1 "Dune" with chapters 1 and 2
pub fn seed(store: &InMemoryStore) {
    store
        .insert(
            StoredRecord::new("author", "1")
                .attribute("name", "Frank Herbert")
                .to_many("books", ["1"]),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("author", "2")
                .attribute("name", "Ursula K. Le Guin")
                .to_many("books", Vec::<String>::new()),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("author", "3")
                .attribute("name", "Octavia Butler")
                .uninitialized("books"),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("publisher", "1")
                .attribute("name", "Ace")
                .to_many("books", ["1"]),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("book", "1")
                .attribute("title", "Dune")
                .attribute("genre", "science fiction")
                .to_many("authors", ["1"])
                .to_one("publisher", "1")
                .to_many("chapters", ["1", "2"]),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("chapter", "1")
                .attribute("title", "Prologue")
                .to_one("book", "1"),
        )
        .unwrap();
    store
        .insert(
            StoredRecord::new("chapter", "2")
                .attribute("title", "Arrakis")
                .to_one("book", "1"),
        )
        .unwrap();
}

pub fn scope(store: &InMemoryStore) -> RequestScope {
    scope_as(store, User::new("alice"), EngineConfig::default())
}

pub fn scope_as(store: &InMemoryStore, user: User, config: EngineConfig) -> RequestScope {
    RequestScope::new(
        Box::new(store.begin().unwrap()),
        Arc::clone(store.dictionary()),
        user,
        config,
    )
}

/// Records hook firings by label.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binding(&self, label: &str, operation: Operation, phase: TransactionPhase) -> HookBinding {
        let events = Arc::clone(&self.events);
        let label = label.to_string();
        HookBinding::from_fn(operation, phase, move |_, _, _| {
            events.lock().unwrap().push(label.clone());
            Ok(())
        })
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| *event == label)
            .count()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}
