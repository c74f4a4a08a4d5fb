// ============================================================================
// In-Memory Store
// ============================================================================
//
// Reference `Transaction` implementation backed by a shared map of stored
// records. Each transaction works on a snapshot taken at begin:
//
//   begin ──> buffered changes ──flush──> working copy ──commit──> store
//                                 │
//                                 └── duplicate keys and dangling references
//                                     raise ConstraintViolation
//
// Every call is recorded in a `CallJournal` so callers can observe exactly
// which storage operations a request performed.
//
// ============================================================================

use super::change::Change;
use super::state::{TransactionId, TransactionState};
use super::Transaction;
use crate::core::{EngineError, Result, Value};
use crate::dictionary::EntityDictionary;
use crate::resource::{ObjectArena, ObjectId, Record, RelationValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{Level, event};

/// Storage key of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub type_name: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRelation {
    ToOne(Option<EntityKey>),
    /// `None` is an uninitialized collection.
    ToMany(Option<Vec<EntityKey>>),
}

impl StoredRelation {
    fn keys(&self) -> Vec<&EntityKey> {
        match self {
            StoredRelation::ToOne(key) => key.iter().collect(),
            StoredRelation::ToMany(keys) => keys.iter().flatten().collect(),
        }
    }

    fn keys_mut(&mut self) -> Vec<&mut EntityKey> {
        match self {
            StoredRelation::ToOne(key) => key.iter_mut().collect(),
            StoredRelation::ToMany(keys) => keys.iter_mut().flatten().collect(),
        }
    }
}

/// A persisted record.
///
/// Relationship builders take target ids only; target types are resolved
/// from the dictionary when the record is inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub type_name: String,
    pub id: String,
    pub attributes: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, StoredRelation>,
}

impl StoredRecord {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn to_one(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.relations.insert(
            name.into(),
            StoredRelation::ToOne(Some(EntityKey::new(String::new(), id))),
        );
        self
    }

    pub fn to_many<I, S>(mut self, name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = ids
            .into_iter()
            .map(|id| EntityKey::new(String::new(), id))
            .collect();
        self.relations
            .insert(name.into(), StoredRelation::ToMany(Some(keys)));
        self
    }

    /// Leaves a to-many relationship's backing collection uninitialized.
    pub fn uninitialized(mut self, name: impl Into<String>) -> Self {
        self.relations.insert(name.into(), StoredRelation::ToMany(None));
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.type_name.clone(), self.id.clone())
    }

    /// Ids of a relationship's members.
    pub fn member_ids(&self, relation: &str) -> Vec<&str> {
        self.relations
            .get(relation)
            .map(|r| r.keys().into_iter().map(|k| k.id.as_str()).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Call Journal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    LoadObject,
    LoadObjects,
    CreateObject,
    Save,
    Delete,
    PreCommit,
    Flush,
    Commit,
    Cancel,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCall {
    pub kind: CallKind,
    pub type_name: Option<String>,
    pub id: Option<String>,
}

impl TransactionCall {
    fn bare(kind: CallKind) -> Self {
        Self {
            kind,
            type_name: None,
            id: None,
        }
    }

    fn on(kind: CallKind, type_name: &str, id: Option<&str>) -> Self {
        Self {
            kind,
            type_name: Some(type_name.to_string()),
            id: id.map(str::to_string),
        }
    }
}

/// Shared, append-only log of transaction calls.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<TransactionCall>>>,
}

impl CallJournal {
    fn record(&self, call: TransactionCall) -> Result<()> {
        self.calls.lock()?.push(call);
        Ok(())
    }

    pub fn calls(&self) -> Result<Vec<TransactionCall>> {
        Ok(self.calls.lock()?.clone())
    }

    pub fn calls_of(&self, kind: CallKind) -> Result<Vec<TransactionCall>> {
        Ok(self
            .calls
            .lock()?
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect())
    }

    pub fn count(&self, kind: CallKind) -> Result<usize> {
        Ok(self.calls.lock()?.iter().filter(|call| call.kind == kind).count())
    }

    pub fn clear(&self) -> Result<()> {
        self.calls.lock()?.clear();
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Default)]
struct StoreData {
    records: BTreeMap<EntityKey, StoredRecord>,
    next_id: u64,
}

/// Shared in-memory backing store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    dictionary: Arc<EntityDictionary>,
    data: Arc<RwLock<StoreData>>,
    journal: CallJournal,
}

impl InMemoryStore {
    pub fn new(dictionary: Arc<EntityDictionary>) -> Self {
        Self {
            dictionary,
            data: Arc::new(RwLock::new(StoreData::default())),
            journal: CallJournal::default(),
        }
    }

    /// Seeds a record directly into committed state.
    pub fn insert(&self, mut record: StoredRecord) -> Result<()> {
        let binding = self.dictionary.entity(&record.type_name)?;
        for name in record.attributes.keys() {
            if binding.attribute_binding(name).is_none() {
                return Err(EngineError::invalid_attribute(&record.type_name, name));
            }
        }
        for (name, relation) in record.relations.iter_mut() {
            let target = &self.dictionary.relationship(&record.type_name, name)?.target;
            for key in relation.keys_mut() {
                if key.type_name.is_empty() {
                    key.type_name = target.clone();
                }
            }
        }

        let mut data = self.data.write()?;
        let key = record.key();
        if data.records.contains_key(&key) {
            return Err(EngineError::ConstraintViolation(format!(
                "duplicate key {}",
                key
            )));
        }
        data.records.insert(key, record);
        Ok(())
    }

    pub fn get(&self, type_name: &str, id: &str) -> Result<Option<StoredRecord>> {
        let data = self.data.read()?;
        Ok(find_key(&data.records, &self.dictionary, type_name, id)
            .and_then(|key| data.records.get(&key).cloned()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.data.read()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn journal(&self) -> CallJournal {
        self.journal.clone()
    }

    pub fn dictionary(&self) -> &Arc<EntityDictionary> {
        &self.dictionary
    }

    /// Starts a transaction over a snapshot of the committed state.
    pub fn begin(&self) -> Result<InMemoryTransaction> {
        let snapshot = self.data.read()?.records.clone();
        Ok(InMemoryTransaction {
            id: TransactionId::new(),
            state: TransactionState::Active,
            closed: false,
            dictionary: Arc::clone(&self.dictionary),
            data: Arc::clone(&self.data),
            working: snapshot,
            pending: Vec::new(),
            flushed: Vec::new(),
            journal: self.journal.clone(),
        })
    }
}

/// A write resolved at flush, replayed against the store on commit.
#[derive(Debug, Clone)]
enum Write {
    Insert(StoredRecord),
    Put(StoredRecord),
    Remove(EntityKey),
}

pub struct InMemoryTransaction {
    id: TransactionId,
    state: TransactionState,
    closed: bool,
    dictionary: Arc<EntityDictionary>,
    data: Arc<RwLock<StoreData>>,
    working: BTreeMap<EntityKey, StoredRecord>,
    pending: Vec<Change>,
    flushed: Vec<Write>,
    journal: CallJournal,
}

impl InMemoryTransaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_changes(&self) -> &[Change] {
        &self.pending
    }

    fn next_generated_id(&self, type_name: &str) -> Result<String> {
        let base = self.dictionary.base_type(type_name).to_string();
        let mut data = self.data.write()?;
        loop {
            data.next_id += 1;
            let candidate = data.next_id.to_string();
            let taken = |records: &BTreeMap<EntityKey, StoredRecord>| {
                records.keys().any(|key| {
                    key.id == candidate && self.dictionary.base_type(&key.type_name) == base
                })
            };
            if !taken(&data.records) && !taken(&self.working) {
                return Ok(candidate);
            }
        }
    }
}

impl Transaction for InMemoryTransaction {
    fn load_object(
        &mut self,
        arena: &mut ObjectArena,
        type_name: &str,
        id: &str,
    ) -> Result<Option<ObjectId>> {
        self.state.ensure_active(self.id, "load")?;
        self.journal
            .record(TransactionCall::on(CallKind::LoadObject, type_name, Some(id)))?;

        match find_key(&self.working, &self.dictionary, type_name, id) {
            Some(key) => Ok(Some(materialize(&self.working, &self.dictionary, arena, &key)?)),
            None => Ok(None),
        }
    }

    fn load_objects(&mut self, arena: &mut ObjectArena, type_name: &str) -> Result<Vec<ObjectId>> {
        self.state.ensure_active(self.id, "load")?;
        self.journal
            .record(TransactionCall::on(CallKind::LoadObjects, type_name, None))?;

        let keys: Vec<EntityKey> = self
            .working
            .keys()
            .filter(|key| self.dictionary.is_subtype_of(&key.type_name, type_name))
            .cloned()
            .collect();
        keys.iter()
            .map(|key| materialize(&self.working, &self.dictionary, arena, key))
            .collect()
    }

    fn create_object(&mut self, arena: &mut ObjectArena, object: ObjectId) -> Result<()> {
        self.state.ensure_active(self.id, "create")?;
        let record = arena.record(object)?;
        let type_name = record.type_name.clone();

        if record.id.is_none() && self.dictionary.is_id_generated(&type_name) {
            let id = self.next_generated_id(&type_name)?;
            arena.assign_id(object, id)?;
        }

        let id = arena.record(object)?.id.clone();
        self.journal
            .record(TransactionCall::on(CallKind::CreateObject, &type_name, id.as_deref()))?;
        self.pending.push(Change::Create { object });
        Ok(())
    }

    fn save(&mut self, arena: &ObjectArena, object: ObjectId) -> Result<()> {
        self.state.ensure_active(self.id, "save")?;
        let record = arena.record(object)?;
        self.journal.record(TransactionCall::on(
            CallKind::Save,
            &record.type_name,
            record.id.as_deref(),
        ))?;
        self.pending.push(Change::Save { object });
        Ok(())
    }

    fn delete(&mut self, arena: &ObjectArena, object: ObjectId) -> Result<()> {
        self.state.ensure_active(self.id, "delete")?;
        let record = arena.record(object)?;
        self.journal.record(TransactionCall::on(
            CallKind::Delete,
            &record.type_name,
            record.id.as_deref(),
        ))?;

        self.pending.retain(|change| change.object() != Some(object));
        if let Some(id) = &record.id {
            self.pending.push(Change::Delete {
                type_name: record.type_name.clone(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    fn pre_commit(&mut self) -> Result<()> {
        self.state.ensure_active(self.id, "pre-commit")?;
        self.journal.record(TransactionCall::bare(CallKind::PreCommit))
    }

    fn flush(&mut self, arena: &ObjectArena) -> Result<()> {
        self.state.ensure_active(self.id, "flush")?;
        self.journal.record(TransactionCall::bare(CallKind::Flush))?;

        let mut working = self.working.clone();
        let mut writes = Vec::with_capacity(self.pending.len());

        for change in &self.pending {
            match change {
                Change::Create { object } => {
                    let record = to_stored(arena, *object)?;
                    let key = record.key();
                    if find_key(&working, &self.dictionary, &key.type_name, &key.id).is_some() {
                        return Err(EngineError::ConstraintViolation(format!(
                            "duplicate key {}",
                            key
                        )));
                    }
                    working.insert(key, record.clone());
                    writes.push(Write::Insert(record));
                }
                Change::Save { object } => {
                    let record = to_stored(arena, *object)?;
                    let key = record.key();
                    if !working.contains_key(&key) {
                        return Err(EngineError::ConstraintViolation(format!(
                            "cannot save {}: no such record",
                            key
                        )));
                    }
                    working.insert(key, record.clone());
                    writes.push(Write::Put(record));
                }
                Change::Delete { type_name, id } => {
                    let key = EntityKey::new(type_name.clone(), id.clone());
                    working.remove(&key);
                    writes.push(Write::Remove(key));
                }
            }
        }

        for write in &writes {
            if let Write::Insert(record) | Write::Put(record) = write {
                check_references(&working, &self.dictionary, record)?;
            }
        }

        event!(Level::DEBUG, txn = %self.id, writes = writes.len(), "flushed");
        self.working = working;
        self.pending.clear();
        self.flushed.extend(writes);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.ensure_active(self.id, "commit")?;
        self.journal.record(TransactionCall::bare(CallKind::Commit))?;

        if !self.pending.is_empty() {
            return Err(EngineError::TransactionState(format!(
                "transaction {} has {} unflushed changes",
                self.id,
                self.pending.len()
            )));
        }

        let mut data = self.data.write()?;
        let mut records = data.records.clone();
        for write in self.flushed.drain(..) {
            match write {
                Write::Insert(record) => {
                    let key = record.key();
                    if records.contains_key(&key) {
                        return Err(EngineError::ConstraintViolation(format!(
                            "duplicate key {}",
                            key
                        )));
                    }
                    records.insert(key, record);
                }
                Write::Put(record) => {
                    records.insert(record.key(), record);
                }
                Write::Remove(key) => {
                    records.remove(&key);
                }
            }
        }
        data.records = records;
        self.state = TransactionState::Committed;

        event!(Level::DEBUG, txn = %self.id, "committed");
        Ok(())
    }

    fn cancel(&mut self) {
        let _ = self.journal.record(TransactionCall::bare(CallKind::Cancel));
        if self.state.is_active() {
            self.pending.clear();
            self.flushed.clear();
            self.state = TransactionState::Aborted;
            event!(Level::DEBUG, txn = %self.id, "cancelled");
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.journal.record(TransactionCall::bare(CallKind::Close))?;
        if self.state.is_active() {
            log::warn!("transaction {} closed while active; cancelling", self.id);
            self.cancel();
        }
        self.closed = true;
        Ok(())
    }
}

/// Resolves `(type, id)` to a stored key, accepting subtypes of `type_name`.
fn find_key(
    records: &BTreeMap<EntityKey, StoredRecord>,
    dictionary: &EntityDictionary,
    type_name: &str,
    id: &str,
) -> Option<EntityKey> {
    let exact = EntityKey::new(type_name, id);
    if records.contains_key(&exact) {
        return Some(exact);
    }
    records
        .keys()
        .find(|key| key.id == id && dictionary.is_subtype_of(&key.type_name, type_name))
        .cloned()
}

/// Loads a stored record and everything reachable from it into the arena.
/// Records already in the arena are reused, which also terminates cycles.
fn materialize(
    records: &BTreeMap<EntityKey, StoredRecord>,
    dictionary: &EntityDictionary,
    arena: &mut ObjectArena,
    key: &EntityKey,
) -> Result<ObjectId> {
    if let Some(object) = arena.find(&key.type_name, &key.id) {
        return Ok(object);
    }
    let stored = records
        .get(key)
        .ok_or_else(|| EngineError::invalid_id(&key.type_name, &key.id))?;

    let mut record = Record::from_binding(dictionary.entity(&key.type_name)?).with_id(key.id.clone());
    for (name, value) in &stored.attributes {
        record.attributes.insert(name.clone(), value.clone());
    }
    let object = arena.insert(record);

    for (name, relation) in &stored.relations {
        let mut resolve = |target: &EntityKey| -> Result<Option<ObjectId>> {
            match find_key(records, dictionary, &target.type_name, &target.id) {
                Some(found) => materialize(records, dictionary, arena, &found).map(Some),
                None => Ok(None),
            }
        };
        let value = match relation {
            StoredRelation::ToOne(None) => RelationValue::ToOne(None),
            StoredRelation::ToOne(Some(target)) => RelationValue::ToOne(resolve(target)?),
            StoredRelation::ToMany(None) => RelationValue::ToMany(None),
            StoredRelation::ToMany(Some(targets)) => {
                let mut members = Vec::with_capacity(targets.len());
                for target in targets {
                    if let Some(member) = resolve(target)? {
                        members.push(member);
                    }
                }
                RelationValue::ToMany(Some(members))
            }
        };
        arena.record_mut(object)?.relations.insert(name.clone(), value);
    }

    Ok(object)
}

/// Converts the arena state of `object` into its stored form.
fn to_stored(arena: &ObjectArena, object: ObjectId) -> Result<StoredRecord> {
    let record = arena.record(object)?;
    let id = record.id.clone().ok_or_else(|| {
        EngineError::ConstraintViolation(format!(
            "'{}' {} has no identifier",
            record.type_name, object
        ))
    })?;

    let key_of = |member: ObjectId| -> Result<EntityKey> {
        let target = arena.record(member)?;
        let id = target.id.clone().ok_or_else(|| {
            EngineError::ConstraintViolation(format!(
                "'{}' references unsaved '{}' {}",
                record.type_name, target.type_name, member
            ))
        })?;
        Ok(EntityKey::new(target.type_name.clone(), id))
    };

    let mut relations = BTreeMap::new();
    for (name, value) in &record.relations {
        let stored = match value {
            RelationValue::ToOne(target) => {
                StoredRelation::ToOne(target.map(key_of).transpose()?)
            }
            RelationValue::ToMany(None) => StoredRelation::ToMany(None),
            RelationValue::ToMany(Some(members)) => StoredRelation::ToMany(Some(
                members
                    .iter()
                    .map(|member| key_of(*member))
                    .collect::<Result<Vec<_>>>()?,
            )),
        };
        relations.insert(name.clone(), stored);
    }

    Ok(StoredRecord {
        type_name: record.type_name.clone(),
        id,
        attributes: record.attributes.clone(),
        relations,
    })
}

fn check_references(
    records: &BTreeMap<EntityKey, StoredRecord>,
    dictionary: &EntityDictionary,
    record: &StoredRecord,
) -> Result<()> {
    for (name, relation) in &record.relations {
        for key in relation.keys() {
            if find_key(records, dictionary, &key.type_name, &key.id).is_none() {
                return Err(EngineError::ConstraintViolation(format!(
                    "{}.{} references missing {}",
                    record.key(),
                    name,
                    key
                )));
            }
        }
    }
    Ok(())
}
