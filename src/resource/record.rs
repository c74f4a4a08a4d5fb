// ============================================================================
// Object Arena
// ============================================================================
//
// Request-owned storage for materialized domain objects. Relationships are
// stored as arena handles rather than live references, so bidirectional
// links and parent/child cycles never form ownership cycles.
//
// ============================================================================

use crate::core::{EngineError, Result, Value};
use crate::dictionary::EntityBinding;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Handle to a record inside an [`ObjectArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

impl ObjectId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current value of a relationship field.
///
/// `ToMany(None)` is a backing collection that was never initialized,
/// which is distinct from an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    ToOne(Option<ObjectId>),
    ToMany(Option<Vec<ObjectId>>),
}

impl RelationValue {
    pub fn empty_to_many() -> Self {
        Self::ToMany(Some(Vec::new()))
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self, Self::ToMany(_))
    }

    pub fn members(&self) -> Vec<ObjectId> {
        match self {
            Self::ToOne(target) => target.iter().copied().collect(),
            Self::ToMany(members) => members.clone().unwrap_or_default(),
        }
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        match self {
            Self::ToOne(target) => *target == Some(object),
            Self::ToMany(members) => members.as_ref().is_some_and(|m| m.contains(&object)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::ToOne(target) => target.is_none(),
            Self::ToMany(members) => members.as_ref().is_none_or(|m| m.is_empty()),
        }
    }
}

/// Either side of a [`ChangeSpec`](crate::resource::ChangeSpec).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Attribute(Value),
    Relation(RelationValue),
}

impl FieldValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Attribute(value) => Some(value),
            Self::Relation(_) => None,
        }
    }

    pub fn as_relation(&self) -> Option<&RelationValue> {
        match self {
            Self::Relation(relation) => Some(relation),
            Self::Attribute(_) => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Attribute(value)
    }
}

impl From<RelationValue> for FieldValue {
    fn from(value: RelationValue) -> Self {
        Self::Relation(value)
    }
}

/// One materialized domain object.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub type_name: String,
    pub id: Option<String>,
    pub attributes: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, RelationValue>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: None,
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Fresh record with declared attribute defaults and empty relationships.
    pub fn from_binding(binding: &EntityBinding) -> Self {
        let mut record = Self::new(binding.name());
        for attribute in binding.attributes() {
            record
                .attributes
                .insert(attribute.name.clone(), attribute.default.clone());
        }
        for relationship in binding.relationships() {
            let empty = if relationship.kind.is_to_many() {
                RelationValue::empty_to_many()
            } else {
                RelationValue::ToOne(None)
            };
            record.relations.insert(relationship.name.clone(), empty);
        }
        record
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }
}

/// Arena of records with an identity index on `(type, id)`.
#[derive(Debug, Default)]
pub struct ObjectArena {
    records: Vec<Record>,
    index: HashMap<(String, String), ObjectId>,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. A record carrying an id already present in the index
    /// resolves to the existing handle instead of being inserted twice.
    pub fn insert(&mut self, record: Record) -> ObjectId {
        if let Some(id) = &record.id {
            if let Some(existing) = self.find(&record.type_name, id) {
                return existing;
            }
        }

        let object = ObjectId(self.records.len());
        if let Some(id) = &record.id {
            self.index
                .insert((record.type_name.clone(), id.clone()), object);
        }
        self.records.push(record);
        object
    }

    pub fn find(&self, type_name: &str, id: &str) -> Option<ObjectId> {
        self.index
            .get(&(type_name.to_string(), id.to_string()))
            .copied()
    }

    pub fn get(&self, object: ObjectId) -> Option<&Record> {
        self.records.get(object.0)
    }

    pub fn record(&self, object: ObjectId) -> Result<&Record> {
        self.records
            .get(object.0)
            .ok_or_else(|| EngineError::InvalidValue(format!("dangling object handle {}", object)))
    }

    pub fn record_mut(&mut self, object: ObjectId) -> Result<&mut Record> {
        self.records
            .get_mut(object.0)
            .ok_or_else(|| EngineError::InvalidValue(format!("dangling object handle {}", object)))
    }

    pub fn type_of(&self, object: ObjectId) -> Result<&str> {
        Ok(&self.record(object)?.type_name)
    }

    /// Assigns a real identifier and re-indexes the record.
    pub fn assign_id(&mut self, object: ObjectId, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        let type_name = self.type_of(object)?.to_string();

        if let Some(existing) = self.find(&type_name, &id) {
            if existing != object {
                return Err(EngineError::ConstraintViolation(format!(
                    "duplicate identifier '{}' for '{}'",
                    id, type_name
                )));
            }
        }

        let record = self.record_mut(object)?;
        if let Some(previous) = record.id.replace(id.clone()) {
            self.index.remove(&(type_name.clone(), previous));
        }
        self.index.insert((type_name, id), object);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
