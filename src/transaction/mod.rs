// ============================================================================
// Transactions
// ============================================================================
//
// The storage boundary of a request. The engine drives a `Transaction`
// through a fixed sequence (load/create/save/delete, then pre-commit, flush,
// commit or cancel, and close) but never implements persistence itself.
//
// Design Patterns Used:
// - State Pattern: transaction lifecycle (Active, Committed, Aborted)
// - Command Pattern: buffered changes applied on flush
//
// ============================================================================

pub mod change;
pub mod memory;
pub mod state;

pub use change::Change;
pub use memory::{CallJournal, CallKind, InMemoryStore, InMemoryTransaction, StoredRecord, TransactionCall};
pub use state::{TransactionId, TransactionState};

use crate::core::{EngineError, Result};
use crate::dictionary::EntityBinding;
use crate::resource::{ObjectArena, ObjectId, Record, RelationValue};

/// Storage operations a request needs.
///
/// Objects live in the request's [`ObjectArena`]; implementations
/// materialize loaded records into it and read dirty records back out of it.
pub trait Transaction {
    /// Loads one object, returning the existing handle if it is already in
    /// the arena. `Ok(None)` when no such object exists.
    fn load_object(
        &mut self,
        arena: &mut ObjectArena,
        type_name: &str,
        id: &str,
    ) -> Result<Option<ObjectId>>;

    fn load_objects(&mut self, arena: &mut ObjectArena, type_name: &str) -> Result<Vec<ObjectId>>;

    /// Obtains a fresh, not yet persisted backing object.
    fn create_new_object(&mut self, arena: &mut ObjectArena, binding: &EntityBinding) -> Result<ObjectId> {
        Ok(arena.insert(Record::from_binding(binding)))
    }

    /// Persists an object created in this request.
    fn create_object(&mut self, arena: &mut ObjectArena, object: ObjectId) -> Result<()>;

    fn save(&mut self, arena: &ObjectArena, object: ObjectId) -> Result<()>;

    fn delete(&mut self, arena: &ObjectArena, object: ObjectId) -> Result<()>;

    fn get_relation(
        &mut self,
        arena: &mut ObjectArena,
        object: ObjectId,
        relation: &str,
    ) -> Result<RelationValue> {
        let record = arena.record(object)?;
        record
            .relation(relation)
            .cloned()
            .ok_or_else(|| EngineError::invalid_relationship(&record.type_name, relation))
    }

    fn update_to_one_relation(
        &mut self,
        _arena: &ObjectArena,
        _object: ObjectId,
        _relation: &str,
        _target: Option<ObjectId>,
    ) -> Result<()> {
        Ok(())
    }

    fn update_to_many_relation(
        &mut self,
        _arena: &ObjectArena,
        _object: ObjectId,
        _relation: &str,
        _added: &[ObjectId],
        _removed: &[ObjectId],
    ) -> Result<()> {
        Ok(())
    }

    fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Writes buffered changes to the store without committing them.
    fn flush(&mut self, arena: &ObjectArena) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Discards everything not yet committed. Never fails.
    fn cancel(&mut self);

    fn close(&mut self) -> Result<()>;
}
