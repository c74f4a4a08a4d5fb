// ============================================================================
// Datagate Library
// ============================================================================
//
// Object-graph mutation engine for auto-generated data APIs. A request
// wraps a pluggable `Transaction` in a `RequestScope`; every read and write
// goes through `PersistentResource`, which enforces permission expressions,
// keeps both sides of bidirectional relationships in step, queues lifecycle
// triggers for the three commit phases and buffers audit messages.
//
// ```text
//   RequestScope ── PersistentResource ── ObjectArena
//        │                  │
//        │          PermissionExecutor ── EntityDictionary
//        │
//        └── Transaction (InMemoryTransaction, ...)
// ```
//
// ============================================================================

pub mod audit;
pub mod config;
pub mod core;
pub mod dictionary;
pub mod lifecycle;
pub mod request;
pub mod resource;
pub mod security;
pub mod transaction;

pub use audit::{AuditBinding, AuditLogger, InMemoryAuditLogger, LogAuditLogger, LogMessage};
pub use config::EngineConfig;
pub use core::{DataType, EngineError, ForbiddenAccess, Result, Value};
pub use dictionary::{
    AttributeBinding, DictionaryBuilder, EntityBinding, EntityDictionary, RelationshipBinding,
    RelationshipType,
};
pub use lifecycle::{
    HookBinding, HookInvocation, LifecycleHook, LifecycleTrigger, Operation, TransactionPhase,
};
pub use request::{RequestScope, run_request};
pub use resource::{
    ChangeSpec, FieldValue, ObjectArena, ObjectId, PersistentResource, Record, RelationValue,
    ResourceLineage,
};
pub use security::{
    Allow, Check, CheckContext, CheckTiming, Deny, FnCheck, HasRole, PermissionExpression,
    PermissionKind, SecurityMode, User,
};
pub use transaction::{InMemoryStore, InMemoryTransaction, StoredRecord, Transaction};
