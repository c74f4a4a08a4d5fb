// ============================================================================
// Resources
// ============================================================================
//
// Records live in a request-local `ObjectArena` and are addressed by
// `ObjectId`. `PersistentResource` is the permission-gated view of one
// arena object; relationship edits go through a plan that checks both
// sides before writing either.
//
// ============================================================================

pub mod change;
pub mod lineage;
pub mod persistent;
pub mod record;
mod relations;

pub use change::ChangeSpec;
pub use lineage::{LineageEntry, ResourceLineage};
pub use persistent::PersistentResource;
pub use record::{FieldValue, ObjectArena, ObjectId, Record, RelationValue};
