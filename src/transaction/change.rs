// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Implements the Command Pattern for buffered store writes. Changes are
// recorded as the request runs, applied to the working copy on flush and
// published on commit; cancel discards them.
//
// ============================================================================

use crate::resource::ObjectId;

/// Represents a single buffered write in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert an object created in this request
    Create { object: ObjectId },

    /// Overwrite an existing object with its current arena state
    Save { object: ObjectId },

    /// Remove a stored object
    Delete { type_name: String, id: String },
}

impl Change {
    /// The arena object this change reads from, if any
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            Change::Create { object } | Change::Save { object } => Some(*object),
            Change::Delete { .. } => None,
        }
    }
}
