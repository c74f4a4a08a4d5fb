use crate::resource::{ChangeSpec, PersistentResource};
use std::fmt;

/// CRUD operation a trigger reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Read => write!(f, "READ"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Checkpoint of the request at which a queued trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionPhase {
    /// Before commit-time permission checks.
    PreSecurity,
    /// After the store has been flushed, before commit.
    PreCommit,
    /// After the store has committed.
    PostCommit,
}

impl TransactionPhase {
    pub const ALL: [TransactionPhase; 3] = [
        TransactionPhase::PreSecurity,
        TransactionPhase::PreCommit,
        TransactionPhase::PostCommit,
    ];

    pub(crate) fn index(&self) -> usize {
        match self {
            TransactionPhase::PreSecurity => 0,
            TransactionPhase::PreCommit => 1,
            TransactionPhase::PostCommit => 2,
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPhase::PreSecurity => write!(f, "PRESECURITY"),
            TransactionPhase::PreCommit => write!(f, "PRECOMMIT"),
            TransactionPhase::PostCommit => write!(f, "POSTCOMMIT"),
        }
    }
}

/// A queued side effect awaiting its phase.
///
/// `field == None` is a class-level trigger.
#[derive(Debug, Clone)]
pub struct LifecycleTrigger {
    pub operation: Operation,
    pub resource: PersistentResource,
    pub field: Option<String>,
    pub change: Option<ChangeSpec>,
}

impl LifecycleTrigger {
    pub fn class(operation: Operation, resource: PersistentResource) -> Self {
        Self {
            operation,
            resource,
            field: None,
            change: None,
        }
    }

    pub fn field(
        operation: Operation,
        resource: PersistentResource,
        field: impl Into<String>,
        change: Option<ChangeSpec>,
    ) -> Self {
        Self {
            operation,
            resource,
            field: Some(field.into()),
            change,
        }
    }

    pub fn is_class_level(&self) -> bool {
        self.field.is_none()
    }
}
