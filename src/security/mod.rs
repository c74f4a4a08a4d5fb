// ============================================================================
// Security
// ============================================================================
//
// Users, permission kinds, pluggable checks, expression trees over them and
// the per-request executor that evaluates those trees.
//
// ============================================================================

pub mod check;
pub mod executor;
pub mod expression;
pub mod permission;
pub mod user;

pub use check::{Allow, Check, CheckContext, CheckTiming, Deny, FnCheck, HasRole};
pub use executor::{PermissionExecutor, QueuedCheck, SecurityEnv};
pub use expression::{EvaluationMode, ExpressionResult, PermissionExpression};
pub use permission::{PermissionKind, SecurityMode};
pub use user::User;
