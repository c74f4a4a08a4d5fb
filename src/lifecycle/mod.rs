// ============================================================================
// Lifecycle Triggers
// ============================================================================
//
// Triggers are queued per phase by resource operations and replayed by the
// request scope when the owning driver drains that phase.
//
// State per (resource, field, operation):
//
//   UNQUEUED ──queue──> QUEUED(phase) ──drain──> FIRED(phase)
//
// ============================================================================

pub mod dispatcher;
pub mod trigger;

pub use dispatcher::{HookBinding, HookInvocation, LifecycleHook};
pub use trigger::{LifecycleTrigger, Operation, TransactionPhase};
