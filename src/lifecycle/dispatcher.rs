// ============================================================================
// Lifecycle Dispatcher
// ============================================================================
//
// Turns a drained batch of triggers into the list of hook firings for one
// phase.
//
// Firing rules:
// - class-level bindings fire once per (object, operation, phase)
// - field bindings fire once per (object, field, operation, phase) carrying
//   the last change queued in the batch, unless bound per change, in which
//   case every distinct change fires
// - class-level bindings bound per change fire for every field change
//
// ============================================================================

use super::trigger::{LifecycleTrigger, Operation, TransactionPhase};
use crate::core::Result;
use crate::dictionary::EntityDictionary;
use crate::request::RequestScope;
use crate::resource::{ChangeSpec, ObjectId, PersistentResource};
use std::fmt;
use std::sync::Arc;

/// What a hook is being invoked for.
#[derive(Debug, Clone, PartialEq)]
pub struct HookInvocation {
    pub operation: Operation,
    pub phase: TransactionPhase,
    pub field: Option<String>,
    pub change: Option<ChangeSpec>,
}

/// User code bound to an entity's lifecycle.
///
/// Hooks receive the request scope mutably and may perform further
/// mutations; triggers they queue for the running phase are drained in the
/// same call.
pub trait LifecycleHook: Send + Sync {
    fn execute(
        &self,
        invocation: &HookInvocation,
        resource: &PersistentResource,
        scope: &mut RequestScope,
    ) -> Result<()>;
}

struct FnHook<F>(F);

impl<F> LifecycleHook for FnHook<F>
where
    F: Fn(&HookInvocation, &PersistentResource, &mut RequestScope) -> Result<()> + Send + Sync,
{
    fn execute(
        &self,
        invocation: &HookInvocation,
        resource: &PersistentResource,
        scope: &mut RequestScope,
    ) -> Result<()> {
        (self.0)(invocation, resource, scope)
    }
}

/// Binds a hook to `(operation, phase, field?)` on an entity.
#[derive(Clone)]
pub struct HookBinding {
    pub operation: Operation,
    pub phase: TransactionPhase,
    pub field: Option<String>,
    pub once_per_request: bool,
    pub hook: Arc<dyn LifecycleHook>,
}

impl HookBinding {
    pub fn new(operation: Operation, phase: TransactionPhase, hook: impl LifecycleHook + 'static) -> Self {
        Self {
            operation,
            phase,
            field: None,
            once_per_request: true,
            hook: Arc::new(hook),
        }
    }

    pub fn from_fn<F>(operation: Operation, phase: TransactionPhase, hook: F) -> Self
    where
        F: Fn(&HookInvocation, &PersistentResource, &mut RequestScope) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::new(operation, phase, FnHook(hook))
    }

    /// Restricts the binding to changes of one field.
    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Fires once per distinct change instead of once per request.
    pub fn per_change(mut self) -> Self {
        self.once_per_request = false;
        self
    }
}

impl fmt::Debug for HookBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBinding")
            .field("operation", &self.operation)
            .field("phase", &self.phase)
            .field("field", &self.field)
            .field("once_per_request", &self.once_per_request)
            .finish_non_exhaustive()
    }
}

/// Identity of one firing; a key fires at most once per phase.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FiringKey {
    object: ObjectId,
    operation: Operation,
    field: Option<String>,
    binding: usize,
    change: Option<ChangeSpec>,
}

pub(crate) struct Firing {
    pub key: FiringKey,
    pub hook: Arc<dyn LifecycleHook>,
    pub invocation: HookInvocation,
    pub resource: PersistentResource,
}

/// Plans the firings for `batch`, skipping keys already in `fired`.
pub(crate) fn plan(
    dictionary: &EntityDictionary,
    phase: TransactionPhase,
    batch: &[LifecycleTrigger],
    fired: &[FiringKey],
) -> Result<Vec<Firing>> {
    let mut firings: Vec<Firing> = Vec::new();

    for trigger in batch {
        let entity = dictionary.entity(trigger.resource.type_name())?;

        for (index, binding) in entity.hooks().iter().enumerate() {
            if binding.operation != trigger.operation || binding.phase != phase {
                continue;
            }

            let (key_field, key_change) = match (&trigger.field, &binding.field) {
                (None, None) if binding.once_per_request => (None, None),
                (Some(field), Some(bound)) if field == bound => {
                    if binding.once_per_request {
                        (Some(field.clone()), None)
                    } else {
                        (Some(field.clone()), trigger.change.clone())
                    }
                }
                (Some(field), None) if !binding.once_per_request => {
                    (Some(field.clone()), trigger.change.clone())
                }
                _ => continue,
            };

            let key = FiringKey {
                object: trigger.resource.object(),
                operation: trigger.operation,
                field: key_field,
                binding: index,
                change: key_change,
            };
            if fired.contains(&key) {
                continue;
            }

            if let Some(existing) = firings.iter_mut().find(|f| f.key == key) {
                existing.invocation.change = trigger.change.clone();
                continue;
            }

            firings.push(Firing {
                invocation: HookInvocation {
                    operation: trigger.operation,
                    phase,
                    field: trigger.field.clone(),
                    change: trigger.change.clone(),
                },
                key,
                hook: Arc::clone(&binding.hook),
                resource: trigger.resource.clone(),
            });
        }
    }

    Ok(firings)
}
