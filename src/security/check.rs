// ============================================================================
// Checks
// ============================================================================
//
// Named boolean predicates composed into permission expressions. A check
// declares whether it can run at call time or must wait until commit, when
// the request's mutations are complete.
//
// ============================================================================

use super::User;
use crate::core::Value;
use crate::resource::{ChangeSpec, ObjectArena, ObjectId, Record, RelationValue};

/// When a check may be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckTiming {
    /// Evaluated synchronously at the call site.
    Immediate,
    /// Evaluated by `execute_commit_checks`, against post-mutation state.
    Commit,
}

/// Everything a check may inspect.
pub struct CheckContext<'a> {
    user: &'a User,
    arena: &'a ObjectArena,
    object: ObjectId,
    change: Option<&'a ChangeSpec>,
}

impl<'a> CheckContext<'a> {
    pub fn new(
        user: &'a User,
        arena: &'a ObjectArena,
        object: ObjectId,
        change: Option<&'a ChangeSpec>,
    ) -> Self {
        Self {
            user,
            arena,
            object,
            change,
        }
    }

    pub fn user(&self) -> &User {
        self.user
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn record(&self) -> Option<&Record> {
        self.arena.get(self.object)
    }

    pub fn arena(&self) -> &ObjectArena {
        self.arena
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.record().and_then(|record| record.attribute(name))
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.record().and_then(|record| record.relation(name))
    }

    /// The mutation being authorized, for field-level update checks.
    pub fn change(&self) -> Option<&ChangeSpec> {
        self.change
    }
}

/// A pluggable permission predicate.
pub trait Check: Send + Sync {
    fn timing(&self) -> CheckTiming {
        CheckTiming::Immediate
    }

    fn ok(&self, context: &CheckContext<'_>) -> bool;
}

/// Always passes.
pub struct Allow;

impl Check for Allow {
    fn ok(&self, _context: &CheckContext<'_>) -> bool {
        true
    }
}

/// Always fails.
pub struct Deny;

impl Check for Deny {
    fn ok(&self, _context: &CheckContext<'_>) -> bool {
        false
    }
}

/// Passes when the user holds the role.
pub struct HasRole(pub String);

impl HasRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }
}

impl Check for HasRole {
    fn ok(&self, context: &CheckContext<'_>) -> bool {
        context.user().has_role(&self.0)
    }
}

type CheckFn = dyn Fn(&CheckContext<'_>) -> bool + Send + Sync;

/// Adapts a closure into a [`Check`].
pub struct FnCheck {
    timing: CheckTiming,
    predicate: Box<CheckFn>,
}

impl FnCheck {
    pub fn immediate<F>(predicate: F) -> Self
    where
        F: Fn(&CheckContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            timing: CheckTiming::Immediate,
            predicate: Box::new(predicate),
        }
    }

    pub fn commit<F>(predicate: F) -> Self
    where
        F: Fn(&CheckContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            timing: CheckTiming::Commit,
            predicate: Box::new(predicate),
        }
    }
}

impl Check for FnCheck {
    fn timing(&self) -> CheckTiming {
        self.timing
    }

    fn ok(&self, context: &CheckContext<'_>) -> bool {
        (self.predicate)(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Record;

    #[test]
    fn closure_check_reads_record_state() {
        let mut arena = ObjectArena::new();
        let mut record = Record::new("book").with_id("1");
        record.attributes.insert("owner".into(), Value::from("alice"));
        let object = arena.insert(record);

        let is_owner = FnCheck::immediate(|ctx| {
            ctx.attribute("owner").and_then(Value::as_str) == Some(ctx.user().name())
        });

        let alice = User::new("alice");
        let bob = User::new("bob");
        assert!(is_owner.ok(&CheckContext::new(&alice, &arena, object, None)));
        assert!(!is_owner.ok(&CheckContext::new(&bob, &arena, object, None)));
        assert_eq!(is_owner.timing(), CheckTiming::Immediate);
    }

    #[test]
    fn role_check_and_constants() {
        let arena = ObjectArena::new();
        let admin = User::new("root").with_role("admin");
        let ctx = CheckContext::new(&admin, &arena, ObjectId(0), None);

        assert!(HasRole::new("admin").ok(&ctx));
        assert!(!HasRole::new("auditor").ok(&ctx));
        assert!(Allow.ok(&ctx));
        assert!(!Deny.ok(&ctx));
        assert_eq!(FnCheck::commit(|_| true).timing(), CheckTiming::Commit);
    }
}
