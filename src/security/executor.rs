// ============================================================================
// Permission Executor
// ============================================================================
//
// Evaluates class- and field-level permission expressions for one request.
// Immediate checks run at the call site; expressions that cannot be decided
// without commit-time checks are queued and re-evaluated in full by
// `execute_commit_checks`.
//
// ============================================================================

use super::check::CheckContext;
use super::expression::{EvaluationMode, ExpressionResult, PermissionExpression};
use super::{PermissionKind, SecurityMode, User};
use crate::config::EngineConfig;
use crate::core::{EngineError, ForbiddenAccess, Result};
use crate::dictionary::EntityDictionary;
use crate::resource::{ChangeSpec, ObjectArena, ObjectId};
use std::collections::HashSet;
use tracing::{Level, debug, event, info_span, trace};

/// Borrowed request state a permission evaluation needs.
pub struct SecurityEnv<'a> {
    pub dictionary: &'a EntityDictionary,
    pub arena: &'a ObjectArena,
    pub user: &'a User,
    /// Objects created in this request; their update checks use CREATE.
    pub new_objects: &'a HashSet<ObjectId>,
}

/// An expression waiting for `execute_commit_checks`.
#[derive(Debug, Clone)]
pub struct QueuedCheck {
    pub kind: PermissionKind,
    pub type_name: String,
    pub field: Option<String>,
    pub object: ObjectId,
    pub change: Option<ChangeSpec>,
    pub expression: PermissionExpression,
}

#[derive(Debug)]
pub struct PermissionExecutor {
    mode: SecurityMode,
    verbose_errors: bool,
    commit_queue: Vec<QueuedCheck>,
}

impl PermissionExecutor {
    pub fn new(mode: SecurityMode, verbose_errors: bool) -> Self {
        Self {
            mode,
            verbose_errors,
            commit_queue: Vec::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.security_mode, config.verbose_errors)
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Evaluates the class-level expression for `kind` on `object`.
    pub fn check_permission(
        &mut self,
        env: &SecurityEnv<'_>,
        kind: PermissionKind,
        object: ObjectId,
    ) -> Result<()> {
        self.check(env, kind, object, None, None)
    }

    /// Evaluates the field-level expression for `kind`, falling back to the
    /// class-level one when the field declares none.
    pub fn check_specific_field_permissions(
        &mut self,
        env: &SecurityEnv<'_>,
        object: ObjectId,
        change: Option<&ChangeSpec>,
        kind: PermissionKind,
        field: &str,
    ) -> Result<()> {
        self.check(env, kind, object, Some(field), change)
    }

    /// Evaluates every queued expression with all checks enabled. The
    /// first failure aborts with `ForbiddenAccess`.
    pub fn execute_commit_checks(&mut self, env: &SecurityEnv<'_>) -> Result<()> {
        let span = info_span!("commit_checks", pending = self.commit_queue.len());
        let _enter = span.enter();

        for queued in std::mem::take(&mut self.commit_queue) {
            let context =
                CheckContext::new(env.user, env.arena, queued.object, queued.change.as_ref());
            let result =
                queued
                    .expression
                    .evaluate(env.dictionary, &context, EvaluationMode::AllChecks)?;

            if result != ExpressionResult::Pass {
                return Err(self.denied(
                    queued.kind,
                    &queued.type_name,
                    queued.field.as_deref(),
                    &queued.expression,
                ));
            }
        }

        event!(Level::DEBUG, "commit checks passed");
        Ok(())
    }

    pub fn pending_commit_checks(&self) -> &[QueuedCheck] {
        &self.commit_queue
    }

    /// Marks the current end of the commit queue.
    pub fn checkpoint(&self) -> usize {
        self.commit_queue.len()
    }

    /// Drops commit checks queued after `checkpoint`.
    pub fn rollback_to(&mut self, checkpoint: usize) {
        self.commit_queue.truncate(checkpoint);
    }

    fn check(
        &mut self,
        env: &SecurityEnv<'_>,
        kind: PermissionKind,
        object: ObjectId,
        field: Option<&str>,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        if self.mode == SecurityMode::Bypass {
            return Ok(());
        }

        let type_name = env.arena.type_of(object)?;
        let kind = if kind == PermissionKind::Update && env.new_objects.contains(&object) {
            PermissionKind::Create
        } else {
            kind
        };

        let expression = field
            .and_then(|field| env.dictionary.field_expression(type_name, field, kind))
            .or_else(|| env.dictionary.class_expression(type_name, kind));
        let Some(expression) = expression else {
            return Ok(());
        };

        let mode = if kind.is_inline_only() {
            EvaluationMode::AllChecks
        } else {
            EvaluationMode::ImmediateOnly
        };
        let context = CheckContext::new(env.user, env.arena, object, change);

        match expression.evaluate(env.dictionary, &context, mode)? {
            ExpressionResult::Pass => Ok(()),
            ExpressionResult::Fail => Err(self.denied(kind, type_name, field, expression)),
            ExpressionResult::Deferred => {
                trace!(%kind, type_name, ?field, "deferring permission check to commit");
                self.commit_queue.push(QueuedCheck {
                    kind,
                    type_name: type_name.to_string(),
                    field: field.map(str::to_string),
                    object,
                    change: change.cloned(),
                    expression: expression.clone(),
                });
                Ok(())
            }
        }
    }

    fn denied(
        &self,
        kind: PermissionKind,
        type_name: &str,
        field: Option<&str>,
        expression: &PermissionExpression,
    ) -> EngineError {
        debug!(%kind, type_name, ?field, "permission denied");
        trace!(expression = %expression, "failed permission expression");

        let mut access = ForbiddenAccess::new(kind, type_name);
        if let Some(field) = field {
            access = access.on_field(field);
        }
        if self.verbose_errors {
            access = access.with_expression(expression.to_string());
        }
        EngineError::forbidden(access)
    }
}
