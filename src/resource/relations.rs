// ============================================================================
// Relationship Mutation
// ============================================================================
//
// Every relationship edit touches up to three fields: the field being
// edited plus the inverse field on each member entering or leaving it. A
// `RelationPlan` records the edits against an overlay of pending values and
// checks UPDATE on each side as the edit is planned. Nothing is written to
// the arena until every check in the plan has passed.
//
// ============================================================================

use super::change::ChangeSpec;
use super::persistent::PersistentResource;
use super::record::{FieldValue, ObjectId, RelationValue};
use crate::audit::LogMessage;
use crate::core::{EngineError, ForbiddenAccess, Result};
use crate::dictionary::RelationshipBinding;
use crate::request::RequestScope;
use crate::security::{PermissionKind, SecurityMode};
use std::collections::HashMap;

struct PlannedEdit {
    resource: PersistentResource,
    change: ChangeSpec,
}

#[derive(Default)]
pub(crate) struct RelationPlan {
    overlay: HashMap<(ObjectId, String), RelationValue>,
    edits: Vec<PlannedEdit>,
}

/// Plans edits with `build` and applies them only if planning and audit
/// rendering both succeeded. Commit checks queued by a failed plan are
/// discarded.
pub(crate) fn execute_plan<F>(scope: &mut RequestScope, build: F) -> Result<bool>
where
    F: FnOnce(&mut RelationPlan, &mut RequestScope) -> Result<()>,
{
    let checkpoint = scope.permission_executor().checkpoint();
    let mut plan = RelationPlan::default();
    let audit = build(&mut plan, scope).and_then(|()| plan.render_audit(scope));
    match audit {
        Ok(messages) => plan.apply(scope, messages),
        Err(err) => {
            scope.permission_executor_mut().rollback_to(checkpoint);
            Err(err)
        }
    }
}

impl RelationPlan {
    fn current(&self, scope: &mut RequestScope, object: ObjectId, field: &str) -> Result<RelationValue> {
        if let Some(value) = self.overlay.get(&(object, field.to_string())) {
            return Ok(value.clone());
        }
        let (transaction, arena) = scope.storage();
        transaction.get_relation(arena, object, field)
    }

    /// Plans `field` on `resource` to become `value`. Unchanged values are
    /// skipped; anything else must pass a field-level UPDATE check.
    fn set(
        &mut self,
        scope: &mut RequestScope,
        resource: &PersistentResource,
        field: &str,
        value: RelationValue,
    ) -> Result<()> {
        let original = self.current(scope, resource.object(), field)?;
        if original == value {
            return Ok(());
        }

        let change = ChangeSpec::relation(
            resource.object(),
            resource.type_name(),
            field,
            original,
            value.clone(),
        );
        scope.check_object_field(PermissionKind::Update, resource.object(), field, Some(&change))?;

        self.overlay
            .insert((resource.object(), field.to_string()), value);
        self.edits.push(PlannedEdit {
            resource: resource.clone(),
            change,
        });
        Ok(())
    }

    /// Replaces a collection's membership. An uninitialized collection is
    /// first planned as its own change to an empty one.
    fn set_members(
        &mut self,
        scope: &mut RequestScope,
        resource: &PersistentResource,
        field: &str,
        members: Vec<ObjectId>,
    ) -> Result<()> {
        if self.current(scope, resource.object(), field)? == RelationValue::ToMany(None) {
            self.set(scope, resource, field, RelationValue::empty_to_many())?;
        }
        self.set(scope, resource, field, RelationValue::ToMany(Some(members)))
    }

    fn add_member(
        &mut self,
        scope: &mut RequestScope,
        resource: &PersistentResource,
        field: &str,
        member: ObjectId,
    ) -> Result<()> {
        let mut members = match self.current(scope, resource.object(), field)? {
            RelationValue::ToMany(members) => members.unwrap_or_default(),
            RelationValue::ToOne(_) => {
                return Err(EngineError::invalid_relationship(resource.type_name(), field));
            }
        };
        if !members.contains(&member) {
            members.push(member);
        }
        self.set_members(scope, resource, field, members)
    }

    fn remove_member(
        &mut self,
        scope: &mut RequestScope,
        resource: &PersistentResource,
        field: &str,
        member: ObjectId,
    ) -> Result<()> {
        let current = self.current(scope, resource.object(), field)?;
        let RelationValue::ToMany(Some(members)) = current else {
            return Ok(());
        };
        if !members.contains(&member) {
            return Ok(());
        }
        let remaining = members.into_iter().filter(|m| *m != member).collect();
        self.set(scope, resource, field, RelationValue::ToMany(Some(remaining)))
    }

    /// Points the inverse of `relationship` on `other` at `owner`.
    pub(crate) fn link_inverse(
        &mut self,
        scope: &mut RequestScope,
        relationship: &RelationshipBinding,
        owner: &PersistentResource,
        other: &PersistentResource,
    ) -> Result<()> {
        let Some(inverse) = &relationship.inverse else {
            return Ok(());
        };
        let to_many = scope
            .dictionary()
            .relationship(other.type_name(), inverse)?
            .kind
            .is_to_many();

        if to_many {
            self.add_member(scope, other, inverse, owner.object())
        } else {
            self.set(scope, other, inverse, RelationValue::ToOne(Some(owner.object())))
        }
    }

    /// Detaches `owner` from the inverse of `relationship` on `other`.
    pub(crate) fn unlink_inverse(
        &mut self,
        scope: &mut RequestScope,
        relationship: &RelationshipBinding,
        owner: ObjectId,
        other: &PersistentResource,
    ) -> Result<()> {
        let Some(inverse) = &relationship.inverse else {
            return Ok(());
        };
        let to_many = scope
            .dictionary()
            .relationship(other.type_name(), inverse)?
            .kind
            .is_to_many();

        if to_many {
            self.remove_member(scope, other, inverse, owner)
        } else if self.current(scope, other.object(), inverse)? == RelationValue::ToOne(Some(owner)) {
            self.set(scope, other, inverse, RelationValue::ToOne(None))
        } else {
            Ok(())
        }
    }

    /// Audit messages for every planned edit. Audit expressions read
    /// attributes and ids only, so rendering ahead of the edits yields the
    /// same text.
    fn render_audit(&self, scope: &RequestScope) -> Result<Vec<LogMessage>> {
        let mut messages = Vec::new();
        for edit in &self.edits {
            messages.extend(scope.render_field_audit(&edit.resource, &edit.change.field)?);
        }
        Ok(messages)
    }

    /// Writes every planned edit, in planning order, then buffers `audit`.
    /// Returns whether anything changed.
    fn apply(self, scope: &mut RequestScope, audit: Vec<LogMessage>) -> Result<bool> {
        let changed = !self.edits.is_empty();

        for PlannedEdit { resource, change } in self.edits {
            let FieldValue::Relation(value) = &change.modified else {
                continue;
            };
            let object = resource.object();

            scope
                .arena_mut()
                .record_mut(object)?
                .relations
                .insert(change.field.clone(), value.clone());
            {
                let (transaction, arena) = scope.storage();
                match value {
                    RelationValue::ToOne(target) => {
                        transaction.update_to_one_relation(arena, object, &change.field, *target)?
                    }
                    RelationValue::ToMany(_) => transaction.update_to_many_relation(
                        arena,
                        object,
                        &change.field,
                        &change.added_members(),
                        &change.removed_members(),
                    )?,
                }
            }
            scope.mark_dirty(object);

            let operation = scope.mutation_operation(object);
            scope.queue_field_triggers(&resource, operation, &change.field, Some(change.clone()));
        }
        scope.buffer_audit(audit);
        Ok(changed)
    }
}

impl PersistentResource {
    /// Adds `target` to a relationship. On a to-one relationship this
    /// replaces the current target.
    pub fn add_relation(
        &self,
        name: &str,
        target: &PersistentResource,
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let relationship = self.relationship(name, scope)?;
        self.ensure_target(&relationship, target, scope)?;
        if relationship.kind.is_to_one() {
            return self.update_to_one(&relationship, Some(target), scope);
        }

        if self.relation_value(name, scope)?.contains(target.object()) {
            return Ok(false);
        }
        execute_plan(scope, |plan, scope| {
            self.check_share(target, scope)?;
            plan.add_member(scope, self, name, target.object())?;
            plan.link_inverse(scope, &relationship, self, target)
        })
    }

    /// Removes `target` from a relationship; a no-op if it is not a member.
    pub fn remove_relation(
        &self,
        name: &str,
        target: &PersistentResource,
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let relationship = self.relationship(name, scope)?;
        if !self.relation_value(name, scope)?.contains(target.object()) {
            return Ok(false);
        }
        if relationship.kind.is_to_one() {
            return self.update_to_one(&relationship, None, scope);
        }

        execute_plan(scope, |plan, scope| {
            plan.remove_member(scope, self, name, target.object())?;
            plan.unlink_inverse(scope, &relationship, self.object(), target)
        })
    }

    /// Replaces the members of a relationship with `targets`.
    ///
    /// Only members the user can read are replaced; unreadable members are
    /// kept. Surviving members keep their order and new ones are appended.
    pub fn update_relation(
        &self,
        name: &str,
        targets: &[PersistentResource],
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let relationship = self.relationship(name, scope)?;
        for target in targets {
            self.ensure_target(&relationship, target, scope)?;
        }

        if relationship.kind.is_to_many() {
            return self.update_to_many(&relationship, targets, scope);
        }
        match targets {
            [] => self.update_to_one(&relationship, None, scope),
            [target] => self.update_to_one(&relationship, Some(target), scope),
            _ => Err(EngineError::InvalidValue(format!(
                "to-one relationship '{}.{}' cannot hold {} members",
                self.type_name(),
                name,
                targets.len()
            ))),
        }
    }

    /// Removes every readable member of a relationship.
    pub fn clear_relation(&self, name: &str, scope: &mut RequestScope) -> Result<bool> {
        let relationship = self.relationship(name, scope)?;
        if relationship.kind.is_to_one() {
            return match self.relation_value(name, scope)? {
                RelationValue::ToOne(Some(current))
                    if scope.check_object(PermissionKind::Read, current).is_ok() =>
                {
                    self.update_to_one(&relationship, None, scope)
                }
                _ => Ok(false),
            };
        }
        self.update_to_many(&relationship, &[], scope)
    }

    fn relationship(&self, name: &str, scope: &RequestScope) -> Result<RelationshipBinding> {
        Ok(scope
            .dictionary()
            .relationship(self.type_name(), name)?
            .clone())
    }

    fn ensure_target(
        &self,
        relationship: &RelationshipBinding,
        target: &PersistentResource,
        scope: &RequestScope,
    ) -> Result<()> {
        if scope
            .dictionary()
            .is_subtype_of(target.type_name(), &relationship.target)
        {
            Ok(())
        } else {
            Err(EngineError::InvalidValue(format!(
                "'{}.{}' holds {}, not {}",
                self.type_name(),
                relationship.name,
                relationship.target,
                target.type_name()
            )))
        }
    }

    /// Linking an existing object into a new relationship shares it: the
    /// type must be transferable and SHARE must pass. Objects created in
    /// this request are exempt.
    fn check_share(&self, target: &PersistentResource, scope: &mut RequestScope) -> Result<()> {
        if scope.is_new(target.object())
            || scope.permission_executor().mode() == SecurityMode::Bypass
        {
            return Ok(());
        }
        if !scope.dictionary().is_transferable(target.type_name()) {
            return Err(EngineError::ForbiddenAccess(ForbiddenAccess::new(
                PermissionKind::Share,
                target.type_name(),
            )));
        }
        scope.check_object(PermissionKind::Share, target.object())
    }

    fn update_to_one(
        &self,
        relationship: &RelationshipBinding,
        target: Option<&PersistentResource>,
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let name = relationship.name.as_str();
        let previous = match self.relation_value(name, scope)? {
            RelationValue::ToOne(previous) => previous,
            RelationValue::ToMany(_) => {
                return Err(EngineError::invalid_relationship(self.type_name(), name));
            }
        };
        let next = target.map(PersistentResource::object);
        if previous == next {
            return Ok(false);
        }

        execute_plan(scope, |plan, scope| {
            if let Some(target) = target {
                self.check_share(target, scope)?;
            }
            plan.set(scope, self, name, RelationValue::ToOne(next))?;
            if let Some(previous) = previous {
                let old = scope.resource_for(previous)?;
                plan.unlink_inverse(scope, relationship, self.object(), &old)?;
            }
            if let Some(target) = target {
                plan.link_inverse(scope, relationship, self, target)?;
            }
            Ok(())
        })
    }

    /// Diffs the requested membership against the readable one:
    ///
    /// ```text
    /// mine     = current members the user can read
    /// deleted  = mine - requested
    /// added    = requested - mine
    /// result   = (current - deleted) ++ (added not already present)
    /// ```
    fn update_to_many(
        &self,
        relationship: &RelationshipBinding,
        requested: &[PersistentResource],
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let name = relationship.name.as_str();
        let current = self.relation_value(name, scope)?;
        if !current.is_to_many() {
            return Err(EngineError::invalid_relationship(self.type_name(), name));
        }
        let all = current.members();

        let mine: Vec<ObjectId> = all
            .iter()
            .copied()
            .filter(|member| {
                !scope.is_deleted(*member)
                    && scope.check_object(PermissionKind::Read, *member).is_ok()
            })
            .collect();

        let mut requested_ids: Vec<ObjectId> = Vec::new();
        for target in requested {
            if !requested_ids.contains(&target.object()) {
                requested_ids.push(target.object());
            }
        }

        let deleted: Vec<ObjectId> = mine
            .iter()
            .copied()
            .filter(|member| !requested_ids.contains(member))
            .collect();
        let added: Vec<&PersistentResource> = requested
            .iter()
            .filter(|target| !mine.contains(&target.object()))
            .fold(Vec::new(), |mut unique, target| {
                if !unique.iter().any(|seen: &&PersistentResource| seen.object() == target.object()) {
                    unique.push(target);
                }
                unique
            });

        if deleted.is_empty() && added.is_empty() {
            return Ok(false);
        }

        let mut result: Vec<ObjectId> = all
            .iter()
            .copied()
            .filter(|member| !deleted.contains(member))
            .collect();
        for target in &added {
            if !result.contains(&target.object()) {
                result.push(target.object());
            }
        }

        execute_plan(scope, |plan, scope| {
            for target in &added {
                if !all.contains(&target.object()) {
                    self.check_share(target, scope)?;
                }
            }
            plan.set_members(scope, self, name, result)?;
            for member in &deleted {
                let old = scope.resource_for(*member)?;
                plan.unlink_inverse(scope, relationship, self.object(), &old)?;
            }
            for target in &added {
                plan.link_inverse(scope, relationship, self, target)?;
            }
            Ok(())
        })
    }
}
