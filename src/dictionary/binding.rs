// ============================================================================
// Entity Bindings
// ============================================================================
//
// Declarative description of one entity type: attributes, relationships,
// permission expressions, lifecycle hooks and audit statements. Bindings are
// assembled with builder methods and frozen into an `EntityDictionary`.
//
// ============================================================================

use crate::audit::AuditBinding;
use crate::core::{DataType, Value};
use crate::lifecycle::HookBinding;
use crate::security::{PermissionExpression, PermissionKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationshipType {
    pub fn is_to_many(&self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    pub fn is_to_one(&self) -> bool {
        !self.is_to_many()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeBinding {
    pub name: String,
    pub data_type: DataType,
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipBinding {
    pub name: String,
    pub target: String,
    pub kind: RelationshipType,
    pub inverse: Option<String>,
    pub cascade_delete: bool,
}

impl RelationshipBinding {
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationshipType) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            inverse: None,
            cascade_delete: false,
        }
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipType::ManyToOne)
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipType::OneToMany)
    }

    pub fn kind(mut self, kind: RelationshipType) -> Self {
        self.kind = kind;
        self
    }

    /// Name of the field on the target that points back here.
    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    /// Deleting the owner deletes every member of this relationship.
    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }
}

/// A permission expression still in text form, parsed at dictionary build.
#[derive(Debug, Clone)]
pub(crate) struct PendingExpression {
    pub field: Option<String>,
    pub kind: PermissionKind,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct EntityBinding {
    name: String,
    superclass: Option<String>,
    id_generated: bool,
    transferable: bool,
    attributes: Vec<AttributeBinding>,
    relationships: Vec<RelationshipBinding>,
    class_permissions: BTreeMap<PermissionKind, PermissionExpression>,
    field_permissions: BTreeMap<(String, PermissionKind), PermissionExpression>,
    pub(crate) pending: Vec<PendingExpression>,
    hooks: Vec<HookBinding>,
    audits: Vec<AuditBinding>,
}

impl EntityBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            id_generated: false,
            transferable: true,
            attributes: Vec::new(),
            relationships: Vec::new(),
            class_permissions: BTreeMap::new(),
            field_permissions: BTreeMap::new(),
            pending: Vec::new(),
            hooks: Vec::new(),
            audits: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------

    pub fn attribute(self, name: impl Into<String>, data_type: DataType) -> Self {
        self.attribute_with_default(name, data_type, Value::Null)
    }

    pub fn attribute_with_default(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        default: impl Into<Value>,
    ) -> Self {
        self.attributes.push(AttributeBinding {
            name: name.into(),
            data_type,
            default: default.into(),
        });
        self
    }

    pub fn relationship(mut self, relationship: RelationshipBinding) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn superclass(mut self, name: impl Into<String>) -> Self {
        self.superclass = Some(name.into());
        self
    }

    /// The store assigns identifiers on create.
    pub fn id_generated(mut self, generated: bool) -> Self {
        self.id_generated = generated;
        self
    }

    /// Whether existing instances may be linked into another object's
    /// relationship.
    pub fn transferable(mut self, transferable: bool) -> Self {
        self.transferable = transferable;
        self
    }

    /// Class-level permission, parsed when the dictionary is built.
    pub fn permission(mut self, kind: PermissionKind, expression: impl Into<String>) -> Self {
        self.pending.push(PendingExpression {
            field: None,
            kind,
            text: expression.into(),
        });
        self
    }

    pub fn permission_expr(mut self, kind: PermissionKind, expression: PermissionExpression) -> Self {
        self.class_permissions.insert(kind, expression);
        self
    }

    /// Field-level permission, parsed when the dictionary is built.
    pub fn field_permission(
        mut self,
        field: impl Into<String>,
        kind: PermissionKind,
        expression: impl Into<String>,
    ) -> Self {
        self.pending.push(PendingExpression {
            field: Some(field.into()),
            kind,
            text: expression.into(),
        });
        self
    }

    pub fn field_permission_expr(
        mut self,
        field: impl Into<String>,
        kind: PermissionKind,
        expression: PermissionExpression,
    ) -> Self {
        self.field_permissions.insert((field.into(), kind), expression);
        self
    }

    pub fn hook(mut self, hook: HookBinding) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn audit(mut self, audit: AuditBinding) -> Self {
        self.audits.push(audit);
        self
    }

    pub(crate) fn set_class_permission(&mut self, kind: PermissionKind, expression: PermissionExpression) {
        self.class_permissions.insert(kind, expression);
    }

    pub(crate) fn set_field_permission(
        &mut self,
        field: String,
        kind: PermissionKind,
        expression: PermissionExpression,
    ) {
        self.field_permissions.insert((field, kind), expression);
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass_name(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn is_id_generated(&self) -> bool {
        self.id_generated
    }

    pub fn is_transferable(&self) -> bool {
        self.transferable
    }

    pub fn attributes(&self) -> &[AttributeBinding] {
        &self.attributes
    }

    pub fn attribute_binding(&self, name: &str) -> Option<&AttributeBinding> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationships(&self) -> &[RelationshipBinding] {
        &self.relationships
    }

    pub fn relationship_binding(&self, name: &str) -> Option<&RelationshipBinding> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn class_permission(&self, kind: PermissionKind) -> Option<&PermissionExpression> {
        self.class_permissions.get(&kind)
    }

    pub fn field_permission_for(&self, field: &str, kind: PermissionKind) -> Option<&PermissionExpression> {
        self.field_permissions.get(&(field.to_string(), kind))
    }

    pub fn permissions(&self) -> impl Iterator<Item = &PermissionExpression> {
        self.class_permissions
            .values()
            .chain(self.field_permissions.values())
    }

    pub fn hooks(&self) -> &[HookBinding] {
        &self.hooks
    }

    pub fn audits(&self) -> &[AuditBinding] {
        &self.audits
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.attribute_binding(name).is_some() || self.relationship_binding(name).is_some()
    }
}
