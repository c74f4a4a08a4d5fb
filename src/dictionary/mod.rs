// ============================================================================
// Entity Dictionary
// ============================================================================
//
// Immutable registry of entity bindings and named checks. Built once at
// startup, validated, and shared read-only across requests through an `Arc`.
//
// ============================================================================

pub mod binding;

pub use binding::{AttributeBinding, EntityBinding, RelationshipBinding, RelationshipType};

use crate::core::{EngineError, Result};
use crate::security::{Check, PermissionExpression, PermissionKind};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub struct EntityDictionary {
    entities: HashMap<String, EntityBinding>,
    checks: HashMap<String, Arc<dyn Check>>,
}

impl fmt::Debug for EntityDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entities: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        entities.sort_unstable();
        let mut checks: Vec<&str> = self.checks.keys().map(String::as_str).collect();
        checks.sort_unstable();
        f.debug_struct("EntityDictionary")
            .field("entities", &entities)
            .field("checks", &checks)
            .finish()
    }
}

impl EntityDictionary {
    pub fn builder() -> DictionaryBuilder {
        DictionaryBuilder::default()
    }

    pub fn entity(&self, type_name: &str) -> Result<&EntityBinding> {
        self.entities
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownEntity(type_name.to_string()))
    }

    pub fn has_entity(&self, type_name: &str) -> bool {
        self.entities.contains_key(type_name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn attribute(&self, type_name: &str, field: &str) -> Result<&AttributeBinding> {
        self.entity(type_name)?
            .attribute_binding(field)
            .ok_or_else(|| EngineError::invalid_attribute(type_name, field))
    }

    pub fn relationship(&self, type_name: &str, field: &str) -> Result<&RelationshipBinding> {
        self.entity(type_name)?
            .relationship_binding(field)
            .ok_or_else(|| EngineError::invalid_relationship(type_name, field))
    }

    pub fn inverse_of(&self, type_name: &str, field: &str) -> Option<&str> {
        self.relationship(type_name, field)
            .ok()
            .and_then(|r| r.inverse.as_deref())
    }

    pub fn check(&self, name: &str) -> Option<&Arc<dyn Check>> {
        self.checks.get(name)
    }

    pub fn class_expression(&self, type_name: &str, kind: PermissionKind) -> Option<&PermissionExpression> {
        self.entities.get(type_name)?.class_permission(kind)
    }

    pub fn field_expression(
        &self,
        type_name: &str,
        field: &str,
        kind: PermissionKind,
    ) -> Option<&PermissionExpression> {
        self.entities.get(type_name)?.field_permission_for(field, kind)
    }

    /// The type followed by its superclasses, nearest first.
    pub fn type_aliases<'a>(&'a self, type_name: &'a str) -> Vec<&'a str> {
        let mut aliases = vec![type_name];
        let mut current = self.entities.get(type_name);
        while let Some(superclass) = current.and_then(EntityBinding::superclass_name) {
            if aliases.contains(&superclass) {
                break;
            }
            aliases.push(superclass);
            current = self.entities.get(superclass);
        }
        aliases
    }

    /// Root of the superclass chain.
    pub fn base_type<'a>(&'a self, type_name: &'a str) -> &'a str {
        self.type_aliases(type_name)
            .last()
            .copied()
            .unwrap_or(type_name)
    }

    pub fn is_subtype_of(&self, type_name: &str, ancestor: &str) -> bool {
        self.type_aliases(type_name).contains(&ancestor)
    }

    pub fn is_id_generated(&self, type_name: &str) -> bool {
        self.entities
            .get(type_name)
            .is_some_and(EntityBinding::is_id_generated)
    }

    pub fn is_transferable(&self, type_name: &str) -> bool {
        self.entities
            .get(type_name)
            .is_some_and(EntityBinding::is_transferable)
    }
}

#[derive(Default)]
pub struct DictionaryBuilder {
    entities: Vec<EntityBinding>,
    checks: HashMap<String, Arc<dyn Check>>,
}

impl DictionaryBuilder {
    /// Registers a named check.
    pub fn check(mut self, name: impl Into<String>, check: impl Check + 'static) -> Self {
        self.checks.insert(name.into(), Arc::new(check));
        self
    }

    pub fn entity(mut self, binding: EntityBinding) -> Self {
        self.entities.push(binding);
        self
    }

    /// Validates the bindings and freezes them.
    pub fn build(self) -> Result<Arc<EntityDictionary>> {
        let mut entities: HashMap<String, EntityBinding> = HashMap::new();
        for binding in self.entities {
            let name = binding.name().to_string();
            if entities.insert(name.clone(), binding).is_some() {
                return Err(EngineError::Configuration(format!(
                    "entity '{}' is declared twice",
                    name
                )));
            }
        }

        for binding in entities.values_mut() {
            parse_pending(binding)?;
        }

        let order = inheritance_order(&entities)?;
        for name in order {
            let Some(superclass) = entities
                .get(&name)
                .and_then(|b| b.superclass_name().map(str::to_string))
            else {
                continue;
            };
            let parent = entities
                .get(&superclass)
                .cloned()
                .ok_or_else(|| EngineError::UnknownEntity(superclass.clone()))?;
            if let Some(child) = entities.get_mut(&name) {
                inherit(child, &parent);
            }
        }

        let dictionary = EntityDictionary {
            entities,
            checks: self.checks,
        };
        validate(&dictionary)?;
        Ok(Arc::new(dictionary))
    }
}

fn parse_pending(binding: &mut EntityBinding) -> Result<()> {
    for pending in std::mem::take(&mut binding.pending) {
        let expression = PermissionExpression::parse(&pending.text)?;
        match pending.field {
            Some(field) => binding.set_field_permission(field, pending.kind, expression),
            None => binding.set_class_permission(pending.kind, expression),
        }
    }
    Ok(())
}

/// Entity names ordered so that every superclass precedes its subclasses.
fn inheritance_order(entities: &HashMap<String, EntityBinding>) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(entities.len());
    let mut placed: HashSet<String> = HashSet::new();

    let mut names: Vec<&String> = entities.keys().collect();
    names.sort();

    for name in names {
        let mut chain = Vec::new();
        let mut current = Some(name.clone());
        while let Some(type_name) = current {
            if placed.contains(&type_name) {
                break;
            }
            if chain.contains(&type_name) {
                return Err(EngineError::Configuration(format!(
                    "inheritance cycle through '{}'",
                    type_name
                )));
            }
            let binding = entities
                .get(&type_name)
                .ok_or_else(|| EngineError::UnknownEntity(type_name.clone()))?;
            current = binding.superclass_name().map(str::to_string);
            chain.push(type_name);
        }
        for type_name in chain.into_iter().rev() {
            placed.insert(type_name.clone());
            order.push(type_name);
        }
    }
    Ok(order)
}

/// Copies fields and permissions the child does not declare itself.
fn inherit(child: &mut EntityBinding, parent: &EntityBinding) {
    let mut merged = EntityBinding::new(child.name())
        .id_generated(child.is_id_generated())
        .transferable(child.is_transferable());
    if let Some(superclass) = child.superclass_name() {
        merged = merged.superclass(superclass);
    }

    for attribute in parent.attributes() {
        if !child.has_field(&attribute.name) {
            merged = merged.attribute_with_default(
                attribute.name.clone(),
                attribute.data_type,
                attribute.default.clone(),
            );
        }
    }
    for attribute in child.attributes() {
        merged = merged.attribute_with_default(
            attribute.name.clone(),
            attribute.data_type,
            attribute.default.clone(),
        );
    }
    for relationship in parent.relationships() {
        if !child.has_field(&relationship.name) {
            merged = merged.relationship(relationship.clone());
        }
    }
    for relationship in child.relationships() {
        merged = merged.relationship(relationship.clone());
    }

    for kind in PermissionKind::ALL {
        if let Some(expression) = child.class_permission(kind).or(parent.class_permission(kind)) {
            merged.set_class_permission(kind, expression.clone());
        }
        for field in parent
            .attributes()
            .iter()
            .map(|a| &a.name)
            .chain(parent.relationships().iter().map(|r| &r.name))
        {
            if let Some(expression) = parent.field_permission_for(field, kind) {
                merged.set_field_permission(field.clone(), kind, expression.clone());
            }
        }
        for field in child
            .attributes()
            .iter()
            .map(|a| &a.name)
            .chain(child.relationships().iter().map(|r| &r.name))
        {
            if let Some(expression) = child.field_permission_for(field, kind) {
                merged.set_field_permission(field.clone(), kind, expression.clone());
            }
        }
    }

    for hook in child.hooks() {
        merged = merged.hook(hook.clone());
    }
    for audit in child.audits() {
        merged = merged.audit(audit.clone());
    }
    *child = merged;
}

fn validate(dictionary: &EntityDictionary) -> Result<()> {
    for binding in dictionary.entities.values() {
        let type_name = binding.name();

        let mut seen = HashSet::new();
        for field in binding
            .attributes()
            .iter()
            .map(|a| a.name.as_str())
            .chain(binding.relationships().iter().map(|r| r.name.as_str()))
        {
            if !seen.insert(field) {
                return Err(EngineError::Configuration(format!(
                    "field '{}' is declared twice on '{}'",
                    field, type_name
                )));
            }
        }

        for relationship in binding.relationships() {
            let target = dictionary.entity(&relationship.target)?;
            let Some(inverse) = &relationship.inverse else {
                continue;
            };
            let back = target.relationship_binding(inverse).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "inverse '{}.{}' of '{}.{}' does not exist",
                    relationship.target, inverse, type_name, relationship.name
                ))
            })?;
            let points_back = back.inverse.as_deref() == Some(relationship.name.as_str())
                && dictionary.is_subtype_of(type_name, &back.target);
            if !points_back {
                return Err(EngineError::Configuration(format!(
                    "inverse '{}.{}' does not point back to '{}.{}'",
                    relationship.target, inverse, type_name, relationship.name
                )));
            }
        }

        for expression in binding.permissions() {
            for name in expression.check_names() {
                if dictionary.check(name).is_none() {
                    return Err(EngineError::Configuration(format!(
                        "permission on '{}' references unknown check '{}'",
                        type_name, name
                    )));
                }
            }
        }

        let hook_fields = binding.hooks().iter().filter_map(|h| h.field.as_deref());
        let audit_fields = binding.audits().iter().filter_map(|a| a.field.as_deref());
        for field in hook_fields.chain(audit_fields) {
            if !binding.has_field(field) {
                return Err(EngineError::Configuration(format!(
                    "binding on '{}' references unknown field '{}'",
                    type_name, field
                )));
            }
        }
    }
    Ok(())
}
