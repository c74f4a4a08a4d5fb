// ============================================================================
// Persistent Resource
// ============================================================================
//
// Request-scoped handle on one arena object. Every operation takes the
// owning `RequestScope` explicitly; the handle itself only carries identity
// (type, arena slot, real id, temporary id) and the lineage through which it
// was reached.
//
// Mutations follow one path:
//   no-op check -> permission check -> apply -> mark dirty -> queue triggers
//   -> audit
//
// ============================================================================

use super::lineage::ResourceLineage;
use super::record::{ObjectId, Record, RelationValue};
use super::ChangeSpec;
use crate::core::{EngineError, Result, Value};
use crate::lifecycle::Operation;
use crate::request::RequestScope;
use crate::security::PermissionKind;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PersistentResource {
    type_name: String,
    object: ObjectId,
    id: Option<String>,
    uuid: Option<String>,
    lineage: ResourceLineage,
}

impl PersistentResource {
    pub(crate) fn from_parts(
        type_name: String,
        object: ObjectId,
        id: Option<String>,
        uuid: Option<String>,
        lineage: ResourceLineage,
    ) -> Self {
        Self {
            type_name,
            object,
            id,
            uuid,
            lineage,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Real identifier as of when this handle was taken.
    ///
    /// Handles are snapshots: after [`set_id`](Self::set_id) only the handle
    /// it was called on sees the new id. Other handles to the same object
    /// keep their temporary identity and no longer compare equal to it;
    /// re-wrap them with [`RequestScope::resource_for`].
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Temporary identifier assigned by the client at creation.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn lineage(&self) -> &ResourceLineage {
        &self.lineage
    }

    pub fn record<'a>(&self, scope: &'a RequestScope) -> Result<&'a Record> {
        scope.arena().record(self.object)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// True if `id` is this resource's real or temporary identifier.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id) || self.uuid.as_deref() == Some(id)
    }

    /// Current real id, or the temporary id if none has been assigned yet.
    pub fn resolved_id(&self, scope: &RequestScope) -> Option<String> {
        scope
            .arena()
            .get(self.object)
            .and_then(|record| record.id.clone())
            .or_else(|| self.uuid.clone())
    }

    pub fn is_id_generated(&self, scope: &RequestScope) -> bool {
        scope.dictionary().is_id_generated(&self.type_name)
    }

    /// Assigns the real id to the backing record and to this handle.
    pub fn set_id(&mut self, id: impl Into<String>, scope: &mut RequestScope) -> Result<()> {
        let id = id.into();
        scope.arena_mut().assign_id(self.object, id.clone())?;
        self.id = Some(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Creation and loading
    // ------------------------------------------------------------------

    /// Creates a new object of `type_name`, optionally as a child of
    /// `parent` reached through the named relationship.
    pub fn create_object(
        parent: Option<(&PersistentResource, &str)>,
        type_name: &str,
        scope: &mut RequestScope,
        uuid: Option<&str>,
    ) -> Result<Self> {
        let dictionary = Arc::clone(scope.dictionary());
        let binding = dictionary.entity(type_name)?;

        let object = {
            let (transaction, arena) = scope.storage();
            transaction.create_new_object(arena, binding)?
        };
        scope.register_new(object);
        if let Some(uuid) = uuid {
            scope.set_uuid_for_object(type_name, uuid, object);
        }

        let lineage = match parent {
            Some((parent, relation)) => {
                parent
                    .lineage
                    .extend(relation, &parent.type_name, parent.object)
            }
            None => ResourceLineage::new(),
        };
        let resource = scope.wrap(object, lineage)?;

        scope.check_object(PermissionKind::Create, object)?;
        scope.queue_class_triggers(&resource, Operation::Create);
        scope.audit_class(&resource, Operation::Create)?;
        scope.mark_dirty(object);
        Ok(resource)
    }

    /// Loads `(type_name, id)`, where `id` may also be the temporary id of
    /// an object created earlier in this request.
    pub fn load_record(type_name: &str, id: &str, scope: &mut RequestScope) -> Result<Self> {
        scope.dictionary().entity(type_name)?;

        let object = match scope.get_object_by_uuid(type_name, id) {
            Some(object) => object,
            None => {
                let (transaction, arena) = scope.storage();
                match arena.find(type_name, id) {
                    Some(object) => object,
                    None => transaction
                        .load_object(arena, type_name, id)?
                        .ok_or_else(|| EngineError::invalid_id(type_name, id))?,
                }
            }
        };
        if scope.is_deleted(object) {
            return Err(EngineError::invalid_id(type_name, id));
        }

        let resource = scope.resource_for(object)?;
        scope.check_object(PermissionKind::Read, object)?;
        Ok(resource)
    }

    /// All stored objects of `type_name` the user may read.
    pub fn load_records(type_name: &str, scope: &mut RequestScope) -> Result<Vec<Self>> {
        scope.dictionary().entity(type_name)?;

        let objects = {
            let (transaction, arena) = scope.storage();
            transaction.load_objects(arena, type_name)?
        };
        let resources = objects
            .into_iter()
            .filter(|object| !scope.is_deleted(*object))
            .map(|object| scope.resource_for(object))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::filter(PermissionKind::Read, resources, scope))
    }

    /// The subset of `resources` passing the class-level `kind` check.
    pub fn filter(
        kind: PermissionKind,
        resources: impl IntoIterator<Item = PersistentResource>,
        scope: &mut RequestScope,
    ) -> Vec<Self> {
        resources
            .into_iter()
            .filter(|resource| scope.check_object(kind, resource.object).is_ok())
            .collect()
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn get_attribute(&self, name: &str, scope: &mut RequestScope) -> Result<Value> {
        scope.dictionary().attribute(&self.type_name, name)?;
        scope.check_object_field(PermissionKind::Read, self.object, name, None)?;
        scope.queue_field_triggers(self, Operation::Read, name, None);
        self.value_unchecked(name, scope)
    }

    /// Sets an attribute. Returns `false` without checking permissions or
    /// queuing anything when the value is unchanged.
    pub fn update_attribute(
        &self,
        name: &str,
        value: impl Into<Value>,
        scope: &mut RequestScope,
    ) -> Result<bool> {
        let value = value.into();
        let data_type = scope.dictionary().attribute(&self.type_name, name)?.data_type;
        if !data_type.is_compatible(&value) {
            return Err(EngineError::InvalidValue(format!(
                "'{}.{}' expects {}, got {}",
                self.type_name,
                name,
                data_type,
                value.type_name()
            )));
        }

        let current = self.value_unchecked(name, scope)?;
        if current == value {
            return Ok(false);
        }

        let checkpoint = scope.permission_executor().checkpoint();
        let change =
            ChangeSpec::attribute(self.object, &self.type_name, name, current.clone(), value.clone());
        scope.check_object_field(PermissionKind::Update, self.object, name, Some(&change))?;

        scope
            .arena_mut()
            .record_mut(self.object)?
            .attributes
            .insert(name.to_string(), value);

        // Audit templates read the new value.
        let audit = match scope.render_field_audit(self, name) {
            Ok(audit) => audit,
            Err(err) => {
                scope
                    .arena_mut()
                    .record_mut(self.object)?
                    .attributes
                    .insert(name.to_string(), current);
                scope.permission_executor_mut().rollback_to(checkpoint);
                return Err(err);
            }
        };
        scope.mark_dirty(self.object);

        let operation = scope.mutation_operation(self.object);
        scope.queue_field_triggers(self, operation, name, Some(change));
        scope.buffer_audit(audit);
        Ok(true)
    }

    /// Attributes the user may read, keyed by name.
    pub fn readable_attributes(&self, scope: &mut RequestScope) -> Result<BTreeMap<String, Value>> {
        let names: Vec<String> = scope
            .dictionary()
            .entity(&self.type_name)?
            .attributes()
            .iter()
            .map(|attribute| attribute.name.clone())
            .collect();

        let mut readable = BTreeMap::new();
        for name in names {
            match self.get_attribute(&name, scope) {
                Ok(value) => {
                    readable.insert(name, value);
                }
                Err(err) if err.is_forbidden() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(readable)
    }

    pub(crate) fn value_unchecked(&self, name: &str, scope: &RequestScope) -> Result<Value> {
        Ok(self
            .record(scope)?
            .attribute(name)
            .cloned()
            .unwrap_or(Value::Null))
    }

    // ------------------------------------------------------------------
    // Relationship reads
    // ------------------------------------------------------------------

    /// Readable members of a relationship, each carrying this resource in
    /// its lineage.
    pub fn get_relation(&self, name: &str, scope: &mut RequestScope) -> Result<Vec<Self>> {
        scope.dictionary().relationship(&self.type_name, name)?;
        scope.check_object_field(PermissionKind::Read, self.object, name, None)?;
        scope.queue_field_triggers(self, Operation::Read, name, None);

        let members = self.relation_value(name, scope)?.members();
        let children = self.wrap_members(name, &members, scope)?;
        Ok(Self::filter(PermissionKind::Read, children, scope))
    }

    pub fn get_relation_by_id(&self, name: &str, id: &str, scope: &mut RequestScope) -> Result<Self> {
        let target = scope
            .dictionary()
            .relationship(&self.type_name, name)?
            .target
            .clone();
        self.get_relation(name, scope)?
            .into_iter()
            .find(|resource| resource.matches_id(id))
            .ok_or_else(|| EngineError::invalid_id(&target, id))
    }

    pub(crate) fn relation_value(&self, name: &str, scope: &mut RequestScope) -> Result<RelationValue> {
        let (transaction, arena) = scope.storage();
        transaction.get_relation(arena, self.object, name)
    }

    fn wrap_members(&self, name: &str, members: &[ObjectId], scope: &RequestScope) -> Result<Vec<Self>> {
        let lineage = self.lineage.extend(name, &self.type_name, self.object);
        members
            .iter()
            .filter(|member| !scope.is_deleted(**member))
            .map(|member| scope.wrap(*member, lineage.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Deletes this object and, recursively, its cascade-delete members.
    ///
    /// Inverse sides of non-cascading relationships are detached and saved;
    /// cascade-owned members keep pointing at their deleted owner and are
    /// never saved. Walking relationships queues class-level READ triggers
    /// on this resource.
    pub fn delete_resource(&self, scope: &mut RequestScope) -> Result<()> {
        let mut visited = HashSet::new();
        self.delete_cascading(scope, &mut visited)
    }

    fn delete_cascading(&self, scope: &mut RequestScope, visited: &mut HashSet<ObjectId>) -> Result<()> {
        if scope.is_deleted(self.object) || !visited.insert(self.object) {
            return Ok(());
        }
        scope.check_object(PermissionKind::Delete, self.object)?;

        let relationships = scope
            .dictionary()
            .entity(&self.type_name)?
            .relationships()
            .to_vec();

        let mut populated = Vec::new();
        let mut cascades = Vec::new();
        let mut detach = Vec::new();

        for relationship in &relationships {
            let value = self.relation_value(&relationship.name, scope)?;
            if !value.is_empty() {
                populated.push(relationship.name.clone());
            }
            if !relationship.cascade_delete && relationship.inverse.is_none() {
                continue;
            }

            scope.queue_class_triggers(self, Operation::Read);
            for member in value.members() {
                if visited.contains(&member) || scope.is_deleted(member) {
                    continue;
                }
                if relationship.cascade_delete {
                    cascades.push((relationship.name.clone(), member));
                } else {
                    detach.push((relationship.clone(), member));
                }
            }
        }

        super::relations::execute_plan(scope, |plan, scope| {
            for (relationship, member) in &detach {
                let other = scope.resource_for(*member)?;
                plan.unlink_inverse(scope, relationship, self.object, &other)?;
            }
            Ok(())
        })?;

        for (relation, member) in cascades {
            let child = scope.wrap(
                member,
                self.lineage.extend(&relation, &self.type_name, self.object),
            )?;
            child.delete_cascading(scope, visited)?;
        }

        {
            let (transaction, arena) = scope.storage();
            transaction.delete(arena, self.object)?;
        }
        scope.register_deleted(self.object);
        scope.audit_class(self, Operation::Delete)?;
        scope.queue_class_triggers(self, Operation::Delete);
        for field in populated {
            scope.queue_field_triggers(self, Operation::Delete, &field, None);
        }
        Ok(())
    }
}

/// Equal when both carry the same real id; without real ids on either side,
/// equal when the temporary ids (or, lacking those, the arena slots) match.
/// A handle with a real id never equals one without.
impl PartialEq for PersistentResource {
    fn eq(&self, other: &Self) -> bool {
        if self.type_name != other.type_name {
            return false;
        }
        match (&self.id, &other.id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            (None, None) => match (&self.uuid, &other.uuid) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => self.object == other.object,
            },
            _ => false,
        }
    }
}

impl Eq for PersistentResource {}

impl Hash for PersistentResource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for PersistentResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.uuid) {
            (Some(id), _) => write!(f, "{}[{}]", self.type_name, id),
            (None, Some(uuid)) => write!(f, "{}[{}]", self.type_name, uuid),
            (None, None) => write!(f, "{}{}", self.type_name, self.object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn handle(object: usize, id: Option<&str>, uuid: Option<&str>) -> PersistentResource {
        PersistentResource::from_parts(
            "book".to_string(),
            ObjectId(object),
            id.map(str::to_string),
            uuid.map(str::to_string),
            ResourceLineage::new(),
        )
    }

    #[test]
    fn real_ids_decide_equality_regardless_of_temporary_ids() {
        assert_eq!(handle(0, Some("1"), Some("tmp-a")), handle(0, Some("1"), Some("tmp-b")));
        assert_ne!(handle(0, Some("1"), None), handle(0, Some("2"), None));
    }

    #[test]
    fn temporary_id_never_equals_real_id() {
        assert_ne!(handle(0, None, Some("tmp-a")), handle(0, Some("1"), Some("tmp-a")));
        assert_ne!(handle(0, Some("1"), None), handle(0, None, None));
    }

    #[test]
    fn temporary_handles_fall_back_to_uuid_then_slot() {
        assert_eq!(handle(0, None, Some("tmp-a")), handle(0, None, Some("tmp-a")));
        assert_ne!(handle(0, None, Some("tmp-a")), handle(0, None, Some("tmp-b")));
        assert_eq!(handle(3, None, None), handle(3, None, None));
        assert_ne!(handle(3, None, None), handle(4, None, None));
    }

    #[test]
    fn hash_agrees_with_equality() {
        let mut set = HashSet::new();
        set.insert(handle(0, Some("1"), Some("tmp-a")));
        assert!(set.contains(&handle(9, Some("1"), Some("tmp-b"))));
        assert!(!set.contains(&handle(0, None, Some("tmp-a"))));
    }

    #[test]
    fn display_prefers_real_id() {
        assert_eq!(handle(0, Some("1"), Some("tmp")).to_string(), "book[1]");
        assert_eq!(handle(0, None, Some("tmp")).to_string(), "book[tmp]");
        assert_eq!(handle(2, None, None).to_string(), "book#2");
    }
}
