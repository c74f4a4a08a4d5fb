use super::record::{FieldValue, ObjectId, RelationValue};
use crate::core::Value;

/// A single applied field mutation: `field` went from `original` to
/// `modified` on `object`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSpec {
    pub object: ObjectId,
    pub type_name: String,
    pub field: String,
    pub original: FieldValue,
    pub modified: FieldValue,
}

impl ChangeSpec {
    pub fn attribute(
        object: ObjectId,
        type_name: &str,
        field: &str,
        original: Value,
        modified: Value,
    ) -> Self {
        Self {
            object,
            type_name: type_name.to_string(),
            field: field.to_string(),
            original: FieldValue::Attribute(original),
            modified: FieldValue::Attribute(modified),
        }
    }

    pub fn relation(
        object: ObjectId,
        type_name: &str,
        field: &str,
        original: RelationValue,
        modified: RelationValue,
    ) -> Self {
        Self {
            object,
            type_name: type_name.to_string(),
            field: field.to_string(),
            original: FieldValue::Relation(original),
            modified: FieldValue::Relation(modified),
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.modified, FieldValue::Relation(_))
    }

    /// Members that entered a relationship with this change.
    pub fn added_members(&self) -> Vec<ObjectId> {
        match (&self.original, &self.modified) {
            (FieldValue::Relation(before), FieldValue::Relation(after)) => after
                .members()
                .into_iter()
                .filter(|member| !before.contains(*member))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Members that left a relationship with this change.
    pub fn removed_members(&self) -> Vec<ObjectId> {
        match (&self.original, &self.modified) {
            (FieldValue::Relation(before), FieldValue::Relation(after)) => before
                .members()
                .into_iter()
                .filter(|member| !after.contains(*member))
                .collect(),
            _ => Vec::new(),
        }
    }
}
