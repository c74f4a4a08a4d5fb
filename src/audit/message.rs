use super::AuditBinding;
use crate::core::{EngineError, Result};
use crate::dictionary::EntityDictionary;
use crate::resource::{ObjectArena, ObjectId, PersistentResource};
use crate::security::User;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{(\d+)\}").expect("placeholder pattern is valid");
    static ref EXPRESSION: Regex =
        Regex::new(r"^\$\{\s*(\w+)(?:\[(\d+)\])?(?:\.(\w+))?\s*\}$").expect("expression pattern is valid");
}

/// A rendered audit message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    pub operation_code: i32,
    pub message: String,
    pub user: String,
    pub type_name: String,
    pub field: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    /// Plain message without substitution.
    pub fn new(operation_code: i32, message: impl Into<String>, user: &User) -> Self {
        Self {
            operation_code,
            message: message.into(),
            user: user.name().to_string(),
            type_name: String::new(),
            field: None,
            timestamp: Utc::now(),
        }
    }

    /// Renders `binding` against `resource` and its lineage.
    ///
    /// `${type.field}` resolves to the nearest record of that type (the
    /// resource itself last), `${type[idx].field}` indexes from the root.
    pub fn render(
        binding: &AuditBinding,
        resource: &PersistentResource,
        dictionary: &EntityDictionary,
        arena: &ObjectArena,
        user: &User,
    ) -> Result<Self> {
        let values = binding
            .expressions
            .iter()
            .map(|expression| resolve(expression, resource, dictionary, arena, user))
            .collect::<Result<Vec<String>>>()?;

        let message = PLACEHOLDER.replace_all(&binding.template, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|index| values.get(index).cloned())
                .unwrap_or_else(|| caps[0].to_string())
        });

        Ok(Self {
            operation_code: binding.operation_code,
            message: message.into_owned(),
            user: user.name().to_string(),
            type_name: resource.type_name().to_string(),
            field: binding.field.clone(),
            timestamp: Utc::now(),
        })
    }
}

fn resolve(
    expression: &str,
    resource: &PersistentResource,
    dictionary: &EntityDictionary,
    arena: &ObjectArena,
    user: &User,
) -> Result<String> {
    let caps = EXPRESSION.captures(expression).ok_or_else(|| {
        EngineError::InvalidSyntax(format!("malformed audit expression '{}'", expression))
    })?;
    let name = &caps[1];
    let index = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());
    let field = caps.get(3).map(|m| m.as_str());

    if name == "opaqueUser" && index.is_none() && field.is_none() {
        return Ok(user.name().to_string());
    }

    let mut candidates: Vec<ObjectId> = resource
        .lineage()
        .iter()
        .filter(|entry| dictionary.is_subtype_of(&entry.type_name, name))
        .map(|entry| entry.object)
        .collect();
    if dictionary.is_subtype_of(resource.type_name(), name) {
        candidates.push(resource.object());
    }

    let object = match index {
        Some(index) => candidates.get(index).copied(),
        None => candidates.last().copied(),
    }
    .ok_or_else(|| {
        EngineError::InvalidSyntax(format!("audit expression '{}' does not resolve", expression))
    })?;

    let record = arena.record(object)?;
    match field {
        None => Ok(record.id.clone().unwrap_or_default()),
        Some(field) => match record.attribute(field) {
            Some(value) => Ok(value.to_string()),
            None if field == "id" => Ok(record.id.clone().unwrap_or_default()),
            None => Err(EngineError::InvalidSyntax(format!(
                "audit expression '{}' names unknown attribute '{}'",
                expression, field
            ))),
        },
    }
}
