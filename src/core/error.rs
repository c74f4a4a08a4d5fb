use crate::security::PermissionKind;
use std::fmt;
use thiserror::Error;

/// Details of a permission denial.
///
/// `expression` is only populated when the engine runs with
/// `verbose_errors` enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenAccess {
    pub permission: PermissionKind,
    pub type_name: String,
    pub field: Option<String>,
    pub expression: Option<String>,
}

impl ForbiddenAccess {
    pub fn new(permission: PermissionKind, type_name: impl Into<String>) -> Self {
        Self {
            permission,
            type_name: type_name.into(),
            field: None,
            expression: None,
        }
    }

    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}

impl fmt::Display for ForbiddenAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} permission denied on '{}", self.permission, self.type_name)?;
        if let Some(field) = &self.field {
            write!(f, ".{}", field)?;
        }
        write!(f, "'")?;
        if let Some(expression) = &self.expression {
            write!(f, " (expression: {})", expression)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Forbidden: {0}")]
    ForbiddenAccess(ForbiddenAccess),

    #[error("Unknown attribute '{field}' on '{type_name}'")]
    InvalidAttribute { type_name: String, field: String },

    #[error("Unknown relationship '{field}' on '{type_name}'")]
    InvalidRelationship { type_name: String, field: String },

    #[error("Unknown identifier '{id}' for '{type_name}'")]
    InvalidObjectIdentifier { type_name: String, id: String },

    #[error("Unknown entity type '{0}'")]
    UnknownEntity(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Lifecycle hook failed: {0}")]
    Hook(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl EngineError {
    pub fn forbidden(access: ForbiddenAccess) -> Self {
        Self::ForbiddenAccess(access)
    }

    pub fn invalid_attribute(type_name: &str, field: &str) -> Self {
        Self::InvalidAttribute {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid_relationship(type_name: &str, field: &str) -> Self {
        Self::InvalidRelationship {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid_id(type_name: &str, id: &str) -> Self {
        Self::InvalidObjectIdentifier {
            type_name: type_name.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::ForbiddenAccess(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_message_names_field_and_expression() {
        let access = ForbiddenAccess::new(PermissionKind::Update, "book")
            .on_field("title")
            .with_expression("principal is owner");
        let err = EngineError::forbidden(access);

        assert!(err.is_forbidden());
        assert_eq!(
            err.to_string(),
            "Forbidden: UPDATE permission denied on 'book.title' (expression: principal is owner)"
        );
    }
}
