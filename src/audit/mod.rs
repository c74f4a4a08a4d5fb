// ============================================================================
// Audit Logging
// ============================================================================
//
// Audit bindings describe which applied changes produce an audit message.
// Messages are rendered when the change happens, buffered by the request
// scope and handed to the `AuditLogger` only once the request commits.
//
// ============================================================================

pub mod message;

pub use message::LogMessage;

use crate::core::Result;
use crate::lifecycle::Operation;
use std::sync::Mutex;

/// Declares an audit statement on an entity or one of its fields.
///
/// `template` uses positional placeholders (`{0}`, `{1}`, ...) filled from
/// `expressions` such as `${book.title}`, `${author[0].name}` or
/// `${opaqueUser}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditBinding {
    pub action: Operation,
    pub field: Option<String>,
    pub operation_code: i32,
    pub template: String,
    pub expressions: Vec<String>,
}

impl AuditBinding {
    pub fn new(action: Operation, operation_code: i32, template: impl Into<String>) -> Self {
        Self {
            action,
            field: None,
            operation_code,
            template: template.into(),
            expressions: Vec::new(),
        }
    }

    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expressions.push(expression.into());
        self
    }
}

/// Sink for committed audit messages.
pub trait AuditLogger: Send + Sync {
    fn commit(&self, messages: Vec<LogMessage>) -> Result<()>;
}

/// Writes audit messages through the `log` facade.
#[derive(Debug, Default)]
pub struct LogAuditLogger;

impl AuditLogger for LogAuditLogger {
    fn commit(&self, messages: Vec<LogMessage>) -> Result<()> {
        for message in messages {
            log::info!(
                target: "datagate::audit",
                "[{}] {} (user: {})",
                message.operation_code,
                message.message,
                message.user
            );
        }
        Ok(())
    }
}

/// Keeps committed messages in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLogger {
    messages: Mutex<Vec<LogMessage>>,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Result<Vec<LogMessage>> {
        Ok(self.messages.lock()?.clone())
    }
}

impl AuditLogger for InMemoryAuditLogger {
    fn commit(&self, messages: Vec<LogMessage>) -> Result<()> {
        self.messages.lock()?.extend(messages);
        Ok(())
    }
}
