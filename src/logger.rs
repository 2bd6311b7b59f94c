//! Scoped loggers
//!
//! Thin layer over `tracing` spans so that components can hand each request
//! or socket its own named logger. Every event emitted through a [`Logger`]
//! is recorded inside that logger's span, so the subscriber prints the
//! component name in front of the message.

use std::fmt::Display;

use tracing::Span;

use crate::random::generate_logging_id;

/// A named logging scope
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
    span: Span,
}

impl Logger {
    /// Create the root logger
    pub fn root() -> Self {
        Self {
            name: "nosh".to_string(),
            span: tracing::info_span!("nosh"),
        }
    }

    /// Create a child logger nested under this one
    pub fn child(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!(parent: &self.span, "component", name = %name);
        Self { name, span }
    }

    /// Name of this logger, as shown in front of its messages
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace(&self, message: impl Display) {
        tracing::trace!(parent: &self.span, "{}", message);
    }

    pub fn debug(&self, message: impl Display) {
        tracing::debug!(parent: &self.span, "{}", message);
    }

    pub fn info(&self, message: impl Display) {
        tracing::info!(parent: &self.span, "{}", message);
    }

    pub fn warn(&self, message: impl Display) {
        tracing::warn!(parent: &self.span, "{}", message);
    }

    pub fn error(&self, message: impl Display) {
        tracing::error!(parent: &self.span, "{}", message);
    }
}

/// A child logger carrying its own logging id
#[derive(Debug, Clone)]
pub struct ChildLogger {
    id: String,
    logger: Logger,
}

impl ChildLogger {
    /// The random id identifying this logger
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying logger
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl std::ops::Deref for ChildLogger {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        &self.logger
    }
}

/// Creates child loggers named `<name>:<id>`, each with a fresh id
#[derive(Debug, Clone)]
pub struct ChildFactory {
    name: String,
    parent: Logger,
}

impl ChildFactory {
    /// Create a factory producing children of `parent`
    pub fn new(name: impl Into<String>, parent: &Logger) -> Self {
        Self {
            name: name.into(),
            parent: parent.clone(),
        }
    }

    /// Create a new child logger with a unique id
    pub fn create(&self) -> ChildLogger {
        let id = generate_logging_id();
        let logger = self.parent.child(format!("{}:{}", self.name, id));
        ChildLogger { id, logger }
    }
}
