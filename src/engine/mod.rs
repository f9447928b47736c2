//! Engine - command handlers, trigger settlement and dispatch

pub mod handlers;
pub mod triggers;
pub mod dispatch;

pub use handlers::TransactionEngine;
pub use triggers::{PassReport, TriggerManager};
pub use dispatch::Dispatcher;

use crate::core::Error;

/// Generic reply for anything that is not the user's fault
pub const INTERNAL_ERROR: &str = "Internal server error";

/// Why a handler refused a command
#[derive(thiserror::Error, Debug)]
pub enum Rejection {
    /// Business-rule violation; the message goes back to the caller verbatim
    #[error("{0}")]
    Business(String),

    /// Collaborator failure; logged, never shown to the caller
    #[error(transparent)]
    Internal(#[from] Error),
}

impl Rejection {
    pub fn business(message: impl Into<String>) -> Self {
        Rejection::Business(message.into())
    }

    /// Text the caller sees
    pub fn public_message(&self) -> &str {
        match self {
            Rejection::Business(message) => message,
            Rejection::Internal(_) => INTERNAL_ERROR,
        }
    }
}
