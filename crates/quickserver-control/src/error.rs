//! Error taxonomy shared by every fleet operation.
//!
//! Only [`FleetError::User`] and [`FleetError::InsufficientCapacity`] carry text that is safe
//! to show to the person who triggered the operation. Everything else is rendered as a single
//! generic message by [`FleetError::public_message`]; the detail belongs in logs.

use thiserror::Error;

pub type Result<T, E = FleetError> = std::result::Result<T, E>;

pub const GENERIC_PUBLIC_MESSAGE: &str =
    "Something went wrong while handling your request. Please try again later.";

pub const SHUTDOWN_PUBLIC_MESSAGE: &str =
    "The service is restarting and cannot take new requests right now. Please try again shortly.";

#[derive(Error, Debug)]
pub enum FleetError {
    /// Caller-correctable; the message is written for the end user.
    #[error("{0}")]
    User(String),

    /// The provisioner has no room in the requested region right now.
    #[error("{0}")]
    InsufficientCapacity(String),

    #[error("cannot run action, the application is already shutting down")]
    ShutdownInProgress,

    /// One or more per-instance steps of a reclamation cycle failed.
    #[error("{policy}: {} instance operation(s) failed: {}", .failures.len(), .failures.join("; "))]
    Reclamation {
        policy: &'static str,
        failures: Vec<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    pub fn user(message: impl Into<String>) -> Self {
        FleetError::User(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FleetError::Internal(anyhow::anyhow!(message.into()))
    }

    /// Short stable label (snake_case) for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            FleetError::User(_) => "user",
            FleetError::InsufficientCapacity(_) => "insufficient_capacity",
            FleetError::ShutdownInProgress => "shutdown_in_progress",
            FleetError::Reclamation { .. } => "reclamation",
            FleetError::Store(_) => "store",
            FleetError::Internal(_) => "internal",
        }
    }

    /// Text that may be shown to the requester verbatim.
    pub fn public_message(&self) -> &str {
        match self {
            FleetError::User(message) | FleetError::InsufficientCapacity(message) => message,
            FleetError::ShutdownInProgress => SHUTDOWN_PUBLIC_MESSAGE,
            FleetError::Reclamation { .. }
            | FleetError::Store(_)
            | FleetError::Internal(_) => GENERIC_PUBLIC_MESSAGE,
        }
    }

    /// Transient failures worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::ShutdownInProgress
                | FleetError::InsufficientCapacity(_)
                | FleetError::Store(_)
        )
    }
}
