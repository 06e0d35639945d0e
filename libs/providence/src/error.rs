use thiserror::Error;

use crate::namespace::NamespaceError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Failures raised while mutating module state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("cannot update '{name}': the current value is null")]
    NullTarget { name: String },

    #[error("update for '{name}' must be a JSON object")]
    NotAnObject { name: String },

    #[error("no state for module '{name}' in the store")]
    MissingState { name: String },

    #[error("field '{field}' does not exist on form '{name}'")]
    UnknownField { name: String, field: String },

    #[error("'{method}' is not a valid HTTP method")]
    InvalidMethod { method: String },

    #[error("malformed response for '{name}': {reason}")]
    MalformedResponse { name: String, reason: String },
}

/// Top-level error returned by tasks and root operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

impl Error {
    /// The transport failure behind this error, if that is what it is.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
