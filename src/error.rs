//! Error types for plugin discovery, registration and dispatch.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::plugin::SignatureStatus;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during plugin operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest could not be decoded.
    #[error("manifest parse error: {0}")]
    Parse(String),

    /// Manifest decoded but failed schema validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The authorizer refused the plugin.
    #[error("plugin not authorized to load: {0}")]
    Unauthorized(String),

    /// Plugin requires a newer host than the running one.
    #[error("plugin {plugin_id} requires host version {required}, running {provided}")]
    VersionIncompatible {
        /// Plugin ID.
        plugin_id: String,
        /// Minimum host version declared by the plugin.
        required: String,
        /// Running host version.
        provided: String,
    },

    /// Plugin not found (unknown ID or repository miss).
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Plugin already registered.
    #[error("plugin already registered: {0}")]
    AlreadyExists(String),

    /// Backend process unreachable, exited or released.
    #[error("backend unavailable for plugin {plugin_id}: {reason}")]
    BackendUnavailable {
        /// Plugin ID.
        plugin_id: String,
        /// Why the backend could not be used.
        reason: String,
    },

    /// Plugin does not advertise the requested capability.
    #[error("plugin {plugin_id} does not implement {capability}")]
    MethodNotImplemented {
        /// Plugin ID.
        plugin_id: String,
        /// Capability name.
        capability: String,
    },

    /// Deadline elapsed before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Another writer holds the same plugin ID.
    #[error("concurrent modification of plugin: {0}")]
    Conflict(String),

    /// Error reported by a backend plugin.
    #[error("backend error: {0}")]
    Backend(String),

    /// Caller passed an empty or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Reload could not complete.
    #[error("reload failed: {0}")]
    Reload(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Watch error.
    #[cfg(feature = "watch")]
    #[error("watch error: {0}")]
    Watch(String),

    /// Metrics registration error.
    #[cfg(feature = "metrics-prometheus")]
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a plugin not found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a version incompatibility error.
    pub fn version_incompatible(
        plugin_id: impl Into<String>,
        required: impl Into<String>,
        provided: impl Into<String>,
    ) -> Self {
        Self::VersionIncompatible {
            plugin_id: plugin_id.into(),
            required: required.into(),
            provided: provided.into(),
        }
    }

    /// Create a backend unavailable error.
    pub fn backend_unavailable(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a method not implemented error.
    pub fn method_not_implemented(
        plugin_id: impl Into<String>,
        capability: impl fmt::Display,
    ) -> Self {
        Self::MethodNotImplemented {
            plugin_id: plugin_id.into(),
            capability: capability.to_string(),
        }
    }

    /// Returns true if this error only affects a single plugin or call.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Reload(_) | Self::Cancelled)
    }

    /// Classify this error as a per-plugin load error kind.
    pub fn plugin_error_kind(&self) -> PluginErrorKind {
        match self {
            Self::Parse(_) | Self::InvalidManifest(_) => PluginErrorKind::Parse,
            Self::Unauthorized(_) => PluginErrorKind::Unauthorized,
            Self::VersionIncompatible { .. } => PluginErrorKind::Incompatible,
            Self::AlreadyExists(_) | Self::Conflict(_) => PluginErrorKind::Conflict,
            Self::BackendUnavailable { .. } | Self::Backend(_) | Self::Timeout(_) => {
                PluginErrorKind::Backend
            }
            _ => PluginErrorKind::Other,
        }
    }
}

/// Kind of a non-fatal, per-plugin load error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginErrorKind {
    /// Manifest could not be parsed or validated.
    Parse,
    /// Another package with the same ID won.
    Conflict,
    /// Rejected by the authorizer.
    Unauthorized,
    /// Requires a newer host.
    Incompatible,
    /// Backend could not be constructed or started.
    Backend,
    /// Anything else.
    Other,
}

impl fmt::Display for PluginErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Incompatible => "incompatible",
            Self::Backend => "backend",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A non-fatal error recorded against a single plugin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginError {
    /// Plugin ID, or the package directory name when the manifest was unreadable.
    pub plugin_id: String,
    /// Manifest or package path, when known.
    pub path: Option<PathBuf>,
    /// Error kind.
    pub kind: PluginErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Signature status at the time of the error.
    pub signature_status: Option<SignatureStatus>,
}

impl PluginError {
    /// Create a new plugin error.
    pub fn new(plugin_id: impl Into<String>, kind: PluginErrorKind, message: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            path: None,
            kind,
            message: message.into(),
            signature_status: None,
        }
    }

    /// Build a plugin error from a crate error.
    pub fn from_error(plugin_id: impl Into<String>, error: &Error) -> Self {
        Self::new(plugin_id, error.plugin_error_kind(), error.to_string())
    }

    /// Attach a path.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach a signature status.
    pub fn with_signature(mut self, status: SignatureStatus) -> Self {
        self.signature_status = Some(status);
        self
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.plugin_id, self.kind, self.message)
    }
}
