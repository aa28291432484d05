//! Error types for the Juggler engine
//!
//! Errors are structured with fields so that the message surfaced in a
//! component result names the object, kind or hook that failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Marker text carried by every hook failure
pub const HOOK_FAILED: &str = "hook failed";

/// Main error type for Juggler operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a missing object nor a missing kind
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object (`ns/name` or `name`)
        name: String,
    },

    /// The API server does not serve the resource type (CRD not installed)
    #[error("no kind {kind} is registered for version {api_version}")]
    KindNotFound {
        /// Requested apiVersion
        api_version: String,
        /// Requested kind
        kind: String,
    },

    /// A lifecycle hook declared by a component failed
    #[error("{phase} hook failed: {source}")]
    Hook {
        /// Hook phase (PreInstall, PreUpdate, PreUninstall)
        phase: String,
        /// The error returned by the hook
        source: Box<Error>,
    },

    /// A component is misconfigured or does not support the requested strategy
    #[error("component {component}: {message}")]
    Component {
        /// Name of the component
        component: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// Setting that failed to load (e.g., "JUGGLER_MANAGED_BY")
        setting: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "flux", "orphans")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a kind-not-found error for a resource type the server does not serve
    pub fn kind_not_found(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::KindNotFound {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Wrap a hook error with the hook marker
    pub fn hook(phase: impl Into<String>, source: Error) -> Self {
        Self::Hook {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// Create a component error
    pub fn component(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error for a specific setting
    pub fn config_for(setting: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            setting: Some(setting.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this error reports a resource type the server does not serve
    pub fn is_kind_not_found(&self) -> bool {
        matches!(self, Error::KindNotFound { .. })
    }

    /// Whether this error came out of a component hook
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Error::Hook { .. })
    }

    /// Check if this error is retryable
    ///
    /// The engine never retries on its own; the flag tells the outer polling
    /// loop whether the next pass can be expected to make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::KindNotFound { .. } => true,
            Error::Hook { source, .. } => source.is_retryable(),
            Error::Component { .. } => false,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Classify an API error response for a request against `api_version`/`kind`.
///
/// The API server answers 404 both for a missing object and for a resource
/// path it does not serve at all; the latter carries the generic
/// "could not find the requested resource" message.
pub fn classify_kube_error(
    err: kube::Error,
    api_version: &str,
    kind: &str,
    name: &str,
) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            if ae.message.contains("could not find the requested resource") {
                Error::kind_not_found(api_version, kind)
            } else {
                Error::not_found(kind, name)
            }
        }
        other => Error::Kube { source: other },
    }
}

/// Turn a not-found error into success, propagating anything else
pub fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Like [`ignore_not_found`], but also treats a resource type the server does
/// not serve as already gone
pub fn ignore_missing(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() || e.is_kind_not_found() => Ok(()),
        other => other,
    }
}
