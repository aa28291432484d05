//! Common types for Juggler: errors, Flux CRDs, events, configuration and logging

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use config::JugglerConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Standard label marking which controller manages an object
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Namespace Flux resources are created in unless a component says otherwise
pub const FLUX_SYSTEM_NAMESPACE: &str = "flux-system";
