//! Engine configuration
//!
//! A `JugglerConfig` is built once by the outer controller and threaded into
//! the Juggler and every reconciler. Nothing in the engine reads process-wide
//! state after construction.

use crate::{Error, LABEL_MANAGED_BY};

/// Environment variable overriding the managed-by label value
pub const ENV_MANAGED_BY: &str = "JUGGLER_MANAGED_BY";
/// Environment variable overriding the per-component label key
pub const ENV_COMPONENT_LABEL: &str = "JUGGLER_COMPONENT_LABEL";
/// Environment variable overriding the per-kind label key
pub const ENV_COMPONENT_KIND_LABEL: &str = "JUGGLER_COMPONENT_KIND_LABEL";
/// Environment variable overriding the field manager
pub const ENV_FIELD_MANAGER: &str = "JUGGLER_FIELD_MANAGER";
/// Environment variable toggling keep-on-uninstall handling ("true"/"false")
pub const ENV_HONOR_KEEP_ON_UNINSTALL: &str = "JUGGLER_HONOR_KEEP_ON_UNINSTALL";

/// Default managed-by label value
pub const DEFAULT_MANAGED_BY: &str = "juggler";
/// Default per-component label key
pub const DEFAULT_COMPONENT_LABEL: &str = "juggler.dev/component";
/// Default per-kind label key
pub const DEFAULT_COMPONENT_KIND_LABEL: &str = "juggler.dev/component-kind";
/// Default field manager for writes
pub const DEFAULT_FIELD_MANAGER: &str = "juggler-controller";
/// Default event action
pub const DEFAULT_EVENT_ACTION: &str = "Reconcile";

/// Configuration shared by the Juggler and its reconcilers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JugglerConfig {
    /// Value of the `app.kubernetes.io/managed-by` label stamped on managed objects
    pub managed_by: String,
    /// Label key whose value is the owning component's name
    pub component_label_key: String,
    /// Label key whose value is the owning component's kind
    ///
    /// Orphan detection selects on it, so kinds that share an object type
    /// never see each other's objects.
    pub component_kind_label_key: String,
    /// Field manager name used for create/update calls
    pub field_manager: String,
    /// Action recorded on emitted events
    pub event_action: String,
    /// Whether `keep_on_uninstall()` components skip the uninstall path.
    ///
    /// When false such components are uninstalled like any other.
    pub honor_keep_on_uninstall: bool,
}

impl Default for JugglerConfig {
    fn default() -> Self {
        Self {
            managed_by: DEFAULT_MANAGED_BY.to_string(),
            component_label_key: DEFAULT_COMPONENT_LABEL.to_string(),
            component_kind_label_key: DEFAULT_COMPONENT_KIND_LABEL.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            event_action: DEFAULT_EVENT_ACTION.to_string(),
            honor_keep_on_uninstall: true,
        }
    }
}

impl JugglerConfig {
    /// Load configuration from `JUGGLER_*` environment variables on top of defaults
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_MANAGED_BY) {
            config.managed_by = value;
        }
        if let Some(value) = lookup(ENV_COMPONENT_LABEL) {
            config.component_label_key = value;
        }
        if let Some(value) = lookup(ENV_COMPONENT_KIND_LABEL) {
            config.component_kind_label_key = value;
        }
        if let Some(value) = lookup(ENV_FIELD_MANAGER) {
            config.field_manager = value;
        }
        if let Some(value) = lookup(ENV_HONOR_KEEP_ON_UNINSTALL) {
            config.honor_keep_on_uninstall = value.trim().parse::<bool>().map_err(|_| {
                Error::config_for(
                    ENV_HONOR_KEEP_ON_UNINSTALL,
                    format!("expected true or false, got {:?}", value),
                )
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the managed-by label value
    pub fn with_managed_by(mut self, value: impl Into<String>) -> Self {
        self.managed_by = value.into();
        self
    }

    /// Set the per-component label key
    pub fn with_component_label_key(mut self, key: impl Into<String>) -> Self {
        self.component_label_key = key.into();
        self
    }

    /// Set the per-kind label key
    pub fn with_component_kind_label_key(mut self, key: impl Into<String>) -> Self {
        self.component_kind_label_key = key.into();
        self
    }

    /// Set the field manager
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Set whether keep-on-uninstall components are left in place
    pub fn with_honor_keep_on_uninstall(mut self, honor: bool) -> Self {
        self.honor_keep_on_uninstall = honor;
        self
    }

    /// Check that label keys and values are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.managed_by.is_empty() {
            return Err(Error::config_for(ENV_MANAGED_BY, "must not be empty"));
        }
        if self.component_label_key.is_empty() {
            return Err(Error::config_for(ENV_COMPONENT_LABEL, "must not be empty"));
        }
        if self.component_label_key == LABEL_MANAGED_BY {
            return Err(Error::config_for(
                ENV_COMPONENT_LABEL,
                format!("must differ from {}", LABEL_MANAGED_BY),
            ));
        }
        if self.component_kind_label_key.is_empty() {
            return Err(Error::config_for(ENV_COMPONENT_KIND_LABEL, "must not be empty"));
        }
        if self.component_kind_label_key == LABEL_MANAGED_BY
            || self.component_kind_label_key == self.component_label_key
        {
            return Err(Error::config_for(
                ENV_COMPONENT_KIND_LABEL,
                format!(
                    "must differ from {} and {}",
                    LABEL_MANAGED_BY, self.component_label_key
                ),
            ));
        }
        if self.field_manager.is_empty() {
            return Err(Error::config_for(ENV_FIELD_MANAGER, "must not be empty"));
        }
        Ok(())
    }

    /// Label selector matching every object managed under this configuration
    /// that carries a component label
    pub fn managed_selector(&self) -> String {
        format!(
            "{}={},{}",
            LABEL_MANAGED_BY, self.managed_by, self.component_label_key
        )
    }

    /// Label selector matching managed objects stamped with component kind `kind`
    pub fn kind_selector(&self, kind: &str) -> String {
        format!(
            "{},{}={}",
            self.managed_selector(),
            self.component_kind_label_key,
            kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JugglerConfig::default();
        assert_eq!(config.managed_by, "juggler");
        assert_eq!(config.component_label_key, "juggler.dev/component");
        assert!(config.honor_keep_on_uninstall);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = JugglerConfig::from_lookup(lookup_from(&[
            (ENV_MANAGED_BY, "platform-operator"),
            (ENV_COMPONENT_LABEL, "platform.dev/addon"),
            (ENV_COMPONENT_KIND_LABEL, "platform.dev/addon-kind"),
            (ENV_FIELD_MANAGER, "platform-operator"),
            (ENV_HONOR_KEEP_ON_UNINSTALL, "false"),
        ]))
        .unwrap();

        assert_eq!(config.managed_by, "platform-operator");
        assert_eq!(config.component_label_key, "platform.dev/addon");
        assert_eq!(config.component_kind_label_key, "platform.dev/addon-kind");
        assert_eq!(config.field_manager, "platform-operator");
        assert!(!config.honor_keep_on_uninstall);
        assert_eq!(config.event_action, DEFAULT_EVENT_ACTION);
    }

    #[test]
    fn test_invalid_toggle_is_rejected() {
        let err = JugglerConfig::from_lookup(lookup_from(&[(
            ENV_HONOR_KEEP_ON_UNINSTALL,
            "sometimes",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_component_label_must_not_shadow_managed_by() {
        let config = JugglerConfig::default().with_component_label_key(LABEL_MANAGED_BY);
        assert!(config.validate().is_err());

        let config = JugglerConfig::default().with_component_label_key("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kind_label_must_be_distinct() {
        let config = JugglerConfig::default().with_component_kind_label_key(DEFAULT_COMPONENT_LABEL);
        assert!(config.validate().is_err());

        let config = JugglerConfig::default().with_component_kind_label_key(LABEL_MANAGED_BY);
        assert!(config.validate().is_err());

        let config = JugglerConfig::default().with_field_manager("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_managed_selector() {
        let config = JugglerConfig::default().with_managed_by("ops");
        assert_eq!(
            config.managed_selector(),
            "app.kubernetes.io/managed-by=ops,juggler.dev/component"
        );
        assert_eq!(
            config.kind_selector("Settings"),
            "app.kubernetes.io/managed-by=ops,juggler.dev/component,juggler.dev/component-kind=Settings"
        );
    }
}
