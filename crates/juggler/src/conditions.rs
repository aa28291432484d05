//! Conversion of component results into status conditions

use juggler_common::crd::{Condition, ConditionStatus};

use crate::component::{Component, StatusVisibility};
use crate::status::ComponentResult;

/// Reason used when a result carries no status name
pub const UNKNOWN_REASON: &str = "Unknown";

/// Condition type for a component: `<Name>Ready`, first letter lowercased for
/// internal components
pub fn condition_type(component: &dyn Component) -> String {
    let name = component.name();
    let name = match component.status_visibility() {
        StatusVisibility::External => name.to_string(),
        StatusVisibility::Internal => {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    };
    format!("{}Ready", name)
}

/// Condition from a reason and readiness; an empty reason becomes `Unknown`
/// and is never reported ready
pub fn to_condition(type_: String, reason: &str, ready: bool, message: &str) -> Condition {
    let (reason, status) = if reason.is_empty() {
        (UNKNOWN_REASON, ConditionStatus::False)
    } else if ready {
        (reason, ConditionStatus::True)
    } else {
        (reason, ConditionStatus::False)
    };
    Condition::new(type_, status, reason, message)
}

impl ComponentResult {
    /// Status condition describing this result
    pub fn to_condition(&self) -> Condition {
        to_condition(
            condition_type(self.component.as_ref()),
            self.status.as_str(),
            self.status.is_ready(),
            &self.message,
        )
    }
}
