//! # Strategy module
//!
//! This module provide the per kind update strategy policy of one
//! specification together with the status condition gate of the rolling
//! strategies

use std::collections::HashMap;

use kube::core::DynamicObject;
use serde_json::Value;

use crate::svc::gctl::{AttachmentUpdateStrategy, ChildUpdateMethod, StatusChecks};

// -----------------------------------------------------------------------------
// Constants

const DEFAULT_CONDITION_STATUS: &str = "True";

// -----------------------------------------------------------------------------
// UpdateStrategies structure

/// strategies keyed by api group and kind, strategies resolving to the
/// OnDelete default are not stored at all
#[derive(Debug, Default)]
pub struct UpdateStrategies {
    entries: HashMap<(String, String), (ChildUpdateMethod, Option<StatusChecks>)>,
}

/// returns the api group of an apiVersion, empty for the core group
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

impl UpdateStrategies {
    pub fn new() -> Self {
        Self::default()
    }

    /// records the strategy of one attachment kind
    pub fn insert(&mut self, group: &str, kind: &str, strategy: &AttachmentUpdateStrategy) {
        let method = strategy.method.to_owned().unwrap_or_default();
        if method == ChildUpdateMethod::OnDelete {
            return;
        }

        self.entries.insert(
            (group.to_string(), kind.to_string()),
            (method, strategy.status_checks.to_owned()),
        );
    }

    /// returns the method and gate of an attachment, the OnDelete default
    /// when the kind declares none
    pub fn get(
        &self,
        api_version: &str,
        kind: &str,
    ) -> (ChildUpdateMethod, Option<&StatusChecks>) {
        match self
            .entries
            .get(&(api_group(api_version).to_string(), kind.to_string()))
        {
            Some((method, checks)) => (method.to_owned(), checks.as_ref()),
            None => (ChildUpdateMethod::OnDelete, None),
        }
    }
}

// -----------------------------------------------------------------------------
// Status condition gate

/// returns if every declared condition holds on the object's own status
/// conditions, an object without the named condition fails the gate
pub fn status_checks_pass(obj: &DynamicObject, checks: &StatusChecks) -> bool {
    let conditions = match obj.data.get("status").and_then(|s| s.get("conditions")) {
        Some(Value::Array(conditions)) => conditions,
        _ => return checks.conditions.is_empty(),
    };

    checks.conditions.iter().all(|check| {
        conditions.iter().any(|condition| {
            let condition_type = condition.get("type").and_then(Value::as_str);
            if condition_type != Some(check.condition_type.as_str()) {
                return false;
            }

            let wanted_status = check
                .status
                .as_deref()
                .unwrap_or(DEFAULT_CONDITION_STATUS);
            if condition.get("status").and_then(Value::as_str) != Some(wanted_status) {
                return false;
            }

            match &check.reason {
                Some(reason) => {
                    condition.get("reason").and_then(Value::as_str) == Some(reason.as_str())
                }
                None => true,
            }
        })
    })
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, GroupVersionKind};

    use super::*;
    use crate::svc::gctl::StatusCondition;

    #[test]
    fn api_group_derives_from_api_version() {
        assert_eq!(api_group("v1"), "");
        assert_eq!(api_group("apps/v1"), "apps");
        assert_eq!(api_group("metac.openebs.io/v1alpha1"), "metac.openebs.io");
    }

    #[test]
    fn on_delete_and_empty_methods_are_not_stored() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert("apps", "Deployment", &AttachmentUpdateStrategy::default());
        strategies.insert(
            "apps",
            "StatefulSet",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::OnDelete),
                status_checks: None,
            },
        );

        assert_eq!(
            strategies.get("apps/v1", "Deployment").0,
            ChildUpdateMethod::OnDelete
        );
        assert_eq!(
            strategies.get("apps/v1", "StatefulSet").0,
            ChildUpdateMethod::OnDelete
        );
    }

    #[test]
    fn lookup_resolves_group_from_api_version() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::InPlace),
                status_checks: None,
            },
        );

        assert_eq!(
            strategies.get("v1", "ConfigMap").0,
            ChildUpdateMethod::InPlace
        );
        assert_eq!(
            strategies.get("other/v1", "ConfigMap").0,
            ChildUpdateMethod::OnDelete
        );
    }

    fn with_conditions(conditions: Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut obj = DynamicObject::new("web", &ar).within("ns1");
        obj.data = serde_json::json!({ "status": { "conditions": conditions } });
        obj
    }

    #[test]
    fn status_checks_gate_on_type_status_and_reason() {
        let obj = with_conditions(serde_json::json!([
            {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
            {"type": "Progressing", "status": "False"},
        ]));

        let checks = |conditions: Vec<StatusCondition>| StatusChecks { conditions };

        // status defaults to True
        assert!(status_checks_pass(
            &obj,
            &checks(vec![StatusCondition {
                condition_type: "Available".to_string(),
                status: None,
                reason: None,
            }])
        ));

        assert!(!status_checks_pass(
            &obj,
            &checks(vec![StatusCondition {
                condition_type: "Progressing".to_string(),
                status: None,
                reason: None,
            }])
        ));

        assert!(status_checks_pass(
            &obj,
            &checks(vec![StatusCondition {
                condition_type: "Available".to_string(),
                status: Some("True".to_string()),
                reason: Some("MinimumReplicasAvailable".to_string()),
            }])
        ));

        assert!(!status_checks_pass(
            &obj,
            &checks(vec![StatusCondition {
                condition_type: "Available".to_string(),
                status: Some("True".to_string()),
                reason: Some("OtherReason".to_string()),
            }])
        ));

        // a named condition missing from the object fails the gate
        assert!(!status_checks_pass(
            &obj,
            &checks(vec![StatusCondition {
                condition_type: "Ready".to_string(),
                status: None,
                reason: None,
            }])
        ));
    }
}
