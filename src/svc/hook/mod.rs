//! # Hook module
//!
//! This module provide the hook request and response contract together with
//! the dispatch over the webhook, inline and confighook transports

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::svc::{controller::attachment::AttachmentRegistry, gctl, gctl::GenericController};

pub mod config;
pub mod inline;
pub mod webhook;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("hook declares no transport to invoke")]
    Missing,
    #[error("failed to invoke webhook, {0}")]
    Webhook(webhook::Error),
    #[error("failed to invoke inline hook, {0}")]
    Inline(inline::Error),
    #[error("failed to invoke confighook, {0}")]
    Config(config::Error),
}

impl From<webhook::Error> for Error {
    fn from(err: webhook::Error) -> Self {
        Self::Webhook(err)
    }
}

impl From<inline::Error> for Error {
    fn from(err: inline::Error) -> Self {
        Self::Inline(err)
    }
}

impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Self::Config(err)
    }
}

// -----------------------------------------------------------------------------
// HookRequest structure

/// the payload every hook receives, the attachments being the two level
/// registry of observed instances
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HookRequest {
    #[serde(rename = "controller")]
    pub controller: GenericController,
    #[serde(rename = "watch")]
    pub watch: DynamicObject,
    #[serde(rename = "attachments")]
    pub attachments: AttachmentRegistry,
    #[serde(rename = "finalizing")]
    pub finalizing: bool,
}

// -----------------------------------------------------------------------------
// HookResponse structure

/// the desired state a hook hands back, every field optional
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HookResponse {
    /// a null value removes the label, any other value sets it
    #[serde(rename = "labels", default)]
    pub labels: BTreeMap<String, Option<String>>,
    /// a null value removes the annotation, any other value sets it
    #[serde(rename = "annotations", default)]
    pub annotations: BTreeMap<String, Option<String>>,
    /// a null status leaves the watched object's status untouched
    #[serde(rename = "status", default)]
    pub status: Option<Value>,
    #[serde(rename = "attachments", default)]
    pub attachments: Vec<DynamicObject>,
    #[serde(rename = "resyncAfterSeconds", default)]
    pub resync_after_seconds: f64,
    #[serde(rename = "skipReconcile", default)]
    pub skip_reconcile: bool,
    #[serde(rename = "finalized", default)]
    pub finalized: bool,
}

// -----------------------------------------------------------------------------
// Dispatch function

/// invokes the hook over its declared transport
pub async fn invoke(hook: &gctl::Hook, request: &HookRequest) -> Result<HookResponse, Error> {
    if let Some(webhook) = &hook.webhook {
        return Ok(webhook::call(webhook, request).await?);
    }

    if let Some(inline) = &hook.inline {
        return Ok(inline::invoke(&inline.func_name, request)?);
    }

    if let Some(confighook) = &hook.confighook {
        return Ok(config::invoke(confighook, request)?);
    }

    Err(Error::Missing)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_defaults_are_permissive() {
        let response: HookResponse = serde_json::from_str("{}").unwrap();

        assert!(response.labels.is_empty());
        assert!(response.status.is_none());
        assert!(response.attachments.is_empty());
        assert_eq!(response.resync_after_seconds, 0.0);
        assert!(!response.skip_reconcile);
        assert!(!response.finalized);
    }

    #[test]
    fn null_map_values_deserialize_as_removals() {
        let response: HookResponse = serde_json::from_value(serde_json::json!({
            "labels": {"drop": null, "set": "v"},
        }))
        .unwrap();

        assert_eq!(response.labels.get("drop"), Some(&None));
        assert_eq!(response.labels.get("set"), Some(&Some("v".to_string())));
    }

    #[tokio::test]
    async fn hook_without_transport_is_missing() {
        let hook = gctl::Hook::default();
        let request = fixtures::request();

        assert!(matches!(
            invoke(&hook, &request).await,
            Err(Error::Missing)
        ));
    }
}

// -----------------------------------------------------------------------------
// Test fixtures

#[cfg(test)]
pub mod fixtures {
    use kube::core::{ApiResource, GroupVersionKind, ObjectMeta};

    use super::*;
    use crate::svc::gctl::{GenericControllerResource, GenericControllerSpec, ResourceRule};

    pub fn request() -> HookRequest {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));

        let mut controller = GenericController::new(
            "w1",
            GenericControllerSpec {
                watch: GenericControllerResource {
                    rule: ResourceRule {
                        api_version: "v1".to_string(),
                        resource: "configmaps".to_string(),
                    },
                    ..Default::default()
                },
                attachments: Vec::new(),
                hooks: None,
                resync_period_seconds: None,
                read_only: None,
                update_any: None,
                delete_any: None,
                parameters: None,
            },
        );
        controller.metadata = ObjectMeta {
            name: Some("w1".to_string()),
            namespace: Some("ns1".to_string()),
            ..Default::default()
        };

        HookRequest {
            controller,
            watch: DynamicObject::new("w1", &ar).within("ns1"),
            attachments: AttachmentRegistry::new(),
            finalizing: false,
        }
    }
}
