//! # GenericController module
//!
//! This module provide the GenericController custom resource, the
//! declarative specification a reconciler is built from, together with its
//! validation rules

use std::{collections::BTreeMap, time::Duration};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod loader;

// -----------------------------------------------------------------------------
// Constants

/// annotation prefix marking an attachment as claimed by a specification
pub const CLAIM_ANNOTATION_PREFIX: &str = "gctl.metac.openebs.io/";

/// value carried by the claim annotation
pub const CLAIM_ANNOTATION_VALUE: &str = "MetaGenericController";

/// finalizer prefix protecting watched objects of finalizing specifications
pub const FINALIZER_PREFIX: &str = "protect.gctl.metac.openebs.io/";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid specification '{0}', a watch resource is required")]
    MissingWatch(String),
    #[error("invalid specification '{0}', readOnly can not be combined with updateAny or deleteAny")]
    PermissionConflict(String),
    #[error("invalid specification '{0}', resource rule needs both apiVersion and resource")]
    EmptyRule(String),
    #[error("invalid specification '{0}', a hook declares none or several of webhook, inline and confighook")]
    AmbiguousHook(String),
    #[error("invalid specification '{0}', a webhook needs either an url or a service reference")]
    WebhookTarget(String),
    #[error("specification key '{0}' is declared more than once")]
    DuplicateKey(String),
}

// -----------------------------------------------------------------------------
// ResourceRule structure

/// a plural resource name within a group version, resolvable through api
/// discovery
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ResourceRule {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "resource")]
    pub resource: String,
}

// -----------------------------------------------------------------------------
// Selector requirement structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SelectorRequirement {
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "operator")]
    pub operator: SelectorOperator,
    #[serde(rename = "values", default)]
    pub values: Option<Vec<String>>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub enum SliceSelectorOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SliceSelectorRequirement {
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "operator")]
    pub operator: SliceSelectorOperator,
    #[serde(rename = "values", default)]
    pub values: Option<Vec<String>>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub enum ReferenceSelectorOperator {
    #[default]
    #[serde(alias = "")]
    Equals,
    NotEquals,
    EqualsWatchName,
    EqualsWatchNamespace,
    EqualsWatchUID,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ReferenceSelectorRequirement {
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "operator", default)]
    pub operator: ReferenceSelectorOperator,
    #[serde(rename = "refKey", default)]
    pub ref_key: Option<String>,
}

// -----------------------------------------------------------------------------
// SelectorTerm structure

/// one conjunction of predicate families, empty families pass
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct SelectorTerm {
    #[serde(rename = "matchSlice", default)]
    pub match_slice: Option<BTreeMap<String, Vec<String>>>,
    #[serde(rename = "matchSliceExpressions", default)]
    pub match_slice_expressions: Option<Vec<SliceSelectorRequirement>>,
    #[serde(rename = "matchFields", default)]
    pub match_fields: Option<BTreeMap<String, String>>,
    #[serde(rename = "matchFieldExpressions", default)]
    pub match_field_expressions: Option<Vec<SelectorRequirement>>,
    #[serde(rename = "matchLabels", default)]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "matchLabelExpressions", default)]
    pub match_label_expressions: Option<Vec<SelectorRequirement>>,
    #[serde(rename = "matchAnnotations", default)]
    pub match_annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "matchAnnotationExpressions", default)]
    pub match_annotation_expressions: Option<Vec<SelectorRequirement>>,
    #[serde(rename = "matchReference", default)]
    pub match_reference: Option<Vec<String>>,
    #[serde(rename = "matchReferenceExpressions", default)]
    pub match_reference_expressions: Option<Vec<ReferenceSelectorRequirement>>,
}

/// a disjunction of selector terms
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ResourceSelector {
    #[serde(rename = "selectorTerms", default)]
    pub selector_terms: Vec<SelectorTerm>,
}

// -----------------------------------------------------------------------------
// Metadata selector structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "matchExpressions", default)]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct AnnotationSelector {
    #[serde(rename = "matchAnnotations", default)]
    pub match_annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "matchExpressions", default)]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

// -----------------------------------------------------------------------------
// GenericControllerResource structure

/// the watched resource or an attachment resource together with its
/// selectors, an empty selector matches everything
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct GenericControllerResource {
    #[serde(flatten)]
    pub rule: ResourceRule,
    #[serde(rename = "nameSelector", default)]
    pub name_selector: Option<Vec<String>>,
    #[serde(rename = "labelSelector", default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(rename = "annotationSelector", default)]
    pub annotation_selector: Option<AnnotationSelector>,
    #[serde(rename = "advancedSelector", default)]
    pub advanced_selector: Option<ResourceSelector>,
}

// -----------------------------------------------------------------------------
// Update strategy structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub enum ChildUpdateMethod {
    #[default]
    OnDelete,
    InPlace,
    Recreate,
    RollingInPlace,
    RollingRecreate,
}

impl ChildUpdateMethod {
    /// returns if the method updates a bounded subset per pass, gated by
    /// status checks
    pub fn is_rolling(&self) -> bool {
        matches!(self, Self::RollingInPlace | Self::RollingRecreate)
    }

    /// returns if the method replaces the object instead of patching it
    pub fn recreates(&self) -> bool {
        matches!(self, Self::Recreate | Self::RollingRecreate)
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(rename = "status", default)]
    pub status: Option<String>,
    #[serde(rename = "reason", default)]
    pub reason: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct StatusChecks {
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<StatusCondition>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct AttachmentUpdateStrategy {
    #[serde(rename = "method", default)]
    pub method: Option<ChildUpdateMethod>,
    #[serde(rename = "statusChecks", default)]
    pub status_checks: Option<StatusChecks>,
}

// -----------------------------------------------------------------------------
// GenericControllerAttachment structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct GenericControllerAttachment {
    #[serde(flatten)]
    pub resource: GenericControllerResource,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: Option<AttachmentUpdateStrategy>,
}

// -----------------------------------------------------------------------------
// Hook structures

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ServiceReference {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "port", default)]
    pub port: Option<i32>,
    #[serde(rename = "path", default)]
    pub path: Option<String>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Webhook {
    #[serde(rename = "url", default)]
    pub url: Option<String>,
    #[serde(rename = "timeoutSeconds", default)]
    pub timeout_seconds: Option<u32>,
    #[serde(rename = "path", default)]
    pub path: Option<String>,
    #[serde(rename = "service", default)]
    pub service: Option<ServiceReference>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Inline {
    #[serde(rename = "funcName")]
    pub func_name: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ConfigHookType {
    Jsonnet,
    GoTemplate,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ConfigHook {
    #[serde(rename = "type")]
    pub hook_type: ConfigHookType,
    #[serde(rename = "name")]
    pub name: String,
}

/// user supplied logic reachable over exactly one transport
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Hook {
    #[serde(rename = "webhook", default)]
    pub webhook: Option<Webhook>,
    #[serde(rename = "inline", default)]
    pub inline: Option<Inline>,
    #[serde(rename = "confighook", default)]
    pub confighook: Option<ConfigHook>,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct GenericControllerHooks {
    #[serde(rename = "sync", default)]
    pub sync: Option<Hook>,
    #[serde(rename = "finalize", default)]
    pub finalize: Option<Hook>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "metac.openebs.io")]
#[kube(version = "v1alpha1")]
#[kube(kind = "GenericController")]
#[kube(singular = "genericcontroller")]
#[kube(plural = "genericcontrollers")]
#[kube(shortname = "gctl")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct GenericControllerSpec {
    #[serde(rename = "watch")]
    pub watch: GenericControllerResource,
    #[serde(rename = "attachments", default)]
    pub attachments: Vec<GenericControllerAttachment>,
    #[serde(rename = "hooks", default)]
    pub hooks: Option<GenericControllerHooks>,
    #[serde(rename = "resyncPeriodSeconds", default)]
    pub resync_period_seconds: Option<u32>,
    #[serde(rename = "readOnly", default)]
    pub read_only: Option<bool>,
    #[serde(rename = "updateAny", default)]
    pub update_any: Option<bool>,
    #[serde(rename = "deleteAny", default)]
    pub delete_any: Option<bool>,
    #[serde(rename = "parameters", default)]
    pub parameters: Option<BTreeMap<String, String>>,
}

// -----------------------------------------------------------------------------
// GenericController implementation

impl GenericController {
    /// returns the unique key of the specification
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// returns the annotation key claiming attachments for this
    /// specification
    pub fn claim_annotation(&self) -> String {
        format!(
            "{}{}-{}",
            CLAIM_ANNOTATION_PREFIX,
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// returns the finalizer protecting watched objects of this
    /// specification
    pub fn finalizer_name(&self) -> String {
        format!(
            "{}{}-{}",
            FINALIZER_PREFIX,
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    pub fn read_only(&self) -> bool {
        self.spec.read_only.unwrap_or(false)
    }

    pub fn update_any(&self) -> bool {
        self.spec.update_any.unwrap_or(false)
    }

    pub fn delete_any(&self) -> bool {
        self.spec.delete_any.unwrap_or(false)
    }

    pub fn sync_hook(&self) -> Option<&Hook> {
        self.spec.hooks.as_ref().and_then(|h| h.sync.as_ref())
    }

    pub fn finalize_hook(&self) -> Option<&Hook> {
        self.spec.hooks.as_ref().and_then(|h| h.finalize.as_ref())
    }

    /// returns the resync cadence of the watched resource, floored to one
    /// second
    pub fn resync_period(&self) -> Option<Duration> {
        self.spec
            .resync_period_seconds
            .map(|seconds| Duration::from_secs(u64::from(seconds.max(1))))
    }

    /// validates one specification against its structural invariants
    pub fn validate(&self) -> Result<(), Error> {
        let key = self.key();

        let watch = &self.spec.watch;
        if watch.rule.api_version.is_empty() && watch.rule.resource.is_empty() {
            return Err(Error::MissingWatch(key));
        }
        if watch.rule.api_version.is_empty() || watch.rule.resource.is_empty() {
            return Err(Error::EmptyRule(key));
        }

        if self.read_only() && (self.update_any() || self.delete_any()) {
            return Err(Error::PermissionConflict(key));
        }

        for attachment in &self.spec.attachments {
            let rule = &attachment.resource.rule;
            if rule.api_version.is_empty() || rule.resource.is_empty() {
                return Err(Error::EmptyRule(key));
            }
        }

        let hooks = [self.sync_hook(), self.finalize_hook()];
        for hook in hooks.into_iter().flatten() {
            let transports = [
                hook.webhook.is_some(),
                hook.inline.is_some(),
                hook.confighook.is_some(),
            ]
            .iter()
            .filter(|t| **t)
            .count();
            if transports != 1 {
                return Err(Error::AmbiguousHook(key));
            }

            if let Some(webhook) = &hook.webhook {
                if webhook.url.is_none() && webhook.service.is_none() {
                    return Err(Error::WebhookTarget(key));
                }
            }
        }

        Ok(())
    }
}

/// validates a whole set of specifications, rejecting duplicate keys
pub fn validate_set(specs: &[GenericController]) -> Result<(), Error> {
    let mut seen = std::collections::HashSet::new();

    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.key()) {
            return Err(Error::DuplicateKey(spec.key()));
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use kube::core::ObjectMeta;

    use super::*;

    fn controller(ns: &str, name: &str) -> GenericController {
        let mut ctrl = GenericController::new(
            name,
            GenericControllerSpec {
                watch: GenericControllerResource {
                    rule: ResourceRule {
                        api_version: "v1".to_string(),
                        resource: "pods".to_string(),
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

        ctrl.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        };

        ctrl
    }

    #[test]
    fn key_and_markers_derive_from_identity() {
        let ctrl = controller("ns1", "w1");

        assert_eq!(ctrl.key(), "ns1/w1");
        assert_eq!(ctrl.claim_annotation(), "gctl.metac.openebs.io/ns1-w1");
        assert_eq!(
            ctrl.finalizer_name(),
            "protect.gctl.metac.openebs.io/ns1-w1"
        );
    }

    #[test]
    fn read_only_conflicts_with_mutating_flags() {
        let mut ctrl = controller("ns1", "w1");
        ctrl.spec.read_only = Some(true);
        assert!(ctrl.validate().is_ok());

        ctrl.spec.update_any = Some(true);
        assert!(matches!(
            ctrl.validate(),
            Err(Error::PermissionConflict(_))
        ));

        ctrl.spec.update_any = None;
        ctrl.spec.delete_any = Some(true);
        assert!(matches!(
            ctrl.validate(),
            Err(Error::PermissionConflict(_))
        ));
    }

    #[test]
    fn watch_rule_is_required() {
        let mut ctrl = controller("ns1", "w1");
        ctrl.spec.watch.rule = ResourceRule::default();
        assert!(matches!(ctrl.validate(), Err(Error::MissingWatch(_))));

        ctrl.spec.watch.rule.api_version = "v1".to_string();
        assert!(matches!(ctrl.validate(), Err(Error::EmptyRule(_))));
    }

    #[test]
    fn hook_declares_exactly_one_transport() {
        let mut ctrl = controller("ns1", "w1");
        ctrl.spec.hooks = Some(GenericControllerHooks {
            sync: Some(Hook::default()),
            finalize: None,
        });
        assert!(matches!(ctrl.validate(), Err(Error::AmbiguousHook(_))));

        ctrl.spec.hooks = Some(GenericControllerHooks {
            sync: Some(Hook {
                webhook: Some(Webhook::default()),
                ..Default::default()
            }),
            finalize: None,
        });
        assert!(matches!(ctrl.validate(), Err(Error::WebhookTarget(_))));

        ctrl.spec.hooks = Some(GenericControllerHooks {
            sync: Some(Hook {
                webhook: Some(Webhook {
                    url: Some("http://localhost:8080/sync".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            finalize: None,
        });
        assert!(ctrl.validate().is_ok());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let specs = vec![controller("ns1", "w1"), controller("ns1", "w1")];
        assert!(matches!(
            validate_set(&specs),
            Err(Error::DuplicateKey(_))
        ));

        let specs = vec![controller("ns1", "w1"), controller("ns2", "w1")];
        assert!(validate_set(&specs).is_ok());
    }

    #[test]
    fn resync_period_floors_to_one_second() {
        let mut ctrl = controller("ns1", "w1");
        assert_eq!(ctrl.resync_period(), None);

        ctrl.spec.resync_period_seconds = Some(0);
        assert_eq!(ctrl.resync_period(), Some(Duration::from_secs(1)));

        ctrl.spec.resync_period_seconds = Some(30);
        assert_eq!(ctrl.resync_period(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn specification_deserializes_from_yaml() {
        let manifest = r#"
apiVersion: metac.openebs.io/v1alpha1
kind: GenericController
metadata:
  name: sync-secrets
  namespace: metac
spec:
  watch:
    apiVersion: v1
    resource: namespaces
  attachments:
  - apiVersion: v1
    resource: secrets
    nameSelector:
    - api-secret
    updateStrategy:
      method: InPlace
  hooks:
    sync:
      webhook:
        url: http://secret-sync.metac:8080/sync
        timeoutSeconds: 10
"#;

        let ctrl: GenericController = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(ctrl.key(), "metac/sync-secrets");
        assert_eq!(ctrl.spec.watch.rule.resource, "namespaces");
        assert_eq!(ctrl.spec.attachments.len(), 1);
        assert_eq!(
            ctrl.spec.attachments[0]
                .update_strategy
                .as_ref()
                .and_then(|s| s.method.as_ref()),
            Some(&ChildUpdateMethod::InPlace)
        );
        assert!(ctrl.validate().is_ok());
    }
}
