//! # Attachment module
//!
//! This module provide the attachment registries and the diff turning an
//! observed set and a desired set into create, update and delete operations

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::svc::{
    controller::strategy::{status_checks_pass, UpdateStrategies},
    gctl::CLAIM_ANNOTATION_VALUE,
    k8s::object,
};

// -----------------------------------------------------------------------------
// AttachmentRegistry structure

/// two level mapping from an attachment kind to its instances, keyed the
/// same way the hook payload serializes them
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(transparent)]
pub struct AttachmentRegistry {
    entries: BTreeMap<String, BTreeMap<String, DynamicObject>>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// records the object under its version kind and namespaced name keys
    pub fn insert(&mut self, obj: DynamicObject) {
        let outer = object::version_kind_key(&object::api_version(&obj), &object::kind(&obj));
        let inner = object::namespaced_key(&object::namespace(&obj), &object::name(&obj));

        self.entries.entry(outer).or_default().insert(inner, obj);
    }

    pub fn get(&self, outer: &str, inner: &str) -> Option<&DynamicObject> {
        self.entries.get(outer).and_then(|kinds| kinds.get(inner))
    }

    pub fn contains(&self, obj: &DynamicObject) -> bool {
        let outer = object::version_kind_key(&object::api_version(obj), &object::kind(obj));
        let inner = object::namespaced_key(&object::namespace(obj), &object::name(obj));

        self.get(&outer, &inner).is_some()
    }

    /// iterates over every instance together with its registry keys
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String, &DynamicObject)> {
        self.entries.iter().flat_map(|(outer, kinds)| {
            kinds.iter().map(move |(inner, obj)| (outer, inner, obj))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -----------------------------------------------------------------------------
// Claim helper

/// returns if the object carries the claim annotation of the specification
pub fn claimed(obj: &DynamicObject, claim_key: &str) -> bool {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(claim_key))
        .map(String::as_str)
        == Some(CLAIM_ANNOTATION_VALUE)
}

/// stamps the claim annotation onto the object
pub fn claim(obj: &mut DynamicObject, claim_key: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(claim_key.to_string(), CLAIM_ANNOTATION_VALUE.to_string());
}

// -----------------------------------------------------------------------------
// Plan structures

#[derive(Clone, Debug)]
pub struct AttachmentUpdate {
    pub observed: DynamicObject,
    pub merged: DynamicObject,
}

/// the operations one reconcile pass intends to apply
#[derive(Clone, Debug, Default)]
pub struct ReconcilePlan {
    pub creates: Vec<DynamicObject>,
    pub updates: Vec<AttachmentUpdate>,
    pub deletes: Vec<DynamicObject>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Planner structure

/// pure diff between the desired and the observed attachment sets under the
/// permission flags and update strategies of one specification
pub struct Planner<'a> {
    pub claim_key: &'a str,
    pub read_only: bool,
    pub update_any: bool,
    pub delete_any: bool,
    pub strategies: &'a UpdateStrategies,
}

impl Planner<'_> {
    pub fn plan(&self, desired: &AttachmentRegistry, observed: &AttachmentRegistry) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();

        if self.read_only {
            return plan;
        }

        // in desired but not observed
        for (outer, inner, wanted) in desired.iter() {
            if observed.get(outer, inner).is_none() {
                let mut create = wanted.to_owned();
                claim(&mut create, self.claim_key);
                plan.creates.push(create);
            }
        }

        // walk observed kinds, the inner map being name ordered which keeps
        // rolling updates deterministic
        for (outer, kinds) in &observed.entries {
            let mut rolling_window_spent = false;

            for (inner, live) in kinds {
                let is_claimed = claimed(live, self.claim_key);

                match desired.get(outer, inner) {
                    Some(wanted) => {
                        if !is_claimed && !self.update_any {
                            // held for read only context
                            continue;
                        }

                        let (method, checks) = self.strategies.get(
                            &object::api_version(live),
                            &object::kind(live),
                        );
                        if method == crate::svc::gctl::ChildUpdateMethod::OnDelete {
                            continue;
                        }

                        let mut wanted = wanted.to_owned();
                        claim(&mut wanted, self.claim_key);
                        let merged = object::merge_attachment(live, &wanted);

                        let drifted = serde_json::to_value(&merged).ok()
                            != serde_json::to_value(live).ok();
                        if !drifted {
                            continue;
                        }

                        if method.is_rolling() {
                            if rolling_window_spent {
                                continue;
                            }
                            if let Some(checks) = checks {
                                if !status_checks_pass(live, checks) {
                                    // hold the rollout until the gate opens
                                    rolling_window_spent = true;
                                    continue;
                                }
                            }
                            rolling_window_spent = true;
                        }

                        if method.recreates() {
                            plan.deletes.push(live.to_owned());
                        } else {
                            plan.updates.push(AttachmentUpdate {
                                observed: live.to_owned(),
                                merged,
                            });
                        }
                    }
                    None => {
                        if is_claimed || self.delete_any {
                            plan.deletes.push(live.to_owned());
                        }
                    }
                }
            }
        }

        plan
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, GroupVersionKind};

    use super::*;
    use crate::svc::gctl::{
        AttachmentUpdateStrategy, ChildUpdateMethod, StatusChecks, StatusCondition,
    };

    const CLAIM_KEY: &str = "gctl.metac.openebs.io/ns1-w1";

    fn attachment(kind: &str, name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", kind));
        DynamicObject::new(name, &ar).within("ns1")
    }

    fn claimed_attachment(kind: &str, name: &str) -> DynamicObject {
        let mut obj = attachment(kind, name);
        claim(&mut obj, CLAIM_KEY);
        obj
    }

    fn registry(objs: Vec<DynamicObject>) -> AttachmentRegistry {
        let mut registry = AttachmentRegistry::new();
        for obj in objs {
            registry.insert(obj);
        }
        registry
    }

    fn planner<'a>(strategies: &'a UpdateStrategies) -> Planner<'a> {
        Planner {
            claim_key: CLAIM_KEY,
            read_only: false,
            update_any: false,
            delete_any: false,
            strategies,
        }
    }

    #[test]
    fn registry_keys_follow_the_wire_format() {
        let registry = registry(vec![attachment("ConfigMap", "c1")]);

        assert!(registry.get("v1:ConfigMap", "ns1/c1").is_some());
        assert_eq!(registry.len(), 1);

        let doc = serde_json::to_value(&registry).unwrap();
        assert!(doc.get("v1:ConfigMap").and_then(|k| k.get("ns1/c1")).is_some());
    }

    #[test]
    fn missing_desired_attachment_is_created_with_claim() {
        let strategies = UpdateStrategies::new();
        let plan = planner(&strategies).plan(
            &registry(vec![attachment("ConfigMap", "c1")]),
            &AttachmentRegistry::new(),
        );

        assert_eq!(plan.creates.len(), 1);
        assert!(claimed(&plan.creates[0], CLAIM_KEY));
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn claimed_orphan_is_deleted_and_unclaimed_is_kept() {
        let strategies = UpdateStrategies::new();
        let observed = registry(vec![
            claimed_attachment("ConfigMap", "claimed"),
            attachment("ConfigMap", "foreign"),
        ]);

        let plan = planner(&strategies).plan(&AttachmentRegistry::new(), &observed);
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(object::name(&plan.deletes[0]), "claimed");

        let mut any = planner(&strategies);
        any.delete_any = true;
        let plan = any.plan(&AttachmentRegistry::new(), &observed);
        assert_eq!(plan.deletes.len(), 2);
    }

    #[test]
    fn on_delete_default_never_updates() {
        let strategies = UpdateStrategies::new();

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "new"}});
        let mut live = claimed_attachment("ConfigMap", "c1");
        live.data = serde_json::json!({"data": {"k": "old"}});

        let plan = planner(&strategies).plan(&registry(vec![wanted]), &registry(vec![live]));
        assert!(plan.is_empty());
    }

    #[test]
    fn in_place_update_merges_on_top_of_live_object() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::InPlace),
                status_checks: None,
            },
        );

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "new"}});
        let mut live = claimed_attachment("ConfigMap", "c1");
        live.metadata.resource_version = Some("9".to_string());
        live.data = serde_json::json!({"data": {"k": "old", "other": "kept"}});

        let plan = planner(&strategies).plan(&registry(vec![wanted]), &registry(vec![live]));

        assert_eq!(plan.updates.len(), 1);
        let merged = &plan.updates[0].merged;
        assert_eq!(merged.metadata.resource_version, Some("9".to_string()));
        assert_eq!(
            merged.data["data"],
            serde_json::json!({"k": "new", "other": "kept"})
        );
    }

    #[test]
    fn recreate_strategy_deletes_the_drifted_object() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::Recreate),
                status_checks: None,
            },
        );

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "new"}});
        let mut live = claimed_attachment("ConfigMap", "c1");
        live.data = serde_json::json!({"data": {"k": "old"}});

        let plan = planner(&strategies).plan(&registry(vec![wanted]), &registry(vec![live]));
        assert!(plan.updates.is_empty());
        assert_eq!(plan.deletes.len(), 1);
    }

    #[test]
    fn unclaimed_desired_attachment_needs_update_any() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::InPlace),
                status_checks: None,
            },
        );

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "new"}});
        let live = attachment("ConfigMap", "c1");

        let plan = planner(&strategies).plan(
            &registry(vec![wanted.to_owned()]),
            &registry(vec![live.to_owned()]),
        );
        assert!(plan.is_empty());

        let mut any = planner(&strategies);
        any.update_any = true;
        let plan = any.plan(&registry(vec![wanted]), &registry(vec![live]));
        assert_eq!(plan.updates.len(), 1);
    }

    #[test]
    fn read_only_plans_nothing() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::InPlace),
                status_checks: None,
            },
        );

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "new"}});
        let observed = registry(vec![claimed_attachment("ConfigMap", "orphan")]);

        let mut read_only = planner(&strategies);
        read_only.read_only = true;
        let plan = read_only.plan(&registry(vec![wanted]), &observed);

        assert!(plan.is_empty());
    }

    #[test]
    fn applying_the_same_desired_set_twice_is_a_no_op() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::InPlace),
                status_checks: None,
            },
        );

        let mut wanted = attachment("ConfigMap", "c1");
        wanted.data = serde_json::json!({"data": {"k": "v"}});
        let desired = registry(vec![wanted]);

        let plan = planner(&strategies).plan(&desired, &AttachmentRegistry::new());
        assert_eq!(plan.creates.len(), 1);

        // the cluster now reflects the first pass
        let observed = registry(vec![plan.creates[0].to_owned()]);
        let second = planner(&strategies).plan(&desired, &observed);
        assert!(second.is_empty());
    }

    #[test]
    fn rolling_updates_mutate_one_object_per_pass_behind_the_gate() {
        let mut strategies = UpdateStrategies::new();
        strategies.insert(
            "",
            "ConfigMap",
            &AttachmentUpdateStrategy {
                method: Some(ChildUpdateMethod::RollingInPlace),
                status_checks: Some(StatusChecks {
                    conditions: vec![StatusCondition {
                        condition_type: "Ready".to_string(),
                        status: None,
                        reason: None,
                    }],
                }),
            },
        );

        let ready = serde_json::json!({
            "data": {"k": "old"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]},
        });

        let mut desired = Vec::new();
        let mut observed = Vec::new();
        for name in ["c1", "c2"] {
            let mut wanted = attachment("ConfigMap", name);
            wanted.data = serde_json::json!({"data": {"k": "new"}});
            desired.push(wanted);

            let mut live = claimed_attachment("ConfigMap", name);
            live.data = ready.to_owned();
            observed.push(live);
        }

        let plan = planner(&strategies).plan(&registry(desired.to_owned()), &registry(observed));
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(object::name(&plan.updates[0].observed), "c1");

        // a closed gate holds the whole rollout of the kind
        let mut blocked = claimed_attachment("ConfigMap", "c1");
        blocked.data = serde_json::json!({"data": {"k": "old"}});
        let plan = planner(&strategies).plan(&registry(desired), &registry(vec![blocked]));
        assert!(plan.updates.is_empty());
    }
}
