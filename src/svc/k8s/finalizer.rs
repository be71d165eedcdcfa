//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::{core::DynamicObject, Resource};

use crate::svc::k8s::object;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| finalizer == f))
        .unwrap_or(false)
}

/// idempotently add the finalizer to the resource, returns whether the
/// resource changed
pub fn add<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    if contains(obj, finalizer) {
        return false;
    }

    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());

    true
}

/// remove the finalizer from the resource, returns whether the resource
/// changed
pub fn remove<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    if !contains(obj, finalizer) {
        return false;
    }

    if let Some(finalizers) = &mut obj.meta_mut().finalizers {
        finalizers.retain(|f| f != finalizer);
        if finalizers.is_empty() {
            obj.meta_mut().finalizers = None;
        }
    }

    true
}

// -----------------------------------------------------------------------------
// Finalizer structure

/// per reconciler finalizer coordination, enabled if and only if the owning
/// specification carries a finalize hook
#[derive(Clone, Debug)]
pub struct Finalizer {
    pub name: String,
    pub enabled: bool,
}

impl Finalizer {
    pub fn new(name: String, enabled: bool) -> Self {
        Self { name, enabled }
    }

    /// idempotently attach the finalizer to a claimed watched object,
    /// returns whether the object changed
    pub fn ensure(&self, obj: &mut DynamicObject) -> bool {
        if !self.enabled {
            return false;
        }

        add(obj, &self.name)
    }

    /// returns if the object must be routed to the finalize hook, which is
    /// the case once it carries the finalizer and is either pending deletion
    /// or no longer selected
    pub fn should_finalize(&self, obj: &DynamicObject, selected: bool) -> bool {
        if !self.enabled || !contains(obj, &self.name) {
            return false;
        }

        object::deleted(obj) || !selected
    }

    /// remove the finalizer entry, returns whether the object changed
    pub fn remove_from(&self, obj: &mut DynamicObject) -> bool {
        remove(obj, &self.name)
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    use super::*;

    fn watch(name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        DynamicObject::new(name, &ar).within("ns1")
    }

    #[test]
    fn add_is_idempotent() {
        let mut obj = watch("w1");

        assert!(add(&mut obj, "protect.gctl.metac.openebs.io/ns1-w1"));
        assert!(!add(&mut obj, "protect.gctl.metac.openebs.io/ns1-w1"));
        assert_eq!(obj.metadata.finalizers.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn remove_clears_empty_list() {
        let mut obj = watch("w1");
        add(&mut obj, "protect.gctl.metac.openebs.io/ns1-w1");

        assert!(remove(&mut obj, "protect.gctl.metac.openebs.io/ns1-w1"));
        assert!(obj.metadata.finalizers.is_none());
        assert!(!remove(&mut obj, "protect.gctl.metac.openebs.io/ns1-w1"));
    }

    #[test]
    fn disabled_finalizer_never_mutates() {
        let finalizer = Finalizer::new("protect.gctl.metac.openebs.io/ns1-w1".to_string(), false);
        let mut obj = watch("w1");

        assert!(!finalizer.ensure(&mut obj));
        assert!(obj.metadata.finalizers.is_none());
        assert!(!finalizer.should_finalize(&obj, false));
    }

    #[test]
    fn should_finalize_on_deletion_or_deselection() {
        let finalizer = Finalizer::new("protect.gctl.metac.openebs.io/ns1-w1".to_string(), true);
        let mut obj = watch("w1");

        // not yet claimed
        assert!(!finalizer.should_finalize(&obj, true));

        finalizer.ensure(&mut obj);
        assert!(!finalizer.should_finalize(&obj, true));

        // deselected while alive still routes to finalize
        assert!(finalizer.should_finalize(&obj, false));

        obj.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()),
        );
        assert!(finalizer.should_finalize(&obj, true));
    }
}
