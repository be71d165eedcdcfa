//! # Select module
//!
//! This module provide the selector evaluator, a pure function deciding
//! whether an object, optionally paired with a reference object, matches a
//! disjunction of selector terms

use std::collections::{BTreeMap, BTreeSet};

use kube::core::DynamicObject;
use serde_json::Value;

use crate::svc::{
    gctl::{
        GenericControllerResource, ReferenceSelectorOperator, ReferenceSelectorRequirement,
        SelectorOperator, SelectorRequirement, SelectorTerm, SliceSelectorOperator,
        SliceSelectorRequirement,
    },
    k8s::object,
};

// -----------------------------------------------------------------------------
// Constants

// distinct per side sentinels so that a missing-vs-missing comparison never
// trivially passes an equality check
const TARGET_MISSING: &str = "target-value-missing";
const REFERENCE_MISSING: &str = "reference-value-missing";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("selector evaluation needs a target object")]
    TargetRequired,
    #[error("selector evaluation needs a reference object")]
    ReferenceRequired,
    #[error("refKey can not be combined with operator of requirement '{0}'")]
    RefKeyNotAllowed(String),
    #[error("{0}")]
    Object(object::Error),
}

impl From<object::Error> for Error {
    fn from(err: object::Error) -> Self {
        Self::Object(err)
    }
}

// -----------------------------------------------------------------------------
// Selector structure

/// the compiled selector of one declared resource, the name, label,
/// annotation and advanced selectors all have to agree
#[derive(Clone, Debug, Default)]
pub struct Selector {
    names: Vec<String>,
    base_terms: Vec<SelectorTerm>,
    advanced_terms: Vec<SelectorTerm>,
}

impl From<&GenericControllerResource> for Selector {
    fn from(resource: &GenericControllerResource) -> Self {
        let mut base_terms = Vec::new();

        if let Some(selector) = &resource.label_selector {
            base_terms.push(SelectorTerm {
                match_labels: selector.match_labels.to_owned(),
                match_label_expressions: selector.match_expressions.to_owned(),
                ..Default::default()
            });
        }

        if let Some(selector) = &resource.annotation_selector {
            base_terms.push(SelectorTerm {
                match_annotations: selector.match_annotations.to_owned(),
                match_annotation_expressions: selector.match_expressions.to_owned(),
                ..Default::default()
            });
        }

        Self {
            names: resource.name_selector.to_owned().unwrap_or_default(),
            base_terms,
            advanced_terms: resource
                .advanced_selector
                .as_ref()
                .map(|s| s.selector_terms.to_owned())
                .unwrap_or_default(),
        }
    }
}

impl Selector {
    /// returns if the target matches every configured selector, the
    /// reference being the watched object when attachments are evaluated
    pub fn matches(
        &self,
        target: &DynamicObject,
        reference: Option<&DynamicObject>,
    ) -> Result<bool, Error> {
        if !self.names.is_empty() && !self.names.contains(&object::name(target)) {
            return Ok(false);
        }

        for term in &self.base_terms {
            if !evaluate(std::slice::from_ref(term), Some(target), reference)? {
                return Ok(false);
            }
        }

        evaluate(&self.advanced_terms, Some(target), reference)
    }
}

// -----------------------------------------------------------------------------
// Evaluation functions

/// evaluates a disjunction of terms, no term at all matching everything
pub fn evaluate(
    terms: &[SelectorTerm],
    target: Option<&DynamicObject>,
    reference: Option<&DynamicObject>,
) -> Result<bool, Error> {
    if terms.is_empty() {
        return Ok(true);
    }

    let target_doc = target.map(object::to_value).transpose()?;
    let reference_doc = reference.map(object::to_value).transpose()?;

    let mut matched = false;
    for term in terms {
        if evaluate_term(term, target_doc.as_ref(), reference_doc.as_ref())? {
            matched = true;
        }
    }

    Ok(matched)
}

/// evaluates one conjunction of predicate families, empty families pass
fn evaluate_term(
    term: &SelectorTerm,
    target: Option<&Value>,
    reference: Option<&Value>,
) -> Result<bool, Error> {
    if is_empty_term(term) {
        return Ok(true);
    }

    let target = target.ok_or(Error::TargetRequired)?;

    Ok(match_labels(term, target)
        && match_annotations(term, target)
        && match_fields(term, target)
        && match_slices(term, target)
        && match_references(term, target, reference)?)
}

fn is_empty_term(term: &SelectorTerm) -> bool {
    term.match_slice.as_ref().map_or(true, BTreeMap::is_empty)
        && term
            .match_slice_expressions
            .as_ref()
            .map_or(true, Vec::is_empty)
        && term.match_fields.as_ref().map_or(true, BTreeMap::is_empty)
        && term
            .match_field_expressions
            .as_ref()
            .map_or(true, Vec::is_empty)
        && term.match_labels.as_ref().map_or(true, BTreeMap::is_empty)
        && term
            .match_label_expressions
            .as_ref()
            .map_or(true, Vec::is_empty)
        && term
            .match_annotations
            .as_ref()
            .map_or(true, BTreeMap::is_empty)
        && term
            .match_annotation_expressions
            .as_ref()
            .map_or(true, Vec::is_empty)
        && term.match_reference.as_ref().map_or(true, Vec::is_empty)
        && term
            .match_reference_expressions
            .as_ref()
            .map_or(true, Vec::is_empty)
}

// -----------------------------------------------------------------------------
// Metadata map families

fn metadata_map(doc: &Value, field: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    if let Some(Value::Object(map)) =
        object::value_at(doc, &[String::from("metadata"), String::from(field)])
    {
        for (key, value) in map {
            if let Value::String(s) = value {
                out.insert(key.to_owned(), s.to_owned());
            }
        }
    }

    out
}

fn match_map_requirement(map: &BTreeMap<String, String>, req: &SelectorRequirement) -> bool {
    let values = req.values.as_deref().unwrap_or_default();

    match req.operator {
        SelectorOperator::In => map
            .get(&req.key)
            .map_or(false, |v| values.contains(v)),
        SelectorOperator::NotIn => map
            .get(&req.key)
            .map_or(true, |v| !values.contains(v)),
        SelectorOperator::Exists => map.contains_key(&req.key),
        SelectorOperator::DoesNotExist => !map.contains_key(&req.key),
    }
}

fn match_labels(term: &SelectorTerm, target: &Value) -> bool {
    let labels = metadata_map(target, "labels");

    if let Some(sugar) = &term.match_labels {
        for (key, value) in sugar {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    term.match_label_expressions
        .iter()
        .flatten()
        .all(|req| match_map_requirement(&labels, req))
}

fn match_annotations(term: &SelectorTerm, target: &Value) -> bool {
    let annotations = metadata_map(target, "annotations");

    if let Some(sugar) = &term.match_annotations {
        for (key, value) in sugar {
            if annotations.get(key) != Some(value) {
                return false;
            }
        }
    }

    term.match_annotation_expressions
        .iter()
        .flatten()
        .all(|req| match_map_requirement(&annotations, req))
}

// -----------------------------------------------------------------------------
// Field family

fn match_field_requirement(target: &Value, req: &SelectorRequirement) -> bool {
    let actual = object::string_at(target, &req.key);
    let values = req.values.as_deref().unwrap_or_default();

    // an absent path is treated as an absent key, which lets DoesNotExist
    // and the negative operators succeed
    match req.operator {
        SelectorOperator::In => actual.map_or(false, |v| values.contains(&v)),
        SelectorOperator::NotIn => actual.map_or(true, |v| !values.contains(&v)),
        SelectorOperator::Exists => actual.is_some(),
        SelectorOperator::DoesNotExist => actual.is_none(),
    }
}

fn match_fields(term: &SelectorTerm, target: &Value) -> bool {
    if let Some(sugar) = &term.match_fields {
        for (path, value) in sugar {
            if object::string_at(target, path).as_ref() != Some(value) {
                return false;
            }
        }
    }

    term.match_field_expressions
        .iter()
        .flatten()
        .all(|req| match_field_requirement(target, req))
}

// -----------------------------------------------------------------------------
// Slice family

fn match_slice_requirement(target: &Value, req: &SliceSelectorRequirement) -> bool {
    let actual = object::string_slice_at(target, &req.key);
    let values: BTreeSet<&str> = req
        .values
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();

    match req.operator {
        SliceSelectorOperator::Equals => actual.map_or(false, |items| {
            items.iter().map(String::as_str).collect::<BTreeSet<_>>() == values
        }),
        SliceSelectorOperator::NotEquals => actual.map_or(true, |items| {
            items.iter().map(String::as_str).collect::<BTreeSet<_>>() != values
        }),
        SliceSelectorOperator::In => actual.map_or(false, |items| {
            let have: BTreeSet<&str> = items.iter().map(String::as_str).collect();
            values.is_subset(&have)
        }),
        SliceSelectorOperator::NotIn => actual.map_or(true, |items| {
            let have: BTreeSet<&str> = items.iter().map(String::as_str).collect();
            values.is_disjoint(&have)
        }),
    }
}

fn match_slices(term: &SelectorTerm, target: &Value) -> bool {
    if let Some(sugar) = &term.match_slice {
        for (path, values) in sugar {
            let req = SliceSelectorRequirement {
                key: path.to_owned(),
                operator: SliceSelectorOperator::Equals,
                values: Some(values.to_owned()),
            };
            if !match_slice_requirement(target, &req) {
                return false;
            }
        }
    }

    term.match_slice_expressions
        .iter()
        .flatten()
        .all(|req| match_slice_requirement(target, req))
}

// -----------------------------------------------------------------------------
// Reference family

fn target_value_or_sentinel(target: &Value, path: &str) -> String {
    object::string_at(target, path).unwrap_or_else(|| TARGET_MISSING.to_string())
}

fn reference_value_or_sentinel(reference: &Value, path: &str) -> String {
    object::string_at(reference, path).unwrap_or_else(|| REFERENCE_MISSING.to_string())
}

fn match_reference_requirement(
    target: &Value,
    reference: &Value,
    req: &ReferenceSelectorRequirement,
) -> Result<bool, Error> {
    let actual = target_value_or_sentinel(target, &req.key);

    let expected = match req.operator {
        ReferenceSelectorOperator::Equals | ReferenceSelectorOperator::NotEquals => {
            let ref_path = req.ref_key.as_deref().unwrap_or(&req.key);
            reference_value_or_sentinel(reference, ref_path)
        }
        ReferenceSelectorOperator::EqualsWatchName
        | ReferenceSelectorOperator::EqualsWatchNamespace
        | ReferenceSelectorOperator::EqualsWatchUID => {
            if req.ref_key.is_some() {
                return Err(Error::RefKeyNotAllowed(req.key.to_owned()));
            }

            let path = match req.operator {
                ReferenceSelectorOperator::EqualsWatchName => "metadata.name",
                ReferenceSelectorOperator::EqualsWatchNamespace => "metadata.namespace",
                _ => "metadata.uid",
            };
            reference_value_or_sentinel(reference, path)
        }
    };

    Ok(match req.operator {
        ReferenceSelectorOperator::NotEquals => actual != expected,
        _ => actual == expected,
    })
}

fn match_references(
    term: &SelectorTerm,
    target: &Value,
    reference: Option<&Value>,
) -> Result<bool, Error> {
    let paths = term.match_reference.as_deref().unwrap_or_default();
    let expressions = term
        .match_reference_expressions
        .as_deref()
        .unwrap_or_default();

    if paths.is_empty() && expressions.is_empty() {
        return Ok(true);
    }

    let reference = reference.ok_or(Error::ReferenceRequired)?;

    for path in paths {
        let req = ReferenceSelectorRequirement {
            key: path.to_owned(),
            operator: ReferenceSelectorOperator::Equals,
            ref_key: None,
        };
        if !match_reference_requirement(target, reference, &req)? {
            return Ok(false);
        }
    }

    for req in expressions {
        if !match_reference_requirement(target, reference, req)? {
            return Ok(false);
        }
    }

    Ok(true)
}

// -----------------------------------------------------------------------------
// Unit tests
