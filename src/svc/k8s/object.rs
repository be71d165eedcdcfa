//! # Object module
//!
//! This module provide accessors over dynamic kubernetes objects, the
//! untyped representation every reconciler works against

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::Value;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize object into an untyped document, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to parse queue key '{0}', expected '<apiVersion>:<kind>:<namespace>:<name>'")]
    ParseKey(String),
}

// -----------------------------------------------------------------------------
// Identity accessors

/// returns the apiVersion carried by the object, empty when absent
pub fn api_version(obj: &DynamicObject) -> String {
    obj.types
        .as_ref()
        .map(|t| t.api_version.to_owned())
        .unwrap_or_default()
}

/// returns the kind carried by the object, empty when absent
pub fn kind(obj: &DynamicObject) -> String {
    obj.types
        .as_ref()
        .map(|t| t.kind.to_owned())
        .unwrap_or_default()
}

pub fn name(obj: &DynamicObject) -> String {
    obj.metadata.name.to_owned().unwrap_or_default()
}

pub fn namespace(obj: &DynamicObject) -> String {
    obj.metadata.namespace.to_owned().unwrap_or_default()
}

pub fn uid(obj: &DynamicObject) -> String {
    obj.metadata.uid.to_owned().unwrap_or_default()
}

/// returns if kubernetes considers the object as being deleted
pub fn deleted(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

// -----------------------------------------------------------------------------
// Queue key

/// returns the work queue identity of the object, four colon separated
/// fields, the namespace field staying empty for cluster scoped objects
pub fn queue_key(obj: &DynamicObject) -> String {
    format!(
        "{}:{}:{}:{}",
        api_version(obj),
        kind(obj),
        namespace(obj),
        name(obj)
    )
}

/// parses a queue key back into (apiVersion, kind, namespace, name)
pub fn parse_queue_key(key: &str) -> Result<(String, String, String, String), Error> {
    // the apiVersion field may contain '/' but never ':', so a plain
    // right-to-left split keeps every field unambiguous
    let fields: Vec<&str> = key.rsplitn(4, ':').collect();
    if fields.len() != 4 || fields[3].is_empty() || fields[2].is_empty() || fields[0].is_empty() {
        return Err(Error::ParseKey(key.to_string()));
    }

    Ok((
        fields[3].to_string(),
        fields[2].to_string(),
        fields[1].to_string(),
        fields[0].to_string(),
    ))
}

// -----------------------------------------------------------------------------
// Registry keys

/// returns the outer registry key of an attachment kind
pub fn version_kind_key(api_version: &str, kind: &str) -> String {
    format!("{}:{}", api_version, kind)
}

/// returns the inner registry key of an attachment instance
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        return name.to_string();
    }

    format!("{}/{}", namespace, name)
}

// -----------------------------------------------------------------------------
// Path traversal

/// splits a dot separated path into components, decoding '\.' into a literal
/// dot inside one component
pub fn split_path(path: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('.') => current.push('.'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            '.' => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    fields.push(current);
    fields
}

/// returns the whole object as an untyped document
pub fn to_value(obj: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(Error::Serialize)
}

/// walks the document following the given pre-split path
pub fn value_at<'a>(root: &'a Value, fields: &[String]) -> Option<&'a Value> {
    let mut current = root;

    for field in fields {
        match current {
            Value::Object(map) => current = map.get(field)?,
            _ => return None,
        }
    }

    Some(current)
}

/// returns the scalar value at the given dot path rendered as a string, or
/// none when the path is absent, null or leads into a composite value
pub fn string_at(root: &Value, path: &str) -> Option<String> {
    match value_at(root, &split_path(path))? {
        Value::String(s) => Some(s.to_owned()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// returns the array of strings at the given dot path, or none when the path
/// is absent or not an array of scalars
pub fn string_slice_at(root: &Value, path: &str) -> Option<Vec<String>> {
    match value_at(root, &split_path(path))? {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.to_owned()),
                    Value::Bool(b) => out.push(b.to_string()),
                    Value::Number(n) => out.push(n.to_string()),
                    _ => return None,
                }
            }

            Some(out)
        }
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Metadata maps

/// returns the labels of the object, empty when unset
pub fn labels(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.labels.to_owned().unwrap_or_default()
}

/// returns the annotations of the object, empty when unset
pub fn annotations(obj: &DynamicObject) -> BTreeMap<String, String> {
    obj.metadata.annotations.to_owned().unwrap_or_default()
}

/// applies hook directives onto a metadata map, a none value removing the
/// key and a some value setting it, and returns whether the map changed
pub fn apply_map_directives(
    map: &mut Option<BTreeMap<String, String>>,
    directives: &BTreeMap<String, Option<String>>,
) -> bool {
    if directives.is_empty() {
        return false;
    }

    let mut changed = false;
    let entries = map.get_or_insert_with(BTreeMap::new);

    for (key, directive) in directives {
        match directive {
            Some(value) => {
                if entries.get(key) != Some(value) {
                    entries.insert(key.to_owned(), value.to_owned());
                    changed = true;
                }
            }
            None => {
                if entries.remove(key).is_some() {
                    changed = true;
                }
            }
        }
    }

    if entries.is_empty() {
        *map = None;
    }

    changed
}

// -----------------------------------------------------------------------------
// Status

/// returns the nested status document of the object when present
pub fn status(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status")
}

/// replaces the nested status document wholesale and returns whether it
/// changed
pub fn set_status(obj: &mut DynamicObject, status: Value) -> bool {
    if obj.data.get("status") == Some(&status) {
        return false;
    }

    match &mut obj.data {
        Value::Object(map) => {
            map.insert("status".to_string(), status);
        }
        data => {
            *data = serde_json::json!({ "status": status });
        }
    }

    true
}

// -----------------------------------------------------------------------------
// Merge

/// merges the overlay document into the base document, maps recursively and
/// every other value by replacement
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.to_owned(), value.to_owned());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.to_owned(),
    }
}

/// merges a desired attachment into its observed live copy, keeping the live
/// object's identity fields and server populated metadata while layering the
/// desired payload on top
pub fn merge_attachment(observed: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut merged = observed.to_owned();

    deep_merge(&mut merged.data, &desired.data);

    let mut merged_labels = labels(observed);
    merged_labels.extend(labels(desired));
    if !merged_labels.is_empty() {
        merged.metadata.labels = Some(merged_labels);
    }

    let mut merged_annotations = annotations(observed);
    merged_annotations.extend(annotations(desired));
    if !merged_annotations.is_empty() {
        merged.metadata.annotations = Some(merged_annotations);
    }

    merged
}

// -----------------------------------------------------------------------------
// Unit tests
