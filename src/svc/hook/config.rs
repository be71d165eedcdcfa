//! # Confighook module
//!
//! This module provide the registry resolving confighook references, an
//! evaluator keyed by template type and name registered at program start

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use once_cell::sync::Lazy;

use crate::svc::{
    gctl::{ConfigHook, ConfigHookType},
    hook::{HookRequest, HookResponse},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no {0:?} evaluator registered under name '{1}'")]
    NotFound(ConfigHookType, String),
    #[error("confighook '{0}' failed, {1}")]
    Failed(String, String),
}

// -----------------------------------------------------------------------------
// Registry

/// a confighook evaluator renders the registered template against the
/// request and returns the decoded response
pub type EvaluatorFn =
    Arc<dyn Fn(&HookRequest) -> Result<HookResponse, String> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<(ConfigHookType, String), EvaluatorFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// registers the evaluator of a template, the last registration of a key
/// wins
pub fn register(hook_type: ConfigHookType, name: &str, evaluator: EvaluatorFn) {
    REGISTRY
        .write()
        .expect("confighook registry to not be poisoned")
        .insert((hook_type, name.to_string()), evaluator);
}

/// invokes the referenced evaluator
pub fn invoke(confighook: &ConfigHook, request: &HookRequest) -> Result<HookResponse, Error> {
    let evaluator = {
        let registry = REGISTRY
            .read()
            .expect("confighook registry to not be poisoned");
        registry
            .get(&(confighook.hook_type, confighook.name.to_owned()))
            .cloned()
            .ok_or_else(|| Error::NotFound(confighook.hook_type, confighook.name.to_owned()))?
    };

    evaluator(request).map_err(|err| Error::Failed(confighook.name.to_owned(), err))
}

// -----------------------------------------------------------------------------
// Unit tests
