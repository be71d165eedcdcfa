//! # Inline module
//!
//! This module provide the process wide registry of inline hook functions,
//! written once at program start and looked up by name afterwards

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use once_cell::sync::Lazy;

use crate::svc::hook::{HookRequest, HookResponse};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no inline hook registered under name '{0}'")]
    NotFound(String),
    #[error("inline hook '{0}' failed, {1}")]
    Failed(String, String),
}

// -----------------------------------------------------------------------------
// Registry

/// an inline hook maps the observed state to the desired state
/// synchronously
pub type InlineFn =
    Arc<dyn Fn(&HookRequest) -> Result<HookResponse, String> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, InlineFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// registers the function under the given name, the last registration of a
/// name wins
pub fn register(name: &str, hook: InlineFn) {
    REGISTRY
        .write()
        .expect("inline hook registry to not be poisoned")
        .insert(name.to_string(), hook);
}

/// invokes the named function
pub fn invoke(name: &str, request: &HookRequest) -> Result<HookResponse, Error> {
    let hook = {
        let registry = REGISTRY
            .read()
            .expect("inline hook registry to not be poisoned");
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))?
    };

    hook(request).map_err(|err| Error::Failed(name.to_string(), err))
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::hook::fixtures;

    #[test]
    fn registered_hooks_are_invocable_by_name() {
        register(
            "noop",
            Arc::new(|_req| Ok(HookResponse::default())),
        );

        let response = invoke("noop", &fixtures::request()).unwrap();
        assert!(response.attachments.is_empty());
    }

    #[test]
    fn unknown_names_are_reported() {
        assert!(matches!(
            invoke("no-such-hook", &fixtures::request()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn hook_failures_carry_the_name() {
        register(
            "failing",
            Arc::new(|_req| Err("boom".to_string())),
        );

        match invoke("failing", &fixtures::request()) {
            Err(Error::Failed(name, message)) => {
                assert_eq!(name, "failing");
                assert_eq!(message, "boom");
            }
            other => panic!("expected a failed invocation, got {:?}", other.map(|_| ())),
        }
    }
}
