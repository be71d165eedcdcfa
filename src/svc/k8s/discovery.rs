//! # Discovery module
//!
//! This module provide a cache mapping declared resource rules, an
//! apiVersion plus a plural resource name, to the api resource kubernetes
//! exposes for them

use std::collections::HashMap;

use kube::{
    core::ApiResource,
    discovery::{ApiCapabilities, Discovery, Scope},
    Api, Client,
};
use tokio::sync::RwLock;
use tracing::debug;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to run api discovery, {0}")]
    Run(kube::Error),
    #[error("failed to resolve resource '{resource}' in '{api_version}', api discovery returns nothing for it")]
    Unresolved {
        api_version: String,
        resource: String,
    },
}

// -----------------------------------------------------------------------------
// ApiEntry structure

/// a resolved resource rule together with the capabilities the engine cares
/// about
#[derive(Clone, Debug)]
pub struct ApiEntry {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub has_status: bool,
}

impl ApiEntry {
    fn new(resource: ApiResource, capabilities: &ApiCapabilities) -> Self {
        Self {
            namespaced: capabilities.scope == Scope::Namespaced,
            has_status: capabilities
                .subresources
                .iter()
                .any(|(sub, _)| sub.plural == "status"),
            resource,
        }
    }

    /// returns a dynamic api scoped to the given namespace when the resource
    /// is namespaced and a namespace is given, cluster wide otherwise
    pub fn api(&self, client: Client, namespace: Option<&str>) -> Api<kube::core::DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced && !ns.is_empty() => {
                Api::namespaced_with(client, ns, &self.resource)
            }
            _ => Api::all_with(client, &self.resource),
        }
    }
}

// -----------------------------------------------------------------------------
// ApiRegistry structure

/// process wide discovery cache, refreshed on miss under a single writer
pub struct ApiRegistry {
    client: Client,
    cache: RwLock<HashMap<(String, String), ApiEntry>>,
}

impl ApiRegistry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// resolves the given apiVersion and plural resource name to an api
    /// entry, refreshing the cache once on miss
    pub async fn resolve(&self, api_version: &str, resource: &str) -> Result<ApiEntry, Error> {
        let key = (api_version.to_string(), resource.to_string());

        if let Some(entry) = self.cache.read().await.get(&key) {
            return Ok(entry.to_owned());
        }

        self.refresh().await?;

        self.cache
            .read()
            .await
            .get(&key)
            .map(ToOwned::to_owned)
            .ok_or_else(|| Error::Unresolved {
                api_version: api_version.to_string(),
                resource: resource.to_string(),
            })
    }

    /// replays the whole server surface into the cache
    async fn refresh(&self) -> Result<(), Error> {
        let discovery = Discovery::new(self.client.to_owned())
            .run()
            .await
            .map_err(Error::Run)?;

        let mut cache = self.cache.write().await;
        for group in discovery.groups() {
            for version in group.versions() {
                for (resource, capabilities) in group.versioned_resources(version) {
                    debug!(
                        api_version = &resource.api_version,
                        resource = &resource.plural,
                        kind = &resource.kind,
                        "Cache discovered resource",
                    );

                    cache.insert(
                        (resource.api_version.to_owned(), resource.plural.to_owned()),
                        ApiEntry::new(resource, &capabilities),
                    );
                }
            }
        }

        Ok(())
    }
}
