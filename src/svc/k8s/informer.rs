//! # Informer module
//!
//! This module provide a shared informer over any resource kind, a reflector
//! backed cache together with a change stream and a cache sync signal

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    core::{ApiResource, DynamicObject},
    runtime::{
        reflector,
        reflector::{store::Writer, ObjectRef, Store},
        watcher,
        watcher::Event,
    },
    Client,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

use crate::svc::k8s::discovery::ApiEntry;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to sync cache of resource '{0}' within {1:?}")]
    NotSynced(String, Duration),
}

// -----------------------------------------------------------------------------
// EventHandler type

/// informer handlers only produce work items, every mutation happens in the
/// reconciler workers
pub type EventHandler = Arc<dyn Fn(&DynamicObject) + Send + Sync>;

// -----------------------------------------------------------------------------
// Informer structure

pub struct Informer {
    resource: ApiResource,
    namespaced: bool,
    reader: Store<DynamicObject>,
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Informer {
    /// starts watching the given resource cluster wide, feeding the cache
    /// and forwarding every change to the optional handler
    pub fn start(client: Client, entry: &ApiEntry, handler: Option<EventHandler>) -> Self {
        let api = entry.api(client, None);
        let writer = Writer::new(entry.resource.to_owned());
        let reader = writer.as_reader();
        let (tx, rx) = watch::channel(false);
        let plural = entry.resource.plural.to_owned();

        let task = tokio::spawn(async move {
            let mut stream = reflector(writer, watcher(api, watcher::Config::default())).boxed();

            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Applied(obj)) | Ok(Event::Deleted(obj)) => {
                        if let Some(handler) = &handler {
                            handler(&obj);
                        }
                    }
                    Ok(Event::Restarted(objs)) => {
                        // the initial list is in, the cache is synced
                        let _ = tx.send(true);
                        if let Some(handler) = &handler {
                            for obj in &objs {
                                handler(obj);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            resource = &plural,
                            error = err.to_string(),
                            "Watch stream of resource reports an error, watch will restart",
                        );
                    }
                }
            }
        });

        Self {
            resource: entry.resource.to_owned(),
            namespaced: entry.namespaced,
            reader,
            ready: rx,
            task,
        }
    }

    /// waits for the initial cache sync, failing once the timeout fires
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), Error> {
        let mut ready = self.ready.to_owned();

        let synced = tokio::time::timeout(timeout, async move {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await;

        match synced {
            Ok(true) => Ok(()),
            _ => Err(Error::NotSynced(self.resource.plural.to_owned(), timeout)),
        }
    }

    /// returns every cached object of the watched kind
    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.reader.state()
    }

    /// returns the cached object with the given identity
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<DynamicObject>> {
        let mut obj_ref = ObjectRef::<DynamicObject>::new_with(name, self.resource.to_owned());
        if self.namespaced && !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }

        self.reader.get(&obj_ref)
    }

    /// removes the watch, the cache stays readable but goes stale
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Informer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
