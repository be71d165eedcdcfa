//! # Manager module
//!
//! This module provide the specification lifecycle managers, the config
//! driven variant loading specifications through a loader function and the
//! crd driven variant observing GenericController resources in cluster

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{future::join_all, StreamExt};
use kube::{
    runtime::{
        reflector,
        reflector::ObjectRef,
        watcher,
        watcher::Event,
    },
    Api, Client,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::svc::{
    controller::{queue::RateLimitingQueue, watch},
    gctl::{self, loader, GenericController},
    k8s::discovery::ApiRegistry,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Spec(gctl::Error),
    #[error("failed to start reconciler, {0}")]
    Start(watch::Error),
    #[error("failed to load specifications within {timeout:?}, {source}")]
    LoadTimeout {
        timeout: Duration,
        source: loader::Error,
    },
}

// -----------------------------------------------------------------------------
// SpecLoader type

/// yields the full specification list, the directory loader being the
/// default implementation and embedders free to inject their own
pub type SpecLoader =
    Arc<dyn Fn() -> Result<Vec<GenericController>, loader::Error> + Send + Sync>;

// -----------------------------------------------------------------------------
// Load helper

/// polls the loader on the retry interval until it succeeds, failing
/// fatally once the total timeout fires
pub async fn load_with_retry(
    load: &SpecLoader,
    retry_interval: Duration,
    timeout: Duration,
) -> Result<Vec<GenericController>, Error> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match load() {
            Ok(specs) => return Ok(specs),
            Err(err) => {
                if tokio::time::Instant::now() + retry_interval > deadline {
                    return Err(Error::LoadTimeout {
                        timeout,
                        source: err,
                    });
                }

                warn!(
                    error = err.to_string(),
                    retry = ?retry_interval,
                    "Failed to load specifications, retry",
                );
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ConfigManager structure

/// lifecycle manager of the config driven specification source
pub struct ConfigManager {
    client: Client,
    registry: Arc<ApiRegistry>,
    workers: usize,
    load: SpecLoader,
    retry_interval: Duration,
    load_timeout: Duration,
    controllers: HashMap<String, watch::WatchHandle>,
}

impl ConfigManager {
    pub fn new(
        client: Client,
        registry: Arc<ApiRegistry>,
        workers: usize,
        load: SpecLoader,
        retry_interval: Duration,
        load_timeout: Duration,
    ) -> Self {
        Self {
            client,
            registry,
            workers,
            load,
            retry_interval,
            load_timeout,
            controllers: HashMap::new(),
        }
    }

    /// loads the specifications and starts one reconciler per unique key, a
    /// load timeout or any start error is fatal
    pub async fn start(&mut self) -> Result<(), Error> {
        let specs = load_with_retry(&self.load, self.retry_interval, self.load_timeout).await?;

        gctl::validate_set(&specs).map_err(Error::Spec)?;

        for spec in specs {
            let key = spec.key();
            let handle = watch::start(
                spec,
                self.client.to_owned(),
                Arc::clone(&self.registry),
                self.workers,
            )
            .await
            .map_err(Error::Start)?;

            self.controllers.insert(key, handle);
        }

        info!(
            count = self.controllers.len(),
            "Config driven lifecycle manager started every reconciler",
        );

        Ok(())
    }

    /// stops every reconciler in parallel and waits
    pub async fn stop(&mut self) {
        let handles: Vec<_> = self.controllers.drain().map(|(_, handle)| handle).collect();

        join_all(handles.into_iter().map(watch::WatchHandle::stop)).await;
        info!("Config driven lifecycle manager halted");
    }
}

// -----------------------------------------------------------------------------
// CrdManager structure

/// lifecycle manager observing GenericController custom resources, the
/// driver loop is the single writer of the reconciler map
pub struct CrdManager {
    queue: Arc<RateLimitingQueue>,
    informer: JoinHandle<()>,
    driver: JoinHandle<()>,
}

impl CrdManager {
    /// subscribes to GenericController events and drives reconcilers from
    /// them
    pub async fn start(
        client: Client,
        registry: Arc<ApiRegistry>,
        workers: usize,
    ) -> Result<Self, Error> {
        let api: Api<GenericController> = Api::all(client.to_owned());
        let writer = reflector::store::Writer::<GenericController>::default();
        let reader = writer.as_reader();

        let queue = RateLimitingQueue::new();

        let informer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut stream =
                    reflector::reflector(writer, watcher(api, watcher::Config::default())).boxed();

                while let Some(event) = stream.next().await {
                    match event {
                        Ok(Event::Applied(spec)) | Ok(Event::Deleted(spec)) => {
                            queue.add(&spec.key());
                        }
                        Ok(Event::Restarted(specs)) => {
                            for spec in &specs {
                                queue.add(&spec.key());
                            }
                        }
                        Err(err) => {
                            warn!(
                                error = err.to_string(),
                                "Watch stream of specifications reports an error, watch will restart",
                            );
                        }
                    }
                }
            })
        };

        let driver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut controllers: HashMap<String, watch::WatchHandle> = HashMap::new();

                while let Some(key) = queue.get().await {
                    let outcome = Self::apply(
                        &key,
                        &reader,
                        &mut controllers,
                        client.to_owned(),
                        Arc::clone(&registry),
                        workers,
                    )
                    .await;

                    match outcome {
                        Ok(()) => queue.forget(&key),
                        Err(err) => {
                            // the specification may be corrected in cluster,
                            // keep retrying
                            error!(
                                key = &key,
                                error = err.to_string(),
                                "Failed to apply specification event, requeue with backoff",
                            );
                            queue.add_rate_limited(&key);
                        }
                    }

                    queue.done(&key);
                }

                // shutdown drains the reconcilers in parallel
                let handles: Vec<_> = controllers.drain().map(|(_, handle)| handle).collect();
                join_all(handles.into_iter().map(watch::WatchHandle::stop)).await;
            })
        };

        info!("Crd driven lifecycle manager started");
        Ok(Self {
            queue,
            informer,
            driver,
        })
    }

    /// reconciles the reconciler bound to one specification key
    async fn apply(
        key: &str,
        reader: &reflector::Store<GenericController>,
        controllers: &mut HashMap<String, watch::WatchHandle>,
        client: Client,
        registry: Arc<ApiRegistry>,
        workers: usize,
    ) -> Result<(), Error> {
        let (namespace, name) = key.split_once('/').unwrap_or(("", key));

        let mut obj_ref = ObjectRef::<GenericController>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }

        match reader.get(&obj_ref) {
            None => {
                if let Some(handle) = controllers.remove(key) {
                    info!(key = key, "Specification left the cluster, stop its reconciler");
                    handle.stop().await;
                }

                Ok(())
            }
            Some(spec) => {
                if let Some(active) = controllers.get(key) {
                    if *active.spec == *spec {
                        debug!(key = key, "Specification is unchanged, keep its reconciler");
                        return Ok(());
                    }

                    info!(key = key, "Specification changed, restart its reconciler");
                    if let Some(handle) = controllers.remove(key) {
                        handle.stop().await;
                    }
                }

                let handle =
                    watch::start((*spec).to_owned(), client, registry, workers)
                        .await
                        .map_err(Error::Start)?;
                controllers.insert(key.to_string(), handle);

                Ok(())
            }
        }
    }

    /// closes the event source, drains the queue and waits for every
    /// reconciler to stop
    pub async fn stop(self) {
        self.informer.abort();
        self.queue.shut_down();

        let _ = self.driver.await;
        info!("Crd driven lifecycle manager halted");
    }
}

// -----------------------------------------------------------------------------
// Unit tests
