//! # Watch module
//!
//! This module provide the per specification reconciler, one watched kind
//! plus its attachment kinds driven through a rate limited queue and a fixed
//! worker pool

use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use kube::{core::DynamicObject, Client};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::svc::{
    controller::{
        attachment::{self, AttachmentRegistry, Planner, ReconcilePlan},
        queue::RateLimitingQueue,
        strategy::UpdateStrategies,
    },
    gctl::{self, GenericController},
    hook::{self, HookRequest, HookResponse},
    k8s::{
        discovery::{self, ApiEntry, ApiRegistry},
        finalizer::{self, Finalizer},
        informer::{self, Informer},
        object, resource,
    },
    select::{self, Selector},
    telemetry,
};

// -----------------------------------------------------------------------------
// Constants

/// how long an informer may take to serve its initial list before the
/// reconciler refuses to start
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

// -----------------------------------------------------------------------------
// Error enumerations

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Spec(gctl::Error),
    #[error("{0}")]
    Discovery(discovery::Error),
    #[error("{0}")]
    CacheNotSynced(informer::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Key(object::Error),
    #[error("{0}")]
    Selector(select::Error),
    #[error("specification declares no sync hook")]
    HookMissing,
    #[error("{0}")]
    Hook(hook::Error),
    #[error("failed to compute diff of watched object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to update watched object, {0}")]
    Update(kube::Error),
    #[error("failed to {operation} attachment '{name}', {source}")]
    Apply {
        operation: &'static str,
        name: String,
        source: kube::Error,
    },
    #[error("hook desires attachment of undeclared kind '{0}' in '{1}'")]
    UndeclaredAttachment(String, String),
}

impl From<object::Error> for SyncError {
    fn from(err: object::Error) -> Self {
        Self::Key(err)
    }
}

impl From<select::Error> for SyncError {
    fn from(err: select::Error) -> Self {
        Self::Selector(err)
    }
}

impl From<hook::Error> for SyncError {
    fn from(err: hook::Error) -> Self {
        Self::Hook(err)
    }
}

// -----------------------------------------------------------------------------
// AttachmentKind structure

/// one declared attachment kind bound to its informer and compiled selector
struct AttachmentKind {
    entry: ApiEntry,
    selector: Selector,
    informer: Informer,
}

// -----------------------------------------------------------------------------
// WatchController structure

/// the reconciler of one specification
pub struct WatchController {
    spec: Arc<GenericController>,
    client: Client,
    queue: Arc<RateLimitingQueue>,
    claim_key: String,
    watch_entry: ApiEntry,
    watch_informer: Informer,
    watch_selector: Selector,
    attachments: Vec<AttachmentKind>,
    strategies: UpdateStrategies,
    finalizer: Finalizer,
}

/// the running state of one reconciler, stopping it shuts the queue down,
/// removes the informers and waits for in-flight syncs
pub struct WatchHandle {
    pub spec: Arc<GenericController>,
    controller: Arc<WatchController>,
    workers: Vec<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn key(&self) -> String {
        self.spec.key()
    }

    pub async fn stop(self) {
        info!(key = self.spec.key(), "Stop reconciler of specification");

        self.controller.queue.shut_down();
        if let Some(resync) = self.resync {
            resync.abort();
        }

        self.controller.watch_informer.stop();
        for attachment in &self.controller.attachments {
            attachment.informer.stop();
        }

        for worker in self.workers {
            let _ = worker.await;
        }

        info!(key = self.spec.key(), "Reconciler of specification halted");
    }
}

// -----------------------------------------------------------------------------
// Start function

/// builds and starts the reconciler of one specification, refusing to start
/// when a declared resource does not resolve or a cache never syncs
pub async fn start(
    spec: GenericController,
    client: Client,
    registry: Arc<ApiRegistry>,
    workers: usize,
) -> Result<WatchHandle, Error> {
    spec.validate().map_err(Error::Spec)?;

    let key = spec.key();
    let spec = Arc::new(spec);

    let watch_entry = registry
        .resolve(
            &spec.spec.watch.rule.api_version,
            &spec.spec.watch.rule.resource,
        )
        .await
        .map_err(Error::Discovery)?;

    let queue = RateLimitingQueue::new();

    // only watch events enqueue, attachment informers refresh their cache so
    // the next watch driven sync sees current data
    let handler: informer::EventHandler = {
        let queue = Arc::clone(&queue);
        Arc::new(move |obj: &DynamicObject| {
            queue.add(&object::queue_key(obj));
        })
    };

    let watch_informer = Informer::start(client.to_owned(), &watch_entry, Some(handler));

    let mut strategies = UpdateStrategies::new();
    let mut attachments = Vec::with_capacity(spec.spec.attachments.len());
    for declared in &spec.spec.attachments {
        let entry = registry
            .resolve(
                &declared.resource.rule.api_version,
                &declared.resource.rule.resource,
            )
            .await
            .map_err(Error::Discovery)?;

        if let Some(strategy) = &declared.update_strategy {
            strategies.insert(&entry.resource.group, &entry.resource.kind, strategy);
        }

        attachments.push(AttachmentKind {
            selector: Selector::from(&declared.resource),
            informer: Informer::start(client.to_owned(), &entry, None),
            entry,
        });
    }

    let controller = Arc::new(WatchController {
        claim_key: spec.claim_annotation(),
        finalizer: Finalizer::new(spec.finalizer_name(), spec.finalize_hook().is_some()),
        watch_selector: Selector::from(&spec.spec.watch),
        spec: Arc::clone(&spec),
        client,
        queue,
        watch_entry,
        watch_informer,
        attachments,
        strategies,
    });

    controller
        .watch_informer
        .wait_until_ready(CACHE_SYNC_TIMEOUT)
        .await
        .map_err(Error::CacheNotSynced)?;
    for attachment in &controller.attachments {
        attachment
            .informer
            .wait_until_ready(CACHE_SYNC_TIMEOUT)
            .await
            .map_err(Error::CacheNotSynced)?;
    }

    let workers = (0..workers.max(1))
        .map(|index| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { worker(controller, index).await })
        })
        .collect();

    let resync = spec.resync_period().map(|period| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for obj in controller.watch_informer.list() {
                    controller.queue.add(&object::queue_key(&obj));
                }
            }
        })
    });

    info!(
        key = key,
        watch = &controller.watch_entry.resource.kind,
        attachments = controller.attachments.len(),
        "Start reconciler of specification",
    );

    Ok(WatchHandle {
        spec,
        controller,
        workers,
        resync,
    })
}

// -----------------------------------------------------------------------------
// Worker function

/// drains the queue, a panic in one sync is intercepted so the worker
/// resumes with the next key
async fn worker(controller: Arc<WatchController>, index: usize) {
    while let Some(key) = controller.queue.get().await {
        let outcome = std::panic::AssertUnwindSafe(controller.sync_once(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                controller.queue.forget(&key);
                telemetry::record_sync(&controller.spec.key(), true);
            }
            Ok(Err(err)) => {
                warn!(
                    key = &key,
                    worker = index,
                    error = err.to_string(),
                    "Failed to sync watched object, requeue with backoff",
                );
                controller.queue.add_rate_limited(&key);
                telemetry::record_sync(&controller.spec.key(), false);
            }
            Err(_) => {
                error!(
                    key = &key,
                    worker = index,
                    "Panic while syncing watched object, requeue with backoff",
                );
                controller.queue.add_rate_limited(&key);
                telemetry::record_sync(&controller.spec.key(), false);
            }
        }

        controller.queue.done(&key);
    }
}

// -----------------------------------------------------------------------------
// WatchController implementation

impl WatchController {
    /// one pass of the sync state machine for one watched object key
    async fn sync_once(&self, key: &str) -> Result<(), SyncError> {
        let (_, _, namespace, name) = object::parse_queue_key(key)?;

        let cached = match self.watch_informer.get(&namespace, &name) {
            Some(cached) => cached,
            None => {
                debug!(key = key, "Watched object left the cache, forget it");
                return Ok(());
            }
        };

        // caches are shared, syncs work on a deep copy
        let mut watch = (*cached).to_owned();
        let selected = self.watch_selector.matches(&watch, None)?;
        let claimed = finalizer::contains(&watch, &self.finalizer.name);

        if !selected && !claimed {
            return Ok(());
        }

        let api = self.watch_entry.api(self.client.to_owned(), Some(&namespace));

        if selected && !object::deleted(&watch) {
            let before = watch.to_owned();
            if self.finalizer.ensure(&mut watch) {
                let patch = resource::diff(&before, &watch).map_err(SyncError::Diff)?;
                watch = resource::patch(&api, &before, patch)
                    .await
                    .map_err(SyncError::Update)?;
            }
        }

        // an alive object that stopped matching the selector still routes to
        // the finalize hook, that path is what cleans up after a disabled
        // specification
        let finalizing = self.finalizer.should_finalize(&watch, selected);

        let hook = if finalizing {
            self.spec.finalize_hook()
        } else {
            self.spec.sync_hook()
        };
        let hook = match hook {
            Some(hook) => hook,
            None => return Err(SyncError::HookMissing),
        };

        let observed = self.observed_attachments(&watch)?;

        let request = HookRequest {
            controller: (*self.spec).to_owned(),
            watch: watch.to_owned(),
            attachments: observed.to_owned(),
            finalizing,
        };
        let response = hook::invoke(hook, &request).await?;

        self.update_watch(&api, &watch, &response, finalizing, &name)
            .await?;

        let alive = !object::deleted(&watch);
        if !response.skip_reconcile && (alive || self.finalizer.enabled) {
            let desired = self.desired_attachments(&response, &namespace)?;
            let plan = Planner {
                claim_key: &self.claim_key,
                read_only: self.spec.read_only(),
                update_any: self.spec.update_any(),
                delete_any: self.spec.delete_any(),
                strategies: &self.strategies,
            }
            .plan(&desired, &observed);

            self.execute(plan).await?;
        }

        if response.resync_after_seconds > 0.0 && response.resync_after_seconds.is_finite() {
            let delay = Duration::from_secs_f64(response.resync_after_seconds);
            debug!(key = key, delay = ?delay, "Schedule resync of watched object");
            self.queue.add_after(key, delay);
        }

        Ok(())
    }

    /// lists the cached attachments of every declared kind and keeps the
    /// ones selected against the watched object
    fn observed_attachments(&self, watch: &DynamicObject) -> Result<AttachmentRegistry, SyncError> {
        let mut observed = AttachmentRegistry::new();

        for kind in &self.attachments {
            for obj in kind.informer.list() {
                if kind.selector.matches(&obj, Some(watch))? {
                    observed.insert((*obj).to_owned());
                }
            }
        }

        Ok(observed)
    }

    /// normalizes the hook's desired attachments, inheriting the watch
    /// namespace and stamping the claim annotation
    fn desired_attachments(
        &self,
        response: &HookResponse,
        watch_namespace: &str,
    ) -> Result<AttachmentRegistry, SyncError> {
        let mut desired = AttachmentRegistry::new();

        for obj in &response.attachments {
            let api_version = object::api_version(obj);
            let kind = object::kind(obj);

            let declared = self
                .attachments
                .iter()
                .find(|a| {
                    a.entry.resource.api_version == api_version && a.entry.resource.kind == kind
                })
                .ok_or_else(|| SyncError::UndeclaredAttachment(kind.to_owned(), api_version.to_owned()))?;

            let mut obj = obj.to_owned();
            if declared.entry.namespaced && object::namespace(&obj).is_empty() {
                obj.metadata.namespace = Some(watch_namespace.to_string());
            }
            attachment::claim(&mut obj, &self.claim_key);

            desired.insert(obj);
        }

        Ok(desired)
    }

    /// writes labels, annotations, status and the finalizer back to the
    /// watched object, only when something actually changed
    async fn update_watch(
        &self,
        api: &kube::Api<DynamicObject>,
        watch: &DynamicObject,
        response: &HookResponse,
        finalizing: bool,
        name: &str,
    ) -> Result<(), SyncError> {
        let (mut updated, meta_changed, mut status_changed) =
            apply_response(watch, response, &self.finalizer, finalizing);

        if status_changed && self.watch_entry.has_status {
            let status = object::status(&updated).cloned().unwrap_or_default();
            resource::patch_status(api, name, &status)
                .await
                .map_err(SyncError::Update)?;

            // the subresource write already carried the status, keep it out
            // of the metadata patch
            match object::status(watch) {
                Some(previous) => {
                    let previous = previous.to_owned();
                    object::set_status(&mut updated, previous);
                }
                None => {
                    if let serde_json::Value::Object(data) = &mut updated.data {
                        data.remove("status");
                    }
                }
            }
            status_changed = false;
        }

        if meta_changed || status_changed {
            let patch = resource::diff(watch, &updated).map_err(SyncError::Diff)?;
            resource::patch(api, watch, patch)
                .await
                .map_err(SyncError::Update)?;
        }

        Ok(())
    }

    /// applies one reconcile plan against the cluster
    async fn execute(&self, plan: ReconcilePlan) -> Result<(), SyncError> {
        for create in &plan.creates {
            let api = self.attachment_api(create);
            resource::create(&api, create)
                .await
                .map_err(|err| SyncError::Apply {
                    operation: "create",
                    name: object::name(create),
                    source: err,
                })?;
        }

        for update in &plan.updates {
            let api = self.attachment_api(&update.observed);
            let patch =
                resource::diff(&update.observed, &update.merged).map_err(SyncError::Diff)?;
            resource::patch(&api, &update.observed, patch)
                .await
                .map_err(|err| SyncError::Apply {
                    operation: "update",
                    name: object::name(&update.observed),
                    source: err,
                })?;
        }

        for delete in &plan.deletes {
            let api = self.attachment_api(delete);
            resource::delete(&api, &object::name(delete))
                .await
                .map_err(|err| SyncError::Apply {
                    operation: "delete",
                    name: object::name(delete),
                    source: err,
                })?;
        }

        Ok(())
    }

    /// returns the api of the declared kind the object belongs to
    fn attachment_api(&self, obj: &DynamicObject) -> kube::Api<DynamicObject> {
        let api_version = object::api_version(obj);
        let kind = object::kind(obj);
        let namespace = object::namespace(obj);

        match self.attachments.iter().find(|a| {
            a.entry.resource.api_version == api_version && a.entry.resource.kind == kind
        }) {
            Some(declared) => declared
                .entry
                .api(self.client.to_owned(), Some(&namespace)),
            // the plan only ever holds declared kinds, fall back to the
            // watch scoping rather than panic
            None => self
                .watch_entry
                .api(self.client.to_owned(), Some(&namespace)),
        }
    }
}

// -----------------------------------------------------------------------------
// Response application

/// applies the hook response onto a copy of the watched object, handing back
/// the updated object plus whether its metadata and status changed
fn apply_response(
    watch: &DynamicObject,
    response: &HookResponse,
    finalizer: &Finalizer,
    finalizing: bool,
) -> (DynamicObject, bool, bool) {
    let mut updated = watch.to_owned();

    let mut meta_changed =
        object::apply_map_directives(&mut updated.metadata.labels, &response.labels);
    meta_changed |=
        object::apply_map_directives(&mut updated.metadata.annotations, &response.annotations);

    let mut status_changed = false;
    if let Some(status) = &response.status {
        status_changed = object::set_status(&mut updated, status.to_owned());
    }

    if finalizing && response.finalized {
        meta_changed |= finalizer.remove_from(&mut updated);
    }

    (updated, meta_changed, status_changed)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::core::{ApiResource, GroupVersionKind};

    use super::*;

    fn watch_obj() -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut obj = DynamicObject::new("w1", &ar).within("ns1");
        obj.metadata.labels = Some(BTreeMap::from([(
            "app".to_string(),
            "metac".to_string(),
        )]));
        obj
    }

    fn protect() -> Finalizer {
        Finalizer::new("protect.gctl.metac.openebs.io/ns1-w1".to_string(), true)
    }

    #[test]
    fn response_directives_mutate_labels_and_status() {
        let watch = watch_obj();
        let response = HookResponse {
            labels: BTreeMap::from([
                ("app".to_string(), None),
                ("phase".to_string(), Some("done".to_string())),
            ]),
            status: Some(serde_json::json!({"observed": true})),
            ..Default::default()
        };

        let (updated, meta_changed, status_changed) =
            apply_response(&watch, &response, &protect(), false);

        assert!(meta_changed);
        assert!(status_changed);
        assert_eq!(
            updated.metadata.labels,
            Some(BTreeMap::from([(
                "phase".to_string(),
                "done".to_string()
            )]))
        );
        assert_eq!(
            object::status(&updated),
            Some(&serde_json::json!({"observed": true}))
        );
    }

    #[test]
    fn unchanged_response_reports_no_write() {
        let watch = watch_obj();
        let response = HookResponse {
            labels: BTreeMap::from([("app".to_string(), Some("metac".to_string()))]),
            status: None,
            ..Default::default()
        };

        let (_, meta_changed, status_changed) =
            apply_response(&watch, &response, &protect(), false);

        assert!(!meta_changed);
        assert!(!status_changed);
    }

    #[test]
    fn finalized_response_removes_the_finalizer_exactly_once() {
        let finalizer = protect();
        let mut watch = watch_obj();
        finalizer.ensure(&mut watch);

        let response = HookResponse {
            finalized: true,
            ..Default::default()
        };

        let (updated, meta_changed, _) = apply_response(&watch, &response, &finalizer, true);
        assert!(meta_changed);
        assert!(updated.metadata.finalizers.is_none());

        // a later finalize pass finds nothing left to remove
        let (_, meta_changed, _) = apply_response(&updated, &response, &finalizer, true);
        assert!(!meta_changed);
    }

    #[test]
    fn finalizer_survives_until_the_hook_authorizes_removal() {
        let finalizer = protect();
        let mut watch = watch_obj();
        finalizer.ensure(&mut watch);

        let response = HookResponse::default();
        let (updated, meta_changed, _) = apply_response(&watch, &response, &finalizer, true);

        assert!(!meta_changed);
        assert!(finalizer::contains(&updated, &finalizer.name));
    }
}
