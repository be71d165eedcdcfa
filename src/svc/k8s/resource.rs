//! # Resource module
//!
//! This module provide create, update and delete helpers over dynamic
//! kubernetes resources

use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Api,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::svc::k8s::object;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns difference between the two given objects serialized as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given resource using the given patch, a
/// no-operation patch skips the request and hands the object back
pub async fn patch(
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
    patch: json_patch::Patch,
) -> Result<DynamicObject, kube::Error> {
    let name = object::name(obj);

    if patch.0.is_empty() {
        debug!(
            name = &name,
            namespace = object::namespace(obj),
            "Skip patch request on resource, no operation to apply",
        );
        return Ok(obj.to_owned());
    }

    debug!(
        name = &name,
        namespace = object::namespace(obj),
        operations = patch.0.len(),
        "Execute patch request on resource",
    );
    api.patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
}

/// replace the nested status of the resource through the status subresource,
/// which bumps the resource version ahead of any metadata update
pub async fn patch_status(
    api: &Api<DynamicObject>,
    name: &str,
    status: &Value,
) -> Result<DynamicObject, kube::Error> {
    debug!(name = name, "Execute patch request on resource's status");
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
}

/// create the given resource
pub async fn create(
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
) -> Result<DynamicObject, kube::Error> {
    debug!(
        name = object::name(obj),
        namespace = object::namespace(obj),
        kind = object::kind(obj),
        "Execute create request on resource",
    );
    api.create(&PostParams::default(), obj).await
}

/// delete the given resource, an already gone resource is not an error
pub async fn delete(api: &Api<DynamicObject>, name: &str) -> Result<(), kube::Error> {
    debug!(name = name, "Execute delete request on resource");
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}
