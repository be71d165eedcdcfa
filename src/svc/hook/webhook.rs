//! # Webhook module
//!
//! This module provide the http transport of hooks, a json POST with a per
//! hook timeout

use std::time::Duration;

use hyper::{header, Body, Client, Method, Request, StatusCode};
use tracing::debug;

use crate::svc::{
    gctl::Webhook,
    hook::{HookRequest, HookResponse},
};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVICE_PORT: i32 = 80;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize hook request, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to build http request, {0}")]
    Build(hyper::http::Error),
    #[error("failed to execute http request, {0}")]
    Request(hyper::Error),
    #[error("failed to read http response body, {0}")]
    Body(hyper::Error),
    #[error("failed to deserialize hook response, {0}")]
    Deserialize(serde_json::Error),
    #[error("webhook answered with status '{0}'")]
    Status(StatusCode),
    #[error("webhook did not answer within {0:?}")]
    Timeout(Duration),
    #[error("webhook declares neither an url nor a service reference")]
    MissingTarget,
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns the url the webhook resolves to, an explicit url taking
/// precedence over a service reference
pub fn resolve_url(webhook: &Webhook) -> Option<String> {
    if let Some(url) = &webhook.url {
        return Some(match &webhook.path {
            Some(path) => format!("{}{}", url.trim_end_matches('/'), path),
            None => url.to_owned(),
        });
    }

    webhook.service.as_ref().map(|service| {
        let path = service
            .path
            .as_deref()
            .or(webhook.path.as_deref())
            .unwrap_or("/");

        format!(
            "http://{}.{}:{}{}",
            service.name,
            service.namespace,
            service.port.unwrap_or(DEFAULT_SERVICE_PORT),
            path,
        )
    })
}

/// returns the timeout granted to one invocation
pub fn timeout_of(webhook: &Webhook) -> Duration {
    webhook
        .timeout_seconds
        .map(|seconds| Duration::from_secs(u64::from(seconds)))
        .unwrap_or(DEFAULT_TIMEOUT)
}

// -----------------------------------------------------------------------------
// Call function

/// POST the request as json and decode the json response, any non 2xx
/// answer or transport failure failing the hook
pub async fn call(webhook: &Webhook, request: &HookRequest) -> Result<HookResponse, Error> {
    let url = resolve_url(webhook).ok_or(Error::MissingTarget)?;
    let timeout = timeout_of(webhook);
    let body = serde_json::to_vec(request).map_err(Error::Serialize)?;

    debug!(url = &url, timeout = ?timeout, "Invoke webhook");

    let http_request = Request::builder()
        .method(Method::POST)
        .uri(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(Error::Build)?;

    let response = tokio::time::timeout(timeout, Client::new().request(http_request))
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(Error::Request)?;

    if !response.status().is_success() {
        return Err(Error::Status(response.status()));
    }

    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(Error::Body)?;

    serde_json::from_slice(&bytes).map_err(Error::Deserialize)
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use hyper::{
        service::{make_service_fn, service_fn},
        Response, Server,
    };

    use super::*;
    use crate::svc::{gctl::ServiceReference, hook::fixtures};

    #[test]
    fn url_takes_precedence_over_service() {
        let webhook = Webhook {
            url: Some("http://hooks.metac:8080".to_string()),
            path: Some("/sync".to_string()),
            service: Some(ServiceReference {
                name: "hooks".to_string(),
                namespace: "metac".to_string(),
                port: Some(9090),
                path: None,
            }),
            ..Default::default()
        };

        assert_eq!(
            resolve_url(&webhook).as_deref(),
            Some("http://hooks.metac:8080/sync")
        );
    }

    #[test]
    fn service_reference_resolves_to_cluster_dns() {
        let webhook = Webhook {
            service: Some(ServiceReference {
                name: "hooks".to_string(),
                namespace: "metac".to_string(),
                port: None,
                path: Some("/finalize".to_string()),
            }),
            ..Default::default()
        };

        assert_eq!(
            resolve_url(&webhook).as_deref(),
            Some("http://hooks.metac:80/finalize")
        );
        assert!(resolve_url(&Webhook::default()).is_none());
    }

    #[test]
    fn timeout_defaults_to_ten_seconds() {
        assert_eq!(timeout_of(&Webhook::default()), DEFAULT_TIMEOUT);
        assert_eq!(
            timeout_of(&Webhook {
                timeout_seconds: Some(3),
                ..Default::default()
            }),
            Duration::from_secs(3)
        );
    }

    async fn serve(answer: &'static str, status: StatusCode) -> String {
        let make_service = make_service_fn(move |_| async move {
            Ok::<_, Infallible>(service_fn(move |_req| async move {
                let mut res = Response::new(Body::from(answer));
                *res.status_mut() = status;
                Ok::<_, Infallible>(res)
            }))
        });

        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server);

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn call_round_trips_json() {
        let url = serve(r#"{"resyncAfterSeconds": 2.0}"#, StatusCode::OK).await;
        let webhook = Webhook {
            url: Some(url),
            ..Default::default()
        };

        let response = call(&webhook, &fixtures::request()).await.unwrap();
        assert_eq!(response.resync_after_seconds, 2.0);
    }

    #[tokio::test]
    async fn non_success_status_fails_the_hook() {
        let url = serve("boom", StatusCode::INTERNAL_SERVER_ERROR).await;
        let webhook = Webhook {
            url: Some(url),
            ..Default::default()
        };

        assert!(matches!(
            call(&webhook, &fixtures::request()).await,
            Err(Error::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
    }
}
