//! # Telemetry module
//!
//! This module expose telemetry measurements mainly metrics through
//! structures, enums and helpers

use std::{collections::BTreeMap, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::info;

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "metac_server_request",
            "number of request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'metac_server_request' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "metac_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["key"]
    )
    .expect("metrics 'metac_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "metac_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["key"]
    )
    .expect("metrics 'metac_reconciliation_failed' to not be already registered")
});

// -----------------------------------------------------------------------------
// Recorder helpers

/// counts one reconciliation of the given specification
pub fn record_sync(key: &str, succeeded: bool) {
    #[cfg(feature = "metrics")]
    {
        if succeeded {
            RECONCILIATION_SUCCESS.with_label_values(&[key]).inc();
        } else {
            RECONCILIATION_FAILED.with_label_values(&[key]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = (key, succeeded);
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    // -------------------------------------------------------------------------
    // Basic routing
    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(&req).await,
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler(&req).await.map_err(Error::Metrics),
        _ => not_found(&req).await,
    };

    let duration = Instant::now().duration_since(begin).as_micros();

    match result {
        Ok(res) => {
            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{}us", duration),
                "Receive request",
            );

            #[cfg(feature = "metrics")]
            SERVER_REQUEST
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            Ok(res)
        }
        Err(err) => {
            // -----------------------------------------------------------------
            // Format error in a convenient way

            let mut map = BTreeMap::new();
            map.insert("error".to_string(), err.to_string());

            let mut res = Response::default();

            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );

            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() =
                Body::from(serde_json::to_string_pretty(&map).map_err(Error::Serialize)?);

            info!(
                method = req.method().as_str(),
                path = req.uri().path(),
                status = res.status().as_u16(),
                duration = format!("{}us", duration),
                "Receive request",
            );

            #[cfg(feature = "metrics")]
            SERVER_REQUEST
                .with_label_values(&[
                    req.method().as_str(),
                    req.uri().path(),
                    &res.status().as_u16().to_string(),
                ])
                .inc();

            Ok(res)
        }
    }
}

pub async fn healthz(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;

    Ok(res)
}

pub async fn not_found(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;

    Ok(res)
}
