//! # Kubernetes module
//!
//! This module provide the dynamic kubernetes layer of the engine, a client
//! helper, the discovery cache, informers and untyped object helpers

pub mod client;
pub mod discovery;
pub mod finalizer;
pub mod informer;
pub mod object;
pub mod resource;
