//! # Services module
//!
//! This module provide the engine services, the specification api, the
//! selector evaluator, the reconcile engine and helpers around them

pub mod cfg;
pub mod controller;
pub mod gctl;
pub mod hook;
pub mod http;
pub mod k8s;
pub mod select;
pub mod telemetry;
