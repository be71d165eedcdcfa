//! # Http module
//!
//! This module provide the http server exposing health and metrics
//! endpoints

pub mod server;
