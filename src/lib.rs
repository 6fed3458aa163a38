//! Mockgate - control panel for a fleet of mock HTTP servers
//!
//! This library provides the control layer that:
//! - Starts and stops CLI-driven mock servers, one per port
//! - Keeps an on-disk catalog of mock definition documents
//! - Tracks running instances in a concurrency-safe registry
//! - Regenerates the reverse-proxy routing documents after every change
//! - Serves a small authenticated HTTP API over all of the above

pub mod alias;
pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod port;
pub mod registry;
pub mod routing;
pub mod store;
