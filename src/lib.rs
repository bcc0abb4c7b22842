//! Monitoring for Duplicati backup servers.
//!
//! Each configured job gets a coordinator that polls the server, follows
//! running backups closely and publishes status snapshots for the host.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod core;
pub mod http;
pub mod logging;
pub mod registry;
pub mod service;
pub mod web;
