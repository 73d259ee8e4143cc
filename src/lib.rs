//! Proxydeck - configuration control plane for an external reverse proxy
//!
//! This library keeps a proxy's on-disk configuration in step with a store:
//! - Persists hosts, groups, access lists and settings in SQLite
//! - Normalizes loosely-typed location and stream records on read
//! - Compiles each entity into a declarative YAML document
//! - Rebuilds the whole configuration directory after every mutation
//! - Signals the proxy to reload, via its supervisor or its pid file

pub mod admin;
pub mod compiler;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod reload;
pub mod sync;
