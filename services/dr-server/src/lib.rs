//! dynroute authority service library.
//!
//! This crate primarily ships a `dr-server` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod db;
pub mod networks;
pub mod notifier;
pub mod scheduler;
pub mod state;
pub mod store;
