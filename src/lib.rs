//! Replicated container and object storage.
//!
//! Objects live in per-user containers on local disk with SQLite metadata.
//! A static cluster topology decides which node owns a user's containers;
//! mutations are replicated to the container's peers and a resync worker can
//! repair a node from any peer.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
