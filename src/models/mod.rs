//! Core data models for the container storage service.
//!
//! These entities describe containers, the objects inside them, the audit
//! trail, resource locks, cluster nodes and the messages exchanged between
//! nodes. They serialize naturally as JSON via `serde`.

pub mod audit;
pub mod container;
pub mod lock;
pub mod message;
pub mod node;
pub mod object;
