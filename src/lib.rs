//! gatenode - A gate/node cluster runtime for real-time services
//!
//! This crate provides the core of a two-tier backend:
//! - Gates terminate client connections and track sessions per connection and user
//! - Nodes dispatch client messages to route handlers on one sequential loop
//! - Stateful routes pinned to the node holding a user's affinity
//! - Discovery-driven routing tables swapped atomically
//! - Name-based service invocation between nodes
//! - Length-delimited TCP for clients and MessagePack RPC between tiers

pub mod cluster;
pub mod config;
pub mod container;
pub mod locate;
pub mod network;
pub mod packet;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;
#[cfg(test)]
pub mod testutil;
pub mod transport;
