//! mongo-operator - CRD-driven Kubernetes operator for MongoDB
//!
//! A `MongoDB` custom resource describes either a single replica set or a
//! sharded cluster (config servers, shards, mongos routers). The operator
//! turns it into StatefulSets, a Deployment, Services, a ConfigMap and a
//! keyfile Secret, then drives replica set initiation, shard registration
//! and scaling until the live topology matches the spec.
//!
//! # Modules
//!
//! - [`crd`] - the `MongoDB` custom resource and its status
//! - [`naming`] - object names and label sets
//! - [`resources`] - pure builders for every generated object
//! - [`admin`] - replica set and shard commands against live members
//! - [`controller`] - reconciliation state machine
//! - [`adapters`] - TLS, monitoring, backup and restore
//! - [`config`] - command line and environment configuration
//! - [`error`] - error types for the operator

#![warn(missing_docs)]

pub mod adapters;
pub mod admin;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod naming;
pub mod resources;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
