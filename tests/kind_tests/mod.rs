//! Integration tests for mongo-operator
//!
//! Organized by the story they tell:
//!
//! - `crd_operations`: creating, reading and deleting `MongoDB` resources
//!   through the Kubernetes API
//! - `replica_set_lifecycle`: the controller taking a replica set from
//!   `Pending` to `Ready`, scaling it and cleaning up on deletion

mod crd_operations;
mod helpers;
mod replica_set_lifecycle;
