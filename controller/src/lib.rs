// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the ORR controller, the orchestration engine that
//! keeps clusters of remote signing nodes provisioned and their zones
//! signed.
//!
//! The moving parts, leaves first: [`node`] owns the per-node RPC pump and
//! the process-wide node pool; [`watcher`] tracks node liveness and fans
//! work out across a cluster's nodes; [`zone_input`] fetches unsigned zone
//! content; [`cluster`] runs the per-cluster reconciliation state machine;
//! [`db`] is the persistent cluster configuration store that seeds
//! everything; [`controller`] ties them together at startup.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod db;
pub mod node;
pub mod testing; // Public for integration tests
pub mod watcher;
pub mod zone_input;

pub use config::Config;
pub use controller::Controller;
