// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller bootstrap: open the configuration store and run one cluster
//! manager per configured cluster.

use crate::cluster::{ClusterHandle, ClusterManager};
use crate::config::Config;
use crate::db::{ConfigStore, StoreError};
use crate::node::{AgentConnector, HttpConnector, NodePool};
use slog::{error, info, o, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Controller {
    log: Logger,
    store: Arc<ConfigStore>,
    clusters: BTreeMap<Uuid, ClusterHandle>,
}

impl Controller {
    /// Open the store, load every cluster descriptor, and spawn the
    /// managers.  A descriptor that fails validation takes down only its
    /// own cluster.  Must run inside a tokio runtime.
    pub fn start(config: &Config, log: Logger) -> Result<Controller, StartError> {
        let store = Arc::new(ConfigStore::open(
            log.new(o!("component" => "config-store")),
            &config.database_path,
        )?);
        let connector: Arc<dyn AgentConnector> = Arc::new(HttpConnector::new(
            log.new(o!("component" => "agent-client")),
        ));
        let pool = Arc::new(NodePool::new(
            log.new(o!("component" => "node-pool")),
            Arc::clone(&connector),
        ));
        Controller::start_with(log, store, pool, connector)
    }

    /// Like [`Controller::start`] with the store and connector supplied by
    /// the caller.  Public for testing.
    pub fn start_with(
        log: Logger,
        store: Arc<ConfigStore>,
        pool: Arc<NodePool>,
        connector: Arc<dyn AgentConnector>,
    ) -> Result<Controller, StartError> {
        let mut clusters = BTreeMap::new();
        for descriptor in store.cluster_configs()? {
            let cluster_id = descriptor.uuid;
            match ClusterManager::new(&log, &pool, &connector, descriptor) {
                Ok(manager) => {
                    info!(log, "starting cluster"; "cluster_id" => %cluster_id);
                    clusters.insert(cluster_id, manager.spawn());
                }
                Err(config_error) => {
                    error!(log, "skipping misconfigured cluster";
                        "cluster_id" => %cluster_id,
                        "error" => %config_error,
                    );
                }
            }
        }
        info!(log, "controller started"; "clusters" => clusters.len());
        Ok(Controller { log, store, clusters })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn cluster(&self, id: Uuid) -> Option<&ClusterHandle> {
        self.clusters.get(&id)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterHandle> {
        self.clusters.values()
    }

    /// Stop every cluster manager and return once they are gone.
    pub async fn stop(self) {
        info!(self.log, "stopping controller");
        for (_, handle) in self.clusters {
            handle.stop().await;
        }
    }
}
