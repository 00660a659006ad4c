// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Query layer over the cluster configuration database.
//!
//! The store is consulted at startup (to build cluster descriptors) and by
//! the management CRUD surface; the reconciliation loops never touch it.
//! One connection behind a mutex is plenty for that.

use super::schema;
use super::{
    ClusterDescriptor, ClusterMode, ClusterRecord, HsmRecord, NodeMode,
    NodeRecord, PolicyRecord, StoreError, ZoneRecord,
};
use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension};
use slog::{debug, info, Logger};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub struct ConfigStore {
    conn: Mutex<Connection>,
    log: Logger,
}

impl ConfigStore {
    /// Open (creating and initializing if necessary) the database at `path`.
    pub fn open(log: Logger, path: &Utf8Path) -> Result<ConfigStore, StoreError> {
        info!(log, "opening config store"; "path" => path.as_str());
        let conn = Connection::open(path.as_std_path())?;
        ConfigStore::new(log, conn)
    }

    /// Open a fresh in-memory database.  Used by the test suites.
    pub fn open_in_memory(log: Logger) -> Result<ConfigStore, StoreError> {
        let conn = Connection::open_in_memory()?;
        ConfigStore::new(log, conn)
    }

    fn new(log: Logger, mut conn: Connection) -> Result<ConfigStore, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::setup(&log, &mut conn)?;
        Ok(ConfigStore { conn: Mutex::new(conn), log })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Assemble one descriptor per configured cluster.  Each cluster must
    /// have exactly one policy; every other join may be empty.
    pub fn cluster_configs(&self) -> Result<Vec<ClusterDescriptor>, StoreError> {
        let clusters = self.cluster_list()?;
        let mut descriptors = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let conn = self.conn();
            let policy = conn
                .query_row(
                    "SELECT p.uuid, p.data FROM policies p \
                     JOIN cluster_policy cp ON cp.policy_uuid = p.uuid \
                     WHERE cp.cluster_uuid = ?1",
                    [cluster.uuid.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                        ))
                    },
                )
                .optional()?
                .ok_or(StoreError::MissingPolicy(cluster.uuid))?;
            let policy = PolicyRecord {
                uuid: parse_uuid("policies", "uuid", &policy.0)?,
                data: parse_json("policies", "data", &policy.0, &policy.1)?,
            };

            let mut hsms = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT h.uuid, h.data FROM hsms h \
                 JOIN cluster_hsm ch ON ch.hsm_uuid = h.uuid \
                 WHERE ch.cluster_uuid = ?1 ORDER BY h.uuid",
            )?;
            let rows = stmt.query_map([cluster.uuid.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (uuid, data) = row?;
                hsms.push(HsmRecord {
                    uuid: parse_uuid("hsms", "uuid", &uuid)?,
                    data: parse_json("hsms", "data", &uuid, &data)?,
                });
            }
            drop(stmt);
            drop(conn);

            let nodes = self.cluster_nodes(cluster.uuid)?;
            let zones = self.cluster_zones(cluster.uuid)?;
            debug!(self.log, "assembled cluster descriptor";
                "cluster_id" => %cluster.uuid,
                "nodes" => nodes.len(),
                "zones" => zones.len(),
                "hsms" => hsms.len(),
            );
            descriptors.push(ClusterDescriptor {
                uuid: cluster.uuid,
                mode: cluster.mode,
                policy,
                hsms,
                nodes,
                zones,
            });
        }
        Ok(descriptors)
    }

    pub fn cluster_list(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT uuid, mode FROM clusters ORDER BY uuid")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut clusters = Vec::new();
        for row in rows {
            let (uuid, mode) = row?;
            clusters.push(ClusterRecord {
                uuid: parse_uuid("clusters", "uuid", &uuid)?,
                mode: parse_cluster_mode(&uuid, &mode)?,
            });
        }
        Ok(clusters)
    }

    pub fn node_list(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT uuid, uri, mode FROM nodes ORDER BY uuid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(node_from_row(row?)?);
        }
        Ok(nodes)
    }

    pub fn zone_list(&self) -> Result<Vec<ZoneRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uuid, name, input_type, input_data FROM zones \
             ORDER BY uuid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut zones = Vec::new();
        for row in rows {
            zones.push(zone_from_row(row?)?);
        }
        Ok(zones)
    }

    /// The nodes serving `cluster`.
    pub fn cluster_nodes(
        &self,
        cluster: Uuid,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT n.uuid, n.uri, n.mode FROM nodes n \
             JOIN cluster_node cn ON cn.node_uuid = n.uuid \
             WHERE cn.cluster_uuid = ?1 ORDER BY n.uuid",
        )?;
        let rows = stmt.query_map([cluster.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(node_from_row(row?)?);
        }
        Ok(nodes)
    }

    /// The zones signed by `cluster`.
    pub fn cluster_zones(
        &self,
        cluster: Uuid,
    ) -> Result<Vec<ZoneRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT z.uuid, z.name, z.input_type, z.input_data FROM zones z \
             JOIN cluster_zone cz ON cz.zone_uuid = z.uuid \
             WHERE cz.cluster_uuid = ?1 ORDER BY z.uuid",
        )?;
        let rows = stmt.query_map([cluster.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut zones = Vec::new();
        for row in rows {
            zones.push(zone_from_row(row?)?);
        }
        Ok(zones)
    }

    pub fn node_create(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO nodes (uuid, uri, mode) VALUES (?1, ?2, ?3)",
            params![
                node.uuid.to_string(),
                node.uri,
                node.mode.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn zone_create(&self, zone: &ZoneRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO zones (uuid, name, input_type, input_data) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                zone.uuid.to_string(),
                zone.name,
                zone.input_type,
                zone.input_data.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn hsm_create(&self, hsm: &HsmRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO hsms (uuid, data) VALUES (?1, ?2)",
            params![hsm.uuid.to_string(), hsm.data.to_string()],
        )?;
        Ok(())
    }

    pub fn policy_create(
        &self,
        policy: &PolicyRecord,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO policies (uuid, data) VALUES (?1, ?2)",
            params![policy.uuid.to_string(), policy.data.to_string()],
        )?;
        Ok(())
    }

    pub fn cluster_create(
        &self,
        cluster: &ClusterRecord,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO clusters (uuid, mode) VALUES (?1, ?2)",
            params![cluster.uuid.to_string(), cluster.mode.to_string()],
        )?;
        Ok(())
    }

    pub fn cluster_add_node(
        &self,
        cluster: Uuid,
        node: Uuid,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO cluster_node (cluster_uuid, node_uuid) \
             VALUES (?1, ?2)",
            params![cluster.to_string(), node.to_string()],
        )?;
        Ok(())
    }

    pub fn cluster_add_zone(
        &self,
        cluster: Uuid,
        zone: Uuid,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO cluster_zone (cluster_uuid, zone_uuid) \
             VALUES (?1, ?2)",
            params![cluster.to_string(), zone.to_string()],
        )?;
        Ok(())
    }

    pub fn cluster_add_hsm(
        &self,
        cluster: Uuid,
        hsm: Uuid,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO cluster_hsm (cluster_uuid, hsm_uuid) \
             VALUES (?1, ?2)",
            params![cluster.to_string(), hsm.to_string()],
        )?;
        Ok(())
    }

    pub fn cluster_set_policy(
        &self,
        cluster: Uuid,
        policy: Uuid,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO cluster_policy (cluster_uuid, policy_uuid) \
             VALUES (?1, ?2) \
             ON CONFLICT (cluster_uuid) DO UPDATE SET policy_uuid = ?2",
            params![cluster.to_string(), policy.to_string()],
        )?;
        Ok(())
    }

    /// Overwrite the stored schema version.  Test-only escape hatch for
    /// exercising the version handshake.
    #[cfg(test)]
    fn force_schema_version(&self, version: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("UPDATE version SET version = ?1", [version])?;
        Ok(())
    }
}

fn node_from_row(
    (uuid, uri, mode): (String, String, String),
) -> Result<NodeRecord, StoreError> {
    Ok(NodeRecord {
        uuid: parse_uuid("nodes", "uuid", &uuid)?,
        uri,
        mode: NodeMode::try_from(mode.as_str()).map_err(|message| {
            StoreError::InvalidRow {
                table: "nodes",
                column: "mode",
                key: uuid,
                message,
            }
        })?,
    })
}

fn zone_from_row(
    (uuid, name, input_type, input_data): (String, String, String, String),
) -> Result<ZoneRecord, StoreError> {
    Ok(ZoneRecord {
        input_data: parse_json("zones", "input_data", &uuid, &input_data)?,
        uuid: parse_uuid("zones", "uuid", &uuid)?,
        name,
        input_type,
    })
}

fn parse_uuid(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|error| StoreError::InvalidRow {
        table,
        column,
        key: raw.to_string(),
        message: error.to_string(),
    })
}

fn parse_json(
    table: &'static str,
    column: &'static str,
    key: &str,
    raw: &str,
) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|error| StoreError::InvalidRow {
        table,
        column,
        key: key.to_string(),
        message: error.to_string(),
    })
}

fn parse_cluster_mode(
    uuid: &str,
    mode: &str,
) -> Result<ClusterMode, StoreError> {
    ClusterMode::try_from(mode).map_err(|message| StoreError::InvalidRow {
        table: "clusters",
        column: "mode",
        key: uuid.to_string(),
        message,
    })
}

#[cfg(test)]
mod test {
    use super::super::{
        ClusterMode, ClusterRecord, HsmRecord, NodeMode, NodeRecord,
        PolicyRecord, StoreError, ZoneRecord,
    };
    use super::ConfigStore;
    use crate::testing::test_logger;
    use serde_json::json;
    use uuid::Uuid;

    fn store() -> ConfigStore {
        ConfigStore::open_in_memory(test_logger()).unwrap()
    }

    /// Seed one complete cluster and return its uuid.
    fn seed_cluster(store: &ConfigStore) -> Uuid {
        let cluster =
            ClusterRecord { uuid: Uuid::new_v4(), mode: ClusterMode::Backup };
        store.cluster_create(&cluster).unwrap();

        let node = NodeRecord {
            uuid: Uuid::new_v4(),
            uri: "http://signer1.example.net:8080".to_string(),
            mode: NodeMode::Primary,
        };
        store.node_create(&node).unwrap();
        store.cluster_add_node(cluster.uuid, node.uuid).unwrap();

        let zone = ZoneRecord {
            uuid: Uuid::new_v4(),
            name: "example.com".to_string(),
            input_type: "lim_plugin_dns".to_string(),
            input_data: json!({ "host": "dns1.example.net", "port": 5353 }),
        };
        store.zone_create(&zone).unwrap();
        store.cluster_add_zone(cluster.uuid, zone.uuid).unwrap();

        let hsm = HsmRecord {
            uuid: Uuid::new_v4(),
            data: json!({ "name": "softhsm", "module": "libsofthsm.so" }),
        };
        store.hsm_create(&hsm).unwrap();
        store.cluster_add_hsm(cluster.uuid, hsm.uuid).unwrap();

        let policy = PolicyRecord {
            uuid: Uuid::new_v4(),
            data: json!({ "name": "default" }),
        };
        store.policy_create(&policy).unwrap();
        store.cluster_set_policy(cluster.uuid, policy.uuid).unwrap();

        cluster.uuid
    }

    #[test]
    fn test_cluster_configs() {
        let store = store();
        let cluster_id = seed_cluster(&store);

        let descriptors = store.cluster_configs().unwrap();
        assert_eq!(descriptors.len(), 1);
        let descriptor = &descriptors[0];
        assert_eq!(descriptor.uuid, cluster_id);
        assert_eq!(descriptor.mode, ClusterMode::Backup);
        assert_eq!(descriptor.nodes.len(), 1);
        assert_eq!(descriptor.zones.len(), 1);
        assert_eq!(descriptor.hsms.len(), 1);
        assert_eq!(descriptor.zones[0].name, "example.com");
        assert_eq!(descriptor.policy.data, json!({ "name": "default" }));
    }

    #[test]
    fn test_cluster_without_policy_is_rejected() {
        let store = store();
        let cluster =
            ClusterRecord { uuid: Uuid::new_v4(), mode: ClusterMode::Balance };
        store.cluster_create(&cluster).unwrap();

        match store.cluster_configs() {
            Err(StoreError::MissingPolicy(uuid)) => {
                assert_eq!(uuid, cluster.uuid)
            }
            other => panic!("expected MissingPolicy, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_narrow_lists() {
        let store = store();
        let cluster_id = seed_cluster(&store);

        assert_eq!(store.cluster_list().unwrap().len(), 1);
        assert_eq!(store.node_list().unwrap().len(), 1);
        assert_eq!(store.zone_list().unwrap().len(), 1);
        assert_eq!(store.cluster_nodes(cluster_id).unwrap().len(), 1);
        assert_eq!(store.cluster_zones(cluster_id).unwrap().len(), 1);

        // Join lists are scoped to the cluster asked about.
        let other = Uuid::new_v4();
        assert!(store.cluster_nodes(other).unwrap().is_empty());
        assert!(store.cluster_zones(other).unwrap().is_empty());
    }

    #[test]
    fn test_zone_names_are_unique() {
        let store = store();
        let zone = ZoneRecord {
            uuid: Uuid::new_v4(),
            name: "example.com".to_string(),
            input_type: "lim_plugin_dns".to_string(),
            input_data: json!({ "host": "dns1.example.net", "port": 5353 }),
        };
        store.zone_create(&zone).unwrap();

        let duplicate = ZoneRecord { uuid: Uuid::new_v4(), ..zone };
        assert!(matches!(
            store.zone_create(&duplicate),
            Err(StoreError::Database(_))
        ));
    }

    #[test]
    fn test_schema_version_handshake() {
        // The handshake only matters across opens, so use a file.
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("config.db");

        {
            let store =
                ConfigStore::open(test_logger(), &path).unwrap();
            store
                .force_schema_version(super::super::SCHEMA_VERSION + 1)
                .unwrap();
        }
        match ConfigStore::open(test_logger(), &path) {
            Err(StoreError::SchemaTooNew { found, supported }) => {
                assert_eq!(found, super::super::SCHEMA_VERSION + 1);
                assert_eq!(supported, super::super::SCHEMA_VERSION);
            }
            other => panic!("expected SchemaTooNew, got ok={}", other.is_ok()),
        }

        {
            // Reset to something older than the code supports.
            let conn = rusqlite::Connection::open(path.as_std_path()).unwrap();
            conn.execute("UPDATE version SET version = 0", []).unwrap();
        }
        match ConfigStore::open(test_logger(), &path) {
            Err(StoreError::UpgradeRequired { found, .. }) => {
                assert_eq!(found, 0)
            }
            other => {
                panic!("expected UpgradeRequired, got ok={}", other.is_ok())
            }
        }
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("config.db");
        {
            let store = ConfigStore::open(test_logger(), &path).unwrap();
            seed_cluster(&store);
        }
        let store = ConfigStore::open(test_logger(), &path).unwrap();
        assert_eq!(store.cluster_configs().unwrap().len(), 1);
    }
}
