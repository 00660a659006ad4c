// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DDL for the cluster configuration database and the schema-version
//! handshake performed on open.

use super::StoreError;
use rusqlite::{Connection, OptionalExtension};
use slog::{info, Logger};

/// Version of the schema this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// Entities are flat tables of opaque-ish columns; ownership lives in the
/// join tables so that the same node can serve several clusters while a zone
/// belongs to at most one.
const SCHEMA: &str = "
CREATE TABLE version (
    version INTEGER NOT NULL
);
CREATE TABLE nodes (
    uuid TEXT PRIMARY KEY,
    uri TEXT NOT NULL,
    mode TEXT NOT NULL
);
CREATE TABLE zones (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    input_type TEXT NOT NULL,
    input_data TEXT NOT NULL
);
CREATE TABLE clusters (
    uuid TEXT PRIMARY KEY,
    mode TEXT NOT NULL
);
CREATE TABLE hsms (
    uuid TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
CREATE TABLE policies (
    uuid TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
CREATE TABLE cluster_node (
    cluster_uuid TEXT NOT NULL REFERENCES clusters (uuid),
    node_uuid TEXT NOT NULL REFERENCES nodes (uuid),
    PRIMARY KEY (cluster_uuid, node_uuid)
);
CREATE TABLE cluster_zone (
    cluster_uuid TEXT NOT NULL REFERENCES clusters (uuid),
    zone_uuid TEXT NOT NULL UNIQUE REFERENCES zones (uuid),
    PRIMARY KEY (cluster_uuid, zone_uuid)
);
CREATE TABLE cluster_hsm (
    cluster_uuid TEXT NOT NULL REFERENCES clusters (uuid),
    hsm_uuid TEXT NOT NULL REFERENCES hsms (uuid),
    PRIMARY KEY (cluster_uuid, hsm_uuid)
);
CREATE TABLE cluster_policy (
    cluster_uuid TEXT PRIMARY KEY REFERENCES clusters (uuid),
    policy_uuid TEXT NOT NULL REFERENCES policies (uuid)
);
";

/// Create the schema on a fresh database, or verify the version of an
/// existing one.  An on-disk version older than ours would need a migration
/// we do not have; a newer one means a newer controller owns this file.
pub fn setup(log: &Logger, conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let version: Option<i64> = tx
        .query_row(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name = 'version'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .map(|()| {
            tx.query_row("SELECT version FROM version", [], |row| row.get(0))
        })
        .transpose()?;

    match version {
        None => {
            info!(log, "creating schema"; "version" => SCHEMA_VERSION);
            tx.execute_batch(SCHEMA)?;
            tx.execute(
                "INSERT INTO version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        Some(found) if found == SCHEMA_VERSION => {
            info!(log, "schema up to date"; "version" => found);
        }
        Some(found) if found < SCHEMA_VERSION => {
            return Err(StoreError::UpgradeRequired {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        Some(found) => {
            return Err(StoreError::SchemaTooNew {
                found,
                supported: SCHEMA_VERSION,
            });
        }
    }
    tx.commit()?;
    Ok(())
}
