//! Tablet server: hosts tablet peers, serves the tablet service and reports
//! tablet state to the catalog.

pub mod catalog;
pub mod manager;
pub mod report;
pub mod service;

use std::path::Path;

use anyhow::Context;

use granite_common::config::GraniteConfig;
use granite_common::error::GraniteResult;
use granite_common::schema::Schema;
use granite_common::types::{TableId, TabletId};
use granite_tablet::{Partition, TableType};

pub use catalog::{CatalogClient, InMemoryCatalog, TableInfo};
pub use manager::{CreateTabletRequest, LeaderTabletPeer, TabletManager};
pub use report::{DirtySnapshot, DirtyTablets, ReportedTablet, TabletReport};
pub use service::{
    AlterSchemaRequest, ChecksumResponse, FlushOperation, FlushTabletsRequest, ReadTabletRequest, Response,
    SplitTabletRequest, TabletService, WriteTabletRequest, WriteTabletResponse,
};

/// Load the server config. A missing file means defaults; a file that does
/// not parse or validate is an error.
pub fn load_config(path: &Path) -> anyhow::Result<GraniteConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(GraniteConfig::default());
    }
    let config = GraniteConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Register the configured tables. A table is a transaction status table
/// if any configured tablet of it says so.
pub fn build_catalog(config: &GraniteConfig) -> GraniteResult<InMemoryCatalog> {
    let catalog = InMemoryCatalog::new();
    for table in &config.server.tables {
        let status = config
            .server
            .tablets
            .iter()
            .any(|t| t.table_id == table.table_id && t.transaction_status);
        let table_type = if status { TableType::TransactionStatus } else { TableType::Regular };
        catalog.create_table(
            TableId::new(table.table_id.clone()),
            Schema::new(1, table.columns.clone()),
            table_type,
        )?;
    }
    Ok(catalog)
}

/// Create every configured tablet, each over the whole key space. Returns
/// how many came up; failures are logged and the tablet is skipped.
pub fn open_configured_tablets(manager: &TabletManager, config: &GraniteConfig) -> usize {
    let mut opened = 0;
    for hosted in &config.server.tablets {
        let request = CreateTabletRequest {
            tablet_id: TabletId::new(hosted.tablet_id.clone()),
            table_id: TableId::new(hosted.table_id.clone()),
            partition: Partition::default(),
        };
        match manager.create_tablet(request) {
            Ok(_) => opened += 1,
            Err(e) => tracing::error!(tablet_id = %hosted.tablet_id, error = %e, "could not open tablet"),
        }
    }
    granite_observability::record_hosted_tablets(manager.peers().len());
    opened
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogClient;

    const CONFIG: &str = r#"
[server]
node_id = "ts-7"

[[server.tables]]
table_id = "users"
columns = [{ id = 1, name = "email", data_type = "Text", nullable = false }]

[[server.tables]]
table_id = "txns"
columns = []

[[server.tablets]]
tablet_id = "users-0"
table_id = "users"

[[server.tablets]]
tablet_id = "txns-0"
table_id = "txns"
transaction_status = true
"#;

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tserver.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.node_id, "ts-7");
        assert_eq!(config.server.tablets.len(), 2);

        let missing = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.server.node_id, "ts-1");

        std::fs::write(&path, "[server\nnode_id=").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_build_catalog_marks_status_tables() {
        let config = GraniteConfig::from_toml_str(CONFIG).unwrap();
        let catalog = build_catalog(&config).unwrap();
        let users = catalog.get_table(&TableId::from("users")).unwrap();
        assert_eq!(users.table_type, TableType::Regular);
        assert_eq!(users.schema.columns[0].name, "email");
        let txns = catalog.get_table(&TableId::from("txns")).unwrap();
        assert_eq!(txns.table_type, TableType::TransactionStatus);
    }
}
