//! Catalog access: table schemas in, tablet reports out.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::schema::Schema;
use granite_common::types::TableId;
use granite_tablet::TableType;

use crate::report::TabletReport;

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub table_id: TableId,
    pub name: String,
    pub table_type: TableType,
    pub schema: Schema,
}

/// The tablet server's view of the cluster catalog.
pub trait CatalogClient: Send + Sync {
    fn get_table(&self, table_id: &TableId) -> GraniteResult<TableInfo>;

    /// Deliver a heartbeat report. An error leaves the reported tablets
    /// dirty so they go out again with the next heartbeat.
    fn report_tablets(&self, report: &TabletReport) -> GraniteResult<()>;
}

/// Catalog held in process memory, used by single-node deployments and
/// tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<TableId, TableInfo>>,
    /// Last report per node.
    reports: Mutex<BTreeMap<String, TabletReport>>,
    reject_reports: Mutex<Option<GraniteError>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table_id: TableId, schema: Schema, table_type: TableType) -> GraniteResult<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&table_id) {
            return Err(GraniteError::AlreadyPresent(format!("table {table_id} already exists")));
        }
        let info = TableInfo {
            name: table_id.as_str().to_string(),
            table_id: table_id.clone(),
            table_type,
            schema,
        };
        tables.insert(table_id, info);
        Ok(())
    }

    /// Replace the schema of `table_id`. The new version must be higher.
    pub fn alter_table(&self, table_id: &TableId, schema: Schema) -> GraniteResult<()> {
        let mut tables = self.tables.write();
        let info = tables
            .get_mut(table_id)
            .ok_or_else(|| GraniteError::NotFound(format!("table {table_id}")))?;
        if schema.version <= info.schema.version {
            return Err(GraniteError::InvalidArgument(format!(
                "schema version {} of table {table_id} is not newer than {}",
                schema.version, info.schema.version
            )));
        }
        info.schema = schema;
        Ok(())
    }

    pub fn last_report(&self, node_id: &str) -> Option<TabletReport> {
        self.reports.lock().get(node_id).cloned()
    }

    /// Make `report_tablets` fail with `error` until cleared with `None`.
    pub fn set_report_failure(&self, error: Option<GraniteError>) {
        *self.reject_reports.lock() = error;
    }
}

impl CatalogClient for InMemoryCatalog {
    fn get_table(&self, table_id: &TableId) -> GraniteResult<TableInfo> {
        self.tables
            .read()
            .get(table_id)
            .cloned()
            .ok_or_else(|| GraniteError::NotFound(format!("table {table_id}")))
    }

    fn report_tablets(&self, report: &TabletReport) -> GraniteResult<()> {
        if let Some(e) = self.reject_reports.lock().clone() {
            return Err(e);
        }
        let mut reports = self.reports.lock();
        // incremental reports update the entries they carry
        let merged = match reports.remove(&report.node_id) {
            Some(mut previous) if report.incremental => {
                previous.sequence = report.sequence;
                for tablet in &report.tablets {
                    previous.tablets.retain(|t| t.tablet_id != tablet.tablet_id);
                    previous.tablets.push(tablet.clone());
                }
                previous.tablets.sort_by(|a, b| a.tablet_id.cmp(&b.tablet_id));
                previous
            }
            _ => report.clone(),
        };
        reports.insert(report.node_id.clone(), merged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportedTablet;
    use granite_common::types::TabletId;
    use granite_common::OpId;

    fn tablet(id: &str, state: &str) -> ReportedTablet {
        ReportedTablet {
            tablet_id: TabletId::from(id),
            table_id: TableId::from("t"),
            state: state.into(),
            last_op_id: OpId::INVALID,
            on_disk_size: 0,
            leader: false,
        }
    }

    #[test]
    fn test_table_lookup_and_alter() {
        let catalog = InMemoryCatalog::new();
        let id = TableId::from("users");
        assert!(matches!(catalog.get_table(&id), Err(GraniteError::NotFound(_))));
        catalog
            .create_table(id.clone(), Schema::new(1, Vec::new()), TableType::Regular)
            .unwrap();
        assert!(catalog
            .create_table(id.clone(), Schema::new(1, Vec::new()), TableType::Regular)
            .unwrap_err()
            .is_already_present());
        assert!(catalog.alter_table(&id, Schema::new(1, Vec::new())).is_err());
        catalog.alter_table(&id, Schema::new(2, Vec::new())).unwrap();
        assert_eq!(catalog.get_table(&id).unwrap().schema.version, 2);
    }

    #[test]
    fn test_incremental_reports_merge() {
        let catalog = InMemoryCatalog::new();
        let full = TabletReport {
            node_id: "ts-1".into(),
            sequence: 1,
            incremental: false,
            tablets: vec![tablet("a", "RUNNING"), tablet("b", "RUNNING")],
        };
        catalog.report_tablets(&full).unwrap();
        let delta = TabletReport {
            node_id: "ts-1".into(),
            sequence: 2,
            incremental: true,
            tablets: vec![tablet("b", "FAILED")],
        };
        catalog.report_tablets(&delta).unwrap();

        let last = catalog.last_report("ts-1").unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(last.tablets.len(), 2);
        assert_eq!(last.tablets[1].state, "FAILED");

        catalog.set_report_failure(Some(GraniteError::ServiceUnavailable("down".into())));
        assert!(catalog.report_tablets(&delta).is_err());
    }
}
