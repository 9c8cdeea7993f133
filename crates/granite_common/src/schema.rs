use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datum::Datum;
use crate::types::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Text,
    Bytes,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "bool",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Text => "text",
            DataType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// Versioned table schema. The primary key is carried outside the columns
/// as the row key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    pub fn new(version: u32, columns: Vec<ColumnSchema>) -> Self {
        Schema { version, columns }
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Same columns, ignoring the version number.
    pub fn same_columns(&self, other: &Schema) -> bool {
        self.columns == other.columns
    }

    /// Check a value against the declared type of `column`.
    pub fn check_value(&self, column: &ColumnSchema, value: &Datum) -> Result<(), String> {
        match value.data_type() {
            None if column.nullable => Ok(()),
            None => Err(format!("column {} is not nullable", column.name)),
            Some(t) if t == column.data_type => Ok(()),
            Some(t) => Err(format!(
                "column {} expects {}, got {}",
                column.name, column.data_type, t
            )),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} [", self.version)?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", c.name, c.data_type)?;
        }
        f.write_str("]")
    }
}
