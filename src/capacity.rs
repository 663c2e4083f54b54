use crate::columns::{capacity, ColumnMap};
use crate::error::MissingColumnError;
use crate::models::{normalize_id, parse_number, Degree, Stage};
use crate::table::Table;
use std::collections::HashMap;

/// Lookup of available places per institution in an (adjusted) capacity sheet.
#[derive(Debug, Clone)]
pub struct CapacityIndex<'a> {
    table: &'a Table,
    rows_by_id: HashMap<String, usize>,
    all_column: Option<usize>,
    degree_columns: Vec<usize>,
}

impl<'a> CapacityIndex<'a> {
    pub fn new(table: &'a Table, columns: &ColumnMap, stage: Stage) -> Result<Self, MissingColumnError> {
        let [id_column] = columns.require(table, [capacity::ID_CODE], stage)?;

        let mut rows_by_id = HashMap::new();
        for (row, id) in table.column(id_column).enumerate() {
            let id = normalize_id(id);
            if id.is_empty() {
                continue;
            }
            // First occurrence wins for duplicated institution rows
            rows_by_id.entry(id.to_string()).or_insert(row);
        }

        Ok(Self {
            table,
            rows_by_id,
            all_column: columns.index_in(table, capacity::ALL),
            degree_columns: Degree::ALL
                .iter()
                .filter_map(|degree| columns.index_in(table, degree.capacity_field()))
                .collect(),
        })
    }

    /// Aggregate `ALL` value when it is mapped and numeric, otherwise the sum
    /// of the numeric per-degree values, otherwise 0.
    pub fn available(&self, institution_id: &str) -> i64 {
        let Some(&row) = self.rows_by_id.get(normalize_id(institution_id)) else {
            return 0;
        };

        if let Some(all) = self
            .all_column
            .and_then(|column| parse_number(self.table.cell(row, column)))
        {
            return all as i64;
        }

        self.degree_columns
            .iter()
            .filter_map(|&column| parse_number(self.table.cell(row, column)))
            .map(|value| value as i64)
            .sum()
    }
}
