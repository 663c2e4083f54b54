use crate::capacity::CapacityIndex;
use crate::columns::{application, capacity, result, ColumnMap};
use crate::error::MissingColumnError;
use crate::models::{cmp_missing_last, normalize_id, parse_number, Degree, Nomination, Stage};
use crate::table::Table;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Output of the occupancy step.
#[derive(Debug, Clone)]
pub struct Occupancy {
    /// Capacity sheet whose BC/MGR/PHD/ALL cells now hold current headcounts.
    pub capacities: Table,
    /// Application rows flagged `ANO`, for reporting.
    pub accepted: Table,
}

/// Runs the table-transforming steps of the nomination workflow.
///
/// Each method takes its inputs by reference and returns fresh tables.
pub struct NominationAllocator<'a> {
    pub capacity_columns: &'a ColumnMap,
    pub application_columns: &'a ColumnMap,
}

impl<'a> NominationAllocator<'a> {
    pub fn new(capacity_columns: &'a ColumnMap, application_columns: &'a ColumnMap) -> Self {
        Self {
            capacity_columns,
            application_columns,
        }
    }

    /// Step 1: replace declared capacities with the number of `ANO` rows per
    /// institution and degree bucket.
    pub fn compute_occupancy(&self, capacities: &Table, applications: &Table) -> Result<Occupancy, MissingColumnError> {
        let stage = Stage::Occupancy;
        let [cap_id_column] = self
            .capacity_columns
            .require(capacities, [capacity::ID_CODE], stage)?;
        let [id_column, degree_column, nominated_column] = self.application_columns.require(
            applications,
            [application::ID_CODE, application::DEGREE, application::NOMINATED],
            stage,
        )?;

        let accepted = applications.filter_rows(|row| {
            Nomination::parse(applications.cell(row, nominated_column)) == Nomination::Accepted
        });

        let mut per_degree: HashMap<(&str, Degree), i64> = HashMap::new();
        let mut totals: HashMap<&str, i64> = HashMap::new();
        let mut unbucketed = 0usize;

        for row in applications.rows() {
            if Nomination::parse(&row[nominated_column]) != Nomination::Accepted {
                continue;
            }
            let institution = normalize_id(&row[id_column]);
            if institution.is_empty() {
                continue;
            }
            *totals.entry(institution).or_default() += 1;
            match Degree::normalize(&row[degree_column]) {
                Some(degree) => *per_degree.entry((institution, degree)).or_default() += 1,
                None => unbucketed += 1,
            }
        }

        let institution_ids: Vec<&str> = capacities
            .column(cap_id_column)
            .map(normalize_id)
            .collect();
        let mut adjusted = capacities.clone();

        for degree in Degree::ALL {
            let Some(column) = self
                .capacity_columns
                .index_in(capacities, degree.capacity_field())
            else {
                continue;
            };
            for (row, institution) in institution_ids.iter().enumerate() {
                let count = per_degree.get(&(*institution, degree)).copied().unwrap_or(0);
                adjusted.set_cell(row, column, count.to_string());
            }
        }

        if let Some(column) = self.capacity_columns.index_in(capacities, capacity::ALL) {
            for (row, institution) in institution_ids.iter().enumerate() {
                let count = totals.get(institution).copied().unwrap_or(0);
                adjusted.set_cell(row, column, count.to_string());
            }
        }

        if unbucketed > 0 {
            debug!(unbucketed, "accepted rows with an unrecognised degree only count towards ALL");
        }
        info!(
            accepted = accepted.len(),
            institutions = totals.len(),
            "computed real occupancy"
        );

        Ok(Occupancy {
            capacities: adjusted,
            accepted,
        })
    }

    /// Step 2: for every student holding an `ANO` row, drop applications with
    /// a worse (numerically higher) priority than the best accepted one.
    pub fn filter_duplicates_by_priority(&self, working: &Table) -> Result<Table, MissingColumnError> {
        let [student_column, nominated_column, priority_column] = self.application_columns.require(
            working,
            [application::STUDENT_ID, application::NOMINATED, application::PRIORITY],
            Stage::DuplicateFilter,
        )?;

        let mut by_student: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (row, student) in working.column(student_column).enumerate() {
            let student = normalize_id(student);
            if !student.is_empty() {
                by_student.entry(student).or_default().push(row);
            }
        }

        let priorities: Vec<Option<f64>> = working.column(priority_column).map(parse_number).collect();
        let mut keep = vec![true; working.len()];

        for rows in by_student.values() {
            let best_accepted = rows
                .iter()
                .filter(|&&row| Nomination::parse(working.cell(row, nominated_column)) == Nomination::Accepted)
                .filter_map(|&row| priorities[row])
                .fold(None, |best: Option<f64>, priority| {
                    Some(best.map_or(priority, |b| b.min(priority)))
                });

            let Some(best_accepted) = best_accepted else {
                continue;
            };

            for &row in rows {
                keep[row] = priorities[row].is_some_and(|priority| priority <= best_accepted);
            }
        }

        let filtered = working.filter_rows(|row| keep[row]);
        info!(
            removed = working.len() - filtered.len(),
            remaining = filtered.len(),
            "filtered lower-priority duplicates"
        );
        Ok(filtered)
    }

    /// Step 3: renumber `Pořadí` densely from 1 inside every institution.
    ///
    /// Rows come out grouped by institution id (ascending), each group sorted
    /// by its previous order with missing values last and ties kept stable.
    pub fn normalize_ordering(&self, working: &Table) -> Result<Table, MissingColumnError> {
        let [id_column, order_column] = self.application_columns.require(
            working,
            [application::ID_CODE, application::ORDER],
            Stage::OrderNormalization,
        )?;

        let orders: Vec<Option<f64>> = working.column(order_column).map(parse_number).collect();
        let mut sequence = Vec::with_capacity(working.len());
        let mut ranks = Vec::with_capacity(working.len());

        for (_, mut rows) in group_by_institution(working, id_column) {
            rows.sort_by(|&a, &b| cmp_missing_last(orders[a], orders[b]));
            for (rank, row) in rows.into_iter().enumerate() {
                sequence.push(row);
                ranks.push(rank + 1);
            }
        }

        let mut normalized = working.select(&sequence);
        for (row, rank) in ranks.into_iter().enumerate() {
            normalized.set_cell(row, order_column, rank.to_string());
        }

        debug!(rows = normalized.len(), "renumbered institution order");
        Ok(normalized)
    }

    /// Step 4: take the best-ordered candidates of every institution up to its
    /// available places and project them onto the result schema.
    pub fn build_result_table(&self, working: &Table, capacities: &Table) -> Result<Table, MissingColumnError> {
        let stage = Stage::Selection;
        let places = CapacityIndex::new(capacities, self.capacity_columns, stage)?;
        let [id_column, order_column] = self.application_columns.require(
            working,
            [application::ID_CODE, application::ORDER],
            stage,
        )?;

        let orders: Vec<Option<f64>> = working.column(order_column).map(parse_number).collect();
        let mut selected = Vec::new();

        for (institution, mut rows) in group_by_institution(working, id_column) {
            let available = places.available(institution);
            if available <= 0 {
                continue;
            }
            rows.sort_by(|&a, &b| cmp_missing_last(orders[a], orders[b]));
            let taken = rows.len().min(available as usize);
            debug!(institution, available, candidates = rows.len(), taken, "selected candidates");
            selected.extend(rows.into_iter().take(taken));
        }

        let sources: Vec<Option<usize>> = result::COLUMNS
            .iter()
            .map(|column| self.application_columns.index_in(working, column))
            .collect();

        let mut table = Table::new(result::COLUMNS.iter().map(|c| c.to_string()).collect());
        for row in selected {
            table.push_row(
                sources
                    .iter()
                    .map(|source| source.map(|column| working.cell(row, column).to_string()).unwrap_or_default())
                    .collect(),
            );
        }

        info!(selected = table.len(), "built result table");
        Ok(table)
    }

    /// Step 5: mark working rows `ANO` exactly when their (student, institution)
    /// pair made it into the result table, and force `ANO` in the result table.
    pub fn update_nominations(&self, working: &Table, result_table: &Table) -> Result<(Table, Table), MissingColumnError> {
        let stage = Stage::NominationUpdate;
        let [nominated_column, student_column, id_column] = self.application_columns.require(
            working,
            [application::NOMINATED, application::STUDENT_ID, application::ID_CODE],
            stage,
        )?;

        let (result_student, result_id) = match (
            result_table.column_index(result::STUDENT_ID),
            result_table.column_index(result::INSTITUTION_ID),
        ) {
            (Some(student), Some(id)) => (student, id),
            (student, id) => {
                let mut missing = Vec::new();
                if student.is_none() {
                    missing.push(result::STUDENT_ID.to_string());
                }
                if id.is_none() {
                    missing.push(result::INSTITUTION_ID.to_string());
                }
                return Err(MissingColumnError::new(stage, missing));
            }
        };

        let accepted_pairs: HashSet<(&str, &str)> = result_table
            .rows()
            .iter()
            .map(|row| (normalize_id(&row[result_student]), normalize_id(&row[result_id])))
            .filter(|(student, id)| !student.is_empty() && !id.is_empty())
            .collect();

        let mut updated = working.clone();
        let mut accepted_rows = 0usize;
        for row in 0..working.len() {
            let pair = (
                normalize_id(working.cell(row, student_column)),
                normalize_id(working.cell(row, id_column)),
            );
            let accepted = accepted_pairs.contains(&pair);
            accepted_rows += usize::from(accepted);
            updated.set_cell(row, nominated_column, Nomination::from_accepted(accepted).as_str());
        }

        let mut updated_result = result_table.clone();
        if let Some(column) = result_table.column_index(result::NOMINATED) {
            for row in 0..updated_result.len() {
                updated_result.set_cell(row, column, Nomination::Accepted.as_str());
            }
        }

        info!(
            accepted = accepted_rows,
            rejected = working.len() - accepted_rows,
            "updated nominations"
        );
        Ok((updated, updated_result))
    }
}

/// Row indices grouped by trimmed institution id, in ascending id order.
pub(crate) fn group_by_institution(table: &Table, id_column: usize) -> BTreeMap<&str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, id) in table.column(id_column).enumerate() {
        groups.entry(normalize_id(id)).or_default().push(row);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_HEADERS: &[&str] = &["Číslo UK", "ID code", "Studying for degree", "NOMINOVÁN", "PRIORITA", "Pořadí"];

    fn maps() -> (ColumnMap, ColumnMap) {
        (
            ColumnMap::identity(capacity::FIELDS),
            ColumnMap::identity(application::FIELDS),
        )
    }

    fn apps(rows: &[&[&str]]) -> Table {
        Table::from_str_rows(APP_HEADERS, rows)
    }

    fn column_values(table: &Table, name: &str) -> Vec<String> {
        let column = table.column_index(name).unwrap();
        table.column(column).map(str::to_string).collect()
    }

    #[test]
    fn occupancy_overwrites_aggregate_with_accepted_count() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let capacities = Table::from_str_rows(&["ID code", "ALL"], &[&["A", "2"]]);
        let applications = apps(&[
            &["s1", "A", "BC", "ANO", "1", "1"],
            &["s2", "A", "MGR", "ano", "1", "2"],
            &["s3", "A", "PHD", "ANO", "1", "3"],
        ]);

        let occupancy = allocator.compute_occupancy(&capacities, &applications).unwrap();

        assert_eq!(column_values(&occupancy.capacities, "ALL"), vec!["3"]);
        assert_eq!(occupancy.accepted.len(), 3);
        // the input is left untouched
        assert_eq!(column_values(&capacities, "ALL"), vec!["2"]);
    }

    #[test]
    fn occupancy_counts_per_degree_and_skips_unknown_degrees() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let capacities = Table::from_str_rows(
            &["ID code", "BC", "MGR", "PHD", "ALL", "Country"],
            &[&["A", "9", "9", "9", "9", "CZ"], &["B", "4", "4", "4", "4", "SK"]],
        );
        let applications = apps(&[
            &["s1", "A", "Bachelor", "ANO", "1", "1"],
            &["s2", "A", "msc", "ANO", "1", "2"],
            &["s3", "A", "Erasmus+", "ANO", "1", "3"],
            &["s4", "A", "BC", "NE", "1", "4"],
            &["s5", "C", "BC", "ANO", "1", "1"],
        ]);

        let adjusted = allocator.compute_occupancy(&capacities, &applications).unwrap().capacities;

        assert_eq!(column_values(&adjusted, "BC"), vec!["1", "0"]);
        assert_eq!(column_values(&adjusted, "MGR"), vec!["1", "0"]);
        assert_eq!(column_values(&adjusted, "PHD"), vec!["0", "0"]);
        assert_eq!(column_values(&adjusted, "ALL"), vec!["3", "0"]);
        assert_eq!(column_values(&adjusted, "Country"), vec!["CZ", "SK"]);
    }

    #[test]
    fn occupancy_requires_columns_in_both_tables() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);

        let no_id = Table::from_str_rows(&["Code", "ALL"], &[]);
        let err = allocator.compute_occupancy(&no_id, &apps(&[])).unwrap_err();
        assert_eq!(err.stage, Stage::Occupancy);
        assert_eq!(err.fields, vec!["ID code".to_string()]);

        let capacities = Table::from_str_rows(&["ID code"], &[]);
        let applications = Table::from_str_rows(&["ID code", "Číslo UK"], &[]);
        let err = allocator.compute_occupancy(&capacities, &applications).unwrap_err();
        assert_eq!(err.fields, vec!["Studying for degree".to_string(), "NOMINOVÁN".to_string()]);
    }

    #[test]
    fn duplicate_filter_keeps_better_or_equal_priorities() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "I1", "BC", "NE", "1", ""],
            &["s1", "I2", "BC", "ANO", "2", ""],
            &["s2", "I1", "BC", "NE", "3", ""],
            &["s2", "I2", "BC", "ANO", "2", ""],
            &["s2", "I3", "BC", "NE", "", ""],
        ]);

        let filtered = allocator.filter_duplicates_by_priority(&working).unwrap();

        assert_eq!(column_values(&filtered, "Číslo UK"), vec!["s1", "s1", "s2"]);
        assert_eq!(column_values(&filtered, "ID code"), vec!["I1", "I2", "I2"]);
    }

    #[test]
    fn duplicate_filter_leaves_groups_without_usable_accepted_priority() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "I1", "BC", "NE", "5", ""],
            &["s1", "I2", "BC", "", "7", ""],
            &["s2", "I1", "BC", "ANO", "n/a", ""],
            &["s2", "I2", "BC", "NE", "9", ""],
            &["s2", "I3", "BC", "NE", "", ""],
        ]);

        let filtered = allocator.filter_duplicates_by_priority(&working).unwrap();
        assert_eq!(filtered, working);
    }

    #[test]
    fn duplicate_filter_does_not_group_rows_without_student_id() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["", "I1", "BC", "ANO", "1", ""],
            &[" ", "I2", "BC", "NE", "3", ""],
            &["", "I3", "BC", "NE", "", ""],
            &["s1", "I1", "BC", "ANO", "1", ""],
            &["s1", "I2", "BC", "NE", "3", ""],
        ]);

        let filtered = allocator.filter_duplicates_by_priority(&working).unwrap();

        // blank ids are not one student, so their worse priorities survive
        assert_eq!(column_values(&filtered, "Číslo UK"), vec!["", " ", "", "s1"]);
        assert_eq!(column_values(&filtered, "ID code"), vec!["I1", "I2", "I3", "I1"]);
    }

    #[test]
    fn duplicate_filter_never_keeps_worse_priority_than_best_accepted() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "I1", "BC", "ANO", "3", ""],
            &["s1", "I2", "BC", "ANO", "2", ""],
            &["s1", "I3", "BC", "NE", "2.5", ""],
            &["s1", "I4", "BC", "NE", "1", ""],
            &["s2", "I1", "BC", "NE", "4", ""],
        ]);

        let filtered = allocator.filter_duplicates_by_priority(&working).unwrap();
        let student = filtered.column_index("Číslo UK").unwrap();
        let priority = filtered.column_index("PRIORITA").unwrap();

        for row in filtered.rows().iter().filter(|row| row[student] == "s1") {
            let value = parse_number(&row[priority]).unwrap();
            assert!(value <= 2.0, "kept priority {} for s1", value);
        }
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn ordering_is_dense_per_institution_with_missing_last() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "B", "BC", "", "", "7"],
            &["s2", "A", "BC", "", "", ""],
            &["s3", "A", "BC", "", "", "5"],
            &["s4", "B", "BC", "", "", "x"],
            &["s5", "A", "BC", "", "", "5"],
            &["s6", "A", "BC", "", "", "2"],
        ]);

        let normalized = allocator.normalize_ordering(&working).unwrap();

        assert_eq!(column_values(&normalized, "Číslo UK"), vec!["s6", "s3", "s5", "s2", "s1", "s4"]);
        assert_eq!(column_values(&normalized, "Pořadí"), vec!["1", "2", "3", "4", "1", "2"]);
    }

    #[test]
    fn ordering_normalization_is_idempotent() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "A", "BC", "", "", "10"],
            &["s2", "B", "BC", "", "", ""],
            &["s3", "A", "BC", "", "", "3"],
            &["s4", "B", "BC", "", "", "1"],
        ]);

        let once = allocator.normalize_ordering(&working).unwrap();
        let twice = allocator.normalize_ordering(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn selector_takes_best_order_up_to_capacity() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let capacities = Table::from_str_rows(&["ID code", "ALL"], &[&["I", "1"]]);
        let working = apps(&[
            &["s1", "I", "BC", "", "", "2"],
            &["s2", "I", "BC", "", "", "1"],
            &["s3", "I", "BC", "", "", ""],
        ]);

        let table = allocator.build_result_table(&working, &capacities).unwrap();

        assert_eq!(table.headers().len(), result::COLUMNS.len());
        assert_eq!(column_values(&table, "Číslo UK"), vec!["s2"]);
        assert_eq!(column_values(&table, "Pořadí"), vec!["1"]);
        // unmapped projected columns are blank
        assert_eq!(column_values(&table, "Institut"), vec![""]);
    }

    #[test]
    fn selector_never_exceeds_capacity_and_skips_full_institutions() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let capacities = Table::from_str_rows(
            &["ID code", "BC", "MGR", "PHD", "ALL"],
            &[&["A", "1", "1", "0", ""], &["B", "0", "0", "0", "0"], &["C", "", "", "", "-2"]],
        );
        let working = apps(&[
            &["s1", "A", "BC", "", "", "1"],
            &["s2", "A", "BC", "", "", "2"],
            &["s3", "A", "BC", "", "", "3"],
            &["s4", "B", "BC", "", "", "1"],
            &["s5", "C", "BC", "", "", "1"],
            &["s6", "D", "BC", "", "", "1"],
        ]);

        let table = allocator.build_result_table(&working, &capacities).unwrap();
        assert_eq!(column_values(&table, "Číslo UK"), vec!["s1", "s2"]);

        let index = CapacityIndex::new(&capacities, &cap_map, Stage::Selection).unwrap();
        let mut per_institution: HashMap<String, i64> = HashMap::new();
        for id in column_values(&table, "ID code") {
            *per_institution.entry(id).or_default() += 1;
        }
        for (id, count) in per_institution {
            assert!(count <= index.available(&id));
        }
    }

    #[test]
    fn selector_copies_remapped_source_columns() {
        let cap_map = ColumnMap::identity(capacity::FIELDS);
        let app_map = ColumnMap::identity(application::FIELDS).with("Institut", Some("Faculty"));
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let capacities = Table::from_str_rows(&["ID code", "ALL"], &[&["A", "1"]]);
        let working = Table::from_str_rows(
            &["Faculty", "Číslo UK", "ID code", "Pořadí", "Číslo přihlášky"],
            &[&["FF UK", "s1", "A", "1", "P-1"]],
        );

        let table = allocator.build_result_table(&working, &capacities).unwrap();
        assert_eq!(column_values(&table, "Institut"), vec!["FF UK"]);
        assert_eq!(column_values(&table, "Číslo přihlášky"), vec!["P-1"]);
        assert_eq!(column_values(&table, "NOMINOVÁN"), vec![""]);
    }

    #[test]
    fn nominations_follow_result_pairs_exactly() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let working = apps(&[
            &["s1", "A", "BC", "", "1", "1"],
            &["s1", "B", "BC", "ANO", "2", "1"],
            &["s2", "A", "BC", "NE", "1", "2"],
            &["", "A", "BC", "ANO", "1", "3"],
        ]);
        let mut result_table = Table::new(result::COLUMNS.iter().map(|c| c.to_string()).collect());
        let mut row = vec![String::new(); result::COLUMNS.len()];
        row[2] = "A".to_string();
        row[4] = "s1".to_string();
        result_table.push_row(row.clone());
        row[4] = String::new();
        result_table.push_row(row);

        let (updated, updated_result) = allocator.update_nominations(&working, &result_table).unwrap();

        assert_eq!(column_values(&updated, "NOMINOVÁN"), vec!["ANO", "NE", "NE", "NE"]);
        assert_eq!(column_values(&updated_result, "NOMINOVÁN"), vec!["ANO", "ANO"]);
    }

    #[test]
    fn nomination_update_needs_result_join_columns() {
        let (cap_map, app_map) = maps();
        let allocator = NominationAllocator::new(&cap_map, &app_map);
        let result_table = Table::from_str_rows(&["Číslo UK"], &[]);

        let err = allocator.update_nominations(&apps(&[]), &result_table).unwrap_err();
        assert_eq!(err.stage, Stage::NominationUpdate);
        assert_eq!(err.fields, vec!["ID code".to_string()]);
    }
}
