use anyhow::{Context, Result};
use std::io::{Read, Write};

pub type Row = Vec<String>;

/// A sheet of string cells under a single header row.
///
/// Every row is kept exactly as wide as the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(headers: Vec<String>, rows: Vec<Row>) -> Self {
        let mut table = Self::new(headers);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Convenience constructor used heavily in tests and fixtures.
    pub fn from_str_rows(headers: &[&str], rows: &[&[&str]]) -> Self {
        Self::with_rows(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                .collect(),
        )
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn push_row(&mut self, mut row: Row) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows[row][column].as_str()
    }

    pub fn set_cell(&mut self, row: usize, column: usize, value: impl Into<String>) {
        self.rows[row][column] = value.into();
    }

    /// All values of one column, in row order.
    pub fn column(&self, column: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |row| row[column].as_str())
    }

    /// New table with the same headers and the given rows, in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            headers: self.headers.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// New table keeping only the rows for which `keep(index)` is true.
    pub fn filter_rows(&self, mut keep: impl FnMut(usize) -> bool) -> Self {
        let indices: Vec<usize> = (0..self.rows.len()).filter(|&i| keep(i)).collect();
        self.select(&indices)
    }

    /// Parse CSV content. Rows before `header_row` are skipped, the row at
    /// `header_row` supplies the headers and fully blank rows are dropped.
    pub fn from_csv_reader<R: Read>(reader: R, delimiter: u8, header_row: usize) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);

        let mut records = csv_reader.records().skip(header_row);

        let headers: Vec<String> = match records.next() {
            Some(record) => record
                .with_context(|| format!("Failed to read header row {}", header_row))?
                .iter()
                .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
                .collect(),
            None => return Ok(Self::default()),
        };

        let mut table = Self::new(headers);
        for (line, record) in records.enumerate() {
            let record = record.with_context(|| format!("Failed to read data row {}", line + 1))?;
            if record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            table.push_row(record.iter().map(|cell| cell.to_string()).collect());
        }

        Ok(table)
    }

    pub fn write_csv<W: Write>(&self, writer: W, delimiter: u8) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);

        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }

        writer.flush()?;
        Ok(())
    }
}
