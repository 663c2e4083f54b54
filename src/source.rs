use crate::table::Table;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use tracing::{info, warn};

/// Loads input sheets from local CSV files or over HTTP.
pub struct TableLoader {
    client: reqwest::Client,
    delimiter: u8,
}

impl TableLoader {
    pub fn new(delimiter: u8) -> Self {
        Self {
            client: reqwest::Client::new(),
            delimiter,
        }
    }

    /// `location` is fetched when it is an `http(s)://` URL and read from disk otherwise.
    pub async fn load(&self, location: &str, header_row: usize) -> Result<Table> {
        if is_remote(location) {
            self.load_url(location, header_row).await
        } else {
            self.load_file(location, header_row)
        }
    }

    pub fn load_file(&self, file_path: &str, header_row: usize) -> Result<Table> {
        let file = File::open(file_path).with_context(|| format!("Failed to open file: {}", file_path))?;

        let table = Table::from_csv_reader(BufReader::new(file), self.delimiter, header_row)
            .with_context(|| format!("Failed to parse CSV: {}", file_path))?;
        log_loaded(file_path, &table);
        Ok(table)
    }

    pub async fn load_url(&self, url: &str, header_row: usize) -> Result<Table> {
        info!(url, "fetching sheet");

        let response = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .with_context(|| format!("Failed to fetch URL: {}", url))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("HTTP request failed with status: {}", response.status()));
        }

        let content = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from: {}", url))?;

        let table = Table::from_csv_reader(&content[..], self.delimiter, header_row)
            .with_context(|| format!("Failed to parse CSV from: {}", url))?;
        log_loaded(url, &table);
        Ok(table)
    }
}

fn is_remote(location: &str) -> bool {
    let lower = location.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn log_loaded(source: &str, table: &Table) {
    if table.headers().is_empty() {
        warn!(source, "sheet has no header row");
    }
    info!(source, columns = table.headers().len(), rows = table.len(), "loaded sheet");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn urls_are_recognised_by_scheme() {
        assert!(is_remote("https://example.org/apps.csv"));
        assert!(is_remote(" HTTP://example.org/apps.csv"));
        assert!(!is_remote("data-source/apps.csv"));
        assert!(!is_remote("httpdata/apps.csv"));
    }

    #[test]
    fn load_file_reads_semicolon_sheet_below_title_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Nominations 2025;;").unwrap();
        writeln!(file, "ID code;ALL;BC").unwrap();
        writeln!(file, "A;2;1").unwrap();

        let loader = TableLoader::new(b';');
        let table = loader.load_file(file.path().to_str().unwrap(), 1).unwrap();

        assert_eq!(table.headers(), &["ID code", "ALL", "BC"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, 1), "2");
    }

    #[test]
    fn missing_file_error_names_the_path() {
        let loader = TableLoader::new(b',');
        let err = loader.load_file("does/not/exist.csv", 0).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.csv"));
    }
}
