use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capacities_source: String,
    pub applications_source: String,
    // 0 = first row holds the headers
    pub capacities_header_row: usize,
    pub applications_header_row: usize,
    pub delimiter: char,
    pub output_directory: Option<String>,
    /// Last pipeline step to run (1..=6).
    pub run_through_step: u8,
    pub capacity_columns: BTreeMap<String, String>,
    pub application_columns: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacities_source: "data-source/capacities.csv".to_string(),
            applications_source: "data-source/applications.csv".to_string(),
            capacities_header_row: 0,
            applications_header_row: 0,
            delimiter: ',',
            output_directory: Some("output".to_string()),
            run_through_step: 6,
            capacity_columns: BTreeMap::new(),
            application_columns: BTreeMap::from([
                // Example override: map the result-table "Institut" column to a source column
                ("Institut".to_string(), "unused".to_string()),
            ]),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }

    pub fn delimiter_byte(&self) -> anyhow::Result<u8> {
        u8::try_from(self.delimiter)
            .map_err(|_| anyhow::anyhow!("delimiter '{}' is not a single-byte character", self.delimiter))
    }

    pub fn final_stage(&self) -> anyhow::Result<Stage> {
        Stage::from_step(self.run_through_step)
            .ok_or_else(|| anyhow::anyhow!("run_through_step must be between 1 and 6, got {}", self.run_through_step))
    }
}

/// The six pipeline steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Occupancy,
    DuplicateFilter,
    OrderNormalization,
    Selection,
    NominationUpdate,
    CycleResolution,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Occupancy,
        Stage::DuplicateFilter,
        Stage::OrderNormalization,
        Stage::Selection,
        Stage::NominationUpdate,
        Stage::CycleResolution,
    ];

    pub fn step(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_step(step: u8) -> Option<Self> {
        Self::ALL.get(usize::from(step).checked_sub(1)?).copied()
    }

    pub fn next(self) -> Option<Self> {
        Self::from_step(self.step() + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Occupancy => "occupancy calculation",
            Stage::DuplicateFilter => "duplicate priority filter",
            Stage::OrderNormalization => "order normalization",
            Stage::Selection => "capacity-bounded selection",
            Stage::NominationUpdate => "nomination update",
            Stage::CycleResolution => "cycle resolution",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.step(), self.name())
    }
}

/// Coarse degree bucket used for per-degree capacity columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Degree {
    Bc,
    Mgr,
    Phd,
}

impl Degree {
    pub const ALL: [Degree; 3] = [Degree::Bc, Degree::Mgr, Degree::Phd];

    /// Map a free-text degree label onto its bucket, `None` when the label is unknown.
    pub fn normalize(label: &str) -> Option<Self> {
        match label.trim().to_uppercase().as_str() {
            "BC" | "BSC" | "BACHELOR" => Some(Degree::Bc),
            "MGR" | "MSC" | "MASTER" => Some(Degree::Mgr),
            "PHD" | "DR" | "DOCTOR" => Some(Degree::Phd),
            _ => None,
        }
    }

    /// Logical name of the capacity column holding this bucket.
    pub fn capacity_field(self) -> &'static str {
        match self {
            Degree::Bc => "BC",
            Degree::Mgr => "MGR",
            Degree::Phd => "PHD",
        }
    }
}

/// Tri-state `NOMINOVÁN` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nomination {
    Accepted,
    Rejected,
    Unset,
}

impl Nomination {
    pub fn parse(cell: &str) -> Self {
        let value = cell.trim();
        if value.eq_ignore_ascii_case("ANO") {
            Nomination::Accepted
        } else if value.eq_ignore_ascii_case("NE") {
            Nomination::Rejected
        } else {
            Nomination::Unset
        }
    }

    pub fn from_accepted(accepted: bool) -> Self {
        if accepted {
            Nomination::Accepted
        } else {
            Nomination::Rejected
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Nomination::Accepted => "ANO",
            Nomination::Rejected => "NE",
            Nomination::Unset => "",
        }
    }
}

/// Lenient numeric coercion: unparsable or empty cells are `None`.
pub fn parse_number(cell: &str) -> Option<f64> {
    cell.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Identifier cells are compared without surrounding whitespace.
pub fn normalize_id(cell: &str) -> &str {
    cell.trim()
}

/// Ascending order with missing values after every present one.
pub fn cmp_missing_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degree_lookup_is_case_insensitive_and_trimmed() {
        assert_eq!(Degree::normalize(" bsc "), Some(Degree::Bc));
        assert_eq!(Degree::normalize("Master"), Some(Degree::Mgr));
        assert_eq!(Degree::normalize("dr"), Some(Degree::Phd));
        assert_eq!(Degree::normalize("Bachelor's"), None);
        assert_eq!(Degree::normalize(""), None);
    }

    #[test]
    fn nomination_flag_parsing() {
        assert_eq!(Nomination::parse(" ano"), Nomination::Accepted);
        assert_eq!(Nomination::parse("Ne "), Nomination::Rejected);
        assert_eq!(Nomination::parse(""), Nomination::Unset);
        assert_eq!(Nomination::parse("maybe"), Nomination::Unset);
        assert_eq!(Nomination::from_accepted(false).as_str(), "NE");
    }

    #[test]
    fn numbers_accept_decimal_comma_and_reject_garbage() {
        assert_eq!(parse_number("3"), Some(3.0));
        assert_eq!(parse_number(" 2,5 "), Some(2.5));
        assert_eq!(parse_number("1.0"), Some(1.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn missing_values_sort_last() {
        let mut values = vec![None, Some(2.0), Some(1.0), None];
        values.sort_by(|a, b| cmp_missing_last(*a, *b));
        assert_eq!(values, vec![Some(1.0), Some(2.0), None, None]);
    }

    #[test]
    fn stage_steps_round_trip() {
        assert_eq!(Stage::from_step(1), Some(Stage::Occupancy));
        assert_eq!(Stage::from_step(6), Some(Stage::CycleResolution));
        assert_eq!(Stage::from_step(0), None);
        assert_eq!(Stage::from_step(7), None);
        assert_eq!(Stage::Selection.next(), Some(Stage::NominationUpdate));
        assert_eq!(Stage::CycleResolution.next(), None);
    }

    #[test]
    fn default_config_survives_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.run_through_step, 6);
        assert_eq!(parsed.delimiter_byte().unwrap(), b',');
        assert_eq!(parsed.final_stage().unwrap(), Stage::CycleResolution);
    }
}
