//! Logical field names and their resolution to real sheet headers.
//!
//! Every stage talks about fields by their logical name (`"ID code"`,
//! `"NOMINOVÁN"`, ...). A [`ColumnMap`] translates those names into whatever
//! headers the uploaded sheet actually uses, or records that a field is not
//! used at all.

use crate::error::MissingColumnError;
use crate::models::Stage;
use crate::table::Table;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Capacity sheet (sheet 1).
pub mod capacity {
    pub const INSTITUTE: &str = "Institute";
    pub const COUNTRY: &str = "Country";
    pub const ID_CODE: &str = "ID code";
    pub const UNIVERSITY_NAME: &str = "University Name";
    pub const STUDY_PROGRAMME: &str = "Study programme";
    pub const STUDY_LANGUAGE: &str = "Study language (TBC)";
    pub const BC: &str = "BC";
    pub const MGR: &str = "MGR";
    pub const PHD: &str = "PHD";
    /// Aggregate capacity over all degrees.
    pub const ALL: &str = "ALL";
    pub const SPECIFICS: &str = "Specifics";

    pub const FIELDS: &[&str] = &[
        INSTITUTE,
        COUNTRY,
        ID_CODE,
        UNIVERSITY_NAME,
        STUDY_PROGRAMME,
        STUDY_LANGUAGE,
        BC,
        MGR,
        PHD,
        ALL,
        "IN BC",
        "IN MGR",
        "IN PHD",
        "IN ALL",
        SPECIFICS,
    ];
}

/// Application sheet (sheet 3).
pub mod application {
    pub const SOURCE_NAME: &str = "Zdroj.Název";
    pub const HOME_DEPARTMENT: &str = "Domácí katedra";
    /// University-wide student identifier. Not unique per row.
    pub const STUDENT_ID: &str = "Číslo UK";
    pub const APPLICATION_NUMBER: &str = "Číslo přihlášky";
    pub const ID_CODE: &str = "ID code";
    pub const DEGREE: &str = "Studying for degree";
    pub const PRIORITY: &str = "PRIORITA";
    pub const ORDER: &str = "Pořadí";
    pub const NOMINATED: &str = "NOMINOVÁN";
    pub const REMARK: &str = "POZNÁMKA";
    pub const USER_ID: &str = "UserID";

    pub const FIELDS: &[&str] = &[
        SOURCE_NAME,
        HOME_DEPARTMENT,
        STUDENT_ID,
        APPLICATION_NUMBER,
        "First Name(s)",
        "Family Name(s)",
        "Subject area",
        "Subject area2",
        "Zahraniční univerzita",
        ID_CODE,
        "Study programme",
        "Study branch",
        "From",
        "To",
        "E-mail",
        "Date of Birth",
        "Sex",
        "State Citizenship",
        DEGREE,
        "Years of study to date",
        "PRŮMĚR",
        PRIORITY,
        ORDER,
        NOMINATED,
        REMARK,
        "Filtr",
        "Index_Init",
        USER_ID,
        "Váha",
    ];
}

/// Fixed schema of the result table (sheet 5).
pub mod result {
    pub const INSTITUTION_ID: &str = "ID code";
    pub const STUDENT_ID: &str = "Číslo UK";
    pub const NOMINATED: &str = "NOMINOVÁN";

    pub const COLUMNS: [&str; 14] = [
        "Institut",
        "Domácí katedra",
        INSTITUTION_ID,
        "Subject area2",
        STUDENT_ID,
        "Číslo přihlášky",
        "Studying for degree",
        NOMINATED,
        "PRIORITA",
        "Pořadí",
        "Status přijetí",
        "Pomocné - důvod přijetí",
        "UserID",
        "Rozřazovací kolo",
    ];
}

/// Override values that mark a logical field as deliberately unmapped.
const UNUSED_MARKERS: &[&str] = &["", "unused", "<nepoužiť>"];

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace pattern"))
}

/// Collapse runs of whitespace and fold case so that `"ID  code"`,
/// `"id code"` and `"ID\ncode"` compare equal.
pub fn normalize_header(header: &str) -> String {
    whitespace()
        .replace_all(header.trim(), " ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    entries: BTreeMap<String, Option<String>>,
}

impl ColumnMap {
    /// Resolve each logical field against the sheet headers.
    ///
    /// Precedence: explicit override, exact header, normalized header, unmapped.
    /// Overrides for names outside `fields` are added as extra entries.
    pub fn resolve(fields: &[&str], headers: &[String], overrides: &BTreeMap<String, String>) -> Self {
        let mut entries = BTreeMap::new();

        for &field in fields {
            let column = match overrides.get(field) {
                Some(value) => override_target(value),
                None => match_header(field, headers),
            };
            entries.insert(field.to_string(), column);
        }

        for (field, value) in overrides {
            entries
                .entry(field.clone())
                .or_insert_with(|| override_target(value));
        }

        Self { entries }
    }

    /// Identity mapping: each field maps to a column of the same name.
    pub fn identity(fields: &[&str]) -> Self {
        Self {
            entries: fields
                .iter()
                .map(|f| (f.to_string(), Some(f.to_string())))
                .collect(),
        }
    }

    pub fn with(mut self, field: &str, column: Option<&str>) -> Self {
        self.entries
            .insert(field.to_string(), column.map(str::to_string));
        self
    }

    /// Mapped column name, or `None` when the field is unknown or unused.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.entries.get(field).and_then(|c| c.as_deref())
    }

    /// Column index of `field` in `table`, if it is mapped and present.
    pub fn index_in(&self, table: &Table, field: &str) -> Option<usize> {
        self.get(field).and_then(|column| table.column_index(column))
    }

    /// Resolve every field in `fields` against `table`, or report all the
    /// ones that cannot be found.
    pub fn require<const N: usize>(
        &self,
        table: &Table,
        fields: [&str; N],
        stage: Stage,
    ) -> Result<[usize; N], MissingColumnError> {
        let mut indices = [0usize; N];
        let mut missing = Vec::new();

        for (slot, field) in indices.iter_mut().zip(fields) {
            match self.index_in(table, field) {
                Some(index) => *slot = index,
                None => missing.push(field.to_string()),
            }
        }

        if missing.is_empty() {
            Ok(indices)
        } else {
            Err(MissingColumnError::new(stage, missing))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> + '_ {
        self.entries
            .iter()
            .map(|(field, column)| (field.as_str(), column.as_deref()))
    }

    pub fn unmapped(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, column)| column.is_none())
            .map(|(field, _)| field)
            .collect()
    }
}

fn override_target(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if UNUSED_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(trimmed)) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn match_header(field: &str, headers: &[String]) -> Option<String> {
    if let Some(exact) = headers.iter().find(|h| h.as_str() == field) {
        return Some(exact.clone());
    }

    let wanted = normalize_header(field);
    headers
        .iter()
        .find(|h| normalize_header(h) == wanted)
        .cloned()
}
