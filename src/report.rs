use crate::cycles::{CycleReport, CycleVerdict};
use crate::models::Stage;
use crate::table::Table;
use crate::workflow::Workflow;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

pub const CAPACITIES_INPUT: &str = "capacities_input.csv";
pub const CAPACITIES_ADJUSTED: &str = "capacities_adjusted.csv";
pub const APPLICATIONS_INPUT: &str = "applications_input.csv";
pub const ACCEPTED_APPLICATIONS: &str = "accepted_applications.csv";
pub const WORKING_SHEET: &str = "working_sheet.csv";
pub const RESULT_TABLE: &str = "result_table.csv";
pub const SUMMARY: &str = "summary.txt";

const OUTPUT_FILES: [&str; 7] = [
    CAPACITIES_INPUT,
    CAPACITIES_ADJUSTED,
    APPLICATIONS_INPUT,
    ACCEPTED_APPLICATIONS,
    WORKING_SHEET,
    RESULT_TABLE,
    SUMMARY,
];

/// Remove results of a previous run. Other files in the directory are left alone.
pub fn clean_output_directory(output_dir: &Path) -> Result<Vec<&'static str>> {
    let mut removed = Vec::new();
    if !output_dir.exists() {
        return Ok(removed);
    }

    for item in OUTPUT_FILES {
        let item_path = output_dir.join(item);
        if item_path.is_file() {
            fs::remove_file(&item_path).with_context(|| format!("Failed to remove {}", item_path.display()))?;
            debug!(file = item, "removed previous result");
            removed.push(item);
        }
    }

    Ok(removed)
}

/// Write every sheet the workflow has produced so far, plus `summary.txt`.
/// Returns the names of the written files.
pub fn write_results(workflow: &Workflow, output_dir: &Path, delimiter: u8) -> Result<Vec<&'static str>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let sheets: [(&'static str, Option<&Table>); 6] = [
        (CAPACITIES_INPUT, Some(workflow.capacities())),
        (CAPACITIES_ADJUSTED, workflow.adjusted_capacities()),
        (APPLICATIONS_INPUT, Some(workflow.applications())),
        (ACCEPTED_APPLICATIONS, workflow.accepted()),
        (WORKING_SHEET, workflow.working()),
        (RESULT_TABLE, workflow.result_table()),
    ];

    let mut written = Vec::new();
    for (name, table) in sheets {
        let Some(table) = table else {
            continue;
        };
        write_sheet(table, &output_dir.join(name), delimiter)?;
        written.push(name);
    }

    fs::write(output_dir.join(SUMMARY), summary_text(workflow))
        .with_context(|| format!("Failed to write {}", SUMMARY))?;
    written.push(SUMMARY);

    info!(files = written.len(), dir = %output_dir.display(), "exported results");
    Ok(written)
}

fn write_sheet(table: &Table, path: &Path, delimiter: u8) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    table
        .write_csv(BufWriter::new(file), delimiter)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Plain-text run report: step statistics, unmapped fields and cycle decisions.
pub fn summary_text(workflow: &Workflow) -> String {
    let mut content = String::new();
    content.push_str("Nomination Workflow Summary\n");
    content.push_str("===========================\n\n");

    let _ = writeln!(
        content,
        "Capacity sheet: {} institutions, {} columns",
        workflow.capacities().len(),
        workflow.capacities().headers().len()
    );
    let _ = writeln!(
        content,
        "Application sheet: {} rows, {} columns\n",
        workflow.applications().len(),
        workflow.applications().headers().len()
    );

    push_unmapped(&mut content, "capacity", workflow.capacity_columns().unmapped());
    push_unmapped(&mut content, "application", workflow.application_columns().unmapped());

    content.push_str("Steps:\n");
    if workflow.history().is_empty() {
        content.push_str("   (none run)\n");
    }
    for step in workflow.history() {
        let _ = write!(content, "   {}", step.stage);
        if step.stage >= Stage::OrderNormalization {
            let _ = write!(content, " [iteration {}]", step.iteration);
        }
        let _ = write!(
            content,
            ": working rows {} -> {}",
            step.working_rows_before, step.working_rows_after
        );
        if let Some(result_rows) = step.result_rows {
            let _ = write!(content, ", result rows {}", result_rows);
        }
        content.push('\n');
    }
    if let Some(stage) = workflow.next_stage() {
        let _ = writeln!(content, "   next: {}", stage);
    }
    content.push('\n');

    let passes = workflow.cycle_reports();
    if !passes.is_empty() {
        let _ = writeln!(content, "Passes over steps 3-6: {}\n", passes.len());
    }
    for (index, report) in passes.iter().enumerate() {
        push_cycle_report(&mut content, index + 1, report);
    }

    content
}

fn push_unmapped(content: &mut String, sheet: &str, fields: Vec<&str>) {
    if fields.is_empty() {
        return;
    }
    let _ = writeln!(content, "Unmapped {} fields: {}\n", sheet, fields.join(", "));
}

fn push_cycle_report(content: &mut String, iteration: usize, report: &CycleReport) {
    let _ = writeln!(content, "Cycle resolution (iteration {}):", iteration);
    let _ = writeln!(content, "   Contested students: {}", report.contested.len());
    let _ = writeln!(content, "   Block edges: {}", report.edges.len());
    for edge in &report.edges {
        let _ = writeln!(
            content,
            "      {} is blocked by {} at {}",
            edge.blocked, edge.holder, edge.institution
        );
    }

    let _ = writeln!(content, "   Cycles: {}", report.cycles.len());
    for cycle in &report.cycles {
        let decision = match cycle.verdict {
            CycleVerdict::Release => "accepted places released",
            CycleVerdict::Blocked => "pending applications withdrawn",
        };
        let _ = writeln!(
            content,
            "      {}: {} ({} rows removed)",
            cycle.students.join(" -> "),
            decision,
            cycle.removed_rows
        );
    }

    if !report.residual.is_empty() {
        let _ = writeln!(content, "   Outside any cycle: {}", report.residual.join(", "));
    }
    let _ = writeln!(content, "   Stale rejections removed: {}", report.stale_rejections);
    let _ = writeln!(content, "   Rows removed in total: {}\n", report.removed_rows());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{application, capacity, ColumnMap};

    fn workflow() -> Workflow {
        Workflow::new(
            Table::from_str_rows(&["ID code", "ALL"], &[&["X", "1"]]),
            Table::from_str_rows(
                &["Číslo UK", "ID code", "Studying for degree", "NOMINOVÁN", "PRIORITA", "Pořadí"],
                &[&["u", "X", "BC", "ANO", "1", "1"]],
            ),
            ColumnMap::identity(capacity::FIELDS),
            ColumnMap::identity(application::FIELDS).with(application::REMARK, None),
        )
    }

    #[test]
    fn summary_lists_pending_step_and_unmapped_fields() {
        let mut flow = workflow();
        flow.run_through(Stage::DuplicateFilter).unwrap();

        let text = summary_text(&flow);
        assert!(text.contains("step 1 (occupancy calculation): working rows 1 -> 1"));
        assert!(text.contains("next: step 3 (order normalization)"));
        assert!(text.contains("Unmapped application fields: POZNÁMKA"));
        assert!(!text.contains("Cycle resolution"));
    }

    #[test]
    fn summary_tags_repeatable_steps_with_their_pass() {
        let mut flow = workflow();
        flow.run_through(Stage::CycleResolution).unwrap();

        let text = summary_text(&flow);
        assert!(text.contains("step 2 (duplicate priority filter): working rows"));
        assert!(text.contains("step 6 (cycle resolution) [iteration 1]: working rows 1 -> 1"));
        assert!(text.contains("Passes over steps 3-6: 1"));
        assert!(text.contains("Cycle resolution (iteration 1):"));
        assert!(!text.contains("next:"));
    }

    #[test]
    fn only_produced_sheets_are_written_and_old_ones_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RESULT_TABLE), "stale").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let removed = clean_output_directory(dir.path()).unwrap();
        assert_eq!(removed, vec![RESULT_TABLE]);
        assert!(dir.path().join("notes.txt").exists());

        let mut flow = workflow();
        flow.run_next_step().unwrap();
        let written = write_results(&flow, dir.path(), b',').unwrap();

        assert_eq!(
            written,
            vec![CAPACITIES_INPUT, CAPACITIES_ADJUSTED, APPLICATIONS_INPUT, ACCEPTED_APPLICATIONS, WORKING_SHEET, SUMMARY]
        );
        assert!(!dir.path().join(RESULT_TABLE).exists());
    }
}
