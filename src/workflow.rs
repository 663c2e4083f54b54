use crate::allocator::NominationAllocator;
use crate::columns::ColumnMap;
use crate::cycles::CycleReport;
use crate::error::WorkflowError;
use crate::models::Stage;
use crate::table::Table;
use tracing::info;

/// Row counts recorded after a step finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub stage: Stage,
    /// Pass over steps 3-6 this run belonged to, starting at 1.
    pub iteration: usize,
    pub working_rows_before: usize,
    pub working_rows_after: usize,
    pub result_rows: Option<usize>,
}

/// One nomination session: the uploaded sheets, their column maps and the
/// state produced by every step run so far.
///
/// Steps run strictly in order. When step 6 removes rows the session goes
/// back to step 3 for another pass; it is finished once a step 6 run removes
/// nothing. A failing step leaves the state unchanged so the caller can fix
/// the mapping and try again.
#[derive(Debug, Clone)]
pub struct Workflow {
    capacity_columns: ColumnMap,
    application_columns: ColumnMap,
    capacities: Table,
    applications: Table,
    adjusted_capacities: Option<Table>,
    accepted: Option<Table>,
    working: Option<Table>,
    result_table: Option<Table>,
    cycle_reports: Vec<CycleReport>,
    history: Vec<StepSummary>,
}

impl Workflow {
    pub fn new(capacities: Table, applications: Table, capacity_columns: ColumnMap, application_columns: ColumnMap) -> Self {
        Self {
            capacity_columns,
            application_columns,
            capacities,
            applications,
            adjusted_capacities: None,
            accepted: None,
            working: None,
            result_table: None,
            cycle_reports: Vec::new(),
            history: Vec::new(),
        }
    }

    /// The step that would run next, `None` once step 6 stopped changing
    /// the working sheet.
    pub fn next_stage(&self) -> Option<Stage> {
        match self.history.last() {
            None => Some(Stage::Occupancy),
            Some(summary) if summary.stage == Stage::CycleResolution => {
                (summary.working_rows_after < summary.working_rows_before).then_some(Stage::OrderNormalization)
            }
            Some(summary) => summary.stage.next(),
        }
    }

    /// Current pass over steps 3-6. Every step 6 run that removed rows
    /// starts a new pass.
    pub fn iteration(&self) -> usize {
        1 + self
            .history
            .iter()
            .filter(|summary| {
                summary.stage == Stage::CycleResolution && summary.working_rows_after < summary.working_rows_before
            })
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.next_stage().is_none()
    }

    pub fn run_next_step(&mut self) -> Result<Stage, WorkflowError> {
        let stage = self.next_stage().ok_or(WorkflowError::Finished)?;
        self.run(stage)?;
        Ok(stage)
    }

    /// Run every pending step up to and including `last`. With `last` set to
    /// step 6 this repeats steps 3-6 until nothing more is removed; every
    /// repeated pass removes at least one row, so the loop terminates.
    pub fn run_through(&mut self, last: Stage) -> Result<(), WorkflowError> {
        while let Some(stage) = self.next_stage() {
            if stage > last {
                break;
            }
            self.run(stage)?;
        }
        Ok(())
    }

    /// Run exactly `stage`, which must be the next pending step.
    pub fn run(&mut self, stage: Stage) -> Result<(), WorkflowError> {
        let pending = self.next_stage().ok_or(WorkflowError::Finished)?;
        if stage != pending {
            return Err(WorkflowError::OutOfOrder {
                requested: stage,
                pending,
            });
        }

        let iteration = self.iteration();
        info!(iteration, "running {}", stage);
        let allocator = NominationAllocator::new(&self.capacity_columns, &self.application_columns);
        let before = self.working.as_ref().map_or(self.applications.len(), Table::len);
        let working = self.working.as_ref().unwrap_or(&self.applications);
        let capacities = self.adjusted_capacities.as_ref().unwrap_or(&self.capacities);

        match stage {
            Stage::Occupancy => {
                let occupancy = allocator.compute_occupancy(&self.capacities, &self.applications)?;
                self.adjusted_capacities = Some(occupancy.capacities);
                self.accepted = Some(occupancy.accepted);
                self.working = Some(self.applications.clone());
            }
            Stage::DuplicateFilter => {
                self.working = Some(allocator.filter_duplicates_by_priority(working)?);
            }
            Stage::OrderNormalization => {
                self.working = Some(allocator.normalize_ordering(working)?);
            }
            Stage::Selection => {
                self.result_table = Some(allocator.build_result_table(working, capacities)?);
            }
            Stage::NominationUpdate => {
                let result_table = self.result_table.as_ref().ok_or(WorkflowError::OutOfOrder {
                    requested: stage,
                    pending: Stage::Selection,
                })?;
                let (updated, updated_result) = allocator.update_nominations(working, result_table)?;
                self.working = Some(updated);
                self.result_table = Some(updated_result);
            }
            Stage::CycleResolution => {
                let resolution = allocator.resolve_cycles(working, capacities)?;
                let removed = before - resolution.working.len();
                if removed > 0 {
                    info!(iteration, removed, "cycle resolution removed rows, another pass follows");
                } else {
                    info!(iteration, "cycle resolution removed nothing, workflow finished");
                }
                self.working = Some(resolution.working);
                self.cycle_reports.push(resolution.report);
            }
        }

        self.history.push(StepSummary {
            stage,
            iteration,
            working_rows_before: before,
            working_rows_after: self.working.as_ref().map_or(0, Table::len),
            result_rows: self.result_table.as_ref().map(Table::len),
        });
        Ok(())
    }

    pub fn capacity_columns(&self) -> &ColumnMap {
        &self.capacity_columns
    }

    pub fn application_columns(&self) -> &ColumnMap {
        &self.application_columns
    }

    pub fn capacities(&self) -> &Table {
        &self.capacities
    }

    pub fn applications(&self) -> &Table {
        &self.applications
    }

    pub fn adjusted_capacities(&self) -> Option<&Table> {
        self.adjusted_capacities.as_ref()
    }

    pub fn accepted(&self) -> Option<&Table> {
        self.accepted.as_ref()
    }

    pub fn working(&self) -> Option<&Table> {
        self.working.as_ref()
    }

    pub fn result_table(&self) -> Option<&Table> {
        self.result_table.as_ref()
    }

    /// Report of the latest step 6 run.
    pub fn cycle_report(&self) -> Option<&CycleReport> {
        self.cycle_reports.last()
    }

    /// One report per step 6 run, in pass order.
    pub fn cycle_reports(&self) -> &[CycleReport] {
        &self.cycle_reports
    }

    pub fn history(&self) -> &[StepSummary] {
        &self.history
    }
}
