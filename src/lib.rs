//! Nomination of students to partner institutions.
//!
//! The workflow runs six steps over two sheets, a capacity sheet and an
//! application sheet: occupancy calculation, duplicate priority filter,
//! order normalization, capacity-bounded selection, nomination update and
//! cycle resolution. See [`workflow::Workflow`].

pub mod allocator;
pub mod capacity;
pub mod columns;
pub mod cycles;
pub mod error;
pub mod models;
pub mod report;
pub mod source;
pub mod table;
pub mod workflow;

pub use allocator::{NominationAllocator, Occupancy};
pub use columns::ColumnMap;
pub use cycles::{CycleReport, CycleResolution, CycleVerdict};
pub use error::{MissingColumnError, WorkflowError};
pub use models::{Config, Stage};
pub use table::Table;
pub use workflow::Workflow;
