//! Step 6: resolution of mutual-blocking nomination cycles.
//!
//! A student is *contested* when they hold an accepted (`ANO`) row at one
//! institution and a rejected (`NE`) row at another. If `u` is rejected at an
//! institution where contested `v` is accepted, `u` is blocked by `v`, giving
//! the edge `u -> v` of the block graph. A cycle in that graph is a set of
//! students each waiting for a place held by the next one.
//!
//! For every cycle we ask what would happen if all members gave up their
//! accepted places: when each member's preferred pending application would
//! then fit within capacity, the accepted rows are released; otherwise the
//! pending rows are withdrawn and the current acceptances stay.

use crate::allocator::NominationAllocator;
use crate::capacity::CapacityIndex;
use crate::columns::application;
use crate::error::MissingColumnError;
use crate::models::{cmp_missing_last, normalize_id, parse_number, Nomination, Stage};
use crate::table::Table;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    /// Every member can settle on their best pending application; accepted rows are removed.
    Release,
    /// At least one member would not fit; pending rows are removed.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEdge {
    pub blocked: String,
    pub holder: String,
    pub institution: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCycle {
    /// Members in traversal order; each is blocked by the next, the last by the first.
    pub students: Vec<String>,
    pub verdict: CycleVerdict,
    pub removed_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub contested: Vec<String>,
    pub edges: Vec<BlockEdge>,
    pub cycles: Vec<ResolvedCycle>,
    /// Contested students not covered by any cycle.
    pub residual: Vec<String>,
    pub stale_rejections: usize,
}

impl CycleReport {
    pub fn removed_rows(&self) -> usize {
        self.cycles.iter().map(|c| c.removed_rows).sum::<usize>() + self.stale_rejections
    }
}

#[derive(Debug, Clone)]
pub struct CycleResolution {
    pub working: Table,
    pub report: CycleReport,
}

/// One working row, parsed once.
#[derive(Debug, Clone, Copy)]
struct Candidate<'t> {
    student: &'t str,
    institution: &'t str,
    nomination: Nomination,
    priority: Option<f64>,
    order: Option<f64>,
}

/// Row indices of the working sheet, indexed the ways step 6 needs.
struct Applications<'t> {
    rows: Vec<Candidate<'t>>,
    by_student: BTreeMap<&'t str, Vec<usize>>,
    by_institution: HashMap<&'t str, Vec<usize>>,
    accepted_at: HashMap<&'t str, Vec<usize>>,
}

impl<'t> Applications<'t> {
    fn new(rows: Vec<Candidate<'t>>) -> Self {
        let mut by_student: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        let mut by_institution: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut accepted_at: HashMap<&str, Vec<usize>> = HashMap::new();

        for (index, row) in rows.iter().enumerate() {
            if !row.student.is_empty() {
                by_student.entry(row.student).or_default().push(index);
            }
            by_institution.entry(row.institution).or_default().push(index);
            if row.nomination == Nomination::Accepted {
                accepted_at.entry(row.institution).or_default().push(index);
            }
        }

        Self {
            rows,
            by_student,
            by_institution,
            accepted_at,
        }
    }

    fn rows_of(&self, student: &str) -> &[usize] {
        self.by_student.get(student).map_or(&[][..], Vec::as_slice)
    }

    fn rows_with(&self, student: &str, nomination: Nomination) -> Vec<usize> {
        self.rows_of(student)
            .iter()
            .copied()
            .filter(|&row| self.rows[row].nomination == nomination)
            .collect()
    }

    /// Students with at least one `ANO` and one `NE` row, ascending.
    fn contested(&self) -> Vec<&'t str> {
        self.by_student
            .iter()
            .filter(|(_, rows)| {
                rows.iter().any(|&r| self.rows[r].nomination == Nomination::Accepted)
                    && rows.iter().any(|&r| self.rows[r].nomination == Nomination::Rejected)
            })
            .map(|(&student, _)| student)
            .collect()
    }
}

/// Directed "is blocked by" graph over contested students.
///
/// Students live in an arena sorted by id; neighbor lists are deduplicated and
/// ascending so that traversal is deterministic.
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    students: Vec<String>,
    neighbors: Vec<Vec<usize>>,
    edges: Vec<(usize, usize, String)>,
}

impl BlockGraph {
    fn build(applications: &Applications<'_>, contested: &[&str]) -> Self {
        let index: HashMap<&str, usize> = contested
            .iter()
            .enumerate()
            .map(|(i, &student)| (student, i))
            .collect();

        let mut edges = BTreeSet::new();
        let mut neighbors = vec![BTreeSet::new(); contested.len()];

        for (from, &student) in contested.iter().enumerate() {
            for row in applications.rows_with(student, Nomination::Rejected) {
                let institution = applications.rows[row].institution;
                if institution.is_empty() {
                    continue;
                }
                let holders = applications.accepted_at.get(institution).map_or(&[][..], Vec::as_slice);
                for &holder_row in holders {
                    let holder = applications.rows[holder_row].student;
                    if holder == student {
                        continue;
                    }
                    if let Some(&to) = index.get(holder) {
                        edges.insert((from, to, institution));
                        neighbors[from].insert(to);
                    }
                }
            }
        }

        Self {
            students: contested.iter().map(|s| s.to_string()).collect(),
            neighbors: neighbors.into_iter().map(|n| n.into_iter().collect()).collect(),
            edges: edges
                .into_iter()
                .map(|(from, to, institution)| (from, to, institution.to_string()))
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.students.len()
    }

    pub fn student(&self, node: usize) -> &str {
        &self.students[node]
    }

    pub fn edges(&self) -> impl Iterator<Item = BlockEdge> + '_ {
        self.edges.iter().map(|(from, to, institution)| BlockEdge {
            blocked: self.students[*from].clone(),
            holder: self.students[*to].clone(),
            institution: institution.clone(),
        })
    }

    /// Greedy, non-overlapping cycle cover.
    ///
    /// Traversals start from every uncovered node in ascending order; once a
    /// node belongs to a cycle it is ignored by all later traversals.
    pub fn find_cycles(&self) -> Vec<Vec<usize>> {
        let mut covered = vec![false; self.len()];
        let mut cycles = Vec::new();

        for start in 0..self.len() {
            if covered[start] {
                continue;
            }
            if let Some(cycle) = self.first_cycle_from(start, &covered) {
                for &node in &cycle {
                    covered[node] = true;
                }
                cycles.push(cycle);
            }
        }

        cycles
    }

    /// Depth-first search keeping the current path; the first edge back into
    /// the path closes a cycle, returned as the path suffix from that node.
    fn first_cycle_from(&self, start: usize, covered: &[bool]) -> Option<Vec<usize>> {
        let mut visited = vec![false; self.len()];
        let mut on_path = vec![false; self.len()];
        let mut path = vec![start];
        let mut cursor = vec![0usize];
        visited[start] = true;
        on_path[start] = true;

        while let Some(&node) = path.last() {
            let depth = path.len() - 1;
            let Some(&next) = self.neighbors[node].get(cursor[depth]) else {
                on_path[node] = false;
                path.pop();
                cursor.pop();
                continue;
            };
            cursor[depth] += 1;

            if covered[next] {
                continue;
            }
            if on_path[next] {
                let begin = path.iter().position(|&n| n == next)?;
                return Some(path[begin..].to_vec());
            }
            if !visited[next] {
                visited[next] = true;
                on_path[next] = true;
                path.push(next);
                cursor.push(0);
            }
        }

        None
    }
}

impl<'a> NominationAllocator<'a> {
    /// Step 6: detect block cycles among contested students, resolve each one
    /// by release or withdrawal, then drop stale rejections of the remaining
    /// contested students.
    pub fn resolve_cycles(&self, working: &Table, capacities: &Table) -> Result<CycleResolution, MissingColumnError> {
        let stage = Stage::CycleResolution;
        let [student_column, nominated_column, id_column, order_column] = self.application_columns.require(
            working,
            [application::STUDENT_ID, application::NOMINATED, application::ID_CODE, application::ORDER],
            stage,
        )?;
        let places = CapacityIndex::new(capacities, self.capacity_columns, stage)?;
        let priority_column = self.application_columns.index_in(working, application::PRIORITY);

        let applications = Applications::new(
            working
                .rows()
                .iter()
                .map(|row| Candidate {
                    student: normalize_id(&row[student_column]),
                    institution: normalize_id(&row[id_column]),
                    nomination: Nomination::parse(&row[nominated_column]),
                    priority: priority_column.and_then(|column| parse_number(&row[column])),
                    order: parse_number(&row[order_column]),
                })
                .collect(),
        );

        let contested = applications.contested();
        let graph = BlockGraph::build(&applications, &contested);
        debug!(contested = graph.len(), edges = graph.edges.len(), "built block graph");

        let mut remove = vec![false; working.len()];
        let mut covered = HashSet::new();
        let mut resolved = Vec::new();

        for cycle in graph.find_cycles() {
            let members: Vec<&str> = cycle.iter().map(|&node| graph.student(node)).collect();
            let verdict = if release_would_settle(&applications, &places, &members) {
                CycleVerdict::Release
            } else {
                CycleVerdict::Blocked
            };
            let dropped = match verdict {
                CycleVerdict::Release => Nomination::Accepted,
                CycleVerdict::Blocked => Nomination::Rejected,
            };

            let mut removed_rows = 0;
            for &member in &members {
                for row in applications.rows_with(member, dropped) {
                    remove[row] = true;
                    removed_rows += 1;
                }
                covered.insert(member);
            }

            info!(members = ?members, verdict = ?verdict, removed_rows, "resolved nomination cycle");
            resolved.push(ResolvedCycle {
                students: members.iter().map(|s| s.to_string()).collect(),
                verdict,
                removed_rows,
            });
        }

        let residual: Vec<&str> = contested
            .iter()
            .copied()
            .filter(|student| !covered.contains(student))
            .collect();

        let mut stale_rejections = 0;
        for &student in &residual {
            for row in applications.rows_with(student, Nomination::Rejected) {
                if !holders_can_move(&applications, student, applications.rows[row].institution) {
                    remove[row] = true;
                    stale_rejections += 1;
                }
            }
        }

        let report = CycleReport {
            contested: contested.iter().map(|s| s.to_string()).collect(),
            edges: graph.edges().collect(),
            cycles: resolved,
            residual: residual.iter().map(|s| s.to_string()).collect(),
            stale_rejections,
        };

        info!(
            cycles = report.cycles.len(),
            residual = report.residual.len(),
            stale_rejections,
            removed = report.removed_rows(),
            "resolved duplicate cycles"
        );

        Ok(CycleResolution {
            working: working.filter_rows(|row| !remove[row]),
            report,
        })
    }
}

/// Counterfactual check: with every member's `ANO` rows gone, does each
/// member's best-priority `NE` row rank within its institution's places?
fn release_would_settle(applications: &Applications<'_>, places: &CapacityIndex<'_>, members: &[&str]) -> bool {
    let member_set: HashSet<&str> = members.iter().copied().collect();
    let released =
        |row: usize| applications.rows[row].nomination == Nomination::Accepted && member_set.contains(applications.rows[row].student);

    for &member in members {
        let Some(best) = applications
            .rows_with(member, Nomination::Rejected)
            .into_iter()
            .min_by(|&a, &b| cmp_missing_last(applications.rows[a].priority, applications.rows[b].priority))
        else {
            continue;
        };

        let target = applications.rows[best];
        let capacity = places.available(target.institution);
        let ahead = applications
            .by_institution
            .get(target.institution)
            .map_or(&[][..], Vec::as_slice)
            .iter()
            .filter(|&&row| row != best && !released(row))
            .filter(|&&row| match (applications.rows[row].order, target.order) {
                (Some(theirs), Some(ours)) => theirs < ours,
                _ => false,
            })
            .count();

        debug!(member, institution = target.institution, capacity, ahead, "release check");
        if ahead as i64 >= capacity {
            return false;
        }
    }

    true
}

/// Whether any other accepted holder at `institution` has further
/// applications and might therefore still vacate the place.
fn holders_can_move(applications: &Applications<'_>, student: &str, institution: &str) -> bool {
    applications
        .accepted_at
        .get(institution)
        .map_or(&[][..], Vec::as_slice)
        .iter()
        .map(|&row| applications.rows[row].student)
        .filter(|&holder| holder != student)
        .any(|holder| applications.rows_of(holder).len() > 1)
}
