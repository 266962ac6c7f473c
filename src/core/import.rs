//! Project import from CSV documents, one document per table.
//!
//! Documents are named after their table (`machines`, `routings`, `products`,
//! `setup_matrix`, `jobs`, `demand`, `calendars`, `operators`). Header and
//! parse problems are reported per document with 1-based CSV line numbers,
//! the header being line 1. Semantic checks stay in `validate_project`.

use super::error::{SimError, SimResult};
use super::project::{
    DemandStream, JobSpec, MachineSpec, OperatorSpec, ProjectConfig, Product, Route, RouteStep, SetupEntry,
    TimeWindow,
};
use super::types::SimTime;
use super::validation::ValidationReport;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const HEADER: &str = "<header>";
const ROW: &str = "<row>";
const FILE: &str = "<file>";

/// Raw text of one CSV table
#[derive(Debug, Clone, PartialEq)]
pub struct CsvDocument {
    pub name: String,
    pub content: String,
}

impl CsvDocument {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Table name: lower case, without a `.csv` suffix
    fn table(&self) -> String {
        let name = self.name.to_ascii_lowercase();
        name.strip_suffix(".csv").map(str::to_string).unwrap_or(name)
    }
}

/// Every `*.csv` file of `dir`, named after the file stem, sorted by name
pub fn read_csv_dir(dir: impl AsRef<Path>) -> SimResult<Vec<CsvDocument>> {
    let mut documents = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        documents.push(CsvDocument::new(stem, fs::read_to_string(&path)?));
    }
    documents.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("read {} csv document(s) from {}", documents.len(), dir.as_ref().display());
    Ok(documents)
}

#[derive(Debug, Deserialize)]
struct MachineRow {
    machine_id: String,
    cell_id: String,
    #[serde(default)]
    machine_group_id: Option<String>,
    #[serde(default)]
    capacity: Option<u32>,
    #[serde(default)]
    mtbf: Option<SimTime>,
    #[serde(default)]
    mttr: Option<SimTime>,
    #[serde(default)]
    deterministic_repair: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RoutingRow {
    route_id: String,
    step_number: u32,
    machine_group_id: String,
    process_time_mean: SimTime,
    #[serde(default)]
    process_time_sd: Option<SimTime>,
    #[serde(default)]
    yield_rate: Option<f64>,
    #[serde(default)]
    is_inspection: Option<bool>,
    #[serde(default)]
    rework_probability: Option<f64>,
    #[serde(default)]
    rework_target_step: Option<u32>,
    #[serde(default)]
    family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetupRow {
    #[serde(default)]
    from_family: Option<String>,
    to_family: String,
    setup_time: SimTime,
}

#[derive(Debug, Deserialize)]
struct JobRow {
    job_id: String,
    product_id: String,
    #[serde(default)]
    release_time: Option<SimTime>,
    due_date: SimTime,
}

#[derive(Debug, Deserialize)]
struct DemandRow {
    product_id: String,
    count: u32,
    interarrival_mean: SimTime,
    due_offset: SimTime,
    #[serde(default)]
    start: Option<SimTime>,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    machine_id: String,
    start: SimTime,
    end: SimTime,
}

#[derive(Debug, Deserialize)]
struct OperatorRow {
    operator_id: String,
    /// Machine groups separated by `;`
    #[serde(default)]
    skills: Option<String>,
    #[serde(default)]
    shift_start: Option<SimTime>,
    #[serde(default)]
    shift_end: Option<SimTime>,
}

/// Parse the rows of one document. Header problems skip the whole document.
fn read_rows<T: DeserializeOwned>(
    doc: &CsvDocument,
    required: &[&str],
    report: &mut ValidationReport,
) -> Vec<(Option<usize>, T)> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(doc.content.as_bytes());
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(e) => {
            report.error(&doc.name, Some(1), HEADER, e.to_string());
            return Vec::new();
        }
    };

    let errors_before = report.errors.len();
    if headers.iter().any(str::is_empty) {
        report.error(&doc.name, Some(1), HEADER, "empty or missing header column");
    }
    for column in required.iter().filter(|c| !headers.iter().any(|h| h == **c)) {
        report.error(&doc.name, Some(1), column, "required column missing");
    }
    if report.errors.len() > errors_before {
        return Vec::new();
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let row = e.position().map(|p| p.line() as usize);
                report.error(&doc.name, row, ROW, e.to_string());
                continue;
            }
        };
        let row = record.position().map(|p| p.line() as usize);
        match record.deserialize::<T>(Some(&headers)) {
            Ok(value) => rows.push((row, value)),
            Err(e) => {
                let column = match e.kind() {
                    csv::ErrorKind::Deserialize { err, .. } => {
                        err.field().and_then(|i| headers.get(i as usize)).unwrap_or(ROW)
                    }
                    _ => ROW,
                };
                report.error(&doc.name, row, column, e.to_string());
            }
        }
    }
    rows
}

fn split_skills(skills: Option<&str>) -> Vec<String> {
    skills
        .unwrap_or("")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build a project from CSV tables.
///
/// Returns `InvalidProject` with every header and row problem found; the
/// resulting project still has to pass `validate_project`.
pub fn import_project(project_id: &str, documents: &[CsvDocument]) -> SimResult<ProjectConfig> {
    let mut report = ValidationReport::new();
    let mut project = ProjectConfig::new(project_id);
    let by_table: HashMap<String, &CsvDocument> = documents.iter().map(|d| (d.table(), d)).collect();

    for table in ["machines", "routings", "products"] {
        if !by_table.contains_key(table) {
            report.error(table, None, FILE, "required document missing");
        }
    }
    for doc in documents {
        let table = doc.table();
        if !matches!(
            table.as_str(),
            "machines" | "routings" | "products" | "setup_matrix" | "jobs" | "demand" | "calendars" | "operators"
        ) {
            report.warning(&doc.name, None, FILE, format!("unknown table '{}' ignored", table));
        }
    }

    if let Some(doc) = by_table.get("machines") {
        for (_, row) in read_rows::<MachineRow>(doc, &["machine_id", "cell_id"], &mut report) {
            let mut machine = MachineSpec::new(row.machine_id, row.cell_id);
            machine.machine_group_id = row.machine_group_id.filter(|g| !g.is_empty());
            machine.capacity = row.capacity.unwrap_or(1);
            machine.mtbf = row.mtbf;
            machine.mttr = row.mttr;
            machine.deterministic_repair = row.deterministic_repair.unwrap_or(false);
            project.machines.push(machine);
        }
    }

    if let Some(doc) = by_table.get("calendars") {
        for (row_number, row) in read_rows::<CalendarRow>(doc, &["machine_id", "start", "end"], &mut report) {
            match project.machines.iter_mut().find(|m| m.id == row.machine_id) {
                Some(machine) => machine.pm_windows.push(TimeWindow::new(row.start, row.end)),
                None => report.error(
                    &doc.name,
                    row_number,
                    "machine_id",
                    format!("unknown machine '{}'", row.machine_id),
                ),
            }
        }
    }

    if let Some(doc) = by_table.get("routings") {
        let required = ["route_id", "step_number", "machine_group_id", "process_time_mean"];
        for (_, row) in read_rows::<RoutingRow>(doc, &required, &mut report) {
            let mut step = RouteStep::new(row.step_number, row.machine_group_id, row.process_time_mean);
            step.process_time_sd = row.process_time_sd.unwrap_or(0.0);
            step.yield_rate = row.yield_rate.unwrap_or(1.0);
            step.is_inspection = row.is_inspection.unwrap_or(false);
            step.rework_probability = row.rework_probability.unwrap_or(0.0);
            step.rework_target_step = row.rework_target_step;
            step.family = row.family.filter(|f| !f.is_empty());
            // Steps keep file order within each route.
            match project.routes.iter_mut().find(|r| r.route_id == row.route_id) {
                Some(route) => route.steps.push(step),
                None => project.routes.push(Route::new(row.route_id, vec![step])),
            }
        }
    }

    if let Some(doc) = by_table.get("products") {
        for (_, row) in read_rows::<Product>(doc, &["product_id", "family_id", "route_id"], &mut report) {
            project.products.push(row);
        }
    }

    if let Some(doc) = by_table.get("setup_matrix") {
        for (_, row) in read_rows::<SetupRow>(doc, &["to_family", "setup_time"], &mut report) {
            project.setup_matrix.push(SetupEntry {
                from_family: row.from_family.filter(|f| !f.is_empty()),
                to_family: row.to_family,
                setup_time: row.setup_time,
            });
        }
    }

    if let Some(doc) = by_table.get("jobs") {
        for (_, row) in read_rows::<JobRow>(doc, &["job_id", "product_id", "due_date"], &mut report) {
            project
                .jobs
                .push(JobSpec::new(row.job_id, row.product_id, row.release_time.unwrap_or(0.0), row.due_date));
        }
    }

    if let Some(doc) = by_table.get("demand") {
        let required = ["product_id", "count", "interarrival_mean", "due_offset"];
        for (_, row) in read_rows::<DemandRow>(doc, &required, &mut report) {
            project.demand.push(DemandStream {
                product_id: row.product_id,
                count: row.count,
                interarrival_mean: row.interarrival_mean,
                due_offset: row.due_offset,
                start: row.start.unwrap_or(0.0),
            });
        }
    }

    if let Some(doc) = by_table.get("operators") {
        for (row_number, row) in read_rows::<OperatorRow>(doc, &["operator_id"], &mut report) {
            let index = match project.operators.iter().position(|o| o.id == row.operator_id) {
                Some(index) => index,
                None => {
                    project.operators.push(OperatorSpec::new(row.operator_id.clone(), &[]));
                    project.operators.len() - 1
                }
            };
            let operator = &mut project.operators[index];
            for skill in split_skills(row.skills.as_deref()) {
                if !operator.skills.contains(&skill) {
                    operator.skills.push(skill);
                }
            }
            match (row.shift_start, row.shift_end) {
                (Some(start), Some(end)) => operator.shifts.push(TimeWindow::new(start, end)),
                (None, None) => {}
                _ => report.error(&doc.name, row_number, "shift_end", "shift needs both start and end"),
            }
        }
    }

    for issue in &report.warnings {
        warn!("import {}: {}", project_id, issue);
    }
    if !report.is_valid() {
        return Err(SimError::InvalidProject { report });
    }
    debug!(
        "imported {}: {} machine(s), {} route(s), {} product(s), {} job(s)",
        project_id,
        project.machines.len(),
        project.routes.len(),
        project.products.len(),
        project.jobs.len()
    );
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::project::validate_project;

    fn documents() -> Vec<CsvDocument> {
        vec![
            CsvDocument::new(
                "machines",
                "machine_id,cell_id,machine_group_id,capacity,mtbf,mttr\n\
                 M1,C1,,1,,\n\
                 M2,C2,LATHE,2,40,1.5\n",
            ),
            CsvDocument::new("calendars.csv", "machine_id,start,end\nM1,4,6\n"),
            CsvDocument::new(
                "routings",
                "route_id,step_number,machine_group_id,process_time_mean,process_time_sd,is_inspection,rework_probability\n\
                 R1,10,M1,2.0,0.2,,\n\
                 R1,20,LATHE,1.0,,true,0.1\n",
            ),
            CsvDocument::new("products", "product_id,family_id,route_id\nP1,F1,R1\n"),
            CsvDocument::new("setup_matrix", "from_family,to_family,setup_time\n,F1,0.5\n"),
            CsvDocument::new("jobs", "job_id,product_id,release_time,due_date\nJ1,P1,,10\nJ2,P1,1,12\n"),
            CsvDocument::new("demand", "product_id,count,interarrival_mean,due_offset\nP1,3,2.0,8\n"),
            CsvDocument::new(
                "operators",
                "operator_id,skills,shift_start,shift_end\nO1,M1;LATHE,0,8\nO1,,16,24\n",
            ),
        ]
    }

    fn rejected(docs: &[CsvDocument]) -> ValidationReport {
        match import_project("csv", docs) {
            Err(SimError::InvalidProject { report }) => report,
            other => panic!("expected invalid project, got {:?}", other),
        }
    }

    #[test]
    fn test_import_builds_valid_project() {
        let project = import_project("csv", &documents()).unwrap();
        assert!(validate_project(&project).is_valid());

        assert_eq!(project.machines.len(), 2);
        assert_eq!(project.machines[0].machine_group_id, None);
        assert_eq!(project.machines[0].pm_windows, vec![TimeWindow::new(4.0, 6.0)]);
        assert_eq!(project.machines[1].group(), "LATHE");
        assert_eq!(project.machines[1].capacity, 2);
        assert_eq!(project.machines[1].mttr, Some(1.5));

        let route = project.route("R1").unwrap();
        assert_eq!(route.steps.len(), 2);
        assert!((route.steps[0].process_time_sd - 0.2).abs() < 1e-12);
        assert!(route.steps[1].is_inspection);

        assert_eq!(project.setup_matrix[0].from_family, None);
        assert_eq!(project.jobs[0].release_time, 0.0);
        assert_eq!(project.demand[0].count, 3);
        assert_eq!(project.operators.len(), 1);
        assert_eq!(project.operators[0].skills, vec!["M1".to_string(), "LATHE".to_string()]);
        assert_eq!(project.operators[0].shifts.len(), 2);
    }

    #[test]
    fn test_bad_cells_are_located() {
        let mut docs = documents();
        docs[2] = CsvDocument::new(
            "routings",
            "route_id,step_number,machine_group_id,process_time_mean\nR1,10,M1,2.0\nR1,twenty,M1,1.0\n",
        );
        let report = rejected(&docs);
        assert_eq!(report.errors.len(), 1);
        let issue = &report.errors[0];
        assert_eq!(issue.file, "routings");
        assert_eq!(issue.row, Some(3));
        assert_eq!(issue.column.as_deref(), Some("step_number"));
    }

    #[test]
    fn test_header_problems_reported_on_first_line() {
        let mut docs = documents();
        docs[3] = CsvDocument::new("products", "product_id,,route_id\nP1,F1,R1\n");
        docs[5] = CsvDocument::new("jobs", "job_id,product_id\nJ1,P1\n");
        let report = rejected(&docs);
        let located: Vec<_> = report
            .errors
            .iter()
            .map(|e| (e.file.as_str(), e.row, e.column.as_deref()))
            .collect();
        assert!(located.contains(&("products", Some(1), Some("<header>"))));
        assert!(located.contains(&("products", Some(1), Some("family_id"))));
        assert!(located.contains(&("jobs", Some(1), Some("due_date"))));
    }

    #[test]
    fn test_missing_tables_and_unknown_references() {
        let docs = vec![
            CsvDocument::new("machines", "machine_id,cell_id\nM1,C1\n"),
            CsvDocument::new("calendars", "machine_id,start,end\nM9,0,1\n"),
            CsvDocument::new("yields", "product_id,yield_rate\nP1,0.9\n"),
        ];
        let report = rejected(&docs);
        assert!(report.errors.iter().any(|e| e.file == "routings" && e.row.is_none()));
        assert!(report.errors.iter().any(|e| e.file == "products" && e.row.is_none()));
        assert!(report
            .errors
            .iter()
            .any(|e| e.file == "calendars" && e.row == Some(2) && e.message.contains("M9")));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].file, "yields");
    }

    #[test]
    fn test_half_open_shift_rejected() {
        let mut docs = documents();
        docs[7] = CsvDocument::new("operators", "operator_id,skills,shift_start,shift_end\nO1,M1,0,\n");
        let report = rejected(&docs);
        assert_eq!(report.errors[0].row, Some(2));
        assert_eq!(report.errors[0].column.as_deref(), Some("shift_end"));
    }

    #[test]
    fn test_read_csv_dir() {
        let dir = tempfile::tempdir().unwrap();
        for doc in documents() {
            let file = format!("{}.csv", doc.table());
            fs::write(dir.path().join(file), &doc.content).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let docs = read_csv_dir(dir.path()).unwrap();
        assert_eq!(docs.len(), 8);
        assert_eq!(docs[0].name, "calendars");
        let project = import_project("dir", &docs).unwrap();
        assert_eq!(project.products.len(), 1);
    }
}
