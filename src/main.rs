use hmlv_sim::{
    import_project, read_csv_dir, run_simulation, validate_project, FileArtifactStore, ProjectConfig, RunManifest,
    RunStatus, ScenarioConfig, SimError,
};
use std::fs;
use std::path::Path;
use std::process::ExitCode;

const USAGE: &str = "usage: hmlv-sim <project.json | csv_dir> <scenario.json> [artifact_dir]";

/// A directory is imported as CSV tables named after the directory
fn load_project(path: &str) -> Result<ProjectConfig, SimError> {
    let path = Path::new(path);
    if path.is_dir() {
        let project_id = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("project");
        return import_project(project_id, &read_csv_dir(path)?);
    }
    ProjectConfig::from_json(&fs::read_to_string(path)?)
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::from(2));
    }

    let project = match load_project(&args[0]) {
        Ok(project) => project,
        Err(SimError::InvalidProject { report }) => {
            for issue in &report.errors {
                eprintln!("{}", issue);
            }
            eprintln!("{}", report.summary());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };
    let scenario = ScenarioConfig::from_json(&fs::read_to_string(&args[1])?)?;
    let artifact_dir = args.get(2).map(String::as_str).unwrap_or("artifacts");

    let report = validate_project(&project);
    for issue in &report.warnings {
        log::warn!("{}", issue);
    }
    if !report.is_valid() {
        for issue in &report.errors {
            eprintln!("{}", issue);
        }
        eprintln!("{}", report.summary());
        return Ok(ExitCode::FAILURE);
    }

    println!("Project {} / scenario {}", project.project_id, scenario.label());

    let store = FileArtifactStore::new(artifact_dir);
    let manifest = RunManifest::for_scenario(project.project_id.clone(), scenario);
    let handle = run_simulation(&project, &manifest, &store, None);

    match (&handle.status, &handle.report) {
        (RunStatus::Completed, Some(kpis)) => {
            println!("Run {} completed", handle.run_id);
            for row in kpis.to_table() {
                println!("  {:<28} {:>12.4}", row.metric, row.value);
            }
            println!("Artifacts written to {}/{}", artifact_dir, handle.run_id);
            Ok(ExitCode::SUCCESS)
        }
        (status, _) => {
            eprintln!("Run {} ended with {:?}", handle.run_id, status);
            Ok(ExitCode::FAILURE)
        }
    }
}
