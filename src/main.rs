use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use nomination_allocator::columns::{application, capacity, ColumnMap};
use nomination_allocator::cycles::CycleVerdict;
use nomination_allocator::models::{Config, Stage};
use nomination_allocator::report;
use nomination_allocator::source::TableLoader;
use nomination_allocator::workflow::Workflow;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("nomination-allocator")
        .version("1.0")
        .about("Allocates exchange nominations from capacity and application sheets")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("capacities")
                .long("capacities")
                .value_name("SRC")
                .help("Capacity sheet (CSV path or http(s) URL), overrides the config"),
        )
        .arg(
            Arg::new("applications")
                .long("applications")
                .value_name("SRC")
                .help("Application sheet (CSV path or http(s) URL), overrides the config"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory, overrides the config"),
        )
        .arg(
            Arg::new("through")
                .long("through")
                .value_name("STEP")
                .value_parser(clap::value_parser!(u8).range(1..=6))
                .help("Last step to run (1-6)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v, -vv, -vvv)"),
        )
        .get_matches();

    init_logging(matches.get_count("verbose"));

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");

    // Load or create configuration
    let mut config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        Config::default().save_to_file(config_file)?;
        println!("⚠️  Please edit {} and set your input sheets, then run the program again.", config_file);
        return Ok(());
    };

    if let Some(source) = matches.get_one::<String>("capacities") {
        config.capacities_source = source.clone();
    }
    if let Some(source) = matches.get_one::<String>("applications") {
        config.applications_source = source.clone();
    }
    if let Some(dir) = matches.get_one::<String>("output") {
        config.output_directory = Some(dir.clone());
    }
    if let Some(&step) = matches.get_one::<u8>("through") {
        config.run_through_step = step;
    }

    let delimiter = config.delimiter_byte()?;
    let final_stage = config.final_stage()?;
    let output_dir = config.output_directory.as_deref().unwrap_or("output");

    println!("📂 Capacity sheet: {}", config.capacities_source);
    println!("📂 Application sheet: {}", config.applications_source);
    println!("📄 Output directory: {} (cleaned)", output_dir);
    println!("🎯 Running through {}", final_stage);

    let loader = TableLoader::new(delimiter);
    let capacities = loader
        .load(&config.capacities_source, config.capacities_header_row)
        .await?;
    let applications = loader
        .load(&config.applications_source, config.applications_header_row)
        .await?;
    println!(
        "   ✅ Loaded {} institutions and {} applications",
        capacities.len(),
        applications.len()
    );

    let capacity_columns = ColumnMap::resolve(capacity::FIELDS, capacities.headers(), &config.capacity_columns);
    let application_columns =
        ColumnMap::resolve(application::FIELDS, applications.headers(), &config.application_columns);

    let mut workflow = Workflow::new(capacities, applications, capacity_columns, application_columns);
    let outcome = workflow.run_through(final_stage);

    let output_path = Path::new(output_dir);
    let removed = report::clean_output_directory(output_path)?;
    if !removed.is_empty() {
        println!("🧹 Removed {} previous result files", removed.len());
    }
    let written = report::write_results(&workflow, output_path, delimiter)?;

    print_summary(&workflow);

    if let Err(e) = outcome {
        println!("❌ Error: {}", e);
        println!("   Results up to the last completed step were written to {}", output_dir);
        println!("   Adjust the column mapping in {} and run again.", config_file);
        return Ok(());
    }

    println!("\n✅ Nomination complete!");
    println!("📂 {} files written to {}", written.len(), output_dir);
    Ok(())
}

fn print_summary(workflow: &Workflow) {
    println!("\n📊 SUMMARY");
    println!("==========\n");

    for step in workflow.history() {
        if step.stage == Stage::CycleResolution {
            println!(
                "   ✔️  {} (iteration {}): removed {} rows",
                step.stage,
                step.iteration,
                step.working_rows_before - step.working_rows_after
            );
        } else {
            println!(
                "   ✔️  {}: {} -> {} working rows",
                step.stage, step.working_rows_before, step.working_rows_after
            );
        }
    }
    if let Some(stage) = workflow.next_stage() {
        println!("   ⏸️  Not run: {} and later", stage);
    }

    if let Some(result) = workflow.result_table() {
        println!("\n🏫 Nominated applications: {}", result.len());
    }

    for (index, report) in workflow.cycle_reports().iter().enumerate() {
        println!(
            "\n🔁 Cycle resolution, iteration {} (contested students: {}):",
            index + 1,
            report.contested.len()
        );
        if report.cycles.is_empty() {
            println!("   No blocking cycles found");
        }
        for cycle in &report.cycles {
            let icon = match cycle.verdict {
                CycleVerdict::Release => "🔓",
                CycleVerdict::Blocked => "🔒",
            };
            println!(
                "   {} {} ({:?}, {} rows removed)",
                icon,
                cycle.students.join(" -> "),
                cycle.verdict,
                cycle.removed_rows
            );
        }
        if report.stale_rejections > 0 {
            println!("   🗑️  Stale rejections removed: {}", report.stale_rejections);
        }
    }

    if workflow.next_stage() == Some(Stage::Occupancy) {
        println!("   ❓ No step completed");
    }
}
