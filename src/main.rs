use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use traverso::acoustic::fingering::FingeringChart;
use traverso::acoustic::tmm::TransferMatrixEngine;
use traverso::analyzer::metrics::{self, NoteMetrics};
use traverso::config::AppConfig;
use traverso::geometry::FluteRecord;
use traverso::optimize::OptimizationRun;

#[derive(Parser)]
#[command(name = "traverso", version, about = "Traverso flute geometry and embouchure chimney optimizer")]
struct Cli {
    /// Reference pitch of A in Hz (defaults to config, then 415)
    #[arg(long, global = true)]
    diapason: Option<f64>,

    /// Air temperature in Celsius (defaults to config, then 25)
    #[arg(long, global = true)]
    temperature: Option<f64>,

    /// Fingering chart file
    #[arg(long, global = true)]
    chart: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List flute directories under the data directory
    List,

    /// Validate a flute's part files and report errors and corrections
    Validate {
        /// Flute directory, or the name of one under the data directory
        flute: String,

        /// Write the corrected part files back
        #[arg(long)]
        write: bool,
    },

    /// Print the combined bore profile of a flute
    Combine {
        flute: String,

        /// Write the profile as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compute the admittance of every note and its intonation metrics
    Analyze {
        flute: String,

        /// Write the metrics as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Optimize the embouchure chimney height for every note
    Optimize {
        flute: String,

        /// Number of parallel workers (0 = auto-detect from config, 1 = sequential)
        #[arg(short = 'j', long, default_value = "1")]
        jobs: usize,

        /// Write the full run (heights, curves, mode shapes) as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();

    // CLI > config > built-in defaults
    let diapason = cli.diapason.unwrap_or(config.diapason_hz);
    let temperature = cli.temperature.unwrap_or(config.temperature_c);
    let data_dir = config.resolve_data_dir();
    log::info!("Data directory: {}", data_dir.display());

    match cli.command {
        Commands::List => {
            let flutes = traverso::geometry::io::list_flutes(&data_dir)
                .with_context(|| format!("Failed to list flutes in {}", data_dir.display()))?;
            if flutes.is_empty() {
                println!("No flutes found in {}.", data_dir.display());
                return Ok(());
            }
            for dir in flutes {
                let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                println!("{}", name);
            }
        }

        Commands::Validate { flute, write } => {
            let dir = resolve_flute_dir(&flute, &data_dir);
            let record = load_record(&dir, diapason, temperature)?;

            let report = record.report();
            for issue in &report.errors {
                println!("error:   {}", issue);
            }
            for issue in &report.warnings {
                println!("warning: {}", issue);
            }
            println!(
                "{}: {} errors, {} corrections, {} advisories",
                record.model,
                report.errors.len(),
                report.corrections().count(),
                report.advisories().count()
            );

            if write {
                traverso::geometry::io::save_flute_dir(&record, &dir)
                    .context("Failed to write corrected part files")?;
                println!("Wrote corrected part files to {}", dir.display());
            }
            if !record.is_valid() {
                anyhow::bail!("{} has {} validation errors", record.model, report.errors.len());
            }
        }

        Commands::Combine { flute, output } => {
            let dir = resolve_flute_dir(&flute, &data_dir);
            let record = load_record(&dir, diapason, temperature)?;
            record.ensure_valid().context("Flute is not valid")?;

            let points = record.combined_measurements();
            if let Some(path) = output {
                let json = serde_json::to_string_pretty(points)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {} points to {}", points.len(), path.display());
                return Ok(());
            }

            println!("{:>10} {:>9}  {:<10} {:>10}", "Pos (mm)", "Dia (mm)", "Part", "Rel (mm)");
            println!("{}", "-".repeat(43));
            for p in points {
                println!(
                    "{:>10.2} {:>9.2}  {:<10} {:>10.2}",
                    p.absolute_position, p.diameter, p.source_part.as_str(), p.source_relative_position
                );
            }
        }

        Commands::Analyze { flute, output } => {
            let dir = resolve_flute_dir(&flute, &data_dir);
            let mut record = load_record(&dir, diapason, temperature)?;
            let chart = load_chart(cli.chart.as_deref(), &config, &data_dir, &dir)?;
            let notes = chart.notes().to_vec();

            let settings = traverso::analyzer::AnalysisSettings {
                progress: true,
                ..config.analysis_settings()
            };
            let engine = TransferMatrixEngine::default();
            let result = traverso::analyzer::analyze_record(&mut record, chart, &engine, &settings)
                .context("Analysis failed")?;
            println!(
                "Analysis complete: {} notes over {} frequencies",
                result.analyzed, result.frequencies
            );

            let rows = metrics::metrics_table(
                record.analysis(),
                notes.iter().map(String::as_str),
                &config.semitone_table(),
                record.diapason_hz,
            );

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&rows)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote metrics to {}", path.display());
            }
            print_metrics_table(&rows);
        }

        Commands::Optimize { flute, jobs, output } => {
            let dir = resolve_flute_dir(&flute, &data_dir);
            let record = load_record(&dir, diapason, temperature)?;
            let chart = load_chart(cli.chart.as_deref(), &config, &data_dir, &dir)?;

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let settings = traverso::optimize::OptimizerSettings {
                progress: true,
                ..config.optimizer_settings()
            };
            let engine = TransferMatrixEngine::default();
            let run = traverso::optimize::optimize_flute(
                &record,
                chart,
                &engine,
                &config.solver(),
                &config.semitone_table(),
                &settings,
                workers,
            )
            .context("Optimization failed")?;

            if let Some(path) = output {
                let json = run.to_json()?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote optimization run to {}", path.display());
            }
            print_heights_table(&run);
            println!(
                "Optimization complete: {} converged, {} failed",
                run.converged(),
                run.failed()
            );
        }
    }

    Ok(())
}

/// A path to an existing directory, or a flute name under the data directory.
fn resolve_flute_dir(flute: &str, data_dir: &Path) -> PathBuf {
    let path = PathBuf::from(flute);
    if path.is_dir() {
        path
    } else {
        data_dir.join(flute)
    }
}

fn load_record(dir: &Path, diapason: f64, temperature: f64) -> Result<FluteRecord> {
    FluteRecord::load(dir, diapason, temperature)
        .with_context(|| format!("Failed to load flute from {}", dir.display()))
}

/// Chart path: CLI > config > data directory > the flute directory's parent.
fn load_chart(
    cli_chart: Option<&Path>,
    config: &AppConfig,
    data_dir: &Path,
    flute_dir: &Path,
) -> Result<FingeringChart> {
    let path = cli_chart
        .map(Path::to_path_buf)
        .or_else(|| config.fingering_chart.clone())
        .or_else(|| {
            let candidate = data_dir.join(traverso::DEFAULT_FINGERING_CHART);
            candidate.is_file().then_some(candidate)
        })
        .or_else(|| {
            flute_dir
                .parent()
                .map(|p| p.join(traverso::DEFAULT_FINGERING_CHART))
        })
        .context("No fingering chart. Pass --chart or set fingering_chart in config.")?;
    log::info!("Fingering chart: {}", path.display());
    FingeringChart::from_path(&path)
        .with_context(|| format!("Failed to read fingering chart {}", path.display()))
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    match v {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}

fn print_metrics_table(rows: &[NoteMetrics]) {
    println!(
        "{:<6} {:>9} {:>9} {:>9} {:>7} {:>7} {:>6} {:>7} {:>7}",
        "Note", "Target", "f1", "f2", "Dev", "Inh", "MOC", "B_I", "ESPE"
    );
    println!("{}", "-".repeat(76));
    for r in rows {
        println!(
            "{:<6} {:>9} {:>9} {:>9} {:>7} {:>7} {:>6} {:>7} {:>7}",
            r.note,
            fmt_opt(r.target_hz, 2),
            fmt_opt(r.first_hz, 2),
            fmt_opt(r.second_hz, 2),
            fmt_opt(r.deviation_cents, 1),
            fmt_opt(r.inharmonicity_cents, 1),
            fmt_opt(r.moc, 3),
            fmt_opt(r.b_i_cents, 1),
            fmt_opt(r.espe_cents, 1),
        );
    }
    println!();
    println!("Frequencies in Hz, Dev/Inh/B_I/ESPE in cents");
}

fn print_heights_table(run: &OptimizationRun) {
    println!(
        "{} at A = {:.1} Hz, {:.1} C ({:?})",
        run.model, run.diapason_hz, run.temperature_c, run.observable
    );
    println!(
        "{:<6} {:>9} {:>10} {:>9} {:>7} {:>6}",
        "Note", "Target", "Height mm", "f1", "Dev", "f2/f1"
    );
    println!("{}", "-".repeat(52));
    for o in &run.notes {
        let height = if o.height_mm.is_nan() {
            "failed".to_string()
        } else {
            format!("{:.3}", o.height_mm)
        };
        println!(
            "{:<6} {:>9.2} {:>10} {:>9} {:>7} {:>6}",
            o.note,
            o.target_hz,
            height,
            fmt_opt(o.antiresonances_hz.first().copied(), 2),
            fmt_opt(o.deviation_cents, 1),
            fmt_opt(o.harmonicity, 3),
        );
    }
}
