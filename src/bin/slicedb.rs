//! slicedb: Load slices, run SQL and build aggregation views
//!
//! This tool works against an in-memory or file-backed DuckDB database
//! holding a `slices` table, supporting both one-shot scripts and
//! interactive mode.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use slicedb::columns::{fetch_view, ColumnData, TypedColumns};
use slicedb::engine::ScriptResult;
use slicedb::{
    add_debug_track, AggregationController, Area, AsyncSliceTrack, EngineConfig,
    PerformanceAggregation, QueryResult, SliceAggregation, SliceColumns, SliceTrack, TraceEngine,
    TrackEvent, TrackRegistry, ViewOutcome, ViewScheduler,
};

#[derive(Parser)]
#[command(name = "slicedb")]
#[command(about = "Load slices, run SQL and build aggregation views")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON engine configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to DuckDB database (overrides the config file; in-memory if unset)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run SQL against the database
    Query {
        /// SQL script to execute (if not provided, starts interactive mode)
        #[arg(short, long)]
        sql: Option<String>,

        /// Read the SQL script from a file
        #[arg(long, conflicts_with = "sql")]
        file: Option<PathBuf>,

        /// Output format: table, csv, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Load slices from a CSV file into the slices table
    Load {
        /// CSV file with track_id, ts, dur, name and optional category, bytes
        csv: PathBuf,
    },

    /// Build an aggregation view for a selection and print it
    Aggregate {
        /// Aggregation to build: slices, performance
        #[arg(short, long, default_value = "slices")]
        kind: String,

        /// Window start (ns)
        #[arg(long)]
        start: i64,

        /// Window end (ns)
        #[arg(long)]
        end: i64,

        /// Track id to select (repeatable)
        #[arg(short, long = "track")]
        tracks: Vec<i64>,

        /// Comma-separated track ids selected together as one async track (repeatable)
        #[arg(long = "async-track", value_delimiter = ',', num_args = 1..)]
        async_tracks: Vec<i64>,

        /// Output format: table, csv, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Materialize a view as a debug track table
    DebugTable {
        /// Source view or table
        view: String,

        /// Track name (defaults to "Debug Track N")
        #[arg(short, long, default_value = "")]
        name: String,

        /// Column holding the timestamp
        #[arg(long, default_value = "ts")]
        ts: String,

        /// Column holding the duration, or 0 for instants
        #[arg(long, default_value = "dur")]
        dur: String,

        /// Column holding the slice name
        #[arg(long = "name-column", default_value = "name")]
        name_column: String,

        /// Extra column to carry over as arg_<column> (repeatable)
        #[arg(short, long = "arg")]
        args: Vec<String>,
    },
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn open_engine(config: Option<&Path>, database: Option<PathBuf>) -> Result<TraceEngine> {
    let mut engine_config = match config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if database.is_some() {
        engine_config.database = database;
    }
    if engine_config.read_only {
        if let Some(path) = &engine_config.database {
            if !path.exists() {
                bail!("Database not found: {}", path.display());
            }
        }
    }
    Ok(TraceEngine::open(engine_config)?)
}

/// Run the query command
fn run_query(
    engine: &TraceEngine,
    sql: Option<String>,
    file: Option<PathBuf>,
    format: &str,
) -> Result<()> {
    let script = match (sql, file) {
        (Some(sql), _) => Some(sql),
        (None, Some(path)) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        (None, None) => None,
    };

    match script {
        Some(script) => execute_script(engine, &script, format),
        None => run_interactive(engine, format),
    }
}

/// Execute a script and display the last statement's rows
fn execute_script(engine: &TraceEngine, sql: &str, format: &str) -> Result<()> {
    let ScriptResult { stats, last } = engine.execute_script(sql)?;
    print_result(&last, format)?;
    eprintln!(
        "\n{} rows returned ({} statements, {} with output)",
        last.row_count, stats.statement_count, stats.statement_count_with_output
    );
    if last.truncated {
        if let Some(total) = last.total_row_count {
            eprintln!("(truncated, {total} rows in total)");
        }
    }
    Ok(())
}

fn print_result(result: &QueryResult, format: &str) -> Result<()> {
    match format {
        "csv" => {
            let rows: Vec<Vec<String>> = result
                .rows
                .iter()
                .map(|row| row.iter().map(|v| v.to_display_string()).collect())
                .collect();
            print_csv(&result.columns, &rows);
        }
        "json" => {
            let json_rows: Vec<serde_json::Value> = result
                .rows
                .iter()
                .map(|row| {
                    let obj: serde_json::Map<String, serde_json::Value> = result
                        .columns
                        .iter()
                        .zip(row.iter())
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect();
                    serde_json::Value::Object(obj)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json_rows)?);
        }
        _ => {
            let rows: Vec<Vec<String>> = result
                .rows
                .iter()
                .map(|row| row.iter().map(|v| v.to_display_string()).collect())
                .collect();
            print_table(&result.columns, &rows);
        }
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn print_csv(headers: &[String], rows: &[Vec<String>]) {
    let line = |fields: &[String]| {
        fields
            .iter()
            .map(String::as_str)
            .map(csv_field)
            .collect::<Vec<_>>()
            .join(",")
    };
    println!("{}", line(headers));
    for row in rows {
        println!("{}", line(row));
    }
}

const MAX_COLUMN_WIDTH: usize = 50;

fn print_table(headers: &[String], rows: &[Vec<String>]) {
    if rows.is_empty() {
        println!("(no results)");
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, val) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(val.chars().count());
            }
        }
    }

    for w in &mut widths {
        *w = (*w).min(MAX_COLUMN_WIDTH);
    }

    let cell = |i: usize, v: &str| {
        let width = widths.get(i).copied().unwrap_or(10);
        let truncated = if v.chars().count() > width && width > 3 {
            let keep: String = v.chars().take(width - 3).collect();
            format!("{keep}...")
        } else {
            v.to_string()
        };
        format!("{truncated:width$}")
    };

    let header_line: Vec<String> = headers.iter().enumerate().map(|(i, h)| cell(i, h)).collect();
    println!("{}", header_line.join(" | "));

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", sep.join("-+-"));

    for row in rows {
        let row_line: Vec<String> = row.iter().enumerate().map(|(i, v)| cell(i, v)).collect();
        println!("{}", row_line.join(" | "));
    }
}

fn run_interactive(engine: &TraceEngine, format: &str) -> Result<()> {
    use std::io::{self, BufRead, Write};

    eprintln!("slicedb interactive mode");
    eprintln!("Enter SQL (end with ';'), or 'quit' to exit.\n");

    eprintln!("Available relations:");
    for relation in engine.list_relations()? {
        eprintln!("  {} ({:?})", relation.name, relation.kind);
    }
    eprintln!();

    let stdin = io::stdin();
    let mut query_buffer = String::new();

    loop {
        let prompt = if query_buffer.is_empty() {
            "sql> "
        } else {
            "...> "
        };
        eprint!("{prompt}");
        io::stderr().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            break;
        }

        query_buffer.push_str(&line);

        if query_buffer.trim().ends_with(';') {
            let script = std::mem::take(&mut query_buffer);
            if let Err(e) = execute_script(engine, &script, format) {
                eprintln!("Error: {e}");
            }
            println!();
        }
    }

    Ok(())
}

fn run_load(engine: &TraceEngine, csv: &Path) -> Result<()> {
    if engine.config().database.is_none() {
        bail!("load needs a database file (--database or a config file)");
    }
    let inserted = engine
        .load_slices_csv(csv)
        .with_context(|| format!("Failed to load {}", csv.display()))?;
    eprintln!("Loaded {inserted} slices from {}", csv.display());
    Ok(())
}

fn controller_for(kind: &str) -> Result<Box<dyn AggregationController>> {
    match kind {
        "slices" => Ok(Box::new(SliceAggregation::new())),
        "performance" => Ok(Box::new(PerformanceAggregation::new())),
        other => bail!("Unknown aggregation '{other}' (expected slices or performance)"),
    }
}

/// Render typed columns as display rows, with a totals row when any column sums.
fn typed_rows(typed: &TypedColumns) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = (0..typed.row_count)
        .map(|i| {
            typed
                .columns
                .iter()
                .map(|c| match &c.data {
                    ColumnData::Number(values) => {
                        values[i].map_or_else(|| "NULL".to_string(), |v| v.to_string())
                    }
                    ColumnData::String(values) => values[i].clone(),
                })
                .collect()
        })
        .collect();

    if typed.row_count > 0 && typed.columns.iter().any(|c| c.def.sum) {
        let totals = typed
            .rollup()
            .into_iter()
            .enumerate()
            .map(|(i, total)| match total {
                Some(v) => v.to_string(),
                None if i == 0 => "Total".to_string(),
                None => String::new(),
            })
            .collect();
        rows.push(totals);
    }
    rows
}

fn run_aggregate(
    engine: &TraceEngine,
    kind: &str,
    start: i64,
    end: i64,
    tracks: Vec<i64>,
    async_tracks: Vec<i64>,
    format: &str,
) -> Result<()> {
    let controller = controller_for(kind)?;

    let mut registry = TrackRegistry::new();
    let mut keys = Vec::new();
    for track_id in tracks {
        let key = format!("track_{track_id}");
        registry.register(key.clone(), SliceTrack { track_id });
        keys.push(key);
    }
    if !async_tracks.is_empty() {
        registry.register("async", AsyncSliceTrack { track_ids: async_tracks });
        keys.push("async".to_string());
    }
    let area = Area::new(start, end, keys)?;

    let scheduler = ViewScheduler::new();
    match scheduler.materialize(engine, controller.as_ref(), &area, &registry)? {
        ViewOutcome::Available => {}
        ViewOutcome::Unavailable => {
            eprintln!("No aggregation available for this selection");
            return Ok(());
        }
        ViewOutcome::Superseded => bail!("Aggregation was superseded"),
    }

    let defs = controller.column_definitions();
    let typed = fetch_view(engine, controller.kind(), &defs, &controller.default_sorting())?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&typed)?);
    } else {
        let headers: Vec<String> = defs.iter().map(|d| d.title.clone()).collect();
        let rows = typed_rows(&typed);
        if format == "csv" {
            print_csv(&headers, &rows);
        } else {
            eprintln!("{}", controller.tab_name());
            print_table(&headers, &rows);
        }
    }
    Ok(())
}

fn run_debug_table(
    engine: TraceEngine,
    view: &str,
    name: &str,
    columns: SliceColumns,
    args: Vec<String>,
) -> Result<()> {
    let engine = Arc::new(engine);
    let (tx, rx) = std::sync::mpsc::channel::<TrackEvent>();
    let track = add_debug_track(&engine, view, name, &columns, &args, &tx)?;
    // The table outlives this process only in a file-backed database
    let table = track.leak();
    drop(tx);
    for event in rx.try_iter() {
        println!("{}", serde_json::to_string(&event)?);
    }
    eprintln!("Created {table}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let engine = open_engine(cli.config.as_deref(), cli.database)?;

    match cli.command {
        Commands::Query { sql, file, format } => run_query(&engine, sql, file, &format),
        Commands::Load { csv } => run_load(&engine, &csv),
        Commands::Aggregate {
            kind,
            start,
            end,
            tracks,
            async_tracks,
            format,
        } => run_aggregate(&engine, &kind, start, end, tracks, async_tracks, &format),
        Commands::DebugTable {
            view,
            name,
            ts,
            dur,
            name_column,
            args,
        } => run_debug_table(
            engine,
            &view,
            &name,
            SliceColumns::new(&ts, &dur, &name_column),
            args,
        ),
    }
}
