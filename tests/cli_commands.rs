//! Integration tests for the slicedb CLI.
//!
//! Each test loads a small CSV of slices into a temporary DuckDB file and
//! exercises one subcommand against it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const SLICES_CSV: &str = "\
track_id,ts,dur,name,category,bytes
1,0,900000,kernel,processing,1000
1,900000,100000,copy,transfering,
2,0,200000,kernel,processing,
2,500000,300000,\"copy, async\",transfering,
3,100,-1,open,,
";

fn run_slicedb(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_slicedb"))
        .args(args)
        .output()
        .expect("Failed to run slicedb")
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Create a database holding `SLICES_CSV`. The temp dir must outlive the path.
fn loaded_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let csv = dir.path().join("slices.csv");
    std::fs::write(&csv, SLICES_CSV).expect("Failed to write csv");
    let db = dir.path().join("trace.duckdb");

    let output = run_slicedb(&["load", "-d", db.to_str().unwrap(), csv.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "load failed: {}",
        lossy(&output.stderr)
    );
    assert!(
        lossy(&output.stderr).contains("Loaded 5 slices"),
        "unexpected load message: {}",
        lossy(&output.stderr)
    );
    (dir, db)
}

fn query(db: &Path, format: &str, sql: &str) -> Output {
    run_slicedb(&["query", "-d", db.to_str().unwrap(), "-f", format, "-s", sql])
}

#[test]
fn test_query_table_format() {
    let (_dir, db) = loaded_db();
    let output = query(&db, "table", "SELECT COUNT(*) AS cnt FROM slices");
    assert!(
        output.status.success(),
        "query (table) failed: {}",
        lossy(&output.stderr)
    );
    let stdout = lossy(&output.stdout);
    assert!(stdout.contains("cnt"), "table output missing header: {stdout}");
    assert_eq!(stdout.lines().nth(1), Some("---"), "missing separator: {stdout}");
}

#[test]
fn test_query_csv_format() {
    let (_dir, db) = loaded_db();
    let output = query(
        &db,
        "csv",
        "SELECT name FROM slices WHERE track_id = 2 ORDER BY ts",
    );
    assert!(
        output.status.success(),
        "query (csv) failed: {}",
        lossy(&output.stderr)
    );
    let stdout = lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, ["name", "kernel", "\"copy, async\""]);
}

#[test]
fn test_query_json_format() {
    let (_dir, db) = loaded_db();
    let output = query(
        &db,
        "json",
        "SELECT track_id, bytes FROM slices WHERE name = 'kernel' ORDER BY track_id",
    );
    assert!(
        output.status.success(),
        "query (json) failed: {}",
        lossy(&output.stderr)
    );
    let parsed: serde_json::Value = serde_json::from_str(&lossy(&output.stdout))
        .expect("query json output should be valid JSON");
    let rows = parsed.as_array().expect("json output should be an array");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["bytes"], serde_json::json!(1000));
    assert!(rows[1]["bytes"].is_null());
}

#[test]
fn test_query_script_reports_last_statement() {
    let (_dir, db) = loaded_db();
    let output = query(
        &db,
        "csv",
        "CREATE TRACE VIEW kernels AS SELECT * FROM slices WHERE name = 'kernel'; \
         -- comment ; with a semicolon\n\
         SELECT COUNT(*) AS n FROM kernels;",
    );
    assert!(
        output.status.success(),
        "script failed: {}",
        lossy(&output.stderr)
    );
    let stdout = lossy(&output.stdout);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), ["n", "2"]);
    assert!(lossy(&output.stderr).contains("2 statements"));
}

#[test]
fn test_query_invalid_sql() {
    let (_dir, db) = loaded_db();
    let output = query(&db, "table", "SELECT * FROM nonexistent_table_xyz");
    assert!(!output.status.success(), "query with invalid SQL should fail");

    let output = query(&db, "table", "-- nothing here");
    assert!(!output.status.success());
    assert!(lossy(&output.stderr).contains("No valid SQL to run"));
}

#[test]
fn test_aggregate_slices_csv() {
    let (_dir, db) = loaded_db();
    let output = run_slicedb(&[
        "aggregate",
        "-d",
        db.to_str().unwrap(),
        "--start",
        "0",
        "--end",
        "1000000",
        "-t",
        "1",
        "-f",
        "csv",
    ]);
    assert!(
        output.status.success(),
        "aggregate failed: {}",
        lossy(&output.stderr)
    );
    let stdout = lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines[0],
        "Name,Wall duration (ms),Avg Wall duration (ms),Occurrences"
    );
    // Sorted by total duration, descending, then the totals row
    assert!(lines[1].starts_with("kernel,0.9,"), "{stdout}");
    assert!(lines[2].starts_with("copy,0.1,"), "{stdout}");
    assert_eq!(lines[3], "Total,1,,2");
}

#[test]
fn test_aggregate_performance_json() {
    let (_dir, db) = loaded_db();
    let output = run_slicedb(&[
        "aggregate",
        "-d",
        db.to_str().unwrap(),
        "-k",
        "performance",
        "--start",
        "0",
        "--end",
        "1000000",
        "-t",
        "1",
        "--async-track",
        "2",
        "-f",
        "json",
    ]);
    assert!(
        output.status.success(),
        "aggregate failed: {}",
        lossy(&output.stderr)
    );
    let parsed: serde_json::Value =
        serde_json::from_str(&lossy(&output.stdout)).expect("valid JSON");
    assert_eq!(parsed["row_count"], serde_json::json!(2));
    let processing = parsed["columns"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["def"]["column_id"] == "track_percentage_processing")
        .expect("processing column present");
    assert_eq!(processing["data"], serde_json::json!([90.0, 20.0]));
}

#[test]
fn test_aggregate_empty_selection() {
    let (_dir, db) = loaded_db();
    let output = run_slicedb(&[
        "aggregate",
        "-d",
        db.to_str().unwrap(),
        "--start",
        "0",
        "--end",
        "10",
    ]);
    assert!(output.status.success());
    assert!(lossy(&output.stderr).contains("No aggregation available"));
    assert!(lossy(&output.stdout).is_empty());
}

#[test]
fn test_aggregate_rejects_inverted_window() {
    let (_dir, db) = loaded_db();
    let output = run_slicedb(&[
        "aggregate",
        "-d",
        db.to_str().unwrap(),
        "--start",
        "10",
        "--end",
        "0",
        "-t",
        "1",
    ]);
    assert!(!output.status.success());
}

#[test]
fn test_debug_table() {
    let (_dir, db) = loaded_db();
    let output = query(
        &db,
        "csv",
        "CREATE TRACE VIEW gpu AS SELECT ts, dur, name, track_id FROM slices \
         WHERE track_id < 3; SELECT 1 AS ok",
    );
    assert!(output.status.success(), "{}", lossy(&output.stderr));

    let output = run_slicedb(&[
        "debug-table",
        "-d",
        db.to_str().unwrap(),
        "gpu",
        "-n",
        "GPU work",
        "-a",
        "track_id",
    ]);
    assert!(
        output.status.success(),
        "debug-table failed: {}",
        lossy(&output.stderr)
    );
    let event: serde_json::Value =
        serde_json::from_str(lossy(&output.stdout).trim()).expect("event should be JSON");
    assert_eq!(event["type"], "debug_track_added");
    assert_eq!(event["name"], "GPU work");
    let table = event["config"]["sql_table_name"].as_str().unwrap().to_string();
    assert!(table.starts_with("materialized_") && table.ends_with("_gpu"));

    let output = query(
        &db,
        "csv",
        &format!("SELECT id, arg_track_id FROM {table} ORDER BY id"),
    );
    assert!(output.status.success(), "{}", lossy(&output.stderr));
    let stdout = lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 5, "{stdout}");
    let ids: Vec<&str> = stdout
        .lines()
        .skip(1)
        .filter_map(|l| l.split(',').next())
        .collect();
    assert_eq!(ids, ["1", "2", "3", "4"]);
}

#[test]
fn test_config_file() {
    let (dir, db) = loaded_db();
    let config = dir.path().join("config.json");
    std::fs::write(
        &config,
        serde_json::json!({ "database": db, "read_only": true, "max_rows": 1 }).to_string(),
    )
    .unwrap();

    let output = run_slicedb(&[
        "query",
        "-c",
        config.to_str().unwrap(),
        "-f",
        "csv",
        "-s",
        "SELECT name FROM slices",
    ]);
    assert!(output.status.success(), "{}", lossy(&output.stderr));
    assert_eq!(lossy(&output.stdout).lines().count(), 2);
    assert!(lossy(&output.stderr).contains("truncated, 5 rows in total"));

    std::fs::write(&config, r#"{ "bogus": 1 }"#).unwrap();
    let output = run_slicedb(&["query", "-c", config.to_str().unwrap(), "-s", "SELECT 1"]);
    assert!(!output.status.success());
}
