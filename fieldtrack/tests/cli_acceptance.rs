use chrono::{DateTime, Duration, Utc};
use fieldtrack_core::{LocalStore, LocationSample, SampleKind, TrackingSession};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("fieldtrack/samples.db")
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("fieldtrack");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn day_start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn sample(secs: i64, meters_east: f64, kind: SampleKind, comment: Option<&str>) -> LocationSample {
    LocationSample {
        captured_at: day_start() + Duration::seconds(secs),
        latitude: 24.7136,
        longitude: 46.6753 + meters_east / 101_000.0,
        accuracy: 8.0,
        agent_id: "7".to_string(),
        attendance_id: "42".to_string(),
        session_id: "0d5c1b7e-aaaa-4bbb-8ccc-123456789abc".to_string(),
        task_id: None,
        kind,
        comment: comment.map(str::to_string),
        cluster_id: None,
        synced: false,
    }
}

/// A short day: check in, drive 2 km to a customer, dwell, check out.
fn seed_day(env: &CliTestEnv) {
    fs::create_dir_all(env.db_path().parent().expect("missing db parent"))
        .expect("failed to create data dir");
    let store = LocalStore::open(&env.db_path()).expect("failed to open store");

    store
        .record_session_start(&TrackingSession {
            session_id: "0d5c1b7e-aaaa-4bbb-8ccc-123456789abc".to_string(),
            agent_id: "7".to_string(),
            attendance_id: "42".to_string(),
            task_id: None,
            kind: SampleKind::CheckIn,
            comment: None,
            started_at: day_start(),
        })
        .expect("failed to record session");

    let points = vec![
        sample(0, 0.0, SampleKind::CheckIn, None),
        sample(120, 1000.0, SampleKind::RoutePoint, None),
        sample(240, 2000.0, SampleKind::CustomerCheckIn, Some("gate 3")),
        sample(300, 2001.0, SampleKind::RoutePoint, None),
        sample(360, 2002.0, SampleKind::RoutePoint, None),
        sample(2040, 2000.0, SampleKind::CustomerCheckOut, None),
        sample(3600, 0.0, SampleKind::CheckOut, None),
    ];
    for point in &points {
        store.append(point).expect("failed to append sample");
    }
    store
        .mark_synced(points[0].captured_at)
        .expect("failed to mark synced");
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("fieldtrack"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute fieldtrack: {e}"))
}

fn assert_success(args: &[&str], output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return stdout;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "fieldtrack {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn status_without_database_reports_missing_store() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    let stdout = assert_success(&["status"], &output);

    assert!(stdout.contains("Fieldtrack Configuration"));
    assert!(stdout.contains("Database not found"));
    assert!(stdout.contains("Remote Enabled:  false"));
    assert!(stdout.contains("Status: Remote sync not configured"));
}

#[test]
fn status_and_pending_show_unsynced_samples() {
    let env = CliTestEnv::new();
    seed_day(&env);

    let output = run_bin(&env, &["status"]);
    let stdout = assert_success(&["status"], &output);
    assert!(stdout.contains("Samples:         7"), "got:\n{stdout}");
    assert!(stdout.contains("Unsynced:        6"));
    assert!(stdout.contains("Sessions:        1"));
    assert!(stdout.contains("Last Session:    0d5c1b7e (agent 7"));

    let args = ["pending", "--limit", "2"];
    let output = run_bin(&env, &args);
    let stdout = assert_success(&args, &output);
    assert!(stdout.contains("2025-03-01 08:02:00.000"), "got:\n{stdout}");
    assert!(stdout.contains("customer_check_in"));
    assert!(!stdout.contains("2025-03-01 08:05:00.000"));
    assert!(stdout.contains("... 4 more"));
}

#[test]
fn flush_without_remote_is_a_no_op() {
    let env = CliTestEnv::new();
    seed_day(&env);

    let output = run_bin(&env, &["flush"]);
    let stdout = assert_success(&["flush"], &output);
    assert!(stdout.contains("Remote sync is not configured"));

    let store = LocalStore::open(&env.db_path()).expect("failed to open store");
    assert_eq!(store.count_unsynced().unwrap(), 6);
}

#[test]
fn flush_against_unreachable_service_keeps_samples() {
    let env = CliTestEnv::new();
    seed_day(&env);
    env.write_config(
        r#"
[remote]
enabled = true
server_url = "http://127.0.0.1:9"
timeout_secs = 2

[sync]
max_retries = 0
"#,
    );

    let output = run_bin(&env, &["flush"]);
    let stdout = assert_success(&["flush"], &output);
    assert!(stdout.contains("Flushing 6 unsynced sample(s)"), "got:\n{stdout}");
    assert!(stdout.contains("Accepted:            0"));
    assert!(stdout.contains("Still unsynced:      6"));
}

#[test]
fn route_prints_summary_and_thinned_points() {
    let env = CliTestEnv::new();
    seed_day(&env);

    let args = ["route", "--agent", "7", "--date", "2025-03-01"];
    let output = run_bin(&env, &args);
    let stdout = assert_success(&args, &output);

    assert!(stdout.contains("Route for agent 7 on 2025-03-01"));
    assert!(stdout.contains("Samples:         7"));
    assert!(stdout.contains("Duration:        01:00:00"));
    assert!(stdout.contains("Work Hours:      0.50"));
    assert!(stdout.contains("Rest Hours:      0.50"));
    // The two dwell route points at the customer are folded away
    assert!(stdout.contains("Points (5 of 7"), "got:\n{stdout}");
    assert!(stdout.contains("\"gate 3\""));
}

#[test]
fn route_json_is_machine_readable() {
    let env = CliTestEnv::new();
    seed_day(&env);

    let args = ["route", "--agent", "7", "--date", "2025-03-01", "--json"];
    let output = run_bin(&env, &args);
    let stdout = assert_success(&args, &output);

    let value: serde_json::Value = serde_json::from_str(&stdout).expect("invalid JSON");
    assert_eq!(value["agent_id"], "7");
    assert_eq!(value["summary"]["point_count"], 7);
    assert_eq!(value["summary"]["duration_secs"], 3600);
    let points = value["points"].as_array().expect("points array");
    assert_eq!(points.len(), 5);
    assert_eq!(points[0]["kind"], "check_in");

    let args = ["route", "--agent", "8", "--date", "2025-03-01", "--json"];
    let output = run_bin(&env, &args);
    let stdout = assert_success(&args, &output);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("invalid JSON");
    assert_eq!(value["summary"]["point_count"], 0);
}

#[test]
fn route_rejects_non_positive_proximity() {
    let env = CliTestEnv::new();
    seed_day(&env);

    let output = run_bin(&env, &["route", "--agent", "7", "--date", "2025-03-01", "--proximity=-5"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("display.proximity_m"), "got:\n{stderr}");
}

#[test]
fn route_rejects_malformed_date() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["route", "--agent", "7", "--date", "yesterday"]);
    assert!(!output.status.success());
}
