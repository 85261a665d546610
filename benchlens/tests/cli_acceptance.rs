use benchlens_core::{Database, SyncStatus};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        seed_dashboard_fixtures(&xdg_data);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("benchlens/analytics.db")
    }

    fn insights_dir(&self) -> PathBuf {
        self.xdg_data.join("benchlens/insights")
    }

    /// Point the collaborator at a port nothing listens on
    fn write_unreachable_llm_config(&self) {
        let dir = self.xdg_config.join("benchlens");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(
            dir.join("config.toml"),
            r#"
[llm]
provider = "ollama"
model = "llama3"
endpoint = "http://127.0.0.1:9"
timeout_secs = 5

[generation]
workers = 2
"#,
        )
        .expect("failed to write config");
    }
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../benchlens-core/tests/fixtures")
        .join(name)
}

fn seed_dashboard_fixtures(xdg_data: &Path) {
    let target = xdg_data.join("benchlens/dashboard/raw");
    fs::create_dir_all(&target).expect("failed to create dashboard dir");

    let source = fixture_path("dashboard");
    for entry in fs::read_dir(&source).expect("failed to read dashboard fixtures") {
        let entry = entry.expect("failed to read fixture entry");
        fs::copy(entry.path(), target.join(entry.file_name()))
            .expect("failed to copy dashboard fixture");
    }
}

fn run_bin(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Output {
    let bin_path = match bin_name {
        "benchlens-sync" => PathBuf::from(assert_cmd::cargo::cargo_bin!("benchlens-sync")),
        "benchlens-insights" => PathBuf::from(assert_cmd::cargo::cargo_bin!("benchlens-insights")),
        _ => panic!("unsupported binary in test harness: {bin_name}"),
    };

    let mut command = Command::new(bin_path);

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {bin_name}: {e}"))
}

fn render(bin_name: &str, args: &[&str], output: &Output) -> String {
    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{bin_name} {rendered_args}\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn assert_success(bin_name: &str, args: &[&str], output: &Output) {
    if !output.status.success() {
        panic!("failed: {}", render(bin_name, args, output));
    }
}

#[test]
fn sync_populates_db_and_health_reports_it() {
    let env = CliTestEnv::new();
    let input = fixture_path("buyer_query_results.json");
    let input = input.to_str().expect("fixture path is UTF-8");

    let output = run_bin(&env, "benchlens-sync", &[input]);
    assert_success("benchlens-sync", &[input], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("buyer: 4 entities"),
        "expected sync summary in stdout, got:\n{stdout}"
    );

    let db_path = env.db_path();
    assert!(db_path.exists(), "database file should exist at {}", db_path.display());

    let db = Database::open(&db_path).expect("failed to open db");
    db.migrate().expect("failed to migrate db");
    assert_eq!(db.count_entities("buyer").expect("failed to count"), 4);
    let snapshot = db
        .get_aggregate("buyer")
        .expect("failed to read aggregate")
        .expect("aggregate should exist");
    assert_eq!(snapshot.total_count, 4);

    let health = run_bin(&env, "benchlens-sync", &["--health"]);
    assert_success("benchlens-sync", &["--health"], &health);
    let health_stdout = String::from_utf8_lossy(&health.stdout);
    assert!(health_stdout.contains("buyer: 4"));
    assert!(health_stdout.contains("Recent sync runs:"));
}

#[test]
fn sync_of_unknown_type_fails_and_is_logged() {
    let env = CliTestEnv::new();
    let input = env.home.join("distributor.json");
    fs::write(
        &input,
        r#"{"entity_type": "distributor", "queries": {"overview": [{"id": 1}]}}"#,
    )
    .expect("failed to write input");
    let input = input.to_str().expect("path is UTF-8");

    let output = run_bin(&env, "benchlens-sync", &[input]);
    assert!(!output.status.success(), "{}", render("benchlens-sync", &[input], &output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("distributor: FAILED (configuration)"), "got:\n{stdout}");

    let db = Database::open(&env.db_path()).expect("failed to open db");
    let log = db.get_sync_log(1).expect("failed to read sync log");
    assert_eq!(log[0].status, SyncStatus::Error);
}

#[test]
fn insights_without_llm_config_refuses_to_run() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, "benchlens-insights", &["--all"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no [llm] section"), "got:\n{stderr}");
}

#[test]
fn insights_batch_reports_collaborator_failures_per_entity() {
    let env = CliTestEnv::new();
    env.write_unreachable_llm_config();

    let input = fixture_path("buyer_query_results.json");
    let input = input.to_str().expect("fixture path is UTF-8");
    let sync = run_bin(&env, "benchlens-sync", &[input]);
    assert_success("benchlens-sync", &[input], &sync);

    let args = ["--all", "--entity", "buyer"];
    let output = run_bin(&env, "benchlens-insights", &args);
    assert!(!output.status.success(), "{}", render("benchlens-insights", &args, &output));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Generating insights for 2 entit(ies)"), "got:\n{stderr}");
    assert!(stderr.contains("buyer:5098 failed at generate"), "got:\n{stderr}");
    assert!(stderr.contains("buyer:5099 failed at generate"), "got:\n{stderr}");
    assert!(stderr.contains("Succeeded: 0, Failed: 2"), "got:\n{stderr}");

    // Nothing is written for failed entities
    let written = fs::read_dir(env.insights_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
}

#[test]
fn insights_requires_a_source() {
    let env = CliTestEnv::new();
    let output = run_bin(&env, "benchlens-insights", &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--file") || stderr.contains("--all"), "got:\n{stderr}");
}
