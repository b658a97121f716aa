use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    signals: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        let signals = seed_signal_fixture(&base);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_config,
            xdg_state,
            signals,
        }
    }

    fn write_config(&self, contents: &str) {
        let path = self.xdg_config.join("pagewatch/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config directory");
        fs::write(path, contents).expect("failed to write config");
    }

    fn signals_arg(&self) -> String {
        self.signals.to_string_lossy().into_owned()
    }
}

fn seed_signal_fixture(base: &Path) -> PathBuf {
    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../pagewatch-core/tests/fixtures/signals/checkout-session.jsonl");
    let target = base.join("signals/checkout-session.jsonl");

    fs::create_dir_all(target.parent().expect("missing fixture parent"))
        .expect("failed to create fixture directory");
    fs::copy(source, &target).expect("failed to copy signal fixture");
    target
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("pagewatch"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute pagewatch: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "pagewatch {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn status_without_config_reports_capture_only() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Pagewatch Configuration"));
    assert!(stdout.contains("Endpoint:        <not set>"));
    assert!(stdout.contains("Blank Screen:    disabled"));
    assert!(stdout.contains("Frame Sampler:   disabled"));
    assert!(
        stdout.contains("Status: Capture only"),
        "expected capture-only status, got:\n{stdout}"
    );
}

#[test]
fn status_reads_delivery_config_from_xdg_dir() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[delivery]
endpoint = "https://collector.example.com/api/errors"
api_key = "pw_live_test"
max_retries = 5

[frame_sampler]
enabled = true
"#,
    );

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Endpoint:        https://collector.example.com/api/errors"));
    assert!(stdout.contains("API Key:         <set>"));
    assert!(stdout.contains("Max Retries:     5"));
    assert!(stdout.contains("Timeout:         10000ms"));
    assert!(stdout.contains("Frame Sampler:   enabled"));
    assert!(stdout.contains("Status: Ready to deliver"));
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[delivery]\nendpoint = \"ftp://collector.example.com\"\n");

    let output = run_bin(&env, &["status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("delivery.endpoint"), "got:\n{stderr}");
}

#[test]
fn ping_without_endpoint_is_a_no_op() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["ping"]);
    assert_success(&["ping"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Delivery is not configured"));
}

#[test]
fn replay_dry_run_captures_fixture_records() {
    let env = CliTestEnv::new();
    let signals = env.signals_arg();
    let args = [
        "replay",
        signals.as_str(),
        "--url",
        "https://shop.example.com/checkout",
        "--dry-run",
    ];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Replayed 6 signal(s)"));
    assert!(stdout.contains("[script-error]"));
    assert!(stdout.contains("[resource-error]"));
    assert!(stdout.contains("[rejected-promise] payment token expired"));
    assert!(stdout.contains("[network-error]"));
    assert!(stdout.contains("[custom] Checkout abandoned after validation error"));
    assert!(
        stdout.contains("Captured:        5"),
        "the <div> load error should be ignored, got:\n{stdout}"
    );
    assert!(!stdout.contains("Delivered "));
}

#[test]
fn replay_keeps_records_pending_when_collector_is_down() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[delivery]
endpoint = "http://127.0.0.1:9/api/errors"
max_retries = 1
timeout_ms = 2000
"#,
    );
    let signals = env.signals_arg();
    let args = ["replay", signals.as_str()];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Delivery failed; 5 record(s) still pending"),
        "got:\n{stdout}"
    );
    assert!(stdout.contains("Pending:         5"));
    assert!(stdout.contains("Delivered:       0"));
}

#[test]
fn replay_reports_the_offending_line() {
    let env = CliTestEnv::new();
    let bad = env.home.join("bad.jsonl");
    fs::write(
        &bad,
        "{\"type\":\"custom\",\"message\":\"ok\"}\n\n{\"type\":\"warp-drive\"}\n",
    )
    .expect("failed to write bad fixture");
    let bad_arg = bad.to_string_lossy().into_owned();

    let output = run_bin(&env, &["replay", bad_arg.as_str(), "--dry-run"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("bad.jsonl:3: invalid signal"),
        "expected line number in error, got:\n{stderr}"
    );
}

#[test]
fn explicit_config_flag_overrides_xdg_config() {
    let env = CliTestEnv::new();
    env.write_config("[delivery]\nendpoint = \"https://xdg.example.com/errors\"\n");

    let explicit = env.home.join("alt.toml");
    fs::write(&explicit, "max_queue_size = 7\n").expect("failed to write alt config");
    let explicit_arg = explicit.to_string_lossy().into_owned();
    let args = ["--config", explicit_arg.as_str(), "status"];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Queue Size:      7"));
    assert!(stdout.contains("Endpoint:        <not set>"));
}

fn log_files(env: &CliTestEnv) -> Vec<String> {
    let dir = env.xdg_state.join("pagewatch");
    match fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("pagewatch.log"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn debug_config_writes_log_file() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);
    assert!(log_files(&env).is_empty(), "no log expected without debug");

    env.write_config("debug = true\n");
    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let files = log_files(&env);
    assert!(
        !files.is_empty(),
        "expected a log file under {}",
        env.xdg_state.join("pagewatch").display()
    );
}
