use std::io::Write;
use std::path::PathBuf;

use blockdefer::config::{GlobalConfig, FORK_LIMIT, LOOPBACK_PATH};
use blockdefer::AppError;

fn full_toml() -> &'static str {
    r#"
db_path = "data/blocks.db"
http_port = 9000

[fork]
limit = 5
worker_program = "/usr/local/bin/blockdefer"
worker_args = ["run-session", "--token", "{token}"]
use_web_fallback = true

[loopback]
address = "http://127.0.0.1:9000"
path = "/jobs/run"
connect_timeout_ms = 500
request_timeout_ms = 750
probe_delay_seconds = 1
probe_wait_seconds = 3

[replay]
base_delay_seconds = 10
max_delay_seconds = 600
max_replay = 8

[sweep]
interval_seconds = 15
retention_days = 30
"#
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("db_path = \"blocks.db\"").expect("valid config");

    assert_eq!(config.db_path, PathBuf::from("blocks.db"));
    assert_eq!(config.http_port, 8642);
    assert_eq!(config.fork.limit, FORK_LIMIT);
    assert!(config.fork.worker_program.is_none());
    assert!(config.fork.worker_args.contains(&"{token}".to_owned()));
    assert!(!config.fork.use_web_fallback);
    assert_eq!(config.loopback.path, LOOPBACK_PATH);
    assert_eq!(config.loopback.connect_timeout_ms, 1000);
    assert_eq!(config.loopback.request_timeout_ms, 1000);
    assert_eq!(config.replay.max_replay, 5);
    assert_eq!(config.sweep.retention_days, 7);
    assert!(config.source_path.is_none());
}

#[test]
fn full_config_parses_every_section() {
    let config = GlobalConfig::from_toml_str(full_toml()).expect("valid config");

    assert_eq!(config.http_port, 9000);
    assert_eq!(config.fork.limit, 5);
    assert_eq!(
        config.fork.worker_program,
        Some(PathBuf::from("/usr/local/bin/blockdefer"))
    );
    assert!(config.fork.use_web_fallback);
    assert_eq!(config.loopback.address.as_deref(), Some("http://127.0.0.1:9000"));
    assert_eq!(config.loopback.path, "/jobs/run");
    assert_eq!(config.loopback.request_timeout().as_millis(), 750);
    assert_eq!(config.replay.backoff_seconds(1), 20);
    assert_eq!(config.replay.max_replay, 8);
    assert_eq!(config.sweep.interval_seconds, 15);
}

#[test]
fn missing_db_path_is_rejected() {
    let err = GlobalConfig::from_toml_str("http_port = 1").expect_err("db_path required");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_fork_limit_is_rejected() {
    let err = GlobalConfig::from_toml_str("db_path = \"x.db\"\n[fork]\nlimit = 0")
        .expect_err("limit must be positive");
    assert!(err.to_string().contains("fork.limit"));
}

#[test]
fn probe_wait_must_exceed_probe_delay() {
    let raw = "db_path = \"x.db\"\n[loopback]\nprobe_delay_seconds = 5\nprobe_wait_seconds = 5";
    let err = GlobalConfig::from_toml_str(raw).expect_err("wait must exceed delay");
    assert!(err.to_string().contains("probe_wait_seconds"));
}

#[test]
fn loopback_path_needs_leading_slash() {
    let raw = "db_path = \"x.db\"\n[loopback]\npath = \"async/process\"";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

#[test]
fn replay_cap_below_base_is_rejected() {
    let raw = "db_path = \"x.db\"\n[replay]\nbase_delay_seconds = 60\nmax_delay_seconds = 10";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

#[test]
fn load_from_path_remembers_the_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(full_toml().as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("load config");
    assert_eq!(config.source_path.as_deref(), Some(file.path()));
}

#[test]
fn load_from_missing_path_is_a_config_error() {
    let err = GlobalConfig::load_from_path("/nonexistent/blockdefer.toml").expect_err("missing");
    assert!(err.to_string().starts_with("config: failed to read config"));
}
