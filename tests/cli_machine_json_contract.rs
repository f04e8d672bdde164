use agent_driver::agent::codec::BodyWriter;
use agent_driver::agent::{HybridInfo, SearchResult};
use serde_json::Value;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn agent_driver_bin() -> String {
    if let Some(path) = option_env!("CARGO_BIN_EXE_agent-driver") {
        return path.to_string();
    }
    std::env::var("CARGO_BIN_EXE_agent-driver").expect(
        "CARGO_BIN_EXE_agent-driver should be set (compile-time or runtime) for integration tests",
    )
}

fn run_command(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(agent_driver_bin())
        .arg("--config-dir")
        .arg(config_dir)
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("AGENT_DRIVER_CONFIG_DIR")
        .output()
        .expect("failed to execute agent-driver")
}

fn parse_stdout(output: &Output, args: &[&str]) -> Value {
    let stdout = String::from_utf8(output.stdout.clone()).expect("stdout should be valid UTF-8");
    let stderr = String::from_utf8(output.stderr.clone()).expect("stderr should be valid UTF-8");
    serde_json::from_str::<Value>(&stdout).unwrap_or_else(|error| {
        panic!(
            "stdout should be pure JSON for args `{}`: {error}\nstdout:\n{}\nstderr:\n{}",
            args.join(" "),
            stdout,
            stderr
        )
    })
}

fn run_json_command(config_dir: &Path, args: &[&str]) -> Value {
    let output = run_command(config_dir, args);
    assert!(
        output.status.success(),
        "command failed: {}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    parse_stdout(&output, args)
}

fn run_failing_json_command(config_dir: &Path, args: &[&str]) -> Value {
    let output = run_command(config_dir, args);
    assert!(
        !output.status.success(),
        "command unexpectedly succeeded: {}",
        args.join(" ")
    );
    parse_stdout(&output, args)
}

fn assert_report_contract(json: &Value, expected_report_type: &str) {
    assert_eq!(
        json.get("schema_version").and_then(Value::as_u64),
        Some(1),
        "missing/invalid schema_version: {json}"
    );
    assert_eq!(
        json.get("report_type").and_then(Value::as_str),
        Some(expected_report_type),
        "missing/invalid report_type: {json}"
    );
}

fn assert_error(json: &Value, code: u64, slug: &str) {
    assert_report_contract(json, "error");
    assert_eq!(json.get("code").and_then(Value::as_u64), Some(code), "{json}");
    assert_eq!(json.get("error").and_then(Value::as_str), Some(slug), "{json}");
}

fn write_config(dir: &Path, base_port: u16, backend: Option<&str>) {
    let backend = backend
        .map(|url| format!("[backend]\nurl = \"{url}\"\n"))
        .unwrap_or_default();
    fs::write(
        dir.join("config.toml"),
        format!(
            "[agent]\nbase_port = {base_port}\nport_span = 1\nrequest_timeout_ms = 500\npoll_interval_ms = 10\n\n{backend}"
        ),
    )
    .expect("write config");
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

#[test]
fn connect_without_backend_reports_not_configured() {
    let tmp = tempdir().expect("tempdir");
    write_config(tmp.path(), closed_port(), None);

    let json = run_failing_json_command(tmp.path(), &["connect", "--json"]);
    assert_error(&json, 6, "not-configured");
}

#[test]
fn connect_without_agent_reports_open_failed() {
    let tmp = tempdir().expect("tempdir");
    write_config(tmp.path(), closed_port(), Some("https://updates.example.com"));

    let json = run_failing_json_command(tmp.path(), &["--json", "connect"]);
    assert_error(&json, 1, "open-failed");
}

#[test]
fn unknown_action_is_rejected_before_connecting() {
    let tmp = tempdir().expect("tempdir");
    write_config(tmp.path(), closed_port(), Some("https://updates.example.com"));

    let json = run_failing_json_command(tmp.path(), &["perform", "reinstall", "editor", "--json"]);
    assert_error(&json, 13, "invalid-action-type");
}

#[test]
fn config_show_json_has_contract_fields() {
    let tmp = tempdir().expect("tempdir");

    let json = run_json_command(tmp.path(), &["config", "show", "--json"]);
    assert_report_contract(&json, "config.show");
    assert_eq!(
        json.pointer("/config/agent/base_port").and_then(Value::as_u64),
        Some(17458)
    );
    assert_eq!(
        json.pointer("/config/agent/port_span").and_then(Value::as_u64),
        Some(20)
    );
}

#[test]
fn set_backend_is_persisted() {
    let tmp = tempdir().expect("tempdir");

    let output = run_command(
        tmp.path(),
        &["config", "set-backend", "https://updates.example.com", "--json"],
    );
    assert!(output.status.success());

    let json = run_json_command(tmp.path(), &["config", "show", "--json"]);
    assert_eq!(
        json.pointer("/config/backend/url").and_then(Value::as_str),
        Some("https://updates.example.com")
    );
}

#[test]
fn completions_stay_on_stdout() {
    let tmp = tempdir().expect("tempdir");
    let output = run_command(tmp.path(), &["completions", "bash"]);

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf-8");
    assert!(stdout.contains("agent-driver"));
    assert!(output.stderr.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn search_json_lists_agent_products() {
    let server = MockServer::start().await;
    let product = SearchResult {
        product_name: "editor".to_string(),
        current_version: "1.0.0".to_string(),
        install_path: "/opt/editor".to_string(),
        features: vec!["core".to_string()],
        hybrids: vec![HybridInfo {
            version_name: "1.1.0".to_string(),
            for_uninstall: false,
            install_date: None,
            release_date: None,
            description: Some("Fixes".to_string()),
        }],
    };
    let body = {
        let mut writer = BodyWriter::new();
        writer.search_result(&product);
        writer.finish()
    };
    for (name, status, reply) in [
        ("ping", 200, ""),
        ("request_control", 200, "cookie"),
        ("control_accepted", 200, "true"),
        ("feed_configuration", 200, ""),
        ("status", 200, "IDLE"),
        ("key_persistence", 401, ""),
        ("search_products", 200, ""),
        ("search_results", 200, body.as_str()),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/agent/{name}")))
            .respond_with(ResponseTemplate::new(status).set_body_string(reply))
            .mount(&server)
            .await;
    }

    let tmp = tempdir().expect("tempdir");
    write_config(
        tmp.path(),
        server.address().port(),
        Some("https://updates.example.com"),
    );
    let dir = tmp.path().to_path_buf();
    let json = tokio::task::spawn_blocking(move || {
        run_json_command(&dir, &["search", "--updates-only", "--json"])
    })
    .await
    .expect("command thread");

    assert_report_contract(&json, "agent.search");
    let products = json
        .get("products")
        .and_then(Value::as_array)
        .expect("products array");
    assert_eq!(products.len(), 1);
    assert_eq!(
        products[0].get("product_name").and_then(Value::as_str),
        Some("editor")
    );
}
