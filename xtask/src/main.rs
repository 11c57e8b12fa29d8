use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "fusion-server";

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Fusion Connect backend")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks")]
    Lint,
    #[command(about = "Execute `cargo test --workspace`")]
    Test,
    #[command(about = "Run fmt + clippy + test sequence")]
    Ci,
    #[command(about = "Start the server with metrics and exercise /signal, /calls and /metrics")]
    Smoke,
}

fn main() {
    let cli = Cli::parse();

    let Some(workspace_root) = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
    else {
        eprintln!("xtask must live inside the workspace");
        exit(1);
    };

    let result = match cli.command {
        Task::Fmt => run_commands(&workspace_root, [("cargo", &["fmt", "--all"])]),
        Task::Lint => run_lint(&workspace_root),
        Task::Test => run_commands(&workspace_root, [("cargo", &["test", "--workspace"])]),
        Task::Ci => run_lint(&workspace_root) && run_tests(&workspace_root),
        Task::Smoke => run_smoke(&workspace_root),
    };

    if !result {
        exit(1);
    }
}

fn run_lint(workspace_root: &Path) -> bool {
    run_commands(
        workspace_root,
        [
            ("cargo", &["fmt", "--all", "--", "--check"]),
            ("cargo", &["clippy", "--workspace", "--", "-D", "warnings"]),
        ],
    )
}

fn run_tests(workspace_root: &Path) -> bool {
    run_commands(
        workspace_root,
        [
            ("cargo", &["test", "--workspace"]),
            ("cargo", &["test", "-p", SERVER_PACKAGE, "--features", "metrics"]),
        ],
    )
}

/// Kills the server when the smoke run finishes, whatever the outcome.
struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Err(err) = self.0.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                eprintln!("failed to terminate server process: {err}");
            }
        }
        let _ = self.0.wait();
    }
}

fn run_smoke(workspace_root: &Path) -> bool {
    if !run_commands(
        workspace_root,
        [(
            "cargo",
            &["build", "--features", "metrics", "-p", SERVER_PACKAGE],
        )],
    ) {
        return false;
    }

    let Some(port) = reserve_port() else {
        eprintln!("failed to reserve a free TCP port");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let child = match Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            SERVER_PACKAGE,
            "--",
            "--bind-addr",
            &bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .env_remove("FUSION_SERVER__DATABASE_URL")
        .current_dir(workspace_root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => ServerProcess(child),
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            return false;
        }
    };

    let client = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            return false;
        }
    };
    let base_url = format!("http://{bind_addr}");

    let outcome = wait_for_ready(&client, &format!("{base_url}/ready"), Duration::from_secs(60))
        .and_then(|()| verify_signal_flow(&client, &base_url))
        .and_then(|()| verify_call_history(&client, &base_url))
        .and_then(|()| verify_metrics(&client, &format!("{base_url}/metrics")));

    drop(child);
    match outcome {
        Ok(()) => {
            println!("smoke test passed");
            true
        }
        Err(message) => {
            eprintln!("smoke test failed: {message}");
            false
        }
    }
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    Err("server did not report ready within timeout".into())
}

#[derive(Deserialize)]
struct SignalsResponse {
    signals: Vec<Value>,
}

fn fetch_signals(client: &Client, base_url: &str, username: &str) -> Result<Vec<Value>, String> {
    let response = client
        .get(format!("{base_url}/signal"))
        .query(&[("username", username)])
        .send()
        .map_err(|err| format!("GET /signal failed: {err}"))?;
    if response.status() != StatusCode::OK {
        return Err(format!("GET /signal answered {}", response.status()));
    }
    response
        .json::<SignalsResponse>()
        .map(|body| body.signals)
        .map_err(|err| format!("GET /signal returned an unexpected body: {err}"))
}

fn verify_signal_flow(client: &Client, base_url: &str) -> Result<(), String> {
    let response = client
        .post(format!("{base_url}/signal"))
        .json(&json!({"from": "smoke-a", "to": "smoke-b", "signal": "sdp-offer-1", "type": "offer"}))
        .send()
        .map_err(|err| format!("POST /signal failed: {err}"))?;
    let body: Value = response
        .json()
        .map_err(|err| format!("POST /signal returned an unexpected body: {err}"))?;
    if body != json!({"success": true}) {
        return Err(format!("POST /signal answered {body}"));
    }

    let first = fetch_signals(client, base_url, "smoke-b")?;
    if first.len() != 1 || first[0]["signal"] != "sdp-offer-1" {
        return Err(format!("expected the queued offer, got {first:?}"));
    }
    let second = fetch_signals(client, base_url, "smoke-b")?;
    if !second.is_empty() {
        return Err(format!("mailbox was not drained: {second:?}"));
    }

    let rejected = client
        .post(format!("{base_url}/signal"))
        .json(&json!({"from": "smoke-a", "to": "smoke-b", "type": "offer"}))
        .send()
        .map_err(|err| format!("POST /signal failed: {err}"))?;
    if rejected.status() != StatusCode::BAD_REQUEST {
        return Err(format!(
            "incomplete signal answered {} instead of 400",
            rejected.status()
        ));
    }
    Ok(())
}

fn verify_call_history(client: &Client, base_url: &str) -> Result<(), String> {
    let body: Value = client
        .post(format!("{base_url}/calls"))
        .json(&json!({"caller": "smoke-a", "recipient": "smoke-b", "type": "voice"}))
        .send()
        .and_then(|response| response.json())
        .map_err(|err| format!("POST /calls failed: {err}"))?;
    if body["call"]["duration"] != 0 || body["call"]["status"] != "completed" {
        return Err(format!("POST /calls did not apply defaults: {body}"));
    }

    let listed: Value = client
        .get(format!("{base_url}/calls"))
        .query(&[("username", "smoke-b")])
        .send()
        .and_then(|response| response.json())
        .map_err(|err| format!("GET /calls failed: {err}"))?;
    if listed["calls"].as_array().map_or(0, Vec::len) != 1 {
        return Err(format!("GET /calls returned {listed}"));
    }
    Ok(())
}

fn verify_metrics(client: &Client, url: &str) -> Result<(), String> {
    let response = client
        .get(url)
        .send()
        .map_err(|err| format!("failed to call metrics endpoint: {err}"))?;
    if response.status() != StatusCode::OK {
        return Err(format!(
            "unexpected metrics response status: {}",
            response.status()
        ));
    }
    let body = response
        .text()
        .map_err(|err| format!("failed to read metrics body: {err}"))?;
    for counter in ["fusion_http_requests_total", "fusion_signals_total"] {
        if !body.contains(counter) {
            return Err(format!("metrics endpoint is missing {counter}"));
        }
    }
    Ok(())
}

fn run_commands<const N: usize>(workspace_root: &Path, commands: [(&str, &[&str]); N]) -> bool {
    for (program, args) in commands {
        let status = Command::new(program)
            .args(args)
            .current_dir(workspace_root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command '{program} {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn '{program}': {err}");
                return false;
            }
        }
    }
    true
}
