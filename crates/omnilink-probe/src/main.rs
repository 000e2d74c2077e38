use std::path::PathBuf;
use std::process::{self, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use omnilink::{Arguments, BridgeConfig, Channel, Client, Event, EventListener};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

struct ProbeArgs {
    server: String,
    server_args: Vec<String>,
    cwd: Option<PathBuf>,
    command: String,
    arguments: Arguments,
    linger: Duration,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let probe = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: omnilink-probe <server> --command <name> [--arguments <json>] [--arg <value>]... [--cwd <dir>] [--linger-ms <ms>]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <server>             Server executable speaking Content-Length framed JSON on stdio");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --command <name>     Command to send, e.g. autocomplete");
            eprintln!("  --arguments <json>   JSON object of command arguments [default: {{}}]");
            eprintln!("  --arg <value>        Extra server argument (repeatable)");
            eprintln!("  --cwd <dir>          Server working directory");
            eprintln!("  --linger-ms <ms>     Keep printing events after the reply [default: 0]");
            eprintln!();
            eprintln!("Bridge tunables are read from OMNILINK_* environment variables.");
            process::exit(2);
        }
    };

    if let Err(e) = run(probe).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `OMNILINK_LOG` picks the level. `LOG_FORMAT=json`
/// switches to JSON lines. Logs go to stderr so stdout carries only the reply.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("OMNILINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("omnilink={base_level},omnilink_probe={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<ProbeArgs, String> {
    let mut server: Option<String> = None;
    let mut server_args = Vec::new();
    let mut cwd = None;
    let mut command: Option<String> = None;
    let mut arguments = Arguments::new();
    let mut linger = Duration::ZERO;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--command" => {
                i += 1;
                command = Some(args.get(i).ok_or("--command requires a value")?.clone());
            }
            "--arguments" => {
                i += 1;
                let raw = args.get(i).ok_or("--arguments requires a value")?;
                arguments = match serde_json::from_str(raw) {
                    Ok(serde_json::Value::Object(map)) => map,
                    Ok(_) => return Err("--arguments must be a JSON object".to_string()),
                    Err(e) => return Err(format!("invalid --arguments JSON: {e}")),
                };
            }
            "--arg" => {
                i += 1;
                server_args.push(args.get(i).ok_or("--arg requires a value")?.clone());
            }
            "--cwd" => {
                i += 1;
                cwd = Some(PathBuf::from(args.get(i).ok_or("--cwd requires a value")?));
            }
            "--linger-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--linger-ms requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --linger-ms value: {raw}"))?;
                linger = Duration::from_millis(ms);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if server.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                server = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(ProbeArgs {
        server: server.ok_or("missing required argument: <server>")?,
        server_args,
        cwd,
        command: command.ok_or("missing required option: --command")?,
        arguments,
        linger,
    })
}

async fn run(probe: ProbeArgs) -> anyhow::Result<()> {
    let mut config = BridgeConfig::from_env().with_extra_args(probe.server_args);
    if let Some(cwd) = probe.cwd {
        config = config.with_working_directory(cwd);
    }

    let mut cmd = tokio::process::Command::new(&probe.server);
    cmd.args(&config.extra_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(ref dir) = config.working_directory {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn server '{}'", probe.server))?;
    tracing::info!(server = %probe.server, pid = child.id(), "Server started");

    let channel = Channel::from_child(&mut child)?;
    let client = Client::connect(channel, config)?;

    let printer: Arc<dyn EventListener> = Arc::new(|event: &Event| -> anyhow::Result<()> {
        let body = event.body.clone().unwrap_or(serde_json::Value::Null);
        tracing::info!(event = %event.name, sequence = event.sequence, %body, "Server event");
        Ok(())
    });
    client.subscribe_all(printer);

    let result = client.request(&probe.command, probe.arguments).await;

    if !probe.linger.is_zero() {
        tokio::time::sleep(probe.linger).await;
    }
    let grace = client.config().shutdown_grace;
    client.shutdown().await;

    // Closing stdin asks the server to exit; give it the grace period.
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(%status, "Server exited"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap server"),
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis(), "Server still running, killing it");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill server");
            }
        }
    }

    let response = result.with_context(|| format!("'{}' failed", probe.command))?;
    let body = response.body.unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);

    Ok(())
}
