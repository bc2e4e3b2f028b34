//! `run` and `stop`: thin clients for a running server.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use futures_util::{StreamExt, TryStreamExt};
use std::path::Path;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::runner::{EventKind, OutboundEvent, RunRequest, StopRequest, WireEvent};
use crate::server::{Problem, REQUEST_ID_HEADER};

/// Client-side options for `codecell run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub server: String,
    pub language: String,
    pub timeout: u64,
    pub stdin: Vec<String>,
    pub show_stats: bool,
}

/// Submit `file` and stream its events. Returns the program's exit code,
/// or 1 if the run ended with an error.
pub async fn run(file: &Path, options: RunOptions) -> Result<i32> {
    let source_code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request = RunRequest {
        source_code,
        language: options.language,
        timeout_seconds: options.timeout,
        stdin: options.stdin,
    };

    let response = reqwest::Client::new()
        .post(endpoint(&options.server, "/v1/run"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {}", options.server))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("Server rejected the request ({}): {}", status, body.trim());
    }

    if let Some(request_id) = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        eprintln!("{} {}", "request id:".dimmed(), request_id.dimmed());
    }

    let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

    let mut exit_code = 1;
    while let Some(line) = lines.next().await {
        let line = line.context("Lost connection to server")?;
        if line.trim().is_empty() {
            continue;
        }
        let wire: WireEvent =
            serde_json::from_str(&line).with_context(|| format!("Malformed event: {line}"))?;
        let event = OutboundEvent::try_from(wire)?;

        if let EventKind::ExitCode(code) = event.kind {
            exit_code = i32::try_from(code).unwrap_or(1);
        }
        if let Some(rendered) = format_event(&event.kind, options.show_stats) {
            match event.kind {
                EventKind::Stdout(_) => println!("{rendered}"),
                _ => eprintln!("{rendered}"),
            }
        }
    }

    Ok(exit_code)
}

pub async fn stop(server: &str, request_id: &str, force: bool) -> Result<()> {
    let request = StopRequest {
        request_id: request_id.to_string(),
        force,
    };
    let response = reqwest::Client::new()
        .post(endpoint(server, "/v1/stop"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {server}"))?;

    if response.status().is_success() {
        let verb = if force { "Killed" } else { "Stopping" };
        println!("{} {}", verb.green(), request_id);
        return Ok(());
    }

    let status = response.status();
    match response.json::<Problem>().await {
        Ok(problem) => bail!("{}: {}", problem.code, problem.message),
        Err(_) => bail!("Stop failed with status {}", status),
    }
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}{}", server.trim_end_matches('/'), path)
}

/// How an event is shown in the terminal; `None` hides it.
fn format_event(kind: &EventKind, show_stats: bool) -> Option<String> {
    match kind {
        EventKind::Info(text) => Some(format!("{} {}", "ℹ".blue(), text.dimmed())),
        EventKind::Stdout(text) => Some(text.clone()),
        EventKind::Stderr(text) => Some(text.yellow().to_string()),
        EventKind::Error(text) => Some(format!("{} {}", "✗".red(), text.red())),
        EventKind::Statistics {
            memory_used_bytes,
            cpu_percent,
        } => show_stats.then(|| {
            format!(
                "{} mem {:.1} MiB, cpu {:.1}%",
                "▸".dimmed(),
                bytes_to_mib(*memory_used_bytes),
                cpu_percent
            )
            .dimmed()
            .to_string()
        }),
        EventKind::ExitCode(code) => {
            let status = format!("exit code {code}");
            Some(if *code == 0 {
                format!("{} {}", "✓".green(), status.green())
            } else {
                format!("{} {}", "✗".red(), status.red())
            })
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
