//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Line-oriented terminal dashboard over controller events."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;

use anyhow::Result;
use botdeck_common::format_file_size;
use botdeck_core::{ControllerEvent, ControllerHandle, ControllerView, LogLevel};
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const HELP: &str = "commands: start | stop | deploy | upload <path> [slot] | poll | view | help | quit";

/// Render controller events as they arrive and execute commands typed on
/// stdin until `quit` or end of input.
pub async fn run(handle: &ControllerHandle) -> Result<()> {
    let mut events = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dashboard fell behind; events dropped"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !execute(handle, line.trim()).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn execute(handle: &ControllerHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let report = match words.next() {
        None => return true,
        Some("quit" | "exit") => return false,
        Some("help") => {
            println!("{HELP}");
            return true;
        }
        Some("view") => {
            print_view(&handle.view(), handle.uptime());
            return true;
        }
        Some("poll") => {
            handle.poll_now().await;
            return true;
        }
        Some("start") => handle.start().await,
        Some("stop") => handle.stop().await,
        Some("deploy") => handle.deploy().await,
        Some("upload") => {
            let Some(path) = words.next() else {
                println!("usage: upload <path> [primary|dependencies]");
                return true;
            };
            let path = Path::new(path);
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            let slot = words
                .next()
                .map(str::to_string)
                .or_else(|| botdeck_core::FileSlot::infer(&name).map(|s| s.as_str().to_string()))
                .unwrap_or_default();
            match tokio::fs::read(path).await {
                Ok(bytes) => handle.capture_file(&slot, &name, bytes).await,
                Err(err) => {
                    println!("cannot read {}: {err}", path.display());
                    return true;
                }
            }
        }
        Some(other) => {
            println!("unknown command {other:?}; {HELP}");
            return true;
        }
    };
    println!("> {report}");
    true
}

fn render(event: &ControllerEvent) {
    let at = Local::now().format("%H:%M:%S");
    match event {
        ControllerEvent::StateChanged { state, actions } => println!(
            "[{at}] state: {state} (start {}, stop {}, deploy {})",
            enabled(actions.start),
            enabled(actions.stop),
            enabled(actions.deploy)
        ),
        ControllerEvent::Log {
            level,
            tag,
            message,
        } => match tag {
            Some(tag) => println!("[{at}] {} {message} ({tag})", marker(*level)),
            None => println!("[{at}] {} {message}", marker(*level)),
        },
        ControllerEvent::Uptime { text } => println!("[{at}] uptime {text}"),
        ControllerEvent::Activity { level, message } => {
            println!("[{at}] {} {message}", marker(*level))
        }
        ControllerEvent::FileCaptured {
            slot,
            name,
            size_bytes,
        } => println!(
            "[{at}] {} file: {name} ({})",
            slot.as_str(),
            format_file_size(*size_bytes)
        ),
        ControllerEvent::Deployed {
            deployment_url,
            repository_ref,
        } => println!("[{at}] deployed {repository_ref} at {deployment_url}"),
    }
}

fn print_view(view: &ControllerView, uptime: Option<String>) {
    println!("state:      {}", view.state);
    if let Some(uptime) = uptime {
        println!("uptime:     {uptime}");
    }
    for (label, file) in [
        ("primary", &view.primary_file),
        ("deps", &view.dependencies_file),
    ] {
        match file {
            Some(file) => println!(
                "{label:<11} {} ({})",
                file.name,
                format_file_size(file.size_bytes)
            ),
            None => println!("{label:<11} none"),
        }
    }
    if let Some(url) = &view.deployment_url {
        println!("deployment: {url}");
    }
    if let Some(balance) = view.balance {
        println!("balance:    {balance:.2}");
    }
}

fn marker(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "[i]",
        LogLevel::Success => "[+]",
        LogLevel::Warning => "[!]",
        LogLevel::Error => "[x]",
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
