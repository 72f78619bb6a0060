use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use opc_console::config::{load_preferences, preferences_path, resolve_backend_url};
use opc_console::{
    Activation, ConsoleError, ConsoleResult, Dashboard, Endpoints, HttpTransport, LayoutSnapshot,
    NotificationLevel, SendOutcome,
};
use opc_core::{format_bytes, format_elapsed, FrameRate};
use opc_geometry::{Direction, LayoutMode};
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "opconsole", about = "Operator console for remote agent sessions")]
struct Args {
    /// Base URL of the session agents; scheme and port apply to every session.
    #[arg(long)]
    backend_url: Option<String>,
    /// Screenshot rate (1, 5 or 10). Overrides the saved preference.
    #[arg(long)]
    fps: Option<FrameRate>,
    /// Session address to open at startup. May be repeated.
    #[arg(long = "connect")]
    connect: Vec<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Connect(String),
    Select(String),
    Close(String),
    Disconnect(String),
    Reconnect(String),
    Send(String),
    Cancel(String),
    Assist(String),
    Unassist,
    Fps(FrameRate),
    Stream(String),
    Capture(String),
    Click(String),
    Move(String, i32, i32),
    Nav(Direction, LayoutMode),
    Paths(String),
    Logs(String),
    Tasks,
    Sessions,
    Usage { reset: bool },
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let required = |what: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("{verb} needs {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    match verb.to_ascii_lowercase().as_str() {
        "connect" => required("an address").map(Command::Connect),
        "select" => required("an address").map(Command::Select),
        "close" => required("an address").map(Command::Close),
        "disconnect" => required("an address").map(Command::Disconnect),
        "reconnect" => required("an address").map(Command::Reconnect),
        "send" => required("a message").map(Command::Send),
        "cancel" => required("a task id").map(Command::Cancel),
        "assist" => required("a task id").map(Command::Assist),
        "unassist" => Ok(Command::Unassist),
        "fps" => rest.parse::<FrameRate>().map(Command::Fps),
        "stream" => required("an address").map(Command::Stream),
        "capture" => required("an address").map(Command::Capture),
        "click" => required("an address").map(Command::Click),
        "move" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let [address, x, y] = parts.as_slice() else {
                return Err("usage: move <address> <x> <y>".to_string());
            };
            let x = x.parse::<i32>().map_err(|err| format!("invalid x: {err}"))?;
            let y = y.parse::<i32>().map_err(|err| format!("invalid y: {err}"))?;
            Ok(Command::Move(address.to_string(), x, y))
        }
        "nav" => {
            let mut parts = rest.split_whitespace();
            let direction = parts
                .next()
                .ok_or_else(|| "usage: nav <up|down|left|right> [compact]".to_string())?
                .parse::<Direction>()?;
            let mode = match parts.next() {
                Some("compact") => LayoutMode::Compact,
                Some("wide") | None => LayoutMode::Wide,
                Some(other) => return Err(format!("unknown layout mode: {other}")),
            };
            Ok(Command::Nav(direction, mode))
        }
        "paths" => required("a layout snapshot as JSON").map(Command::Paths),
        "logs" => required("an address").map(Command::Logs),
        "tasks" => Ok(Command::Tasks),
        "sessions" => Ok(Command::Sessions),
        "usage" => match rest {
            "" => Ok(Command::Usage { reset: false }),
            "reset" => Ok(Command::Usage { reset: true }),
            other => Err(format!("unknown usage option: {other}")),
        },
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_ref())?;

    let backend_url = resolve_backend_url(args.backend_url.as_deref());
    let endpoints = Endpoints::from_backend_url(&backend_url)?;
    let prefs_path = preferences_path();
    let preferences = match load_preferences(&prefs_path) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "preferences_unreadable", path = %prefs_path.display(), error = %err);
            Default::default()
        }
    };
    let frame_rate = args.fps.unwrap_or(preferences.frame_rate);
    info!(event = "console_start", backend = %backend_url, fps = frame_rate.fps());

    let transport = Arc::new(HttpTransport::new(endpoints)?);
    let (mut dashboard, mut events) = Dashboard::new(transport, frame_rate, Some(prefs_path));
    for address in &args.connect {
        if let Err(err) = dashboard.connect(address) {
            eprintln!("connect {address}: {err}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run_command(&mut dashboard, command),
                    Err(err) => eprintln!("{err}"),
                }
            }
            Some(event) = events.recv() => {
                dashboard.handle_event(event);
            }
        }
        print_notifications(&mut dashboard);
    }
    info!(event = "console_stop");
    Ok(())
}

fn run_command(dashboard: &mut Dashboard, command: Command) {
    let result = match command {
        Command::Connect(input) => dashboard
            .connect(&input)
            .map(|address| println!("session {address}")),
        Command::Select(address) => dashboard.select_session(&address),
        Command::Close(address) => dashboard.close_session(&address),
        Command::Disconnect(address) => dashboard.disconnect_session(&address),
        Command::Reconnect(address) => dashboard.reconnect_session(&address),
        Command::Send(text) => dashboard.send_message(&text).map(|outcome| match outcome {
            SendOutcome::Task(id) => println!("task {id} queued"),
            SendOutcome::Assist(id) => println!("assist message sent to {id}"),
        }),
        Command::Cancel(id) => dashboard.cancel_task(&id),
        Command::Assist(id) => dashboard.activate_assist(&id).map(|activation| match activation {
            Activation::Active(binding) => println!("assist active for {}", binding.task),
            Activation::Pending(binding) => {
                println!("assist pending until {} connects", binding.session)
            }
        }),
        Command::Unassist => {
            dashboard.deactivate_assist();
            Ok(())
        }
        Command::Fps(rate) => {
            dashboard.set_frame_rate(rate);
            println!("frame rate {rate}");
            Ok(())
        }
        Command::Stream(address) => dashboard.toggle_stream(&address).map(|streaming| {
            println!(
                "{address}: {}",
                if streaming { "streaming" } else { "paused" }
            )
        }),
        Command::Capture(address) => dashboard.capture(&address),
        Command::Click(address) => dashboard.mouse_click(&address),
        Command::Move(address, x, y) => dashboard.mouse_move(&address, x, y),
        Command::Nav(direction, mode) => dashboard.navigate(direction, mode).map(|selected| {
            if let Some(address) = selected {
                println!("selected {address}");
            }
        }),
        Command::Paths(raw) => {
            print_paths(dashboard, &raw);
            Ok(())
        }
        Command::Logs(address) => print_logs(dashboard, &address),
        Command::Tasks => {
            print_tasks(dashboard);
            Ok(())
        }
        Command::Sessions => {
            print_sessions(dashboard);
            Ok(())
        }
        Command::Usage { reset } => {
            if reset {
                dashboard.reset_usage();
            }
            print_usage(dashboard);
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
    }
}

fn print_notifications(dashboard: &mut Dashboard) {
    for notification in dashboard.drain_notifications() {
        let tag = match notification.level {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warn",
            NotificationLevel::Error => "error",
        };
        println!("[{tag}] {}", notification.message);
    }
}

fn print_tasks(dashboard: &Dashboard) {
    let now = Utc::now();
    let bound = dashboard.assist().binding().map(|binding| binding.task.clone());
    for task in dashboard.tasks().all() {
        let marker = if bound.as_deref() == Some(task.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker}{:>4} {:<40} {:<12} {} {} {}",
            task.sequence,
            task.id,
            task.status.label(),
            format_elapsed(task.elapsed(now)),
            task.session,
            task.message
        );
    }
}

fn print_sessions(dashboard: &Dashboard) {
    let selected = dashboard.selected();
    for session in dashboard.sessions().sessions() {
        let marker = if selected == Some(session.address()) {
            "*"
        } else {
            " "
        };
        let stream = if session.is_streaming() {
            "streaming"
        } else if session.is_recovering() {
            "recovering"
        } else {
            "idle"
        };
        let image = session
            .image()
            .map(|image| format_bytes(image.accounted_bytes()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{marker}{:<40} {:<12} {:<10} frame {:<10} received {}",
            session.address(),
            session.state(),
            stream,
            image,
            format_bytes(dashboard.usage().session(session.address()))
        );
    }
}

fn print_logs(dashboard: &Dashboard, address: &str) -> ConsoleResult<()> {
    let session = dashboard
        .sessions()
        .get(address)
        .ok_or_else(|| ConsoleError::UnknownSession(address.to_string()))?;
    for line in session.logs() {
        println!("{address} | {line}");
    }
    Ok(())
}

fn print_usage(dashboard: &Dashboard) {
    println!("network {}", format_bytes(dashboard.usage().total()));
    match dashboard.token_usage() {
        Some(total) => println!("tokens {total}"),
        None => println!("tokens -"),
    }
    println!("frame rate {}", dashboard.frame_rate());
}

fn print_paths(dashboard: &Dashboard, raw: &str) {
    let layout: LayoutSnapshot = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid layout snapshot: {err}");
            return;
        }
    };
    match dashboard.connection_paths(&layout) {
        Ok(paths) => {
            if let Some(path) = paths.session_route {
                println!("route {path}");
            }
            if let Some(path) = paths.assist_segment {
                println!("assist {path}");
            }
        }
        Err(err) => eprintln!("geometry error: {err}"),
    }
}

fn print_help() {
    println!(
        "commands: connect <ip> | select <addr> | close <addr> | disconnect <addr> | \
         reconnect <addr> | send <text> | cancel <task> | assist <task> | unassist | \
         fps <1|5|10> | stream <addr> | capture <addr> | click <addr> | move <addr> <x> <y> | \
         nav <dir> [compact|wide] | paths <json> | logs <addr> | tasks | sessions | \
         usage [reset] | quit"
    );
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init();
        return Ok(());
    }
    let stdout_enabled = matches!(
        std::env::var("OPC_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
    Ok(())
}
