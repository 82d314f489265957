use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use parley_core::config::Config;
use parley_core::types::{EpochGate, SessionState};
use parley_media::device::{CpalSinkFactory, CpalSource, Direction, list_devices};
use parley_media::{CaptureSpec, PlaybackConfig};
use parley_realtime::{ConnectOptions, RealtimeClient};
use parley_session::{Command, Session, SessionEvent, SessionOptions, SessionParts};
use parley_tools::{ToolRegistry, WriteNoteTool};

mod logging;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Talk to a realtime voice assistant from your terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a voice session
    Run,

    /// List audio input and output devices
    Devices,

    /// List the functions the assistant may call
    Tools,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show current configuration (secrets redacted)
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    logging::init(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Devices => {
            for device in list_devices()? {
                let direction = match device.direction {
                    Direction::Input => "input ",
                    Direction::Output => "output",
                };
                let marker = if device.is_default { " (default)" } else { "" };
                println!("{direction}  {}{marker}", device.name);
            }
        }
        Commands::Tools => {
            let tools = build_tools(&config)?;
            if tools.is_empty() {
                println!("No tools enabled. Set tools.notes_url to enable write_note.");
            }
            for def in tools.definitions() {
                println!("{}  {}", def.name, def.description);
                let required = def.required();
                if !required.is_empty() {
                    println!("    required: {}", required.join(", "));
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists, pass --force to overwrite",
                        config_path.display()
                    );
                }
                Config::starter().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
            ConfigAction::Show => {
                let mut shown = config.clone();
                if let Some(realtime) = shown.realtime.as_mut() {
                    if realtime.api_key.is_some() {
                        realtime.api_key = Some("********".into());
                    }
                }
                println!("{}", serde_json::to_string_pretty(&shown)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                println!("Config: {}", config_path.display());
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                println!("OK");
            }
        },
    }

    Ok(())
}

/// Tools enabled by config.
fn build_tools(config: &Config) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    if let Some(url) = config.notes_url() {
        if config.tool_allowed("write_note") {
            registry.register(Arc::new(WriteNoteTool::new(url)?));
        }
    }
    Ok(registry)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            error!("{e}");
        }
        anyhow::bail!("invalid configuration, see `parley config validate`");
    }

    let tools = build_tools(&config)?;
    let options = SessionOptions::from_config(&config)?;
    let gate = EpochGate::new();
    let (client, inbound) = RealtimeClient::connect(ConnectOptions::from_config(&config)?, gate.clone());

    let (session, handle, mut events) = Session::new(SessionParts {
        transport: Box::new(client),
        inbound,
        gate,
        source: Box::new(CpalSource::new(config.input_device().map(str::to_string))),
        capture: CaptureSpec {
            format: config.capture_format(),
            chunk_bytes: config.chunk_bytes(),
        },
        sinks: Arc::new(CpalSinkFactory::new(
            config.output_device().map(str::to_string),
        )),
        playback: PlaybackConfig {
            format: config.playback_format(),
            slice: Duration::from_millis(config.playback_slice_ms()),
            max_lead: Duration::from_millis(config.playback_lead_ms()),
        },
        tools: Arc::new(tools),
        options,
    });

    info!(url = %config.realtime_url(), "Starting voice session");
    let session_task = tokio::spawn(session.run());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    println!("Enter: start/stop talking   i: interrupt   r: reset after an error   q: quit");
    let mut lines = keyboard();
    loop {
        let command = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.recv() => match line {
                None => break,
                Some(line) => match line.trim() {
                    "" if handle.state() == SessionState::Recording => Command::StopCapture,
                    "" => Command::StartCapture,
                    "i" => Command::Interrupt,
                    "r" => Command::Reset,
                    "q" => break,
                    other => {
                        println!("Unknown key {other:?}");
                        continue;
                    }
                },
            },
        };
        if handle.send(command).is_err() {
            break;
        }
    }

    info!("Disconnecting");
    let _ = handle.disconnect();
    session_task.await?;
    printer.await?;
    Ok(())
}

/// Lines typed on stdin, read on a plain thread so a pending read never
/// holds up shutdown.
fn keyboard() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { to, .. } => match to {
            SessionState::Ready => println!("\n[ready]"),
            SessionState::Recording => println!("[listening... press Enter when done]"),
            SessionState::AiSpeaking => println!("[assistant]"),
            SessionState::ProcessingFunction => println!("[working]"),
            SessionState::Error => println!("[error: press r to reset or q to quit]"),
            other => println!("[{other}]"),
        },
        SessionEvent::Transcript { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::ConversationItem {
            role: Some(role),
            text: Some(text),
            ..
        } if role == "user" => println!("you: {text}"),
        SessionEvent::FunctionCallStarted {
            name: Some(name), ..
        } => println!("(calling {name})"),
        SessionEvent::FunctionCompleted { name, ok, .. } => {
            let status = if *ok { "done" } else { "failed" };
            println!("({name} {status})");
        }
        SessionEvent::Error { kind, message } => eprintln!("error ({kind:?}): {message}"),
        _ => {}
    }
}
