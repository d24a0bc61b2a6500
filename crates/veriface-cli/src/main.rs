use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use veriface_core::{DetectionBatch, JsonAnalyzer, Terminal, VerificationSession, VerifyConfig, VerifyEvent};

mod client;
mod source;
mod trace;

#[derive(Parser)]
#[command(name = "veriface", version, about = "Face verification with a liveness challenge")]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded detector trace against a reference, offline
    Replay {
        /// Reference detector output: file, URL, data URL or base64
        #[arg(short, long)]
        reference: String,
        /// JSON-lines trace of analyzed frames
        #[arg(short, long)]
        trace: PathBuf,
        /// Verification config (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Spacing of frames that carry no timestamp
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        /// Skip the liveness challenge
        #[arg(long)]
        no_liveness: bool,
    },
    /// Compare one probe photo against a reference, offline
    Compare {
        #[arg(short, long)]
        reference: String,
        #[arg(short, long)]
        probe: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Enroll a reference for a subject with the daemon
    Enroll {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long, default_value = "default")]
        label: String,
        /// Detector output for the reference image
        #[arg(short, long)]
        image: String,
    },
    /// List a subject's stored references
    List {
        #[arg(short, long)]
        subject: String,
    },
    /// Remove a stored reference
    Remove {
        #[arg(short, long)]
        subject: String,
        #[arg(long)]
        id: String,
    },
    /// Stream a trace through a daemon session
    Verify {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        trace: PathBuf,
        /// Register this reference instead of the stored ones
        #[arg(short, long)]
        reference: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            reference,
            trace,
            config,
            interval_ms,
            no_liveness,
        } => {
            let mut config = load_config(config.as_deref())?;
            if no_liveness {
                config.liveness.enabled = false;
            }
            let mut session = VerificationSession::new(config);
            register(&mut session, &reference)?;

            let frames = read_trace(&trace)?;
            let steps = trace::replay(
                &mut session,
                &frames,
                Duration::from_millis(interval_ms),
                Instant::now(),
            );
            for step in &steps {
                print_json(&serde_json::json!({ "frame": step.index, "report": step.report }))?;
                print_events(&step.events)?;
            }

            Ok(exit_code(session.terminal()))
        }

        Commands::Compare {
            reference,
            probe,
            config,
        } => {
            let mut session = VerificationSession::new(load_config(config.as_deref())?);
            register(&mut session, &reference)?;

            let probe = source::load(&probe)?;
            let comparison = session.verify_photo_image(&mut JsonAnalyzer, &probe);
            print_events(&session.take_events())?;
            let comparison = comparison?;
            print_json(&comparison)?;

            Ok(match comparison {
                Some(c) if c.matched => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            })
        }

        Commands::Enroll {
            subject,
            label,
            image,
        } => {
            let image = source::load(&image)?;
            let proxy = client::connect(cli.session_bus).await?;
            let reference_id = proxy.enroll(&subject, &label, &image).await?;
            println!("{reference_id}");
            Ok(ExitCode::SUCCESS)
        }

        Commands::List { subject } => {
            let proxy = client::connect(cli.session_bus).await?;
            println!("{}", proxy.list_references(&subject).await?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Remove { subject, id } => {
            let proxy = client::connect(cli.session_bus).await?;
            if proxy.remove_reference(&subject, &id).await? {
                println!("removed {id}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("no reference {id} for {subject}");
                Ok(ExitCode::from(1))
            }
        }

        Commands::Verify {
            subject,
            trace,
            reference,
        } => {
            let frames = read_trace(&trace)?;
            let proxy = client::connect(cli.session_bus).await?;
            let session_id = proxy.open_session(&subject).await?;
            tracing::info!(session = %session_id, "session opened");

            if let Some(reference) = reference {
                proxy
                    .register_image(&session_id, &source::load(&reference)?)
                    .await?;
            }

            let mut terminal = Terminal::None;
            for frame in frames {
                // The daemon's analyzer reads detector JSON; an error frame is
                // sent as unparseable bytes so it fails there too.
                let payload = match frame.error {
                    Some(error) => error.into_bytes(),
                    None => serde_json::to_vec(&DetectionBatch {
                        detections: frame.detections,
                    })?,
                };
                let report = proxy.process_frame(&session_id, &payload).await?;
                println!("{report}");

                let report: serde_json::Value = serde_json::from_str(&report)?;
                terminal = match report["terminal"].as_str() {
                    Some("success") => Terminal::Success,
                    Some("fail") => Terminal::Fail,
                    _ => Terminal::None,
                };
                if terminal != Terminal::None {
                    break;
                }
            }

            proxy.close_session(&session_id).await?;
            Ok(exit_code(terminal))
        }

        Commands::Status => {
            let proxy = client::connect(cli.session_bus).await?;
            println!("{}", proxy.status().await?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<VerifyConfig> {
    let Some(path) = path else {
        return Ok(VerifyConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    VerifyConfig::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
}

fn register(session: &mut VerificationSession, reference: &str) -> Result<()> {
    let reference = source::load(reference)?;
    let registered = session.register_image(&mut JsonAnalyzer, &reference);
    print_events(&session.take_events())?;
    registered.context("reference could not be registered")
}

fn read_trace(path: &Path) -> Result<Vec<trace::TraceFrame>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    trace::parse_trace(BufReader::new(file))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_events(events: &[VerifyEvent]) -> Result<()> {
    for event in events {
        print_json(event)?;
    }
    Ok(())
}

fn exit_code(terminal: Terminal) -> ExitCode {
    match terminal {
        Terminal::Success => ExitCode::SUCCESS,
        Terminal::Fail => ExitCode::from(1),
        Terminal::None => {
            eprintln!("trace ended without a verdict");
            ExitCode::from(2)
        }
    }
}
