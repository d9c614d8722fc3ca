use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use agent_orchestra::config::{self, Config, Paths};
use agent_orchestra::session::{handle_for, Registry};
use agent_orchestra::status::ExitOutcome;
use agent_orchestra::supervisor::{run_watch, run_wrap, WatcherLauncher, WrapOptions};
use agent_orchestra::{NewSession, Orchestra, ReconcileReport, SessionView, TmuxClient};

#[derive(Parser)]
#[command(name = "orchestra")]
#[command(about = "Supervise CLI coding agents running in tmux sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an agent in a new session
    New {
        /// Project directory the agent works in
        #[arg(long, short = 'd', default_value = ".")]
        dir: PathBuf,
        /// Task label
        #[arg(long, short)]
        label: Option<String>,
        /// Branch to record instead of detecting it
        #[arg(long)]
        branch: Option<String>,
        /// Agent command, overriding the configured one
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List sessions and their status
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one session's status
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Type text into a session, or press a named key
    Send {
        id: String,
        #[arg(required_unless_present = "key")]
        text: Option<String>,
        /// Do not press Enter after the text
        #[arg(long)]
        no_enter: bool,
        /// tmux key name to press instead of typing text (C-c, Tab, Up)
        #[arg(long, conflicts_with_all = ["text", "no_enter"])]
        key: Option<String>,
    },
    /// Print a session's visible output
    Capture {
        id: String,
        /// Only the last N lines
        #[arg(long, short = 'n')]
        lines: Option<usize>,
    },
    /// Change a session's task label
    Label { id: String, label: String },
    /// Re-detect a session's git branch
    Branch { id: String },
    /// Attach this terminal to a session
    Attach { id: String },
    /// Kill a session and delete its records
    Rm { id: String },
    /// Re-attach orphaned sessions and clean up stale records
    Reconcile {
        /// Keep reconciling every SECS seconds
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
    /// Run an agent under the status classifier (started inside tmux)
    #[command(hide = true)]
    Wrap {
        #[arg(long)]
        session_id: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Classify an existing session by watching its pane
    #[command(hide = true)]
    Watch {
        #[arg(long)]
        session_id: String,
    },
}

impl Commands {
    /// Supervisors own stdout (it is the agent's terminal), so they log to a file.
    fn logs_to_file(&self) -> bool {
        matches!(self, Commands::Wrap { .. } | Commands::Watch { .. })
    }
}

fn init_logging(command: &Commands, paths: &Paths) -> Result<()> {
    if command.logs_to_file() {
        std::fs::create_dir_all(&paths.root)
            .with_context(|| format!("failed to create {}", paths.root.display()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.log_file())
            .context("failed to open log file")?;
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
            )
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::new(config::data_dir()?);
    let config = Config::load(&paths.root)?;
    init_logging(&cli.command, &paths)?;

    match cli.command {
        Commands::Wrap {
            session_id,
            command,
        } => {
            let opts = WrapOptions {
                handle: handle_for(&config.backend.session_prefix, &session_id),
                session_id,
                command,
                working_dir: None,
            };
            let outcome = run_wrap(opts, &config, &paths).await?;
            // Skip runtime shutdown: the stdin forwarder may still be blocked.
            std::process::exit(exit_code(outcome));
        }
        Commands::Watch { session_id } => {
            let registry = Registry::open(paths.sessions_dir())?;
            let session = registry.get(&session_id)?.clone();
            let client = TmuxClient::with_program(&config.backend.program);
            run_watch(&session, &client, &config, &paths).await
        }
        command => run_client(command, config, paths).await,
    }
}

async fn run_client(command: Commands, config: Config, paths: Paths) -> Result<()> {
    let client = TmuxClient::with_program(&config.backend.program);
    client
        .ensure_available()
        .await
        .context("tmux is required to manage sessions")?;
    let client = Arc::new(client);
    let launcher = WatcherLauncher::from_current_exe(&paths, &config)
        .context("failed to locate the orchestra binary")?;
    let mut orchestra = Orchestra::open(config, &paths, client.clone(), Arc::new(launcher))?;

    match command {
        Commands::New {
            dir,
            label,
            branch,
            command,
        } => {
            let working_dir = dir
                .canonicalize()
                .with_context(|| format!("no such directory: {}", dir.display()))?;
            let label = label.unwrap_or_else(|| {
                working_dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let id = orchestra
                .create_session(NewSession {
                    working_dir,
                    label,
                    branch,
                    command: (!command.is_empty()).then_some(command),
                })
                .await?;
            println!("{}", id);
        }
        Commands::List { json } => {
            let views = orchestra.list_sessions()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                print_sessions(&views);
            }
        }
        Commands::Status { id, json } => {
            let status = orchestra.get_status(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let unreachable = if status.unreachable { " (unreachable)" } else { "" };
                println!("{}{}", status.state, unreachable);
                if !status.last_output.is_empty() {
                    println!("{}", status.last_output);
                }
            }
        }
        Commands::Send {
            id,
            text,
            no_enter,
            key,
        } => {
            if let Some(key) = key {
                orchestra.send_key(&id, &key).await?;
            } else {
                let mut bytes = text.unwrap_or_default().into_bytes();
                if !no_enter {
                    bytes.push(b'\n');
                }
                orchestra.send_input(&id, &bytes).await?;
            }
        }
        Commands::Capture { id, lines } => {
            print!("{}", orchestra.capture_output(&id, lines).await?);
        }
        Commands::Label { id, label } => {
            orchestra.update_label(&id, &label)?;
        }
        Commands::Branch { id } => match orchestra.refresh_branch(&id).await? {
            Some(branch) => println!("{}", branch),
            None => println!("(no branch)"),
        },
        Commands::Attach { id } => {
            let session = orchestra.session(&id)?;
            let cmd = client.attach_command(&session.handle);
            let status = std::process::Command::new(&cmd[0])
                .args(&cmd[1..])
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .context("failed to attach")?;
            if !status.success() {
                anyhow::bail!("tmux attach exited with {}", status);
            }
        }
        Commands::Rm { id } => {
            orchestra.delete_session(&id).await?;
            println!("Deleted session {}", id);
        }
        Commands::Reconcile { every } => match every {
            None => print_report(&orchestra.reconcile().await?),
            Some(secs) => {
                let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => match orchestra.reconcile().await {
                            Ok(report) if report.is_quiet() => {}
                            Ok(report) => print_report(&report),
                            Err(e) => tracing::error!(error = %e, "Reconcile failed"),
                        },
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
        },
        Commands::Wrap { .. } | Commands::Watch { .. } => unreachable!("handled in main"),
    }
    Ok(())
}

fn exit_code(outcome: ExitOutcome) -> i32 {
    match outcome {
        ExitOutcome::Clean => 0,
        ExitOutcome::Failed { code: Some(code) } => code as i32,
        ExitOutcome::Failed { code: None } => 1,
    }
}

fn print_sessions(views: &[SessionView]) {
    if views.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:<10} {:<8} {:<18} {:<24} LAST OUTPUT",
        "ID", "STATE", "PROJECT", "LABEL"
    );
    for view in views {
        let state = if view.status.unreachable {
            "gone".to_string()
        } else {
            view.status.state.to_string()
        };
        let snippet: String = view.status.last_output.chars().take(60).collect();
        println!(
            "{:<10} {:<8} {:<18} {:<24} {}",
            view.session.id,
            state,
            truncate(&view.session.project_name(), 18),
            truncate(&view.session.label, 24),
            snippet
        );
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}

fn print_report(report: &ReconcileReport) {
    let groups = [
        ("adopted", &report.adopted),
        ("re-attached", &report.reattached),
        ("already attached", &report.already_attached),
        ("marked unreachable", &report.marked_unreachable),
        ("stray status removed", &report.stray_removed),
    ];
    for (name, ids) in groups {
        if !ids.is_empty() {
            println!("{}: {}", name, ids.join(", "));
        }
    }
}
