use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use annocache::engine::protocol::{METHOD_GET_ERRORS, METHOD_SET_ROOTS};
use annocache::engine::{EngineNotification, LoopbackLauncher};
use annocache::{
    ContentRoot, EditEvent, FixedRoots, MemoryHost, RegionKind, Session, Settings, load_settings,
};

/// Annotation cache tooling
#[derive(Parser)]
#[command(name = "annocache")]
#[command(version)]
#[command(about = "Replay annotation cache scenarios against a loopback analysis engine")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a JSON-lines script of edits and engine pushes, printing dumps
    Replay {
        /// Script with one step per line
        script: PathBuf,

        /// Settings file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Analysis root to report to the engine (repeatable)
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },
    /// Validate a settings file and print the effective settings
    CheckConfig {
        /// Settings file (TOML)
        path: PathBuf,
    },
}

/// One line of a replay script.
#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum Step {
    Open {
        file: PathBuf,
        #[serde(default)]
        content: String,
    },
    Edit {
        file: PathBuf,
        offset: usize,
        #[serde(default)]
        old_length: usize,
        #[serde(default)]
        text: String,
    },
    Push {
        message: Value,
    },
    Sync,
    Close {
        file: PathBuf,
    },
    Dump {
        file: PathBuf,
        #[serde(default)]
        kind: Option<RegionKind>,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Replay {
            script,
            config,
            roots,
        } => replay(&script, config.as_deref(), roots).await,
        Commands::CheckConfig { path } => check_config(&path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn check_config(path: &Path) -> CliResult {
    let settings = load_settings(path)?;
    print!("{}", toml::to_string(&settings)?);
    Ok(())
}

async fn replay(script: &Path, config: Option<&Path>, roots: Vec<PathBuf>) -> CliResult {
    let settings = match config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    let source = std::fs::read_to_string(script)?;

    let (launcher, mut endpoints) = LoopbackLauncher::new();
    tokio::spawn(async move {
        while let Some(endpoint) = endpoints.recv().await {
            endpoint.connected().await;
            endpoint.serve(|method, _params| match method {
                METHOD_SET_ROOTS => Some(json!({})),
                METHOD_GET_ERRORS => Some(json!({ "errors": [] })),
                _ => None,
            });
        }
    });

    let host = Arc::new(MemoryHost::new());
    let provider = Arc::new(FixedRoots::new(
        roots.into_iter().map(ContentRoot::new).collect(),
    ));
    let session = Session::new(settings, Arc::new(launcher), host.clone(), provider);
    session.roots().track_project("replay");
    session.start().await?;

    for (index, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: Step = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {}", script.display(), index + 1, e))?;
        run_step(&session, &host, step).await?;
    }

    session.stop();
    Ok(())
}

async fn run_step(session: &Session, host: &MemoryHost, step: Step) -> CliResult {
    match step {
        Step::Open { file, content } => host.open(file, content),
        Step::Edit {
            file,
            offset,
            old_length,
            text,
        } => {
            if !host.replace(&file, offset, old_length, &text) {
                return Err(format!("edit outside of {}", file.display()).into());
            }
            let new_length = text.chars().count();
            session.on_local_edit(&EditEvent::new(file, offset, old_length, new_length));
        }
        Step::Push { message } => match EngineNotification::from_message(&message) {
            Ok(notification) => session.cache().handle_notification(notification),
            Err(e) => eprintln!("Skipping push: {}", e),
        },
        Step::Sync => {
            let sent = session.sync_content().await?;
            println!("{}", json!({ "synced": sent }));
        }
        Step::Close { file } => {
            host.close(&file);
            session.on_file_closed(&file);
        }
        Step::Dump { file, kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => RegionKind::ALL.to_vec(),
            };
            for kind in kinds {
                let regions = session.cache().regions(&file, kind);
                println!(
                    "{}",
                    json!({
                        "file": file,
                        "kind": kind,
                        "dirty": session.cache().is_dirty(&file),
                        "regions": regions.as_slice(),
                    })
                );
            }
        }
    }
    Ok(())
}
