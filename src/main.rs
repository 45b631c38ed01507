use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lsbroker::{build_managers, FileEditor};
use lsbroker_config::logging::{prepare_log_file, resolve_log_file};
use lsbroker_config::{default_config_dir, load_config, Config};
use lsbroker_lsp::{ProjectPath, ServerManager};

const USAGE: &str = "usage: lsbroker [--config DIR] [--project DIR] FILE...";

struct Args {
    config_dir: PathBuf,
    project: PathBuf,
    files: Vec<PathBuf>,
}

fn parse_args(cwd: PathBuf) -> Result<Args> {
    let mut args = Args {
        config_dir: default_config_dir(),
        project: cwd,
        files: Vec::new(),
    };
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config_dir = it.next().context(USAGE)?.into(),
            "--project" => args.project = it.next().context(USAGE)?.into(),
            "-h" | "--help" => bail!(USAGE),
            _ => args.files.push(arg.into()),
        }
    }
    if args.files.is_empty() {
        bail!(USAGE);
    }
    Ok(args)
}

fn init_logging(config: &Config) -> Result<()> {
    let path = resolve_log_file(&config.log);
    let file = prepare_log_file(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn report(managers: &[ServerManager], files: &[PathBuf], cwd: &Path) {
    for (n, file) in files.iter().enumerate() {
        let editor = Arc::new(FileEditor::new(n as u64 + 1, file, cwd));
        let mut owned = false;
        for manager in managers {
            match manager.editor_opened(editor.clone()).await {
                Ok(Some(server)) => {
                    owned = true;
                    println!(
                        "{}: {} {} for {}",
                        file.display(),
                        manager.server_name(),
                        server.id(),
                        server.project_path()
                    );
                    match serde_json::to_string_pretty(server.capabilities()) {
                        Ok(caps) => println!("{caps}"),
                        Err(e) => error!(error = %e, "could not render capabilities"),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    owned = true;
                    println!("{}: {} unavailable: {e}", file.display(), manager.server_name());
                }
            }
        }
        if !owned {
            println!("{}: no server", file.display());
        }
    }
}

async fn run(args: Args, cwd: PathBuf) -> Result<()> {
    let config = load_config(&args.config_dir, Some(&args.project))
        .with_context(|| format!("failed to load config from {}", args.config_dir.display()))?;
    init_logging(&config)?;
    info!(servers = config.servers.len(), "lsbroker starting");

    let managers = build_managers(&config)?;
    let project = ProjectPath::canonical(&args.project);
    for manager in &managers {
        manager.project_paths_changed([project.clone()]).await;
        manager.start_listening().await;
    }

    report(&managers, &args.files, &cwd).await;

    for manager in &managers {
        manager.stop_all_servers().await;
    }
    info!("lsbroker exited cleanly");
    Ok(())
}

fn main() {
    let result = env::current_dir()
        .context("failed to read the working directory")
        .and_then(|cwd| {
            let args = parse_args(cwd.clone())?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the runtime")?;
            runtime.block_on(run(args, cwd))
        });
    if let Err(e) = result {
        eprintln!("lsbroker: {:#}", e);
        std::process::exit(1);
    }
}
