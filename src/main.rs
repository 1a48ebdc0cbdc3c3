//! modkern CLI entry point.
//!
//! `start` serves the kernel over stdin/stdout; the remaining subcommands
//! inspect identifiers and manage saved registry overrides.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use modkern::config::ModkernConfig;
use modkern::credential::MasterKey;
use modkern::host::process::ProcessSandboxHost;
use modkern::host::store::DirectoryCodeStore;
use modkern::host::{CallerPort, ChannelPort};
use modkern::identifier::{classify, Classification, Identifier};
use modkern::kernel::{self, KernelDeps};
use modkern::registry::{Ed25519Verifier, RegistryOverrides};

/// modkern: content-addressed module kernel.
#[derive(Parser)]
#[command(name = "modkern", version, about)]
struct Cli {
    /// Config file (defaults to `$MODKERN_CONFIG_PATH` or `./modkern.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Serve `{origin, frame}` envelopes from stdin, replies on stdout.
    Start,
    /// Classify an identifier and show what it names.
    Inspect {
        /// Identifier text.
        identifier: String,
    },
    /// Pin a resolver identifier to a content identifier.
    Pin {
        /// Resolver identifier.
        resolver: String,
        /// Content identifier to load instead of the registry's answer.
        content: String,
    },
    /// Remove a saved override.
    Unpin {
        /// Resolver identifier.
        resolver: String,
    },
    /// List saved overrides.
    Overrides,
}

/// One inbound line in `start` mode.
#[derive(Debug, Deserialize)]
struct Envelope {
    origin: String,
    frame: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ModkernConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(config).await,
        Command::Inspect { identifier } => {
            modkern::logging::init_cli(&config.kernel.log_level);
            handle_inspect(&config, &identifier)
        }
        Command::Pin { resolver, content } => {
            modkern::logging::init_cli(&config.kernel.log_level);
            handle_pin(&config, &resolver, &content)
        }
        Command::Unpin { resolver } => {
            modkern::logging::init_cli(&config.kernel.log_level);
            handle_unpin(&config, &resolver)
        }
        Command::Overrides => {
            modkern::logging::init_cli(&config.kernel.log_level);
            handle_overrides(&config)
        }
    }
}

/// Run the kernel until stdin closes or ctrl-c.
async fn handle_start(config: ModkernConfig) -> anyhow::Result<()> {
    let paths = config.runtime_paths()?;
    let _logging_guard =
        modkern::logging::init_production(&paths.logs_dir, &config.kernel.log_level)?;

    let master_key = match config.master_key_with(|key| std::env::var(key).ok())? {
        Some(key) => key,
        None => {
            warn!(
                var = %config.kernel.master_key_env,
                "no master key configured, using an ephemeral key"
            );
            MasterKey::generate()
        }
    };

    let store = DirectoryCodeStore::new(&paths.store_dir)
        .with_context(|| format!("failed to open store {}", paths.store_dir.display()))?;
    let host = ProcessSandboxHost::new(&config.sandbox.command, paths.scratch_dir.clone())
        .context("failed to set up sandbox host")?;
    let overrides = RegistryOverrides::load(&paths.overrides_file, &config.registry.defaults)?;

    let handle = kernel::spawn(KernelDeps {
        settings: config.router_settings(),
        master_key,
        store: Arc::new(store),
        host: Arc::new(host),
        overrides: Arc::new(overrides),
        verifier: Arc::new(Ed25519Verifier),
        transport: None,
        core_modules: config.core_modules()?,
    });

    let (port, mut outbound) = ChannelPort::new();
    let port: Arc<dyn CallerPort> = Arc::new(port);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(out) = outbound.recv().await {
            let mut line = match serde_json::to_vec(&out) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                warn!(error = %e, "stdout closed");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!(
        store = %paths.store_dir.display(),
        overrides = %paths.overrides_file.display(),
        "modkern serving on stdin/stdout"
    );

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                let line = line.context("failed to read stdin")?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => {
                        if handle
                            .submit(Arc::clone(&port), &envelope.origin, envelope.frame)
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed envelope"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    handle.shutdown();
    handle.stopped().await;
    drop(port);
    if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
        warn!("timed out flushing outbound frames");
    }
    info!("modkern stopped");
    Ok(())
}

/// Print what an identifier names.
fn handle_inspect(config: &ModkernConfig, text: &str) -> anyhow::Result<()> {
    let (kind, id) = match classify(&Value::String(text.to_owned())) {
        Classification::Immutable(id) => ("content", id),
        Classification::Resolver(id) => ("resolver", id),
        Classification::Invalid(e) => anyhow::bail!("invalid identifier: {e}"),
    };

    let mut report = json!({
        "identifier": id.as_str(),
        "kind": kind,
        "hash": hex::encode(id.hash()),
        "size": id.size(),
    });
    if id.is_resolver() {
        let paths = config.runtime_paths()?;
        let overrides = RegistryOverrides::load(&paths.overrides_file, &config.registry.defaults)?;
        report["override"] = json!(overrides.get(&id).map(Identifier::as_str));
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Save a resolver override.
fn handle_pin(config: &ModkernConfig, resolver: &str, content: &str) -> anyhow::Result<()> {
    let resolver = Identifier::parse(resolver).context("invalid resolver identifier")?;
    let content = Identifier::parse(content).context("invalid content identifier")?;
    let paths = config.runtime_paths()?;
    let mut overrides = RegistryOverrides::load(&paths.overrides_file, &config.registry.defaults)?;
    overrides.pin(&resolver, &content)?;
    println!("{resolver} -> {content}");
    Ok(())
}

/// Remove a resolver override.
fn handle_unpin(config: &ModkernConfig, resolver: &str) -> anyhow::Result<()> {
    let resolver = Identifier::parse(resolver).context("invalid resolver identifier")?;
    let paths = config.runtime_paths()?;
    let mut overrides = RegistryOverrides::load(&paths.overrides_file, &config.registry.defaults)?;
    if overrides.unpin(&resolver)? {
        println!("removed override for {resolver}");
    } else {
        println!("no override saved for {resolver}");
    }
    Ok(())
}

/// List saved overrides.
fn handle_overrides(config: &ModkernConfig) -> anyhow::Result<()> {
    let paths = config.runtime_paths()?;
    let overrides = RegistryOverrides::load(&paths.overrides_file, &config.registry.defaults)?;
    for (resolver, target) in overrides.saved() {
        println!("{resolver} -> {target}");
    }
    Ok(())
}
