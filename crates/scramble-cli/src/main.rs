//! Scramble Command-Line Interface
//!
//! This CLI drives the sandboxed transform module:
//! - Transforming source files through the module
//! - Running the module's built-in self test
//! - Checking that a module image loads and becomes ready
//!
//! The module image can come from a local file or an HTTP(S) URL.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scramble_bridge::{
    BridgeConfig, BridgeError, ImageSource, ModuleBridge, Severity, TransformOutcome,
};
use std::io::Read;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "scramble")]
#[command(author, version, about = "Sandboxed source transform CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform a source file through the module
    Transform {
        /// Module image (file path or URL)
        #[arg(short, long, default_value = "scramble.wasm")]
        module: String,

        /// Input source file (or - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Rename identifiers to meaningless short names
        #[arg(long)]
        obfuscate_identifiers: bool,

        /// Encrypt string literals
        #[arg(long)]
        encrypt_strings: bool,

        /// Flatten control flow
        #[arg(long)]
        flatten_control_flow: bool,

        /// Strip whitespace and comments
        #[arg(long)]
        compact: bool,

        /// Keep comments in the output
        #[arg(long)]
        preserve_comments: bool,

        /// Print transform statistics to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Run the module's built-in self test
    SelfTest {
        /// Module image (file path or URL)
        #[arg(short, long, default_value = "scramble.wasm")]
        module: String,
    },

    /// Load a module image and report its readiness and entry points
    Check {
        /// Module image (file path or URL)
        #[arg(short, long, default_value = "scramble.wasm")]
        module: String,

        /// Readiness poll budget
        #[arg(long, default_value = "50")]
        poll_attempts: u32,

        /// Pause between readiness polls in milliseconds
        #[arg(long, default_value = "200")]
        poll_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Transform {
            module,
            input,
            output,
            obfuscate_identifiers,
            encrypt_strings,
            flatten_control_flow,
            compact,
            preserve_comments,
            stats,
        } => {
            cmd_transform(
                module,
                input,
                output,
                obfuscate_identifiers,
                encrypt_strings,
                flatten_control_flow,
                compact,
                preserve_comments,
                stats,
            )
            .await
        }

        Commands::SelfTest { module } => cmd_self_test(module).await,

        Commands::Check {
            module,
            poll_attempts,
            poll_interval,
        } => cmd_check(module, poll_attempts, poll_interval).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_transform(
    module: String,
    input: PathBuf,
    output: Option<PathBuf>,
    obfuscate_identifiers: bool,
    encrypt_strings: bool,
    flatten_control_flow: bool,
    compact: bool,
    preserve_comments: bool,
    stats: bool,
) -> Result<()> {
    let source = if input == PathBuf::from("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        text
    } else {
        std::fs::read_to_string(&input)
            .with_context(|| format!("failed to read {}", input.display()))?
    };

    // option names are module-defined; the bridge treats them as opaque
    let options = serde_json::json!({
        "identifierObfuscation": obfuscate_identifiers,
        "stringEncryption": encrypt_strings,
        "controlFlowFlattening": flatten_control_flow,
        "compactCode": compact,
        "preserveComments": preserve_comments,
    });

    let bridge = start_bridge(&module, BridgeConfig::default()).await?;
    let outcome = bridge
        .transform(&source, &options.to_string())
        .await
        .map_err(report)?;
    let exit_code = bridge.shutdown().await.ok().flatten();

    match outcome {
        TransformOutcome::Success {
            output: transformed,
            stats: transform_stats,
        } => {
            match output {
                Some(path) => {
                    std::fs::write(&path, transformed.as_bytes())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!("wrote {} bytes to {}", transformed.len(), path.display());
                }
                None => println!("{transformed}"),
            }
            if stats {
                eprintln!("stats: {transform_stats}");
            }
        }
        TransformOutcome::Failure { error } => {
            anyhow::bail!("module rejected the input: {error}");
        }
    }

    if let Some(code) = exit_code {
        info!("module reported exit code {code}");
    }
    Ok(())
}

async fn cmd_self_test(module: String) -> Result<()> {
    let bridge = start_bridge(&module, BridgeConfig::default()).await?;
    let verdict = bridge.self_test().await.map_err(report)?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    let _ = bridge.shutdown().await;
    Ok(())
}

async fn cmd_check(module: String, poll_attempts: u32, poll_interval: u64) -> Result<()> {
    let config = BridgeConfig::default()
        .poll_attempts(poll_attempts)
        .poll_interval_ms(poll_interval);
    let bridge = ModuleBridge::load(ImageSource::from_locator(&module), config)
        .await
        .map_err(report)?;

    println!("module loaded, waiting for entry points...");
    match bridge.wait_ready().await {
        Ok(()) => {
            let mut entries = bridge.entry_points();
            entries.sort();
            println!("state: {}", bridge.readiness());
            println!("entry points:");
            for name in entries {
                println!("  {name}");
            }
        }
        Err(err) => {
            println!("state: {}", bridge.readiness());
            return Err(report(err));
        }
    }
    let _ = bridge.shutdown().await;
    Ok(())
}

/// Load a module and wait until it accepts calls.
async fn start_bridge(module: &str, config: BridgeConfig) -> Result<ModuleBridge> {
    let bridge = ModuleBridge::load(ImageSource::from_locator(module), config)
        .await
        .map_err(report)?;
    bridge.wait_ready().await.map_err(report)?;
    Ok(bridge)
}

/// Render a bridge error as its user-visible status message.
fn report(err: BridgeError) -> anyhow::Error {
    let status = err.status();
    let tag = match status.severity {
        Severity::Warning => "warning",
        Severity::Error => "error",
    };
    anyhow::anyhow!("{tag}: {}", status.text)
}
