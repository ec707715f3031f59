//! promptdump - passive HTTP and LLM prompt dumper
//!
//! Captures plaintext HTTP/1.x traffic from an interface or pcap file,
//! pairs every response with its request and prints the result.

mod printer;

use clap::{Args, Parser, Subcommand};
use printer::{HttpPrinter, PromptPrinter};
use promptdump_capture::{TestGenerator, TestGeneratorConfig};
use promptdump_core::{ConfigLoader, Notifier, PromptdumpConfig};
use promptdump_correlate::{DumperStats, HttpDumper};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Filter used by `prompts` when none is given: Ollama and LM Studio
const LOCAL_LLM_FILTER: &str = "tcp and (port 11434 or port 1234)";

#[derive(Parser)]
#[command(name = "promptdump")]
#[command(version)]
#[command(about = "Dump HTTP traffic and LLM prompts from the wire", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PROMPTDUMP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct CaptureArgs {
    /// Network interface to capture packets from (e.g. en0, eth0)
    #[arg(short = 'i', long)]
    interface: Option<String>,

    /// Pcap file to read packets from
    #[arg(short = 'r', long)]
    read: Option<PathBuf>,

    /// BPF filter for capturing packets
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Put the interface in promiscuous mode
    #[arg(short = 'p', long = "promisc")]
    promiscuous: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every HTTP request and response with headers and body
    Dump {
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Print only LLM prompts and completions (defaults to the loopback
    /// interface and the Ollama / LM Studio ports)
    Prompts {
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Run the full pipeline on generated traffic (no privileges required)
    Demo {
        /// Conversation interval in milliseconds
        #[arg(long, default_value = "2000")]
        interval: u64,

        /// Number of conversations to generate (0 = infinite)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Generate streaming (SSE) responses
        #[arg(long)]
        streaming: bool,

        /// Print raw HTTP instead of prompts
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence over the config file
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let stats = match cli.command {
        Commands::Dump { capture } => {
            let config = merge_capture_args(config, capture, None);
            dump_command(config, Arc::new(HttpPrinter::new())).await?
        }
        Commands::Prompts { capture } => {
            let config = merge_capture_args(config, capture, Some(LOCAL_LLM_FILTER));
            dump_command(config, Arc::new(PromptPrinter::new())).await?
        }
        Commands::Demo {
            interval,
            count,
            streaming,
            raw,
        } => {
            let notifier: Arc<dyn Notifier> = if raw {
                Arc::new(HttpPrinter::new())
            } else {
                Arc::new(PromptPrinter::new())
            };
            demo_command(
                config,
                notifier,
                TestGeneratorConfig {
                    interval_ms: interval,
                    conversation_count: count,
                    streaming,
                    ..Default::default()
                },
            )
            .await?
        }
    };

    info!(
        "{} packets, {} sessions, {} requests, {} responses ({} non-HTTP, {} decode errors)",
        stats.packets,
        stats.sessions,
        stats.requests,
        stats.responses,
        stats.discarded,
        stats.decode_errors
    );
    Ok(())
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> PromptdumpConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            PromptdumpConfig::default()
        }
    }
}

/// CLI arguments take precedence over the config file. `prompts` falls
/// back to the loopback interface and `default_filter`.
fn merge_capture_args(
    mut config: PromptdumpConfig,
    args: CaptureArgs,
    default_filter: Option<&str>,
) -> PromptdumpConfig {
    if args.interface.is_some() || args.read.is_some() {
        config.capture.device = args.interface;
        config.capture.pcap_file = args.read;
    }
    if let Some(filter) = args.filter {
        config.capture.bpf_filter = filter;
    } else if let Some(filter) = default_filter {
        config.capture.bpf_filter = filter.to_string();
    }
    if default_filter.is_some()
        && config.capture.device.is_none()
        && config.capture.pcap_file.is_none()
    {
        config.capture.device = Some(loopback_interface().to_string());
    }
    if args.promiscuous {
        config.capture.promiscuous = true;
    }
    config
}

fn loopback_interface() -> &'static str {
    if cfg!(target_os = "macos") {
        "lo0"
    } else {
        "lo"
    }
}

async fn dump_command(
    config: PromptdumpConfig,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<DumperStats> {
    let dumper = Arc::new(HttpDumper::new(config, notifier));
    let stop = dumper.stop_handle();

    let mut run = tokio::spawn({
        let dumper = dumper.clone();
        async move { dumper.start().await }
    });

    let stats = tokio::select! {
        result = &mut run => result??,
        _ = shutdown_signal() => {
            println!("\nReceived interrupt, shutting down...");
            stop.stop();
            run.await??
        }
    };
    Ok(stats)
}

/// Demo mode - feeds generated conversations through the dumper
async fn demo_command(
    config: PromptdumpConfig,
    notifier: Arc<dyn Notifier>,
    generator_config: TestGeneratorConfig,
) -> anyhow::Result<DumperStats> {
    println!();
    println!("  promptdump v{} - DEMO MODE", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "  Generating a conversation every {}ms",
        generator_config.interval_ms
    );
    if generator_config.conversation_count > 0 {
        println!(
            "  Will generate {} conversations total",
            generator_config.conversation_count
        );
    } else {
        println!("  Generating conversations indefinitely");
        println!("  Press Ctrl+C to stop");
    }
    println!();

    let generator = TestGenerator::with_config(generator_config);
    let packets = generator.start();

    let dumper = Arc::new(HttpDumper::new(config, notifier));
    let stop = dumper.stop_handle();

    let mut run = tokio::spawn({
        let dumper = dumper.clone();
        async move { dumper.run(packets).await }
    });

    let stats = tokio::select! {
        result = &mut run => result?,
        _ = shutdown_signal() => {
            println!("\nReceived interrupt, shutting down...");
            generator.stop();
            stop.stop();
            run.await?
        }
    };

    info!(
        "Demo stopped after {} conversations",
        generator.conversations_generated()
    );
    Ok(stats)
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
