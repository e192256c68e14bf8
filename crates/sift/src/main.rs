//! Sift DNS Filtering Engine
//!
//! Loads filter lists, answers host checks and exposes the HTTP control API.
//! Changes made through the API are written back to the configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use hickory_proto::rr::RecordType;
use sift_config::{Config, ConfigHolder};
use sift_filter::lists::HttpLoader;
use sift_filter::DnsFilter;
use sift_metrics::prometheus::{init_prometheus, PrometheusConfig};
use sift_metrics::tracing_setup::{init_tracing, parse_level, LogConfig, LogFormat};
use sift_server::ControlServer;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};

/// Sift - DNS filtering engine
#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the filtering engine and control API (default)
    Run,

    /// Check a single host against the configured filters
    Check {
        /// Host name to check
        host: String,

        /// Query type
        #[arg(short = 't', long, default_value = "A")]
        qtype: String,
    },

    /// Validate configuration file
    Validate {
        /// Show detailed validation output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show version information
    Version {
        /// Show detailed version info
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Find the configuration file in standard locations
fn find_config_file(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    let search_paths = [
        PathBuf::from("./sift.yaml"),
        PathBuf::from("./sift.yml"),
        PathBuf::from("./config.yaml"),
        PathBuf::from("/etc/sift/config.yaml"),
        PathBuf::from("/etc/sift/sift.yaml"),
        dirs::config_dir()
            .map(|p| p.join("sift/config.yaml"))
            .unwrap_or_default(),
    ];

    search_paths.into_iter().find(|path| path.exists())
}

/// Loads the configuration, falling back to defaults when no file exists.
fn load_config(explicit_path: Option<PathBuf>, quiet: bool) -> Result<ConfigHolder> {
    let holder = match find_config_file(explicit_path) {
        Some(path) => ConfigHolder::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            if !quiet {
                eprintln!(
                    "{}",
                    style("No configuration file found, using defaults").yellow()
                );
            }
            ConfigHolder::default()
        }
    };

    holder.get().validate().context("Invalid configuration")?;
    Ok(holder)
}

/// Initialize logging/tracing subsystem
fn init_logging(config: &Config, cli_level: Option<&str>, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        parse_level(cli_level.unwrap_or(&config.logging.level))
    };

    let log_config = LogConfig {
        level,
        format: LogFormat::parse(&config.logging.format),
        span_events: false,
    };
    if let Err(e) = init_tracing(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
}

/// Print the startup banner
fn print_banner(config: &Config, quiet: bool) {
    if quiet {
        return;
    }

    let version = env!("CARGO_PKG_VERSION");
    let filtering = &config.filtering;

    println!();
    println!(
        "  {} {}",
        style("Sift DNS Filter").cyan().bold(),
        style(format!("v{}", version)).dim()
    );
    println!();

    let enabled_lists = filtering.filters.iter().filter(|f| f.enabled).count();
    println!(
        "  {} {} enabled, {} user rules",
        style("Lists:").green(),
        enabled_lists,
        filtering.user_rules.len()
    );

    if config.control.enabled {
        println!("  {} http://{}", style("Control:").green(), config.control.listen);
    }

    let mut features = Vec::new();
    if filtering.enabled {
        features.push("Filtering");
    }
    if filtering.safebrowsing_enabled {
        features.push("SafeBrowsing");
    }
    if filtering.parental_enabled {
        features.push("Parental");
    }
    if filtering.safesearch_enabled {
        features.push("SafeSearch");
    }
    if !filtering.blocked_services.is_empty() {
        features.push("BlockedServices");
    }
    if config.metrics.enabled {
        features.push("Metrics");
    }
    println!("  {} {}", style("Features:").green(), features.join(", "));

    println!();
}

/// Builds the engine and persists every control change through `holder`.
fn build_filter(holder: &Arc<ConfigHolder>) -> Result<Arc<DnsFilter>> {
    let filter = DnsFilter::new(holder.get().filtering.clone())
        .context("Failed to build filtering engine")?;

    let persist = holder.clone();
    filter.set_on_config_modified(Box::new(move |filtering| {
        if let Err(e) = persist.update_filtering(filtering.clone()) {
            error!(error = %e, "Failed to save configuration");
        }
    }));

    Ok(Arc::new(filter))
}

/// Re-reads the configuration file and rebuilds the lists in the background.
async fn reload(holder: &ConfigHolder, filter: &DnsFilter, loader: &HttpLoader) {
    info!("Reloading configuration...");

    if let Err(e) = holder.reload() {
        error!(error = %e, "Failed to reload configuration");
        return;
    }

    filter.update_config(holder.get().filtering.clone());
    match filter.load_configured_lists(loader, true).await {
        Ok(()) => info!("Filter rebuild queued"),
        Err(e) => error!(error = %e, "Failed to queue filter rebuild"),
    }
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::SignalKind;

        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
                    _ = signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Received SIGINT, initiating graceful shutdown...");
}

async fn run_server(holder: Arc<ConfigHolder>, quiet: bool) -> Result<()> {
    let config = holder.get();
    print_banner(&config, quiet);

    if config.metrics.enabled {
        if let Some(listen) = config.metrics.prometheus_listen {
            if let Err(e) = init_prometheus(&PrometheusConfig { listen }) {
                warn!(error = %e, "Failed to initialize Prometheus metrics");
            }
        }
    }

    let filter = build_filter(&holder)?;
    let loader = Arc::new(HttpLoader::new().context("Failed to build list downloader")?);

    filter
        .load_configured_lists(loader.as_ref(), false)
        .await
        .context("Failed to load filter lists")?;
    info!(rules = filter.stats().rules, "Filter lists loaded");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let control = if config.control.enabled {
        let server = ControlServer::new(filter.clone());
        let listen = config.control.listen;
        let mut shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = server.run(listen, shutdown).await {
                error!(error = %e, "Control server error");
            }
        }))
    } else {
        None
    };

    #[cfg(unix)]
    {
        let holder = holder.clone();
        let filter = filter.clone();
        let loader = loader.clone();
        tokio::spawn(async move {
            let mut sighup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(sighup) => sighup,
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGHUP handler, reload disabled");
                    return;
                }
            };

            while sighup.recv().await.is_some() {
                info!("Received SIGHUP");
                reload(&holder, &filter, &loader).await;
            }
        });
    }

    info!("Sift started");

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    if let Some(control) = control {
        if let Err(e) = control.await {
            warn!(error = %e, "Control server task failed");
        }
    }

    info!("Sift stopped");
    Ok(())
}

/// Checks one host and prints the verdict as JSON.
async fn check_host(holder: Arc<ConfigHolder>, host: &str, qtype: &str) -> Result<()> {
    let qtype = RecordType::from_str(&qtype.to_ascii_uppercase())
        .map_err(|_| anyhow::anyhow!("Unknown query type: {qtype}"))?;

    let filter = DnsFilter::new(holder.get().filtering.clone())
        .context("Failed to build filtering engine")?;
    let loader = HttpLoader::new().context("Failed to build list downloader")?;
    filter
        .load_configured_lists(&loader, false)
        .await
        .context("Failed to load filter lists")?;

    let result = filter.check_host(host, qtype, &filter.settings()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Validate configuration file
fn validate_config(path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config_path = find_config_file(path).context("No configuration file found")?;

    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            config_path.display()
        )
    })?;

    if verbose {
        let filtering = &config.filtering;
        println!("\n{}", style("Configuration loaded:").green().bold());
        println!("  Filtering enabled: {}", filtering.enabled);
        println!("  Filter lists: {}", filtering.filters.len());
        println!("  User rules: {}", filtering.user_rules.len());
        println!("  Rewrites: {}", filtering.rewrites.len());
        println!("  Blocked services: {}", filtering.blocked_services.join(", "));
        println!("  Safe browsing: {}", filtering.safebrowsing_enabled);
        println!(
            "  Parental: {} (sensitivity {})",
            filtering.parental_enabled, filtering.parental_sensitivity
        );
        println!("  Safe search: {}", filtering.safesearch_enabled);
        println!("  Control API: {}", config.control.listen);
        println!("  Metrics enabled: {}", config.metrics.enabled);
    }

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    println!("{}", style("Configuration is valid!").green().bold());
    Ok(())
}

/// Print version information
fn print_version(verbose: bool) {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");

    if verbose {
        println!(
            "{} {}",
            style(name).cyan().bold(),
            style(format!("v{}", version)).dim()
        );
        println!();
        println!(
            "  {}: {}",
            style("Build target").dim(),
            std::env::consts::ARCH
        );
        println!("  {}: {}", style("OS").dim(), std::env::consts::OS);
        println!();
    } else {
        println!("{} {}", name, version);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version { verbose }) = &cli.command {
        print_version(*verbose);
        return Ok(());
    }

    if let Some(Commands::Validate { verbose }) = &cli.command {
        return validate_config(cli.config, *verbose);
    }

    let holder = Arc::new(load_config(cli.config.clone(), cli.quiet)?);
    init_logging(&holder.get(), cli.log_level.as_deref(), cli.quiet);

    match cli.command {
        Some(Commands::Check { host, qtype }) => check_host(holder, &host, &qtype).await,
        Some(Commands::Run) | None => run_server(holder, cli.quiet).await,
        Some(Commands::Validate { .. } | Commands::Version { .. }) => Ok(()),
    }
}
