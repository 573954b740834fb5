//! CLI module for tunnel-proxy.
//!
//! This module provides the command-line interface that can be used either
//! as a standalone binary or as the `run` subcommand of the tunnel-rs CLI.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};
use tunnel_auth::MemoryAuthenticator;
use tunnel_config::{
    CliOverrides, Config, ConfigFormat, LoggingConfig, apply_overrides, load_config,
    load_config_reader, load_default_config, validate_config,
};
use tunnel_redirector::{Redirector, RedirectorConfig};

use crate::CancellationToken;
use crate::registry::{AssemblyContext, Registry, build_proxy};

/// Tunnel proxy CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tunnel-proxy", version, about = "Composable tunneling proxy")]
pub struct ProxyArgs {
    /// Config file path (json/yaml/toml). Defaults to config.{json,yml,yaml,toml}
    #[arg(short, long, conflicts_with = "stdin_format")]
    pub config: Option<PathBuf>,

    /// Read the config from standard input in this format
    #[arg(long, value_enum)]
    pub stdin_format: Option<ConfigFormat>,

    #[command(flatten)]
    pub overrides: CliOverrides,
}

/// Run the proxy with the given arguments.
///
/// This is the main entry point for the proxy CLI, used by both the
/// standalone binary and the unified tunnel-rs CLI.
pub async fn run(args: ProxyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = read_config(&args)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;

    init_tracing(&config.logging)?;

    if let Some(listen) = &config.metrics.listen {
        match tunnel_metrics::init_prometheus(listen) {
            Ok(()) => info!("metrics exporter listening on {}", listen),
            Err(e) => warn!("failed to start metrics exporter: {}", e),
        }
    }

    // Set up graceful shutdown on SIGTERM/SIGINT
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let authenticator = Arc::new(MemoryAuthenticator::from_passwords(&config.password));
    info!(users = authenticator.len(), "authenticator ready");

    let redirector = Redirector::new(
        &RedirectorConfig {
            workers: config.redirector.workers,
            queue_capacity: config.redirector.queue_capacity,
            buffer_size: config.relay.buffer_size,
        },
        &shutdown,
    );

    let registry = Registry::with_defaults();
    let ctx = AssemblyContext {
        config: Arc::new(config),
        shutdown: shutdown.clone(),
        authenticator,
        redirector,
    };
    let proxy = Arc::new(build_proxy(&registry, ctx).await?);
    let result = proxy.run().await;

    // Stop the redirector workers too when the proxy stopped on its own.
    shutdown.cancel();
    result?;
    Ok(())
}

fn read_config(args: &ProxyArgs) -> Result<Config, tunnel_config::ConfigError> {
    match (&args.config, args.stdin_format) {
        (Some(path), _) => load_config(path),
        (None, Some(format)) => load_config_reader(io::stdin().lock(), format),
        (None, None) => load_default_config("."),
    }
}

/// Resolves on the first Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal_handler() {
    let ctrl_c = async { log_ctrl_c_failure(tokio::signal::ctrl_c().await).await };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// A failed Ctrl+C registration must not read as a shutdown request.
async fn log_ctrl_c_failure(res: io::Result<()>) {
    if let Err(e) = res {
        warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
}

/// Build the filter directive string from the base level and per-module
/// filters.
fn filter_directives(config: &LoggingConfig) -> String {
    let mut filter_str = config.level.as_deref().unwrap_or("info").to_string();
    let mut filters: Vec<_> = config.filters.iter().collect();
    filters.sort();
    for (module, level) in filters {
        filter_str.push(',');
        filter_str.push_str(module);
        filter_str.push('=');
        filter_str.push_str(level);
    }
    filter_str
}

/// Install the global subscriber described by `config`.
///
/// The console layer honours `format` (json, compact, pretty) and `output`
/// (stdout, stderr). A `file`, when set, is opened in append mode and gets
/// an extra plain-text layer. The filter applies to every layer.
fn init_tracing(config: &LoggingConfig) -> io::Result<()> {
    let filter =
        EnvFilter::try_new(filter_directives(config)).unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match config.output.as_deref() {
        Some("stdout") => BoxMakeWriter::new(io::stdout),
        _ => BoxMakeWriter::new(io::stderr),
    };
    let console = match config.format.as_deref() {
        Some("json") => fmt::layer().json().with_writer(writer).boxed(),
        Some("compact") => fmt::layer().compact().with_writer(writer).boxed(),
        _ => fmt::layer().with_writer(writer).boxed(),
    };

    let file_layer = match &config.file {
        Some(path) => {
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let mut config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "info");

        config.level = Some("debug".into());
        config.filters.insert("tunnel::tproxy".into(), "trace".into());
        config.filters.insert("tunnel::adapter".into(), "warn".into());
        assert_eq!(
            filter_directives(&config),
            "debug,tunnel::adapter=warn,tunnel::tproxy=trace"
        );
    }

    #[test]
    fn test_args_parse() {
        let args = ProxyArgs::try_parse_from([
            "tunnel-proxy",
            "--stdin-format",
            "yaml",
            "--run-type",
            "nat",
            "--password",
            "a,b",
        ])
        .unwrap();
        assert_eq!(args.stdin_format, Some(ConfigFormat::Yaml));
        assert!(args.config.is_none());
        assert_eq!(args.overrides.run_type.as_deref(), Some("nat"));
        assert_eq!(
            args.overrides.password,
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_config_conflicts_with_stdin() {
        let res = ProxyArgs::try_parse_from([
            "tunnel-proxy",
            "--config",
            "config.json",
            "--stdin-format",
            "json",
        ]);
        assert!(res.is_err());
    }
}
