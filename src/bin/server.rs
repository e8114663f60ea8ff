use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tftpd::audit::AuditLogger;
use tftpd::config::{self, LogFormat, TftpConfig};
use tftpd::error::{Result, TftpError};
use tftpd::privilege;
use tftpd::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "tftpd", about = "A minimal RFC 1350 TFTP server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/tftpd/tftpd.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit.
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind).
    #[arg(long)]
    check_config: bool,

    /// Create the root directory if it does not exist.
    #[arg(long)]
    create_root_dir: bool,

    /// Root directory to serve files from.
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the TFTP server.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Increase log verbosity (overrides logging.level).
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        match config::load_config(&cli.config) {
            Ok(cfg) => {
                AuditLogger::configuration_loaded(&cli.config);
                cfg
            }
            Err(err) => {
                AuditLogger::configuration_error(&err.to_string());
                return Err(err);
            }
        }
    } else {
        TftpConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        cfg.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        cfg.bind_addr = bind_addr;
    }
    if cli.verbose {
        cfg.logging.level = "debug".to_string();
    }

    if cli.init_config {
        config::write_default_config(&cli.config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&cfg.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&cfg.root_dir).await?;
    }

    if cli.check_config {
        if let Err(err) = config::validate_config(&cfg, false) {
            AuditLogger::configuration_error(&err.to_string());
            return Err(err);
        }
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    if let Err(err) = config::validate_config(&cfg, true) {
        AuditLogger::configuration_error(&err.to_string());
        return Err(err);
    }
    init_logging(&cfg)?;

    let dispatcher = Dispatcher::bind(Arc::new(cfg.clone())).await?;

    if cfg.logging.audit_enabled {
        AuditLogger::server_started(cfg.bind_addr, &cfg.root_dir);
    }

    // Drop privileges only after the (possibly privileged) bind above.
    privilege::drop_privileges(&cfg.privilege)?;

    let dispatcher = Arc::new(dispatcher);
    let run_handle = Arc::clone(&dispatcher);

    tokio::select! {
        result = run_handle.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if cfg.logging.audit_enabled {
        AuditLogger::server_shutdown();
    }

    Ok(())
}

/// Initialize tracing, optionally tee'd to a rolling log file, per the
/// configured format. AU-9/AU-12: audit records stay on disk across a
/// restart, independent of the terminal the process was launched from.
fn init_logging(cfg: &TftpConfig) -> Result<()> {
    let builder_filter = EnvFilter::new(cfg.logging.level.clone());

    if let Some(ref log_file) = cfg.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TftpError::Tftp("logging.file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard: the server runs for the lifetime of the process,
        // so there is no later point at which flushing on drop matters.
        std::mem::forget(guard);

        match cfg.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(builder_filter)
                .with_writer(non_blocking)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(builder_filter)
                .with_writer(non_blocking)
                .init(),
        }
    } else {
        match cfg.logging.format {
            LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(builder_filter).init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(builder_filter).init(),
        }
    }

    Ok(())
}
