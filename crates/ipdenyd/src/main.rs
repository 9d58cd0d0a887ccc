// # ipdenyd - ipdeny block database job
//
// The ipdenyd binary is a THIN integration layer. All reconciliation,
// lookup and bootstrap logic lives in ipdeny-core; this binary only:
// 1. Parses the command line
// 2. Reads configuration from environment variables
// 3. Initializes logging and the runtime
// 4. Registers the store and source adapters
// 5. Runs one command and maps its outcome to an exit code
//
// ## Commands
//
// - `install`: create the schema, seed countries, load every block
// - `update`: reconcile every country against fresh snapshots
// - `lookup <ip>`: record an address under its covering block
// - `country <ip>`: print the country owning an address
//
// Scheduling `update` (cron, systemd timer) and making sure two runs never
// overlap is the operator's job.
//
// ## Configuration
//
// ### Store
// - `IPDENY_STORE_TYPE`: Type of block store (sql, memory). Default: sql
// - `IPDENY_DATABASE_URL`: `sqlite:` or `postgres:` URL (for sql)
//
// ### Source
// - `IPDENY_METADATA_URL`: Country listing page
// - `IPDENY_IPV4_ARCHIVE_URL`: IPv4 all-zones archive
// - `IPDENY_IPV6_ARCHIVE_URL`: IPv6 all-zones archive
//
// ### Engine
// - `IPDENY_FETCH_TIMEOUT_SECS`: Deadline per snapshot download
// - `IPDENY_FAMILIES`: Comma-separated families to process (4,6)
// - `IPDENY_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export IPDENY_DATABASE_URL='sqlite:/var/lib/ipdeny/ipdeny.db?mode=rwc'
//
// ipdenyd install
// ipdenyd update
// ipdenyd country 8.8.8.8
// ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use ipdeny_core::bootstrap::{bootstrap, is_bootstrapped};
use ipdeny_core::config::{
    DEFAULT_IPV4_ARCHIVE_URL, DEFAULT_IPV6_ARCHIVE_URL, DEFAULT_METADATA_URL,
};
use ipdeny_core::{
    AdapterRegistry, AddressFamily, BlockStore, EngineConfig, IpdenyConfig, Lookup,
    ReconcileEvent, Reconciler, RunReport, SourceConfig, StoreConfig,
};
use std::env;
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit codes for different termination scenarios
///
/// - 0: Command completed
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
/// - 3: Run completed but some units or fetches failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpdenyExitCode {
    /// Command completed
    Success = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
    /// Some units failed; see the report
    PartialFailure = 3,
}

impl From<IpdenyExitCode> for ExitCode {
    fn from(code: IpdenyExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

#[derive(Parser)]
#[command(name = "ipdenyd")]
#[command(author, version, about = "Per-country IP block database kept in sync with ipdeny.com")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema, seed countries and load every block (run once)
    Install,

    /// Reconcile every country against freshly downloaded snapshots
    Update,

    /// Record an address under its covering block and print the row
    Lookup {
        /// Address to look up
        ip: IpAddr,
    },

    /// Print the country owning an address
    Country {
        /// Address to resolve
        ip: IpAddr,
    },
}

/// Application configuration
struct Config {
    store_type: String,
    database_url: Option<String>,
    metadata_url: String,
    ipv4_archive_url: String,
    ipv6_archive_url: String,
    fetch_timeout_secs: u64,
    families: Vec<AddressFamily>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let fetch_timeout_secs = match env::var("IPDENY_FETCH_TIMEOUT_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                anyhow::anyhow!("IPDENY_FETCH_TIMEOUT_SECS must be a number. Got: {}", raw)
            })?,
            Err(_) => EngineConfig::default().fetch_timeout_secs,
        };

        let families = match env::var("IPDENY_FAMILIES") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<AddressFamily>())
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => AddressFamily::ALL.to_vec(),
        };

        Ok(Self {
            store_type: env::var("IPDENY_STORE_TYPE").unwrap_or_else(|_| "sql".to_string()),
            database_url: env::var("IPDENY_DATABASE_URL").ok(),
            metadata_url: env::var("IPDENY_METADATA_URL")
                .unwrap_or_else(|_| DEFAULT_METADATA_URL.to_string()),
            ipv4_archive_url: env::var("IPDENY_IPV4_ARCHIVE_URL")
                .unwrap_or_else(|_| DEFAULT_IPV4_ARCHIVE_URL.to_string()),
            ipv6_archive_url: env::var("IPDENY_IPV6_ARCHIVE_URL")
                .unwrap_or_else(|_| DEFAULT_IPV6_ARCHIVE_URL.to_string()),
            fetch_timeout_secs,
            families,
            log_level: env::var("IPDENY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration and build the library config from it
    fn validate(&self) -> Result<IpdenyConfig> {
        let store = match self.store_type.as_str() {
            "sql" => match self.database_url.as_deref() {
                Some(url) if !url.is_empty() => StoreConfig::Sql {
                    url: url.to_string(),
                },
                _ => anyhow::bail!(
                    "IPDENY_DATABASE_URL is required when IPDENY_STORE_TYPE=sql. \
                    Set it via: export IPDENY_DATABASE_URL='sqlite:/var/lib/ipdeny/ipdeny.db?mode=rwc'"
                ),
            },
            "memory" => StoreConfig::Memory,
            other => anyhow::bail!(
                "IPDENY_STORE_TYPE '{}' is not supported. \
                Supported types: sql, memory",
                other
            ),
        };

        let request_timeout_secs = match SourceConfig::default() {
            SourceConfig::Http {
                request_timeout_secs,
                ..
            } => request_timeout_secs.min(self.fetch_timeout_secs),
            SourceConfig::Custom { .. } => self.fetch_timeout_secs,
        };

        let config = IpdenyConfig {
            store,
            source: SourceConfig::Http {
                metadata_url: self.metadata_url.clone(),
                ipv4_archive_url: self.ipv4_archive_url.clone(),
                ipv6_archive_url: self.ipv6_archive_url.clone(),
                request_timeout_secs,
            },
            engine: EngineConfig {
                fetch_timeout_secs: self.fetch_timeout_secs,
                families: self.families.clone(),
                ..EngineConfig::default()
            },
        };
        config.validate()?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "IPDENY_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return IpdenyExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    let ipdeny_config = match config.validate() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return IpdenyExitCode::ConfigError.into();
        }
    };

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return IpdenyExitCode::ConfigError.into();
    }

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return IpdenyExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        match run_command(cli.command, ipdeny_config).await {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                IpdenyExitCode::RuntimeError
            }
        }
    });

    result.into()
}

/// Build the adapter registry with every compiled-in adapter
fn registry() -> AdapterRegistry {
    let registry = AdapterRegistry::with_builtins();

    #[cfg(feature = "sql")]
    {
        debug!("Registering SQL block store");
        ipdeny_store_sql::register(&registry);
    }

    #[cfg(feature = "http")]
    {
        debug!("Registering HTTP snapshot source");
        ipdeny_source_http::register(&registry);
    }

    registry
}

/// Run one command
async fn run_command(command: Command, config: IpdenyConfig) -> Result<IpdenyExitCode> {
    let registry = registry();
    let store = registry.create_store(&config.store).await?;
    info!("Using {} block store", config.store.type_name());

    match command {
        Command::Install => {
            if is_bootstrapped(store.as_ref()).await? {
                error!("Database already holds countries; use `ipdenyd update` instead");
                return Ok(IpdenyExitCode::ConfigError);
            }

            let source = registry.create_source(&config.source)?;
            let (reconciler, events) = Reconciler::new(store.clone(), config.engine)?;
            let drain = tokio::spawn(log_events(events));

            let report = bootstrap(store.as_ref(), source.as_ref(), &reconciler).await?;
            drop(reconciler);
            let _ = drain.await;

            Ok(finish(&report)?)
        }

        Command::Update => {
            if !is_bootstrapped(store.as_ref()).await? {
                error!("Database has no countries; run `ipdenyd install` first");
                return Ok(IpdenyExitCode::ConfigError);
            }

            let source = registry.create_source(&config.source)?;
            let (reconciler, events) = Reconciler::new(store.clone(), config.engine)?;
            let drain = tokio::spawn(log_events(events));

            let report = reconciler.run(source.as_ref()).await;
            drop(reconciler);
            let _ = drain.await;

            Ok(finish(&report)?)
        }

        Command::Lookup { ip } => {
            let lookup = Lookup::new(store.clone());
            let observed = lookup.get_or_create_address(ip).await?;
            let block = store.block_by_id(observed.block_id).await?;
            let country = match &block {
                Some(b) => store.country_by_id(b.country_id).await?,
                None => None,
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "address": observed,
                    "block": block,
                    "country": country,
                }))?
            );
            Ok(IpdenyExitCode::Success)
        }

        Command::Country { ip } => {
            let lookup = Lookup::new(store);
            let country = lookup.country_of(ip).await?;
            if country.is_none() {
                warn!("No stored block covers {}", ip);
            }
            println!("{}", serde_json::to_string_pretty(&country)?);
            Ok(IpdenyExitCode::Success)
        }
    }
}

/// Print the run report and pick the exit code
fn finish(report: &RunReport) -> Result<IpdenyExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);

    if report.is_clean() {
        info!(
            "Done: {} added, {} removed, {} migrated",
            report.total_added(),
            report.total_removed(),
            report.total_migrated()
        );
        Ok(IpdenyExitCode::Success)
    } else {
        for failure in &report.failures {
            match failure.country {
                Some(code) => error!("{} {} failed: {}", code, failure.family, failure.message),
                None => error!("{} fetch failed: {}", failure.family, failure.message),
            }
        }
        Ok(IpdenyExitCode::PartialFailure)
    }
}

/// Log engine events until the reconciler is dropped
async fn log_events(mut events: mpsc::Receiver<ReconcileEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ReconcileEvent::UnitReconciled {
                country,
                family,
                added,
                removed,
                migrated,
            } if added + removed + migrated > 0 => {
                debug!("{} {} changed (+{} -{} ~{})", country, family, added, removed, migrated)
            }
            ReconcileEvent::Finished { reconciled, failed } => {
                debug!("Run finished: {} reconciled, {} failed", reconciled, failed)
            }
            _ => {}
        }
    }
}
