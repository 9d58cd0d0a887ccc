//! Configuration types for the ipdeny system
//!
//! This module defines all configuration structures used throughout the crate.
//! Nothing here reads files or the environment: the caller builds an
//! [`IpdenyConfig`] and passes it in.

use serde::{Deserialize, Serialize};

use crate::model::AddressFamily;

/// Default country metadata page
pub const DEFAULT_METADATA_URL: &str = "https://www.ipdeny.com/ipblocks/";

/// Default IPv4 all-zones archive
pub const DEFAULT_IPV4_ARCHIVE_URL: &str =
    "https://www.ipdeny.com/ipblocks/data/countries/all-zones.tar.gz";

/// Default IPv6 all-zones archive
pub const DEFAULT_IPV6_ARCHIVE_URL: &str =
    "https://www.ipdeny.com/ipv6/ipaddresses/blocks/ipv6-all-zones.tar.gz";

/// Main ipdeny configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpdenyConfig {
    /// Block store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Snapshot source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl IpdenyConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.store.validate()?;
        self.source.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Block store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Relational store reached through a connection URL
    Sql {
        /// `sqlite:` or `postgres:` connection URL
        url: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// Custom block store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StoreConfig::Sql { url } => {
                if url.is_empty() {
                    return Err(crate::Error::config("SQL store URL cannot be empty"));
                }
                if !(url.starts_with("sqlite:")
                    || url.starts_with("postgres:")
                    || url.starts_with("postgresql:"))
                {
                    return Err(crate::Error::config(format!(
                        "SQL store URL must use the sqlite or postgres scheme, got '{}'",
                        url
                    )));
                }
                Ok(())
            }
            StoreConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom store factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom store config cannot be null"));
                }
                Ok(())
            }
            StoreConfig::Memory => Ok(()),
        }
    }

    /// Get the store type name
    pub fn type_name(&self) -> &str {
        match self {
            StoreConfig::Sql { .. } => "sql",
            StoreConfig::Memory => "memory",
            StoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Snapshot source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// ipdeny.com style HTTP endpoints
    Http {
        /// Country metadata page
        #[serde(default = "default_metadata_url")]
        metadata_url: String,
        /// IPv4 all-zones archive
        #[serde(default = "default_ipv4_archive_url")]
        ipv4_archive_url: String,
        /// IPv6 all-zones archive
        #[serde(default = "default_ipv6_archive_url")]
        ipv6_archive_url: String,
        /// Per-request timeout in seconds
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },

    /// Custom snapshot source
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl SourceConfig {
    /// Validate the source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            SourceConfig::Http {
                metadata_url,
                ipv4_archive_url,
                ipv6_archive_url,
                request_timeout_secs,
            } => {
                for (name, url) in [
                    ("metadata", metadata_url),
                    ("IPv4 archive", ipv4_archive_url),
                    ("IPv6 archive", ipv6_archive_url),
                ] {
                    if !url.starts_with("https://") && !url.starts_with("http://") {
                        return Err(crate::Error::config(format!(
                            "{} URL must use HTTP or HTTPS scheme, got '{}'",
                            name, url
                        )));
                    }
                }
                if *request_timeout_secs == 0 {
                    return Err(crate::Error::config("HTTP request timeout must be > 0"));
                }
                Ok(())
            }
            SourceConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom source factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom source config cannot be null"));
                }
                Ok(())
            }
        }
    }

    /// Get the source type name
    pub fn type_name(&self) -> &str {
        match self {
            SourceConfig::Http { .. } => "http",
            SourceConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Http {
            metadata_url: default_metadata_url(),
            ipv4_archive_url: default_ipv4_archive_url(),
            ipv6_archive_url: default_ipv6_archive_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for fetching one family's snapshot (in seconds)
    ///
    /// A fetch that exceeds it aborts that family before any write.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Capacity of the internal event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Families a full run processes, in order
    #[serde(default = "default_families")]
    pub families: Vec<AddressFamily>,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.fetch_timeout_secs == 0 {
            return Err(crate::Error::config("Fetch timeout must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        if self.families.is_empty() {
            return Err(crate::Error::config("At least one address family is required"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            families: default_families(),
        }
    }
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_URL.to_string()
}

fn default_ipv4_archive_url() -> String {
    DEFAULT_IPV4_ARCHIVE_URL.to_string()
}

fn default_ipv6_archive_url() -> String {
    DEFAULT_IPV6_ARCHIVE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_families() -> Vec<AddressFamily> {
    AddressFamily::ALL.to_vec()
}
