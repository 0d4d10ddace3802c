//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::batch::{BatchScope, FlushPolicy};
use crate::config::{
    Config, ConfigError, ENV_BATCH_BYTES, ENV_BATCH_LINES, ENV_COMPONENTS, ENV_EXTENSION,
    ENV_REQUEST_TIMEOUT_SECS, ENV_URL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    Member,
    Run,
}

impl From<ScopeArg> for BatchScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Member => BatchScope::PerMember,
            ScopeArg::Run => BatchScope::PerRun,
        }
    }
}

/// Replay CLEF logs from test-run archives into Seq.
#[derive(Debug, Parser)]
#[command(name = "archive-shipper", version, about)]
pub struct Cli {
    /// Tar archives (optionally gzip-compressed) to ship, in order
    #[arg(required = true, value_name = "ARCHIVE")]
    pub archives: Vec<PathBuf>,

    /// Seq raw-events URL
    #[arg(long)]
    pub url: Option<String>,

    /// Flush a batch before it would exceed this many bytes
    #[arg(long, conflicts_with = "batch_lines")]
    pub batch_bytes: Option<usize>,

    /// Flush a batch every N decoded lines instead of by size
    #[arg(long)]
    pub batch_lines: Option<usize>,

    /// Cut batches at every member or only at the end of an archive
    #[arg(long, value_enum)]
    pub batch_scope: Option<ScopeArg>,

    /// Component name substring to ship (repeatable)
    #[arg(long = "component", value_name = "NAME")]
    pub components: Vec<String>,

    /// Required member file extension
    #[arg(long)]
    pub extension: Option<String>,

    /// Only ship envelopes that carry an `@t` timestamp
    #[arg(long, overrides_with = "no_require_timestamp")]
    pub require_timestamp: bool,

    /// Ship envelopes without an `@t` timestamp too
    #[arg(long, overrides_with = "require_timestamp")]
    pub no_require_timestamp: bool,

    /// Retries on connection failures before giving up
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// HTTP request timeout in seconds
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
}

impl Cli {
    /// Override `config` with every flag given on the command line.
    ///
    /// Validation errors about a value that came from a flag name the flag
    /// rather than the environment variable.
    pub fn apply(&self, mut config: Config) -> Result<Config, ConfigError> {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(bytes) = self.batch_bytes {
            config.flush_policy = FlushPolicy::Bytes(bytes);
        }
        if let Some(lines) = self.batch_lines {
            config.flush_policy = FlushPolicy::Lines(lines);
        }
        if let Some(scope) = self.batch_scope {
            config.batch_scope = scope.into();
        }
        if !self.components.is_empty() {
            config.components = self.components.clone();
        }
        if let Some(extension) = &self.extension {
            config.extension = extension.clone();
        }
        if self.require_timestamp {
            config.require_timestamp = true;
        } else if self.no_require_timestamp {
            config.require_timestamp = false;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }

        config.validate().map_err(|e| match self.flag_for(e.var()) {
            Some(flag) => ConfigError::invalid(flag, e.message()),
            None => e,
        })?;
        Ok(config)
    }

    /// Flag that set the value checked under `var`, if one was given.
    fn flag_for(&self, var: &str) -> Option<&'static str> {
        let (flag, given) = match var {
            ENV_URL => ("--url", self.url.is_some()),
            ENV_BATCH_BYTES => ("--batch-bytes", self.batch_bytes.is_some()),
            ENV_BATCH_LINES => ("--batch-lines", self.batch_lines.is_some()),
            ENV_COMPONENTS => ("--component", !self.components.is_empty()),
            ENV_EXTENSION => ("--extension", self.extension.is_some()),
            ENV_REQUEST_TIMEOUT_SECS => (
                "--request-timeout-secs",
                self.request_timeout_secs.is_some(),
            ),
            _ => return None,
        };
        given.then_some(flag)
    }
}
