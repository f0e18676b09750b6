//! Dispatch service configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded below
//! 2. **Config file**: optional TOML file
//! 3. **Environment variables**: `LATTICE_*` overrides
//!
//! Validation happens at load time: a zero timeout, duplicate secondary
//! names, an unknown key handler, or an unparseable expression returns an
//! error rather than failing silently at dispatch time.
//!
//! # Example
//!
//! ```toml
//! primary_address = "10.0.0.5:50053"
//! dispatch_overall_timeout_seconds = 60
//! key_handler = "direct"
//!
//! [[secondaries]]
//! name = "secondary"
//! address = "10.0.1.5:50053"
//!
//! [expressions]
//! check = "request.resource_relation.namespace == 'bigtenant' ? ['secondary'] : []"
//! lookupresources = "['secondary']"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{
    parse_dispatch_expression, ClusterDispatcher, ClusterDispatcherConfig, DirectKeyHandler,
    DispatchExpr, ExpressionError, RequestKind, SecondaryDispatch,
};
use crate::wire::WireDispatchClient;

/// Fingerprinting strategies recognized in configuration.
const KNOWN_KEY_HANDLERS: &[&str] = &["direct"];

#[derive(Error, Debug)]
pub enum DispatchConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid dispatch configuration: {0}")]
    Invalid(String),

    #[error("invalid `{kind}` expression: {source}")]
    Expression {
        kind: String,
        #[source]
        source: ExpressionError,
    },

    #[error("failed to connect to dispatch peer `{name}`: {message}")]
    Connect { name: String, message: String },
}

/// A named secondary dispatch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryEndpointConfig {
    pub name: String,
    pub address: String,
}

/// Top-level configuration for a cluster dispatcher instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchServiceConfig {
    /// Address of the primary dispatch peer.
    pub primary_address: String,

    /// Hard cap on the wall time of a single dispatch call. Defaults to 60.
    #[serde(default = "default_overall_timeout_seconds")]
    pub dispatch_overall_timeout_seconds: u64,

    /// Fingerprinting strategy. Defaults to `direct`.
    #[serde(default = "default_key_handler")]
    pub key_handler: String,

    /// Hedged secondary peers, keyed by unique name.
    #[serde(default)]
    pub secondaries: Vec<SecondaryEndpointConfig>,

    /// Per-operation hedging expressions, keyed by operation kind
    /// (`check`, `expand`, `lookupresources`, `lookupsubjects`).
    #[serde(default)]
    pub expressions: HashMap<String, String>,
}

fn default_overall_timeout_seconds() -> u64 {
    60
}

fn default_key_handler() -> String {
    "direct".to_string()
}

impl DispatchServiceConfig {
    /// Loads configuration from defaults, an optional TOML file, and
    /// `LATTICE_*` environment variables, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, DispatchConfigError> {
        let mut builder = Config::builder()
            .set_default("dispatch_overall_timeout_seconds", default_overall_timeout_seconds())?
            .set_default("key_handler", default_key_handler())?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(Environment::with_prefix("LATTICE").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates invariants the serde layer cannot express.
    pub fn validate(&self) -> Result<(), DispatchConfigError> {
        if self.primary_address.is_empty() {
            return Err(DispatchConfigError::Invalid("primary_address must be set".into()));
        }
        if self.dispatch_overall_timeout_seconds == 0 {
            return Err(DispatchConfigError::Invalid(
                "dispatch_overall_timeout_seconds must be greater than zero".into(),
            ));
        }
        if !KNOWN_KEY_HANDLERS.contains(&self.key_handler.as_str()) {
            return Err(DispatchConfigError::Invalid(format!(
                "unknown key_handler `{}`; known handlers: {}",
                self.key_handler,
                KNOWN_KEY_HANDLERS.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for secondary in &self.secondaries {
            if secondary.name.is_empty() || secondary.address.is_empty() {
                return Err(DispatchConfigError::Invalid(
                    "secondaries require both a name and an address".into(),
                ));
            }
            if !names.insert(secondary.name.as_str()) {
                return Err(DispatchConfigError::Invalid(format!(
                    "duplicate secondary name `{}`",
                    secondary.name
                )));
            }
        }

        self.parsed_expressions()?;
        Ok(())
    }

    /// Compiles the configured expressions against their operation kinds.
    pub fn parsed_expressions(
        &self,
    ) -> Result<HashMap<RequestKind, DispatchExpr>, DispatchConfigError> {
        let mut parsed = HashMap::with_capacity(self.expressions.len());
        for (kind_name, source) in &self.expressions {
            let kind = RequestKind::parse(kind_name).map_err(|source| {
                DispatchConfigError::Expression { kind: kind_name.clone(), source }
            })?;
            let expression = parse_dispatch_expression(kind, source).map_err(|source| {
                DispatchConfigError::Expression { kind: kind_name.clone(), source }
            })?;
            parsed.insert(kind, expression);
        }
        Ok(parsed)
    }

    #[must_use]
    pub fn dispatch_overall_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_overall_timeout_seconds)
    }

    #[must_use]
    pub fn cluster_config(&self) -> ClusterDispatcherConfig {
        ClusterDispatcherConfig {
            key_handler: Arc::new(DirectKeyHandler),
            dispatch_overall_timeout: self.dispatch_overall_timeout(),
        }
    }

    /// Dials the configured peers and assembles a cluster dispatcher.
    pub async fn connect(&self) -> Result<ClusterDispatcher, DispatchConfigError> {
        let primary = WireDispatchClient::connect(&self.primary_address)
            .await
            .map_err(|e| DispatchConfigError::Connect {
                name: "primary".into(),
                message: e.to_string(),
            })?;

        let mut secondaries = Vec::with_capacity(self.secondaries.len());
        for endpoint in &self.secondaries {
            let client = WireDispatchClient::connect(&endpoint.address)
                .await
                .map_err(|e| DispatchConfigError::Connect {
                    name: endpoint.name.clone(),
                    message: e.to_string(),
                })?;
            secondaries.push(SecondaryDispatch::new(endpoint.name.clone(), Arc::new(client)));
        }

        Ok(ClusterDispatcher::new(
            Arc::new(primary),
            self.cluster_config(),
            secondaries,
            self.parsed_expressions()?,
        ))
    }
}
