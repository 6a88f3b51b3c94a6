//! Layered settings for the node and the cranker
//!
//! Defaults, then an optional TOML file, then `ESCROW__*` environment
//! variables (e.g. `ESCROW__CRANKER__POLL_INTERVAL_MS=500`).

use crate::{cranker::CrankerConfig, node::EscrowNodeConfig, ESCROW_PROGRAM_ID};
use config::{Config, Environment, File};
use escrow_core::{EscrowError, EscrowResult, Pubkey};
use serde::Deserialize;
use std::{str::FromStr, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct CrankerSettings {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    pub max_allocation_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rpc_url: String,
    pub keypair_path: String,
    pub escrow_program_id: String,
    /// Refund queue; required by both the node and the cranker
    pub task_queue: Option<String>,
    pub log_filter: String,
    pub cranker: CrankerSettings,
    pub node: NodeSettings,
}

impl Settings {
    /// Load settings, reading `path` if it exists
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let mut builder = Config::builder()
            .set_default("rpc_url", "http://127.0.0.1:8899")
            .and_then(|b| b.set_default("keypair_path", "~/.config/solana/id.json"))
            .and_then(|b| b.set_default("escrow_program_id", ESCROW_PROGRAM_ID.to_string()))
            .and_then(|b| b.set_default("log_filter", "info"))
            .and_then(|b| b.set_default("cranker.poll_interval_ms", 1_000))
            .and_then(|b| b.set_default("cranker.batch_size", 32))
            .and_then(|b| b.set_default("node.max_allocation_attempts", 5))
            .map_err(|e| EscrowError::config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix("ESCROW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EscrowError::config(e.to_string()))
    }

    pub fn escrow_program_id(&self) -> EscrowResult<Pubkey> {
        parse_pubkey("escrow_program_id", &self.escrow_program_id)
    }

    pub fn task_queue(&self) -> EscrowResult<Pubkey> {
        let raw = self
            .task_queue
            .as_deref()
            .ok_or_else(|| EscrowError::config("task_queue is not set"))?;
        parse_pubkey("task_queue", raw)
    }

    pub fn node_config(&self) -> EscrowResult<EscrowNodeConfig> {
        let mut config = EscrowNodeConfig::new(self.task_queue()?);
        config.max_allocation_attempts = self.node.max_allocation_attempts;
        Ok(config)
    }

    pub fn cranker_config(&self, crank_turner: Pubkey) -> EscrowResult<CrankerConfig> {
        if self.cranker.batch_size == 0 {
            return Err(EscrowError::config("cranker.batch_size must be positive"));
        }
        let mut config = CrankerConfig::new(self.task_queue()?, crank_turner);
        config.poll_interval = Duration::from_millis(self.cranker.poll_interval_ms);
        config.batch_size = self.cranker.batch_size;
        Ok(config)
    }
}

fn parse_pubkey(field: &str, raw: &str) -> EscrowResult<Pubkey> {
    Pubkey::from_str(raw).map_err(|e| EscrowError::config(format!("{field}: {e}")))
}
