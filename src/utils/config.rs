// src/utils/config.rs
use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::env;

use crate::matching::score::MAX_SCORE;
use crate::matching::strategy::DEFAULT_FUZZY_THRESHOLD;
use crate::models::core::SourceSystem;

pub const DEFAULT_PAGE_SIZE: usize = 200;

/// One direction of a bulk pass: records of `source` looking for a counterpart in `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPair {
    pub source: SourceSystem,
    pub target: SourceSystem,
}

impl SystemPair {
    pub fn new(source: SourceSystem, target: SourceSystem) -> Self {
        Self { source, target }
    }
}

#[derive(Debug, Clone)]
pub struct ReconConfig {
    /// Source of truth when linked records disagree.
    pub master_system: SourceSystem,
    /// Processed in order by a bulk run.
    pub pairs: Vec<SystemPair>,
    pub fuzzy_threshold: u32,
    pub page_size: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            master_system: SourceSystem::Pm,
            pairs: vec![
                SystemPair::new(SourceSystem::Photo, SourceSystem::Pm),
                SystemPair::new(SourceSystem::Crm, SourceSystem::Pm),
            ],
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ReconConfig {
    /// Reads RECON_* variables, falling back to defaults for anything missing
    /// or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let master_system = match env::var("RECON_MASTER_SYSTEM") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("Ignoring RECON_MASTER_SYSTEM: {}", e);
                defaults.master_system
            }),
            Err(_) => defaults.master_system,
        };

        let pairs = match env::var("RECON_PAIRS") {
            Ok(raw) => match parse_pairs(&raw) {
                Ok(pairs) if !pairs.is_empty() => pairs,
                Ok(_) => defaults.pairs.clone(),
                Err(e) => {
                    warn!("Ignoring RECON_PAIRS: {}", e);
                    defaults.pairs.clone()
                }
            },
            Err(_) => defaults.pairs.clone(),
        };

        let fuzzy_threshold = env::var("RECON_FUZZY_THRESHOLD")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.fuzzy_threshold);

        let page_size = env::var("RECON_PAGE_SIZE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.page_size);

        let config = Self {
            master_system,
            pairs,
            fuzzy_threshold,
            page_size,
        };
        debug!("Reconciliation config: {:?}", config);
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            bail!("at least one source:target pair is required");
        }
        for pair in &self.pairs {
            if pair.source == pair.target {
                bail!("pair {}:{} links a system to itself", pair.source, pair.target);
            }
        }
        if self.fuzzy_threshold == 0 || self.fuzzy_threshold > MAX_SCORE {
            bail!("fuzzy threshold must be between 1 and {}", MAX_SCORE);
        }
        if self.page_size == 0 {
            bail!("page size must be positive");
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("🔧 Reconciliation configuration:");
        info!("   • Master system: {}", self.master_system);
        for pair in &self.pairs {
            info!("   • Pair: {} → {}", pair.source, pair.target);
        }
        info!("   • Fuzzy threshold: {}", self.fuzzy_threshold);
        info!("   • Page size: {}", self.page_size);
    }
}

/// Parses `photo:pm,crm:pm`.
pub fn parse_pairs(raw: &str) -> Result<Vec<SystemPair>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (source, target) = entry
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("expected source:target, got '{}'", entry))?;
            let source: SourceSystem = source.parse().map_err(anyhow::Error::msg)?;
            let target: SourceSystem = target.parse().map_err(anyhow::Error::msg)?;
            Ok(SystemPair::new(source, target))
        })
        .collect()
}
