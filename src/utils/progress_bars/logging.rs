// src/utils/progress_bars/logging.rs - Logging helpers for reconciliation runs
use log::{debug, info, warn};
use std::time::Instant;

use crate::models::core::SourceSystem;
use crate::models::stats_models::RunSummary;

#[derive(Clone)]
pub struct ReconLogger {
    run_id: String,
    start_time: Instant,
}

impl ReconLogger {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, pair_count: usize, master: SourceSystem) {
        info!(
            "[RECON] 🚀 Starting bulk reconciliation (run ID: {}) across {} system pair(s), \
             master system: {}",
            self.run_id, pair_count, master
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[RECON] 🔄 Phase: {} - {} [+{:.1}s]",
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!("[RECON] 🔄 Phase: {} [+{:.1}s]", phase, elapsed.as_secs_f32()),
        }
    }

    pub fn log_data_loaded(&self, system: SourceSystem, count: usize) {
        info!("[RECON] 📊 Loaded {} {} records", count, system);
    }

    pub fn log_provider_unavailable(&self, system: SourceSystem, reason: &str) {
        warn!("[RECON] ⚠️  {} records unavailable for this run: {}", system, reason);
    }

    pub fn log_pair_start(
        &self,
        source: SourceSystem,
        target: SourceSystem,
        unmatched: usize,
        candidates: usize,
    ) {
        info!(
            "[RECON] 🎯 {} → {}: {} unmatched source records, {} unlinked candidates",
            source, target, unmatched, candidates
        );
    }

    pub fn log_record_error(&self, system: SourceSystem, external_id: &str, error: &str) {
        warn!("[RECON] ❌ {} '{}' failed: {}", system, external_id, error);
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[RECON] {}", message);
    }

    pub fn log_completion(&self, summary: &RunSummary) {
        let elapsed = self.start_time.elapsed();
        info!(
            "[RECON] ✅ Run {} complete in {:.2?}: {} matched ({} integration, {} fuzzy), \
             {} already matched, {} no match, {} errors, {} conflict lists updated",
            self.run_id,
            elapsed,
            summary.matched,
            summary.matched_via_integration,
            summary.matched_via_fuzzy,
            summary.already_matched,
            summary.no_match,
            summary.errors,
            summary.conflicts_updated
        );
    }
}
