//! Per-provider USD cost accounting.
//!
//! Additive and safe for concurrent writers. The engine resets the per-run
//! ledger when a run completes; the global ledger persists for the life of
//! the process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

/// USD rates per operation. Flat per-call rates except the LLM entries,
/// which are per 1k tokens.
#[derive(Debug, Clone)]
pub struct CostTable {
    rates: BTreeMap<String, f64>,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert("maps.textsearch".to_string(), 0.032);
        rates.insert("maps.details".to_string(), 0.017);
        rates.insert("llm.text_per_1k".to_string(), 0.004);
        rates.insert("llm.vision_per_1k".to_string(), 0.008);
        rates.insert("browser.render".to_string(), 0.002);
        rates.insert("search.query".to_string(), 0.001);
        Self { rates }
    }
}

impl CostTable {
    /// Load a TOML rate table, overlaying the compiled-in defaults.
    /// Unknown keys are accepted; they just never get looked up.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let parsed: BTreeMap<String, f64> = toml::from_str(&content)?;
        let mut table = Self::default();
        table.rates.extend(parsed);
        Ok(table)
    }

    pub fn rate(&self, key: &str) -> f64 {
        self.rates.get(key).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderCost {
    pub calls: u64,
    pub units: u64,
    pub usd: f64,
}

/// A point-in-time view of a ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub by_provider: BTreeMap<String, ProviderCost>,
    pub by_operation: BTreeMap<String, ProviderCost>,
    pub total_usd: f64,
}

#[derive(Default)]
struct Ledger {
    by_provider: BTreeMap<String, ProviderCost>,
    by_operation: BTreeMap<String, ProviderCost>,
    total_usd: f64,
}

impl Ledger {
    fn record(&mut self, provider: &str, operation: &str, usd: f64, units: u64) {
        let p = self.by_provider.entry(provider.to_string()).or_default();
        p.calls += 1;
        p.units += units;
        p.usd += usd;

        let key = format!("{provider}.{operation}");
        let o = self.by_operation.entry(key).or_default();
        o.calls += 1;
        o.units += units;
        o.usd += usd;

        self.total_usd += usd;
    }

    fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            by_provider: self.by_provider.clone(),
            by_operation: self.by_operation.clone(),
            total_usd: self.total_usd,
        }
    }
}

pub struct CostTracker {
    global: Mutex<Ledger>,
    run: Mutex<Ledger>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            global: Mutex::new(Ledger::default()),
            run: Mutex::new(Ledger::default()),
        }
    }

    pub fn record(&self, provider: &str, operation: &str, usd: f64, units: u64) {
        self.global
            .lock()
            .expect("cost ledger lock")
            .record(provider, operation, usd, units);
        self.run
            .lock()
            .expect("cost ledger lock")
            .record(provider, operation, usd, units);
    }

    /// Snapshot of the global (process-lifetime) ledger.
    pub fn snapshot(&self) -> CostSnapshot {
        self.global.lock().expect("cost ledger lock").snapshot()
    }

    /// Snapshot of the per-run ledger.
    pub fn run_snapshot(&self) -> CostSnapshot {
        self.run.lock().expect("cost ledger lock").snapshot()
    }

    /// Take the per-run snapshot and reset the run ledger. Global counters
    /// are untouched.
    pub fn finish_run(&self) -> CostSnapshot {
        let mut run = self.run.lock().expect("cost ledger lock");
        let snapshot = run.snapshot();
        *run = Ledger::default();
        info!(total_usd = snapshot.total_usd, "Run cost finalized");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_additive() {
        let tracker = CostTracker::new();
        tracker.record("maps", "textsearch", 0.032, 1);
        tracker.record("maps", "details", 0.017, 1);
        tracker.record("llm", "text", 0.004, 1200);

        let snap = tracker.snapshot();
        assert_eq!(snap.by_provider["maps"].calls, 2);
        assert_eq!(snap.by_provider["llm"].units, 1200);
        assert!((snap.total_usd - 0.053).abs() < 1e-9);
    }

    #[test]
    fn finish_run_resets_run_but_not_global() {
        let tracker = CostTracker::new();
        tracker.record("browser", "render", 0.002, 1);

        let run = tracker.finish_run();
        assert_eq!(run.by_provider["browser"].calls, 1);

        assert!(tracker.run_snapshot().by_provider.is_empty());
        assert_eq!(tracker.snapshot().by_provider["browser"].calls, 1);

        tracker.record("browser", "render", 0.002, 1);
        assert_eq!(tracker.run_snapshot().by_provider["browser"].calls, 1);
        assert_eq!(tracker.snapshot().by_provider["browser"].calls, 2);
    }

    #[test]
    fn default_table_has_known_rates() {
        let table = CostTable::default();
        assert!(table.rate("maps.textsearch") > 0.0);
        assert!(table.rate("llm.text_per_1k") > 0.0);
        assert_eq!(table.rate("unknown.op"), 0.0);
    }

    #[test]
    fn table_overlay_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.toml");
        std::fs::write(&path, "\"maps.textsearch\" = 0.05\n\"custom.op\" = 1.5\n").unwrap();

        let table = CostTable::load(&path).unwrap();
        assert_eq!(table.rate("maps.textsearch"), 0.05);
        assert_eq!(table.rate("custom.op"), 1.5);
        // Defaults survive for untouched keys
        assert!(table.rate("browser.render") > 0.0);
    }
}
