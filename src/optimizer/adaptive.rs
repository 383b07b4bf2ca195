// Adaptive feedback loop.
//
// After every execution the engine reports per-operator estimated versus
// actual rows. When the top operator mis-estimates by more than the
// deviation factor on K consecutive runs, the cached plan is poisoned and
// the next optimization runs with observed-row hints for the scans that
// drifted.

use dashmap::DashMap;
use std::collections::HashMap;
use tracing::info;

pub const DEFAULT_DEVIATION_FACTOR: f64 = 10.0;
pub const DEFAULT_CONSECUTIVE_RUNS: u32 = 3;

/// What the executor reports per run.
#[derive(Debug, Clone)]
pub struct ExecutionMetrics {
    /// plan-cache key identity
    pub plan_key: u64,
    /// (operator label, estimated rows, actual rows), preorder
    pub operators: Vec<(String, f64, u64)>,
    pub elapsed_ms: f64,
}

#[derive(Default)]
struct MisEstimateState {
    consecutive: u32,
}

pub struct AdaptiveFeedback {
    deviation_factor: f64,
    required_runs: u32,
    state: DashMap<u64, MisEstimateState>,
    /// alias -> observed rows, kept until the next successful optimization
    hints: DashMap<u64, HashMap<String, f64>>,
}

impl AdaptiveFeedback {
    pub fn new(deviation_factor: f64, required_runs: u32) -> Self {
        Self {
            deviation_factor,
            required_runs,
            state: DashMap::new(),
            hints: DashMap::new(),
        }
    }

    /// Record one run. Returns true when the plan crossed the threshold and
    /// must be invalidated and re-optimized.
    pub fn record(&self, metrics: &ExecutionMetrics) -> bool {
        let Some((top_label, est, actual)) = metrics.operators.first().cloned() else {
            return false;
        };
        let deviated = deviates(est, actual, self.deviation_factor);

        let mut state = self.state.entry(metrics.plan_key).or_default();
        if deviated {
            state.consecutive += 1;
        } else {
            state.consecutive = 0;
            return false;
        }
        if state.consecutive < self.required_runs {
            return false;
        }
        state.consecutive = 0;
        drop(state);

        // harvest scan-level observations as cardinality hints
        let mut hints = HashMap::new();
        for (label, est, actual) in &metrics.operators {
            if let Some(alias) = scan_alias(label) {
                if deviates(*est, *actual, self.deviation_factor) {
                    hints.insert(alias, *actual as f64);
                }
            }
        }
        // the top operator itself may be the scan
        if hints.is_empty() {
            if let Some(alias) = scan_alias(&top_label) {
                hints.insert(alias, actual as f64);
            }
        }
        info!(
            plan_key = metrics.plan_key,
            top = %top_label,
            estimated = est,
            actual,
            hints = hints.len(),
            "plan marked mis-estimated"
        );
        self.hints.insert(metrics.plan_key, hints);
        true
    }

    /// Hints for re-optimizing a poisoned plan, consumed on read.
    pub fn take_hints(&self, plan_key: u64) -> HashMap<String, f64> {
        self.hints
            .remove(&plan_key)
            .map(|(_, h)| h)
            .unwrap_or_default()
    }
}

fn deviates(estimated: f64, actual: u64, factor: f64) -> bool {
    let est = estimated.max(1.0);
    let act = (actual as f64).max(1.0);
    est / act > factor || act / est > factor
}

/// "SeqScan(a)" / "IndexScan(a.idx)" -> alias "a"
fn scan_alias(label: &str) -> Option<String> {
    let inner = label
        .strip_prefix("SeqScan(")
        .or_else(|| label.strip_prefix("IndexScan("))
        .or_else(|| label.strip_prefix("IndexOnlyScan("))
        .or_else(|| label.strip_prefix("BitmapOrScan("))?;
    let inner = inner.strip_suffix(')')?;
    Some(inner.split('.').next().unwrap_or(inner).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(key: u64, est: f64, actual: u64) -> ExecutionMetrics {
        ExecutionMetrics {
            plan_key: key,
            operators: vec![("SeqScan(t)".to_string(), est, actual)],
            elapsed_ms: 1.0,
        }
    }

    #[test]
    fn test_invalidates_on_third_consecutive_run() {
        let fb = AdaptiveFeedback::new(10.0, 3);
        assert!(!fb.record(&metrics(1, 100.0, 5000)));
        assert!(!fb.record(&metrics(1, 100.0, 5000)));
        assert!(fb.record(&metrics(1, 100.0, 5000)));
        let hints = fb.take_hints(1);
        assert_eq!(hints.get("t").copied(), Some(5000.0));
    }

    #[test]
    fn test_accurate_run_resets_counter() {
        let fb = AdaptiveFeedback::new(10.0, 3);
        assert!(!fb.record(&metrics(1, 100.0, 5000)));
        assert!(!fb.record(&metrics(1, 100.0, 120))); // accurate, resets
        assert!(!fb.record(&metrics(1, 100.0, 5000)));
        assert!(!fb.record(&metrics(1, 100.0, 5000)));
        assert!(fb.record(&metrics(1, 100.0, 5000)));
    }

    #[test]
    fn test_small_deviation_tolerated() {
        let fb = AdaptiveFeedback::new(10.0, 3);
        for _ in 0..10 {
            assert!(!fb.record(&metrics(2, 100.0, 500)));
        }
    }

    #[test]
    fn test_scan_alias_parsing() {
        assert_eq!(scan_alias("SeqScan(users)").as_deref(), Some("users"));
        assert_eq!(
            scan_alias("IndexScan(u.users_email)").as_deref(),
            Some("u")
        );
        assert_eq!(scan_alias("HashJoin"), None);
    }
}
