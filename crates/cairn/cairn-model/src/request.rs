//! The request/result surface consumed by the scheduler.

use serde::{Deserialize, Serialize};

/// Economic scenario generator parameters, passed per request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub initial_rate: f64,
    pub drift: f64,
    pub volatility: f64,
    pub min_rate: f64,
    pub max_rate: f64,
}

/// One valuation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub num_scenarios: u32,
    pub base_seed: u64,
    pub scenario_params: ScenarioParams,
    #[serde(default = "defaults::unit_mult")]
    pub mortality_mult: f64,
    #[serde(default = "defaults::unit_mult")]
    pub lapse_mult: f64,
    #[serde(default = "defaults::unit_mult")]
    pub expense_mult: f64,
    #[serde(default)]
    pub store_distribution: bool,
}

mod defaults {
    pub fn unit_mult() -> f64 {
        1.0
    }
}

impl RunRequest {
    pub fn new(num_scenarios: u32, base_seed: u64, scenario_params: ScenarioParams) -> Self {
        Self {
            num_scenarios,
            base_seed,
            scenario_params,
            mortality_mult: 1.0,
            lapse_mult: 1.0,
            expense_mult: 1.0,
            store_distribution: false,
        }
    }
}

/// Summary statistics over the per-scenario NPV distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    /// Mean of the worst 5% tail.
    pub cte95: f64,
}

impl Statistics {
    pub fn zeroed() -> Self {
        Self {
            mean: 0.0,
            std_dev: 0.0,
            p50: 0.0,
            p75: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            cte95: 0.0,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub statistics: Statistics,
    pub execution_time_ms: u64,
    pub scenario_count: u32,
    /// Present only when the request asked for it.
    pub distribution: Option<Vec<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_defaults_apply_on_deserialize() {
        let json = r#"{
            "num_scenarios": 100,
            "base_seed": 42,
            "scenario_params": {
                "initial_rate": 0.03,
                "drift": 0.0,
                "volatility": 0.01,
                "min_rate": 0.0,
                "max_rate": 0.2
            }
        }"#;
        let req: RunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.mortality_mult, 1.0);
        assert_eq!(req.lapse_mult, 1.0);
        assert_eq!(req.expense_mult, 1.0);
        assert!(!req.store_distribution);
    }
}
