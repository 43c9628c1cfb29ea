//! ONNX inference engine.
//!
//! Loads the forecast and policy models once at startup, probes both against
//! a seed state to verify the head/shape contract, and serves the
//! per-prediction pipeline: forecast -> calibration -> fusion -> risk
//! multiplier -> policy. The ONNX runtime is initialized exactly once per
//! process; tensors live only for the duration of a single run.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::Path;

use super::equations::Expr;
use super::features;
use super::types::{Action, NodeState};
use super::ModelError;

pub const FORECAST_MODEL_FILE: &str = "tft.onnx";
pub const POLICY_MODEL_FILE: &str = "rl_policy.onnx";
pub const CALIBRATION_EQUATION_FILE: &str = "pysr/calibration_equation.txt";
pub const FUSION_EQUATION_FILE: &str = "pysr/context_equation.txt";

const OUTPUT_CAPACITY: &str = "capacity_score";
const OUTPUT_RUNTIME: &str = "runtime_score";
const OUTPUT_LEGACY: &str = "output";

/// Q-values below this mark a garbage prediction; see `confidence_from_q`.
const Q_SANITY_FLOOR: f32 = -1000.0;
const LOW_CONFIDENCE: f64 = 0.1;

static ORT_INIT: OnceCell<()> = OnceCell::new();

/// Which output heads the loaded forecast model exposes, in acceptance
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastHeads {
    /// capacity_score + runtime_score outputs.
    CapacityAndRuntime,
    /// capacity_score only; runtime defaults to 0.
    CapacityOnly,
    /// Legacy single "output" head; only accepted when the runtime head is
    /// not required.
    LegacySingle,
}

impl ForecastHeads {
    pub fn resolve(output_names: &[String], require_runtime: bool) -> Result<Self, ModelError> {
        let has = |name: &str| output_names.iter().any(|n| n == name);
        if has(OUTPUT_CAPACITY) && has(OUTPUT_RUNTIME) {
            Ok(ForecastHeads::CapacityAndRuntime)
        } else if has(OUTPUT_CAPACITY) {
            Ok(ForecastHeads::CapacityOnly)
        } else if has(OUTPUT_LEGACY) && !require_runtime {
            Ok(ForecastHeads::LegacySingle)
        } else {
            Err(ModelError::Contract(format!(
                "forecast model outputs {:?} match no accepted head form",
                output_names
            )))
        }
    }
}

/// Per-prediction knobs from the runtime config.
#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub risk_multiplier: f64,
    pub enable_calibration: bool,
    pub enable_fusion: bool,
    /// Seconds per history step, for timestep calendar features.
    pub step_secs: u64,
    pub now: DateTime<Utc>,
}

/// One node's prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub action: Action,
    pub capacity_score: f64,
    pub runtime_score: f64,
    pub confidence: f64,
}

/// The loaded model pair plus optional symbolic calibration.
pub struct InferenceEngine {
    forecast: Session,
    policy: Session,
    forecast_input: String,
    policy_input: String,
    policy_output: String,
    heads: ForecastHeads,
    calibration: Option<Expr>,
    fusion: Option<Expr>,
    history_steps: usize,
    warned_missing_runtime: bool,
    warned_calibration_failure: bool,
    warned_fusion_failure: bool,
}

impl InferenceEngine {
    /// Load both models and run the startup contract probe. Contract
    /// failures here are fatal to the process.
    pub fn load(
        models_dir: &Path,
        history_steps: usize,
        require_runtime_head: bool,
    ) -> Result<Self, ModelError> {
        init_runtime()?;

        let forecast = load_session(&models_dir.join(FORECAST_MODEL_FILE))?;
        let policy = load_session(&models_dir.join(POLICY_MODEL_FILE))?;

        let output_names: Vec<String> =
            forecast.outputs.iter().map(|o| o.name.clone()).collect();
        let heads = ForecastHeads::resolve(&output_names, require_runtime_head)?;
        if heads == ForecastHeads::CapacityOnly {
            log::warn!("Forecast model has no runtime head; runtime_score will be 0");
        }

        let forecast_input = forecast
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| ModelError::Contract("forecast model has no inputs".to_string()))?;
        let policy_input = policy
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| ModelError::Contract("policy model has no inputs".to_string()))?;
        let policy_output = policy
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| ModelError::Contract("policy model has no outputs".to_string()))?;

        let calibration = load_equation(models_dir, CALIBRATION_EQUATION_FILE)?;
        let fusion = load_equation(models_dir, FUSION_EQUATION_FILE)?;

        let mut engine = Self {
            forecast,
            policy,
            forecast_input,
            policy_input,
            policy_output,
            heads,
            calibration,
            fusion,
            history_steps,
            warned_missing_runtime: false,
            warned_calibration_failure: false,
            warned_fusion_failure: false,
        };
        engine.contract_probe()?;
        Ok(engine)
    }

    /// Run a known seed state through both models and verify the output
    /// shapes the pipeline depends on.
    fn contract_probe(&mut self) -> Result<(), ModelError> {
        let mut seed = NodeState {
            price_history: vec![0.1; self.history_steps],
            ..Default::default()
        };

        let (capacity, runtime) = self.run_forecast(&seed, Utc::now(), 300)?;
        if !(0.0..=1.0).contains(&capacity) || !(0.0..=1.0).contains(&runtime) {
            return Err(ModelError::Contract(format!(
                "forecast probe scores out of [0,1]: capacity={}, runtime={}",
                capacity, runtime
            )));
        }

        seed.runtime_score = runtime;
        let q_values = self.run_policy(&seed, capacity)?;
        if q_values.len() != Action::COUNT {
            return Err(ModelError::Contract(format!(
                "policy probe returned {} Q-values, expected {}",
                q_values.len(),
                Action::COUNT
            )));
        }

        log::info!(
            "Model contract probe passed (heads={:?}, H={})",
            self.heads,
            self.history_steps
        );
        Ok(())
    }

    /// The full per-node pipeline. The caller has already refreshed
    /// `state.price_history` from the pool's buffer.
    pub fn predict(
        &mut self,
        node_id: &str,
        state: &mut NodeState,
        opts: &PredictOptions,
    ) -> Result<Prediction, ModelError> {
        let (raw_capacity, raw_runtime) =
            self.run_forecast(state, opts.now, opts.step_secs)?;
        let raw_capacity = raw_capacity.clamp(0.0, 1.0);
        let raw_runtime = raw_runtime.clamp(0.0, 1.0);

        let calibrated = if opts.enable_calibration {
            self.calibrate(raw_capacity, state)
        } else {
            raw_capacity
        };
        let fused = if opts.enable_fusion {
            self.fuse(calibrated, state)
        } else {
            calibrated
        };

        let capacity = apply_risk_multiplier(fused, opts.risk_multiplier);
        let runtime = apply_risk_multiplier(raw_runtime, opts.risk_multiplier);
        state.runtime_score = runtime;

        let q_values = self.run_policy(state, capacity)?;
        let (index, max_q) = argmax(&q_values);
        let action = Action::from_index(index).ok_or_else(|| {
            ModelError::Contract(format!("policy argmax index {} out of range", index))
        })?;

        let confidence = confidence_from_q(max_q);
        log::debug!(
            "predict node={} action={} capacity={:.3} runtime={:.3} confidence={:.2}",
            node_id,
            action.as_str(),
            capacity,
            runtime,
            confidence
        );

        Ok(Prediction {
            action,
            capacity_score: capacity,
            runtime_score: runtime,
            confidence,
        })
    }

    fn run_forecast(
        &mut self,
        state: &NodeState,
        now: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<(f64, f64), ModelError> {
        let input =
            features::build_forecast_input(state, now, self.history_steps, step_secs);
        let (shape, data) = (input.shape().to_vec(), input.iter().copied().collect::<Vec<f32>>());
        let tensor = Tensor::from_array((shape, data))?;

        let outputs = self
            .forecast
            .run(ort::inputs![self.forecast_input.as_str() => tensor])?;

        let scalar = |name: &str| -> Result<f64, ModelError> {
            let value = outputs.get(name).ok_or_else(|| {
                ModelError::Contract(format!("forecast output '{}' missing", name))
            })?;
            let (_, data) = value.try_extract_tensor::<f32>()?;
            data.first()
                .map(|v| *v as f64)
                .ok_or_else(|| ModelError::Contract(format!("forecast output '{}' empty", name)))
        };

        let (capacity, runtime) = match self.heads {
            ForecastHeads::CapacityAndRuntime => {
                (scalar(OUTPUT_CAPACITY)?, scalar(OUTPUT_RUNTIME)?)
            }
            ForecastHeads::CapacityOnly => {
                if !self.warned_missing_runtime {
                    log::warn!("Runtime head unavailable, using runtime_score=0");
                    self.warned_missing_runtime = true;
                }
                (scalar(OUTPUT_CAPACITY)?, 0.0)
            }
            ForecastHeads::LegacySingle => (scalar(OUTPUT_LEGACY)?, 0.0),
        };

        Ok((capacity, runtime))
    }

    fn run_policy(
        &mut self,
        state: &NodeState,
        capacity_score: f64,
    ) -> Result<Vec<f32>, ModelError> {
        let input = features::build_policy_input(state, capacity_score);
        let (shape, data) = (input.shape().to_vec(), input.iter().copied().collect::<Vec<f32>>());
        let tensor = Tensor::from_array((shape, data))?;

        let outputs = self
            .policy
            .run(ort::inputs![self.policy_input.as_str() => tensor])?;
        let value = outputs.get(self.policy_output.as_str()).ok_or_else(|| {
            ModelError::Contract(format!("policy output '{}' missing", self.policy_output))
        })?;
        let (_, data) = value.try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    /// Evaluate the calibration equation; failures warn once and fall back
    /// to the uncalibrated score.
    fn calibrate(&mut self, capacity_score: f64, state: &NodeState) -> f64 {
        let Some(expr) = &self.calibration else {
            return capacity_score;
        };
        let vars: HashMap<&str, f64> = [
            ("capacity_score", capacity_score),
            ("price_volatility", features::price_volatility(&state.price_history)),
        ]
        .into();
        match expr.eval(&vars) {
            Ok(v) => v.clamp(0.0, 1.0),
            Err(e) => {
                if !self.warned_calibration_failure {
                    log::warn!("Calibration equation failed ({}), using raw score", e);
                    self.warned_calibration_failure = true;
                }
                capacity_score
            }
        }
    }

    /// Evaluate the fusion equation over workload context.
    fn fuse(&mut self, calibrated_risk: f64, state: &NodeState) -> f64 {
        let Some(expr) = &self.fusion else {
            return calibrated_risk;
        };
        let vars: HashMap<&str, f64> = [
            ("calibrated_risk", calibrated_risk),
            ("startup_time", state.startup_time_secs),
            ("outage_penalty", state.outage_penalty_hours),
            ("cluster_utilization", state.cluster_utilization),
            ("priority_score", state.priority_score),
        ]
        .into();
        match expr.eval(&vars) {
            Ok(v) => v.clamp(0.0, 1.0),
            Err(e) => {
                if !self.warned_fusion_failure {
                    log::warn!("Fusion equation failed ({}), using calibrated score", e);
                    self.warned_fusion_failure = true;
                }
                calibrated_risk
            }
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        log::debug!("Closing model sessions");
    }
}

/// Initialize the ONNX runtime exactly once. `ONNXRUNTIME_PATH` points the
/// loader at a non-default runtime library.
fn init_runtime() -> Result<(), ModelError> {
    let mut result = Ok(());
    ORT_INIT.get_or_init(|| {
        if let Ok(path) = std::env::var("ONNXRUNTIME_PATH") {
            if std::env::var("ORT_DYLIB_PATH").is_err() {
                std::env::set_var("ORT_DYLIB_PATH", path);
            }
        }
        if let Err(e) = ort::init().with_name("spotvortex-agent").commit() {
            result = Err(ModelError::Inference(e));
        }
    });
    result
}

fn load_session(path: &Path) -> Result<Session, ModelError> {
    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(2))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| ModelError::Load {
            path: path.to_path_buf(),
            source: e,
        })
}

fn load_equation(dir: &Path, relative: &str) -> Result<Option<Expr>, ModelError> {
    let path = dir.join(relative);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| ModelError::Io {
        path: path.clone(),
        source: e,
    })?;
    let expr = Expr::parse(content.trim())?;
    log::info!("Loaded equation from {}", path.display());
    Ok(Some(expr))
}

/// Squash a probability through `sigmoid(m * logit(p))`, clamped away from
/// the poles first so the logit stays finite.
pub fn apply_risk_multiplier(p: f64, multiplier: f64) -> f64 {
    if (multiplier - 1.0).abs() < f64::EPSILON {
        return p;
    }
    let clamped = p.clamp(1e-6, 1.0 - 1e-6);
    let logit = (clamped / (1.0 - clamped)).ln();
    1.0 / (1.0 + (-multiplier * logit).exp())
}

/// Index and value of the largest Q-value.
pub fn argmax(values: &[f32]) -> (usize, f32) {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
}

/// Crude not-garbage flag: full confidence unless the best Q-value sits
/// below the sanity floor.
pub fn confidence_from_q(max_q: f32) -> f64 {
    if max_q >= Q_SANITY_FLOOR {
        1.0
    } else {
        LOW_CONFIDENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heads_resolution_priority() {
        let both = vec!["capacity_score".to_string(), "runtime_score".to_string()];
        assert_eq!(
            ForecastHeads::resolve(&both, true).unwrap(),
            ForecastHeads::CapacityAndRuntime
        );

        let capacity_only = vec!["capacity_score".to_string()];
        assert_eq!(
            ForecastHeads::resolve(&capacity_only, false).unwrap(),
            ForecastHeads::CapacityOnly
        );

        let legacy = vec!["output".to_string()];
        assert_eq!(
            ForecastHeads::resolve(&legacy, false).unwrap(),
            ForecastHeads::LegacySingle
        );
        // The legacy form is rejected when the runtime head is required.
        assert!(ForecastHeads::resolve(&legacy, true).is_err());

        assert!(ForecastHeads::resolve(&["bogus".to_string()], false).is_err());
    }

    #[test]
    fn test_risk_multiplier_identity() {
        assert_eq!(apply_risk_multiplier(0.3, 1.0), 0.3);
    }

    #[test]
    fn test_risk_multiplier_amplifies() {
        // m > 1 pushes probabilities away from 0.5.
        let low = apply_risk_multiplier(0.3, 2.0);
        let high = apply_risk_multiplier(0.7, 2.0);
        assert!(low < 0.3);
        assert!(high > 0.7);
        // 0.5 is the fixed point.
        assert!((apply_risk_multiplier(0.5, 2.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_risk_multiplier_extreme_inputs_stay_finite() {
        for p in [0.0, 1.0] {
            let v = apply_risk_multiplier(p, 3.0);
            assert!(v.is_finite());
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_argmax() {
        let (i, v) = argmax(&[0.1, 0.9, 0.3]);
        assert_eq!(i, 1);
        assert_eq!(v, 0.9);

        let (i, _) = argmax(&[-2000.0, -3000.0]);
        assert_eq!(i, 0);
    }

    #[test]
    fn test_confidence_threshold() {
        assert_eq!(confidence_from_q(-999.0), 1.0);
        assert_eq!(confidence_from_q(-1000.0), 1.0);
        assert_eq!(confidence_from_q(-1000.1), 0.1);
    }
}
