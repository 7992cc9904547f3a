//! Run configuration for MoE auxiliary-loss training under a dp × tp mesh.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, IoResultExt, MoxeError, MoxeResult};
use crate::layers::{LayerCountPolicy, MonitoredLayers};
use crate::mesh::{DP_AXIS, TP_AXIS};
use crate::router_loss::{GroupLossKind, LossKind, LossKindSet};

fn default_top_k() -> usize {
    2
}

fn default_z_loss_coef() -> f64 {
    0.001
}

fn default_aux_coef() -> f64 {
    0.01
}

fn default_distill_temperature() -> f64 {
    2.0
}

fn default_axis_names() -> Vec<String> {
    vec![DP_AXIS.to_string(), TP_AXIS.to_string()]
}

fn default_mesh_shape() -> Vec<usize> {
    vec![1, 1]
}

fn default_one() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_collective_timeout_ms() -> u64 {
    30_000
}

fn default_logging_steps() -> usize {
    10
}

fn default_save_steps() -> usize {
    500
}

fn default_eval_steps() -> usize {
    500
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// When the checkpoint controller should run evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStrategy {
    #[default]
    No,
    Steps,
    Epoch,
}

/// Flat mirror of the trainer parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoxeConfig {
    // Model shape
    pub num_layers: usize,
    pub num_experts: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Expert groups for the group loss; `None` groups by `tp` shard.
    #[serde(default)]
    pub num_expert_groups: Option<usize>,

    // Layer monitoring
    #[serde(default)]
    pub monitored_layers: MonitoredLayers,
    #[serde(default)]
    pub monitored_layers_policy: LayerCountPolicy,

    // Coefficients
    #[serde(default = "default_z_loss_coef")]
    pub z_loss_coef: f64,
    #[serde(default = "default_aux_coef")]
    pub load_balancing_loss_coef: f64,
    #[serde(default = "default_aux_coef")]
    pub d_loss_coef: f64,
    #[serde(default = "default_aux_coef")]
    pub group_loss_coef: f64,

    // Loss toggles
    /// Gates both z-loss and load balancing.
    #[serde(default = "default_true")]
    pub compute_router_losses: bool,
    #[serde(default)]
    pub compute_d_loss: bool,
    #[serde(default)]
    pub compute_group_loss: bool,
    #[serde(default)]
    pub return_layers_outputs: bool,
    #[serde(default)]
    pub group_loss_kind: GroupLossKind,
    #[serde(default = "default_distill_temperature")]
    pub distill_temperature: f64,

    // Mesh
    #[serde(default = "default_axis_names")]
    pub axis_names: Vec<String>,
    #[serde(default = "default_mesh_shape")]
    pub mesh_shape: Vec<usize>,

    // Step sequencing
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_one")]
    pub per_device_train_batch_size: usize,
    #[serde(default)]
    pub gradient_checkpointing: bool,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_collective_timeout_ms")]
    pub collective_timeout_ms: u64,

    // Checkpoint cadence (pass-through)
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    #[serde(default)]
    pub eval_strategy: EvalStrategy,
    #[serde(default = "default_eval_steps")]
    pub eval_steps: usize,
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl MoxeConfig {
    /// Validate configuration and return the list of errors.
    ///
    /// Warnings are logged but do not fail validation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.num_layers == 0 {
            errors.push("num_layers must be greater than 0".to_string());
        }
        if self.num_experts == 0 {
            errors.push("num_experts must be greater than 0".to_string());
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            errors.push(format!(
                "top_k ({}) must be in [1, num_experts ({})]",
                self.top_k, self.num_experts
            ));
        }

        match &self.monitored_layers {
            MonitoredLayers::All => {}
            MonitoredLayers::List(list) => {
                if let Some(bad) = list.iter().find(|&&idx| idx >= self.num_layers) {
                    errors.push(format!(
                        "monitored layer {} out of range for a {}-layer model",
                        bad, self.num_layers
                    ));
                }
                if list.is_empty() {
                    warnings.push(
                        "monitored_layers is an empty list, no per-layer losses will be computed"
                            .to_string(),
                    );
                }
            }
            MonitoredLayers::Count(n) => {
                if *n == 0 || *n > self.num_layers {
                    errors.push(format!(
                        "monitored_layers count {} must be in [1, {}]",
                        n, self.num_layers
                    ));
                }
            }
        }

        for kind in LossKind::ALL {
            let coef = self.coefficient(kind);
            if !coef.is_finite() || coef < 0.0 {
                errors.push(format!("{}_coef ({}) must be finite and >= 0", kind, coef));
            }
        }

        if self.distill_temperature <= 0.0 || !self.distill_temperature.is_finite() {
            errors.push(format!(
                "distill_temperature ({}) must be positive",
                self.distill_temperature
            ));
        }

        if self.axis_names.len() != self.mesh_shape.len() {
            errors.push(format!(
                "axis_names ({:?}) and mesh_shape ({:?}) must have the same length",
                self.axis_names, self.mesh_shape
            ));
        }
        if self.mesh_shape.iter().any(|&s| s == 0) {
            errors.push(format!("mesh_shape {:?} has a zero-sized axis", self.mesh_shape));
        }
        for required in [DP_AXIS, TP_AXIS] {
            if !self.axis_names.iter().any(|n| n == required) {
                errors.push(format!("axis_names must include '{}'", required));
            }
        }

        if self.compute_group_loss && self.num_experts > 0 {
            let groups = self.expert_groups(self.tp_size());
            if groups == 0 || self.num_experts % groups != 0 {
                errors.push(format!(
                    "num_experts ({}) must be divisible by the number of expert groups ({})",
                    self.num_experts, groups
                ));
            } else if groups == 1 {
                warnings.push("group loss with a single expert group is always zero".to_string());
            }
        }

        if self.gradient_accumulation_steps == 0 {
            errors.push("gradient_accumulation_steps must be greater than 0".to_string());
        }
        if self.per_device_train_batch_size == 0 {
            errors.push("per_device_train_batch_size must be greater than 0".to_string());
        }
        if self.learning_rate <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.learning_rate));
        }
        if self.collective_timeout_ms == 0 {
            errors.push("collective_timeout_ms must be greater than 0".to_string());
        }
        if self.eval_strategy == EvalStrategy::Steps && self.eval_steps == 0 {
            errors.push(
                "eval_steps must be greater than 0 when eval_strategy is 'steps'".to_string(),
            );
        }

        if self.enabled_losses().is_empty() {
            warnings.push(
                "all auxiliary losses are disabled, total equals the task loss".to_string(),
            );
        }
        if self.resume_from_checkpoint.is_some() {
            warnings.push(
                "resume_from_checkpoint is handled by the checkpoint controller, not here"
                    .to_string(),
            );
        }

        for warning in &warnings {
            tracing::warn!(warning = %warning, "configuration warning");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// [`validate`](Self::validate) folded into a single `Config` error.
    pub fn validated(self) -> MoxeResult<Self> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(errors) => Err(config_error(errors.join("; "))),
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> MoxeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_path(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&text)?),
            Some("toml") | None => Self::from_toml_str(&text),
            Some(other) => Err(MoxeError::Parse(format!(
                "unsupported config extension '.{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn from_toml_str(text: &str) -> MoxeResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Write as pretty TOML, or JSON when the extension is `.json`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MoxeResult<()> {
        let path = path.as_ref();
        let text = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self).map_err(|e| MoxeError::Parse(e.to_string()))?
        };
        std::fs::write(path, text).with_path(path)
    }

    pub fn coefficient(&self, kind: LossKind) -> f64 {
        match kind {
            LossKind::ZLoss => self.z_loss_coef,
            LossKind::LoadBalance => self.load_balancing_loss_coef,
            LossKind::Distillation => self.d_loss_coef,
            LossKind::GroupBalance => self.group_loss_coef,
        }
    }

    /// Loss kinds switched on by the `compute_*` flags.
    pub fn enabled_losses(&self) -> LossKindSet {
        let mut set = LossKindSet::empty();
        if self.compute_router_losses {
            set.insert(LossKind::ZLoss);
            set.insert(LossKind::LoadBalance);
        }
        if self.compute_d_loss {
            set.insert(LossKind::Distillation);
        }
        if self.compute_group_loss {
            set.insert(LossKind::GroupBalance);
        }
        set
    }

    /// Size of the `tp` axis, 1 when absent.
    pub fn tp_size(&self) -> usize {
        self.axis_size(TP_AXIS)
    }

    /// Size of the `dp` axis, 1 when absent.
    pub fn dp_size(&self) -> usize {
        self.axis_size(DP_AXIS)
    }

    fn axis_size(&self, name: &str) -> usize {
        self.axis_names
            .iter()
            .position(|n| n == name)
            .and_then(|idx| self.mesh_shape.get(idx).copied())
            .unwrap_or(1)
    }

    /// Number of workers the mesh covers.
    pub fn world_size(&self) -> usize {
        self.mesh_shape.iter().product()
    }

    /// Expert group count, defaulting to the `tp` size.
    pub fn expert_groups(&self, tp_size: usize) -> usize {
        self.num_expert_groups.unwrap_or(tp_size)
    }

    /// 12-layer, 8-expert model on 8 workers (`dp=4, tp=2`), every loss on.
    pub fn dp4_tp2() -> Self {
        Self {
            num_layers: 12,
            num_experts: 8,
            top_k: 2,
            num_expert_groups: None,
            monitored_layers: MonitoredLayers::All,
            monitored_layers_policy: LayerCountPolicy::First,
            z_loss_coef: 0.001,
            load_balancing_loss_coef: 0.01,
            d_loss_coef: 0.01,
            group_loss_coef: 0.01,
            compute_router_losses: true,
            compute_d_loss: true,
            compute_group_loss: true,
            return_layers_outputs: true,
            group_loss_kind: GroupLossKind::Variance,
            distill_temperature: 2.0,
            axis_names: default_axis_names(),
            mesh_shape: vec![4, 2],
            gradient_accumulation_steps: 2,
            per_device_train_batch_size: 4,
            gradient_checkpointing: true,
            learning_rate: 1e-3,
            collective_timeout_ms: default_collective_timeout_ms(),
            logging_steps: 1,
            save_steps: 500,
            eval_strategy: EvalStrategy::Steps,
            eval_steps: 500,
            resume_from_checkpoint: None,
            seed: 42,
        }
    }

    /// Single-worker config small enough for unit tests.
    pub fn tiny_cpu() -> Self {
        Self {
            num_layers: 4,
            mesh_shape: vec![1, 1],
            num_expert_groups: Some(2),
            gradient_accumulation_steps: 1,
            per_device_train_batch_size: 2,
            gradient_checkpointing: false,
            learning_rate: 1e-2,
            collective_timeout_ms: 5_000,
            eval_strategy: EvalStrategy::No,
            ..Self::dp4_tp2()
        }
    }
}
