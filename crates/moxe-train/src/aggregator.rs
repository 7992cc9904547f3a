//! Folds the task loss and auxiliary loss terms into one differentiable scalar.
//!
//! Valid per-layer instances of a kind are averaged, then the kind's
//! coefficient is applied once, so the effective weight of a kind does not
//! depend on how many layers are monitored. Kinds with no valid instance
//! contribute nothing and are left out of the breakdown.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use candle_core::Tensor;
use serde::Serialize;

use crate::error::{config_error, shape_error, MoxeError, MoxeResult};
use crate::router_loss::{scalar_f64, LayerDiagnostics, LossKind, LossTerm};

/// Breakdown key of the primary loss.
pub const TASK_LOSS_KEY: &str = "task_loss";

/// One breakdown entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermBreakdown {
    /// Unweighted value (mean over valid instances for per-layer kinds).
    pub raw: f64,
    /// Contribution to the total.
    pub weighted: f64,
    pub coefficient: f64,
    /// Valid instances folded into `raw`.
    pub instances: usize,
}

/// Result of one aggregation. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct AggregatedLoss {
    /// 0-d tensor on the autograd graph.
    pub total: Tensor,
    pub total_value: f64,
    pub task_loss: f64,
    pub breakdown: BTreeMap<String, TermBreakdown>,
    pub layers: Vec<LayerDiagnostics>,
}

impl AggregatedLoss {
    /// Attach per-layer diagnostics for the logging collaborator.
    pub fn with_layers(mut self, layers: Vec<LayerDiagnostics>) -> Self {
        self.layers = layers;
        self
    }

    pub fn get(&self, kind: LossKind) -> Option<&TermBreakdown> {
        self.breakdown.get(kind.name())
    }

    /// Sum of weighted auxiliary contributions.
    pub fn auxiliary_weighted(&self) -> f64 {
        LossKind::ALL
            .iter()
            .filter_map(|k| self.get(*k))
            .map(|entry| entry.weighted)
            .sum()
    }

    /// One-line rendering, e.g. `total=2.31 task_loss=2.30 z_loss=0.51(w=0.0005)`.
    pub fn summary(&self) -> String {
        let mut out = format!("total={} {}={}", self.total_value, TASK_LOSS_KEY, self.task_loss);
        for kind in LossKind::ALL {
            if let Some(entry) = self.get(kind) {
                let _ = write!(out, " {}={}(w={})", kind, entry.raw, entry.weighted);
            }
        }
        out
    }

    /// Fail with `Numerical` when the total or any entry is NaN/Inf.
    pub fn ensure_finite(&self, step: usize) -> MoxeResult<()> {
        let entries_finite = self
            .breakdown
            .values()
            .all(|e| e.raw.is_finite() && e.weighted.is_finite());
        if self.total_value.is_finite() && entries_finite {
            Ok(())
        } else {
            Err(MoxeError::Numerical {
                step,
                breakdown: self.summary(),
            })
        }
    }
}

/// Stateless aggregator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossAggregator;

impl LossAggregator {
    pub fn new() -> Self {
        Self
    }

    /// `total = task_loss + Σ_kind coefficient_kind · mean(valid instances)`.
    ///
    /// Summation runs task loss first, then kinds in [`LossKind::ALL`] order,
    /// and instances in the order given, so identical inputs give
    /// bit-identical output.
    pub fn aggregate(&self, task_loss: &Tensor, terms: &[LossTerm]) -> MoxeResult<AggregatedLoss> {
        if task_loss.elem_count() != 1 {
            return Err(shape_error("task_loss", "a scalar", task_loss.dims()));
        }
        let mut total = task_loss.reshape(())?;
        let task_value = scalar_f64(&total)?;

        let mut breakdown = BTreeMap::new();
        breakdown.insert(
            TASK_LOSS_KEY.to_string(),
            TermBreakdown {
                raw: task_value,
                weighted: task_value,
                coefficient: 1.0,
                instances: 1,
            },
        );

        for kind in LossKind::ALL {
            let valid: Vec<&LossTerm> = terms
                .iter()
                .filter(|t| t.kind == kind && t.valid)
                .collect();
            let Some(first) = valid.first() else {
                let skipped = terms.iter().filter(|t| t.kind == kind).count();
                if skipped > 0 {
                    tracing::warn!(
                        kind = %kind,
                        skipped,
                        "No valid instances, kind left out of total"
                    );
                }
                continue;
            };

            let coefficient = first.coefficient;
            if let Some(other) = valid.iter().find(|t| t.coefficient != coefficient) {
                return Err(config_error(format!(
                    "{} carries coefficient {} at {} but {} elsewhere",
                    kind, other.coefficient, other.scope, coefficient
                )));
            }

            let values: Vec<Tensor> = valid
                .iter()
                .map(|t| t.value.reshape(()))
                .collect::<candle_core::Result<_>>()?;
            let raw = Tensor::stack(&values, 0)?.mean_all()?.to_dtype(total.dtype())?;
            let weighted = raw.affine(coefficient, 0.0)?;
            total = total.add(&weighted)?;

            breakdown.insert(
                kind.name().to_string(),
                TermBreakdown {
                    raw: scalar_f64(&raw)?,
                    weighted: scalar_f64(&weighted)?,
                    coefficient,
                    instances: valid.len(),
                },
            );
        }

        let total_value = scalar_f64(&total)?;
        Ok(AggregatedLoss {
            total,
            total_value,
            task_loss: task_value,
            breakdown,
            layers: Vec::new(),
        })
    }
}
