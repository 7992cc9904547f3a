//! One optimisation step under the mesh.
//!
//! ```text
//! for each micro-batch:  FORWARD → COLLECT → AGGREGATE → BACKWARD
//! then once:             SYNC → OPTIMIZE → DONE
//! ```
//!
//! An error escaping a step (`Numerical`, `Collective`, a peer's `Aborted`, or
//! a tensor failure) aborts the fabric with the step index attached and
//! leaves the driver in `Failed`. A wrong micro-batch count is fatal too
//! unless the worker runs alone.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, Var};
use serde::Serialize;
use tracing::{debug, info_span, trace};

use crate::aggregator::{AggregatedLoss, LossAggregator, TermBreakdown};
use crate::collective::ProcessGroup;
use crate::config::{EvalStrategy, MoxeConfig};
use crate::error::{config_error, shape_error, MoxeError, MoxeResult};
use crate::layers::{LayerSelection, LayerSelector};
use crate::logging::{log_group_abort, log_numerical_failure, log_training_step};
use crate::mesh::WorkerMesh;
use crate::router_loss::{LossKind, RouterLossCollector};
use crate::routing::RoutingSnapshot;

/// What the model hands back from one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// 0-d primary loss.
    pub task_loss: Tensor,
    /// One snapshot per MoE layer (at least every monitored one).
    pub routing: Vec<RoutingSnapshot>,
    /// Student output logits, used for distillation.
    pub logits: Tensor,
}

/// The model being trained, as seen by the driver.
pub trait MoeModel {
    type Batch;

    /// Trainable parameters, in a stable order.
    fn parameters(&self) -> Vec<Var>;

    fn forward(
        &self,
        batch: &Self::Batch,
        gradient_checkpointing: bool,
    ) -> MoxeResult<ForwardOutput>;
}

/// Supplies teacher logits for distillation.
pub trait TeacherSource<B> {
    fn teacher_logits(&self, batch: &B) -> MoxeResult<Tensor>;
}

/// Applies synchronised gradients to parameters.
pub trait ParameterUpdate {
    fn apply(&mut self, params: &[Var], grads: &[Tensor]) -> MoxeResult<()>;
}

/// Plain SGD.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }
}

impl ParameterUpdate for Sgd {
    fn apply(&mut self, params: &[Var], grads: &[Tensor]) -> MoxeResult<()> {
        if params.len() != grads.len() {
            return Err(shape_error(
                "sgd update",
                format!("{} gradients", params.len()),
                grads.len(),
            ));
        }
        for (var, grad) in params.iter().zip(grads) {
            let updated = var.as_tensor().sub(&grad.affine(self.lr, 0.0)?)?;
            var.set(&updated)?;
        }
        Ok(())
    }
}

/// Driver state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepPhase {
    Forward,
    Collect,
    Aggregate,
    Backward,
    Sync,
    Optimize,
    Done,
    Failed,
}

/// Outcome of one optimisation step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based index of the completed step.
    pub step: usize,
    pub rank: usize,
    /// Mean of the micro-batch totals (before division by the accumulation count).
    pub mean_total: f64,
    pub micro_losses: Vec<f64>,
    /// Breakdown of the last micro-batch.
    pub breakdown: BTreeMap<String, TermBreakdown>,
    pub should_log: bool,
    pub should_save: bool,
    pub should_eval: bool,
}

/// Sequences forward, loss collection, aggregation, backward, gradient
/// averaging and the parameter update for one worker.
pub struct TrainingStepDriver<M: MoeModel, G: ProcessGroup> {
    config: MoxeConfig,
    worker: WorkerMesh,
    model: M,
    teacher: Option<Box<dyn TeacherSource<M::Batch>>>,
    optimizer: Box<dyn ParameterUpdate>,
    group: G,
    selection: LayerSelection,
    collector: RouterLossCollector,
    aggregator: LossAggregator,
    phase: StepPhase,
    completed_steps: usize,
    /// Sticky `Aborted` returned by every step after a failure.
    failure: Option<MoxeError>,
    last_loss: Option<AggregatedLoss>,
}

impl<M: MoeModel, G: ProcessGroup> TrainingStepDriver<M, G> {
    /// Validate the configuration and resolve everything fixed for the run.
    pub fn new(
        config: MoxeConfig,
        worker: WorkerMesh,
        model: M,
        group: G,
        teacher: Option<Box<dyn TeacherSource<M::Batch>>>,
    ) -> MoxeResult<Self> {
        let config = config.validated()?;
        if config.enabled_losses().contains(LossKind::Distillation) && teacher.is_none() {
            return Err(config_error(
                "compute_d_loss is enabled but no teacher source was provided",
            ));
        }
        if group.rank() != worker.rank {
            return Err(config_error(format!(
                "process group rank {} does not match mesh rank {}",
                group.rank(),
                worker.rank
            )));
        }

        let selection = LayerSelector::resolve(
            &config.monitored_layers,
            config.monitored_layers_policy,
            config.num_layers,
        )?;
        let collector = RouterLossCollector::from_config(&config, worker.tp_size)?;
        let optimizer = Box::new(Sgd::new(config.learning_rate));

        debug!(rank = worker.rank, selection = %selection, "Driver ready");
        Ok(Self {
            config,
            worker,
            model,
            teacher,
            optimizer,
            group,
            selection,
            collector,
            aggregator: LossAggregator::new(),
            phase: StepPhase::Done,
            completed_steps: 0,
            failure: None,
            last_loss: None,
        })
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    pub fn selection(&self) -> &LayerSelection {
        &self.selection
    }

    pub fn worker(&self) -> &WorkerMesh {
        &self.worker
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Aggregated loss of the most recent micro-batch.
    pub fn last_loss(&self) -> Option<&AggregatedLoss> {
        self.last_loss.as_ref()
    }

    fn enter(&mut self, phase: StepPhase) {
        trace!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// Run one optimisation step over exactly `gradient_accumulation_steps`
    /// micro-batches.
    pub fn step(&mut self, micro_batches: &[M::Batch]) -> MoxeResult<StepReport> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let step = self.completed_steps + 1;
        let span = info_span!("training_step", step = step, rank = self.worker.rank);
        let _enter = span.enter();

        if micro_batches.len() != self.config.gradient_accumulation_steps {
            let err = config_error(format!(
                "expected {} micro-batches per step, got {}",
                self.config.gradient_accumulation_steps,
                micro_batches.len()
            ));
            let has_peers =
                self.worker.gradient_group.len() > 1 || self.worker.replica_group.len() > 1;
            if !has_peers {
                return Err(err);
            }
            return Err(self.fail(step, err));
        }

        match self.run_step(step, micro_batches) {
            Ok(report) => Ok(report),
            Err(err) if err.is_recoverable() => Err(err),
            Err(err) => Err(self.fail(step, err)),
        }
    }

    /// Broadcast `err` to every rank and refuse further steps.
    fn fail(&mut self, step: usize, err: MoxeError) -> MoxeError {
        let err = err.at_step(step);
        let failure = match &err {
            MoxeError::Aborted { .. } => err.clone(),
            other => {
                let at = other.step().unwrap_or(step);
                let reason = other.to_string();
                log_group_abort(self.worker.rank, Some(at), &reason);
                self.group.abort(Some(at), &reason);
                MoxeError::Aborted {
                    origin_rank: self.worker.rank,
                    step: Some(at),
                    reason,
                }
            }
        };
        self.failure = Some(failure);
        self.enter(StepPhase::Failed);
        err
    }

    fn run_step(&mut self, step: usize, micro_batches: &[M::Batch]) -> MoxeResult<StepReport> {
        self.group.check_abort()?;

        let accumulation = micro_batches.len();
        let params = self.model.parameters();
        let mut accumulated: Vec<Option<Tensor>> = vec![None; params.len()];
        let mut micro_losses = Vec::with_capacity(accumulation);

        for batch in micro_batches {
            self.enter(StepPhase::Forward);
            let output = self.model.forward(batch, self.config.gradient_checkpointing)?;

            self.enter(StepPhase::Collect);
            let teacher_logits = match &self.teacher {
                Some(teacher) if self.collector.enabled().contains(LossKind::Distillation) => {
                    Some(teacher.teacher_logits(batch)?)
                }
                _ => None,
            };
            let collected = self.collector.collect(
                &self.selection,
                &output.routing,
                &output.logits,
                teacher_logits.as_ref(),
            )?;

            self.enter(StepPhase::Aggregate);
            let loss = self
                .aggregator
                .aggregate(&output.task_loss, &collected.terms)?
                .with_layers(collected.diagnostics);
            if let Err(err) = loss.ensure_finite(step) {
                log_numerical_failure(step, &loss.summary());
                return Err(err);
            }
            log_training_step(step, &loss);

            self.enter(StepPhase::Backward);
            let scaled = loss.total.affine(1.0 / accumulation as f64, 0.0)?;
            let grads = scaled.backward()?;
            for (slot, var) in accumulated.iter_mut().zip(&params) {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    *slot = Some(match slot.take() {
                        Some(acc) => acc.add(grad)?,
                        None => grad.clone(),
                    });
                }
            }
            micro_losses.push(loss.total_value);
            self.last_loss = Some(loss);
        }

        self.enter(StepPhase::Sync);
        let grads = params
            .iter()
            .zip(accumulated)
            .map(|(var, grad)| match grad {
                Some(grad) => Ok(grad),
                None => var.as_tensor().zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let grads = self.sync_gradients(grads)?;

        self.enter(StepPhase::Optimize);
        self.optimizer.apply(&params, &grads)?;

        self.enter(StepPhase::Done);
        self.completed_steps = step;
        let mean_total = micro_losses.iter().sum::<f64>() / accumulation as f64;
        Ok(StepReport {
            step,
            rank: self.worker.rank,
            mean_total,
            micro_losses,
            breakdown: self
                .last_loss
                .as_ref()
                .map(|l| l.breakdown.clone())
                .unwrap_or_default(),
            should_log: cadence(step, self.config.logging_steps),
            should_save: cadence(step, self.config.save_steps),
            should_eval: self.config.eval_strategy == EvalStrategy::Steps
                && cadence(step, self.config.eval_steps),
        })
    }

    /// Average gradients over the worker's gradient group.
    fn sync_gradients(&self, grads: Vec<Tensor>) -> MoxeResult<Vec<Tensor>> {
        let members = &self.worker.gradient_group;
        if members.len() <= 1 {
            return Ok(grads);
        }

        let mut flat = Vec::new();
        for grad in &grads {
            flat.extend(grad.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
        }
        self.group.all_reduce_mean(members, &mut flat)?;

        let mut offset = 0;
        grads
            .iter()
            .map(|grad| {
                let n = grad.elem_count();
                let chunk = flat[offset..offset + n].to_vec();
                offset += n;
                Ok(Tensor::from_vec(chunk, grad.dims(), grad.device())?.to_dtype(grad.dtype())?)
            })
            .collect()
    }
}

fn cadence(step: usize, every: usize) -> bool {
    every > 0 && step % every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalFabric;
    use crate::synthetic::{SyntheticBatch, SyntheticData, SyntheticMoeModel, SyntheticTeacher};
    use candle_core::Device;
    use std::time::Duration;

    fn solo_driver(
        config: MoxeConfig,
    ) -> (
        TrainingStepDriver<SyntheticMoeModel, crate::collective::LocalProcessGroup>,
        SyntheticData,
    ) {
        let device = Device::Cpu;
        let worker = WorkerMesh::solo();
        let model = SyntheticMoeModel::new(&config, worker.tp_index, &device).unwrap();
        let data = SyntheticData::new(&config, &worker, &device);
        let teacher: Option<Box<dyn TeacherSource<SyntheticBatch>>> = if config.compute_d_loss {
            Some(Box::new(SyntheticTeacher::new(&config, &device).unwrap()))
        } else {
            None
        };
        let group = LocalFabric::new(1, Duration::from_secs(5)).group(0);
        (TrainingStepDriver::new(config, worker, model, group, teacher).unwrap(), data)
    }

    #[test]
    fn test_missing_teacher_is_config_error() {
        let config = MoxeConfig::tiny_cpu();
        let device = Device::Cpu;
        let worker = WorkerMesh::solo();
        let model = SyntheticMoeModel::new(&config, 0, &device).unwrap();
        let group = LocalFabric::new(1, Duration::from_secs(1)).group(0);
        let result = TrainingStepDriver::new(config, worker, model, group, None);
        assert!(matches!(result, Err(MoxeError::Config(_))));
    }

    #[test]
    fn test_step_updates_parameters() {
        let (mut driver, data) = solo_driver(MoxeConfig::tiny_cpu());
        let before: Vec<Vec<f32>> = driver
            .model()
            .parameters()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        let report = driver.step(&data.micro_batches(0).unwrap()).unwrap();
        assert_eq!(report.step, 1);
        assert_eq!(report.micro_losses.len(), 1);
        assert!(report.mean_total.is_finite());
        assert_eq!(driver.phase(), StepPhase::Done);
        assert!(report.breakdown.contains_key("d_loss"));

        let after: Vec<Vec<f32>> = driver
            .model()
            .parameters()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_ne!(before, after);
    }

    #[test]
    fn test_wrong_micro_batch_count() {
        let mut config = MoxeConfig::tiny_cpu();
        config.gradient_accumulation_steps = 2;
        let (mut driver, data) = solo_driver(config);
        let one = vec![data.batch(0, 0).unwrap()];
        assert!(matches!(driver.step(&one), Err(MoxeError::Config(_))));
        assert_ne!(driver.phase(), StepPhase::Failed);
        let report = driver.step(&data.micro_batches(0).unwrap()).unwrap();
        assert_eq!(report.micro_losses.len(), 2);
    }

    #[test]
    fn test_cadence_flags() {
        let mut config = MoxeConfig::tiny_cpu();
        config.logging_steps = 2;
        config.save_steps = 3;
        config.eval_strategy = EvalStrategy::Steps;
        config.eval_steps = 2;
        let (mut driver, data) = solo_driver(config);

        let r1 = driver.step(&data.micro_batches(0).unwrap()).unwrap();
        assert!(!r1.should_log && !r1.should_save && !r1.should_eval);
        let r2 = driver.step(&data.micro_batches(1).unwrap()).unwrap();
        assert!(r2.should_log && !r2.should_save && r2.should_eval);
        let r3 = driver.step(&data.micro_batches(2).unwrap()).unwrap();
        assert!(!r3.should_log && r3.should_save);
    }

    #[test]
    fn test_sgd_rejects_length_mismatch() {
        let var = Var::from_tensor(&Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()).unwrap();
        let mut sgd = Sgd::new(0.1);
        assert!(sgd.apply(&[var], &[]).is_err());
    }

    #[test]
    fn test_sgd_step() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &device).unwrap()).unwrap();
        let grad = Tensor::new(&[10.0f32, -10.0], &device).unwrap();
        Sgd::new(0.1).apply(&[var.clone()], &[grad]).unwrap();
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0, 3.0]);
    }
}
