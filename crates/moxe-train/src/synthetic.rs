//! Seeded toy MoE model, data and teacher, plus an in-process SPMD runner.
//!
//! The model stacks `num_layers` soft-routed expert layers over a random
//! token embedding and finishes with a vocabulary head trained with
//! cross-entropy. Expert output weights are sharded across the `tp` axis
//! (row-parallel): each rank computes its shard's partial activation and the
//! replica group sums them. Routers are trained by the auxiliary losses only.

use std::thread;
use std::time::Duration;

use candle_core::{Device, Tensor, Var, D};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, trace};

use crate::collective::{LocalFabric, LocalProcessGroup, ProcessGroup};
use crate::config::MoxeConfig;
use crate::driver::{ForwardOutput, MoeModel, StepReport, TeacherSource, TrainingStepDriver};
use crate::error::{config_error, MoxeError, MoxeResult};
use crate::logging::{log_group_abort, log_mesh_worker};
use crate::mesh::{MeshTopology, WorkerMesh};
use crate::routing::RoutingSnapshot;

/// Shapes of the toy model and its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticSpec {
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            hidden_dim: 16,
            vocab_size: 32,
            seq_len: 8,
        }
    }
}

fn mix_seed(seed: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(seed, |acc, &p| {
        (acc ^ p.wrapping_add(0x9E37_79B9_7F4A_7C15))
            .wrapping_mul(0xBF58_476D_1CE4_E5B9)
            .rotate_left(31)
    })
}

fn uniform(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
}

fn random_var(rng: &mut StdRng, shape: (usize, usize), device: &Device) -> MoxeResult<Var> {
    let scale = 1.0 / (shape.0 as f32).sqrt();
    let data = uniform(rng, shape.0 * shape.1, scale);
    Ok(Var::from_tensor(&Tensor::from_vec(data, shape, device)?)?)
}

/// One micro-batch: `[tokens, hidden]` inputs and `[tokens]` targets.
#[derive(Debug, Clone)]
pub struct SyntheticBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
    /// Layers that receive no tokens in this batch.
    pub skipped_layers: Vec<usize>,
}

impl SyntheticBatch {
    pub fn num_tokens(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Route no tokens through `layer`.
    pub fn skip_layer(mut self, layer: usize) -> Self {
        self.skipped_layers.push(layer);
        self
    }

    /// Replace every input with NaN.
    pub fn poisoned(mut self) -> MoxeResult<Self> {
        self.inputs = self.inputs.affine(0.0, f64::NAN)?;
        Ok(self)
    }
}

/// Deterministic batch source for one `dp` shard.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    seed: u64,
    shard: usize,
    num_shards: usize,
    tokens: usize,
    spec: SyntheticSpec,
    accumulation: usize,
    device: Device,
}

impl SyntheticData {
    pub fn new(config: &MoxeConfig, worker: &WorkerMesh, device: &Device) -> Self {
        Self::with_spec(config, worker, SyntheticSpec::default(), device)
    }

    pub fn with_spec(
        config: &MoxeConfig,
        worker: &WorkerMesh,
        spec: SyntheticSpec,
        device: &Device,
    ) -> Self {
        let (shard, num_shards) = worker.data_shard();
        Self {
            seed: config.seed,
            shard,
            num_shards,
            tokens: config.per_device_train_batch_size * spec.seq_len,
            spec,
            accumulation: config.gradient_accumulation_steps,
            device: device.clone(),
        }
    }

    /// Micro-batch `micro` of step `step`. Identical across a replica group.
    pub fn batch(&self, step: usize, micro: usize) -> MoxeResult<SyntheticBatch> {
        let mut rng = StdRng::seed_from_u64(mix_seed(
            self.seed,
            &[
                step as u64,
                micro as u64,
                self.shard as u64,
                self.num_shards as u64,
            ],
        ));
        let inputs = uniform(&mut rng, self.tokens * self.spec.hidden_dim, 1.0);
        let targets: Vec<u32> = (0..self.tokens)
            .map(|_| rng.gen_range(0..self.spec.vocab_size as u32))
            .collect();
        Ok(SyntheticBatch {
            inputs: Tensor::from_vec(inputs, (self.tokens, self.spec.hidden_dim), &self.device)?,
            targets: Tensor::from_vec(targets, self.tokens, &self.device)?,
            skipped_layers: Vec::new(),
        })
    }

    /// All micro-batches for one optimisation step.
    pub fn micro_batches(&self, step: usize) -> MoxeResult<Vec<SyntheticBatch>> {
        (0..self.accumulation).map(|micro| self.batch(step, micro)).collect()
    }
}

/// Soft-routed toy MoE with `tp`-sharded expert outputs.
pub struct SyntheticMoeModel {
    routers: Vec<Var>,
    /// This rank's `[num_experts / tp, hidden]` shard per layer.
    expert_shards: Vec<Var>,
    head: Var,
    top_k: usize,
    shard_start: usize,
    shard_len: usize,
    tensor_parallel: Option<(LocalProcessGroup, Vec<usize>)>,
}

impl SyntheticMoeModel {
    pub fn new(config: &MoxeConfig, tp_index: usize, device: &Device) -> MoxeResult<Self> {
        Self::with_spec(config, tp_index, 1, SyntheticSpec::default(), device)
    }

    /// Build the shard owned by `tp_index` out of `tp_size`.
    ///
    /// Router and head weights are seeded from `config.seed` alone so every
    /// rank starts from the same replicated values.
    pub fn with_spec(
        config: &MoxeConfig,
        tp_index: usize,
        tp_size: usize,
        spec: SyntheticSpec,
        device: &Device,
    ) -> MoxeResult<Self> {
        if tp_size == 0 || config.num_experts % tp_size != 0 {
            return Err(config_error(format!(
                "num_experts ({}) must split evenly across tp size {}",
                config.num_experts, tp_size
            )));
        }
        let shard_len = config.num_experts / tp_size;
        let mut shared = StdRng::seed_from_u64(config.seed);
        let routers = (0..config.num_layers)
            .map(|_| random_var(&mut shared, (spec.hidden_dim, config.num_experts), device))
            .collect::<MoxeResult<Vec<_>>>()?;
        let head = random_var(&mut shared, (spec.hidden_dim, spec.vocab_size), device)?;

        let mut sharded = StdRng::seed_from_u64(mix_seed(config.seed, &[tp_index as u64]));
        let expert_shards = (0..config.num_layers)
            .map(|_| random_var(&mut sharded, (shard_len, spec.hidden_dim), device))
            .collect::<MoxeResult<Vec<_>>>()?;

        Ok(Self {
            routers,
            expert_shards,
            head,
            top_k: config.top_k,
            shard_start: tp_index * shard_len,
            shard_len,
            tensor_parallel: None,
        })
    }

    /// Sum partial expert activations over `replica_group` on every layer.
    pub fn with_tensor_parallel(
        mut self,
        group: LocalProcessGroup,
        replica_group: Vec<usize>,
    ) -> Self {
        if replica_group.len() > 1 {
            self.tensor_parallel = Some((group, replica_group));
        }
        self
    }

    pub fn num_layers(&self) -> usize {
        self.routers.len()
    }

    /// Row-parallel reduction. The value is the replica-group sum, identical
    /// on every peer; the gradient flows only into the local partial.
    fn reduce_partial(&self, partial: &Tensor) -> MoxeResult<Tensor> {
        let Some((group, members)) = &self.tensor_parallel else {
            return Ok(partial.clone());
        };
        let mut flat = partial.flatten_all()?.to_vec1::<f32>()?;
        group.all_reduce_mean(members, &mut flat)?;
        let summed = Tensor::from_vec(flat, partial.dims(), partial.device())?
            .affine(members.len() as f64, 0.0)?;
        Ok(summed.add(&partial.sub(&partial.detach())?)?)
    }
}

impl MoeModel for SyntheticMoeModel {
    type Batch = SyntheticBatch;

    fn parameters(&self) -> Vec<Var> {
        self.routers
            .iter()
            .chain(&self.expert_shards)
            .chain(std::iter::once(&self.head))
            .cloned()
            .collect()
    }

    fn forward(
        &self,
        batch: &SyntheticBatch,
        gradient_checkpointing: bool,
    ) -> MoxeResult<ForwardOutput> {
        trace!(gradient_checkpointing, tokens = batch.num_tokens(), "synthetic forward");
        let mut hidden = batch.inputs.clone();
        let mut routing = Vec::with_capacity(self.routers.len());

        for (layer, (router, experts)) in self.routers.iter().zip(&self.expert_shards).enumerate() {
            let gate_logits = hidden.matmul(router.as_tensor())?;
            if batch.skipped_layers.contains(&layer) {
                let (_, num_experts) = gate_logits.dims2()?;
                let empty =
                    Tensor::zeros((0, num_experts), gate_logits.dtype(), gate_logits.device())?;
                routing.push(RoutingSnapshot::from_gate_logits(layer, empty, self.top_k)?);
                continue;
            }

            // Constant gate weights keep routers identical across `tp`.
            let probs = candle_nn::ops::softmax(&gate_logits, D::Minus1)?.detach();
            let local = probs
                .narrow(1, self.shard_start, self.shard_len)?
                .matmul(experts.as_tensor())?;
            hidden = hidden.add(&self.reduce_partial(&local)?)?;
            routing.push(RoutingSnapshot::from_gate_logits(layer, gate_logits, self.top_k)?);
        }

        let logits = hidden.matmul(self.head.as_tensor())?;
        let task_loss = candle_nn::loss::cross_entropy(&logits, &batch.targets)?;
        Ok(ForwardOutput {
            task_loss,
            routing,
            logits,
        })
    }
}

/// Fixed random projection standing in for a trained teacher.
#[derive(Debug, Clone)]
pub struct SyntheticTeacher {
    projection: Tensor,
}

impl SyntheticTeacher {
    pub fn new(config: &MoxeConfig, device: &Device) -> MoxeResult<Self> {
        Self::with_spec(config, SyntheticSpec::default(), device)
    }

    pub fn with_spec(
        config: &MoxeConfig,
        spec: SyntheticSpec,
        device: &Device,
    ) -> MoxeResult<Self> {
        let mut rng = StdRng::seed_from_u64(mix_seed(config.seed, &[u64::MAX]));
        let data = uniform(&mut rng, spec.hidden_dim * spec.vocab_size, 1.0);
        Ok(Self {
            projection: Tensor::from_vec(data, (spec.hidden_dim, spec.vocab_size), device)?,
        })
    }
}

impl TeacherSource<SyntheticBatch> for SyntheticTeacher {
    fn teacher_logits(&self, batch: &SyntheticBatch) -> MoxeResult<Tensor> {
        Ok(batch.inputs.matmul(&self.projection)?)
    }
}

/// Hook that may rewrite a rank's micro-batches before each step.
pub type BatchHook<'a> =
    dyn Fn(usize, usize, &mut Vec<SyntheticBatch>) -> MoxeResult<()> + Sync + 'a;

/// Run `steps` optimisation steps on every mesh coordinate, one thread each.
///
/// Returns every rank's reports, indexed by rank.
pub fn simulate_mesh(config: &MoxeConfig, steps: usize) -> MoxeResult<Vec<Vec<StepReport>>> {
    simulate_mesh_with(config, steps, &|_, _, _| Ok(()))
}

/// [`simulate_mesh`] with a per-rank, per-step batch hook.
pub fn simulate_mesh_with(
    config: &MoxeConfig,
    steps: usize,
    hook: &BatchHook<'_>,
) -> MoxeResult<Vec<Vec<StepReport>>> {
    let config = config.clone().validated()?;
    let world_size = config.world_size();
    let topology = MeshTopology::build(&config.axis_names, &config.mesh_shape, world_size)?;
    let fabric = LocalFabric::new(world_size, Duration::from_millis(config.collective_timeout_ms));
    info!(world_size, steps, mesh = ?config.mesh_shape, "Starting mesh simulation");

    let results: Vec<MoxeResult<Vec<StepReport>>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let config = &config;
                let topology = &topology;
                let group = fabric.group(rank);
                scope.spawn(move || run_worker(config, topology, group, steps, hook))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(MoxeError::Collective {
                        rank,
                        step: None,
                        message: "worker thread panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(world_size);
    let mut first_abort = None;
    for result in results {
        match result {
            Ok(rank_reports) => reports.push(rank_reports),
            Err(err @ MoxeError::Aborted { .. }) => {
                first_abort.get_or_insert(err);
            }
            // The originating failure outranks the aborts it caused.
            Err(err) => return Err(err),
        }
    }
    match first_abort {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

type SyntheticDriver = TrainingStepDriver<SyntheticMoeModel, LocalProcessGroup>;

/// Abort the fabric for a failure the driver never saw.
fn abort_peers(group: &LocalProcessGroup, step: Option<usize>, err: MoxeError) -> MoxeError {
    let err = match step {
        Some(step) => err.at_step(step),
        None => err,
    };
    if group.check_abort().is_ok() {
        let at = err.step().or(step);
        let reason = err.to_string();
        log_group_abort(group.rank(), at, &reason);
        group.abort(at, &reason);
    }
    err
}

fn run_worker(
    config: &MoxeConfig,
    topology: &MeshTopology,
    group: LocalProcessGroup,
    steps: usize,
    hook: &BatchHook<'_>,
) -> MoxeResult<Vec<StepReport>> {
    let handle = group.clone();
    let rank = handle.rank();
    let (mut driver, data) =
        build_worker(config, topology, group).map_err(|err| abort_peers(&handle, None, err))?;

    let everyone: Vec<usize> = (0..topology.world_size()).collect();
    handle
        .barrier(&everyone)
        .map_err(|err| abort_peers(&handle, None, err))?;

    let mut reports = Vec::with_capacity(steps);
    for index in 0..steps {
        let step = driver.completed_steps() + 1;
        let outcome = data.micro_batches(index).and_then(|mut batches| {
            hook(rank, index, &mut batches)?;
            driver.step(&batches)
        });
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) => return Err(abort_peers(&handle, Some(step), err)),
        }
    }
    Ok(reports)
}

fn build_worker(
    config: &MoxeConfig,
    topology: &MeshTopology,
    group: LocalProcessGroup,
) -> MoxeResult<(SyntheticDriver, SyntheticData)> {
    let device = Device::Cpu;
    let worker = topology.worker(group.rank())?;
    log_mesh_worker(&worker);

    let model = SyntheticMoeModel::with_spec(
        config,
        worker.tp_index,
        worker.tp_size,
        SyntheticSpec::default(),
        &device,
    )?
    .with_tensor_parallel(group.clone(), worker.replica_group.clone());
    let data = SyntheticData::new(config, &worker, &device);
    let teacher: Option<Box<dyn TeacherSource<SyntheticBatch>>> = if config.compute_d_loss {
        Some(Box::new(SyntheticTeacher::new(config, &device)?))
    } else {
        None
    };

    let driver = TrainingStepDriver::new(config.clone(), worker, model, group, teacher)?;
    Ok((driver, data))
}
