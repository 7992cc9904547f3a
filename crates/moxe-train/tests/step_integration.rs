//! End-to-end checks of collection, aggregation and the step driver on the
//! synthetic MoE model.

use std::thread;
use std::time::{Duration, Instant};

use candle_core::Device;
use moxe_train::aggregator::{LossAggregator, TASK_LOSS_KEY};
use moxe_train::collective::{LocalFabric, LocalProcessGroup};
use moxe_train::driver::{MoeModel, StepPhase, TeacherSource, TrainingStepDriver};
use moxe_train::layers::{LayerCountPolicy, LayerSelector, MonitoredLayers};
use moxe_train::mesh::{MeshTopology, WorkerMesh};
use moxe_train::router_loss::{LossKind, RouterLossCollector};
use moxe_train::synthetic::{
    simulate_mesh, simulate_mesh_with, SyntheticBatch, SyntheticData, SyntheticMoeModel,
    SyntheticSpec, SyntheticTeacher,
};
use moxe_train::{error::config_error, MoxeConfig, MoxeError};

/// The 8-worker preset squeezed onto one worker.
fn single_worker_config() -> MoxeConfig {
    let mut config = MoxeConfig::dp4_tp2();
    config.mesh_shape = vec![1, 1];
    config.num_expert_groups = Some(4);
    config.gradient_accumulation_steps = 1;
    config
}

struct Harness {
    config: MoxeConfig,
    model: SyntheticMoeModel,
    data: SyntheticData,
    teacher: SyntheticTeacher,
    collector: RouterLossCollector,
}

impl Harness {
    fn new(config: MoxeConfig) -> Self {
        let device = Device::Cpu;
        let worker = WorkerMesh::solo();
        Self {
            model: SyntheticMoeModel::new(&config, 0, &device).unwrap(),
            data: SyntheticData::new(&config, &worker, &device),
            teacher: SyntheticTeacher::new(&config, &device).unwrap(),
            collector: RouterLossCollector::from_config(&config, 1).unwrap(),
            config,
        }
    }

    fn aggregate(&self, batch: &SyntheticBatch) -> moxe_train::AggregatedLoss {
        let selection = LayerSelector::resolve(
            &self.config.monitored_layers,
            self.config.monitored_layers_policy,
            self.config.num_layers,
        )
        .unwrap();
        let out = self.model.forward(batch, false).unwrap();
        let teacher = if self.config.compute_d_loss {
            Some(self.teacher.teacher_logits(batch).unwrap())
        } else {
            None
        };
        let collected = self
            .collector
            .collect(&selection, &out.routing, &out.logits, teacher.as_ref())
            .unwrap();
        LossAggregator::new()
            .aggregate(&out.task_loss, &collected.terms)
            .unwrap()
            .with_layers(collected.diagnostics)
    }
}

#[test]
fn twelve_layer_breakdown_has_every_kind() {
    let harness = Harness::new(single_worker_config());
    let batch = harness.data.batch(0, 0).unwrap();
    let agg = harness.aggregate(&batch);

    let keys: Vec<&str> = agg.breakdown.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        ["d_loss", "group_loss", "load_balancing_loss", TASK_LOSS_KEY, "z_loss"]
    );

    let expected = agg.task_loss
        + 0.001 * agg.get(LossKind::ZLoss).unwrap().raw
        + 0.01 * agg.get(LossKind::LoadBalance).unwrap().raw
        + 0.01 * agg.get(LossKind::Distillation).unwrap().raw
        + 0.01 * agg.get(LossKind::GroupBalance).unwrap().raw;
    assert!(
        (agg.total_value - expected).abs() < 1e-5 * expected.abs().max(1.0),
        "total {} vs {}",
        agg.total_value,
        expected
    );

    assert_eq!(agg.get(LossKind::ZLoss).unwrap().instances, 12);
    assert_eq!(agg.get(LossKind::Distillation).unwrap().instances, 1);
    assert_eq!(agg.layers.len(), 12);
}

#[test]
fn empty_layer_is_left_out_of_the_mean() {
    let harness = Harness::new(single_worker_config());
    let batch = harness.data.batch(0, 0).unwrap().skip_layer(5);
    let agg = harness.aggregate(&batch);

    for kind in [LossKind::ZLoss, LossKind::LoadBalance, LossKind::GroupBalance] {
        let entry = agg.get(kind).unwrap();
        assert_eq!(entry.instances, 11, "{}", kind);
        assert!(entry.raw.is_finite());
    }
    assert!(agg.total_value.is_finite());

    let layer5 = agg.layers.iter().find(|d| d.layer == 5).unwrap();
    assert_eq!(layer5.num_tokens, 0);
    assert!(layer5.raw_losses.values().all(Option::is_none));
}

#[test]
fn disabled_kind_is_omitted_not_zeroed() {
    let mut config = single_worker_config();
    config.compute_d_loss = false;
    let harness = Harness::new(config);
    let agg = harness.aggregate(&harness.data.batch(0, 0).unwrap());

    assert!(!agg.breakdown.contains_key("d_loss"));
    assert!(agg.get(LossKind::ZLoss).is_some());
    assert_eq!(agg.breakdown.len(), 4);
}

#[test]
fn monitored_subset_changes_instances_not_weights() {
    let mut config = single_worker_config();
    config.monitored_layers = MonitoredLayers::Count(3);
    config.monitored_layers_policy = LayerCountPolicy::Last;
    let harness = Harness::new(config);
    let agg = harness.aggregate(&harness.data.batch(0, 0).unwrap());

    let z = agg.get(LossKind::ZLoss).unwrap();
    assert_eq!(z.instances, 3);
    assert_eq!(z.coefficient, 0.001);
    let layers: Vec<usize> = agg.layers.iter().map(|d| d.layer).collect();
    assert_eq!(layers, vec![9, 10, 11]);
}

#[test]
fn aggregation_is_reproducible() {
    let harness = Harness::new(single_worker_config());
    let batch = harness.data.batch(2, 0).unwrap();
    let first = harness.aggregate(&batch);
    let second = harness.aggregate(&batch);
    assert_eq!(first.total_value.to_bits(), second.total_value.to_bits());
    assert_eq!(first.breakdown, second.breakdown);
}

#[test]
fn mesh_simulation_reports_every_rank() {
    let mut config = MoxeConfig::dp4_tp2();
    config.num_layers = 4;
    config.gradient_accumulation_steps = 1;
    let reports = simulate_mesh(&config, 2).unwrap();

    assert_eq!(reports.len(), 8);
    for (rank, rank_reports) in reports.iter().enumerate() {
        assert_eq!(rank_reports.len(), 2);
        assert!(rank_reports.iter().all(|r| r.rank == rank && r.mean_total.is_finite()));
        assert_eq!(rank_reports[1].step, 2);
        assert!(rank_reports[0].should_log);
    }

    // Peers on the same dp coordinate see the same batch and replicated weights.
    for dp in 0..4 {
        let (a, b) = (&reports[2 * dp], &reports[2 * dp + 1]);
        for (ra, rb) in a.iter().zip(b) {
            assert!(
                (ra.mean_total - rb.mean_total).abs() < 1e-5,
                "dp={} step={}: {} vs {}",
                dp,
                ra.step,
                ra.mean_total,
                rb.mean_total
            );
        }
    }
}

#[test]
fn nan_on_one_rank_fails_the_whole_mesh() {
    let mut config = MoxeConfig::dp4_tp2();
    config.num_layers = 2;
    config.gradient_accumulation_steps = 1;
    config.collective_timeout_ms = 10_000;

    let result = simulate_mesh_with(&config, 3, &|rank, step, batches| {
        if rank == 3 && step == 0 {
            let poisoned = batches[0].clone().poisoned()?;
            batches[0] = poisoned;
        }
        Ok(())
    });

    match result {
        Err(MoxeError::Numerical { step, .. }) => assert_eq!(step, 1),
        other => panic!("expected a numerical failure, got {:?}", other.map(|r| r.len())),
    }
}

type Driver = TrainingStepDriver<SyntheticMoeModel, LocalProcessGroup>;

/// Driver for one rank of `topology`, with the model's row-parallel
/// reduction wired to the same fabric.
fn mesh_driver(
    config: &MoxeConfig,
    topology: &MeshTopology,
    fabric: &std::sync::Arc<LocalFabric>,
    rank: usize,
) -> (Driver, SyntheticData) {
    let device = Device::Cpu;
    let worker = topology.worker(rank).unwrap();
    let group = fabric.group(rank);
    let spec = SyntheticSpec::default();
    let model = SyntheticMoeModel::with_spec(config, worker.tp_index, worker.tp_size, spec, &device)
        .unwrap()
        .with_tensor_parallel(group.clone(), worker.replica_group.clone());
    let data = SyntheticData::new(config, &worker, &device);
    let teacher: Option<Box<dyn TeacherSource<SyntheticBatch>>> =
        Some(Box::new(SyntheticTeacher::new(config, &device).unwrap()));
    let driver = TrainingStepDriver::new(config.clone(), worker, model, group, teacher).unwrap();
    (driver, data)
}

fn solo_driver(config: &MoxeConfig) -> (Driver, SyntheticData, std::sync::Arc<LocalFabric>) {
    let topology = MeshTopology::build(&config.axis_names, &[1, 1], 1).unwrap();
    let fabric = LocalFabric::new(1, Duration::from_secs(5));
    let (driver, data) = mesh_driver(config, &topology, &fabric, 0);
    (driver, data, fabric)
}

fn flat_params(model: &SyntheticMoeModel) -> Vec<f32> {
    model
        .parameters()
        .iter()
        .flat_map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}

#[test]
fn accumulation_count_does_not_scale_gradients() {
    let mut config = MoxeConfig::tiny_cpu();
    let (mut single, data, _fabric) = solo_driver(&config);
    config.gradient_accumulation_steps = 4;
    let (mut accumulated, _, _fabric4) = solo_driver(&config);

    let batch = data.batch(0, 0).unwrap();
    single.step(&[batch.clone()]).unwrap();
    let report = accumulated.step(&vec![batch; 4]).unwrap();
    assert_eq!(report.micro_losses.len(), 4);

    let (a, b) = (flat_params(single.model()), flat_params(accumulated.model()));
    assert_eq!(a.len(), b.len());
    let max_diff = a
        .iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(0f32, f32::max);
    assert!(max_diff < 1e-6, "max parameter difference {}", max_diff);
}

#[test]
fn dp_replicas_hold_identical_parameters_after_sync() {
    let mut config = MoxeConfig::dp4_tp2();
    config.mesh_shape = vec![2, 2];
    config.num_layers = 2;
    config.gradient_accumulation_steps = 1;
    let topology = MeshTopology::build(&config.axis_names, &config.mesh_shape, 4).unwrap();
    let fabric = LocalFabric::new(4, Duration::from_secs(30));

    let params: Vec<Vec<f32>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let (config, topology, fabric) = (&config, &topology, &fabric);
                s.spawn(move || {
                    let (mut driver, data) = mesh_driver(config, topology, fabric, rank);
                    for step in 0..3 {
                        driver.step(&data.micro_batches(step).unwrap()).unwrap();
                    }
                    flat_params(driver.model())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // rank = dp * 2 + tp: ranks 0/2 hold tp shard 0, ranks 1/3 hold shard 1.
    assert_eq!(params[0], params[2]);
    assert_eq!(params[1], params[3]);
    assert_ne!(params[0], params[1]);
}

#[test]
fn wrong_batch_count_on_one_rank_halts_every_rank_promptly() {
    let mut config = MoxeConfig::dp4_tp2();
    config.num_layers = 2;
    config.gradient_accumulation_steps = 1;
    config.collective_timeout_ms = 30_000;

    let started = Instant::now();
    let result = simulate_mesh_with(&config, 2, &|rank, step, batches| {
        if rank == 5 && step == 0 {
            batches.clear();
        }
        Ok(())
    });
    let elapsed = started.elapsed();

    match result {
        Err(MoxeError::Config(message)) => {
            assert!(message.contains("micro-batches"), "{}", message)
        }
        other => panic!("expected the rank 5 config error, got {:?}", other.map(|r| r.len())),
    }
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
}

#[test]
fn failure_outside_the_driver_reaches_peers() {
    let mut config = MoxeConfig::dp4_tp2();
    config.num_layers = 2;
    config.gradient_accumulation_steps = 1;
    config.collective_timeout_ms = 30_000;

    let started = Instant::now();
    let result = simulate_mesh_with(&config, 3, &|rank, step, _| {
        if rank == 0 && step == 1 {
            return Err(config_error("shard 0 is unreadable"));
        }
        Ok(())
    });

    match result {
        Err(MoxeError::Config(message)) => assert!(message.contains("unreadable")),
        other => panic!("expected the rank 0 error, got {:?}", other.map(|r| r.len())),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn peers_see_origin_rank_and_step_of_an_abort() {
    let mut config = MoxeConfig::dp4_tp2();
    config.mesh_shape = vec![2, 1];
    config.num_layers = 2;
    config.gradient_accumulation_steps = 1;
    let topology = MeshTopology::build(&config.axis_names, &config.mesh_shape, 2).unwrap();
    let fabric = LocalFabric::new(2, Duration::from_secs(30));

    let (ok_peer, failing) = thread::scope(|s| {
        let (config, topology, fabric) = (&config, &topology, &fabric);
        let peer = s.spawn(move || {
            let (mut driver, data) = mesh_driver(config, topology, fabric, 0);
            let first = driver.step(&data.micro_batches(0).unwrap());
            let second = driver.step(&data.micro_batches(1).unwrap());
            (first.is_ok(), second.unwrap_err(), driver.phase())
        });
        let (mut driver, data) = mesh_driver(config, topology, fabric, 1);
        driver.step(&data.micro_batches(0).unwrap()).unwrap();
        let err = driver.step(&[]).unwrap_err();
        (peer.join().unwrap(), err)
    });

    assert!(matches!(failing, MoxeError::Config(_)));
    let (first_ok, peer_err, peer_phase) = ok_peer;
    assert!(first_ok);
    assert_eq!(peer_phase, StepPhase::Failed);
    assert!(peer_err.to_string().contains("rank 1 at step 2"), "{}", peer_err);
    match peer_err {
        MoxeError::Aborted {
            origin_rank,
            step,
            reason,
        } => {
            assert_eq!(origin_rank, 1);
            assert_eq!(step, Some(2));
            assert!(reason.contains("micro-batches"));
        }
        other => panic!("expected Aborted, got {:?}", other),
    }
    assert_eq!(fabric.abort_status().map(|(rank, _)| rank), Some(1));
}

#[test]
fn failed_driver_refuses_further_steps() {
    let config = MoxeConfig::tiny_cpu();
    let (mut driver, data, fabric) = solo_driver(&config);

    let poisoned = vec![data.batch(0, 0).unwrap().poisoned().unwrap()];
    assert!(matches!(driver.step(&poisoned), Err(MoxeError::Numerical { .. })));
    assert_eq!(driver.phase(), StepPhase::Failed);
    assert!(fabric.abort_status().is_some());

    let clean = data.micro_batches(1).unwrap();
    match driver.step(&clean) {
        Err(MoxeError::Aborted { origin_rank, .. }) => assert_eq!(origin_rank, 0),
        other => panic!("expected Aborted, got {:?}", other.map(|r| r.step)),
    }
    assert_eq!(driver.completed_steps(), 0);
}
