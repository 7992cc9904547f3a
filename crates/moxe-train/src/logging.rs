//! Structured logging for mesh-parallel MoE training with tracing.
//!
//! JSON output for production runs, pretty output for the CLI, and automatic
//! warnings when auxiliary losses start to dominate the task loss.

use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::aggregator::AggregatedLoss;
use crate::mesh::WorkerMesh;
use crate::router_loss::LossKind;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs. Safe to call more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,moxe_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,moxe_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Log the worker's place in the mesh.
pub fn log_mesh_worker(worker: &WorkerMesh) {
    info!(
        rank = worker.rank,
        dp = worker.dp_index,
        tp = worker.tp_index,
        replica_group = ?worker.replica_group,
        shard_group = ?worker.shard_group,
        gradient_group = ?worker.gradient_group,
        event = "mesh_worker",
        "Worker joined mesh"
    );
}

/// Log one aggregated micro-batch loss with its breakdown.
///
/// Warns when the weighted auxiliary sum exceeds the task loss.
pub fn log_training_step(step: usize, loss: &AggregatedLoss) {
    if !loss.total_value.is_finite() {
        error!(
            step = step,
            total = loss.total_value,
            breakdown = %loss.summary(),
            "Aggregated loss is not finite"
        );
        return;
    }

    info!(
        step = step,
        total = loss.total_value,
        task_loss = loss.task_loss,
        aux_loss = loss.auxiliary_weighted(),
        "Training step loss"
    );

    for (name, entry) in &loss.breakdown {
        debug!(
            step = step,
            term = %name,
            raw = entry.raw,
            weighted = entry.weighted,
            coefficient = entry.coefficient,
            instances = entry.instances,
            "Loss breakdown"
        );
    }

    let aux = loss.auxiliary_weighted();
    if aux > loss.task_loss.abs() {
        warn!(
            step = step,
            aux_loss = aux,
            task_loss = loss.task_loss,
            "Auxiliary losses outweigh the task loss. Consider lowering the \
             router loss coefficients"
        );
    }
}

/// Log a loss term dropped for degenerate input.
pub fn log_degenerate_term(layer: Option<usize>, kind: LossKind, reason: &str) {
    warn!(
        layer = layer,
        kind = %kind,
        reason = reason,
        event = "degenerate_term",
        "Loss term skipped for this step"
    );
}

/// Log a non-finite aggregated loss.
pub fn log_numerical_failure(step: usize, breakdown: &str) {
    error!(
        step = step,
        breakdown = breakdown,
        event = "numerical_failure",
        "Non-finite loss detected! Step aborted before backward."
    );
}

/// Log a fabric-wide abort.
pub fn log_group_abort(rank: usize, step: Option<usize>, reason: &str) {
    error!(
        rank = rank,
        step = ?step,
        reason = reason,
        event = "group_abort",
        "Aborting every rank in the mesh"
    );
}
