//! # Moxe Training Library
//!
//! Multi-objective loss aggregation for Mixture-of-Experts training on a
//! 2-D device mesh (`dp` × `tp`).
//!
//! ## Architecture Overview
//!
//! - **Mesh**: named axes, rank ↔ coordinate mapping, replica and shard groups
//! - **Layer selection**: `"all"` / list / count resolved once per run
//! - **Router losses**: z-loss, load balancing, expert-group balance and
//!   distillation, each independently switchable
//! - **Aggregation**: per-kind averaging, single coefficient per kind,
//!   raw and weighted breakdown, NaN/Inf guard
//! - **Driver**: forward → collect → aggregate → backward with gradient
//!   accumulation, then gradient averaging over the `dp` axis and update
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use moxe_train::{config::MoxeConfig, synthetic::simulate_mesh};
//!
//! # fn main() -> moxe_train::MoxeResult<()> {
//! let config = MoxeConfig::dp4_tp2();
//! let reports = simulate_mesh(&config, 3)?;
//! assert_eq!(reports.len(), 8);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod collective;
pub mod config;
pub mod driver;
pub mod error;
pub mod layers;
pub mod logging;
pub mod mesh;
pub mod router_loss;
pub mod routing;
pub mod synthetic;

pub use aggregator::{AggregatedLoss, LossAggregator, TermBreakdown};
pub use config::MoxeConfig;
pub use driver::{StepPhase, StepReport, TrainingStepDriver};
pub use error::{MoxeError, MoxeResult};
pub use layers::{LayerSelection, LayerSelector, MonitoredLayers};
pub use mesh::{MeshTopology, WorkerMesh};
pub use router_loss::{LossKind, LossKindSet, LossTerm, RouterLossCollector};
pub use routing::RoutingSnapshot;
