//! Logical device mesh: named axes, rank ↔ coordinate mapping, and group membership.
//!
//! Ranks are laid out row-major: the last axis varies fastest. For
//! `axis_names = ["dp", "tp"]`, `mesh_shape = [4, 2]`:
//!
//! ```text
//!          tp=0  tp=1
//!   dp=0    0     1
//!   dp=1    2     3
//!   dp=2    4     5
//!   dp=3    6     7
//! ```
//!
//! The *replica group* of a rank is its row (ranks sharing its `dp`
//! coordinate, i.e. one full model copy split over `tp`). The *shard group* is
//! its column (ranks sharing its `tp` coordinate, i.e. every copy of the same
//! parameter shard). Gradients are averaged over the shard group.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{config_error, MoxeResult};

/// Data-parallel axis name.
pub const DP_AXIS: &str = "dp";
/// Tensor-parallel axis name.
pub const TP_AXIS: &str = "tp";

/// One named mesh dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Creates a mesh axis. Names must be non-empty and sizes at least 1.
    pub fn new<N: Into<String>>(name: N, size: usize) -> MoxeResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(config_error("mesh axis name must not be empty"));
        }
        if size == 0 {
            return Err(config_error(format!("mesh axis '{}' must have size >= 1", name)));
        }
        Ok(Self { name, size })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Immutable process grid built once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshTopology {
    axes: Vec<MeshAxis>,
    /// Row-major strides, one per axis.
    strides: Vec<usize>,
    axis_index_by_name: HashMap<String, usize>,
    world_size: usize,
}

impl MeshTopology {
    /// Build a topology from ordered axis names and sizes.
    ///
    /// Fails with a configuration error when the two lists differ in length,
    /// any size is zero, a name repeats, `dp` or `tp` is missing, or the
    /// product of sizes is not `world_size`.
    pub fn build<S: AsRef<str>>(
        axis_names: &[S],
        axis_sizes: &[usize],
        world_size: usize,
    ) -> MoxeResult<Self> {
        if axis_names.len() != axis_sizes.len() {
            return Err(config_error(format!(
                "axis_names has {} entries but mesh_shape has {}",
                axis_names.len(),
                axis_sizes.len()
            )));
        }
        if axis_names.is_empty() {
            return Err(config_error("mesh must have at least one axis"));
        }

        let mut axes = Vec::with_capacity(axis_names.len());
        let mut axis_index_by_name = HashMap::with_capacity(axis_names.len());
        for (idx, (name, &size)) in axis_names.iter().zip(axis_sizes).enumerate() {
            let axis = MeshAxis::new(name.as_ref(), size)?;
            if axis_index_by_name.insert(axis.name.clone(), idx).is_some() {
                return Err(config_error(format!("duplicate mesh axis '{}'", axis.name)));
            }
            axes.push(axis);
        }

        for required in [DP_AXIS, TP_AXIS] {
            if !axis_index_by_name.contains_key(required) {
                return Err(config_error(format!(
                    "mesh axes {:?} must include '{}'",
                    axes.iter().map(|a| a.name()).collect::<Vec<_>>(),
                    required
                )));
            }
        }

        let product = axes.iter().try_fold(1usize, |acc, axis| acc.checked_mul(axis.size));
        let product = product.ok_or_else(|| config_error("mesh size overflows usize"))?;
        if product != world_size {
            return Err(config_error(format!(
                "mesh_shape {:?} covers {} workers but {} are available",
                axis_sizes, product, world_size
            )));
        }

        let mut strides = vec![1usize; axes.len()];
        for idx in (0..axes.len().saturating_sub(1)).rev() {
            strides[idx] = strides[idx + 1] * axes[idx + 1].size;
        }

        Ok(Self {
            axes,
            strides,
            axis_index_by_name,
            world_size,
        })
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn axis_index(&self, axis_name: &str) -> Option<usize> {
        self.axis_index_by_name.get(axis_name).copied()
    }

    pub fn axis_size(&self, axis_name: &str) -> Option<usize> {
        self.axis_index(axis_name).map(|idx| self.axes[idx].size)
    }

    /// Coordinate tuple of `rank`, one entry per axis in declaration order.
    pub fn coordinate(&self, rank: usize) -> MoxeResult<Vec<usize>> {
        if rank >= self.world_size {
            return Err(config_error(format!(
                "rank {} out of range for world size {}",
                rank, self.world_size
            )));
        }
        Ok(self
            .axes
            .iter()
            .zip(&self.strides)
            .map(|(axis, stride)| (rank / stride) % axis.size)
            .collect())
    }

    /// Inverse of [`coordinate`](Self::coordinate).
    pub fn rank_of(&self, coordinate: &[usize]) -> MoxeResult<usize> {
        if coordinate.len() != self.axes.len() {
            return Err(config_error(format!(
                "coordinate {:?} has {} entries, mesh has {} axes",
                coordinate,
                coordinate.len(),
                self.axes.len()
            )));
        }
        let mut rank = 0;
        for ((&c, axis), stride) in coordinate.iter().zip(&self.axes).zip(&self.strides) {
            if c >= axis.size {
                return Err(config_error(format!(
                    "coordinate {} out of range for axis '{}' of size {}",
                    c, axis.name, axis.size
                )));
            }
            rank += c * stride;
        }
        Ok(rank)
    }

    fn require_axis(&self, axis_name: &str) -> MoxeResult<usize> {
        self.axis_index(axis_name)
            .ok_or_else(|| config_error(format!("unknown mesh axis '{}'", axis_name)))
    }

    /// Ranks whose coordinate on `axis_name` equals that of `rank`, ascending.
    pub fn ranks_sharing(&self, axis_name: &str, rank: usize) -> MoxeResult<Vec<usize>> {
        let axis = self.require_axis(axis_name)?;
        let own = self.coordinate(rank)?[axis];
        let stride = self.strides[axis];
        let size = self.axes[axis].size;
        Ok((0..self.world_size)
            .filter(|r| (r / stride) % size == own)
            .collect())
    }

    /// Ranks that match `rank` on every axis except `axis_name`, ascending.
    pub fn ranks_along(&self, axis_name: &str, rank: usize) -> MoxeResult<Vec<usize>> {
        let axis = self.require_axis(axis_name)?;
        let mut coord = self.coordinate(rank)?;
        (0..self.axes[axis].size)
            .map(|c| {
                coord[axis] = c;
                self.rank_of(&coord)
            })
            .collect()
    }

    /// Ranks sharing the `dp` coordinate of `rank`.
    pub fn replica_group(&self, rank: usize) -> MoxeResult<Vec<usize>> {
        self.ranks_sharing(DP_AXIS, rank)
    }

    /// Ranks sharing the `tp` coordinate of `rank`.
    pub fn shard_group(&self, rank: usize) -> MoxeResult<Vec<usize>> {
        self.ranks_sharing(TP_AXIS, rank)
    }

    /// Every distinct group of ranks sharing a coordinate on `axis_name`.
    pub fn groups_sharing(&self, axis_name: &str) -> MoxeResult<Vec<Vec<usize>>> {
        let axis = self.require_axis(axis_name)?;
        let size = self.axes[axis].size;
        let stride = self.strides[axis];
        let mut groups = vec![Vec::new(); size];
        for rank in 0..self.world_size {
            groups[(rank / stride) % size].push(rank);
        }
        Ok(groups)
    }

    /// Resolve everything `rank` needs to participate in the mesh.
    pub fn worker(&self, rank: usize) -> MoxeResult<WorkerMesh> {
        let coordinate = self.coordinate(rank)?;
        let dp_index = coordinate[self.require_axis(DP_AXIS)?];
        let tp_index = coordinate[self.require_axis(TP_AXIS)?];
        Ok(WorkerMesh {
            rank,
            coordinate,
            dp_index,
            dp_size: self.axis_size(DP_AXIS).unwrap_or(1),
            tp_index,
            tp_size: self.axis_size(TP_AXIS).unwrap_or(1),
            replica_group: self.replica_group(rank)?,
            shard_group: self.shard_group(rank)?,
            gradient_group: self.ranks_along(DP_AXIS, rank)?,
        })
    }
}

/// The calling worker's view of the mesh. Computed once, passed by reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerMesh {
    pub rank: usize,
    pub coordinate: Vec<usize>,
    pub dp_index: usize,
    pub dp_size: usize,
    pub tp_index: usize,
    pub tp_size: usize,
    /// Ranks sharing this worker's `dp` coordinate.
    pub replica_group: Vec<usize>,
    /// Ranks sharing this worker's `tp` coordinate.
    pub shard_group: Vec<usize>,
    /// Participants of the post-backward gradient average.
    pub gradient_group: Vec<usize>,
}

impl WorkerMesh {
    /// Single-process mesh (`dp=1, tp=1`).
    pub fn solo() -> Self {
        Self {
            rank: 0,
            coordinate: vec![0, 0],
            dp_index: 0,
            dp_size: 1,
            tp_index: 0,
            tp_size: 1,
            replica_group: vec![0],
            shard_group: vec![0],
            gradient_group: vec![0],
        }
    }

    /// Which data shard this worker consumes, and how many shards exist.
    pub fn data_shard(&self) -> (usize, usize) {
        (self.dp_index, self.dp_size)
    }
}
