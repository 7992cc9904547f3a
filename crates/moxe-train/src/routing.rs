//! Per-layer routing snapshot produced by the forward pass.

use candle_core::{DType, Tensor};

use crate::error::{config_error, shape_error, MoxeResult};

/// Router outputs for one MoE layer in one micro-batch.
///
/// Lives only for the step that produced it.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    layer: usize,
    /// `[num_tokens, num_experts]`, pre-softmax.
    gate_logits: Tensor,
    /// `[num_tokens, top_k]` expert indices (u32).
    expert_assignment: Tensor,
    /// `[num_experts]` routed-token counts (f32).
    expert_load: Tensor,
    token_counts: Vec<f32>,
    num_tokens: usize,
    num_experts: usize,
    top_k: usize,
}

impl RoutingSnapshot {
    /// Derive the top-k assignment and expert load from raw gate logits.
    ///
    /// Ties are broken toward the lower expert index.
    pub fn from_gate_logits(layer: usize, gate_logits: Tensor, top_k: usize) -> MoxeResult<Self> {
        let (num_tokens, num_experts) = gate_logits
            .dims2()
            .map_err(|_| {
                shape_error("gate_logits", "[num_tokens, num_experts]", gate_logits.dims())
            })?;
        if top_k == 0 || top_k > num_experts {
            return Err(config_error(format!(
                "top_k ({}) must be in [1, {}] for layer {}",
                top_k, num_experts, layer
            )));
        }

        let rows = gate_logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut assignment = Vec::with_capacity(num_tokens * top_k);
        let mut token_counts = vec![0f32; num_experts];
        let mut order: Vec<usize> = Vec::with_capacity(num_experts);
        for row in &rows {
            order.clear();
            order.extend(0..num_experts);
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
            for &expert in &order[..top_k] {
                assignment.push(expert as u32);
                token_counts[expert] += 1.0;
            }
        }

        let device = gate_logits.device().clone();
        let expert_assignment = Tensor::from_vec(assignment, (num_tokens, top_k), &device)?;
        let expert_load = Tensor::from_vec(token_counts.clone(), num_experts, &device)?;

        Ok(Self {
            layer,
            gate_logits,
            expert_assignment,
            expert_load,
            token_counts,
            num_tokens,
            num_experts,
            top_k,
        })
    }

    /// Build a snapshot from caller-computed assignment and load.
    ///
    /// `expert_assignment` may be `[num_tokens]` (top-1) or `[num_tokens, top_k]`.
    pub fn new(
        layer: usize,
        gate_logits: Tensor,
        expert_assignment: Tensor,
        expert_load: Tensor,
    ) -> MoxeResult<Self> {
        let (num_tokens, num_experts) = gate_logits
            .dims2()
            .map_err(|_| {
                shape_error("gate_logits", "[num_tokens, num_experts]", gate_logits.dims())
            })?;

        let top_k = match expert_assignment.dims() {
            [t] if *t == num_tokens => 1,
            [t, k] if *t == num_tokens && *k >= 1 => *k,
            other => {
                return Err(shape_error(
                    "expert_assignment",
                    format!("[{}] or [{}, top_k]", num_tokens, num_tokens),
                    other,
                ))
            }
        };
        if num_tokens > 0 && top_k > num_experts {
            return Err(config_error(format!(
                "layer {} assigns {} experts per token but has only {}",
                layer, top_k, num_experts
            )));
        }

        let indices = expert_assignment.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        if let Some(bad) = indices
            .iter()
            .find(|&&idx| idx < 0.0 || idx.fract() != 0.0 || idx >= num_experts as f64)
        {
            return Err(config_error(format!(
                "layer {} routes to expert index {} outside [0, {})",
                layer, bad, num_experts
            )));
        }

        if expert_load.dims() != [num_experts] {
            return Err(shape_error(
                "expert_load",
                format!("[{}]", num_experts),
                expert_load.dims(),
            ));
        }
        let token_counts = expert_load.to_dtype(DType::F32)?.to_vec1::<f32>()?;

        let device = gate_logits.device().clone();
        let expert_assignment = expert_assignment
            .to_dtype(DType::U32)?
            .reshape((num_tokens, top_k))?
            .to_device(&device)?;
        let expert_load = expert_load.to_dtype(DType::F32)?;

        Ok(Self {
            layer,
            gate_logits,
            expert_assignment,
            expert_load,
            token_counts,
            num_tokens,
            num_experts,
            top_k,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn gate_logits(&self) -> &Tensor {
        &self.gate_logits
    }

    pub fn expert_assignment(&self) -> &Tensor {
        &self.expert_assignment
    }

    pub fn expert_load(&self) -> &Tensor {
        &self.expert_load
    }

    /// Host copy of [`expert_load`](Self::expert_load).
    pub fn token_counts(&self) -> &[f32] {
        &self.token_counts
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// True when no tokens reached this layer.
    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }
}
