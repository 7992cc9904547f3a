//! Router auxiliary losses.
//!
//! Every loss is a 0-d `Tensor` so it stays on the autograd graph:
//!
//! - **z-loss**: `mean_t(logsumexp(logits_t)^2)`. Keeps router logits small.
//! - **load balancing**: `E * Σ_e f_e * P_e` where `f_e` is the fraction of
//!   routing slots sent to expert `e` and `P_e` its mean router probability.
//!   Equals 1 under uniform routing.
//! - **group balance**: imbalance of router mass across contiguous expert
//!   groups (one group per `tp` shard by default).
//! - **distillation**: `T² · KL(teacher ‖ student)` per token, teacher detached.
//!
//! [`RouterLossCollector`] turns routing snapshots into [`LossTerm`]s. A term
//! whose inputs are degenerate is emitted as invalid instead of as NaN.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::config::MoxeConfig;
use crate::error::{config_error, shape_error, MoxeError, MoxeResult};
use crate::layers::LayerSelection;
use crate::logging::log_degenerate_term;
use crate::routing::RoutingSnapshot;

const GROUP_EPS: f64 = 1e-8;
const ENTROPY_EPS: f64 = 1e-6;

/// Auxiliary loss kinds, in aggregation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "z_loss")]
    ZLoss,
    #[serde(rename = "load_balancing_loss")]
    LoadBalance,
    #[serde(rename = "d_loss")]
    Distillation,
    #[serde(rename = "group_loss")]
    GroupBalance,
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::ZLoss,
        LossKind::LoadBalance,
        LossKind::Distillation,
        LossKind::GroupBalance,
    ];

    /// Breakdown key.
    pub fn name(self) -> &'static str {
        match self {
            LossKind::ZLoss => "z_loss",
            LossKind::LoadBalance => "load_balancing_loss",
            LossKind::Distillation => "d_loss",
            LossKind::GroupBalance => "group_loss",
        }
    }

    /// Computed once per monitored layer rather than once per batch.
    pub fn is_per_layer(self) -> bool {
        !matches!(self, LossKind::Distillation)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of enabled loss kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LossKindSet(u8);

impl LossKindSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        LossKind::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, kind: LossKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: LossKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Enabled kinds in aggregation order.
    pub fn iter(&self) -> impl Iterator<Item = LossKind> + '_ {
        LossKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<LossKind> for LossKindSet {
    fn from_iter<I: IntoIterator<Item = LossKind>>(iter: I) -> Self {
        let mut set = Self::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Where a term was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LossScope {
    Global,
    Layer(usize),
}

impl LossScope {
    pub fn layer(self) -> Option<usize> {
        match self {
            LossScope::Global => None,
            LossScope::Layer(idx) => Some(idx),
        }
    }
}

impl fmt::Display for LossScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossScope::Global => f.write_str("global"),
            LossScope::Layer(idx) => write!(f, "layer_{}", idx),
        }
    }
}

/// One computed auxiliary loss instance.
#[derive(Debug, Clone)]
pub struct LossTerm {
    pub kind: LossKind,
    pub scope: LossScope,
    /// 0-d tensor; zero when the term is invalid.
    pub value: Tensor,
    pub coefficient: f64,
    pub valid: bool,
}

impl LossTerm {
    pub fn valid(kind: LossKind, scope: LossScope, value: Tensor, coefficient: f64) -> Self {
        Self {
            kind,
            scope,
            value,
            coefficient,
            valid: true,
        }
    }

    pub fn invalid(
        kind: LossKind,
        scope: LossScope,
        coefficient: f64,
        device: &Device,
    ) -> MoxeResult<Self> {
        Ok(Self {
            kind,
            scope,
            value: Tensor::zeros((), DType::F32, device)?,
            coefficient,
            valid: false,
        })
    }

    /// `kind@scope`, e.g. `z_loss@layer_3`.
    pub fn name(&self) -> String {
        format!("{}@{}", self.kind, self.scope)
    }

    pub fn raw_value(&self) -> MoxeResult<f64> {
        scalar_f64(&self.value)
    }
}

pub(crate) fn scalar_f64(t: &Tensor) -> MoxeResult<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Group balance formulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLossKind {
    /// `Σ_g (p_g - 1/G)^2`
    #[default]
    Variance,
    /// Mean over group pairs of `(p_i - p_j)^2`.
    SelfBalance,
    /// KL divergence from uniform.
    Kl,
    /// Jensen-Shannon divergence from uniform.
    Js,
}

/// Contiguous, equal-size expert groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpertGroups {
    num_experts: usize,
    num_groups: usize,
}

impl ExpertGroups {
    pub fn new(num_experts: usize, num_groups: usize) -> MoxeResult<Self> {
        if num_groups == 0 || num_experts == 0 || num_experts % num_groups != 0 {
            return Err(config_error(format!(
                "num_experts ({}) must split evenly into {} expert groups",
                num_experts, num_groups
            )));
        }
        Ok(Self {
            num_experts,
            num_groups,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn group_size(&self) -> usize {
        self.num_experts / self.num_groups
    }

    pub fn group_of(&self, expert: usize) -> usize {
        expert / self.group_size()
    }

    /// One-hot `[num_experts, num_groups]` membership matrix.
    pub fn membership(&self, device: &Device) -> MoxeResult<Tensor> {
        let mut data = vec![0f32; self.num_experts * self.num_groups];
        for expert in 0..self.num_experts {
            data[expert * self.num_groups + self.group_of(expert)] = 1.0;
        }
        Ok(Tensor::from_vec(data, (self.num_experts, self.num_groups), device)?)
    }

    /// Sum per-expert values into per-group values.
    pub fn fold(&self, per_expert: &[f32]) -> Vec<f32> {
        let mut groups = vec![0f32; self.num_groups];
        for (expert, value) in per_expert.iter().enumerate() {
            groups[self.group_of(expert)] += value;
        }
        groups
    }
}

/// Log-sum-exp over the last dim with a detached max shift.
fn logsumexp(logits: &Tensor) -> candle_core::Result<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?.detach();
    logits
        .broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(D::Minus1)?
        .log()?
        .broadcast_add(&max)
}

/// Router z-loss over `[num_tokens, num_experts]` logits.
pub fn router_z_loss(gate_logits: &Tensor) -> candle_core::Result<Tensor> {
    logsumexp(gate_logits)?.sqr()?.mean_all()
}

/// Mean router probability per expert, `[num_experts]`.
pub fn mean_router_probs(gate_logits: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::softmax(gate_logits, D::Minus1)?.mean(0)
}

/// Load balancing loss from logits and per-expert routed-token counts.
///
/// `expert_load` sums to `num_tokens * top_k`.
pub fn load_balancing_loss(
    gate_logits: &Tensor,
    expert_load: &Tensor,
    top_k: usize,
) -> candle_core::Result<Tensor> {
    let (num_tokens, num_experts) = gate_logits.dims2()?;
    let slots = (num_tokens * top_k) as f64;
    let fractions = expert_load.to_dtype(gate_logits.dtype())?.affine(1.0 / slots, 0.0)?;
    let probs = mean_router_probs(gate_logits)?;
    fractions.mul(&probs)?.sum_all()?.affine(num_experts as f64, 0.0)
}

/// Group balance loss from `[num_experts]` mean router probabilities.
pub fn group_balance_loss(
    mean_probs: &Tensor,
    groups: &ExpertGroups,
    kind: GroupLossKind,
) -> MoxeResult<Tensor> {
    let g = groups.num_groups() as f64;
    let membership = groups.membership(mean_probs.device())?.to_dtype(mean_probs.dtype())?;
    // [1, E] x [E, G] -> [G]
    let mass = mean_probs.unsqueeze(0)?.matmul(&membership)?.squeeze(0)?;

    let loss = match kind {
        GroupLossKind::Variance => mass.affine(1.0, -1.0 / g)?.sqr()?.sum_all()?,
        GroupLossKind::SelfBalance => {
            if groups.num_groups() < 2 {
                mass.sum_all()?.affine(0.0, 0.0)?
            } else {
                let diff = mass.unsqueeze(1)?.broadcast_sub(&mass.unsqueeze(0)?)?;
                // Ordered pairs count each unordered pair twice.
                diff.sqr()?.sum_all()?.affine(1.0 / (g * (g - 1.0)), 0.0)?
            }
        }
        GroupLossKind::Kl => mass
            .mul(&mass.affine(g, GROUP_EPS)?.log()?)?
            .sum_all()?,
        GroupLossKind::Js => {
            let u = 1.0 / g;
            let mid = mass.affine(0.5, 0.5 * u)?;
            let log_mid = mid.affine(1.0, GROUP_EPS)?.log()?;
            let log_mass = mass.affine(1.0, GROUP_EPS)?.log()?;
            let kl_mass = mass.mul(&log_mass.sub(&log_mid)?)?.sum_all()?;
            let kl_uniform = log_mid
                .affine(-u, u * (u + GROUP_EPS).ln())?
                .sum_all()?;
            kl_mass.add(&kl_uniform)?.affine(0.5, 0.0)?
        }
    };
    Ok(loss)
}

/// Temperature-scaled `KL(teacher ‖ student)` averaged over tokens.
///
/// Accepts `[tokens, vocab]` or `[batch, seq, vocab]` logits.
pub fn distillation_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    temperature: f64,
) -> MoxeResult<Tensor> {
    if student_logits.dims() != teacher_logits.dims() {
        return Err(shape_error(
            "distillation logits",
            format!("{:?}", student_logits.dims()),
            teacher_logits.dims(),
        ));
    }
    let vocab = match student_logits.dims() {
        [_, v] | [_, _, v] => *v,
        other => return Err(shape_error("distillation logits", "[tokens, vocab]", other)),
    };
    let tokens = student_logits.elem_count() / vocab.max(1);
    if tokens == 0 || vocab == 0 {
        return Err(MoxeError::DegenerateInput {
            layer: None,
            kind: LossKind::Distillation,
            reason: "empty batch".to_string(),
        });
    }

    let student = student_logits
        .reshape((tokens, vocab))?
        .affine(1.0 / temperature, 0.0)?;
    let teacher = teacher_logits
        .to_dtype(student_logits.dtype())?
        .reshape((tokens, vocab))?
        .detach()
        .affine(1.0 / temperature, 0.0)?;

    let teacher_probs = candle_nn::ops::softmax(&teacher, D::Minus1)?;
    let teacher_log_probs = candle_nn::ops::log_softmax(&teacher, D::Minus1)?;
    let student_log_probs = candle_nn::ops::log_softmax(&student, D::Minus1)?;

    let kl = teacher_probs
        .mul(&teacher_log_probs.sub(&student_log_probs)?)?
        .sum_all()?;
    Ok(kl.affine(temperature * temperature / tokens as f64, 0.0)?)
}

/// Router entropy normalised by `ln(num_experts)`, in `[0, 1]`.
pub fn router_entropy(gate_logits: &Tensor) -> candle_core::Result<f64> {
    let (_, num_experts) = gate_logits.dims2()?;
    if num_experts < 2 {
        return Ok(0.0);
    }
    let probs = candle_nn::ops::softmax(gate_logits, D::Minus1)?;
    let entropy = probs
        .mul(&probs.affine(1.0, ENTROPY_EPS)?.log()?)?
        .sum(D::Minus1)?
        .mean_all()?
        .neg()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(entropy / (num_experts as f64).ln())
}

/// Routing diagnostics for one monitored layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerDiagnostics {
    pub layer: usize,
    pub num_tokens: usize,
    pub normalized_entropy: f64,
    pub token_counts: Vec<f32>,
    pub mean_probs: Vec<f32>,
    pub group_token_share: Vec<f32>,
    /// `None` marks an invalid term.
    pub raw_losses: BTreeMap<LossKind, Option<f64>>,
}

/// Output of [`RouterLossCollector::collect`].
#[derive(Debug, Clone, Default)]
pub struct CollectedLosses {
    pub terms: Vec<LossTerm>,
    pub diagnostics: Vec<LayerDiagnostics>,
}

/// Computes enabled auxiliary losses from routing snapshots.
#[derive(Debug, Clone)]
pub struct RouterLossCollector {
    enabled: LossKindSet,
    coefficients: [f64; 4],
    groups: ExpertGroups,
    group_loss_kind: GroupLossKind,
    temperature: f64,
    return_layers_outputs: bool,
}

impl RouterLossCollector {
    pub fn new(config: &MoxeConfig, groups: ExpertGroups) -> Self {
        Self {
            enabled: config.enabled_losses(),
            coefficients: LossKind::ALL.map(|kind| config.coefficient(kind)),
            groups,
            group_loss_kind: config.group_loss_kind,
            temperature: config.distill_temperature,
            return_layers_outputs: config.return_layers_outputs,
        }
    }

    /// Build with groups resolved against the `tp` axis size.
    pub fn from_config(config: &MoxeConfig, tp_size: usize) -> MoxeResult<Self> {
        let groups = ExpertGroups::new(config.num_experts, config.expert_groups(tp_size))?;
        Ok(Self::new(config, groups))
    }

    pub fn enabled(&self) -> LossKindSet {
        self.enabled
    }

    pub fn groups(&self) -> &ExpertGroups {
        &self.groups
    }

    fn coefficient(&self, kind: LossKind) -> f64 {
        self.coefficients[kind as usize]
    }

    /// Run `compute`, turning a degenerate-input error into an invalid term.
    fn term<F>(
        &self,
        kind: LossKind,
        scope: LossScope,
        device: &Device,
        compute: F,
    ) -> MoxeResult<LossTerm>
    where
        F: FnOnce() -> MoxeResult<Tensor>,
    {
        match compute() {
            Ok(value) => Ok(LossTerm::valid(kind, scope, value, self.coefficient(kind))),
            Err(err) if err.is_recoverable() => {
                log_degenerate_term(scope.layer(), kind, &err.to_string());
                LossTerm::invalid(kind, scope, self.coefficient(kind), device)
            }
            Err(err) => Err(err),
        }
    }

    /// Per-layer terms for one snapshot, plus diagnostics when enabled.
    pub fn collect_layer(
        &self,
        snapshot: &RoutingSnapshot,
    ) -> MoxeResult<(Vec<LossTerm>, Option<LayerDiagnostics>)> {
        if snapshot.num_experts() != self.groups.num_experts() {
            return Err(shape_error(
                format!("routing snapshot for layer {}", snapshot.layer()),
                format!("{} experts", self.groups.num_experts()),
                snapshot.gate_logits().dims(),
            ));
        }

        let layer = snapshot.layer();
        let scope = LossScope::Layer(layer);
        let device = snapshot.gate_logits().device();
        let logits = snapshot.gate_logits();
        let degenerate = |kind| MoxeError::DegenerateInput {
            layer: Some(layer),
            kind,
            reason: "zero tokens routed".to_string(),
        };

        let mut terms = Vec::new();
        for kind in self.enabled.iter().filter(|k| k.is_per_layer()) {
            let term = self.term(kind, scope, device, || {
                if snapshot.is_empty() {
                    return Err(degenerate(kind));
                }
                match kind {
                    LossKind::ZLoss => Ok(router_z_loss(logits)?),
                    LossKind::LoadBalance => Ok(load_balancing_loss(
                        logits,
                        snapshot.expert_load(),
                        snapshot.top_k(),
                    )?),
                    LossKind::GroupBalance => {
                        let probs = mean_router_probs(logits)?;
                        group_balance_loss(&probs, &self.groups, self.group_loss_kind)
                    }
                    LossKind::Distillation => {
                        Err(config_error("distillation is not a per-layer loss"))
                    }
                }
            })?;
            terms.push(term);
        }

        let diagnostics = if self.return_layers_outputs {
            Some(self.diagnose(snapshot, &terms)?)
        } else {
            None
        };
        Ok((terms, diagnostics))
    }

    fn diagnose(
        &self,
        snapshot: &RoutingSnapshot,
        terms: &[LossTerm],
    ) -> MoxeResult<LayerDiagnostics> {
        let mut raw_losses = BTreeMap::new();
        for term in terms {
            let raw = if term.valid { Some(term.raw_value()?) } else { None };
            raw_losses.insert(term.kind, raw);
        }

        let counts = snapshot.token_counts();
        let slots: f32 = counts.iter().sum();
        let group_token_share = self
            .groups
            .fold(counts)
            .into_iter()
            .map(|c| if slots > 0.0 { c / slots } else { 0.0 })
            .collect();

        let (normalized_entropy, mean_probs) = if snapshot.is_empty() {
            (0.0, vec![0.0; snapshot.num_experts()])
        } else {
            let logits = snapshot.gate_logits();
            (
                router_entropy(logits)?,
                mean_router_probs(logits)?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
            )
        };

        Ok(LayerDiagnostics {
            layer: snapshot.layer(),
            num_tokens: snapshot.num_tokens(),
            normalized_entropy,
            token_counts: counts.to_vec(),
            mean_probs,
            group_token_share,
            raw_losses,
        })
    }

    /// Batch-scoped terms (distillation).
    pub fn collect_global(
        &self,
        student_logits: &Tensor,
        teacher_logits: Option<&Tensor>,
    ) -> MoxeResult<Vec<LossTerm>> {
        if !self.enabled.contains(LossKind::Distillation) {
            return Ok(Vec::new());
        }
        let teacher = teacher_logits.ok_or_else(|| {
            config_error("d_loss is enabled but no teacher logits were supplied")
        })?;
        let term = self.term(
            LossKind::Distillation,
            LossScope::Global,
            student_logits.device(),
            || distillation_loss(student_logits, teacher, self.temperature),
        )?;
        Ok(vec![term])
    }

    /// All terms for one micro-batch.
    ///
    /// Snapshots for unmonitored layers are ignored. Every monitored layer
    /// must have a snapshot.
    pub fn collect(
        &self,
        selection: &LayerSelection,
        snapshots: &[RoutingSnapshot],
        student_logits: &Tensor,
        teacher_logits: Option<&Tensor>,
    ) -> MoxeResult<CollectedLosses> {
        let mut collected = CollectedLosses::default();

        for layer in selection.iter() {
            let snapshot = snapshots
                .iter()
                .find(|s| s.layer() == layer)
                .ok_or_else(|| {
                    shape_error(
                        "routing snapshots",
                        format!("a snapshot for monitored layer {}", layer),
                        snapshots.iter().map(|s| s.layer()).collect::<Vec<_>>(),
                    )
                })?;
            let (terms, diagnostics) = self.collect_layer(snapshot)?;
            collected.terms.extend(terms);
            collected.diagnostics.extend(diagnostics);
        }

        collected
            .terms
            .extend(self.collect_global(student_logits, teacher_logits)?);
        Ok(collected)
    }
}
