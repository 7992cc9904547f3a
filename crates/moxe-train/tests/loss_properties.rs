//! Property-based tests for router losses.
//!
//! - Load balancing is invariant under expert relabelling
//! - Load balancing is minimised (=1) when selection fractions equal router mass
//! - z-loss and group losses are non-negative and finite
//! - Aggregation is a pure function of its inputs

use candle_core::{Device, Tensor};
use moxe_train::aggregator::LossAggregator;
use moxe_train::router_loss::{
    group_balance_loss, load_balancing_loss, mean_router_probs, router_z_loss, ExpertGroups,
    GroupLossKind, LossKind, LossScope, LossTerm,
};
use proptest::prelude::*;

fn scalar(t: &Tensor) -> f32 {
    t.to_scalar::<f32>().unwrap()
}

/// `(tokens, experts, logits, per-token expert choice, permutation seed)`
fn routing_case() -> impl Strategy<Value = (usize, usize, Vec<f32>, Vec<usize>, Vec<usize>)> {
    (1usize..12, 2usize..9).prop_flat_map(|(tokens, experts)| {
        (
            Just(tokens),
            Just(experts),
            prop::collection::vec(-4.0f32..4.0, tokens * experts),
            prop::collection::vec(0..experts, tokens),
            Just((0..experts).collect::<Vec<_>>()).prop_shuffle(),
        )
    })
}

fn load_from(choices: &[usize], experts: usize) -> Vec<f32> {
    let mut load = vec![0f32; experts];
    for &e in choices {
        load[e] += 1.0;
    }
    load
}

proptest! {
    /// Property: relabelling experts leaves the load-balancing loss unchanged.
    #[test]
    fn load_balance_permutation_invariant(
        (tokens, experts, logits, choices, perm) in routing_case()
    ) {
        let device = Device::Cpu;
        let load = load_from(&choices, experts);

        let mut permuted_logits = vec![0f32; logits.len()];
        let mut permuted_load = vec![0f32; experts];
        for e in 0..experts {
            permuted_load[perm[e]] = load[e];
            for t in 0..tokens {
                permuted_logits[t * experts + perm[e]] = logits[t * experts + e];
            }
        }

        let a = load_balancing_loss(
            &Tensor::from_vec(logits, (tokens, experts), &device).unwrap(),
            &Tensor::from_vec(load, experts, &device).unwrap(),
            1,
        ).unwrap();
        let b = load_balancing_loss(
            &Tensor::from_vec(permuted_logits, (tokens, experts), &device).unwrap(),
            &Tensor::from_vec(permuted_load, experts, &device).unwrap(),
            1,
        ).unwrap();

        let (a, b) = (scalar(&a), scalar(&b));
        prop_assert!((a - b).abs() < 1e-4 * a.abs().max(1.0), "{} vs {}", a, b);
    }

    /// Property: with `f = P`, the loss is `E * Σ P²`, which is ≥ 1 with
    /// equality only for uniform routing.
    #[test]
    fn load_balance_at_matched_fractions(
        tokens in 1usize..10,
        experts in 2usize..8,
        logits in prop::collection::vec(-3.0f32..3.0, 80),
    ) {
        let device = Device::Cpu;
        let logits = logits[..tokens * experts].to_vec();
        let logits = Tensor::from_vec(logits, (tokens, experts), &device).unwrap();
        let probs = mean_router_probs(&logits).unwrap();
        // Load proportional to probability mass: fractions equal P exactly.
        let load = probs.affine(tokens as f64, 0.0).unwrap();
        let lb = scalar(&load_balancing_loss(&logits, &load, 1).unwrap());

        let p = probs.to_vec1::<f32>().unwrap();
        let expected = experts as f32 * p.iter().map(|x| x * x).sum::<f32>();
        prop_assert!((lb - expected).abs() < 1e-4, "{} vs {}", lb, expected);
        prop_assert!(lb >= 1.0 - 1e-4);
    }

    /// Property: z-loss is finite and non-negative for any logits.
    #[test]
    fn z_loss_non_negative(
        tokens in 1usize..8,
        logits in prop::collection::vec(-50.0f32..50.0, 32),
    ) {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(logits[..tokens * 4].to_vec(), (tokens, 4), &device).unwrap();
        let z = scalar(&router_z_loss(&logits).unwrap());
        prop_assert!(z.is_finite() && z >= 0.0, "z={}", z);
    }

    /// Property: every group loss variant is non-negative.
    #[test]
    fn group_losses_non_negative(weights in prop::collection::vec(0.01f32..1.0, 8)) {
        let device = Device::Cpu;
        let total: f32 = weights.iter().sum();
        let probs: Vec<f32> = weights.iter().map(|w| w / total).collect();
        let probs = Tensor::from_vec(probs, 8, &device).unwrap();

        for groups in [2usize, 4] {
            let groups = ExpertGroups::new(8, groups).unwrap();
            for kind in [
                GroupLossKind::Variance,
                GroupLossKind::SelfBalance,
                GroupLossKind::Kl,
                GroupLossKind::Js,
            ] {
                let v = scalar(&group_balance_loss(&probs, &groups, kind).unwrap());
                prop_assert!(v.is_finite() && v >= -1e-6, "{:?} = {}", kind, v);
            }
        }
    }

    /// Property: aggregating the same terms twice is bit-identical.
    #[test]
    fn aggregate_is_idempotent(
        task in 0.0f32..10.0,
        values in prop::collection::vec(0.0f32..5.0, 1..12),
    ) {
        let device = Device::Cpu;
        let task = Tensor::new(task, &device).unwrap();
        let terms: Vec<LossTerm> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let kind = LossKind::ALL[i % 4];
                let scope = if kind.is_per_layer() {
                    LossScope::Layer(i)
                } else {
                    LossScope::Global
                };
                LossTerm::valid(kind, scope, Tensor::new(v, &device).unwrap(), 0.01)
            })
            .collect();

        let aggregator = LossAggregator::new();
        let first = aggregator.aggregate(&task, &terms).unwrap();
        let second = aggregator.aggregate(&task, &terms).unwrap();
        prop_assert_eq!(first.total_value.to_bits(), second.total_value.to_bits());
        prop_assert_eq!(first.breakdown, second.breakdown);
    }
}
