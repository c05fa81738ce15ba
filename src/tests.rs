//! Integration Tests for distributed K-FAC
//!
//! Multi-rank scenarios run one thread per rank on the in-process fabric.

use crate::comm::{Communicator, GridId};
use crate::config::{AllgatherMode, InverseStrategy, KfacConfig, ReduceScatterMode};
use crate::error::KfacError;
use crate::fabric::LocalFabric;
use crate::kfac::{Kfac, TrainingContext};
use crate::linalg::tensor_to_vec;
use crate::model::{ConvGeometry, Layer, Model, RecordedLayer, SequentialModel};
use crate::registry::BlockRegistry;
use crate::schedule::{advance_damping, advance_interval};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BATCH: usize = 5;

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> Tensor {
    let n: usize = dims.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_vec(values, dims.to_vec(), &Device::Cpu).unwrap()
}

/// Record a layer's tensors from `rng`, weights included
fn record(mut layer: RecordedLayer, rng: &mut StdRng, acts: &[usize], errs: &[usize]) -> RecordedLayer {
    let weight_dims: Vec<Vec<usize>> = (0..layer.num_weights())
        .map(|i| layer.weights(i).unwrap().dims().to_vec())
        .collect();
    let weights = weight_dims.iter().map(|d| random_tensor(rng, d)).collect();
    layer = layer.with_weight_values(weights).unwrap();
    let grads = weight_dims.iter().map(|d| random_tensor(rng, d)).collect();
    let a = random_tensor(rng, acts);
    let e = random_tensor(rng, errs);
    layer.record(a, e, grads).unwrap();
    layer
}

/// fc1 → bn1 → relu → conv1 → fc2, all tensors drawn from `seed`
fn mixed_model(seed: u64) -> SequentialModel {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(seed);
    let geometry = ConvGeometry::same(2, 3, 3, 3, 3);
    let mut model = SequentialModel::new();
    model
        .push(record(
            RecordedLayer::fully_connected("fc1", 3, 4, true, &device).unwrap(),
            &mut rng,
            &[BATCH, 3],
            &[BATCH, 4],
        ))
        .push(record(
            RecordedLayer::batch_norm("bn1", 4, &device).unwrap(),
            &mut rng,
            &[BATCH, 4],
            &[BATCH, 4],
        ))
        .push(RecordedLayer::passthrough("relu1"))
        .push(record(
            RecordedLayer::convolution("conv1", geometry, true, &device).unwrap(),
            &mut rng,
            &[BATCH, 2, 3, 3],
            &[BATCH, 3, 3, 3],
        ))
        .push(record(
            RecordedLayer::fully_connected("fc2", 6, 2, false, &device).unwrap(),
            &mut rng,
            &[BATCH, 6],
            &[BATCH, 2],
        ));
    model
}

fn single_fc_model(seed: u64) -> SequentialModel {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = SequentialModel::new();
    model.push(record(
        RecordedLayer::fully_connected("fc", 4, 3, true, &Device::Cpu).unwrap(),
        &mut rng,
        &[BATCH, 4],
        &[BATCH, 3],
    ));
    model
}

/// `single_fc_model` with every activation NaN
fn non_finite_fc_model(seed: u64) -> SequentialModel {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut layer = RecordedLayer::fully_connected("fc", 4, 3, true, &device).unwrap();
    let acts = Tensor::from_vec(vec![f32::NAN; BATCH * 4], (BATCH, 4), &device).unwrap();
    let errs = random_tensor(&mut rng, &[BATCH, 3]);
    let grads = vec![random_tensor(&mut rng, &[3, 4]), random_tensor(&mut rng, &[3])];
    layer.record(acts, errs, grads).unwrap();
    let mut model = SequentialModel::new();
    model.push(layer);
    model
}

fn gradients(model: &dyn Model) -> Vec<Vec<f64>> {
    let mut out = Vec::new();
    for layer in model.layers() {
        for idx in 0..layer.num_weights() {
            out.push(tensor_to_vec(layer.weight_gradient(idx).unwrap()).unwrap());
        }
    }
    out
}

fn weights(model: &dyn Model) -> Vec<Vec<f64>> {
    let mut out = Vec::new();
    for layer in model.layers() {
        for idx in 0..layer.num_weights() {
            out.push(tensor_to_vec(layer.weights(idx).unwrap()).unwrap());
        }
    }
    out
}

/// Run `steps` steps on a single grid; rank data comes from `seed(rank, step)`
fn run_single_grid(
    ranks: usize,
    config: &KfacConfig,
    steps: usize,
    build: fn(u64) -> SequentialModel,
    seed: fn(usize, usize) -> u64,
) -> Vec<Vec<Vec<f64>>> {
    LocalFabric::run(LocalFabric::single(ranks), |comm| {
        let rank = comm.rank();
        let mut kfac = Kfac::new(config.clone(), comm).unwrap();
        let mut model = build(seed(rank, 0));
        kfac.setup(&model).unwrap();
        for step in 0..steps {
            model = build(seed(rank, step));
            kfac.on_backward_prop_end(&mut model, &TrainingContext::new(step, 0))
                .unwrap();
        }
        gradients(&model)
    })
}

fn assert_close(a: &[Vec<f64>], b: &[Vec<f64>], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.len(), y.len());
        for (u, v) in x.iter().zip(y) {
            assert!((u - v).abs() <= tol * (1.0 + v.abs()), "{} vs {}", u, v);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULE TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod schedule_tests {
    use super::*;

    #[test]
    fn test_single_value_damping_ignores_history() {
        for (previous, warmup) in [(0.0, 1.0), (123.0, 50.0), (-4.0, 1e6)] {
            assert_eq!(advance_damping(previous, &[0.07], warmup), 0.07);
        }
    }

    #[test]
    fn test_two_value_damping_converges_within_warmup() {
        let params = [4.0, 1.0];
        let warmup = 2.0 * 4.0f64.log10();
        let mut value = params[0];
        let mut previous_gap = f64::INFINITY;
        for _ in 0..warmup.ceil() as usize {
            value = advance_damping(value, &params, warmup);
            let gap = (value - 1.0).abs();
            assert!(gap <= previous_gap);
            previous_gap = gap;
        }
        assert!((value - 1.0).abs() <= 0.01);
    }

    #[test]
    fn test_interval_ramp() {
        assert_eq!(advance_interval(0, &[1, 5], 8), 1);
        assert_eq!(advance_interval(4, &[1, 5], 8), 3);
        assert_eq!(advance_interval(8, &[1, 5], 8), 5);
        assert_eq!(advance_interval(80, &[1, 5], 8), 5);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_each_round_robin_over_fc_blocks() {
        let device = Device::Cpu;
        let mut model = SequentialModel::new();
        for i in 0..7 {
            model.push(RecordedLayer::fully_connected(&format!("fc{}", i), 2, 2, false, &device).unwrap());
            if i % 3 == 0 {
                model.push(RecordedLayer::batch_norm(&format!("bn{}", i), 2, &device).unwrap());
            }
        }
        let config = KfacConfig {
            inverse_strategy: InverseStrategy::Each,
            ..KfacConfig::default()
        };
        let mut registry = BlockRegistry::new();
        registry.build_blocks(&model, &config, 3).unwrap();

        let fc: Vec<usize> = registry
            .blocks()
            .iter()
            .filter(|b| b.name().starts_with("fc"))
            .map(|b| b.owner())
            .collect();
        let bn: Vec<usize> = registry
            .blocks()
            .iter()
            .filter(|b| b.name().starts_with("bn"))
            .map(|b| b.owner())
            .collect();
        assert_eq!(fc, (0..7).map(|i| i % 3).collect::<Vec<_>>());
        assert_eq!(bn, vec![0, 1, 2]);
    }

    #[test]
    fn test_build_is_idempotent() {
        let model = mixed_model(1);
        let config = KfacConfig::default();
        let mut registry = BlockRegistry::new();
        assert!(registry.build_blocks(&model, &config, 2).unwrap());
        let infos = registry.infos();
        let assignment = registry.assignment().to_vec();

        assert!(!registry.build_blocks(&model, &config, 5).unwrap());
        assert_eq!(registry.infos(), infos);
        assert_eq!(registry.assignment(), assignment.as_slice());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_two_parents_halt_the_build() {
        let device = Device::Cpu;
        let mut model = SequentialModel::new();
        model
            .push(RecordedLayer::fully_connected("fc1", 2, 2, false, &device).unwrap())
            .push(
                RecordedLayer::fully_connected("merge", 2, 2, false, &device)
                    .unwrap()
                    .with_topology(2, 1),
            )
            .push(RecordedLayer::fully_connected("fc3", 2, 2, false, &device).unwrap());
        let mut registry = BlockRegistry::new();
        let err = registry
            .build_blocks(&model, &KfacConfig::default(), 1)
            .unwrap_err();
        match &err {
            KfacError::Topology { layer, parents, children } => {
                assert_eq!(layer, "merge");
                assert_eq!((*parents, *children), (2, 1));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("#parent: 2"));
        assert!(registry.is_empty());
        assert!(!registry.is_built());
    }

    #[test]
    fn test_frozen_branching_layer_passes_driver() {
        let device = Device::Cpu;
        let mut model = single_fc_model(3);
        model.push(
            RecordedLayer::batch_norm("frozen_merge", 3, &device)
                .unwrap()
                .with_topology(2, 1)
                .without_optimizer(),
        );
        let comm = LocalFabric::single(1).remove(0);
        let mut kfac = Kfac::new(KfacConfig::default(), comm).unwrap();
        let report = kfac
            .on_backward_prop_end(&mut model, &TrainingContext::default())
            .unwrap();
        assert!(report.built_blocks);
        assert_eq!(kfac.registry().len(), 1);
        assert_eq!(kfac.registry().skipped()[0].name, "frozen_merge");
    }

    #[test]
    fn test_topology_error_surfaces_from_driver() {
        let device = Device::Cpu;
        let mut model = SequentialModel::new();
        model.push(
            RecordedLayer::batch_norm("bn", 2, &device)
                .unwrap()
                .with_topology(1, 3),
        );
        let comm = LocalFabric::single(1).remove(0);
        let mut kfac = Kfac::new(KfacConfig::default(), comm).unwrap();
        let result = kfac.on_backward_prop_end(&mut model, &TrainingContext::default());
        assert!(matches!(result, Err(KfacError::Topology { children: 3, .. })));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_json_round_trip_of_modes() {
        let config = KfacConfig::from_json_str(
            r#"{
                "damping_act": [0.1, 0.001],
                "inverse_strategy": "each",
                "reduce_scatter_mode": "reduce_scatter",
                "allgather_mode": "broadcast",
                "disable_layers": ["fc2"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.inverse_strategy, InverseStrategy::Each);
        assert_eq!(config.reduce_scatter_mode, ReduceScatterMode::ReduceScatter);
        assert_eq!(config.allgather_mode, AllgatherMode::Broadcast);
        assert!(config.is_disabled("fc2"));

        let again = KfacConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(again.damping_act, vec![0.1, 0.001]);
    }

    #[test]
    fn test_bad_strategy_is_rejected() {
        let result = KfacConfig::from_json_str(r#"{"inverse_strategy": "some"}"#);
        assert!(result.is_err());
        assert!("some".parse::<InverseStrategy>().is_err());
    }

    #[test]
    fn test_zero_damping_fails_driver_construction() {
        let config = KfacConfig {
            damping_act: vec![0.0],
            damping_err: vec![0.0],
            ..KfacConfig::default()
        };
        let comm = LocalFabric::single(1).remove(0);
        assert!(matches!(Kfac::new(config, comm), Err(KfacError::Config(_))));
        assert!(KfacConfig::from_json_str(r#"{"damping_bn_act": [0.0]}"#).is_err());
    }

    #[test]
    fn test_long_interval_list_is_rejected() {
        let result = KfacConfig::from_json_str(r#"{"update_intervals": [1, 2, 3]}"#);
        assert!(matches!(result, Err(KfacError::Config(_))));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// END-TO-END TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod e2e_tests {
    use super::*;

    fn same_on_every_rank(_rank: usize, step: usize) -> u64 {
        42 + step as u64
    }

    fn per_rank(rank: usize, step: usize) -> u64 {
        1000 + 31 * rank as u64 + step as u64
    }

    #[test]
    fn test_four_ranks_hold_identical_gradients() {
        let config = KfacConfig {
            inverse_strategy: InverseStrategy::Each,
            update_intervals: vec![1],
            ..KfacConfig::default()
        };
        let results = LocalFabric::run(LocalFabric::single(4), |comm| {
            let rank = comm.rank();
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            let mut model = single_fc_model(same_on_every_rank(rank, 0));
            kfac.setup(&model).unwrap();
            let mut refreshed = Vec::new();
            for step in 0..3 {
                model = single_fc_model(same_on_every_rank(rank, step));
                let report = kfac
                    .on_backward_prop_end(&mut model, &TrainingContext::new(step, 0))
                    .unwrap();
                refreshed.push(report.refreshed);
            }
            let preconditioned = kfac.registry().blocks()[0].preconditioned_gradient().to_vec();
            (kfac.registry().assignment().to_vec(), refreshed, preconditioned, gradients(&model))
        });

        for (assignment, refreshed, _, _) in &results {
            assert_eq!(assignment, &vec![0]);
            assert_eq!(refreshed, &vec![true; 3]);
        }
        let (_, _, reference, reference_grads) = &results[0];
        assert!(reference.iter().any(|v| *v != 0.0));
        for (_, _, preconditioned, grads) in &results[1..] {
            // bitwise equality
            assert_eq!(preconditioned, reference);
            assert_eq!(grads, reference_grads);
        }

        let raw = gradients(&single_fc_model(same_on_every_rank(0, 2)));
        assert_ne!(&raw, reference_grads);
    }

    #[test]
    fn test_wire_modes_match_allreduce_baseline() {
        let base = KfacConfig {
            inverse_strategy: InverseStrategy::Each,
            parallel_blocks: false,
            ..KfacConfig::default()
        };
        let baseline = run_single_grid(3, &base, 2, mixed_model, per_rank);
        for grads in &baseline[1..] {
            assert_eq!(grads, &baseline[0]);
        }

        for rs in [
            ReduceScatterMode::AllReduce,
            ReduceScatterMode::ReduceScatter,
            ReduceScatterMode::Reduce,
        ] {
            for ag in [AllgatherMode::AllReduce, AllgatherMode::Allgather, AllgatherMode::Broadcast] {
                let config = KfacConfig {
                    reduce_scatter_mode: rs,
                    allgather_mode: ag,
                    parallel_blocks: true,
                    ..base.clone()
                };
                let results = run_single_grid(3, &config, 2, mixed_model, per_rank);
                for grads in &results {
                    assert_close(grads, &baseline[0], 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_strategies_agree_on_results() {
        let mut reference = None;
        for strategy in [InverseStrategy::All, InverseStrategy::Each, InverseStrategy::Root] {
            let config = KfacConfig {
                inverse_strategy: strategy,
                use_pi: true,
                ..KfacConfig::default()
            };
            let results = run_single_grid(2, &config, 2, mixed_model, per_rank);
            assert_eq!(results[0], results[1]);
            match &reference {
                None => reference = Some(results[0].clone()),
                Some(r) => assert_close(&results[0], r, 1e-12),
            }
        }
    }

    #[test]
    fn test_update_interval_skips_refreshes() {
        let config = KfacConfig {
            update_intervals: vec![3],
            ..KfacConfig::default()
        };
        let results = LocalFabric::run(LocalFabric::single(2), |comm| {
            let rank = comm.rank();
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            let mut refreshed = Vec::new();
            let mut allocations = Vec::new();
            for step in 0..5 {
                let mut model = mixed_model(per_rank(rank, step));
                let report = kfac
                    .on_backward_prop_end(&mut model, &TrainingContext::new(step, 0))
                    .unwrap();
                refreshed.push(report.refreshed);
                allocations.push(kfac.workspace().allocations());
            }
            (refreshed, allocations)
        });
        for (refreshed, allocations) in results {
            assert_eq!(refreshed, vec![true, false, false, true, false]);
            // scratch buffers are allocated once and reused
            assert!(allocations.windows(2).all(|w| w[0] == w[1]));
        }
    }

    #[test]
    fn test_disabled_layer_gradient_is_untouched() {
        let config = KfacConfig {
            disable_layers: vec!["bn1".to_string()],
            ..KfacConfig::default()
        };
        let comm = LocalFabric::single(1).remove(0);
        let mut kfac = Kfac::new(config, comm).unwrap();
        let mut model = mixed_model(3);
        let before = gradients(&model);
        kfac.on_backward_prop_end(&mut model, &TrainingContext::default())
            .unwrap();
        let after = gradients(&model);
        // fc1 weight+bias, then bn1 scale+bias
        assert_ne!(after[0], before[0]);
        assert_eq!(after[2], before[2]);
        assert_eq!(after[3], before[3]);
        assert_eq!(kfac.registry().len(), 3);
    }

    #[test]
    fn test_dual_grid_matches_single_grid() {
        let config = KfacConfig {
            inverse_strategy: InverseStrategy::Each,
            ..KfacConfig::default()
        };
        let single = run_single_grid(2, &config, 2, mixed_model, per_rank);

        let results = LocalFabric::run(LocalFabric::dual(2, 2), |comm| {
            let grid = comm.grid();
            let rank = comm.rank();
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            let mut model = mixed_model(0);
            kfac.setup(&model).unwrap();
            for step in 0..2 {
                model = match grid {
                    // primary-grid data is never used for curvature
                    Some(GridId::Primary) => mixed_model(5000 + rank as u64),
                    _ => mixed_model(per_rank(rank, step)),
                };
                kfac.on_backward_prop_end(&mut model, &TrainingContext::new(step, 0))
                    .unwrap();
            }
            (grid, gradients(&model), weights(&model))
        });

        for (grid, grads, _) in &results {
            assert!(grid.is_some());
            // same arithmetic on the same data: bit-identical
            assert_eq!(grads, &single[0]);
        }
        // secondary rank s mirrors the weights of primary rank s mod 2
        for s in 0..2 {
            assert_eq!(results[2 + s].2, results[s].2);
        }
    }

    #[test]
    fn test_failed_inverse_does_not_strand_peers() {
        let config = KfacConfig {
            inverse_strategy: InverseStrategy::Root,
            ..KfacConfig::default()
        };
        let results = LocalFabric::run(LocalFabric::single(2), |comm| {
            let rank = comm.rank();
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            // rank 0 owns the only block and sees NaN factors after the reduction
            let mut model = if rank == 0 {
                non_finite_fc_model(11)
            } else {
                single_fc_model(per_rank(rank, 0))
            };
            kfac.on_backward_prop_end(&mut model, &TrainingContext::new(0, 0))
                .map(|_| ())
        });
        assert!(matches!(results[0], Err(KfacError::Numerical(_))));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_every_rank_reports_matrix_allocation() {
        let config = KfacConfig::default();
        let results = LocalFabric::run(LocalFabric::dual(2, 2), |comm| {
            let combined = comm.combined_rank();
            let rank = comm.rank();
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            let mut model = mixed_model(per_rank(rank, 0));
            kfac.on_backward_prop_end(&mut model, &TrainingContext::new(0, 0))
                .unwrap();
            let expected: usize = kfac
                .registry()
                .blocks()
                .iter()
                .map(|b| b.internal_matrix_info().len())
                .sum();
            (combined, expected, kfac.matrix_allocation_lines())
        });
        for (combined, expected, lines) in &results {
            assert_eq!(lines.len(), *expected);
            let tag = format!("(rank={})", combined);
            assert!(lines.iter().all(|l| l.contains(&tag)));
            assert!(lines.iter().any(|l| l.contains("conv1 kronecker_factor_A (19x19)")));
        }
    }

    #[test]
    fn test_dual_grid_larger_primary() {
        let config = KfacConfig::default();
        let single = run_single_grid(1, &config, 1, mixed_model, per_rank);
        let results = LocalFabric::run(LocalFabric::dual(3, 1), |comm| {
            let rank = comm.rank();
            let secondary = comm.grid() == Some(GridId::Secondary);
            let mut kfac = Kfac::new(config.clone(), comm).unwrap();
            let mut model = if secondary {
                mixed_model(per_rank(rank, 0))
            } else {
                mixed_model(7000 + rank as u64)
            };
            kfac.on_backward_prop_end(&mut model, &TrainingContext::new(0, 0))
                .unwrap();
            (gradients(&model), weights(&model))
        });
        for (grads, _) in &results {
            assert_eq!(grads, &single[0]);
        }
        // the lone secondary rank mirrors primary rank 0
        assert_eq!(results[3].1, results[0].1);
    }
}
