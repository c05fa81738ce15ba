//! # K-FAC Simulation CLI
//!
//! Runs distributed K-FAC preconditioning on synthetic layer data, one
//! thread per rank, and applies a plain SGD step with the preconditioned
//! gradients.
//!
//! ## Usage
//!
//! ```bash
//! # Four ranks, factors refreshed every step
//! kfac_sim --ranks 4 --steps 20
//!
//! # Dual grid: 2 trainer ranks, 2 curvature ranks
//! kfac_sim --ranks 2 --secondary-ranks 2 --inverse-strategy each
//!
//! # K-FAC settings from a file, timings logged
//! kfac_sim --config kfac.json --print-time
//! ```

use candle_core::{Device, Tensor};
use clap::Parser;
use kfac_dist::config::{parse_damping_params, parse_update_intervals};
use kfac_dist::linalg::tensor_to_vec;
use kfac_dist::prelude::*;
use kfac_dist::LocalCommunicator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

/// Distributed K-FAC on synthetic data
#[derive(Parser, Debug)]
#[command(name = "kfac_sim")]
#[command(about = "Simulate distributed K-FAC preconditioning on synthetic data")]
#[command(version)]
struct Args {
    /// Ranks in the trainer group (the primary grid in dual-grid runs)
    #[arg(short, long, default_value = "4")]
    ranks: usize,

    /// Ranks in the secondary grid; enables dual-grid mode
    #[arg(long)]
    secondary_ranks: Option<usize>,

    /// Number of training steps
    #[arg(short, long, default_value = "10")]
    steps: usize,

    /// Steps per epoch
    #[arg(long, default_value = "5")]
    steps_per_epoch: usize,

    /// Per-rank mini-batch size
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Input features
    #[arg(long, default_value = "8")]
    inputs: usize,

    /// Hidden width (also the batch-norm channel count)
    #[arg(long, default_value = "16")]
    hidden: usize,

    /// Output features
    #[arg(long, default_value = "4")]
    outputs: usize,

    /// SGD learning rate
    #[arg(long, default_value = "0.1")]
    learning_rate: f64,

    /// JSON file with K-FAC settings; the flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Damping for fc/conv factors, e.g. "0.03" or "0.1,0.001"
    #[arg(long)]
    damping: Option<String>,

    /// Damping for batch-norm blocks
    #[arg(long)]
    bn_damping: Option<String>,

    /// Factor update interval, e.g. "1" or "1,10"
    #[arg(long)]
    update_intervals: Option<String>,

    /// Inverse ownership: all, each or root
    #[arg(long)]
    inverse_strategy: Option<String>,

    /// allreduce, reduce_scatter or reduce
    #[arg(long)]
    reduce_scatter_mode: Option<String>,

    /// allreduce, allgather or broadcast
    #[arg(long)]
    allgather_mode: Option<String>,

    /// Comma-separated layer names to leave unpreconditioned
    #[arg(long)]
    disable_layers: Option<String>,

    /// Use the trace-ratio pi correction
    #[arg(long)]
    use_pi: bool,

    /// Log phase timings every step
    #[arg(long)]
    print_time: bool,

    /// Log factor summaries on refresh
    #[arg(long)]
    print_matrix_summary: bool,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// What one rank reports after the run
struct RankSummary {
    grid: Option<GridId>,
    rank: usize,
    owned_blocks: usize,
    refreshes: usize,
    grad_norm: f64,
    weight_norm: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = build_config(&args)?;

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  Distributed K-FAC Simulation                ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    match args.secondary_ranks {
        Some(secondary) => println!("Grids: {} primary + {} secondary ranks", args.ranks, secondary),
        None => println!("Ranks: {}", args.ranks),
    }
    println!(
        "Model: fc1({}→{}) → bn1({}) → relu1 → fc2({}→{}), batch {}",
        args.inputs, args.hidden, args.hidden, args.hidden, args.outputs, args.batch_size
    );
    println!();

    let comms = match args.secondary_ranks {
        Some(secondary) => LocalFabric::dual(args.ranks, secondary),
        None => LocalFabric::single(args.ranks),
    };
    let results = LocalFabric::run(comms, |comm| simulate_rank(&args, &config, comm));

    println!();
    println!("{:<10} {:>5} {:>7} {:>10} {:>14} {:>14}", "grid", "rank", "owned", "refreshes", "|grad|", "|weights|");
    for result in results {
        let s = result?;
        let grid = match s.grid {
            Some(GridId::Primary) => "primary",
            Some(GridId::Secondary) => "secondary",
            None => "single",
        };
        println!(
            "{:<10} {:>5} {:>7} {:>10} {:>14.6e} {:>14.6e}",
            grid, s.rank, s.owned_blocks, s.refreshes, s.grad_norm, s.weight_norm
        );
    }
    Ok(())
}

fn build_config(args: &Args) -> KfacResult<KfacConfig> {
    let mut config = match &args.config {
        Some(path) => KfacConfig::from_json_file(path)?,
        None => KfacConfig::default(),
    };
    if let Some(damping) = &args.damping {
        let params = parse_damping_params(damping)?;
        config.damping_act = params.clone();
        config.damping_err = params;
    }
    if let Some(damping) = &args.bn_damping {
        let params = parse_damping_params(damping)?;
        config.damping_bn_act = params.clone();
        config.damping_bn_err = params;
    }
    if let Some(intervals) = &args.update_intervals {
        config.update_intervals = parse_update_intervals(intervals)?;
        if config.update_intervals.len() == 2 && config.update_interval_steps == 0 {
            config.update_interval_steps = args.steps;
        }
    }
    if let Some(strategy) = &args.inverse_strategy {
        config.inverse_strategy = strategy.parse()?;
    }
    if let Some(mode) = &args.reduce_scatter_mode {
        config.reduce_scatter_mode = mode.parse()?;
    }
    if let Some(mode) = &args.allgather_mode {
        config.allgather_mode = mode.parse()?;
    }
    if let Some(layers) = &args.disable_layers {
        config.disable_layers = layers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    config.use_pi |= args.use_pi;
    config.print_time |= args.print_time;
    config.print_matrix_summary |= args.print_matrix_summary;
    config.validate()?;
    Ok(config)
}

fn random_tensor(rng: &mut StdRng, dims: &[usize], scale: f32, device: &Device) -> KfacResult<Tensor> {
    let n: usize = dims.iter().product();
    let values: Vec<f32> = (0..n).map(|_| scale * rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_vec(values, dims.to_vec(), device)?)
}

fn squared_norm(tensor: &Tensor) -> KfacResult<f64> {
    Ok(tensor_to_vec(tensor)?.iter().map(|v| v * v).sum())
}

fn simulate_rank(args: &Args, config: &KfacConfig, comm: LocalCommunicator) -> KfacResult<RankSummary> {
    let device = Device::Cpu;
    let grid = comm.grid();
    let rank = comm.rank();
    let error_scale = 1.0 / (args.batch_size * comm.size()) as f32;
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1000 * comm.combined_rank() as u64));

    let mut layers = vec![
        RecordedLayer::fully_connected("fc1", args.inputs, args.hidden, true, &device)?,
        RecordedLayer::batch_norm("bn1", args.hidden, &device)?,
        RecordedLayer::passthrough("relu1"),
        RecordedLayer::fully_connected("fc2", args.hidden, args.outputs, true, &device)?,
    ];
    // (fan in, fan out) per layer
    let io = [
        (args.inputs, args.hidden),
        (args.hidden, args.hidden),
        (0, 0),
        (args.hidden, args.outputs),
    ];
    for layer in layers.iter_mut() {
        for idx in 0..layer.num_weights() {
            let dims = layer.weights(idx).map(|w| w.dims().to_vec()).unwrap_or_default();
            layer.set_weights(idx, random_tensor(&mut rng, &dims, 0.5, &device)?)?;
        }
    }

    let mut kfac = Kfac::new(config.clone(), comm)?;
    let steps_per_epoch = args.steps_per_epoch.max(1);
    let mut refreshes = 0;
    let mut grad_norm = 0.0;

    for step in 0..args.steps {
        let mut model = SequentialModel::new();
        for (layer, (fan_in, fan_out)) in layers.iter_mut().zip(io) {
            if layer.num_weights() > 0 {
                let grads = (0..layer.num_weights())
                    .map(|idx| {
                        let dims = layer.weights(idx).map(|w| w.dims().to_vec()).unwrap_or_default();
                        random_tensor(&mut rng, &dims, 0.1, &device)
                    })
                    .collect::<KfacResult<Vec<_>>>()?;
                let acts = random_tensor(&mut rng, &[args.batch_size, fan_in], 1.0, &device)?;
                let errs = random_tensor(&mut rng, &[args.batch_size, fan_out], error_scale, &device)?;
                layer.record(acts, errs, grads)?;
            }
            model.push(layer.clone());
        }
        if step == 0 {
            kfac.setup(&model)?;
        }

        let ctx = TrainingContext::new(step, step / steps_per_epoch);
        let report = kfac.on_backward_prop_end(&mut model, &ctx)?;
        if report.refreshed {
            refreshes += 1;
        }

        // SGD on the (possibly mirrored) weights
        grad_norm = 0.0;
        for (state, layer) in layers.iter_mut().zip(model.layers()) {
            for idx in 0..layer.num_weights() {
                let (Some(w), Some(g)) = (layer.weights(idx), layer.weight_gradient(idx)) else {
                    continue;
                };
                grad_norm += squared_norm(g)?;
                let updated = w.sub(&g.affine(args.learning_rate, 0.0)?)?;
                state.set_weights(idx, updated)?;
            }
        }

        if (step + 1) % steps_per_epoch == 0 {
            kfac.on_epoch_end(&model, &ctx);
        }
    }

    let mut weight_norm = 0.0;
    for layer in &layers {
        for idx in 0..layer.num_weights() {
            if let Some(w) = layer.weights(idx) {
                weight_norm += squared_norm(w)?;
            }
        }
    }

    let owned_blocks = kfac
        .registry()
        .blocks()
        .iter()
        .filter(|b| b.owner() == rank && grid != Some(GridId::Primary))
        .count();
    Ok(RankSummary {
        grid,
        rank,
        owned_blocks,
        refreshes,
        grad_norm: grad_norm.sqrt(),
        weight_norm: weight_norm.sqrt(),
    })
}
