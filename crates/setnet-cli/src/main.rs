//! Setnet CLI - run set encoders from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Reference DeepSets driver: two sets of four points, width 6
//! setnet demo deepsets
//!
//! # Reference DMPS driver with three plain rounds
//! setnet demo dmps --blocks plain,plain,plain
//!
//! # Print and check a model configuration
//! setnet example-config dmps > model.toml
//! setnet validate --config model.toml
//!
//! # Encode a JSON batch (B x N x F nested arrays) with fresh parameters
//! setnet run --config model.toml --input sets.json -o out.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand, ValueEnum};
use setnet_nn::set::tensor_from_nested;
use setnet_nn::{
    BlockKind, DeepSetsConfig, DeepSetsModel, DmpsConfig, DmpsModel, KernelConfig, ModelConfig,
    SetEncoder, SetModel,
};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "setnet")]
#[command(about = "Permutation-invariant set encoders", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reference driver on a fixed batch
    Demo {
        /// Architecture to run
        model: ModelKind,

        /// DMPS round kinds, comma-separated (plain, denoising, residual)
        #[arg(long, default_value = "plain,plain,plain")]
        blocks: String,

        /// Layer width (defaults: 6 for deepsets, 256 for dmps)
        #[arg(long)]
        width: Option<usize>,
    },

    /// Encode a JSON set batch with a configured model
    Run {
        /// Model configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Input batch: JSON array of sets, each an array of feature arrays
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (JSON); stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and check a model configuration
    Validate {
        /// Model configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print an example model configuration
    ExampleConfig {
        /// Architecture to describe
        #[arg(default_value = "dmps")]
        model: ModelKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelKind {
    /// Permutation-equivariant stack with max pooling
    Deepsets,
    /// Deep message passing on sets
    Dmps,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Demo {
            model,
            blocks,
            width,
        } => match model {
            ModelKind::Deepsets => cmd_demo_deepsets(width.unwrap_or(6)),
            ModelKind::Dmps => cmd_demo_dmps(&blocks, width.unwrap_or(256)),
        },
        Commands::Run {
            config,
            input,
            output,
        } => cmd_run(&config, &input, output.as_deref()),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::ExampleConfig { model } => {
            print!("{}", example_config(model));
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: &Path) -> Result<ModelConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ModelConfig =
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn load_batch(path: &Path, device: &Device) -> Result<Tensor> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let sets: Vec<Vec<Vec<f32>>> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse set batch {}", path.display()))?;
    tensor_from_nested(&sets, device)
        .with_context(|| format!("Malformed set batch in {}", path.display()))
}

fn print_rows(out: &Tensor) -> Result<()> {
    for (i, row) in out.to_vec2::<f32>()?.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|v| format!("{v:.4}")).collect();
        println!("  set {i}: [{}]", cells.join(", "));
    }
    Ok(())
}

fn cmd_demo_deepsets(width: usize) -> Result<()> {
    let device = Device::Cpu;
    let sets: Vec<Vec<Vec<f32>>> = vec![
        vec![vec![1., 2., 3.], vec![4., 5., 6.], vec![12., 65., 78.], vec![0., 65., 78.]],
        vec![vec![7., 8., 9.], vec![3., 1., 7.], vec![12., 65., 78.], vec![12., 1003., 78.]],
    ];
    let mut swapped = sets.clone();
    swapped[0].swap(2, 3);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DeepSetsModel::new(&DeepSetsConfig::default().with_width(width), 3, vb)?;

    let x = tensor_from_nested(&sets, &device)?;
    let start = Instant::now();
    let out = model.forward(&x)?;
    debug!(elapsed = ?start.elapsed(), "forward pass");
    let out_swapped = model.forward(&tensor_from_nested(&swapped, &device)?)?;
    let invariant = out.to_vec2::<f32>()? == out_swapped.to_vec2::<f32>()?;

    println!("DeepSets reference driver");
    println!("=========================");
    println!("Input shape:    {:?}", x.dims());
    println!("Output shape:   {:?}", out.dims());
    print_rows(&out)?;
    println!("Swap-invariant: {invariant}");

    if !invariant {
        bail!("output changed when set elements were swapped");
    }
    Ok(())
}

fn cmd_demo_dmps(blocks: &str, width: usize) -> Result<()> {
    let device = Device::Cpu;
    let blocks = BlockKind::parse_sequence(blocks).context("Invalid --blocks")?;
    let x = Tensor::new(&[[[1f32, 2., 3.], [4., 5., 6.]], [[7., 8., 9.], [3., 1., 7.]]], &device)?;

    let config = DmpsConfig::default()
        .with_blocks(blocks.clone())
        .with_width(width)
        .with_kernel(KernelConfig::default().with_hidden_sizes(vec![width, 2 * width]));
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DmpsModel::new(&config, 3, vb)?;

    let start = Instant::now();
    let out = model.forward(&x)?;
    debug!(elapsed = ?start.elapsed(), "forward pass");

    let kinds: Vec<&str> = blocks.iter().map(BlockKind::as_str).collect();
    println!("DMPS reference driver");
    println!("=====================");
    println!("Rounds:         [{}]", kinds.join(", "));
    println!("Input shape:    {:?}", x.dims());
    println!("Output shape:   {:?}", out.dims());
    for (round, alpha) in model.gates()? {
        println!("Gate round {round}:   {alpha:.4}");
    }
    print_rows(&out)?;
    Ok(())
}

fn cmd_run(config_path: &Path, input: &Path, output: Option<&Path>) -> Result<()> {
    let device = Device::Cpu;
    let config = load_config(config_path)?;
    let x = load_batch(input, &device)?;
    let (b, n, f) = x.dims3()?;
    info!(model = config.name(), sets = b, elements = n, features = f, "Loaded batch");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SetModel::build(&config, f, vb).context("Failed to build model")?;

    let start = Instant::now();
    let out = model.forward(&x).context("Forward pass failed")?;
    info!(
        output_dim = model.output_dim(),
        elapsed = ?start.elapsed(),
        "Encoded batch"
    );

    let json = serde_json::to_string_pretty(&out.to_vec2::<f32>()?)?;
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote set representations");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    println!("Configuration is valid");
    match &config {
        ModelConfig::DeepSets(c) => {
            println!("Model:          deepsets");
            println!("Block widths:   {:?}", c.widths);
            println!("Activation:     {}", c.activation);
            println!("Reduction:      {}", c.reduction);
            println!("Refinement:     {}", c.pooling.refine.is_some());
        }
        ModelConfig::Dmps(c) => {
            let kinds: Vec<&str> = c.blocks.iter().map(BlockKind::as_str).collect();
            println!("Model:          dmps");
            println!("Rounds:         [{}]", kinds.join(", "));
            println!("Extraction:     {} ({})", c.extraction_width, c.extraction_activation);
            println!("Round width:    {} ({})", c.rounds.width, c.rounds.activation);
            println!("Pool op:        {}", c.rounds.pool_op);
            println!("Kernel hidden:  {:?}", c.kernel.hidden_sizes);
        }
    }
    Ok(())
}

fn example_config(model: ModelKind) -> &'static str {
    match model {
        ModelKind::Deepsets => {
            r#"# setnet model configuration
model = "deepsets"

# Output width of each of the three equivariant blocks
widths = [256, 256, 256]
# identity | relu | tanh | sigmoid
activation = "tanh"
# Summary subtracted from every element: max | mean | sum
reduction = "max"

# Uncomment to refine the pooled vector (dropout -> dense -> dropout -> linear)
# [pooling.refine]
# hidden = 40
# out = 40
# dropout = 0.5
# activation = "tanh"
"#
        }
        ModelKind::Dmps => {
            r#"# setnet model configuration
model = "dmps"

# One entry per message passing round: plain | denoising | residual
blocks = ["denoising", "denoising", "denoising"]
extraction_width = 256
extraction_activation = "relu"

[rounds]
width = 256
activation = "relu"
# Neighbor reduction over the learned graph: max | approx_max | sum
pool_op = "approx_max"
# Initial value of each denoising gate
gate_init = 0.5

[kernel]
hidden_sizes = [256, 512]
activation = "tanh"
row_norm = false
mean_norm = false
"#
        }
    }
}
