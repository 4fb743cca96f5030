//! flaxport CLI
//!
//! Converts Falcon checkpoints between the PyTorch and Flax layouts.
//!
//! # Usage
//!
//! ```bash
//! # PyTorch checkpoint directory -> Flax params
//! flaxport to-flax --model tiiuae/falcon-7b --root ./models --output falcon-7b.flax.safetensors
//!
//! # Flax params -> PyTorch state dict
//! flaxport to-pt --input falcon-7b.flax.safetensors --config config.json --output model.safetensors
//!
//! # List the tensors in a file
//! flaxport inspect --input falcon-7b.flax.safetensors --nested
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use flaxport_model::{
    flax_to_pt, from_pretrained, load_flat, load_nested, save_flat, save_nested, ConvertOptions,
    Device, FalconConfig, LocalRegistry, RuntimeArgs,
};

#[derive(Parser)]
#[command(name = "flaxport")]
#[command(version)]
#[command(about = "Convert Falcon checkpoints between PyTorch and Flax parameter layouts")]
struct Cli {
    /// Target device tag for converted tensors (cpu, cuda, cuda:N)
    #[arg(long, global = true, env = "FLAXPORT_DEVICE", default_value = "cpu")]
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a PyTorch checkpoint directory into Flax params
    ToFlax {
        /// Model id, resolved under the registry root
        #[arg(short, long)]
        model: String,

        /// Registry root directory
        #[arg(short, long, env = "FLAXPORT_MODEL_ROOT", default_value = "models")]
        root: PathBuf,

        /// Output safetensors file (keys joined with '/')
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the augmented config.json here
        #[arg(long)]
        config_out: Option<PathBuf>,

        /// Convert projection and post-attention norm biases
        #[arg(long, default_value = "false")]
        bias: bool,

        /// Fail if the post-attention layer norm is absent
        #[arg(long, default_value = "false")]
        strict: bool,
    },

    /// Convert Flax params back into a PyTorch state dict
    ToPt {
        /// Input safetensors file written by `to-flax`
        #[arg(short, long)]
        input: PathBuf,

        /// Output safetensors file
        #[arg(short, long)]
        output: PathBuf,

        /// Model config.json; decides whether layers carry a post-attention
        /// norm (Falcon-7B defaults when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of decoder layers (inferred from the params when omitted)
        #[arg(short, long)]
        layers: Option<usize>,

        /// Convert projection and post-attention norm biases
        #[arg(long, default_value = "false")]
        bias: bool,
    },

    /// Print a summary of the tensors in a safetensors file
    Inspect {
        /// Input safetensors file
        #[arg(short, long)]
        input: PathBuf,

        /// Treat keys as '/'-joined Flax paths
        #[arg(long, default_value = "false")]
        nested: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flaxport_model=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let device: Device = cli
        .device
        .parse()
        .with_context(|| format!("invalid --device {:?}", cli.device))?;

    match cli.command {
        Commands::ToFlax {
            model,
            root,
            output,
            config_out,
            bias,
            strict,
        } => {
            let options = ConvertOptions::default()
                .with_bias(bias)
                .strict(strict)
                .on_device(device)
                .with_progress(true);
            run_to_flax(&model, root, &output, config_out, &options)?;
        }
        Commands::ToPt {
            input,
            output,
            config,
            layers,
            bias,
        } => {
            let config = match config {
                Some(path) => FalconConfig::from_json_file(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => FalconConfig::default(),
            };
            let options = ConvertOptions::default()
                .for_config(&config)
                .with_bias(bias)
                .on_device(device)
                .with_progress(true);
            run_to_pt(&input, &output, layers, &options)?;
        }
        Commands::Inspect { input, nested } => {
            run_inspect(&input, nested, device)?;
        }
    }

    Ok(())
}

fn run_to_flax(
    model: &str,
    root: PathBuf,
    output: &Path,
    config_out: Option<PathBuf>,
    options: &ConvertOptions,
) -> Result<()> {
    let start = Instant::now();
    let registry = LocalRegistry::new(root);

    println!("{} {}", style("Converting").cyan().bold(), model);
    let (params, config) = from_pretrained(&registry, model, options, RuntimeArgs::from_env())
        .with_context(|| format!("failed to convert {}", model))?;

    save_nested(&params, output)?;
    if let Some(path) = config_out {
        config.to_json_file(&path)?;
        println!("  Config:     {}", path.display());
    }

    println!("  Layers:     {}", config.num_hidden_layers);
    println!("  Parameters: {}", params.len());
    println!(
        "  Size:       {:.2} MB",
        params.total_size_bytes() as f64 / 1_000_000.0
    );
    println!(
        "{} {} in {:.1}s",
        style("Wrote").green().bold(),
        output.display(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

fn run_to_pt(
    input: &Path,
    output: &Path,
    layers: Option<usize>,
    options: &ConvertOptions,
) -> Result<()> {
    let start = Instant::now();
    let params = load_nested(input, options.device)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let num_layers = match layers.or_else(|| params.inferred_num_layers()) {
        Some(n) => n,
        None => bail!("no transformer/h/<i> entries in {}; pass --layers", input.display()),
    };

    println!(
        "{} {} ({} layers)",
        style("Converting").cyan().bold(),
        input.display(),
        num_layers
    );
    let state_dict = flax_to_pt(&params, num_layers, options)?;
    save_flat(&state_dict, output)?;

    println!("  Parameters: {}", state_dict.len());
    println!(
        "{} {} in {:.1}s",
        style("Wrote").green().bold(),
        output.display(),
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

fn run_inspect(input: &Path, nested: bool, device: Device) -> Result<()> {
    let (summary, bounds): (BTreeMap<String, String>, Option<String>) = if nested {
        let params = load_nested(input, device)?;
        let bounds = params
            .index_bounds()
            .iter()
            .map(|(depth, b)| format!("depth {}: {}..={}", depth, b.min, b.max))
            .collect::<Vec<_>>()
            .join(", ");
        (params.summary(), Some(bounds))
    } else {
        let params = load_flat(input, device)?;
        let layers = params
            .inferred_num_layers()
            .map(|n| format!("{} layers", n));
        (params.summary(), layers)
    };

    for (name, desc) in &summary {
        println!("{}  {}", style(name).bold(), desc);
    }
    println!("\n{} tensors", summary.len());
    if let Some(extra) = bounds.filter(|s| !s.is_empty()) {
        println!("{}", style(extra).dim());
    }
    Ok(())
}
