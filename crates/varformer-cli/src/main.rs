use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use varformer_attention::rotator::metrics::{error_report, ErrorGrid};
use varformer_attention::rotator::CachedRotator;
use varformer_nn::Module;
use varformer_transformer::{presets, registry, ModelConfig, Namespace, GPT};

#[derive(Parser)]
#[command(
    name = "varformer",
    about = "Configurable transformer engine",
    long_about = "Build GPT-style decoders whose norms, softmaxes, linears, rotators and routers\nare all picked by name, inspect the resolved layout, and sample from them.",
    version
)]
struct Cli {
    /// Log level for diagnostics on stderr
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelSource {
    /// Named preset (see `varformer presets`)
    #[arg(long, conflicts_with = "config")]
    preset: Option<String>,
    /// JSON model configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Safetensors checkpoint to load after building
    #[arg(long)]
    weights: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in model presets
    Presets,
    /// List every registered variant name, per namespace
    Variants,
    /// Build a model and print its resolved per-layer layout
    Build {
        #[command(flatten)]
        source: ModelSource,
        /// Print the layout and parameter groups as JSON
        #[arg(long)]
        json: bool,
        /// Print the fully defaulted configuration and exit
        #[arg(long)]
        dump_config: bool,
    },
    /// Compare rotator accuracy over the standard error grid
    Rotators {
        /// Largest CORDIC stage count to tabulate
        #[arg(long, default_value = "8")]
        stages: usize,
    },
    /// Run one forward pass and report statistics of the last-position logits
    Forward {
        #[command(flatten)]
        source: ModelSource,
        /// Comma-separated token ids
        #[arg(long)]
        tokens: String,
        /// How many of the highest-scoring tokens to list
        #[arg(long, default_value = "5")]
        top: usize,
    },
    /// Sample a continuation of comma-separated token ids
    Generate {
        #[command(flatten)]
        source: ModelSource,
        #[arg(long)]
        tokens: String,
        #[arg(long, default_value = "16")]
        max_new_tokens: usize,
        #[arg(long, default_value = "1.0")]
        temperature: f32,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long, default_value = "1337")]
        seed: u64,
    },
    /// Build a freshly initialized model and write its weights as safetensors
    Init {
        #[command(flatten)]
        source: ModelSource,
        #[arg(long, default_value = "model.safetensors")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Presets => cmd_presets(),
        Commands::Variants => cmd_variants(),
        Commands::Build { source, json, dump_config } => cmd_build(&source, json, dump_config),
        Commands::Rotators { stages } => cmd_rotators(stages),
        Commands::Forward { source, tokens, top } => cmd_forward(&source, &tokens, top),
        Commands::Generate { source, tokens, max_new_tokens, temperature, top_k, seed } => {
            cmd_generate(&source, &tokens, max_new_tokens, temperature, top_k, seed)
        }
        Commands::Init { source, output } => cmd_init(&source, &output),
    }
}

fn load_config(source: &ModelSource) -> Result<ModelConfig> {
    match (&source.preset, &source.config) {
        (Some(name), _) => Ok(presets::preset(name)?),
        (None, Some(path)) => ModelConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display())),
        (None, None) => bail!("one of --preset or --config is required"),
    }
}

fn load_model(source: &ModelSource) -> Result<GPT> {
    let config = load_config(source)?;
    let start = Instant::now();
    let mut model = GPT::new(config)?;
    if let Some(path) = &source.weights {
        model
            .load_safetensors(path)
            .with_context(|| format!("loading weights {}", path.display()))?;
    }
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "model ready");
    Ok(model)
}

fn cmd_presets() -> Result<()> {
    println!("{:<14} {:>6} {:>6} {:>4} {:>6} {:>8} {:>7}", "Preset", "Layers", "Heads", "KV", "Embd", "Vocab", "Block");
    println!("{}", "-".repeat(58));
    for name in presets::names() {
        let c = presets::preset(name)?;
        println!(
            "{:<14} {:>6} {:>6} {:>4} {:>6} {:>8} {:>7}",
            name,
            c.n_layer,
            c.n_head,
            c.kv_groups(),
            c.n_embd,
            c.vocab_size,
            c.block_size
        );
    }
    Ok(())
}

fn cmd_variants() -> Result<()> {
    let reg = registry();
    for ns in Namespace::ALL {
        println!("{:<20} {}", ns, reg.names(ns).join(", "));
    }
    Ok(())
}

fn cmd_build(source: &ModelSource, json: bool, dump_config: bool) -> Result<()> {
    if dump_config {
        println!("{}", load_config(source)?.to_json_pretty()?);
        return Ok(());
    }
    let model = load_model(source)?;
    let summary = model.layer_summary();
    if json {
        let out = serde_json::json!({
            "layers": summary,
            "param_groups": model.param_groups(),
            "num_params": model.num_params(true),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("parameters (non-embedding): {}", model.num_params(true));
    println!(
        "attention instances: {}, mlp instances: {}\n",
        model.attn_layout().arena_len,
        model.mlp_layout().arena_len
    );
    println!(
        "{:<6} {:>5} {:>5} {:<6} {:<9} {:<12} {:<10} {:<28} {:>3} {:<5}",
        "Layer", "Attn", "MLP", "Kind", "Norm", "Softmax", "Position", "Rotator", "KV", "Fused"
    );
    println!("{}", "-".repeat(100));
    for s in summary {
        println!(
            "{:<6} {:>5} {:>5} {:<6} {:<9} {:<12} {:<10} {:<28} {:>3} {:<5}",
            s.layer,
            s.attn_slot,
            s.mlp_slot,
            s.mlp_kind,
            s.norm,
            s.softmax,
            s.position,
            s.rotator.unwrap_or("-"),
            s.n_kv_groups,
            s.fused_attention
        );
    }
    Ok(())
}

fn cmd_rotators(max_stages: usize) -> Result<()> {
    let grid = ErrorGrid::default();
    let config = ModelConfig::default();
    let reg = registry();

    println!("{:<30} {:>14} {:>14}", "Rotator", "Scale err (%)", "Angle err (deg)");
    println!("{}", "-".repeat(60));
    let mut rows = Vec::new();
    for name in reg.names(Namespace::Rotator).into_iter().filter(|n| *n != "cordic") {
        rows.push((name.to_string(), error_report(reg.rotator(name, &config)?.as_ref(), &grid)));
    }
    for stages in 1..=max_stages {
        let config = ModelConfig {
            cordic_stages: stages,
            ..ModelConfig::default()
        };
        let rotator = CachedRotator::new(reg.rotator("cordic", &config)?);
        rows.push((format!("cordic ({stages} stages)"), error_report(&rotator, &grid)));
    }
    for (label, report) in rows {
        println!("{:<30} {:>14.6} {:>14.6}", label, report.scale_error_pct, report.angle_error_deg);
    }
    Ok(())
}

fn parse_tokens(tokens: &str) -> Result<Vec<usize>> {
    tokens
        .split(',')
        .map(|t| t.trim().parse::<usize>().with_context(|| format!("bad token id '{t}'")))
        .collect()
}

fn cmd_forward(source: &ModelSource, tokens: &str, top: usize) -> Result<()> {
    let prompt = parse_tokens(tokens)?;
    let mut model = load_model(source)?;
    model.train(false);
    let start = Instant::now();
    let (logits, _) = model.forward(&[prompt], None)?;
    let elapsed = start.elapsed();

    let values = logits.as_f32_slice();
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n).sqrt();
    let probs = logits.softmax()?;
    let entropy: f32 = probs
        .as_f32_slice()
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum();

    println!("vocab: {}  mean: {mean:.5}  std: {std:.5}  entropy: {entropy:.4} nats", values.len());
    println!("forward: {:.3}ms\n", elapsed.as_secs_f64() * 1000.0);
    println!("{:<6} {:>8} {:>12} {:>10}", "Rank", "Token", "Logit", "Prob");
    let top = top.clamp(1, values.len());
    let ranked = logits.topk_last(top)?;
    for (rank, &token) in ranked.first().into_iter().flatten().enumerate() {
        println!(
            "{:<6} {:>8} {:>12.5} {:>10.5}",
            rank + 1,
            token,
            values[token],
            probs.as_f32_slice()[token]
        );
    }
    Ok(())
}

fn cmd_generate(
    source: &ModelSource,
    tokens: &str,
    max_new_tokens: usize,
    temperature: f32,
    top_k: Option<usize>,
    seed: u64,
) -> Result<()> {
    let prompt = parse_tokens(tokens)?;
    if prompt.is_empty() {
        bail!("prompt must contain at least one token");
    }
    let mut model = load_model(source)?;
    model.train(false);
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Instant::now();
    let out = model.generate(&[prompt], max_new_tokens, temperature, top_k, &mut rng)?;
    let elapsed = start.elapsed().as_secs_f64();
    let ids: Vec<String> = out[0].iter().map(usize::to_string).collect();
    println!("{}", ids.join(","));
    info!(
        tokens = max_new_tokens,
        tokens_per_sec = max_new_tokens as f64 / elapsed.max(1e-9),
        "generation done"
    );
    Ok(())
}

fn cmd_init(source: &ModelSource, output: &Path) -> Result<()> {
    let model = load_model(source)?;
    model
        .save_safetensors(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {} parameters to {}", model.num_params(false), output.display());
    Ok(())
}
