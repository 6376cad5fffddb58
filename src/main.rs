//! Music token sampler CLI
//!
//! Replays recorded score vectors through the sampling strategies and prints the tokens.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use music_sampler::inference::{
    AllowedSetProvider, ConstrainedTopPParams, ConstraintContext, GenerationConfig, MusicTheory,
    ReplaySource, RepetitionAwareParams, SamplingStrategy, Scores, TableProvider, TriadProvider,
    generate,
};

/// Sampling strategy selectable from the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Strategy {
    /// Softmax over the full vector
    Random,
    /// Top-k
    TopK,
    /// Nucleus (top-p with a top-k cap)
    Nucleus,
    /// Repetition-aware sampling
    Ras,
    /// Temperature, penalty, top-p and musical constraints
    Constrained,
}

/// Output format for the sampled tokens.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Space separated token ids
    #[default]
    Plain,
    /// JSON with metadata
    Json,
}

/// Music token sampler - replay model scores through constrained sampling.
#[derive(Debug, Parser)]
#[command(
    name = "music-sample",
    version,
    about = "Sample music tokens from recorded score vectors",
    long_about = "Replays a JSON list of per-step score vectors (arrays, or objects with \
                  \"primary\" and \"guidance\" arrays) through top-k, nucleus, \
                  repetition-aware or constraint-aware sampling."
)]
struct Cli {
    /// JSON file with the score vectors, one entry per step (cycled)
    #[arg(index = 1)]
    scores: PathBuf,

    /// Generation config JSON; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sampling strategy
    #[arg(short, long, value_enum)]
    strategy: Option<Strategy>,

    /// Top-k cap
    #[arg(long)]
    top_k: Option<usize>,

    /// Top-p (nucleus) threshold
    #[arg(long)]
    top_p: Option<f32>,

    /// Temperature (constrained strategy)
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Repetition penalty (constrained strategy)
    #[arg(long)]
    repetition_penalty: Option<f32>,

    /// Trailing tokens penalized (constrained strategy)
    #[arg(long)]
    recent_window: Option<usize>,

    /// Repetition window (ras strategy)
    #[arg(long)]
    win_size: Option<usize>,

    /// Repetition rate threshold (ras strategy)
    #[arg(long)]
    tau_r: Option<f32>,

    /// Maximum number of tokens to generate
    #[arg(long)]
    steps: Option<usize>,

    /// Minimum number of tokens before EOS is allowed
    #[arg(long)]
    min_steps: Option<usize>,

    /// End-of-sequence token id
    #[arg(long)]
    eos: Option<u32>,

    /// Random seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Prompt token ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    prompt: Vec<u32>,

    /// Chord table JSON (`{"entries": {...}, "default": [...]}`)
    #[arg(long)]
    notes: Option<PathBuf>,

    /// Derive chord tones by rule, with note tokens at this offset + MIDI pitch
    #[arg(long, conflicts_with = "notes")]
    triad_offset: Option<u32>,

    /// Time-signature table JSON
    #[arg(long)]
    durations: Option<PathBuf>,

    /// Current chord (harmony constraint)
    #[arg(long)]
    chord: Option<String>,

    /// Current time signature (rhythm constraint)
    #[arg(long)]
    time_signature: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct JsonOutput {
    tokens: Vec<u32>,
    generated: Vec<u32>,
    prompt_len: usize,
    fallbacks: usize,
    stopped_on_eos: bool,
    generation_time_ms: u64,
    seed: Option<u64>,
    strategy: SamplingStrategy,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = build_config(&cli)?;
    let steps = load_scores(&cli.scores)?;
    let theory = build_theory(&cli)?;

    let context = ConstraintContext {
        current_chord: cli.chord.clone(),
        current_time_signature: cli.time_signature.clone(),
    };
    if !context.is_unconstrained() && !matches!(cfg.strategy, SamplingStrategy::ConstrainedTopP(_))
    {
        tracing::warn!("--chord/--time-signature only apply to the constrained strategy");
    }

    tracing::info!(
        steps = steps.len(),
        vocab = steps.first().map_or(0, Scores::vocab_size),
        strategy = ?cfg.strategy,
        seed = ?cfg.seed,
        "sampling"
    );

    let mut source = ReplaySource::new(steps).with_contexts(vec![context]);
    let start = Instant::now();
    let generation = generate(&mut source, &cli.prompt, &cfg, theory.as_ref())
        .context("generation failed")?;
    let generation_time_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    match cli.format {
        OutputFormat::Plain => {
            let line = generation
                .generated()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
        OutputFormat::Json => {
            let payload = JsonOutput {
                generated: generation.generated().to_vec(),
                tokens: generation.tokens,
                prompt_len: generation.prompt_len,
                fallbacks: generation.fallbacks,
                stopped_on_eos: generation.stopped_on_eos,
                generation_time_ms,
                seed: cfg.seed,
                strategy: cfg.strategy,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<GenerationConfig> {
    let mut cfg = match &cli.config {
        Some(path) => GenerationConfig::from_json_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => GenerationConfig::default(),
    };

    if let Some(kind) = cli.strategy {
        cfg.strategy = match kind {
            Strategy::Random => SamplingStrategy::Random,
            Strategy::TopK => SamplingStrategy::TopK { top_k: 25 },
            Strategy::Nucleus => SamplingStrategy::Nucleus {
                top_p: 0.8,
                top_k: 25,
            },
            Strategy::Ras => SamplingStrategy::RepetitionAware(RepetitionAwareParams::default()),
            Strategy::Constrained => {
                SamplingStrategy::ConstrainedTopP(ConstrainedTopPParams::default())
            }
        };
    }
    apply_overrides(&mut cfg.strategy, cli);

    if let Some(steps) = cli.steps {
        cfg.max_new_tokens = steps;
    }
    if let Some(min_steps) = cli.min_steps {
        cfg.min_new_tokens = min_steps;
    }
    if cli.eos.is_some() {
        cfg.eos_token_id = cli.eos;
    }
    if cli.seed.is_some() {
        cfg.seed = cli.seed;
    }

    cfg.validate().context("invalid generation config")?;
    Ok(cfg)
}

fn apply_overrides(strategy: &mut SamplingStrategy, cli: &Cli) {
    match strategy {
        SamplingStrategy::Random => {}
        SamplingStrategy::TopK { top_k } => {
            *top_k = cli.top_k.unwrap_or(*top_k);
        }
        SamplingStrategy::Nucleus { top_p, top_k } => {
            *top_p = cli.top_p.unwrap_or(*top_p);
            *top_k = cli.top_k.unwrap_or(*top_k);
        }
        SamplingStrategy::RepetitionAware(params) => {
            params.top_p = cli.top_p.unwrap_or(params.top_p);
            params.top_k = cli.top_k.unwrap_or(params.top_k);
            params.win_size = cli.win_size.unwrap_or(params.win_size);
            params.tau_r = cli.tau_r.unwrap_or(params.tau_r);
        }
        SamplingStrategy::ConstrainedTopP(params) => {
            params.top_p = cli.top_p.unwrap_or(params.top_p);
            params.top_k = cli.top_k.unwrap_or(params.top_k);
            params.temperature = cli.temperature.unwrap_or(params.temperature);
            params.repetition_penalty = cli.repetition_penalty.unwrap_or(params.repetition_penalty);
            params.recent_window = cli.recent_window.unwrap_or(params.recent_window);
        }
    }
}

fn load_scores(path: &Path) -> Result<Vec<Scores>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read scores {}", path.display()))?;
    let steps: Vec<Scores> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if steps.is_empty() {
        anyhow::bail!("{} contains no score steps", path.display());
    }
    Ok(steps)
}

fn build_theory(cli: &Cli) -> Result<Option<MusicTheory>> {
    if cli.chord.is_none() && cli.time_signature.is_none() {
        return Ok(None);
    }

    let notes: Box<dyn AllowedSetProvider> = if let Some(path) = &cli.notes {
        Box::new(load_table(path)?)
    } else if let Some(note_offset) = cli.triad_offset {
        Box::new(TriadProvider {
            note_offset,
            ..TriadProvider::default()
        })
    } else {
        if cli.chord.is_some() {
            anyhow::bail!("--chord needs a note lookup: pass --notes or --triad-offset");
        }
        Box::new(TableProvider::default())
    };

    let durations: Box<dyn AllowedSetProvider> = if let Some(path) = &cli.durations {
        Box::new(load_table(path)?)
    } else {
        if cli.time_signature.is_some() {
            anyhow::bail!("--time-signature needs a duration lookup: pass --durations");
        }
        Box::new(TableProvider::default())
    };

    Ok(Some(MusicTheory { notes, durations }))
}

fn load_table(path: &Path) -> Result<TableProvider> {
    TableProvider::from_json_file(path).with_context(|| format!("load table {}", path.display()))
}
