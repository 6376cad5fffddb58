//! Autoregressive generation loop.
//!
//! Pulls a score vector per step from a [`ScoreSource`], samples with the configured
//! [`SamplingStrategy`] and feeds the token back as history.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, invalid};
use crate::inference::TokenId;
use crate::inference::constraints::{ConstraintContext, MusicTheory};
use crate::inference::sampling::{
    ConstrainedTopPParams, RasDraw, RepetitionAwareParams, Scores, constrained_top_p_sampling,
    nucleus_sampling, random_sampling, ras_sampling, top_k_sampling, validate_nucleus,
    validate_top_k,
};
use crate::inference::seed::seeded_rng;

/// Produces the score vector(s) for the next step. Usually a language model decoder.
pub trait ScoreSource {
    /// Scores for the next token given everything generated so far.
    ///
    /// # Errors
    /// Implementation-defined; propagated unchanged by [`generate`].
    fn next_scores(&mut self, history: &[TokenId]) -> Result<Scores>;

    /// Musical context in effect at `step` (0-based over generated tokens).
    fn constraint_context(&self, _step: usize) -> ConstraintContext {
        ConstraintContext::default()
    }
}

/// How each step picks its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Softmax over the full vector.
    Random,
    TopK { top_k: usize },
    Nucleus { top_p: f32, top_k: usize },
    RepetitionAware(RepetitionAwareParams),
    /// Temperature, penalty, top-p and musical constraints over probability-like weights.
    ConstrainedTopP(ConstrainedTopPParams),
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        Self::RepetitionAware(RepetitionAwareParams::default())
    }
}

impl SamplingStrategy {
    /// # Errors
    /// `InvalidParameter` if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Random => Ok(()),
            Self::TopK { top_k } => validate_top_k(*top_k),
            Self::Nucleus { top_p, top_k } => validate_nucleus(*top_p, *top_k),
            Self::RepetitionAware(params) => params.validate(),
            Self::ConstrainedTopP(params) => params.validate(),
        }
    }

    /// Score that removes a token from consideration: `-inf` for logit-like scores, `0` for
    /// the probability-like weights of `ConstrainedTopP`.
    #[must_use]
    pub fn masked_value(&self) -> f32 {
        match self {
            Self::ConstrainedTopP(_) => 0.0,
            _ => f32::NEG_INFINITY,
        }
    }

    /// Draw one token. Constraints are only consulted by `ConstrainedTopP`.
    ///
    /// # Errors
    /// Propagates the errors of the underlying sampler.
    pub fn sample(
        &self,
        scores: &Scores,
        history: &[TokenId],
        constraints: Option<(&MusicTheory, &ConstraintContext)>,
        rng: &mut impl Rng,
    ) -> Result<RasDraw> {
        let token = match self {
            Self::Random => random_sampling(scores.primary(), rng)?,
            Self::TopK { top_k } => top_k_sampling(scores.primary(), *top_k, rng)?,
            Self::Nucleus { top_p, top_k } => {
                nucleus_sampling(scores.primary(), *top_p, *top_k, rng)?
            }
            Self::RepetitionAware(params) => return ras_sampling(scores, history, params, rng),
            Self::ConstrainedTopP(params) => {
                constrained_top_p_sampling(scores.primary(), history, params, constraints, rng)?
            }
        };
        Ok(RasDraw {
            token,
            fell_back: false,
        })
    }
}

/// Generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// EOS is suppressed until this many tokens were generated.
    pub min_new_tokens: usize,
    pub eos_token_id: Option<TokenId>,
    pub strategy: SamplingStrategy,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            min_new_tokens: 0,
            eos_token_id: None,
            strategy: SamplingStrategy::default(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Validate that the configuration is consistent.
    ///
    /// # Errors
    /// `InvalidParameter` on an out-of-range strategy parameter or `min > max`.
    pub fn validate(&self) -> Result<()> {
        if self.min_new_tokens > self.max_new_tokens {
            return Err(invalid(format!(
                "min_new_tokens ({}) exceeds max_new_tokens ({})",
                self.min_new_tokens, self.max_new_tokens
            )));
        }
        self.strategy.validate()
    }

    /// Load and validate a config from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Result of a generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Prompt followed by generated tokens (EOS excluded).
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    /// Steps where the repetition guard rejected the proposal.
    pub fallbacks: usize,
    pub stopped_on_eos: bool,
}

impl Generation {
    #[must_use]
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }
}

/// Generate tokens with an RNG seeded from `cfg.seed`.
///
/// # Errors
/// Returns an error if the config is invalid, the source fails, or a step cannot be sampled.
pub fn generate(
    source: &mut impl ScoreSource,
    prompt: &[TokenId],
    cfg: &GenerationConfig,
    theory: Option<&MusicTheory>,
) -> Result<Generation> {
    let mut rng = seeded_rng(cfg.seed);
    generate_with_rng(source, prompt, cfg, theory, &mut rng)
}

/// Generate tokens drawing from a caller-owned RNG. `cfg.seed` is ignored.
///
/// # Errors
/// See [`generate`].
pub fn generate_with_rng(
    source: &mut impl ScoreSource,
    prompt: &[TokenId],
    cfg: &GenerationConfig,
    theory: Option<&MusicTheory>,
    rng: &mut impl Rng,
) -> Result<Generation> {
    cfg.validate()?;

    let mut tokens = prompt.to_vec();
    let mut fallbacks = 0;
    let mut stopped_on_eos = false;

    for step in 0..cfg.max_new_tokens {
        let mut scores = source.next_scores(&tokens)?;
        scores.validate()?;

        if step < cfg.min_new_tokens
            && let Some(eos) = cfg.eos_token_id
        {
            suppress_token(&mut scores, eos, cfg.strategy.masked_value());
        }

        let context = source.constraint_context(step);
        let constraints = theory.map(|t| (t, &context));
        let draw = cfg
            .strategy
            .sample(&scores, &tokens[prompt.len()..], constraints, rng)?;

        if draw.token as usize >= scores.vocab_size() {
            return Err(invalid(format!(
                "sampled token {} outside vocabulary of {}",
                draw.token,
                scores.vocab_size()
            )));
        }
        if draw.fell_back {
            fallbacks += 1;
        }
        tracing::trace!(step, token = draw.token, fell_back = draw.fell_back, "sampled");

        if cfg.eos_token_id == Some(draw.token) {
            stopped_on_eos = true;
            break;
        }
        tokens.push(draw.token);
    }

    let generation = Generation {
        tokens,
        prompt_len: prompt.len(),
        fallbacks,
        stopped_on_eos,
    };
    tracing::debug!(
        generated = generation.generated().len(),
        fallbacks,
        stopped_on_eos,
        "generation finished"
    );
    Ok(generation)
}

fn suppress_token(scores: &mut Scores, token: TokenId, value: f32) {
    let idx = token as usize;
    match scores {
        Scores::Single(v) => {
            if let Some(s) = v.get_mut(idx) {
                *s = value;
            }
        }
        Scores::Guided { primary, guidance } => {
            for v in [primary, guidance] {
                if let Some(s) = v.get_mut(idx) {
                    *s = value;
                }
            }
        }
    }
}

/// Replays a fixed list of score steps, cycling when exhausted.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    steps: Vec<Scores>,
    contexts: Vec<ConstraintContext>,
    cursor: usize,
}

impl ReplaySource {
    #[must_use]
    pub fn new(steps: Vec<Scores>) -> Self {
        Self {
            steps,
            contexts: Vec::new(),
            cursor: 0,
        }
    }

    /// Per-step musical contexts, cycled like the scores.
    #[must_use]
    pub fn with_contexts(mut self, contexts: Vec<ConstraintContext>) -> Self {
        self.contexts = contexts;
        self
    }
}

impl ScoreSource for ReplaySource {
    fn next_scores(&mut self, _history: &[TokenId]) -> Result<Scores> {
        if self.steps.is_empty() {
            return Err(invalid("replay source has no score steps"));
        }
        let scores = self.steps[self.cursor % self.steps.len()].clone();
        self.cursor += 1;
        Ok(scores)
    }

    fn constraint_context(&self, step: usize) -> ConstraintContext {
        if self.contexts.is_empty() {
            return ConstraintContext::default();
        }
        self.contexts[step % self.contexts.len()].clone()
    }
}
