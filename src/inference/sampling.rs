//! Sampling strategies for generation.
//!
//! Implements top-k, nucleus (top-p with a top-k cap), repetition-aware sampling with an
//! optional guidance fallback, and the temperature/penalty/constraint top-p pipeline.
//! Every draw takes the caller's RNG so a seeded session is reproducible.

use std::cmp::Ordering;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplingError, invalid};
use crate::inference::TokenId;
use crate::inference::constraints::{ConstraintContext, MusicTheory, apply_constraints};
use crate::inference::transform::{apply_temperature, relieve_repetition, softmax};

/// Ordered `(token id, weight)` pairs kept by a selector. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSet {
    ids: Vec<TokenId>,
    weights: Vec<f32>,
}

impl CandidateSet {
    /// Build a set from parallel id/weight vectors.
    ///
    /// # Errors
    /// Returns `InvalidParameter` if the vectors are empty or differ in length.
    pub fn new(ids: Vec<TokenId>, weights: Vec<f32>) -> Result<Self> {
        if ids.is_empty() {
            return Err(invalid("candidate set must not be empty"));
        }
        if ids.len() != weights.len() {
            return Err(invalid(format!(
                "candidate ids ({}) and weights ({}) differ in length",
                ids.len(),
                weights.len()
            )));
        }
        Ok(Self { ids, weights })
    }

    /// A set holding one token with all of the mass.
    #[must_use]
    pub fn single(id: TokenId) -> Self {
        Self {
            ids: vec![id],
            weights: vec![1.0],
        }
    }

    #[must_use]
    pub fn ids(&self) -> &[TokenId] {
        &self.ids
    }

    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: TokenId) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn total_mass(&self) -> f32 {
        self.weights.iter().sum()
    }

    /// Rescale the weights to sum to one.
    ///
    /// # Errors
    /// `DegenerateDistribution` if the set carries no positive mass.
    pub fn normalized(mut self) -> Result<Self> {
        let total = self.total_mass();
        if !(total.is_finite() && total > 0.0) {
            return Err(SamplingError::DegenerateDistribution(format!(
                "candidate set of {} entries carries mass {total}",
                self.len()
            )));
        }
        for w in &mut self.weights {
            *w /= total;
        }
        Ok(self)
    }

    /// Keep only the entries with positive weight whose id is in `allowed`, preserving
    /// order and weights.
    ///
    /// Returns `None` when nothing survives. A zero-weight match does not count: it could
    /// never be drawn.
    #[must_use]
    pub fn intersect(&self, allowed: &[TokenId]) -> Option<Self> {
        let (ids, weights): (Vec<_>, Vec<_>) = self
            .ids
            .iter()
            .zip(&self.weights)
            .filter(|(id, w)| **w > 0.0 && allowed.contains(id))
            .map(|(&id, &w)| (id, w))
            .unzip();
        (!ids.is_empty()).then_some(Self { ids, weights })
    }
}

/// Score vectors for one step: a single distribution, or a primary plus a guidance
/// distribution (classifier-free guidance) that the repetition fallback draws from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scores {
    Single(Vec<f32>),
    Guided { primary: Vec<f32>, guidance: Vec<f32> },
}

impl Scores {
    /// The distribution the proposal is drawn from.
    #[must_use]
    pub fn primary(&self) -> &[f32] {
        match self {
            Self::Single(v) | Self::Guided { primary: v, .. } => v,
        }
    }

    /// The distribution the repetition fallback is drawn from.
    #[must_use]
    pub fn fallback(&self) -> &[f32] {
        match self {
            Self::Single(v) | Self::Guided { guidance: v, .. } => v,
        }
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.primary().len()
    }

    /// Check both vectors are non-empty and agree in length.
    ///
    /// # Errors
    /// `InvalidParameter` on an empty vector or a length mismatch.
    pub fn validate(&self) -> Result<()> {
        if self.primary().is_empty() {
            return Err(invalid("score vector is empty"));
        }
        if let Self::Guided { primary, guidance } = self
            && primary.len() != guidance.len()
        {
            return Err(invalid(format!(
                "guidance vector has {} entries, primary has {}",
                guidance.len(),
                primary.len()
            )));
        }
        Ok(())
    }
}

/// Parameters of repetition-aware sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepetitionAwareParams {
    pub top_p: f32,
    pub top_k: usize,
    /// Number of trailing history tokens inspected.
    pub win_size: usize,
    /// Repetition rate in `[0, 1]` that triggers the fallback.
    pub tau_r: f32,
}

impl Default for RepetitionAwareParams {
    fn default() -> Self {
        Self {
            top_p: 0.8,
            top_k: 25,
            win_size: 10,
            tau_r: 0.1,
        }
    }
}

impl RepetitionAwareParams {
    /// # Errors
    /// `InvalidParameter` if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        validate_nucleus(self.top_p, self.top_k)?;
        if !(0.0..=1.0).contains(&self.tau_r) {
            return Err(invalid(format!(
                "tau_r must be in [0, 1], got {}",
                self.tau_r
            )));
        }
        Ok(())
    }
}

/// Parameters of the temperature/penalty/constraint top-p pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstrainedTopPParams {
    pub top_p: f32,
    /// Cap on the nucleus size; `usize::MAX` means uncapped.
    pub top_k: usize,
    pub temperature: f32,
    pub repetition_penalty: f32,
    /// Trailing history tokens penalized; 0 disables the penalty.
    pub recent_window: usize,
}

impl Default for ConstrainedTopPParams {
    fn default() -> Self {
        Self {
            top_p: 0.85,
            top_k: usize::MAX,
            temperature: 1.1,
            repetition_penalty: 1.2,
            recent_window: 0,
        }
    }
}

impl ConstrainedTopPParams {
    /// # Errors
    /// `InvalidParameter` if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        validate_nucleus(self.top_p, self.top_k)?;
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(invalid(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty >= 1.0) {
            return Err(invalid(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Outcome of one repetition-aware draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasDraw {
    pub token: TokenId,
    /// Whether the proposal was rejected and the fallback distribution used.
    pub fell_back: bool,
}

pub(crate) fn validate_top_k(top_k: usize) -> Result<()> {
    if top_k == 0 {
        return Err(invalid("top_k must be >= 1"));
    }
    Ok(())
}

pub(crate) fn validate_nucleus(top_p: f32, top_k: usize) -> Result<()> {
    if !(top_p > 0.0 && top_p <= 1.0) {
        return Err(invalid(format!("top_p must be in (0, 1], got {top_p}")));
    }
    validate_top_k(top_k)
}

/// Indices of `scores` by descending value. Stable: ties keep their original order.
/// NaN sorts last.
fn sorted_desc(scores: &[f32]) -> Vec<usize> {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        key(scores[b])
            .partial_cmp(&key(scores[a]))
            .unwrap_or(Ordering::Equal)
    });
    order
}

/// Keep exactly `min(k, n)` highest entries; force the rest to `-inf`.
///
/// # Errors
/// `InvalidParameter` when `k == 0`.
pub fn top_k_mask(scores: &[f32], k: usize) -> Result<Vec<f32>> {
    validate_top_k(k)?;
    let mut masked = vec![f32::NEG_INFINITY; scores.len()];
    for i in sorted_desc(scores).into_iter().take(k) {
        masked[i] = scores[i];
    }
    Ok(masked)
}

/// Draw from the softmax of the `k` highest scores.
///
/// # Errors
/// `InvalidParameter` when `k == 0`, `DegenerateDistribution` if no finite score survives.
pub fn top_k_sampling(scores: &[f32], k: usize, rng: &mut impl Rng) -> Result<TokenId> {
    let masked = top_k_mask(scores, k)?;
    random_sampling(&masked, rng)
}

/// Walk `probs` by descending probability, collecting entries while the accumulated mass is
/// below `top_p` and fewer than `top_k` were taken. The entry that crosses `top_p` is kept.
/// The walk also ends at the first entry without mass, so a sub-stochastic vector never
/// drags zero-probability tokens into the set.
///
/// # Errors
/// `InvalidParameter` for out-of-range `top_p`/`top_k`, `DegenerateDistribution` for an
/// empty vector.
#[allow(clippy::cast_possible_truncation)]
pub fn accumulate_mass(probs: &[f32], top_p: f32, top_k: usize) -> Result<CandidateSet> {
    validate_nucleus(top_p, top_k)?;
    if probs.is_empty() {
        return Err(SamplingError::DegenerateDistribution(
            "cannot select from an empty score vector".into(),
        ));
    }

    let mut ids = Vec::new();
    let mut weights = Vec::new();
    let mut cum = 0.0_f32;
    for idx in sorted_desc(probs) {
        let p = probs[idx];
        let massless = p <= 0.0 || p.is_nan();
        if cum >= top_p || ids.len() >= top_k || (massless && !ids.is_empty()) {
            break;
        }
        cum += p;
        ids.push(idx as TokenId);
        weights.push(p);
    }

    CandidateSet::new(ids, weights)
}

/// Nucleus selection over the softmax of `scores`, capped at `top_k` entries.
///
/// # Errors
/// See [`accumulate_mass`]; also `DegenerateDistribution` when no score is finite.
pub fn nucleus_select(scores: &[f32], top_p: f32, top_k: usize) -> Result<CandidateSet> {
    let probs = softmax(scores);
    if probs.iter().all(|p| *p == 0.0) {
        return Err(SamplingError::DegenerateDistribution(
            "no finite score to build a nucleus from".into(),
        ));
    }
    accumulate_mass(&probs, top_p, top_k)
}

/// Nucleus selection followed by a draw from the renormalized candidates.
///
/// # Errors
/// See [`nucleus_select`].
pub fn nucleus_sampling(
    scores: &[f32],
    top_p: f32,
    top_k: usize,
    rng: &mut impl Rng,
) -> Result<TokenId> {
    let candidates = nucleus_select(scores, top_p, top_k)?;
    sample_candidates(candidates, rng)
}

/// Draw one token id from a candidate set after renormalizing it.
///
/// # Errors
/// `DegenerateDistribution` if the set has no positive mass.
pub fn sample_candidates(candidates: CandidateSet, rng: &mut impl Rng) -> Result<TokenId> {
    let candidates = candidates.normalized()?;
    let pos = draw_position(candidates.weights(), rng)?;
    Ok(candidates.ids()[pos])
}

/// Draw one token id from the softmax of the full score vector.
///
/// # Errors
/// `DegenerateDistribution` when no score is finite.
#[allow(clippy::cast_possible_truncation)]
pub fn random_sampling(scores: &[f32], rng: &mut impl Rng) -> Result<TokenId> {
    let probs = softmax(scores);
    Ok(draw_position(&probs, rng)? as TokenId)
}

/// Repetition-aware sampling.
///
/// Proposes a token by nucleus sampling on the primary scores. If the proposal occurs at
/// least `win_size * tau_r` times among the last `win_size` history tokens, it is discarded
/// and a token is drawn from the full fallback distribution instead (the guidance vector in
/// guided mode).
///
/// # Errors
/// `InvalidParameter` for bad parameters or mismatched vectors, `DegenerateDistribution`
/// when either draw has nothing to sample from.
#[allow(clippy::cast_precision_loss)]
pub fn ras_sampling(
    scores: &Scores,
    history: &[TokenId],
    params: &RepetitionAwareParams,
    rng: &mut impl Rng,
) -> Result<RasDraw> {
    params.validate()?;
    scores.validate()?;

    let proposal = nucleus_sampling(scores.primary(), params.top_p, params.top_k, rng)?;

    let window = &history[history.len().saturating_sub(params.win_size)..];
    let repeats = window.iter().filter(|&&t| t == proposal).count();

    let threshold = params.win_size as f32 * params.tau_r;
    if repeats as f32 >= threshold {
        let token = random_sampling(scores.fallback(), rng)?;
        tracing::trace!(proposal, repeats, threshold, token, "repetition fallback");
        return Ok(RasDraw {
            token,
            fell_back: true,
        });
    }

    Ok(RasDraw {
        token: proposal,
        fell_back: false,
    })
}

/// Temperature, repetition penalty, cumulative-mass cutoff and musical constraints, then a
/// single draw.
///
/// `weights` are non-negative probability-like scores. The cutoff runs on the transformed
/// weights directly (no softmax), so penalized tokens contribute their reduced mass. The
/// final draw takes a softmax over the renormalized survivors, which flattens them: with
/// survivors `[0.9, 0.1]` token 0 is drawn about 69% of the time.
///
/// # Errors
/// `InvalidParameter` for bad parameters, `DegenerateDistribution` when no mass survives,
/// `EmptyConstraintSet` if a constraint lookup has nothing to offer.
pub fn constrained_top_p_sampling(
    weights: &[f32],
    history: &[TokenId],
    params: &ConstrainedTopPParams,
    constraints: Option<(&MusicTheory, &ConstraintContext)>,
    rng: &mut impl Rng,
) -> Result<TokenId> {
    params.validate()?;

    let mut scores = weights.to_vec();
    apply_temperature(&mut scores, params.temperature)?;

    if params.recent_window > 0 {
        let recent = &history[history.len().saturating_sub(params.recent_window)..];
        relieve_repetition(&mut scores, recent, params.repetition_penalty)?;
    }

    let mut candidates = accumulate_mass(&scores, params.top_p, params.top_k)?;

    if let Some((theory, context)) = constraints {
        candidates = apply_constraints(candidates, context, theory, rng)?;
    }

    let candidates = candidates.normalized()?;
    let probs = softmax(candidates.weights());
    let pos = draw_position(&probs, rng)?;
    Ok(candidates.ids()[pos])
}

/// One categorical draw over non-negative `weights` (not necessarily normalized).
/// Returns a position into `weights`.
fn draw_position(weights: &[f32], rng: &mut impl Rng) -> Result<usize> {
    let dist = WeightedIndex::new(weights).map_err(|err| {
        SamplingError::DegenerateDistribution(format!(
            "cannot draw from {} weights: {err}",
            weights.len()
        ))
    })?;
    Ok(dist.sample(rng))
}
