//! Musical constraints on the candidate set.
//!
//! A harmony context (current chord) and a rhythm context (current time signature) each map
//! to a set of allowed token ids through an [`AllowedSetProvider`]. Candidates outside the set
//! are dropped; if none survive, a uniformly random allowed token replaces the whole set.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplingError};
use crate::inference::TokenId;
use crate::inference::sampling::CandidateSet;

/// Lookup from a context identifier (chord symbol, time signature) to allowed token ids.
///
/// Implementations should return a non-empty default for unknown identifiers.
pub trait AllowedSetProvider {
    fn allowed(&self, context: &str) -> Cow<'_, [TokenId]>;
}

/// Table-backed provider, typically loaded from JSON:
///
/// ```json
/// { "entries": { "4/4": [1, 2, 4], "3/4": [1, 3] }, "default": [1, 2] }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableProvider {
    #[serde(default)]
    pub entries: HashMap<String, Vec<TokenId>>,
    #[serde(default)]
    pub default: Vec<TokenId>,
}

impl TableProvider {
    #[must_use]
    pub fn new(default: Vec<TokenId>) -> Self {
        Self {
            entries: HashMap::new(),
            default,
        }
    }

    #[must_use]
    pub fn with_entry(mut self, context: impl Into<String>, ids: Vec<TokenId>) -> Self {
        self.entries.insert(context.into(), ids);
        self
    }

    /// Load a table from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl AllowedSetProvider for TableProvider {
    fn allowed(&self, context: &str) -> Cow<'_, [TokenId]> {
        Cow::Borrowed(self.entries.get(context).unwrap_or(&self.default))
    }
}

/// Rule-based chord provider.
///
/// Note tokens are laid out as `note_offset + midi_pitch`. For a chord symbol such as `C`,
/// `F#m`, `Bbdim`, `Eaug`, `G7`, `Am7`, `Cmaj7`, `Dsus4` or `C/E` every pitch in
/// `low_note..=high_note` whose pitch class is a chord tone is allowed. Symbols that do not
/// parse allow the whole range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TriadProvider {
    pub note_offset: TokenId,
    pub low_note: u8,
    pub high_note: u8,
}

impl Default for TriadProvider {
    fn default() -> Self {
        Self {
            note_offset: 0,
            low_note: 21,
            high_note: 108,
        }
    }
}

impl TriadProvider {
    /// Pitch classes of a chord symbol, or `None` if it does not parse.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn chord_tones(symbol: &str) -> Option<Vec<u8>> {
        let symbol = symbol.split('/').next()?.trim();
        let mut chars = symbol.chars();
        let root: i8 = match chars.next()? {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };

        let rest = chars.as_str();
        let (root, quality) = if let Some(q) = rest.strip_prefix('#') {
            (root + 1, q)
        } else if let Some(q) = rest.strip_prefix('b') {
            (root - 1, q)
        } else {
            (root, rest)
        };

        let intervals: &[i8] = match quality {
            "" | "maj" | "M" => &[0, 4, 7],
            "m" | "min" => &[0, 3, 7],
            "dim" | "o" => &[0, 3, 6],
            "aug" | "+" => &[0, 4, 8],
            "7" => &[0, 4, 7, 10],
            "maj7" | "M7" => &[0, 4, 7, 11],
            "m7" | "min7" => &[0, 3, 7, 10],
            "sus2" => &[0, 2, 7],
            "sus4" => &[0, 5, 7],
            _ => return None,
        };

        Some(
            intervals
                .iter()
                .map(|i| (root + i).rem_euclid(12) as u8)
                .collect(),
        )
    }
}

impl AllowedSetProvider for TriadProvider {
    fn allowed(&self, context: &str) -> Cow<'_, [TokenId]> {
        let tones = Self::chord_tones(context);
        let ids = (self.low_note..=self.high_note)
            .filter(|pitch| tones.as_ref().is_none_or(|t| t.contains(&(pitch % 12))))
            .filter_map(|pitch| self.note_offset.checked_add(TokenId::from(pitch)))
            .collect::<Vec<_>>();
        Cow::Owned(ids)
    }
}

/// Musical context for one generation step. Absent fields apply no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintContext {
    pub current_chord: Option<String>,
    pub current_time_signature: Option<String>,
}

impl ConstraintContext {
    #[must_use]
    pub fn with_chord(mut self, chord: impl Into<String>) -> Self {
        self.current_chord = Some(chord.into());
        self
    }

    #[must_use]
    pub fn with_time_signature(mut self, time_signature: impl Into<String>) -> Self {
        self.current_time_signature = Some(time_signature.into());
        self
    }

    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.current_chord.is_none() && self.current_time_signature.is_none()
    }
}

/// Harmony and rhythm lookups used by the constraint filter.
pub struct MusicTheory {
    pub notes: Box<dyn AllowedSetProvider>,
    pub durations: Box<dyn AllowedSetProvider>,
}

impl MusicTheory {
    pub fn new(
        notes: impl AllowedSetProvider + 'static,
        durations: impl AllowedSetProvider + 'static,
    ) -> Self {
        Self {
            notes: Box::new(notes),
            durations: Box::new(durations),
        }
    }
}

/// Restrict `candidates` by harmony, then by rhythm.
///
/// # Errors
/// `EmptyConstraintSet` when a lookup yields no allowed tokens.
pub fn apply_constraints(
    candidates: CandidateSet,
    context: &ConstraintContext,
    theory: &MusicTheory,
    rng: &mut impl Rng,
) -> Result<CandidateSet> {
    let mut candidates = candidates;
    if let Some(chord) = &context.current_chord {
        candidates = restrict(candidates, chord, theory.notes.as_ref(), "harmony", rng)?;
    }
    if let Some(time_signature) = &context.current_time_signature {
        candidates = restrict(
            candidates,
            time_signature,
            theory.durations.as_ref(),
            "rhythm",
            rng,
        )?;
    }
    Ok(candidates)
}

fn restrict(
    candidates: CandidateSet,
    key: &str,
    provider: &dyn AllowedSetProvider,
    kind: &'static str,
    rng: &mut impl Rng,
) -> Result<CandidateSet> {
    let allowed = provider.allowed(key);
    if allowed.is_empty() {
        return Err(SamplingError::EmptyConstraintSet(key.to_string()));
    }

    if let Some(kept) = candidates.intersect(&allowed) {
        return Ok(kept);
    }

    let token = allowed[rng.gen_range(0..allowed.len())];
    tracing::debug!(
        kind,
        context = key,
        token,
        candidates = candidates.len(),
        "no candidate satisfies constraint, substituting allowed token"
    );
    Ok(CandidateSet::single(token))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn theory() -> MusicTheory {
        MusicTheory::new(
            TableProvider::new(vec![0, 1, 2, 3])
                .with_entry("C", vec![10, 14, 17])
                .with_entry("Am", vec![9, 12, 16]),
            TableProvider::new(vec![100])
                .with_entry("4/4", vec![10, 12, 100])
                .with_entry("empty", vec![]),
        )
    }

    #[test]
    fn test_table_provider_falls_back_to_default() {
        let table = TableProvider::new(vec![1, 2]).with_entry("3/4", vec![3]);
        assert_eq!(table.allowed("3/4").as_ref(), &[3]);
        assert_eq!(table.allowed("7/8").as_ref(), &[1, 2]);
    }

    #[test]
    fn test_table_provider_from_json() {
        let table: TableProvider =
            serde_json::from_str(r#"{"entries": {"G": [7, 11, 14]}, "default": [0]}"#).unwrap();
        assert_eq!(table.allowed("G").as_ref(), &[7, 11, 14]);
        assert_eq!(table.allowed("D").as_ref(), &[0]);
    }

    #[test]
    fn test_chord_tones() {
        assert_eq!(TriadProvider::chord_tones("C"), Some(vec![0, 4, 7]));
        assert_eq!(TriadProvider::chord_tones("Am"), Some(vec![9, 0, 4]));
        assert_eq!(TriadProvider::chord_tones("F#dim"), Some(vec![6, 9, 0]));
        assert_eq!(TriadProvider::chord_tones("Bb7"), Some(vec![10, 2, 5, 8]));
        assert_eq!(TriadProvider::chord_tones("Cb"), Some(vec![11, 3, 6]));
        assert_eq!(TriadProvider::chord_tones("C/E"), Some(vec![0, 4, 7]));
        assert_eq!(TriadProvider::chord_tones("H"), None);
        assert_eq!(TriadProvider::chord_tones("Cxyz"), None);
    }

    #[test]
    fn test_triad_provider_range() {
        let provider = TriadProvider {
            note_offset: 100,
            low_note: 60,
            high_note: 72,
        };
        // C4..C5 chord tones of C major: 60, 64, 67, 72
        assert_eq!(provider.allowed("C").as_ref(), &[160, 164, 167, 172]);
        // Unknown symbol allows the whole range.
        assert_eq!(provider.allowed("??").len(), 13);
    }

    #[test]
    fn test_triad_provider_drops_ids_past_token_range() {
        let provider = TriadProvider {
            note_offset: TokenId::MAX - 64,
            low_note: 60,
            high_note: 72,
        };
        // Only C4 (60) and E4 (64) fit below TokenId::MAX.
        assert_eq!(
            provider.allowed("C").as_ref(),
            &[TokenId::MAX - 4, TokenId::MAX]
        );
    }

    #[test]
    fn test_no_context_passes_through() {
        let set = CandidateSet::new(vec![5, 6], vec![0.6, 0.4]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let out =
            apply_constraints(set.clone(), &ConstraintContext::default(), &theory(), &mut rng)
                .unwrap();
        assert_eq!(out, set);
    }

    #[test]
    fn test_harmony_restricts_to_intersection() {
        let set = CandidateSet::new(vec![14, 3, 10], vec![0.5, 0.3, 0.2]).unwrap();
        let ctx = ConstraintContext::default().with_chord("C");
        let mut rng = StdRng::seed_from_u64(0);
        let out = apply_constraints(set, &ctx, &theory(), &mut rng).unwrap();
        assert_eq!(out.ids(), &[14, 10]);
        assert_eq!(out.weights(), &[0.5, 0.2]);
    }

    #[test]
    fn test_empty_intersection_substitutes_allowed_token() {
        let set = CandidateSet::new(vec![50, 51], vec![0.5, 0.5]).unwrap();
        let ctx = ConstraintContext::default().with_chord("Am");
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = apply_constraints(set.clone(), &ctx, &theory(), &mut rng).unwrap();
            assert_eq!(out.len(), 1);
            assert!([9, 12, 16].contains(&out.ids()[0]));
        }
    }

    #[test]
    fn test_harmony_then_rhythm() {
        let set = CandidateSet::new(vec![14, 10, 17], vec![0.5, 0.3, 0.2]).unwrap();
        let ctx = ConstraintContext::default()
            .with_chord("C")
            .with_time_signature("4/4");
        let mut rng = StdRng::seed_from_u64(0);
        let out = apply_constraints(set, &ctx, &theory(), &mut rng).unwrap();
        assert_eq!(out.ids(), &[10]);
    }

    #[test]
    fn test_rhythm_only_empty_intersection_substitutes() {
        let set = CandidateSet::new(vec![1, 2], vec![0.7, 0.3]).unwrap();
        let ctx = ConstraintContext::default().with_time_signature("4/4");
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = apply_constraints(set.clone(), &ctx, &theory(), &mut rng).unwrap();
            assert_eq!(out.len(), 1);
            assert!([10, 12, 100].contains(&out.ids()[0]));
            assert_eq!(out.weights(), &[1.0]);
        }
    }

    #[test]
    fn test_unknown_time_signature_uses_default_table() {
        let set = CandidateSet::new(vec![100, 3], vec![0.4, 0.6]).unwrap();
        let ctx = ConstraintContext::default().with_time_signature("5/8");
        let mut rng = StdRng::seed_from_u64(0);
        let out = apply_constraints(set, &ctx, &theory(), &mut rng).unwrap();
        assert_eq!(out.ids(), &[100]);
    }

    #[test]
    fn test_empty_allowed_set_is_fatal() {
        let set = CandidateSet::single(1);
        let ctx = ConstraintContext::default().with_time_signature("empty");
        let mut rng = StdRng::seed_from_u64(0);
        let err = apply_constraints(set, &ctx, &theory(), &mut rng).unwrap_err();
        assert!(matches!(err, SamplingError::EmptyConstraintSet(ref k) if k == "empty"));
    }
}
