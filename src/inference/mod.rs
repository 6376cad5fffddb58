pub mod constraints;
pub mod generate;
pub mod sampling;
pub mod seed;
pub mod transform;

/// Index into the vocabulary.
pub type TokenId = u32;

// Re-exports for convenience
pub use constraints::{
    AllowedSetProvider, ConstraintContext, MusicTheory, TableProvider, TriadProvider,
    apply_constraints,
};
pub use generate::{
    Generation, GenerationConfig, ReplaySource, SamplingStrategy, ScoreSource, generate,
};
pub use sampling::{
    CandidateSet, ConstrainedTopPParams, RasDraw, RepetitionAwareParams, Scores,
    accumulate_mass, constrained_top_p_sampling, nucleus_sampling, nucleus_select,
    random_sampling, ras_sampling, sample_candidates, top_k_mask, top_k_sampling,
};
pub use seed::{seed_everything, seeded_rng};
pub use transform::{apply_temperature, normalize, relieve_repetition, softmax};
