#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! Constrained token sampling for autoregressive music generation.
//!
//! The [`inference`] module turns score vectors into tokens (top-k, nucleus, repetition-aware
//! and constraint-aware sampling) and drives a generation loop; [`tensor`] holds the batch
//! padding, accuracy and mel helpers that sit around it.

pub mod error;
pub mod inference;
pub mod tensor;

pub use error::{Result, SamplingError};
