//! Two-pass continuous speech recognition decoder core.
//!
//! This library turns a stream of 16-bit PCM samples into ranked word
//! sequences under externally supplied statistical models:
//!
//! - an MFCC front end with delta/acceleration and real-time MAP-CMN,
//! - Gaussian-mixture acoustic scoring with pruning and per-frame caches,
//! - a frame-synchronous tree-lexicon Viterbi beam search (pass 1)
//!   producing a word trellis,
//! - a backward best-first stack decoder (pass 2) rescanning the trellis
//!   under the full language model with exact cross-word triphone scores.
//!
//! The [`engine::Engine`] value owns all state and drives the passes;
//! audio reaches it through the [`audio::AudioSource`] trait, so capture
//! backends stay outside the crate.

pub mod am;
pub mod audio;
pub mod config;
pub mod dict;
pub mod engine;
pub mod error;
pub mod hmm;
pub mod lexicon;
pub mod lm;
pub mod mfcc;
pub mod pass1;
pub mod pass2;
pub mod result;
pub mod trellis;

// Re-export key types for convenience
pub use config::DecoderConfig;
pub use engine::{Engine, EngineCallbacks, EngineControl};
pub use error::{DecodeError, Result};
pub use result::{RecognitionResult, UtteranceStatus};
