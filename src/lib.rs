//! ZipVoice zero-shot TTS acoustic model in pure Rust.
//!
//! A candle-based implementation of the hierarchical Zipformer encoder used as
//! the flow-matching acoustic backbone, plus the fbank feature extraction used
//! to prepare its training corpora. Loads original safetensors weights
//! directly through `VarBuilder` — no ONNX conversion needed.
//!
//! ## Architecture
//!
//! ```text
//! fbank features (B, T, in_dim)
//!         ↓ in_proj
//! ┌─ stack 1 (full rate) ──────────────┐
//! │  stack 2 (1/2 rate)                │   U-Net downsampling schedule,
//! │    stack 3 (1/4 rate)              │   e.g. (1, 2, 4, 2, 1); each stack
//! │  stack 4 (1/2 rate)                │   conditioned on the diffusion
//! └─ stack 5 (full rate) ──────────────┘   timestep (+ optional guidance)
//!         ↓ out_proj
//! encoded features (B, T, out_dim)
//! ```
//!
//! ## Modules
//!
//! - [`audio`] — log-mel fbank extraction (STFT + filterbank), WAV I/O
//! - [`model`] — the Zipformer encoder stack and its submodules
//! - [`config`] — model hyperparameters, validated at construction

pub mod audio;
pub mod config;
pub mod model;

mod error;

pub use config::ZipformerConfig;
pub use error::{Error, Result};
pub use model::zipformer::{TrainingContext, TtsZipformer};
