//! Audio utilities for corpus preparation.
//!
//! Log-mel fbank extraction at 24kHz mono, plus WAV I/O and resampling.

pub mod fbank;

mod wav;

pub use fbank::{Fbank, FbankConfig};
pub use wav::{read_wav, resample, to_mono, write_wav};
