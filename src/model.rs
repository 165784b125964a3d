//! Model components for ZipVoice.
//!
//! ## Components
//!
//! - [`zipformer`] — the hierarchical Zipformer encoder: multi-resolution
//!   stacks with relative-position attention, timestep conditioning, and
//!   learnable bypass gates

pub mod zipformer;
