//! Stemtrack Core - synchronized stem playback and multi-device recording

pub mod capture;
pub mod clock;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod stretch;
pub mod types;
pub mod wav;

pub use types::*;
