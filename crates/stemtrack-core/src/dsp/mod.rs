//! Offline signal processing applied to finished takes

pub mod bleed;

pub use bleed::remove_bleed;
