//! Write-buffering cache simulator.
//!
//! Stores are held per buffering unit until a fence writes back the ones a
//! flush covered. The backing [`PmImage`] is the durable state a crash
//! would leave behind.

pub mod image;
pub mod sim;

pub use image::PmImage;
pub use sim::{BufferedStore, CacheSim, Granularity, UnitKey};
