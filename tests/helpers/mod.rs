//! Shared infrastructure for the integration suites
//!
//! WAV fixture generation plus an engine harness whose sink hands the
//! render feed straight to the test, so output can be pulled and analyzed
//! block by block without a real audio device.

#![allow(dead_code)]

pub mod audio_generator;
pub mod engine;

pub use audio_generator::generate_sine_wav;
pub use engine::{audible_span, is_silent, rms, EngineHarness, BLOCK_FRAMES};
