pub mod analyzer;
pub mod bluetooth;
pub mod capture;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod output;
pub mod resampler;
