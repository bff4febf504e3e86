pub mod agc;
pub mod chain;
pub mod fft;
pub mod filters;
pub mod virtualizer;
