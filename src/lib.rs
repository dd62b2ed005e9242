//! Chromacam: real-time chroma-key and filter-chain webcam compositor
//!
//! Captures video from a webcam, keys out a background color, runs the result
//! through a chain of image filters, and displays it.

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod filters;
pub mod frame;
pub mod keying;
pub mod pipeline;
pub mod present;
pub mod segmentation;
pub mod session;
pub mod shader;
pub mod slot;
pub mod source;
pub mod utils;
