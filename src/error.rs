//! Error types shared by the pipeline stages.

use thiserror::Error;

/// Errors raised by the per-frame pipeline.
///
/// Only [`PipelineError::MalformedKeyColor`] is meant to abort anything: it
/// signals a configuration bug. Every other variant is a per-frame condition
/// that the driving loop answers by skipping the frame.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The video stream ended or went inactive. The caller owns reconnection.
    #[error("Video source is inactive or has ended")]
    SourceUnavailable,

    /// The source is alive but has not delivered its first frame yet.
    #[error("No frame has been delivered yet")]
    FrameNotReady,

    /// A stage was asked to render before `initialize` was called.
    #[error("Rendering backend is not initialized")]
    UninitializedBackend,

    /// A key color string that is not `#RRGGBB`.
    #[error("Malformed key color {value:?}: expected #RRGGBB")]
    MalformedKeyColor { value: String },

    /// Crop offsets that leave no pixels of the source.
    #[error("Crop {left}+{right} x {top}+{bottom} exceeds source {width}x{height}")]
    DegenerateCrop {
        left: u32,
        right: u32,
        top: u32,
        bottom: u32,
        width: u32,
        height: u32,
    },

    /// GPU or IO failure inside a backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
