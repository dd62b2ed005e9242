//! Backend selection and the per-stage initialization lifecycle.

use crate::shader::GpuContext;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which implementation renders the keying and filter stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// wgpu render passes (default)
    #[default]
    Gpu,
    /// Per-pixel CPU reference implementation
    Cpu,
}

/// A backend ready to hand to stage `initialize` calls.
#[derive(Clone)]
pub enum Backend {
    Cpu,
    Gpu(Arc<GpuContext>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Cpu => BackendKind::Cpu,
            Backend::Gpu(_) => BackendKind::Gpu,
        }
    }
}

/// Lifecycle of a stage that owns rendering resources.
///
/// Stages start `Uninitialized` and move to `Ready` once their one-time setup
/// (shader modules, buffers, layouts) succeeds. They stay `Ready` for the
/// session; size-dependent resources are rebuilt inside the ready state.
pub enum StageState<T> {
    Uninitialized,
    Ready(T),
}

impl<T> StageState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, StageState::Ready(_))
    }

    pub fn ready_mut(&mut self) -> Option<&mut T> {
        match self {
            StageState::Ready(inner) => Some(inner),
            StageState::Uninitialized => None,
        }
    }
}

impl<T> Default for StageState<T> {
    fn default() -> Self {
        StageState::Uninitialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_transitions() {
        let mut state: StageState<u32> = StageState::default();
        assert!(!state.is_ready());
        assert!(state.ready_mut().is_none());

        state = StageState::Ready(5);
        assert!(state.is_ready());
        *state.ready_mut().unwrap() += 1;
        assert!(matches!(state, StageState::Ready(6)));
    }

    #[test]
    fn test_backend_kind() {
        assert_eq!(Backend::Cpu.kind(), BackendKind::Cpu);
        assert_eq!(BackendKind::default(), BackendKind::Gpu);
    }
}
