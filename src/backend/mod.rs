//! 推理后端抽象 (Inference engine abstraction)
//!
//! One synchronous contract, two execution strategies: plain CPU and the
//! hardware accelerator (CUDA / TensorRT execution provider). The accelerator
//! session owns the device handle exclusively; selection happens once at
//! startup and is re-evaluated only on a fatal accelerator error.

pub mod onnx;

pub use onnx::OnnxDetector;

use std::fmt;

use tracing::warn;

use crate::error::InferenceError;
use crate::preprocess::TensorInput;
use crate::Detection;

/// Synchronous detect contract shared by all backends. Exceeding the latency
/// budget yields `InferenceError::Timeout`; the caller drops the frame and
/// never retries it.
pub trait InferenceBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Model input geometry (width, height); drives preprocessing.
    fn input_size(&self) -> (u32, u32);

    /// Run the model, returning candidates ordered by descending confidence,
    /// in source-frame pixel coordinates.
    fn detect(&mut self, input: &TensorInput) -> Result<Vec<Detection>, InferenceError>;
}

/// Concrete execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Cuda(i32),
    TensorRt(i32),
}

impl BackendKind {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, BackendKind::Cpu)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Cuda(id) => write!(f, "cuda:{id}"),
            BackendKind::TensorRt(id) => write!(f, "tensorrt:{id}"),
        }
    }
}

/// Requested strategy from configuration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    clap::ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Accelerator if usable, otherwise CPU (pipeline reports Degraded).
    #[default]
    Auto,
    Cpu,
    Cuda,
    Tensorrt,
}

/// Builds a replacement CPU backend when the accelerator dies at runtime.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn InferenceBackend>, InferenceError> + Send>;

/// Active backend plus the standby path back to CPU.
pub struct BackendSet {
    active: Box<dyn InferenceBackend>,
    fallback: Option<BackendFactory>,
    degraded: bool,
}

impl BackendSet {
    pub fn new(active: Box<dyn InferenceBackend>, fallback: Option<BackendFactory>) -> Self {
        Self {
            active,
            fallback,
            degraded: false,
        }
    }

    /// Decide the startup backend. An accelerator that fails to initialise
    /// falls back to CPU and marks the set degraded instead of aborting.
    pub fn resolve(
        primary: Result<Box<dyn InferenceBackend>, InferenceError>,
        fallback: Option<BackendFactory>,
    ) -> Result<Self, InferenceError> {
        match primary {
            Ok(active) => Ok(Self {
                active,
                fallback,
                degraded: false,
            }),
            Err(InferenceError::AcceleratorInit(reason)) => {
                let factory =
                    fallback.ok_or_else(|| InferenceError::AcceleratorInit(reason.clone()))?;
                warn!("accelerator init failed ({reason}); falling back to CPU backend");
                let active = factory()?;
                Ok(Self {
                    active,
                    fallback: None,
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.active.kind()
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.active.input_size()
    }

    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn detect(&mut self, input: &TensorInput) -> Result<Vec<Detection>, InferenceError> {
        self.active.detect(input)
    }

    /// Swap in the standby CPU backend after a fatal accelerator error.
    /// Errors when no fallback path remains.
    pub fn downgrade(&mut self) -> Result<BackendKind, InferenceError> {
        let factory = self
            .fallback
            .take()
            .ok_or_else(|| InferenceError::Engine("no fallback backend left".to_string()))?;
        self.active = factory()?;
        self.degraded = true;
        Ok(self.active.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(BackendKind);

    impl InferenceBackend for Stub {
        fn kind(&self) -> BackendKind {
            self.0
        }

        fn input_size(&self) -> (u32, u32) {
            (320, 320)
        }

        fn detect(&mut self, _input: &TensorInput) -> Result<Vec<Detection>, InferenceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_resolve_keeps_working_accelerator() {
        let set = BackendSet::resolve(
            Ok(Box::new(Stub(BackendKind::Cuda(0)))),
            Some(Box::new(|| Ok(Box::new(Stub(BackendKind::Cpu))))),
        )
        .unwrap();
        assert_eq!(set.kind(), BackendKind::Cuda(0));
        assert!(!set.degraded());
    }

    #[test]
    fn test_resolve_falls_back_on_init_error() {
        let set = BackendSet::resolve(
            Err(InferenceError::AcceleratorInit("no device".to_string())),
            Some(Box::new(|| Ok(Box::new(Stub(BackendKind::Cpu))))),
        )
        .unwrap();
        assert_eq!(set.kind(), BackendKind::Cpu);
        assert!(set.degraded());
    }

    #[test]
    fn test_resolve_errors_without_fallback() {
        let result = BackendSet::resolve(
            Err(InferenceError::AcceleratorInit("no device".to_string())),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_downgrade_once() {
        let mut set = BackendSet::new(
            Box::new(Stub(BackendKind::Cuda(0))),
            Some(Box::new(|| Ok(Box::new(Stub(BackendKind::Cpu))))),
        );
        assert_eq!(set.downgrade().unwrap(), BackendKind::Cpu);
        assert!(set.degraded());
        assert!(set.downgrade().is_err());
    }
}
