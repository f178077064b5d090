//! Kernel error types
//!
//! Only configuration-time mistakes are errors. Per-particle phase failures
//! and spatial index capacity drops are counted and logged instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module `{module}` has no parameter `{param}`")]
    UnknownParam { module: String, param: String },

    #[error("parameter `{module}.{param}` has a different kind (scalar vs array)")]
    ParamKind { module: String, param: String },

    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    #[error("shader generation failed: {0}")]
    Shader(String),

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gpu error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
