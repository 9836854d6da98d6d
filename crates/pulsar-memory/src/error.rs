//! Memory error types.

use pulsar_gpu::GpuError;
use thiserror::Error;

/// Allocation errors.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Request is larger than one memory page and can never be served.
    #[error("Allocation of {requested} bytes exceeds the page size of {page_size} bytes")]
    AllocationTooLarge { requested: u64, page_size: u64 },

    /// No compatible memory type could serve the request.
    #[error("Out of device memory for an allocation of {size} bytes")]
    AllocationExhausted { size: u64 },

    /// Request that no allocator accepts (zero size, unknown memory type).
    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    /// Driver error.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
}

impl MemoryError {
    /// Returns `true` for every flavor of running out of memory.
    ///
    /// Oversized requests count as exhaustion; so does a device that refuses to
    /// hand out another page.
    pub fn is_exhausted(&self) -> bool {
        match self {
            Self::AllocationTooLarge { .. } | Self::AllocationExhausted { .. } => true,
            Self::Gpu(e) => e.is_out_of_memory(),
            Self::InvalidRequest(_) => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, MemoryError>;
