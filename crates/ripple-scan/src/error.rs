use std::fmt;

use ripple_kernel::KernelError;
use thiserror::Error;

/// Pipeline stage a device failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Auxiliary buffer and uniform setup.
    Buffer,
    /// WGSL generation and pipeline compilation.
    Compile,
    /// Kernel 0, the per-block scan.
    PerBlockScan,
    /// Kernel 1, the carry scan over per-block sums.
    CarryScan,
    /// Kernel 2, the per-block addition writing the output.
    BlockAdd,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer setup",
            Self::Compile => "kernel compilation",
            Self::PerBlockScan => "the per-block scan (kernel 0)",
            Self::CarryScan => "the carry scan (kernel 1)",
            Self::BlockAdd => "the block addition (kernel 2)",
        };
        f.write_str(name)
    }
}

/// Everything a scan can fail with. There is no local recovery: each of
/// these propagates to the caller, with dispatch-scoped resources released
/// on the way out.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The request was malformed before any device work started.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The multicore CPU path was requested but not compiled in.
    #[error("the multicore CPU scan is not compiled in (enable the `multicore` feature)")]
    UnsupportedMode,

    /// No adapter or device could be acquired.
    #[error("no usable device: {0}")]
    NoDevice(#[from] KernelError),

    /// A device operation failed, attributed to the stage that observed it.
    #[error("device failure during {stage}: {source}")]
    Device {
        stage: Stage,
        #[source]
        source: KernelError,
    },

    /// The element count (or a padded size derived from it) exceeds the
    /// 32-bit counter the kernels index with.
    #[error("{0} elements exceed the 32-bit element counter used by the kernels")]
    Overflow(usize),
}

impl ScanError {
    pub(crate) fn device(stage: Stage, source: KernelError) -> Self {
        Self::Device { stage, source }
    }
}
