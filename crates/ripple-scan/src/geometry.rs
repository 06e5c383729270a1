//! Work-group geometry planning.
//!
//! Callers never see padding: the planner picks the per-block size B from
//! the wavefront width, rounds the element count up to a whole number of
//! 2B-element tiles, and derives the block count the kernels dispatch
//! with. All sizes are kept within the 32-bit counters the kernels use.

use ripple_kernel::GpuContext;

use crate::error::ScanError;

/// Wavefronts per work-group on real accelerators (the classic choice).
const KAPPA: u32 = 4;

/// Upper bound on the serial chunk each carry-scan thread absorbs before
/// the planner grows the block size instead.
pub(crate) const MAX_WORK_PER_THREAD: u32 = 64;

/// Shape of one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Live element count.
    pub n: u32,
    /// `n` rounded up to a multiple of `2 * block_size`.
    pub padded_n: u32,
    /// Threads per work-group. Each thread owns two elements, so one
    /// work-group covers a `2 * block_size` tile.
    pub block_size: u32,
    /// Work-groups in kernels 0 and 2: `padded_n / (2 * block_size)`.
    pub num_blocks: u32,
    /// Wavefront width the block size was derived from.
    pub wavefront: u32,
}

impl Geometry {
    /// Elements covered by one work-group.
    pub fn tile(&self) -> u32 {
        2 * self.block_size
    }

    /// Serial chunk length for each carry-scan thread.
    pub fn work_per_thread(&self) -> u32 {
        self.num_blocks.div_ceil(self.block_size).max(1)
    }
}

/// The device facts the planner consumes, split out from [`GpuContext`] so
/// planning stays testable without an adapter.
#[derive(Clone, Copy, Debug)]
pub struct DeviceProfile {
    /// Native SIMD width.
    pub wavefront: u32,
    /// Maximum threads per work-group.
    pub max_workgroup_size: u32,
    /// Workgroup-memory budget in bytes.
    pub max_workgroup_storage: u32,
    /// CPU adapters get single-wavefront work-groups.
    pub cpu_like: bool,
}

impl DeviceProfile {
    pub fn from_context(ctx: &GpuContext) -> Self {
        let limits = ctx.limits();
        Self {
            wavefront: ctx.wavefront_size(),
            max_workgroup_size: limits
                .max_compute_invocations_per_workgroup
                .min(limits.max_compute_workgroup_size_x),
            max_workgroup_storage: limits.max_compute_workgroup_storage_size,
            cpu_like: ctx.is_cpu_like(),
        }
    }
}

fn floor_pow2(x: u32) -> u32 {
    debug_assert!(x > 0);
    1u32 << (31 - x.leading_zeros())
}

/// Plan the dispatch shape for `n` elements of `elem_size` bytes.
///
/// B starts at wavefront × κ (κ = 4, or 1 on CPU-like adapters), clamped
/// to the device's thread and workgroup-memory limits and floored to a
/// power of two for the tree scan. While the block count would overrun the
/// carry scan's per-thread budget and the device still allows it, B
/// doubles and the plan is retried.
pub fn plan(n: usize, profile: &DeviceProfile, elem_size: u32) -> Result<Geometry, ScanError> {
    let n = u32::try_from(n).map_err(|_| ScanError::Overflow(n))?;

    let kappa = if profile.cpu_like { 1 } else { KAPPA };
    let wavefront = profile.wavefront.max(1);

    // Kernel 0 holds a 2B-element tile in workgroup memory.
    let storage_cap = (profile.max_workgroup_storage / (2 * elem_size)).max(1);
    let cap = floor_pow2(profile.max_workgroup_size.max(1).min(storage_cap));

    let mut block_size = floor_pow2(wavefront.saturating_mul(kappa)).min(cap);
    loop {
        let geometry = shape(n, block_size, wavefront)?;
        if geometry.num_blocks <= block_size.saturating_mul(MAX_WORK_PER_THREAD)
            || block_size * 2 > cap
        {
            return Ok(geometry);
        }
        block_size *= 2;
    }
}

/// Plan with a caller-chosen block size (must be a power of two).
pub fn plan_with_block_size(
    n: usize,
    block_size: u32,
    wavefront: u32,
) -> Result<Geometry, ScanError> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(ScanError::InvalidArgument(
            "block size must be a nonzero power of two",
        ));
    }
    let n = u32::try_from(n).map_err(|_| ScanError::Overflow(n))?;
    shape(n, block_size, wavefront)
}

fn shape(n: u32, block_size: u32, wavefront: u32) -> Result<Geometry, ScanError> {
    let tile = u64::from(block_size) * 2;
    let padded = u64::from(n).div_ceil(tile).max(1) * tile;
    let padded_n =
        u32::try_from(padded).map_err(|_| ScanError::Overflow(padded as usize))?;
    Ok(Geometry {
        n,
        padded_n,
        block_size,
        num_blocks: padded_n / (2 * block_size),
        wavefront,
    })
}
