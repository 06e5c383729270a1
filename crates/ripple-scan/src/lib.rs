//! GPU prefix scans (inclusive and exclusive) over wgpu compute kernels.
//!
//! The engine runs the classic three-pass device scan: each work-group
//! scans a 2B-element tile of the input in workgroup memory, a single
//! work-group turns the per-block sums into their exclusive scan, and a
//! final pass folds the scanned carries (plus, for exclusive scans, the
//! init value) into the output. Kernels are WGSL generated per element
//! type and combiner and cached in a pipeline registry.
//!
//! ```no_run
//! use ripple_scan::{ScanEngine, Sum};
//!
//! # fn main() -> Result<(), ripple_scan::ScanError> {
//! let engine = ScanEngine::new()?;
//! let input = vec![1u32, 2, 3, 4, 5];
//! let mut output = vec![0u32; input.len()];
//!
//! engine.inclusive_scan_slice(&input, &mut output, Sum)?;
//! assert_eq!(output, [1, 3, 6, 10, 15]);
//!
//! engine.exclusive_scan_slice(&input, &mut output, 10, Sum)?;
//! assert_eq!(output, [10, 11, 13, 16, 20]);
//! # Ok(())
//! # }
//! ```
//!
//! Inputs may live in host memory, in a device buffer, or come from a
//! producer iterator that is drained once. Outputs are host or device
//! memory; producer-only outputs are not expressible. A run-mode selector
//! can route scans to a sequential CPU path or, with the `multicore`
//! feature, a rayon-backed parallel CPU path.

mod combine;
mod dispatch;
mod error;
mod geometry;
#[cfg(feature = "multicore")]
mod multicore;
mod serial;
mod shaders;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

pub use ripple_kernel::{GpuBuffer, GpuContext, KernelError};

pub use crate::combine::{CappedSum, Combiner, Max, Min, Product, ScanElement, Sum};
pub use crate::error::{ScanError, Stage};
pub use crate::geometry::{DeviceProfile, Geometry};

/// Where a scan executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Resolve to the device path.
    #[default]
    Automatic,
    /// Sequential scan on the host.
    SerialCpu,
    /// Chunked parallel scan on the host (requires the `multicore`
    /// feature; otherwise requests fail with [`ScanError::UnsupportedMode`]).
    MultiCoreCpu,
    Device,
}

/// Observer for per-stage host-side timings of a device dispatch.
pub trait TraceSink: Send + Sync {
    fn stage(&self, stage: Stage, elapsed: Duration);
}

/// A typed sub-range of a device buffer.
#[derive(Clone, Copy)]
pub struct DeviceSlice<'a, T> {
    buffer: &'a GpuBuffer<T>,
    offset: usize,
    len: usize,
}

impl<'a, T: ScanElement> DeviceSlice<'a, T> {
    pub fn new(buffer: &'a GpuBuffer<T>, offset: usize, len: usize) -> Result<Self, ScanError> {
        if offset.checked_add(len).is_none_or(|end| end > buffer.len()) {
            return Err(ScanError::InvalidArgument("device slice out of bounds"));
        }
        Ok(Self {
            buffer,
            offset,
            len,
        })
    }

    pub fn full(buffer: &'a GpuBuffer<T>) -> Self {
        Self {
            buffer,
            offset: 0,
            len: buffer.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Scan input: host memory, a device buffer, or a producer drained once.
pub enum ScanInput<'a, T: ScanElement> {
    Host(&'a [T]),
    Device(DeviceSlice<'a, T>),
    Producer(Box<dyn Iterator<Item = T> + 'a>),
}

impl<'a, T: ScanElement> ScanInput<'a, T> {
    /// Wrap an iterator as a producer-only input.
    pub fn producer(iter: impl Iterator<Item = T> + 'a) -> Self {
        Self::Producer(Box::new(iter))
    }
}

/// Scan output. There is deliberately no producer variant: producer-only
/// outputs are rejected at construction time by not existing.
pub enum ScanOutput<'a, T: ScanElement> {
    Host(&'a mut [T]),
    Device(DeviceSlice<'a, T>),
}

#[derive(Clone, Copy)]
enum CpuPath {
    Serial,
    #[cfg(feature = "multicore")]
    Multicore,
}

/// The scan engine: a device context, the kernel registry, and the run
/// configuration. Cheap to share behind an `Arc`; dispatches serialize on
/// the device queue.
pub struct ScanEngine {
    ctx: Arc<GpuContext>,
    registry: dispatch::KernelRegistry,
    mode: RunMode,
    forced_block_size: Option<u32>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl ScanEngine {
    /// Acquire the default adapter and build an engine around it.
    pub fn new() -> Result<Self, ScanError> {
        Ok(Self::with_context(Arc::new(GpuContext::new()?)))
    }

    pub fn with_context(ctx: Arc<GpuContext>) -> Self {
        Self {
            ctx,
            registry: dispatch::KernelRegistry::default(),
            mode: RunMode::Automatic,
            forced_block_size: None,
            trace: None,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Route subsequent scans to a specific path.
    pub fn set_run_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    /// Override the planned work-group size with a power of two that must
    /// fit the device's limits. Mainly useful for exercising block
    /// boundaries; `None` restores planning.
    pub fn set_block_size(&mut self, block_size: Option<u32>) -> Result<(), ScanError> {
        if let Some(b) = block_size {
            if b == 0 || !b.is_power_of_two() {
                return Err(ScanError::InvalidArgument(
                    "block size must be a nonzero power of two",
                ));
            }
        }
        self.forced_block_size = block_size;
        Ok(())
    }

    pub fn set_trace_sink(&mut self, sink: Option<Arc<dyn TraceSink>>) {
        self.trace = sink;
    }

    /// `output[i] = a₀ ⊕ … ⊕ aᵢ` for every live element.
    pub fn inclusive_scan<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        combiner: F,
    ) -> Result<(), ScanError> {
        let identity = combiner.identity();
        self.scan(input, output, identity, combiner, true)
    }

    /// `output[0] = init; output[i] = init ⊕ a₀ ⊕ … ⊕ aᵢ₋₁`.
    pub fn exclusive_scan<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        init: T,
        combiner: F,
    ) -> Result<(), ScanError> {
        self.scan(input, output, init, combiner, false)
    }

    pub fn inclusive_scan_slice<T: ScanElement, F: Combiner<T>>(
        &self,
        input: &[T],
        output: &mut [T],
        combiner: F,
    ) -> Result<(), ScanError> {
        self.inclusive_scan(ScanInput::Host(input), ScanOutput::Host(output), combiner)
    }

    pub fn exclusive_scan_slice<T: ScanElement, F: Combiner<T>>(
        &self,
        input: &[T],
        output: &mut [T],
        init: T,
        combiner: F,
    ) -> Result<(), ScanError> {
        self.exclusive_scan(
            ScanInput::Host(input),
            ScanOutput::Host(output),
            init,
            combiner,
        )
    }

    fn scan<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        init: T,
        combiner: F,
        inclusive: bool,
    ) -> Result<(), ScanError> {
        match self.mode {
            RunMode::SerialCpu => {
                self.scan_host(input, output, init, &combiner, inclusive, CpuPath::Serial)
            }
            RunMode::MultiCoreCpu => {
                self.scan_multicore(input, output, init, &combiner, inclusive)
            }
            RunMode::Automatic | RunMode::Device => {
                self.scan_device(input, output, init, &combiner, inclusive)
            }
        }
    }

    #[cfg(feature = "multicore")]
    fn scan_multicore<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        init: T,
        combiner: &F,
        inclusive: bool,
    ) -> Result<(), ScanError> {
        self.scan_host(input, output, init, combiner, inclusive, CpuPath::Multicore)
    }

    #[cfg(not(feature = "multicore"))]
    #[allow(clippy::unused_self)]
    fn scan_multicore<T: ScanElement, F: Combiner<T>>(
        &self,
        _input: ScanInput<'_, T>,
        _output: ScanOutput<'_, T>,
        _init: T,
        _combiner: &F,
        _inclusive: bool,
    ) -> Result<(), ScanError> {
        Err(ScanError::UnsupportedMode)
    }

    /// CPU paths: device inputs are read back, device outputs written
    /// through. Producer inputs forward to the serial path regardless of
    /// the requested CPU flavor.
    fn scan_host<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        init: T,
        combiner: &F,
        inclusive: bool,
        path: CpuPath,
    ) -> Result<(), ScanError> {
        let (data, was_producer): (Cow<'_, [T]>, bool) = match input {
            ScanInput::Host(s) => (Cow::Borrowed(s), false),
            ScanInput::Device(d) => (
                Cow::Owned(
                    d.buffer
                        .read_range(&self.ctx, d.offset, d.len)
                        .map_err(|source| ScanError::device(Stage::Buffer, source))?,
                ),
                false,
            ),
            ScanInput::Producer(iter) => (Cow::Owned(iter.collect()), true),
        };
        let n = data.len();

        let path = if was_producer { CpuPath::Serial } else { path };
        let run = |inp: &[T], out: &mut [T]| match path {
            CpuPath::Serial => serial::serial_scan(inp, out, init, combiner, inclusive),
            #[cfg(feature = "multicore")]
            CpuPath::Multicore => multicore::multicore_scan(inp, out, init, combiner, inclusive),
        };

        match output {
            ScanOutput::Host(out) => {
                if out.len() < n {
                    return Err(ScanError::InvalidArgument("output shorter than input"));
                }
                run(&data, &mut out[..n]);
            }
            ScanOutput::Device(d) => {
                if d.len < n {
                    return Err(ScanError::InvalidArgument("output shorter than input"));
                }
                if n == 0 {
                    return Ok(());
                }
                let mut tmp = vec![T::ZERO; n];
                run(&data, &mut tmp);
                d.buffer.write(&self.ctx, d.offset, &tmp);
                self.ctx.queue().submit(std::iter::empty());
                self.ctx
                    .wait()
                    .map_err(|source| ScanError::device(Stage::Buffer, source))?;
            }
        }
        Ok(())
    }

    fn scan_device<T: ScanElement, F: Combiner<T>>(
        &self,
        input: ScanInput<'_, T>,
        output: ScanOutput<'_, T>,
        init: T,
        combiner: &F,
        inclusive: bool,
    ) -> Result<(), ScanError> {
        enum Source<'a, T: ScanElement> {
            Host(Cow<'a, [T]>),
            Device(&'a GpuBuffer<T>, usize, usize),
        }

        let source = match input {
            ScanInput::Host(s) => Source::Host(Cow::Borrowed(s)),
            ScanInput::Producer(iter) => Source::Host(Cow::Owned(iter.collect())),
            ScanInput::Device(d) => Source::Device(d.buffer, d.offset, d.len),
        };
        let n = match &source {
            Source::Host(s) => s.len(),
            Source::Device(_, _, len) => *len,
        };

        let out_len = match &output {
            ScanOutput::Host(s) => s.len(),
            ScanOutput::Device(d) => d.len,
        };
        if out_len < n {
            return Err(ScanError::InvalidArgument("output shorter than input"));
        }
        if n == 0 {
            return Ok(());
        }

        let geometry = match self.forced_block_size {
            Some(block_size) => geometry::plan_with_block_size(n, block_size, self.ctx.wavefront_size())?,
            None => geometry::plan(
                n,
                &DeviceProfile::from_context(&self.ctx),
                size_of::<T>() as u32,
            )?,
        };

        let staged;
        let (in_buf, in_offset) = match &source {
            Source::Host(s) => {
                staged = GpuBuffer::from_slice(&self.ctx, "ripple scan input", s);
                (&staged, 0u32)
            }
            Source::Device(buffer, offset, _) => (
                *buffer,
                u32::try_from(*offset).map_err(|_| ScanError::Overflow(*offset))?,
            ),
        };

        let out_staging;
        let (out_buf, out_offset) = match &output {
            ScanOutput::Host(_) => {
                out_staging = GpuBuffer::<T>::empty(&self.ctx, "ripple scan output", n);
                (&out_staging, 0u32)
            }
            ScanOutput::Device(d) => (
                d.buffer,
                u32::try_from(d.offset).map_err(|_| ScanError::Overflow(d.offset))?,
            ),
        };

        let kernels = self
            .registry
            .get_or_compile::<T, F>(&self.ctx, combiner, geometry.block_size)?;
        dispatch::scan_device(
            &self.ctx,
            &kernels,
            geometry,
            in_buf,
            in_offset,
            out_buf,
            out_offset,
            init,
            combiner,
            inclusive,
            self.trace.as_deref(),
        )?;

        if let ScanOutput::Host(out) = output {
            let result = out_buf
                .read_range(&self.ctx, 0, n)
                .map_err(|source| ScanError::device(Stage::Buffer, source))?;
            out[..n].copy_from_slice(&result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_approx_eq::assert_approx_eq;
    use rand::RngExt;

    use super::*;
    use crate::serial::serial_scan;

    fn engine() -> ScanEngine {
        ScanEngine::new().expect("no adapter available")
    }

    fn reference<T: ScanElement, F: Combiner<T>>(
        input: &[T],
        init: T,
        combiner: &F,
        inclusive: bool,
    ) -> Vec<T> {
        let mut out = vec![T::ZERO; input.len()];
        serial_scan(input, &mut out, init, combiner, inclusive);
        out
    }

    #[test]
    fn inclusive_add_small() {
        let engine = engine();
        let input = [1u32, 2, 3, 4, 5];
        let mut out = [0u32; 5];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        assert_eq!(out, [1, 3, 6, 10, 15]);
    }

    #[test]
    fn exclusive_add_zero_init() {
        let engine = engine();
        let input = [1u32, 2, 3, 4, 5];
        let mut out = [0u32; 5];
        engine
            .exclusive_scan_slice(&input, &mut out, 0, Sum)
            .expect("scan");
        assert_eq!(out, [0, 1, 3, 6, 10]);
    }

    #[test]
    fn exclusive_add_with_init() {
        let engine = engine();
        let input = [1u32, 2, 3, 4, 5];
        let mut out = [0u32; 5];
        engine
            .exclusive_scan_slice(&input, &mut out, 10, Sum)
            .expect("scan");
        assert_eq!(out, [10, 11, 13, 16, 20]);
    }

    #[test]
    fn exclusive_product() {
        let engine = engine();
        let input = [2u32, 2, 2, 2];
        let mut out = [0u32; 4];
        engine
            .exclusive_scan_slice(&input, &mut out, 1, Product)
            .expect("scan");
        assert_eq!(out, [1, 2, 4, 8]);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let engine = engine();
        let input: [u32; 0] = [];
        let mut out = [99u32; 3];
        engine
            .exclusive_scan_slice(&input, &mut out, 7, Sum)
            .expect("scan");
        assert_eq!(out, [99, 99, 99], "nothing may be written");
    }

    #[test]
    fn singleton() {
        let engine = engine();
        let mut out = [0i32; 1];
        engine
            .inclusive_scan_slice(&[42], &mut out, Sum)
            .expect("scan");
        assert_eq!(out, [42]);
        engine
            .exclusive_scan_slice(&[42], &mut out, 9, Sum)
            .expect("scan");
        assert_eq!(out, [9]);
    }

    #[test]
    fn twenty_elements_with_tiny_blocks() {
        let mut engine = engine();
        engine.set_block_size(Some(4)).expect("block size");
        let input = [
            5u32, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9, 3, 2, 3, 8, 4,
        ];
        let mut out = [0u32; 20];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        assert_eq!(out.to_vec(), reference(&input, 0, &Sum, true));
    }

    #[test]
    fn block_boundaries_match_reference() {
        let mut engine = engine();
        // tile = 8, so this sweeps 2B-1, 2B, 2B+1, 4B-1, 4B, 4B+1, ...
        engine.set_block_size(Some(4)).expect("block size");
        for n in 1..=70usize {
            let input: Vec<u32> = (0..n as u32).map(|i| (i * 7 + 3) % 101).collect();
            let mut out = vec![0u32; n];

            engine
                .inclusive_scan_slice(&input, &mut out, Sum)
                .expect("scan");
            assert_eq!(out, reference(&input, 0, &Sum, true), "inclusive n={n}");

            engine
                .exclusive_scan_slice(&input, &mut out, 11, Sum)
                .expect("scan");
            assert_eq!(out, reference(&input, 11, &Sum, false), "exclusive n={n}");
        }
    }

    #[test]
    fn default_geometry_bulk() {
        let engine = engine();
        let mut rng = rand::rng();
        let input: Vec<u32> = (0..10_000).map(|_| rng.random_range(0..1000)).collect();
        let mut out = vec![0u32; input.len()];

        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        assert_eq!(out, reference(&input, 0, &Sum, true));

        engine
            .exclusive_scan_slice(&input, &mut out, 0, Sum)
            .expect("scan");
        assert_eq!(out, reference(&input, 0, &Sum, false));
    }

    #[test]
    fn inclusive_equals_exclusive_shifted() {
        let engine = engine();
        let input: Vec<u32> = (0..777).map(|i| i % 13 + 1).collect();
        let mut incl = vec![0u32; input.len()];
        let mut excl = vec![0u32; input.len()];
        engine
            .inclusive_scan_slice(&input, &mut incl, Sum)
            .expect("scan");
        engine
            .exclusive_scan_slice(&input, &mut excl, 0, Sum)
            .expect("scan");
        for i in 0..input.len() {
            assert_eq!(incl[i], excl[i] + input[i], "mismatch at {i}");
        }
    }

    #[test]
    fn init_injection() {
        let engine = engine();
        let input: Vec<u32> = (0..300).map(|i| i % 29).collect();
        let mut with_init = vec![0u32; input.len()];
        let mut zero_init = vec![0u32; input.len()];
        engine
            .exclusive_scan_slice(&input, &mut with_init, 1000, Sum)
            .expect("scan");
        engine
            .exclusive_scan_slice(&input, &mut zero_init, 0, Sum)
            .expect("scan");
        assert_eq!(with_init[0], 1000);
        for i in 0..input.len() {
            assert_eq!(with_init[i], 1000 + zero_init[i], "mismatch at {i}");
        }
    }

    #[test]
    fn float_small() {
        let engine = engine();
        let input = [0.5f32, 0.25, 1.5, -0.75, 2.0];
        let mut out = [0.0f32; 5];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        let expected = reference(&input, 0.0, &Sum, true);
        for (a, e) in out.iter().zip(&expected) {
            assert_approx_eq!(a, e, 1e-6);
        }
    }

    // The scan reassociates additions, so for floats the result is only
    // close to the sequential one: the dependency chains are O(log n)
    // deep, giving O(log n · ε) relative error against a compensated
    // reference.
    #[test]
    fn large_float_scan_stays_within_tolerance() {
        let engine = engine();
        let mut rng = rand::rng();
        let input: Vec<f32> = (0..1_000_000).map(|_| rng.random::<f32>()).collect();
        let mut out = vec![0.0f32; input.len()];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");

        // Kahan-compensated running sums as the reference.
        let mut sum = 0.0f32;
        let mut c = 0.0f32;
        let mut max_rel = 0.0f32;
        for (i, &x) in input.iter().enumerate() {
            let y = x - c;
            let t = sum + y;
            c = (t - sum) - y;
            sum = t;
            let rel = (out[i] - sum).abs() / sum.abs().max(1e-3);
            max_rel = max_rel.max(rel);
        }
        assert!(max_rel < 1e-4, "max relative error {max_rel}");
    }

    #[test]
    fn min_max_combiners() {
        let engine = engine();
        let mut rng = rand::rng();
        let input: Vec<i32> = (0..5000).map(|_| rng.random_range(-1000..1000)).collect();
        let mut out = vec![0i32; input.len()];

        engine
            .inclusive_scan_slice(&input, &mut out, Min)
            .expect("scan");
        assert_eq!(out, reference(&input, 0, &Min, true));

        engine
            .inclusive_scan_slice(&input, &mut out, Max)
            .expect("scan");
        assert_eq!(out, reference(&input, 0, &Max, true));
    }

    #[test]
    fn capped_sum_on_device() {
        let engine = engine();
        let capped = CappedSum { cap: 12 };
        let input = [5u32; 10];
        let mut out = [0u32; 10];
        engine
            .inclusive_scan_slice(&input, &mut out, capped)
            .expect("scan");
        assert_eq!(out, [5, 10, 12, 12, 12, 12, 12, 12, 12, 12]);
        assert_eq!(out.to_vec(), reference(&input, 0, &capped, true));
    }

    #[test]
    fn device_slices_roundtrip() {
        let engine = engine();
        let ctx = engine.context();
        let backing: Vec<u32> = (0..100).collect();
        let input_buf = GpuBuffer::from_slice(ctx, "test input", &backing);
        let output_buf = GpuBuffer::<u32>::empty(ctx, "test output", 100);

        // scan elements 10..60 into the output buffer at offset 5
        let input = ScanInput::Device(DeviceSlice::new(&input_buf, 10, 50).expect("slice"));
        let output = ScanOutput::Device(DeviceSlice::new(&output_buf, 5, 50).expect("slice"));
        engine.inclusive_scan(input, output, Sum).expect("scan");

        let result = output_buf.read_range(ctx, 5, 50).expect("readback");
        assert_eq!(result, reference(&backing[10..60], 0, &Sum, true));
    }

    #[test]
    fn producer_input() {
        let engine = engine();
        let ctx = engine.context();
        let output_buf = GpuBuffer::<u32>::empty(ctx, "test output", 100);
        engine
            .inclusive_scan(
                ScanInput::producer(1u32..=100),
                ScanOutput::Device(DeviceSlice::full(&output_buf)),
                Sum,
            )
            .expect("scan");
        let result = output_buf.read(ctx).expect("readback");
        let expected: Vec<u32> = (1..=100u32)
            .scan(0, |acc, x| {
                *acc += x;
                Some(*acc)
            })
            .collect();
        assert_eq!(result, expected);
    }

    #[test]
    fn pipelines_are_cached_per_type_and_combiner() {
        let engine = engine();
        let input = [1u32, 2, 3];
        let mut out = [0u32; 3];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        engine
            .exclusive_scan_slice(&input, &mut out, 0, Sum)
            .expect("scan");
        assert_eq!(engine.registry.compiled_sets(), 1, "one set for (u32, Sum)");

        let finput = [1.0f32, 2.0, 3.0];
        let mut fout = [0.0f32; 3];
        engine
            .inclusive_scan_slice(&finput, &mut fout, Sum)
            .expect("scan");
        assert_eq!(engine.registry.compiled_sets(), 2, "new set for (f32, Sum)");
    }

    #[test]
    fn serial_mode_on_device_buffers() {
        let mut engine = engine();
        engine.set_run_mode(RunMode::SerialCpu);
        let ctx = engine.context();
        let input: Vec<i32> = (0..50).map(|i| i - 25).collect();
        let input_buf = GpuBuffer::from_slice(ctx, "test input", &input);
        let output_buf = GpuBuffer::<i32>::empty(ctx, "test output", 50);
        engine
            .exclusive_scan(
                ScanInput::Device(DeviceSlice::full(&input_buf)),
                ScanOutput::Device(DeviceSlice::full(&output_buf)),
                3,
                Sum,
            )
            .expect("scan");
        let result = output_buf.read(engine.context()).expect("readback");
        assert_eq!(result, reference(&input, 3, &Sum, false));
    }

    #[cfg(feature = "multicore")]
    #[test]
    fn multicore_mode_matches_reference() {
        let mut engine = engine();
        engine.set_run_mode(RunMode::MultiCoreCpu);
        let input: Vec<u32> = (0..200_000).map(|i| i % 31).collect();
        let mut out = vec![0u32; input.len()];
        engine
            .inclusive_scan_slice(&input, &mut out, Sum)
            .expect("scan");
        assert_eq!(out, reference(&input, 0, &Sum, true));
    }

    #[cfg(feature = "multicore")]
    #[test]
    fn multicore_producer_forwards_to_serial() {
        let mut engine = engine();
        engine.set_run_mode(RunMode::MultiCoreCpu);
        let mut out = vec![0u32; 10];
        engine
            .inclusive_scan(
                ScanInput::producer(1u32..=10),
                ScanOutput::Host(&mut out),
                Sum,
            )
            .expect("scan");
        assert_eq!(out, [1, 3, 6, 10, 15, 21, 28, 36, 45, 55]);
    }

    #[cfg(not(feature = "multicore"))]
    #[test]
    fn multicore_mode_is_unsupported_without_the_feature() {
        let mut engine = engine();
        engine.set_run_mode(RunMode::MultiCoreCpu);
        let mut out = [0u32; 3];
        let err = engine.inclusive_scan_slice(&[1u32, 2, 3], &mut out, Sum);
        assert!(matches!(err, Err(ScanError::UnsupportedMode)));
    }

    #[test]
    fn output_shorter_than_input_is_rejected() {
        let engine = engine();
        let mut out = [0u32; 2];
        let err = engine.inclusive_scan_slice(&[1u32, 2, 3], &mut out, Sum);
        assert!(matches!(err, Err(ScanError::InvalidArgument(_))));
    }

    #[test]
    fn device_slice_bounds_are_checked() {
        let engine = engine();
        let buf = GpuBuffer::<u32>::empty(engine.context(), "test", 10);
        assert!(DeviceSlice::new(&buf, 5, 6).is_err());
        assert!(DeviceSlice::new(&buf, 0, 10).is_ok());
    }

    struct RecordingSink(Mutex<Vec<Stage>>);

    impl TraceSink for RecordingSink {
        fn stage(&self, stage: Stage, _elapsed: Duration) {
            self.0.lock().expect("sink lock").push(stage);
        }
    }

    #[test]
    fn trace_sink_sees_three_stages() {
        let mut engine = engine();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        engine.set_trace_sink(Some(sink.clone()));
        let mut out = [0u32; 4];
        engine
            .inclusive_scan_slice(&[1u32, 2, 3, 4], &mut out, Sum)
            .expect("scan");
        assert_eq!(
            *sink.0.lock().expect("sink lock"),
            vec![Stage::PerBlockScan, Stage::CarryScan, Stage::BlockAdd]
        );
    }
}
