//! Device infrastructure for ripple's compute kernels.
//!
//! This crate owns the pieces that are independent of any particular
//! algorithm: acquiring a device and queue, typed storage buffers with
//! upload and readback, compiling WGSL compute pipelines with validation
//! errors captured instead of panicking, and the 1D→2D work-group tiling
//! needed once a dispatch exceeds the per-dimension limit.

use std::marker::PhantomData;
use std::sync::mpsc;

use thiserror::Error;
use wgpu::util::DeviceExt;

/// Failures raised by the device layer.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no suitable adapter found: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
}

/// A device, its queue, and the facts about the adapter that geometry
/// planning needs (work-group limits, wavefront width, device class).
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    device_type: wgpu::DeviceType,
    limits: wgpu::Limits,
    wavefront: u32,
    error_scopes: std::cell::RefCell<Vec<wgpu::ErrorScopeGuard>>,
}

/// Wavefront width assumed when the adapter does not report subgroup sizes.
const DEFAULT_WAVEFRONT: u32 = 32;

impl GpuContext {
    /// Acquire the default adapter and a device with default limits.
    pub fn new() -> Result<Self, KernelError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;

        let min_subgroup = adapter.get_info().subgroup_min_size;
        let wavefront = if min_subgroup == 0 {
            DEFAULT_WAVEFRONT
        } else {
            min_subgroup
        };
        let device_type = adapter.get_info().device_type;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("ripple device"),
            ..Default::default()
        }))?;
        let limits = device.limits();

        Ok(Self {
            device,
            queue,
            device_type,
            limits,
            wavefront,
            error_scopes: std::cell::RefCell::new(Vec::new()),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The limits the device was actually created with.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Native SIMD execution width of the adapter.
    pub fn wavefront_size(&self) -> u32 {
        self.wavefront
    }

    /// Whether the adapter is a CPU implementation (software rasterizers
    /// report `DeviceType::Cpu`), which wants much smaller work-groups.
    pub fn is_cpu_like(&self) -> bool {
        self.device_type == wgpu::DeviceType::Cpu
    }

    /// Block until all submitted work has completed.
    pub fn wait(&self) -> Result<(), KernelError> {
        self.device.poll(wgpu::PollType::wait_indefinitely())?;
        Ok(())
    }

    pub fn push_error_scope(&self, filter: wgpu::ErrorFilter) {
        self.error_scopes
            .borrow_mut()
            .push(self.device.push_error_scope(filter));
    }

    /// Pop the innermost error scope, converting any captured error.
    pub fn pop_error_scope(&self) -> Result<(), KernelError> {
        let guard = self
            .error_scopes
            .borrow_mut()
            .pop()
            .expect("pop_error_scope called without a matching push_error_scope");
        match pollster::block_on(guard.pop()) {
            None => Ok(()),
            Some(err) => Err(KernelError::Validation(err.to_string())),
        }
    }
}

/// Compile a WGSL compute pipeline with entry point `main`.
///
/// Pass an explicit layout when bind groups must cover bindings the shader
/// declares but does not statically use; with `None` the layout is derived
/// from the shader. Shader and pipeline creation are wrapped in a
/// validation scope so a malformed shader surfaces as
/// `KernelError::Validation` rather than an uncaptured device error.
pub fn compile_compute_pipeline(
    ctx: &GpuContext,
    label: &str,
    source: &str,
    layout: Option<&wgpu::PipelineLayout>,
) -> Result<wgpu::ComputePipeline, KernelError> {
    ctx.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = ctx.device().create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline = ctx
        .device()
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout,
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

    ctx.pop_error_scope()?;
    Ok(pipeline)
}

/// Work-group grid for a 1D dispatch, tiled into 2D once the count
/// exceeds the 65535 per-dimension limit. Kernels recover the linear
/// work-group index as `wid.y * num_workgroups.x + wid.x`.
pub fn workgroup_grid_1d(count: u32) -> (u32, u32) {
    if count > 65535 {
        let y = (f64::from(count)).sqrt().ceil() as u32;
        let x = count.div_ceil(y);
        (x, y)
    } else {
        (count.max(1), 1)
    }
}

/// Create a uniform buffer from raw 32-bit words.
pub fn uniform_from_words(ctx: &GpuContext, label: &str, words: &[u32]) -> wgpu::Buffer {
    ctx.device().create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(words),
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

/// A storage buffer of `len` elements of `T`.
///
/// The buffer is always allocated with at least one element's worth of
/// backing store so zero-length views stay bindable.
pub struct GpuBuffer<T> {
    buffer: wgpu::Buffer,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> GpuBuffer<T> {
    /// Reserve a zero-initialized storage buffer for `len` elements.
    pub fn empty(ctx: &GpuContext, label: &str, len: usize) -> Self {
        let size = (len.max(1) * size_of::<T>()) as u64;
        let buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            _marker: PhantomData,
        }
    }

    /// Upload a host slice into a fresh storage buffer.
    pub fn from_slice(ctx: &GpuContext, label: &str, data: &[T]) -> Self {
        if data.is_empty() {
            return Self::empty(ctx, label, 0);
        }
        let buffer = ctx.device().create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        Self {
            buffer,
            len: data.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn inner(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Overwrite `data.len()` elements starting at element `offset`.
    pub fn write(&self, ctx: &GpuContext, offset: usize, data: &[T]) {
        debug_assert!(offset + data.len() <= self.len, "write past end of buffer");
        ctx.queue().write_buffer(
            &self.buffer,
            (offset * size_of::<T>()) as u64,
            bytemuck::cast_slice(data),
        );
    }

    /// Copy `len` elements starting at `offset` back to the host.
    ///
    /// Blocks until the copy and all previously submitted work complete.
    pub fn read_range(
        &self,
        ctx: &GpuContext,
        offset: usize,
        len: usize,
    ) -> Result<Vec<T>, KernelError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        debug_assert!(offset + len <= self.len, "read past end of buffer");
        let size = (len * size_of::<T>()) as u64;

        let staging = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("ripple readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(
            &self.buffer,
            (offset * size_of::<T>()) as u64,
            &staging,
            0,
            size,
        );
        ctx.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        ctx.wait()?;

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(KernelError::Validation(
                    "buffer map callback was dropped".to_owned(),
                ));
            }
        }

        let mapped = slice.get_mapped_range();
        let out = bytemuck::cast_slice(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(out)
    }

    /// Copy the whole buffer back to the host.
    pub fn read(&self, ctx: &GpuContext) -> Result<Vec<T>, KernelError> {
        self.read_range(ctx, 0, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_stays_1d_below_limit() {
        assert_eq!(workgroup_grid_1d(0), (1, 1));
        assert_eq!(workgroup_grid_1d(1), (1, 1));
        assert_eq!(workgroup_grid_1d(65535), (65535, 1));
    }

    #[test]
    fn grid_tiles_2d_above_limit() {
        let (x, y) = workgroup_grid_1d(70_000);
        assert!(x <= 65535 && y <= 65535);
        assert!(u64::from(x) * u64::from(y) >= 70_000);
    }

    #[test]
    fn buffer_roundtrip() {
        let ctx = GpuContext::new().expect("no adapter");
        let data: Vec<u32> = (0..4096).collect();
        let buf = GpuBuffer::from_slice(&ctx, "roundtrip", &data);
        assert_eq!(buf.read(&ctx).expect("readback"), data);
    }

    #[test]
    fn buffer_read_range() {
        let ctx = GpuContext::new().expect("no adapter");
        let data: Vec<i32> = (0..100).collect();
        let buf = GpuBuffer::from_slice(&ctx, "range", &data);
        assert_eq!(buf.read_range(&ctx, 10, 5).expect("readback"), data[10..15]);
    }

    #[test]
    fn zeroed_allocation_reads_back_zero() {
        let ctx = GpuContext::new().expect("no adapter");
        let buf = GpuBuffer::<f32>::empty(&ctx, "zeroed", 64);
        assert_eq!(buf.read(&ctx).expect("readback"), vec![0.0; 64]);
    }

    #[test]
    fn bad_shader_is_captured() {
        let ctx = GpuContext::new().expect("no adapter");
        let err = compile_compute_pipeline(&ctx, "broken", "not wgsl at all", None);
        assert!(matches!(err, Err(KernelError::Validation(_))));
    }

    #[test]
    fn trivial_pipeline_compiles() {
        let ctx = GpuContext::new().expect("no adapter");
        let src = r"
            @group(0) @binding(0) var<storage, read_write> data: array<u32>;

            @compute @workgroup_size(64)
            fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
                if (gid.x < arrayLength(&data)) {
                    data[gid.x] = data[gid.x] + 1u;
                }
            }
        ";
        compile_compute_pipeline(&ctx, "trivial", src, None).expect("compile");
    }
}
