//! The typed kernel registry and the three-stage device dispatcher.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ripple_kernel::{
    GpuBuffer, GpuContext, KernelError, compile_compute_pipeline, uniform_from_words,
    workgroup_grid_1d,
};

use crate::TraceSink;
use crate::combine::{Combiner, ScanElement};
use crate::error::{ScanError, Stage};
use crate::geometry::Geometry;
use crate::shaders;

/// Compiled pipeline triple for one (element, combiner, block size).
pub(crate) struct ScanKernels {
    per_block_scan: wgpu::ComputePipeline,
    per_block_layout: wgpu::BindGroupLayout,
    carry_scan: wgpu::ComputePipeline,
    carry_layout: wgpu::BindGroupLayout,
    block_add: wgpu::ComputePipeline,
    add_layout: wgpu::BindGroupLayout,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct KernelKey {
    element: TypeId,
    combiner: TypeId,
    block_size: u32,
}

/// Get-or-compute cache of compiled kernel sets.
///
/// Keyed by element type, combiner type, and block size; combiner *values*
/// share pipelines because runtime parameters travel through the state
/// buffer, not the generated source.
#[derive(Default)]
pub(crate) struct KernelRegistry {
    cache: Mutex<HashMap<KernelKey, Arc<ScanKernels>>>,
}

impl KernelRegistry {
    pub(crate) fn get_or_compile<T, F>(
        &self,
        ctx: &GpuContext,
        combiner: &F,
        block_size: u32,
    ) -> Result<Arc<ScanKernels>, ScanError>
    where
        T: ScanElement,
        F: Combiner<T>,
    {
        let key = KernelKey {
            element: TypeId::of::<T>(),
            combiner: TypeId::of::<F>(),
            block_size,
        };

        let mut cache = self.cache.lock().expect("kernel registry lock poisoned");
        if let Some(kernels) = cache.get(&key) {
            return Ok(kernels.clone());
        }

        let kernels = Arc::new(
            compile_kernels(ctx, T::WGSL_NAME, &combiner.wgsl_body(), block_size)
                .map_err(|source| ScanError::device(Stage::Compile, source))?,
        );
        cache.insert(key, kernels.clone());
        Ok(kernels)
    }

    #[cfg(test)]
    pub(crate) fn compiled_sets(&self) -> usize {
        self.cache.lock().expect("kernel registry lock poisoned").len()
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bind_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

/// Layouts are explicit so bind groups may cover the combiner-state
/// binding even when a particular combiner body never reads it.
fn compile_kernels(
    ctx: &GpuContext,
    elem: &str,
    body: &str,
    block_size: u32,
) -> Result<ScanKernels, KernelError> {
    let device = ctx.device();

    let per_block_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("ripple per-block scan layout"),
        entries: &[
            storage_entry(0, true),
            storage_entry(1, false),
            storage_entry(2, false),
            uniform_entry(3),
            storage_entry(4, true),
        ],
    });
    let carry_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("ripple carry scan layout"),
        entries: &[
            storage_entry(0, false),
            storage_entry(1, true),
            uniform_entry(2),
            storage_entry(3, true),
        ],
    });
    let add_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("ripple block add layout"),
        entries: &[
            storage_entry(0, true),
            storage_entry(1, false),
            storage_entry(2, true),
            uniform_entry(3),
            storage_entry(4, true),
        ],
    });

    let per_block_scan = {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ripple per-block scan pipeline layout"),
            bind_group_layouts: &[&per_block_layout],
            immediate_size: 0,
        });
        compile_compute_pipeline(
            ctx,
            "ripple per-block scan",
            &shaders::per_block_scan_source(elem, body, block_size),
            Some(&layout),
        )?
    };
    let carry_scan = {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ripple carry scan pipeline layout"),
            bind_group_layouts: &[&carry_layout],
            immediate_size: 0,
        });
        compile_compute_pipeline(
            ctx,
            "ripple carry scan",
            &shaders::carry_scan_source(elem, body, block_size),
            Some(&layout),
        )?
    };
    let block_add = {
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("ripple block add pipeline layout"),
            bind_group_layouts: &[&add_layout],
            immediate_size: 0,
        });
        compile_compute_pipeline(
            ctx,
            "ripple block add",
            &shaders::block_add_source(elem, body, block_size),
            Some(&layout),
        )?
    };

    Ok(ScanKernels {
        per_block_scan,
        per_block_layout,
        carry_scan,
        carry_layout,
        block_add,
        add_layout,
    })
}

fn params_words<T: ScanElement>(
    geometry: &Geometry,
    inclusive: bool,
    init: T,
    identity: T,
    in_offset: u32,
    out_offset: u32,
) -> [u32; 8] {
    [
        geometry.n,
        u32::from(!inclusive),
        geometry.work_per_thread(),
        geometry.num_blocks,
        bytemuck::cast(init),
        bytemuck::cast(identity),
        in_offset,
        out_offset,
    ]
}

/// Encode and submit one kernel inside its own validation scope, so a
/// failure is attributed to the stage that caused it.
fn submit_stage(
    ctx: &GpuContext,
    stage: Stage,
    trace: Option<&dyn TraceSink>,
    encode: impl FnOnce(&mut wgpu::CommandEncoder),
) -> Result<(), ScanError> {
    let started = Instant::now();
    ctx.push_error_scope(wgpu::ErrorFilter::Validation);

    let mut encoder = ctx
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
    encode(&mut encoder);
    ctx.queue().submit(Some(encoder.finish()));

    ctx.pop_error_scope()
        .map_err(|source| ScanError::device(stage, source))?;
    if let Some(sink) = trace {
        sink.stage(stage, started.elapsed());
    }
    Ok(())
}

/// Run the three-pass scan over `geometry.n` elements.
///
/// The queue serializes the kernels, so kernel 1 observes every write of
/// kernel 0 and kernel 2 observes both. Returns only after the queue has
/// drained, which is what makes "output fully written or untouched" hold
/// for the caller.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_device<T: ScanElement, F: Combiner<T>>(
    ctx: &GpuContext,
    kernels: &ScanKernels,
    geometry: Geometry,
    input: &GpuBuffer<T>,
    in_offset: u32,
    output: &GpuBuffer<T>,
    out_offset: u32,
    init: T,
    combiner: &F,
    inclusive: bool,
    trace: Option<&dyn TraceSink>,
) -> Result<(), ScanError> {
    let _span = tracing::trace_span!(
        "ripple scan",
        n = geometry.n,
        blocks = geometry.num_blocks,
        block_size = geometry.block_size,
    )
    .entered();

    ctx.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    ctx.push_error_scope(wgpu::ErrorFilter::Validation);

    // Auxiliary buffers are sized to a whole number of tiles; the excess
    // slots are written by surplus-thread guards only, never read.
    let tile = geometry.tile() as usize;
    let aux_len = (geometry.num_blocks as usize).div_ceil(tile) * tile;
    let pre_sum = GpuBuffer::<T>::empty(ctx, "ripple pre_sum", aux_len);
    // Written by kernel 0; kernel 2 redoes the local scans, so the carries
    // reconstruct from post_sum alone and nothing binds this downstream.
    let pre_sum_carry = GpuBuffer::<T>::empty(ctx, "ripple pre_sum carry", aux_len);
    let post_sum = GpuBuffer::<T>::empty(ctx, "ripple post_sum", aux_len);

    let state = combiner.state();
    let state_buf = GpuBuffer::<T>::from_slice(ctx, "ripple combiner state", &state);
    let params = params_words(
        &geometry,
        inclusive,
        init,
        combiner.identity(),
        in_offset,
        out_offset,
    );
    let params_buf = uniform_from_words(ctx, "ripple scan params", &params);

    // Pop both scopes before propagating so neither is left on the stack.
    let validation = ctx.pop_error_scope();
    let out_of_memory = ctx.pop_error_scope();
    validation.map_err(|source| ScanError::device(Stage::Buffer, source))?;
    out_of_memory.map_err(|source| ScanError::device(Stage::Buffer, source))?;

    let (grid_x, grid_y) = workgroup_grid_1d(geometry.num_blocks);

    submit_stage(ctx, Stage::PerBlockScan, trace, |encoder| {
        let bind = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ripple per-block scan bind"),
            layout: &kernels.per_block_layout,
            entries: &[
                bind_entry(0, input.inner()),
                bind_entry(1, pre_sum.inner()),
                bind_entry(2, pre_sum_carry.inner()),
                bind_entry(3, &params_buf),
                bind_entry(4, state_buf.inner()),
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("ripple per-block scan"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernels.per_block_scan);
        pass.set_bind_group(0, &bind, &[]);
        pass.dispatch_workgroups(grid_x, grid_y, 1);
    })?;

    submit_stage(ctx, Stage::CarryScan, trace, |encoder| {
        let bind = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ripple carry scan bind"),
            layout: &kernels.carry_layout,
            entries: &[
                bind_entry(0, post_sum.inner()),
                bind_entry(1, pre_sum.inner()),
                bind_entry(2, &params_buf),
                bind_entry(3, state_buf.inner()),
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("ripple carry scan"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernels.carry_scan);
        pass.set_bind_group(0, &bind, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    })?;

    submit_stage(ctx, Stage::BlockAdd, trace, |encoder| {
        let bind = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ripple block add bind"),
            layout: &kernels.add_layout,
            entries: &[
                bind_entry(0, input.inner()),
                bind_entry(1, output.inner()),
                bind_entry(2, post_sum.inner()),
                bind_entry(3, &params_buf),
                bind_entry(4, state_buf.inner()),
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("ripple block add"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernels.block_add);
        pass.set_bind_group(0, &bind, &[]);
        pass.dispatch_workgroups(grid_x, grid_y, 1);
    })?;

    // The mandatory wait: partial completion must not be observable.
    ctx.wait()
        .map_err(|source| ScanError::device(Stage::BlockAdd, source))?;

    Ok(())
}
