//! WGSL generation for the three scan kernels.
//!
//! Kernels are specialized at pipeline-cache miss: the element's WGSL
//! scalar name and the combiner's function body are substituted into the
//! templates, and the work-group size is baked in as a generation-time
//! constant. Scalar dispatch parameters travel in a uniform:
//!
//! ```text
//! word 0  vec_size         live element count N
//! word 1  exclusive        0 = inclusive, 1 = exclusive
//! word 2  work_per_thread  serial chunk per carry-scan thread
//! word 3  num_blocks       work-groups in kernels 0 and 2
//! word 4  init             bits of the exclusive seed
//! word 5  identity         bits of the combiner's neutral element
//! word 6  in_offset        element offset into the input binding
//! word 7  out_offset       element offset into the output binding
//! ```
//!
//! All three kernels additionally see a read-only `combiner_state` array
//! for combiners that carry runtime parameters.

fn params_struct(elem: &str) -> String {
    format!(
        "struct Params {{\n    \
             vec_size: u32,\n    \
             exclusive: u32,\n    \
             work_per_thread: u32,\n    \
             num_blocks: u32,\n    \
             init: {elem},\n    \
             identity: {elem},\n    \
             in_offset: u32,\n    \
             out_offset: u32,\n\
         }}\n"
    )
}

fn combine_fn(elem: &str, body: &str) -> String {
    format!("fn combine(a: {elem}, b: {elem}) -> {elem} {{\n    {body}\n}}\n")
}

/// In-place inclusive scan of `lds[0..len]` using `block_size` threads:
/// an up-sweep building power-of-two partial sums followed by the reverse
/// phase that completes every prefix. Both phases only ever combine a
/// lower index into a strictly higher one, so garbage in padded tail slots
/// never reaches a live prefix. Ends with a barrier so every thread may
/// read any slot.
fn tile_scan(len: u32) -> String {
    format!(
        "    var stride = 1u;\n    \
         while (stride < {len}u) {{\n        \
             workgroupBarrier();\n        \
             let idx = (t + 1u) * stride * 2u - 1u;\n        \
             if (idx < {len}u) {{\n            \
                 lds[idx] = combine(lds[idx - stride], lds[idx]);\n        \
             }}\n        \
             stride = stride * 2u;\n    \
         }}\n    \
         stride = {len}u / 4u;\n    \
         while (stride > 0u) {{\n        \
             workgroupBarrier();\n        \
             let idx = (t + 1u) * stride * 2u - 1u;\n        \
             if (idx + stride < {len}u) {{\n            \
                 lds[idx + stride] = combine(lds[idx], lds[idx + stride]);\n        \
             }}\n        \
             stride = stride / 2u;\n    \
         }}\n    \
         workgroupBarrier();\n"
    )
}

/// Kernel 0: each work-group scans its 2B-element tile and records the
/// tile's reduction (over the live prefix only) plus the last live input
/// element as the supplementary carry.
pub(crate) fn per_block_scan_source(elem: &str, body: &str, block_size: u32) -> String {
    let tile = block_size * 2;
    let params = params_struct(elem);
    let combine = combine_fn(elem, body);
    let scan = tile_scan(tile);
    format!(
        "{params}\n\
         @group(0) @binding(0) var<storage, read> input: array<{elem}>;\n\
         @group(0) @binding(1) var<storage, read_write> pre_sum: array<{elem}>;\n\
         @group(0) @binding(2) var<storage, read_write> pre_sum_carry: array<{elem}>;\n\
         @group(0) @binding(3) var<uniform> params: Params;\n\
         @group(0) @binding(4) var<storage, read> combiner_state: array<{elem}>;\n\n\
         var<workgroup> lds: array<{elem}, {tile}>;\n\n\
         {combine}\n\
         @compute @workgroup_size({block_size})\n\
         fn main(\n    \
             @builtin(local_invocation_id) lid: vec3<u32>,\n    \
             @builtin(workgroup_id) wid: vec3<u32>,\n    \
             @builtin(num_workgroups) nwg: vec3<u32>,\n\
         ) {{\n    \
             let block = wid.y * nwg.x + wid.x;\n    \
             if (block >= params.num_blocks) {{\n        \
                 return;\n    \
             }}\n    \
             let t = lid.x;\n    \
             let base = block * {tile}u;\n\n    \
             if (base + t < params.vec_size) {{\n        \
                 lds[t] = input[params.in_offset + base + t];\n    \
             }}\n    \
             if (base + t + {block_size}u < params.vec_size) {{\n        \
                 lds[t + {block_size}u] = input[params.in_offset + base + t + {block_size}u];\n    \
             }}\n\n\
         {scan}\n    \
             let live = min(params.vec_size - base, {tile}u);\n    \
             if (t == 0u) {{\n        \
                 pre_sum[block] = lds[live - 1u];\n        \
                 pre_sum_carry[block] = input[params.in_offset + base + live - 1u];\n    \
             }}\n\
         }}\n"
    )
}

/// Kernel 1: one work-group turns the per-block sums into their exclusive
/// scan. Each thread serially reduces a `work_per_thread` chunk, the chunk
/// totals are scanned in workgroup memory, then each thread replays its
/// chunk writing running prefixes. `post_sum[0]` is the combiner identity;
/// the exclusive `init` is deliberately not folded in here.
pub(crate) fn carry_scan_source(elem: &str, body: &str, block_size: u32) -> String {
    let params = params_struct(elem);
    let combine = combine_fn(elem, body);
    let scan = tile_scan(block_size);
    format!(
        "{params}\n\
         @group(0) @binding(0) var<storage, read_write> post_sum: array<{elem}>;\n\
         @group(0) @binding(1) var<storage, read> pre_sum: array<{elem}>;\n\
         @group(0) @binding(2) var<uniform> params: Params;\n\
         @group(0) @binding(3) var<storage, read> combiner_state: array<{elem}>;\n\n\
         var<workgroup> lds: array<{elem}, {block_size}>;\n\n\
         {combine}\n\
         @compute @workgroup_size({block_size})\n\
         fn main(@builtin(local_invocation_id) lid: vec3<u32>) {{\n    \
             let t = lid.x;\n    \
             let count = params.num_blocks;\n    \
             let begin = t * params.work_per_thread;\n    \
             let end = min(begin + params.work_per_thread, count);\n\n    \
             var total = params.identity;\n    \
             for (var i = begin; i < end; i = i + 1u) {{\n        \
                 total = combine(total, pre_sum[i]);\n    \
             }}\n    \
             lds[t] = total;\n\n\
         {scan}\n    \
             var running = params.identity;\n    \
             if (t > 0u) {{\n        \
                 running = lds[t - 1u];\n    \
             }}\n    \
             for (var i = begin; i < end; i = i + 1u) {{\n        \
                 post_sum[i] = running;\n        \
                 running = combine(running, pre_sum[i]);\n    \
             }}\n\
         }}\n"
    )
}

/// Kernel 2: each work-group recomputes its tile's inclusive scan and
/// writes the final output, folding in the scanned carry and, for
/// exclusive scans, the init value. Only live positions are written.
pub(crate) fn block_add_source(elem: &str, body: &str, block_size: u32) -> String {
    let tile = block_size * 2;
    let params = params_struct(elem);
    let combine = combine_fn(elem, body);
    let scan = tile_scan(tile);
    format!(
        "{params}\n\
         @group(0) @binding(0) var<storage, read> input: array<{elem}>;\n\
         @group(0) @binding(1) var<storage, read_write> output: array<{elem}>;\n\
         @group(0) @binding(2) var<storage, read> post_sum: array<{elem}>;\n\
         @group(0) @binding(3) var<uniform> params: Params;\n\
         @group(0) @binding(4) var<storage, read> combiner_state: array<{elem}>;\n\n\
         var<workgroup> lds: array<{elem}, {tile}>;\n\n\
         {combine}\n\
         @compute @workgroup_size({block_size})\n\
         fn main(\n    \
             @builtin(local_invocation_id) lid: vec3<u32>,\n    \
             @builtin(workgroup_id) wid: vec3<u32>,\n    \
             @builtin(num_workgroups) nwg: vec3<u32>,\n\
         ) {{\n    \
             let block = wid.y * nwg.x + wid.x;\n    \
             if (block >= params.num_blocks) {{\n        \
                 return;\n    \
             }}\n    \
             let t = lid.x;\n    \
             let base = block * {tile}u;\n\n    \
             if (base + t < params.vec_size) {{\n        \
                 lds[t] = input[params.in_offset + base + t];\n    \
             }}\n    \
             if (base + t + {block_size}u < params.vec_size) {{\n        \
                 lds[t + {block_size}u] = input[params.in_offset + base + t + {block_size}u];\n    \
             }}\n\n\
         {scan}\n    \
             let carry = post_sum[block];\n    \
             for (var s = 0u; s < 2u; s = s + 1u) {{\n        \
                 let j = t + s * {block_size}u;\n        \
                 let i = base + j;\n        \
                 if (i < params.vec_size) {{\n            \
                     if (params.exclusive == 0u) {{\n                \
                         output[params.out_offset + i] = combine(carry, lds[j]);\n            \
                     }} else if (j == 0u) {{\n                \
                         output[params.out_offset + i] = combine(params.init, carry);\n            \
                     }} else {{\n                \
                         output[params.out_offset + i] =\n                    \
                             combine(params.init, combine(carry, lds[j - 1u]));\n            \
                     }}\n        \
                 }}\n    \
             }}\n\
         }}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_element_and_block_size() {
        let src = per_block_scan_source("f32", "return a + b;", 4);
        assert!(src.contains("@workgroup_size(4)"));
        assert!(src.contains("var<workgroup> lds: array<f32, 8>;"));
        assert!(src.contains("fn combine(a: f32, b: f32) -> f32"));
        assert!(src.contains("init: f32"));
    }

    #[test]
    fn carry_scan_uses_single_block_lds() {
        let src = carry_scan_source("u32", "return a + b;", 64);
        assert!(src.contains("var<workgroup> lds: array<u32, 64>;"));
        assert!(src.contains("params.work_per_thread"));
        // the carry scan never touches the init value
        assert!(!src.contains("params.init"));
    }

    #[test]
    fn block_add_handles_both_modes() {
        let src = block_add_source("i32", "return a + b;", 128);
        assert!(src.contains("params.exclusive == 0u"));
        assert!(src.contains("combine(params.init, carry)"));
    }

    #[test]
    fn combiner_body_is_substituted_verbatim() {
        let body = "return min(a + b, combiner_state[0]);";
        let src = per_block_scan_source("u32", body, 8);
        assert!(src.contains(body));
    }
}
