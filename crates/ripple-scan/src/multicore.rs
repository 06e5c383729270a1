//! Rayon-backed CPU scan for the MultiCoreCpu run mode.
//!
//! Same three phases as the device path, on chunks instead of tiles:
//! parallel chunk reductions, a sequential exclusive scan of the chunk
//! sums, then a parallel fix-up pass that writes the output.

use rayon::prelude::*;

use crate::combine::{Combiner, ScanElement};

/// Below this, chunking overhead beats the parallelism.
const MIN_CHUNK: usize = 1024;

pub(crate) fn multicore_scan<T: ScanElement, F: Combiner<T>>(
    input: &[T],
    output: &mut [T],
    init: T,
    combiner: &F,
    inclusive: bool,
) {
    let n = input.len();
    if n == 0 {
        return;
    }
    let chunk = n
        .div_ceil(rayon::current_num_threads().max(1))
        .max(MIN_CHUNK);

    let sums: Vec<T> = input
        .par_chunks(chunk)
        .map(|c| {
            c.iter()
                .copied()
                .reduce(|a, b| combiner.combine(a, b))
                .unwrap_or_else(|| combiner.identity())
        })
        .collect();

    let mut carries = Vec::with_capacity(sums.len());
    let mut acc = combiner.identity();
    for s in sums {
        carries.push(acc);
        acc = combiner.combine(acc, s);
    }

    output[..n]
        .par_chunks_mut(chunk)
        .zip(input.par_chunks(chunk))
        .zip(carries.into_par_iter())
        .for_each(|((out, inp), carry)| {
            if inclusive {
                let mut running = carry;
                for (o, &v) in out.iter_mut().zip(inp) {
                    running = combiner.combine(running, v);
                    *o = running;
                }
            } else {
                let mut running = combiner.combine(init, carry);
                for (o, &v) in out.iter_mut().zip(inp) {
                    *o = running;
                    running = combiner.combine(running, v);
                }
            }
        });
}
