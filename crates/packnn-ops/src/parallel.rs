//! Fork-join helpers that honor the per-call thread budget.
//!
//! Every parallel region in this crate is a synchronous parallel-for over an
//! outer axis (channels, rows or width tiles) where each worker owns a
//! disjoint slice; no locking happens inside the region.

use rayon::prelude::*;

/// Runs `f` inside a thread pool limited to `num_threads` workers.
///
/// A budget of 0 (the default) uses the global Rayon pool. Building a local
/// pool has overhead; callers pass a fixed budget only when the per-call
/// configuration demands it.
pub fn with_thread_budget<R: Send>(num_threads: usize, f: impl FnOnce() -> R + Send) -> R {
    if num_threads == 0 {
        return f();
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
    {
        Ok(pool) => pool.install(f),
        Err(_) => f(),
    }
}

/// Applies `f` to each `plane_len`-sized chunk of `data` in parallel.
///
/// `f` receives the chunk index (channel or row number) and the chunk.
pub fn for_each_plane_mut<T: Send>(
    data: &mut [T],
    plane_len: usize,
    num_threads: usize,
    f: impl Fn(usize, &mut [T]) + Send + Sync,
) {
    if plane_len == 0 || data.is_empty() {
        return;
    }
    with_thread_budget(num_threads, || {
        data.par_chunks_exact_mut(plane_len)
            .enumerate()
            .for_each(|(i, chunk)| f(i, chunk));
    });
}

/// Zips `plane_len`-sized chunks of `src` with `dst_plane_len`-sized chunks
/// of `dst` and applies `f` to each pair in parallel.
pub fn for_each_plane_pair<S: Sync, D: Send>(
    src: &[S],
    src_plane_len: usize,
    dst: &mut [D],
    dst_plane_len: usize,
    num_threads: usize,
    f: impl Fn(usize, &[S], &mut [D]) + Send + Sync,
) {
    if src_plane_len == 0 || dst_plane_len == 0 {
        return;
    }
    with_thread_budget(num_threads, || {
        src.par_chunks_exact(src_plane_len)
            .zip(dst.par_chunks_exact_mut(dst_plane_len))
            .enumerate()
            .for_each(|(i, (s, d))| f(i, s, d));
    });
}
