//! The deterministic parallel chunk driver (C4).
//!
//! [`build_workers`] runs `build` once per chunk across a fixed pool of
//! OS threads. Work is handed out through a shared atomic counter rather
//! than statically sliced per thread, so a slow chunk doesn't leave a
//! thread idle while others queue up behind a fixed partition — but the
//! *result* is independent of both the thread count and the order
//! threads happen to finish in, since every chunk's output is written to
//! its own slot rather than appended in completion order. This mirrors
//! the original atomic fetch-add work queue (§4.4, §9) using only safe
//! Rust: `std::thread::scope` borrows `build` for the scope's lifetime,
//! an `AtomicUsize` hands out chunk indices, and a channel carries
//! `(index, output)` pairs back to the slot they belong in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

/// Run `build(i)` once for every `i` in `0..num_chunks`, across up to
/// `max_threads` OS threads (0 defaults to the number of available CPUs),
/// and return the outputs in chunk order.
///
/// `build` must be `Sync` since every worker thread borrows it; it is
/// called at most once per index, but the index each particular thread
/// handles is not determined in advance.
pub fn build_workers<T, F>(num_chunks: usize, max_threads: usize, build: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if num_chunks == 0 {
        return Vec::new();
    }

    let threads = resolve_thread_count(max_threads, num_chunks);
    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, T)>();

    std::thread::scope(|scope| {
        for _ in 0..threads {
            let cursor = &cursor;
            let build = &build;
            let tx = tx.clone();
            scope.spawn(move || loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                if i >= num_chunks {
                    break;
                }
                let output = build(i);
                if tx.send((i, output)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
    });

    let mut slots: Vec<Option<T>> = (0..num_chunks).map(|_| None).collect();
    for (i, output) in rx {
        slots[i] = Some(output);
    }
    slots.into_iter().map(|slot| slot.expect("every chunk index is claimed exactly once")).collect()
}

fn resolve_thread_count(max_threads: usize, num_chunks: usize) -> usize {
    let available = if max_threads > 0 { max_threads } else { num_cpus::get() };
    available.max(1).min(num_chunks)
}
