use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use scopeguard::defer;

use crate::finish_line::FinishLine;
use crate::pool::{execute_safely, ThreadPool};

// Chunks per active worker when the caller does not pick a count; a little
// oversubscription evens out unequal chunk runtimes.
const CHUNKS_PER_WORKER: usize = 4;

impl ThreadPool {
    /// Applies `f` to every index in `range`, splitting the work across pool
    /// tasks, and returns once all of it has run.
    ///
    /// The calling thread helps execute queued tasks while it waits, so
    /// calls may be nested (from inside tasks) without deadlocking. A panic
    /// inside `f` is re-raised on the pool's owner thread, here or at the
    /// next `push`/`wait`.
    pub fn parallel_for<F>(&self, range: Range<usize>, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.parallel_for_chunks(range, 0, f)
    }

    /// [`parallel_for`](Self::parallel_for) with an explicit number of
    /// chunks; `0` picks one based on the active worker count.
    pub fn parallel_for_chunks<F>(&self, range: Range<usize>, chunks: usize, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let len = range.end.saturating_sub(range.start);
        if len == 0 {
            return;
        }
        if self.threads() == 0 {
            for i in range {
                f(i);
            }
            return;
        }

        let n_chunks = self.chunk_count(chunks, len);
        let f = Arc::new(f);
        let line = Arc::new(FinishLine::new(n_chunks));
        let base = len / n_chunks;
        let extra = len % n_chunks;
        let mut lo = range.start;
        for c in 0..n_chunks {
            let hi = lo + base + usize::from(c < extra);
            let f = f.clone();
            let line = line.clone();
            self.push(move || {
                // the line must be crossed even if a body panics, or helpers
                // would spin on a line that can never complete
                defer! { line.cross(); }
                for i in lo..hi {
                    f(i);
                }
            });
            lo = hi;
        }

        self.help_until_done(&line);
        self.manager().rethrow_panic();
    }

    /// Applies `f` to every item of `items` across pool tasks and returns
    /// once all of it has run. Same helping and panic behavior as
    /// [`parallel_for`](Self::parallel_for).
    pub fn parallel_for_each<I, F>(&self, items: I, f: F)
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) + Send + Sync + 'static,
    {
        let mut items: Vec<I::Item> = items.into_iter().collect();
        let len = items.len();
        if len == 0 {
            return;
        }
        if self.threads() == 0 {
            for item in items {
                f(item);
            }
            return;
        }

        let n_chunks = self.chunk_count(0, len);
        let f = Arc::new(f);
        let line = Arc::new(FinishLine::new(n_chunks));
        let base = len / n_chunks;
        let extra = len % n_chunks;
        for c in 0..n_chunks {
            let take = base + usize::from(c < extra);
            let chunk: Vec<I::Item> = items.split_off(items.len() - take);
            let f = f.clone();
            let line = line.clone();
            self.push(move || {
                defer! { line.cross(); }
                for item in chunk {
                    f(item);
                }
            });
        }

        self.help_until_done(&line);
        self.manager().rethrow_panic();
    }

    fn chunk_count(&self, requested: usize, len: usize) -> usize {
        let chunks = if requested == 0 {
            CHUNKS_PER_WORKER * self.active_threads()
        } else {
            requested
        };
        chunks.clamp(1, len)
    }

    /// Executes queued tasks until the line is crossed. Blocking only
    /// happens in short slices so freshly queued chunks are picked up even
    /// when every worker is busy elsewhere.
    fn help_until_done(&self, line: &FinishLine) {
        loop {
            while let Some(hold) = self.manager().try_pop(0) {
                execute_safely(hold, self.manager());
            }
            if line.is_done() {
                break;
            }
            if !self.manager().is_running() {
                // an error drain discards queued chunks; the owner re-raise
                // right after this loop reports what happened
                break;
            }
            line.wait_for(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn covers_the_whole_range_once() {
        let pool = ThreadPool::with_threads(4);
        let hits = Arc::new((0..1000).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
        {
            let hits = hits.clone();
            pool.parallel_for(0..1000, move |i| {
                hits[i].fetch_add(1, Ordering::Relaxed);
            });
        }
        for cell in hits.iter() {
            assert_eq!(cell.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn explicit_chunk_counts_work() {
        let pool = ThreadPool::with_threads(2);
        for chunks in [1, 2, 7, 100, 5000] {
            let sum = Arc::new(AtomicU64::new(0));
            let sum2 = sum.clone();
            pool.parallel_for_chunks(0..100, chunks, move |i| {
                sum2.fetch_add(i as u64, Ordering::Relaxed);
            });
            assert_eq!(sum.load(Ordering::Relaxed), 4950);
        }
    }

    #[test]
    fn empty_range_is_a_no_op() {
        let pool = ThreadPool::with_threads(2);
        pool.parallel_for(5..5, |_| panic!("must not run"));
        pool.wait();
    }

    #[test]
    fn for_each_consumes_the_items() {
        let pool = ThreadPool::with_threads(3);
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = sum.clone();
        pool.parallel_for_each(1..=100u64, move |n| {
            sum2.fetch_add(n, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn zero_worker_pool_runs_inline() {
        let pool = ThreadPool::with_threads(0);
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = sum.clone();
        pool.parallel_for(0..10, move |i| {
            sum2.fetch_add(i as u64, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 45);
    }
}
