// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded worker pool for segment/file transfers.
//!
//! `N = min(max_threads, requests.len())` threads pull work items off a
//! shared index. The first failure flips a shared `ok` flag; workers
//! observe it before claiming their next item and stop early, so a
//! failing backup or restore doesn't keep burning I/O on doomed work.
//! Aggregated bytes-transferred progress is reported in whole deciles,
//! printed under the same mutex that guards the flag so lines from
//! different workers never interleave.

use crate::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Cheap cross-thread cancellation flag: workers check it before claiming
/// their next item so a failing transfer doesn't keep burning I/O on
/// doomed work once some other worker has already hit an error.
#[derive(Default)]
struct Stop(AtomicBool);

impl Stop {
    fn send(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One unit of work the pool hands to a worker thread.
pub trait WorkItem: Send + Sync {
    /// Performs the transfer, returning the number of bytes moved.
    ///
    /// # Errors
    ///
    /// Any [`Error`] aborts the whole pool after in-flight items drain.
    fn run(&self) -> Result<u64, Error>;
}

struct Shared {
    ok: bool,
    first_error: Option<Error>,
    bytes_done: u64,
    next_decile: u8,
}

/// Runs `items` across a bounded pool, returning the first error observed
/// (if any). `total_bytes` is the sum of every item's expected transfer
/// size, used only to print decile progress; it need not be exact.
///
/// # Errors
///
/// Returns the first [`Error`] any worker produced.
pub fn run<T: WorkItem>(
    items: &[T],
    max_threads: usize,
    total_bytes: u64,
    verbose: bool,
) -> Result<(), Error> {
    if items.is_empty() {
        return Ok(());
    }

    let n_threads = max_threads.min(items.len()).max(1);
    let next_index = AtomicUsize::new(0);
    let stop = Stop::default();
    let shared = Mutex::new(Shared {
        ok: true,
        first_error: None,
        bytes_done: 0,
        next_decile: 0,
    });
    let started = Instant::now();

    std::thread::scope(|scope| {
        for _ in 0..n_threads {
            scope.spawn(|| {
                loop {
                    if stop.is_stopped() {
                        return;
                    }
                    let idx = next_index.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(idx) else {
                        return;
                    };

                    match item.run() {
                        Ok(bytes) => {
                            let mut state = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                            if !state.ok {
                                return;
                            }
                            state.bytes_done += bytes;
                            if verbose && total_bytes > 0 {
                                report_progress(&mut state, total_bytes, started.elapsed());
                            }
                        }
                        Err(err) => {
                            let mut state = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                            if state.ok {
                                state.ok = false;
                                state.first_error = Some(err);
                            }
                            stop.send();
                            return;
                        }
                    }
                }
            });
        }
    });

    let state = shared.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    match state.first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn report_progress(state: &mut Shared, total_bytes: u64, elapsed: std::time::Duration) {
    #[allow(clippy::cast_possible_truncation)]
    let decile = ((state.bytes_done as u128 * 10) / u128::from(total_bytes)) as u8;
    let decile = decile.min(10);
    if decile <= state.next_decile {
        return;
    }
    state.next_decile = decile;

    let eta = if state.bytes_done > 0 && decile < 10 {
        let rate = state.bytes_done as f64 / elapsed.as_secs_f64().max(0.001);
        let remaining = total_bytes.saturating_sub(state.bytes_done) as f64;
        Some(std::time::Duration::from_secs_f64(remaining / rate.max(1.0)))
    } else {
        None
    };

    match eta {
        Some(eta) => log::info!("{}% complete, ETA {:.0}s", decile * 10, eta.as_secs_f64()),
        None => log::info!("{}% complete", decile * 10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Ok64(u64);
    impl WorkItem for Ok64 {
        fn run(&self) -> Result<u64, Error> {
            Ok(self.0)
        }
    }

    struct FailAt {
        calls: AtomicU32,
        fail_on: u32,
    }
    impl WorkItem for FailAt {
        fn run(&self) -> Result<u64, Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == self.fail_on {
                Err(Error::ArgError("boom".to_string()))
            } else {
                Ok(1)
            }
        }
    }

    #[test]
    fn runs_all_items() {
        let items: Vec<Ok64> = (0..20).map(Ok64).collect();
        let total: u64 = items.iter().map(|i| i.0).sum();
        run(&items, 4, total, false).unwrap();
    }

    #[test]
    fn empty_is_ok() {
        let items: Vec<Ok64> = Vec::new();
        run(&items, 4, 0, false).unwrap();
    }

    #[test]
    fn first_failure_propagates() {
        let item = FailAt {
            calls: AtomicU32::new(0),
            fail_on: 0,
        };
        let items = vec![item];
        let err = run(&items, 1, 1, false).unwrap_err();
        assert!(matches!(err, Error::ArgError(_)));
    }

    #[test]
    fn single_thread_for_single_item() {
        let items = vec![Ok64(42)];
        run(&items, 8, 42, false).unwrap();
    }
}
