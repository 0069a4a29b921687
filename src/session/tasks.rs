//! Fan-out of per-shard and per-bucket tasks onto the worker pool.

use crossbeam_channel::unbounded;
use log::{debug, warn};
use rayon::ThreadPool;

use crate::error::{FtgsError, Result};
use crate::ftgs::iterator::{BoxedFtgsIterator, FtgsIterator};
use crate::ftgs::splitter::FtgsSplitter;

/// Result of one task. When a sibling task fails, every successful output
/// is released before the error is returned.
pub trait TaskOutput: Send {
    fn release(&mut self) {}
}

impl TaskOutput for BoxedFtgsIterator {
    fn release(&mut self) {
        self.close();
    }
}

impl TaskOutput for FtgsSplitter {
    fn release(&mut self) {
        self.close();
    }
}

impl<T: TaskOutput> TaskOutput for Vec<T> {
    fn release(&mut self) {
        for item in self.iter_mut() {
            item.release();
        }
    }
}

impl<T: TaskOutput> TaskOutput for Option<T> {
    fn release(&mut self) {
        if let Some(item) = self {
            item.release();
        }
    }
}

impl TaskOutput for () {}

impl TaskOutput for u32 {}

impl TaskOutput for usize {}

impl TaskOutput for i64 {}

/// Run `task` once per item on `pool` and collect the outputs in item
/// order.
///
/// Items may borrow from the caller: tasks run inside a pool scope that
/// ends before this returns. If any task fails, the outputs of the tasks
/// that succeeded are released and the first failure (by item index) is
/// returned wrapped in [`FtgsError::TaskFailed`].
pub fn execute<A, T, F>(pool: &ThreadPool, label: &str, items: Vec<A>, task: F) -> Result<Vec<T>>
where
    A: Send,
    T: TaskOutput,
    F: Fn(usize, A) -> Result<T> + Sync,
{
    let count = items.len();
    let (tx, rx) = unbounded();
    pool.scope(|scope| {
        for (index, item) in items.into_iter().enumerate() {
            let tx = tx.clone();
            let task = &task;
            scope.spawn(move |_| {
                let _ = tx.send((index, task(index, item)));
            });
        }
    });
    drop(tx);

    let mut outputs: Vec<Option<T>> = (0..count).map(|_| None).collect();
    let mut failure: Option<(usize, FtgsError)> = None;
    for (index, result) in rx.iter() {
        match result {
            Ok(output) => outputs[index] = Some(output),
            Err(e) => {
                debug!("{label} task {index} failed: {e}");
                if failure.as_ref().is_none_or(|(first, _)| index < *first) {
                    failure = Some((index, e));
                }
            }
        }
    }

    if let Some((index, error)) = failure {
        let released = outputs.iter().filter(|o| o.is_some()).count();
        outputs.release();
        warn!("{label} task {index} failed, released {released} completed outputs");
        return Err(FtgsError::task_failed(format!("{label}-{index}"), error));
    }
    outputs
        .into_iter()
        .enumerate()
        .map(|(index, output)| {
            output.ok_or_else(|| FtgsError::illegal_state(format!("{label} task {index} produced no result")))
        })
        .collect()
}
