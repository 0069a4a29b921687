//! Shared pool of fixed-size stat accumulation buffers.

use parking_lot::Mutex;

#[derive(Debug)]
struct PoolState {
    free: Vec<Vec<i64>>,
    total: Vec<i64>,
    returned: usize,
}

/// Buffers of `len` counters handed to concurrent shard tasks.
///
/// A task acquires a zeroed buffer, fills it and gives it back with
/// [`GroupStatsPool::release`], which folds its contents into the running
/// total. Buffers never outlive the task holding them.
#[derive(Debug)]
pub struct GroupStatsPool {
    len: usize,
    state: Mutex<PoolState>,
}

impl GroupStatsPool {
    pub fn new(len: usize) -> Self {
        GroupStatsPool {
            len,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                total: vec![0; len],
                returned: 0,
            }),
        }
    }

    /// Length of every buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take a zeroed buffer.
    pub fn acquire(&self) -> Vec<i64> {
        self.state
            .lock()
            .free
            .pop()
            .unwrap_or_else(|| vec![0; self.len])
    }

    /// Add `buffer` to the total and put it back, zeroed.
    pub fn release(&self, mut buffer: Vec<i64>) {
        buffer.resize(self.len, 0);
        let mut state = self.state.lock();
        for (total, value) in state.total.iter_mut().zip(buffer.iter_mut()) {
            *total += *value;
            *value = 0;
        }
        state.returned += 1;
        state.free.push(buffer);
    }

    /// Number of buffers returned so far.
    pub fn returned(&self) -> usize {
        self.state.lock().returned
    }

    /// Sum of every returned buffer.
    pub fn total(&self) -> Vec<i64> {
        self.state.lock().total.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_release_sums_and_recycles() {
        let pool = GroupStatsPool::new(3);
        let mut a = pool.acquire();
        a[1] = 5;
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(b, vec![0, 0, 0]);
        pool.release(b);
        assert_eq!(pool.total(), vec![0, 5, 0]);
        assert_eq!(pool.returned(), 2);
    }

    #[test]
    fn test_concurrent_release() {
        let pool = Arc::new(GroupStatsPool::new(2));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut buf = pool.acquire();
                    buf[0] = i;
                    buf[1] = 1;
                    pool.release(buf);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.total(), vec![28, 8]);
    }
}
