//! Memory and temp-space accounting shared by the shards of one session.
//!
//! [`MemoryBudget`] tracks bytes held by session-owned buffers. Claims are
//! RAII: a [`MemoryClaim`] returns its bytes when dropped, so a failed
//! operation can never strand its reservation. [`TempBudget`] tracks the
//! bytes still allowed on disk for spilled FTGS streams.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::{FtgsError, Result};

struct BudgetInner {
    limit: u64,
    used: AtomicU64,
}

/// A session-scoped memory budget.
#[derive(Clone)]
pub struct MemoryBudget(Arc<BudgetInner>);

impl MemoryBudget {
    /// Create a budget allowing `limit` bytes of concurrent claims.
    pub fn new(limit: u64) -> Self {
        MemoryBudget(Arc::new(BudgetInner {
            limit,
            used: AtomicU64::new(0),
        }))
    }

    /// A budget that never refuses a claim.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// The configured limit.
    pub fn limit(&self) -> u64 {
        self.0.limit
    }

    /// Bytes currently claimed.
    ///
    /// **Note**: the value may already be stale in a concurrent environment.
    pub fn used(&self) -> u64 {
        self.0.used.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> u64 {
        self.0.limit.saturating_sub(self.used())
    }

    /// Claim `amount` bytes, failing with [`FtgsError::OutOfMemory`] if the
    /// budget cannot cover it.
    pub fn claim(&self, amount: u64) -> Result<MemoryClaim> {
        self.try_allocate(amount)?;
        Ok(MemoryClaim {
            budget: self.clone(),
            amount,
        })
    }

    fn try_allocate(&self, amount: u64) -> Result<()> {
        let inner = &self.0;
        let mut current = inner.used.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(amount) {
                Some(next) if next <= inner.limit => next,
                _ => {
                    return Err(FtgsError::OutOfMemory {
                        requested: amount,
                        available: inner.limit.saturating_sub(current),
                    });
                }
            };
            match inner
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, amount: u64) {
        self.0.used.fetch_sub(amount, Ordering::AcqRel);
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("limit", &self.limit())
            .field("used", &self.used())
            .finish()
    }
}

/// Bytes held against a [`MemoryBudget`]; returned on drop.
#[derive(Debug)]
pub struct MemoryClaim {
    budget: MemoryBudget,
    amount: u64,
}

impl MemoryClaim {
    /// Currently claimed amount.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Grow the claim by `additional` bytes.
    pub fn grow(&mut self, additional: u64) -> Result<()> {
        self.budget.try_allocate(additional)?;
        self.amount += additional;
        Ok(())
    }

    /// Shrink the claim down to `amount` bytes.
    pub fn shrink_to(&mut self, amount: u64) {
        if amount < self.amount {
            self.budget.release(self.amount - amount);
            self.amount = amount;
        }
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if self.amount != 0 {
            self.budget.release(self.amount);
        }
    }
}

/// Remaining bytes allowed for spill files.
///
/// Shared by every splitter and persisted stream of a session. Charging
/// past zero fails the write that crossed the line, not the query.
#[derive(Debug, Clone)]
pub struct TempBudget(Arc<AtomicI64>);

impl TempBudget {
    /// Create a budget of `bytes` spill bytes.
    pub fn new(bytes: u64) -> Self {
        TempBudget(Arc::new(AtomicI64::new(bytes.min(i64::MAX as u64) as i64)))
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(i64::MAX as u64)
    }

    /// Bytes left; negative once a write has overrun the budget.
    pub fn remaining(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Charge `bytes` written to disk.
    pub fn charge(&self, bytes: u64) -> Result<()> {
        let bytes = bytes.min(i64::MAX as u64) as i64;
        let before = self.0.fetch_sub(bytes, Ordering::AcqRel);
        if before.saturating_sub(bytes) < 0 {
            return Err(FtgsError::temp_space(format!(
                "spill of {bytes} bytes exceeds remaining temp budget of {before} bytes"
            )));
        }
        Ok(())
    }

    /// Return `bytes` once the spill file holding them is gone.
    pub fn refund(&self, bytes: u64) {
        let bytes = bytes.min(i64::MAX as u64) as i64;
        self.0.fetch_add(bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let budget = MemoryBudget::new(100);
        let a = budget.claim(60).unwrap();
        assert_eq!(budget.used(), 60);

        let err = budget.claim(50).unwrap_err();
        assert!(matches!(
            err,
            FtgsError::OutOfMemory {
                requested: 50,
                available: 40
            }
        ));

        drop(a);
        assert_eq!(budget.used(), 0);
        let _b = budget.claim(100).unwrap();
        assert_eq!(budget.available(), 0);
    }

    #[test]
    fn test_grow_and_shrink() {
        let budget = MemoryBudget::new(10);
        let mut claim = budget.claim(4).unwrap();
        claim.grow(6).unwrap();
        assert!(claim.grow(1).is_err());
        assert_eq!(claim.amount(), 10);

        claim.shrink_to(3);
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn test_failed_operation_leaves_session_usable() {
        let budget = MemoryBudget::new(1024);
        let _held = budget.claim(1000).unwrap();
        assert!(budget.claim(100).is_err());
        assert!(budget.claim(24).is_ok());
    }

    #[test]
    fn test_temp_budget() {
        let temp = TempBudget::new(10);
        temp.charge(6).unwrap();
        assert!(temp.charge(6).is_err());
        assert_eq!(temp.remaining(), -2);
        temp.refund(12);
        assert_eq!(temp.remaining(), 10);
    }
}
