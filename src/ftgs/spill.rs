//! Spilling FTGS streams to anonymous temp files.
//!
//! A persisted stream is written once, charged against the session's
//! [`TempBudget`] as it grows, and read back lazily. The file has no name on
//! disk and disappears when the iterator is closed or dropped; the charged
//! bytes are refunded at the same moment.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};

use log::{debug, warn};

use crate::error::Result;
use crate::ftgs::codec::{FtgsStreamWriter, StreamFtgsIterator, StreamHeader};
use crate::ftgs::iterator::{FtgsIterator, closed_error};
use crate::ftgs::types::{FieldSpec, FtgsRecord};
use crate::memory::TempBudget;

/// Drain `iterator` into a temp file and return a reader over it.
///
/// The source iterator is closed whether or not the spill succeeds. Running
/// out of temp budget fails with [`crate::error::FtgsError::TempSpaceExhausted`]
/// and leaves nothing charged.
pub fn persist<I: FtgsIterator + ?Sized>(
    iterator: &mut I,
    budget: &TempBudget,
) -> Result<SpilledFtgsIterator> {
    let result = (|| {
        let mut writer = SpillWriter::new(StreamHeader::of(iterator), budget)?;
        while let Some(record) = iterator.next_record()? {
            writer.write(&record)?;
        }
        writer.finish()
    })();
    iterator.close();
    result
}

/// Incremental writer of one spill file.
///
/// Dropping an unfinished writer deletes the file and refunds its bytes.
pub(crate) struct SpillWriter {
    writer: Option<FtgsStreamWriter<BufWriter<File>>>,
    header: StreamHeader,
    budget: TempBudget,
    charged: u64,
    records: u64,
}

impl SpillWriter {
    pub(crate) fn new(header: StreamHeader, budget: &TempBudget) -> Result<Self> {
        let file = tempfile::tempfile()?;
        let writer = FtgsStreamWriter::new(BufWriter::new(file), header.clone())?;
        let header_bytes = writer.position();
        let mut this = SpillWriter {
            writer: Some(writer),
            header,
            budget: budget.clone(),
            charged: 0,
            records: 0,
        };
        this.charge(header_bytes)?;
        Ok(this)
    }

    pub(crate) fn write(&mut self, record: &FtgsRecord) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| closed_error("SpillWriter"))?;
        let bytes = writer.write_record(record)?;
        self.records += 1;
        self.charge(bytes)
    }

    pub(crate) fn finish(mut self) -> Result<SpilledFtgsIterator> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| closed_error("SpillWriter"))?;
        let before = writer.position();
        let (buffered, total) = writer.finish()?;
        self.charge(total - before)?;

        let mut file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        let reader = StreamFtgsIterator::new(BufReader::new(file))?;

        debug!("Spilled {} records ({} bytes)", self.records, self.charged);
        let bytes = std::mem::take(&mut self.charged);
        Ok(SpilledFtgsIterator {
            inner: Some(reader),
            header: self.header.clone(),
            budget: self.budget.clone(),
            bytes,
        })
    }

    fn charge(&mut self, bytes: u64) -> Result<()> {
        self.charged += bytes;
        self.budget.charge(bytes).inspect_err(|_| {
            warn!(
                "Temp budget exhausted after {} spilled bytes ({} remaining)",
                self.charged,
                self.budget.remaining()
            );
        })
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        if self.charged != 0 {
            self.budget.refund(self.charged);
        }
    }
}

/// Lazy reader over a persisted stream.
pub struct SpilledFtgsIterator {
    inner: Option<StreamFtgsIterator<BufReader<File>>>,
    header: StreamHeader,
    budget: TempBudget,
    bytes: u64,
}

impl SpilledFtgsIterator {
    /// Size of the spill file.
    pub fn spilled_bytes(&self) -> u64 {
        self.bytes
    }
}

impl FtgsIterator for SpilledFtgsIterator {
    fn fields(&self) -> &[FieldSpec] {
        &self.header.fields
    }

    fn num_stats(&self) -> usize {
        self.header.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.header.num_groups
    }

    fn is_sorted(&self) -> bool {
        self.header.sorted
    }

    fn next_record(&mut self) -> Result<Option<FtgsRecord>> {
        match self.inner.as_mut() {
            Some(inner) => inner.next_record(),
            None => Err(closed_error("SpilledFtgsIterator")),
        }
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            self.budget.refund(self.bytes);
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for SpilledFtgsIterator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FtgsError;
    use crate::ftgs::iterator::{VecFtgsIterator, drain};
    use crate::ftgs::types::{GroupStats, Term};

    fn records(n: i64) -> Vec<FtgsRecord> {
        (0..n)
            .map(|i| {
                let mut gs = GroupStats::new(1);
                gs.push(1, &[i]);
                FtgsRecord::new(0, Term::Int(i), gs)
            })
            .collect()
    }

    #[test]
    fn test_persist_and_refund() {
        let budget = TempBudget::new(1 << 20);
        let mut source = VecFtgsIterator::new(vec![FieldSpec::int("f")], 1, 2, true, records(100));
        let mut spilled = persist(&mut source, &budget).unwrap();
        assert!(source.is_closed());
        assert!(spilled.spilled_bytes() > 0);
        assert_eq!(budget.remaining(), (1 << 20) - spilled.spilled_bytes() as i64);

        assert_eq!(drain(&mut spilled).unwrap(), records(100));
        assert_eq!(budget.remaining(), 1 << 20);
    }

    #[test]
    fn test_budget_exhaustion_fails_write() {
        let budget = TempBudget::new(64);
        let mut source = VecFtgsIterator::new(vec![FieldSpec::int("f")], 1, 2, true, records(100));
        let err = persist(&mut source, &budget).err().unwrap();
        assert!(matches!(err, FtgsError::TempSpaceExhausted(_)));
        assert!(source.is_closed());
        assert_eq!(budget.remaining(), 64);
    }

    #[test]
    fn test_drop_refunds() {
        let budget = TempBudget::new(1 << 20);
        let mut source = VecFtgsIterator::new(vec![FieldSpec::int("f")], 1, 2, true, records(3));
        let spilled = persist(&mut source, &budget).unwrap();
        drop(spilled);
        assert_eq!(budget.remaining(), 1 << 20);
    }
}
