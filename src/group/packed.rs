//! Row-major packed storage of per-document groups and stats.
//!
//! A row holds the document's group as a little-endian `u32` followed by one
//! column per stat. Each stat column is as narrow as its declared range
//! allows (1, 2, 4 or 8 bytes) and stores `value - min`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FtgsError, Result};

const GROUP_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatColumn {
    offset: usize,
    width: usize,
    min: i64,
    max: i64,
}

impl StatColumn {
    fn width_for(min: i64, max: i64) -> usize {
        let span = (max as i128 - min as i128).max(0) as u128;
        if span <= u8::MAX as u128 {
            1
        } else if span <= u16::MAX as u128 {
            2
        } else if span <= u32::MAX as u128 {
            4
        } else {
            8
        }
    }
}

/// Owned, bounds-checked table of `num_rows` rows.
#[derive(Debug, Clone)]
pub struct PackedTable {
    data: Vec<u8>,
    num_rows: usize,
    row_size: usize,
    columns: Vec<StatColumn>,
}

impl PackedTable {
    /// Table of `num_rows` rows, every group 0 and every stat at its min.
    pub fn new(num_rows: usize, ranges: &[(i64, i64)]) -> Result<Self> {
        let mut offset = GROUP_BYTES;
        let mut columns = Vec::with_capacity(ranges.len());
        for (i, &(min, max)) in ranges.iter().enumerate() {
            if min > max {
                return Err(FtgsError::invalid_argument(format!(
                    "stat {i} has min {min} above max {max}"
                )));
            }
            let width = StatColumn::width_for(min, max);
            columns.push(StatColumn {
                offset,
                width,
                min,
                max,
            });
            offset += width;
        }

        let row_size = offset;
        let bytes = num_rows
            .checked_mul(row_size)
            .ok_or_else(|| FtgsError::invalid_argument("packed table size overflows"))?;
        Ok(PackedTable {
            data: vec![0u8; bytes],
            num_rows,
            row_size,
            columns,
        })
    }

    /// Bytes a table with these dimensions occupies.
    pub fn size_for(num_rows: usize, ranges: &[(i64, i64)]) -> u64 {
        let row: usize = GROUP_BYTES
            + ranges
                .iter()
                .map(|&(min, max)| StatColumn::width_for(min, max))
                .sum::<usize>();
        (num_rows as u64).saturating_mul(row as u64)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_stats(&self) -> usize {
        self.columns.len()
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Declared range of stat column `stat`.
    pub fn range(&self, stat: usize) -> (i64, i64) {
        let c = &self.columns[stat];
        (c.min, c.max)
    }

    /// Byte width of stat column `stat`.
    pub fn width(&self, stat: usize) -> usize {
        self.columns[stat].width
    }

    #[inline]
    fn row(&self, row: usize) -> &[u8] {
        &self.data[row * self.row_size..(row + 1) * self.row_size]
    }

    #[inline]
    fn row_mut(&mut self, row: usize) -> &mut [u8] {
        &mut self.data[row * self.row_size..(row + 1) * self.row_size]
    }

    #[inline]
    pub fn group(&self, row: usize) -> u32 {
        LittleEndian::read_u32(&self.row(row)[..GROUP_BYTES])
    }

    #[inline]
    pub fn set_group(&mut self, row: usize, group: u32) {
        LittleEndian::write_u32(&mut self.row_mut(row)[..GROUP_BYTES], group);
    }

    /// Value of stat column `stat` at `row`.
    #[inline]
    pub fn stat(&self, row: usize, stat: usize) -> i64 {
        let c = self.columns[stat];
        let bytes = &self.row(row)[c.offset..c.offset + c.width];
        let delta = match c.width {
            1 => bytes[0] as u64,
            2 => LittleEndian::read_u16(bytes) as u64,
            4 => LittleEndian::read_u32(bytes) as u64,
            _ => LittleEndian::read_u64(bytes),
        };
        c.min.wrapping_add(delta as i64)
    }

    /// Store `value`, clipped to the column's range.
    #[inline]
    pub fn set_stat(&mut self, row: usize, stat: usize, value: i64) {
        let c = self.columns[stat];
        let delta = value.clamp(c.min, c.max).wrapping_sub(c.min) as u64;
        let bytes = &mut self.row_mut(row)[c.offset..c.offset + c.width];
        match c.width {
            1 => bytes[0] = delta as u8,
            2 => LittleEndian::write_u16(bytes, delta as u16),
            4 => LittleEndian::write_u32(bytes, delta as u32),
            _ => LittleEndian::write_u64(bytes, delta),
        }
    }

    /// Heap bytes held by the table.
    pub fn memory_used(&self) -> usize {
        self.data.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_widths() {
        let table = PackedTable::new(
            3,
            &[(0, 255), (-1, 255), (0, 70_000), (i64::MIN, i64::MAX)],
        )
        .unwrap();
        assert_eq!(table.width(0), 1);
        assert_eq!(table.width(1), 2);
        assert_eq!(table.width(2), 4);
        assert_eq!(table.width(3), 8);
        assert_eq!(table.row_size(), 4 + 1 + 2 + 4 + 8);
        assert_eq!(
            PackedTable::size_for(3, &[(0, 255), (-1, 255), (0, 70_000), (i64::MIN, i64::MAX)]),
            3 * 19
        );
    }

    #[test]
    fn test_values_survive_packing() {
        let mut table = PackedTable::new(2, &[(-100, 100), (i64::MIN, i64::MAX)]).unwrap();
        table.set_group(1, 77);
        table.set_stat(1, 0, -42);
        table.set_stat(1, 1, i64::MIN);
        table.set_stat(0, 1, i64::MAX);

        assert_eq!(table.group(0), 0);
        assert_eq!(table.group(1), 77);
        assert_eq!(table.stat(1, 0), -42);
        assert_eq!(table.stat(0, 0), -100);
        assert_eq!(table.stat(1, 1), i64::MIN);
        assert_eq!(table.stat(0, 1), i64::MAX);
    }

    #[test]
    fn test_values_are_clipped() {
        let mut table = PackedTable::new(1, &[(0, 10)]).unwrap();
        table.set_stat(0, 0, 99);
        assert_eq!(table.stat(0, 0), 10);
        table.set_stat(0, 0, -5);
        assert_eq!(table.stat(0, 0), 0);
    }

    #[test]
    fn test_bad_range() {
        assert!(PackedTable::new(1, &[(5, 1)]).is_err());
    }
}
