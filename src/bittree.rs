//! Hierarchical bit set used to track touched groups while accumulating one
//! term.
//!
//! Every level summarizes 64 bits of the level below, so setting a bit costs
//! one word update per level and enumerating the set bits only visits words
//! that contain at least one of them. Dumping clears the tree as it goes,
//! leaving it ready for the next term without a separate reset pass.

use crate::error::{FtgsError, Result};

/// 64-ary tree of bit words over `0..size`.
#[derive(Debug, Clone)]
pub struct BitTree {
    /// `levels[0]` holds the leaves; the last level has exactly one word.
    levels: Vec<Vec<u64>>,
    size: usize,
    cleared: bool,
}

impl BitTree {
    /// Create a tree able to hold indices in `0..size`.
    pub fn new(size: usize) -> Self {
        let mut levels = Vec::new();
        let mut n = size.max(1);
        loop {
            let words = n.div_ceil(64);
            levels.push(vec![0u64; words]);
            if words == 1 {
                break;
            }
            n = words;
        }

        BitTree {
            levels,
            size,
            cleared: true,
        }
    }

    /// Number of indices this tree can hold.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Depth of the hierarchy.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Heap bytes held by the tree.
    pub fn memory_used(&self) -> usize {
        self.levels.iter().map(|l| l.len() * 8).sum()
    }

    /// Mark `index` and propagate the summary bit to every level.
    #[inline]
    pub fn set(&mut self, index: u32) -> Result<()> {
        if !self.cleared {
            return Err(FtgsError::illegal_state(
                "BitTree::set called before the previous dump drained the tree",
            ));
        }
        self.set_unchecked(index);
        Ok(())
    }

    /// Mark every index in `indexes`.
    pub fn set_batch(&mut self, indexes: &[u32]) -> Result<()> {
        if !self.cleared {
            return Err(FtgsError::illegal_state(
                "BitTree::set_batch called before the previous dump drained the tree",
            ));
        }
        for &index in indexes {
            self.set_unchecked(index);
        }
        Ok(())
    }

    #[inline]
    fn set_unchecked(&mut self, index: u32) {
        let mut index = index as usize;
        for level in self.levels.iter_mut() {
            let next = index >> 6;
            level[next] |= 1u64 << (index & 0x3F);
            index = next;
        }
    }

    /// Whether `index` is currently set.
    pub fn get(&self, index: u32) -> bool {
        let index = index as usize;
        self.levels[0][index >> 6] & (1u64 << (index & 0x3F)) != 0
    }

    /// Write the set indices into `buffer` in ascending order, clearing each
    /// one as it is emitted, and return how many were written.
    ///
    /// If `buffer` fills up before the tree is drained the remaining bits are
    /// kept and the tree stays uncleared: further `set` calls fail until
    /// another `dump` drains it.
    pub fn dump(&mut self, buffer: &mut [u32]) -> usize {
        let top = self.levels.len() - 1;
        let mut count = 0;
        let mut depth = top;
        let mut index = 0usize;
        self.cleared = true;

        loop {
            while self.levels[depth][index] == 0 {
                if depth == top {
                    return count;
                }
                depth += 1;
                index >>= 6;
            }

            while depth != 0 {
                let word = self.levels[depth][index];
                let lsb = word & word.wrapping_neg();
                self.levels[depth][index] ^= lsb;
                depth -= 1;
                index = (index << 6) + lsb.trailing_zeros() as usize;
            }

            while self.levels[0][index] != 0 {
                if count == buffer.len() {
                    self.restore_path(index);
                    self.cleared = false;
                    return count;
                }
                let word = self.levels[0][index];
                let lsb = word & word.wrapping_neg();
                self.levels[0][index] ^= lsb;
                buffer[count] = ((index << 6) + lsb.trailing_zeros() as usize) as u32;
                count += 1;
            }

            if top == 0 {
                return count;
            }
            depth = 1;
            index >>= 6;
        }
    }

    /// Re-mark the summary bits above leaf word `word_index`; the descent in
    /// `dump` clears them before the leaf word is fully drained.
    fn restore_path(&mut self, word_index: usize) {
        let mut index = word_index;
        for level in self.levels.iter_mut().skip(1) {
            level[index >> 6] |= 1u64 << (index & 0x3F);
            index >>= 6;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_all(tree: &mut BitTree) -> Vec<u32> {
        let mut buffer = vec![0u32; tree.size()];
        let n = tree.dump(&mut buffer);
        buffer.truncate(n);
        buffer
    }

    #[test]
    fn test_dump_returns_sorted_set_indices() {
        let mut tree = BitTree::new(100_000);
        let indexes = [99_999u32, 5, 64, 63, 4096, 4095, 0, 70_000, 65];
        for &i in &indexes {
            tree.set(i).unwrap();
        }

        let mut expected = indexes.to_vec();
        expected.sort_unstable();
        assert_eq!(dump_all(&mut tree), expected);
        assert!(dump_all(&mut tree).is_empty());
    }

    #[test]
    fn test_depths() {
        assert_eq!(BitTree::new(0).depth(), 1);
        assert_eq!(BitTree::new(64).depth(), 1);
        assert_eq!(BitTree::new(65).depth(), 2);
        assert_eq!(BitTree::new(4096).depth(), 2);
        assert_eq!(BitTree::new(4097).depth(), 3);
    }

    #[test]
    fn test_single_level_tree() {
        let mut tree = BitTree::new(10);
        tree.set_batch(&[9, 1, 3]).unwrap();
        assert!(tree.get(3));
        assert!(!tree.get(4));
        assert_eq!(dump_all(&mut tree), vec![1, 3, 9]);
        assert!(!tree.get(3));
    }

    #[test]
    fn test_reuse_after_dump() {
        let mut tree = BitTree::new(5000);
        tree.set_batch(&[10, 20, 4999]).unwrap();
        assert_eq!(dump_all(&mut tree), vec![10, 20, 4999]);

        tree.set_batch(&[7, 3000]).unwrap();
        assert_eq!(dump_all(&mut tree), vec![7, 3000]);
    }

    #[test]
    fn test_short_buffer_leaves_tree_uncleared() {
        let mut tree = BitTree::new(10_000);
        let indexes: Vec<u32> = (0..10_000).step_by(37).collect();
        tree.set_batch(&indexes).unwrap();

        let mut small = [0u32; 5];
        assert_eq!(tree.dump(&mut small), 5);
        assert_eq!(&small[..], &indexes[..5]);
        assert!(matches!(tree.set(1), Err(FtgsError::IllegalState(_))));

        let rest = dump_all(&mut tree);
        assert_eq!(rest, indexes[5..].to_vec());
        tree.set(1).unwrap();
    }

    #[test]
    fn test_dense_random_sets() {
        use rand::Rng;
        use rand::seq::SliceRandom;

        let mut rng = rand::rng();
        let size = 300_000usize;
        let mut all: Vec<u32> = (0..size as u32).collect();
        all.shuffle(&mut rng);
        let take = rng.random_range(1..size / 10);
        let mut chosen = all[..take].to_vec();

        let mut tree = BitTree::new(size);
        for &i in &chosen {
            tree.set(i).unwrap();
        }
        chosen.sort_unstable();
        assert_eq!(dump_all(&mut tree), chosen);
        assert!(dump_all(&mut tree).is_empty());
    }
}
