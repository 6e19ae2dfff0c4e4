//! Allocation map: one bit per 1K block, bit = 1 means allocated.

use crate::error::{OasisError, Result};

#[derive(Debug, Clone)]
pub struct AllocationMap {
    bits: Vec<u8>,
    capacity: usize,
}

impl AllocationMap {
    pub fn new(capacity_blocks: usize) -> Self {
        let bytes = (capacity_blocks + 7) / 8;
        AllocationMap {
            bits: vec![0u8; bytes],
            capacity: capacity_blocks,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, capacity_blocks: usize) -> Self {
        let mut bits = bytes;
        let needed = (capacity_blocks + 7) / 8;
        bits.resize(needed.max(bits.len()), 0);
        AllocationMap {
            bits,
            capacity: capacity_blocks,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_state(&self, block: usize) -> bool {
        if block >= self.capacity {
            return false;
        }
        let byte = self.bits[block / 8];
        (byte >> (block % 8)) & 1 != 0
    }

    pub fn set_state(&mut self, block: usize, allocated: bool) {
        if block >= self.capacity {
            return;
        }
        let mask = 1u8 << (block % 8);
        if allocated {
            self.bits[block / 8] |= mask;
        } else {
            self.bits[block / 8] &= !mask;
        }
    }

    pub fn count_free(&self) -> usize {
        (0..self.capacity).filter(|&b| !self.get_state(b)).count()
    }

    /// Returns (start, length) of every maximal free run, in ascending
    /// order of start block.
    fn free_runs(&self) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut run_start: Option<usize> = None;
        for block in 0..self.capacity {
            if !self.get_state(block) {
                if run_start.is_none() {
                    run_start = Some(block);
                }
            } else if let Some(start) = run_start.take() {
                runs.push((start, block - start));
            }
        }
        if let Some(start) = run_start {
            runs.push((start, self.capacity - start));
        }
        runs
    }

    pub fn largest_free_run(&self) -> usize {
        self.free_runs().into_iter().map(|(_, len)| len).max().unwrap_or(0)
    }

    /// Best-fit allocation: among all free runs with length >= n, picks the
    /// run whose length is closest to n, tie-breaking by lowest start block.
    pub fn allocate(&mut self, n: usize) -> Result<usize> {
        if n == 0 {
            return Err(OasisError::invalid_argument("cannot allocate 0 blocks"));
        }
        let best = self
            .free_runs()
            .into_iter()
            .filter(|&(_, len)| len >= n)
            .min_by_key(|&(start, len)| (len - n, start));

        match best {
            Some((start, _)) => {
                for block in start..start + n {
                    self.set_state(block, true);
                }
                Ok(start)
            }
            None => Err(OasisError::resource_exhausted(format!(
                "no free run of at least {n} blocks"
            ))),
        }
    }

    /// Deallocates `[start, start+n)`. All blocks in the range must
    /// currently be allocated; on failure, no change is made.
    pub fn deallocate(&mut self, start: usize, n: usize) -> Result<()> {
        if start + n > self.capacity {
            return Err(OasisError::invalid_argument(
                "deallocate range exceeds map capacity",
            ));
        }
        for block in start..start + n {
            if !self.get_state(block) {
                return Err(OasisError::invalid_argument(format!(
                    "block {block} is not allocated"
                )));
            }
        }
        for block in start..start + n {
            self.set_state(block, false);
        }
        Ok(())
    }
}
