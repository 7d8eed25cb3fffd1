//! Orbital index ranges split into blocks.

use std::fmt;
use std::ops::Range;

use anyhow::{self, ensure};
use serde::{Deserialize, Serialize};

/// One block of an [`IndexRange`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    /// Position of the first element relative to the start of the range.
    offset: usize,

    /// Number of elements in the block.
    size: usize,
}

impl Index {
    /// Position of the first element relative to the start of the range.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The elements of the block relative to the start of the range.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// A contiguous range of orbitals (*e.g.* internal or virtual) divided into blocks of nearly
/// equal size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    label: String,

    /// Orbital index of the first element.
    offset: usize,

    size: usize,

    blocks: Vec<Index>,
}

impl IndexRange {
    /// Creates an index range.
    ///
    /// # Arguments
    ///
    /// * `label` - A short name used in diagnostics.
    /// * `size` - The number of orbitals.
    /// * `block_size` - The largest number of orbitals per block.
    /// * `offset` - The orbital index of the first element.
    pub fn new(label: &str, size: usize, block_size: usize, offset: usize) -> Result<Self, anyhow::Error> {
        ensure!(block_size > 0, "Block size of index range `{label}` must be positive.");
        let nblock = (size + block_size - 1) / block_size;
        let blocks = if nblock == 0 {
            vec![]
        } else {
            let base = size / nblock;
            let extra = size % nblock;
            let mut start = 0;
            (0..nblock)
                .map(|i| {
                    let len = base + usize::from(i < extra);
                    let block = Index {
                        offset: start,
                        size: len,
                    };
                    start += len;
                    block
                })
                .collect()
        };
        Ok(Self {
            label: label.to_string(),
            offset,
            size,
            blocks,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Orbital index of the first element.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of orbitals.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The orbitals covered by the range.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    pub fn nblock(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Index] {
        &self.blocks
    }

    pub fn block(&self, i: usize) -> &Index {
        &self.blocks[i]
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}..{}; {} block{}]",
            self.label,
            self.offset,
            self.offset + self.size,
            self.nblock(),
            if self.nblock() == 1 { "" } else { "s" }
        )
    }
}

/// Every tuple of block numbers for dimensions with the given block counts, in row-major order.
/// A rank-zero shape has exactly one (empty) tuple.
pub(crate) fn block_tuples(nblocks: &[usize]) -> Vec<Vec<usize>> {
    nblocks.iter().fold(vec![vec![]], |acc, &n| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..n).map(move |b| {
                    let mut tuple = prefix.clone();
                    tuple.push(b);
                    tuple
                })
            })
            .collect()
    })
}
