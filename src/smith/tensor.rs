//! Block-sparse tensors over orbital index ranges.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{self, ensure};
use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::civec::SubspaceVector;
use crate::parallel::CommHandle;
use crate::smith::indexrange::{block_tuples, IndexRange};

/// A tensor whose dimensions are [`IndexRange`]s, stored block by block. Blocks are allocated
/// lazily; an absent block is zero.
///
/// In a group of ranks every rank holds a replica. Each block has one owner rank that computes
/// it; computed contributions reach the other replicas through [`Tensor::flush`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tensor {
    ranges: Vec<IndexRange>,
    blocks: BTreeMap<Vec<usize>, ArrayD<f64>>,
}

impl Tensor {
    /// Creates a tensor with no allocated blocks.
    pub fn new(ranges: Vec<IndexRange>) -> Self {
        Self {
            ranges,
            blocks: BTreeMap::new(),
        }
    }

    /// Splits a dense array into blocks. Blocks that are entirely zero are left unallocated.
    pub fn from_array(ranges: Vec<IndexRange>, data: ArrayViewD<'_, f64>) -> Result<Self, anyhow::Error> {
        let mut tensor = Self::new(ranges);
        ensure!(
            data.shape() == tensor.shape().as_slice(),
            "Array of shape {:?} does not match tensor shape {:?}.",
            data.shape(),
            tensor.shape()
        );
        for key in block_tuples(&tensor.nblocks()) {
            let block = tensor.slice_block(&data, &key);
            if block.iter().any(|v| *v != 0.0) {
                tensor.blocks.insert(key, block.to_owned());
            }
        }
        Ok(tensor)
    }

    /// Assembles the dense array.
    pub fn to_array(&self) -> ArrayD<f64> {
        let mut out = ArrayD::<f64>::zeros(IxDyn(&self.shape()));
        for (key, block) in self.blocks.iter() {
            out.slice_each_axis_mut(|ax| {
                Slice::from(self.ranges[ax.axis.index()].block(key[ax.axis.index()]).range())
            })
            .assign(block);
        }
        out
    }

    fn slice_block<'a>(&self, data: &'a ArrayViewD<'_, f64>, key: &[usize]) -> ArrayViewD<'a, f64> {
        data.slice_each_axis(|ax| {
            Slice::from(self.ranges[ax.axis.index()].block(key[ax.axis.index()]).range())
        })
    }

    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    pub fn rank(&self) -> usize {
        self.ranges.len()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.ranges.iter().map(IndexRange::size).collect()
    }

    /// The number of blocks along each dimension.
    pub fn nblocks(&self) -> Vec<usize> {
        self.ranges.iter().map(IndexRange::nblock).collect()
    }

    pub fn block_shape(&self, key: &[usize]) -> Vec<usize> {
        self.ranges
            .iter()
            .zip(key.iter())
            .map(|(range, &b)| range.block(b).size())
            .collect()
    }

    fn check_key(&self, key: &[usize]) -> Result<(), anyhow::Error> {
        ensure!(
            key.len() == self.rank()
                && key.iter().zip(self.nblocks()).all(|(&b, n)| b < n),
            "Block key {key:?} is invalid for block counts {:?}.",
            self.nblocks()
        );
        Ok(())
    }

    /// The block with the given key, or `None` if it has not been allocated.
    pub fn get_block(&self, key: &[usize]) -> Option<&ArrayD<f64>> {
        self.blocks.get(key)
    }

    pub fn is_allocated(&self, key: &[usize]) -> bool {
        self.blocks.contains_key(key)
    }

    /// The number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Adds `data` into the block with the given key, allocating it if necessary.
    pub fn add_block(&mut self, key: &[usize], data: &ArrayD<f64>) -> Result<(), anyhow::Error> {
        self.check_key(key)?;
        let shape = self.block_shape(key);
        ensure!(
            data.shape() == shape.as_slice(),
            "Block of shape {:?} cannot be added at {key:?} with shape {shape:?}.",
            data.shape()
        );
        match self.blocks.get_mut(key) {
            Some(block) => *block += data,
            None => {
                self.blocks.insert(key.to_vec(), data.clone());
            }
        }
        Ok(())
    }

    /// Replaces the block with the given key.
    pub fn put_block(&mut self, key: &[usize], data: ArrayD<f64>) -> Result<(), anyhow::Error> {
        self.check_key(key)?;
        let shape = self.block_shape(key);
        ensure!(
            data.shape() == shape.as_slice(),
            "Block of shape {:?} cannot be put at {key:?} with shape {shape:?}.",
            data.shape()
        );
        self.blocks.insert(key.to_vec(), data);
        Ok(())
    }

    /// The rank owning a block. Blocks are dealt out round-robin in row-major key order.
    pub fn owner(&self, key: &[usize], nrank: usize) -> usize {
        let linear = key
            .iter()
            .zip(self.nblocks())
            .fold(0, |acc, (&b, n)| acc * n + b);
        linear % nrank.max(1)
    }

    /// Adds the contributions `delta` computed on each rank into every replica. Collective.
    pub fn flush(&mut self, delta: Tensor, comm: &CommHandle) -> Result<(), anyhow::Error> {
        ensure!(
            delta.ranges == self.ranges,
            "Cannot flush a tensor over different index ranges."
        );
        if comm.size() == 1 {
            for (key, block) in delta.blocks.iter() {
                self.add_block(key, block)?;
            }
            return Ok(());
        }
        let keys = block_tuples(&self.nblocks());
        let sizes = keys
            .iter()
            .map(|key| self.block_shape(key).iter().product::<usize>())
            .collect::<Vec<_>>();
        let mut buffer = vec![0.0; sizes.iter().sum()];
        let mut start = 0;
        for (key, &len) in keys.iter().zip(sizes.iter()) {
            if let Some(block) = delta.blocks.get(key) {
                buffer[start..start + len]
                    .iter_mut()
                    .zip(block.iter())
                    .for_each(|(b, v)| *b = *v);
            }
            start += len;
        }
        comm.allreduce_sum(&mut buffer)?;
        let mut start = 0;
        for (key, &len) in keys.iter().zip(sizes.iter()) {
            let chunk = &buffer[start..start + len];
            if chunk.iter().any(|v| *v != 0.0) {
                let block = ArrayD::from_shape_vec(IxDyn(&self.block_shape(key)), chunk.to_vec())?;
                self.add_block(key, &block)?;
            }
            start += len;
        }
        Ok(())
    }

    fn check_same_ranges(&self, other: &Tensor) -> Result<(), anyhow::Error> {
        ensure!(
            self.ranges == other.ranges,
            "Tensors over different index ranges: [{}] vs [{}].",
            self.ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", "),
            other.ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }
}

impl SubspaceVector for Tensor {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        self.check_same_ranges(other)?;
        Ok(self
            .blocks
            .iter()
            .filter_map(|(key, a)| other.blocks.get(key).map(|b| (a * b).sum()))
            .sum())
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        self.check_same_ranges(x)?;
        for (key, block) in x.blocks.iter() {
            match self.blocks.get_mut(key) {
                Some(target) => target.scaled_add(a, block),
                None => {
                    self.blocks.insert(key.clone(), block * a);
                }
            }
        }
        Ok(())
    }

    fn scale(&mut self, a: f64) {
        self.blocks
            .values_mut()
            .for_each(|block| block.mapv_inplace(|v| v * a));
    }

    fn zero(&mut self) {
        self.blocks.clear();
    }

    fn size(&self) -> usize {
        self.shape().iter().product()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor[{}] ({} of {} blocks allocated)",
            self.ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", "),
            self.blocks.len(),
            self.nblocks().iter().product::<usize>()
        )
    }
}

// -----------
// MultiTensor
// -----------

/// A collection of tensors treated as one vector, one component per reference state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiTensor {
    tensors: Vec<Tensor>,
}

impl MultiTensor {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// `n` unallocated components over the same ranges.
    pub fn zeros(ranges: &[IndexRange], n: usize) -> Self {
        Self {
            tensors: (0..n).map(|_| Tensor::new(ranges.to_vec())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn at(&self, i: usize) -> &Tensor {
        &self.tensors[i]
    }

    pub fn at_mut(&mut self, i: usize) -> &mut Tensor {
        &mut self.tensors[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter()
    }

    pub fn into_inner(self) -> Vec<Tensor> {
        self.tensors
    }

    fn check_same_len(&self, other: &MultiTensor) -> Result<(), anyhow::Error> {
        ensure!(
            self.len() == other.len(),
            "Multi-tensors with {} and {} components.",
            self.len(),
            other.len()
        );
        Ok(())
    }
}

impl SubspaceVector for MultiTensor {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        self.check_same_len(other)?;
        self.tensors
            .iter()
            .zip(other.tensors.iter())
            .map(|(a, b)| a.dot(b))
            .sum()
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        self.check_same_len(x)?;
        self.tensors
            .iter_mut()
            .zip(x.tensors.iter())
            .try_for_each(|(y, x)| y.ax_plus_y(a, x))
    }

    fn scale(&mut self, a: f64) {
        self.tensors.iter_mut().for_each(|t| t.scale(a));
    }

    fn zero(&mut self) {
        self.tensors.iter_mut().for_each(Tensor::zero);
    }

    fn size(&self) -> usize {
        self.tensors.iter().map(Tensor::size).sum()
    }
}
