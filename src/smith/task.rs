//! Tensor storage and the tasks executed by a [`crate::smith::queue::Queue`].

use std::fmt;

use anyhow::{self, bail, ensure, format_err};
use indexmap::IndexMap;
use itertools::Itertools;
use log;
use ndarray::ArrayD;
use ndarray_einsum_beta::ArrayLike;

use crate::auxiliary::linalg::contract;
use crate::civec::SubspaceVector;
use crate::parallel::CommHandle;
use crate::smith::indexrange::{block_tuples, IndexRange};
use crate::smith::tensor::Tensor;

// ------------
// Tensor store
// ------------

/// Handle to a tensor slot in a [`TensorStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    label: String,
    ranges: Vec<IndexRange>,
    tensor: Option<Tensor>,
}

/// Arena of the tensors read and written by the tasks of a queue. A slot knows its index ranges
/// from the start; its tensor is allocated by the first task writing to it.
#[derive(Clone, Debug, Default)]
pub struct TensorStore {
    slots: Vec<Slot>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an existing tensor.
    pub fn insert(&mut self, label: &str, tensor: Tensor) -> TensorId {
        self.slots.push(Slot {
            label: label.to_string(),
            ranges: tensor.ranges().to_vec(),
            tensor: Some(tensor),
        });
        TensorId(self.slots.len() - 1)
    }

    /// Declares a slot to be filled by a task.
    pub fn declare(&mut self, label: &str, ranges: Vec<IndexRange>) -> TensorId {
        self.slots.push(Slot {
            label: label.to_string(),
            ranges,
            tensor: None,
        });
        TensorId(self.slots.len() - 1)
    }

    fn slot(&self, id: TensorId) -> Result<&Slot, anyhow::Error> {
        self.slots
            .get(id.0)
            .ok_or_else(|| format_err!("Tensor {id} does not exist."))
    }

    fn slot_mut(&mut self, id: TensorId) -> Result<&mut Slot, anyhow::Error> {
        self.slots
            .get_mut(id.0)
            .ok_or_else(|| format_err!("Tensor {id} does not exist."))
    }

    pub fn label(&self, id: TensorId) -> Result<&str, anyhow::Error> {
        Ok(self.slot(id)?.label.as_str())
    }

    pub fn ranges(&self, id: TensorId) -> Result<&[IndexRange], anyhow::Error> {
        Ok(self.slot(id)?.ranges.as_slice())
    }

    /// Returns `true` if the slot holds a tensor.
    pub fn is_allocated(&self, id: TensorId) -> bool {
        self.slots
            .get(id.0)
            .map(|slot| slot.tensor.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, id: TensorId) -> Result<&Tensor, anyhow::Error> {
        let slot = self.slot(id)?;
        slot.tensor
            .as_ref()
            .ok_or_else(|| format_err!("Tensor `{}` has not been allocated.", slot.label))
    }

    /// Mutable access to the tensor of a slot, allocating it with no blocks if necessary.
    pub fn get_or_allocate(&mut self, id: TensorId) -> Result<&mut Tensor, anyhow::Error> {
        let slot = self.slot_mut(id)?;
        let ranges = slot.ranges.clone();
        Ok(slot.tensor.get_or_insert_with(|| Tensor::new(ranges)))
    }

    /// Removes the tensor from its slot.
    pub fn take(&mut self, id: TensorId) -> Result<Tensor, anyhow::Error> {
        let slot = self.slot_mut(id)?;
        slot.tensor
            .take()
            .ok_or_else(|| format_err!("Tensor `{}` has not been allocated.", slot.label))
    }
}

// ----
// Task
// ----

/// Trait for units of work in a queue. A task declares its output and its inputs when it is
/// constructed; it may only run once every input has been fully computed.
pub trait Task: fmt::Debug {
    fn label(&self) -> String;

    /// The tensor written (or accumulated into) by this task.
    fn output(&self) -> TensorId;

    /// The tensors read by this task.
    fn inputs(&self) -> &[TensorId];

    /// Executes the task. Collective over the ranks of `comm`.
    fn compute(&self, store: &mut TensorStore, comm: &CommHandle) -> Result<(), anyhow::Error>;
}

/// Zeroes a tensor, allocating it if necessary.
#[derive(Clone, Debug)]
pub struct ResetTask {
    output: TensorId,
}

impl ResetTask {
    pub fn new(output: TensorId) -> Self {
        Self { output }
    }
}

impl Task for ResetTask {
    fn label(&self) -> String {
        format!("reset {}", self.output)
    }

    fn output(&self) -> TensorId {
        self.output
    }

    fn inputs(&self) -> &[TensorId] {
        &[]
    }

    fn compute(&self, store: &mut TensorStore, _: &CommHandle) -> Result<(), anyhow::Error> {
        store.get_or_allocate(self.output)?.zero();
        Ok(())
    }
}

/// Accumulates a scaled Einstein summation over block-sparse inputs into an output tensor,
/// *e.g.* `"xpyq,abpq->abxy"`.
///
/// Each output block is a sub-task computed only by its owner rank; the results are flushed into
/// every replica of the output.
#[derive(Clone, Debug)]
pub struct ContractionTask {
    label: String,
    pattern: String,
    output: TensorId,
    inputs: Vec<TensorId>,
    output_letters: Vec<char>,
    input_letters: Vec<Vec<char>>,
    summed_letters: Vec<char>,
    letter_ranges: IndexMap<char, IndexRange>,
    factor: f64,
    reset: bool,
}

impl ContractionTask {
    /// Creates a contraction task.
    ///
    /// # Arguments
    ///
    /// * `label` - A name used in diagnostics.
    /// * `pattern` - The summation pattern with one operand per input.
    /// * `output` - The accumulated tensor.
    /// * `inputs` - The operands, which must not include `output`.
    /// * `factor` - The scaling applied to the contraction before accumulation.
    /// * `store` - The store holding the slots, used to check index ranges.
    ///
    /// # Errors
    ///
    /// Errors if the pattern does not match the ranks and ranges of the operands, or if the
    /// output is also an input.
    pub fn new(
        label: &str,
        pattern: &str,
        output: TensorId,
        inputs: &[TensorId],
        factor: f64,
        store: &TensorStore,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            !inputs.contains(&output),
            "Task `{label}` would contract into one of its own inputs."
        );
        let (lhs, rhs) = pattern
            .split_once("->")
            .ok_or_else(|| format_err!("Pattern `{pattern}` has no output."))?;
        let input_letters = lhs
            .split(',')
            .map(|s| s.trim().chars().collect_vec())
            .collect_vec();
        let output_letters = rhs.trim().chars().collect_vec();
        ensure!(
            input_letters.len() == inputs.len(),
            "Pattern `{pattern}` has {} operands but {} inputs were given.",
            input_letters.len(),
            inputs.len()
        );
        ensure!(
            output_letters.iter().all_unique(),
            "Pattern `{pattern}` repeats an output index."
        );

        let mut letter_ranges = IndexMap::<char, IndexRange>::new();
        for (letters, &id) in input_letters.iter().zip(inputs.iter()) {
            let ranges = store.ranges(id)?;
            ensure!(
                letters.len() == ranges.len(),
                "Operand `{}` of `{pattern}` has rank {}.",
                letters.iter().collect::<String>(),
                ranges.len()
            );
            for (&c, range) in letters.iter().zip(ranges.iter()) {
                match letter_ranges.get(&c) {
                    Some(existing) if existing != range => {
                        bail!("Index `{c}` of `{pattern}` spans {existing} and {range}.")
                    }
                    Some(_) => {}
                    None => {
                        letter_ranges.insert(c, range.clone());
                    }
                }
            }
        }
        let output_ranges = store.ranges(output)?;
        ensure!(
            output_letters.len() == output_ranges.len(),
            "Output of `{pattern}` has rank {}.",
            output_ranges.len()
        );
        for (c, range) in output_letters.iter().zip(output_ranges.iter()) {
            let existing = letter_ranges
                .get(c)
                .ok_or_else(|| format_err!("Output index `{c}` of `{pattern}` is not an input index."))?;
            ensure!(
                existing == range,
                "Output index `{c}` of `{pattern}` spans {existing} but the output has {range}."
            );
        }
        let summed_letters = letter_ranges
            .keys()
            .filter(|c| !output_letters.contains(*c))
            .copied()
            .collect_vec();
        Ok(Self {
            label: label.to_string(),
            pattern: pattern.to_string(),
            output,
            inputs: inputs.to_vec(),
            output_letters,
            input_letters,
            summed_letters,
            letter_ranges,
            factor,
            reset: false,
        })
    }

    /// Zeroes the output before accumulating into it.
    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }

    fn nblocks(&self, letters: &[char]) -> Vec<usize> {
        letters
            .iter()
            .map(|c| self.letter_ranges.get(c).map(IndexRange::nblock).unwrap_or(0))
            .collect()
    }

    /// Computes the output blocks owned by `rank`.
    fn local_contributions(
        &self,
        operands: &[&Tensor],
        output_ranges: Vec<IndexRange>,
        rank: usize,
        nrank: usize,
    ) -> Result<Tensor, anyhow::Error> {
        let mut delta = Tensor::new(output_ranges);
        let summed_tuples = block_tuples(&self.nblocks(&self.summed_letters));
        for okey in block_tuples(&self.nblocks(&self.output_letters)) {
            if delta.owner(&okey, nrank) != rank {
                continue;
            }
            let block_of = |c: &char, skey: &[usize]| -> usize {
                match self.output_letters.iter().position(|x| x == c) {
                    Some(i) => okey[i],
                    None => self
                        .summed_letters
                        .iter()
                        .position(|x| x == c)
                        .map(|i| skey[i])
                        .unwrap_or(0),
                }
            };
            let mut acc: Option<ArrayD<f64>> = None;
            for skey in summed_tuples.iter() {
                let blocks = operands
                    .iter()
                    .zip(self.input_letters.iter())
                    .map(|(t, letters)| {
                        let key = letters.iter().map(|c| block_of(c, skey.as_slice())).collect_vec();
                        t.get_block(&key)
                    })
                    .collect::<Option<Vec<_>>>();
                let Some(blocks) = blocks else {
                    continue;
                };
                let args = blocks
                    .iter()
                    .map(|b| *b as &dyn ArrayLike<f64>)
                    .collect_vec();
                let contribution = contract(&self.pattern, &args)?;
                match acc.as_mut() {
                    Some(a) => *a += &contribution,
                    None => acc = Some(contribution),
                }
            }
            if let Some(mut a) = acc {
                a.mapv_inplace(|v| v * self.factor);
                delta.put_block(&okey, a)?;
            }
        }
        Ok(delta)
    }
}

impl Task for ContractionTask {
    fn label(&self) -> String {
        format!("{} ({})", self.label, self.pattern)
    }

    fn output(&self) -> TensorId {
        self.output
    }

    fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    fn compute(&self, store: &mut TensorStore, comm: &CommHandle) -> Result<(), anyhow::Error> {
        let output_ranges = store.ranges(self.output)?.to_vec();
        let delta = {
            let operands = self
                .inputs
                .iter()
                .map(|&id| store.get(id))
                .collect::<Result<Vec<_>, _>>()?;
            self.local_contributions(&operands, output_ranges, comm.rank(), comm.size())?
        };
        log::debug!(
            "Task `{}` computed {} local block(s).",
            self.label,
            delta.allocated_blocks()
        );
        let out = store.get_or_allocate(self.output)?;
        if self.reset {
            out.zero();
        }
        out.flush(delta, comm)
    }
}
