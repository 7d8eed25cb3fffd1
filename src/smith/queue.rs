//! Dependency-respecting execution of tensor tasks.

use anyhow::{self, bail, ensure};
use itertools::Itertools;
use log;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::parallel::CommHandle;
use crate::smith::task::{Task, TensorId, TensorStore};

/// Handle to a task added to a [`Queue`], used to declare explicit dependencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

#[derive(Debug)]
struct QueuedTask {
    id: usize,
    task: Box<dyn Task>,
    depends: Vec<usize>,
}

/// A set of tasks executed in any order consistent with their data dependencies.
///
/// A task is ready when every task it explicitly depends on has completed and each of its inputs
/// is allocated and no longer the output of a pending task. Accumulations into one output from
/// several tasks may therefore run in any order.
#[derive(Debug, Default)]
pub struct Queue {
    tasks: Vec<QueuedTask>,
    next_id: usize,
    shuffle_seed: Option<u64>,
    shuffled: bool,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue whose tasks are shuffled with a seeded generator before they are scanned for
    /// readiness. Every rank must use the same seed.
    pub fn with_shuffle(seed: Option<u64>) -> Self {
        Self {
            shuffle_seed: seed,
            ..Self::default()
        }
    }

    /// Adds a task that may only run after the tasks in `depends` have completed.
    pub fn add_task(
        &mut self,
        task: Box<dyn Task>,
        depends: &[TaskHandle],
    ) -> Result<TaskHandle, anyhow::Error> {
        ensure!(
            depends
                .iter()
                .all(|h| self.tasks.iter().any(|queued| queued.id == h.0)),
            "Task `{}` depends on a task that is not queued.",
            task.label()
        );
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.push(QueuedTask {
            id,
            task,
            depends: depends.iter().map(|h| h.0).collect(),
        });
        self.shuffled = false;
        Ok(TaskHandle(id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns `true` once every task has been executed.
    pub fn done(&self) -> bool {
        self.tasks.is_empty()
    }

    fn is_pending_output(&self, id: TensorId, except: usize) -> bool {
        self.tasks
            .iter()
            .enumerate()
            .any(|(i, queued)| i != except && queued.task.output() == id)
    }

    fn is_ready(&self, i: usize, store: &TensorStore) -> bool {
        let queued = &self.tasks[i];
        queued.depends.is_empty()
            && queued
                .task
                .inputs()
                .iter()
                .all(|&id| store.is_allocated(id) && !self.is_pending_output(id, i))
    }

    /// Executes one ready task and removes it from the queue.
    ///
    /// # Errors
    ///
    /// Errors if no task is ready, which means that the queue contains a dependency cycle or
    /// reads a tensor that nothing produces.
    pub fn next_compute(&mut self, store: &mut TensorStore, comm: &CommHandle) -> Result<(), anyhow::Error> {
        if !self.shuffled {
            if let Some(seed) = self.shuffle_seed {
                self.tasks.shuffle(&mut StdRng::seed_from_u64(seed));
            }
            self.shuffled = true;
        }
        let Some(i) = (0..self.tasks.len()).find(|&i| self.is_ready(i, store)) else {
            bail!(
                "None of the {} queued tasks is ready: {}.",
                self.tasks.len(),
                self.tasks.iter().map(|queued| queued.task.label()).join("; ")
            );
        };
        let queued = self.tasks.remove(i);
        log::debug!("Executing task `{}`.", queued.task.label());
        queued.task.compute(store, comm)?;
        self.tasks
            .iter_mut()
            .for_each(|other| other.depends.retain(|&d| d != queued.id));
        Ok(())
    }

    /// Executes every task.
    pub fn run(&mut self, store: &mut TensorStore, comm: &CommHandle) -> Result<(), anyhow::Error> {
        while !self.done() {
            self.next_compute(store, comm)?;
        }
        Ok(())
    }
}
