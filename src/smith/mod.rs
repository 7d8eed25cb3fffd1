//! Block-sparse tensors and the dependency-scheduled contraction engine used by CASPT2.

pub mod indexrange;
pub mod linearrm;
pub mod queue;
pub mod task;
pub mod tensor;

pub use indexrange::{Index, IndexRange};
pub use linearrm::LinearRM;
pub use queue::{Queue, TaskHandle};
pub use task::{ContractionTask, ResetTask, Task, TensorId, TensorStore};
pub use tensor::{MultiTensor, Tensor};

#[cfg(test)]
#[path = "smith_tests.rs"]
mod smith_tests;
