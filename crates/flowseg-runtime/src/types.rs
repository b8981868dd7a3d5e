use std::sync::Arc;

use flowseg_core::SplitName;
use ndarray::Array4;

/// Stacked model inputs, all `(B, H, W, C)`.
#[derive(Debug, Clone)]
pub struct BatchInputs {
    pub old_frames: Array4<f32>,
    pub new_frames: Array4<f32>,
    /// Reverse flow, `(B, H, W, 2)`.
    pub flow: Array4<f32>,
    /// `new - old` in normalized units, when enabled.
    pub diff: Option<Array4<f32>>,
}

impl BatchInputs {
    /// Inputs in model order: old, new, flow, then diff when present.
    pub fn as_list(&self) -> Vec<&Array4<f32>> {
        let mut out = vec![&self.old_frames, &self.new_frames, &self.flow];
        if let Some(diff) = &self.diff {
            out.push(diff);
        }
        out
    }
}

/// A batch is the unit of delivery to the consumer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub split: SplitName,
    /// Logical stream positions the samples were claimed at.
    pub positions: Arc<[usize]>,
    /// Indices into the split, aligned with `positions`.
    pub sample_indices: Arc<[usize]>,
    pub flipped: Arc<[bool]>,
    pub inputs: BatchInputs,
    /// One `(B, H / f, W / f, n_classes)` tensor per label scale.
    pub targets: Vec<Array4<f32>>,
    pub unresolved_label_pixels: u64,
}

impl Batch {
    pub fn sample_count(&self) -> usize {
        self.sample_indices.len()
    }

    /// Bytes held by every tensor in the batch.
    pub fn tensor_bytes(&self) -> u64 {
        let elems: usize = self
            .inputs
            .as_list()
            .into_iter()
            .chain(self.targets.iter())
            .map(|a| a.len())
            .sum();
        (elems as u64).saturating_mul(std::mem::size_of::<f32>() as u64)
    }
}
