// Generation-tagged, index-addressed resource table
//
// Per-image resources (swapchain images, framebuffers) live in one of these.
// A lookup carries the generation it was issued for and is rejected once the
// table moved on, so nothing from a retired swapchain gets dereferenced.

use super::error::{GpuError, Result};

/// Handle to one swapchain image slot of one swapchain generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIndex {
    pub index: u32,
    pub generation: u64,
}

#[derive(Debug)]
pub struct GenerationTable<T> {
    generation: u64,
    slots: Vec<T>,
}

impl<T> Default for GenerationTable<T> {
    fn default() -> Self {
        Self { generation: 0, slots: Vec::new() }
    }
}

impl<T> GenerationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Install the slots of `generation`.
    ///
    /// The previous generation must have been drained first, and generations
    /// never go backwards. Re-installing the current generation is allowed
    /// (e.g. framebuffers rebuilt for a new render pass on the same swapchain).
    pub fn install(&mut self, generation: u64, slots: Vec<T>) -> Result<()> {
        if !self.slots.is_empty() {
            return Err(GpuError::LiveGeneration(self.generation));
        }
        if generation < self.generation {
            return Err(GpuError::StaleGeneration { found: generation, current: self.generation });
        }
        self.generation = generation;
        self.slots = slots;
        Ok(())
    }

    pub fn get(&self, frame: FrameIndex) -> Result<&T> {
        if frame.generation != self.generation {
            return Err(GpuError::StaleGeneration {
                found: frame.generation,
                current: self.generation,
            });
        }
        self.slots.get(frame.index as usize).ok_or(GpuError::NoSuchFrame {
            index: frame.index,
            generation: frame.generation,
        })
    }

    /// Issue a handle for slot `index` of the current generation.
    pub fn frame(&self, index: u32) -> Result<FrameIndex> {
        if (index as usize) < self.slots.len() {
            Ok(FrameIndex { index, generation: self.generation })
        } else {
            Err(GpuError::NoSuchFrame { index, generation: self.generation })
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Take every slot out, leaving the table empty at the same generation.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.slots)
    }
}
