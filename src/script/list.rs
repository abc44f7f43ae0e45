//! Ordered instructions plus the cursor the sequencer walks.

#![allow(missing_docs)]

use crate::core::errors::{Result, RigError};
use crate::script::instruction::Instruction;

/// Instruction table for one test type. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionList {
    items: Vec<Instruction>,
    cursor: usize,
}

impl InstructionList {
    pub fn new(items: Vec<Instruction>) -> Result<Self> {
        if items.is_empty() {
            return Err(RigError::InvalidScript {
                details: "instruction list must contain at least one instruction".to_string(),
            });
        }
        Ok(Self { items, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false`; lists are built non-empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> &Instruction {
        &self.items[self.cursor]
    }

    pub fn current_mut(&mut self) -> &mut Instruction {
        &mut self.items[self.cursor]
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.items.iter()
    }

    pub fn is_last(&self) -> bool {
        self.cursor + 1 == self.items.len()
    }

    /// Move forward when the current step allows it. Never passes the last step.
    pub fn advance(&mut self) -> bool {
        let current = self.current();
        let may_leave = !current.check_required || current.is_complete();
        if may_leave && !self.is_last() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// Step back one, only onto a step whose check already completed.
    pub fn step_back(&mut self) -> bool {
        if self.cursor == 0 || !self.items[self.cursor - 1].is_complete() {
            return false;
        }
        self.cursor -= 1;
        true
    }

    pub fn all_complete(&self) -> bool {
        self.items.iter().all(Instruction::is_complete)
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_complete()).count()
    }

    /// Cursor to zero and every step's evaluation state cleared.
    pub fn reset(&mut self) {
        self.cursor = 0;
        for item in &mut self.items {
            item.reset_state();
        }
    }

    /// Operator milestones as `(index, label)`.
    pub fn checkpoints(&self) -> Vec<(usize, &str)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.checkpoint.as_deref().map(|label| (i, label)))
            .collect()
    }
}
