//! Undo/redo stacks.
//!
//! A frame holds the inverse payloads of one user-level change, in the order
//! they must be replayed. Replaying a frame produces ordinary new local
//! operations, so an undo is merged with concurrent peer edits like any other
//! write.

use crate::ids::NodeId;
use crate::op::OpPayload;
use std::collections::VecDeque;

pub const DEFAULT_MAX_DEPTH: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    ops: Vec<(NodeId, OpPayload)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the inverse of an operation applied after everything already in
    /// the frame. It has to be replayed first.
    pub fn push_inverse(&mut self, target: NodeId, payload: OpPayload) {
        self.ops.insert(0, (target, payload));
    }

    pub fn ops(&self) -> &[(NodeId, OpPayload)] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<(NodeId, OpPayload)> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug)]
pub struct History {
    undo: VecDeque<Frame>,
    redo: Vec<Frame>,
    open: Option<Frame>,
    batch_depth: usize,
    paused: bool,
    max_depth: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl History {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            open: None,
            batch_depth: 0,
            paused: false,
            max_depth: max_depth.max(1),
        }
    }

    /// Record the inverse of a local user edit. Clears the redo stack.
    pub fn record(&mut self, target: NodeId, inverse: OpPayload) {
        self.redo.clear();
        match self.open.as_mut() {
            Some(frame) => frame.push_inverse(target, inverse),
            None => {
                let mut frame = Frame::new();
                frame.push_inverse(target, inverse);
                self.push_undo_keep_redo(frame);
            }
        }
    }

    /// Start collecting edits into one frame. Batches nest.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
        self.open.get_or_insert_with(Frame::new);
    }

    pub fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.close_if_done();
    }

    /// Merge every edit until [`History::resume`] into a single frame.
    pub fn pause(&mut self) {
        self.paused = true;
        self.open.get_or_insert_with(Frame::new);
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.close_if_done();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pop_undo(&mut self) -> Option<Frame> {
        self.undo.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<Frame> {
        self.redo.pop()
    }

    pub fn push_redo(&mut self, frame: Frame) {
        if !frame.is_empty() {
            self.redo.push(frame);
        }
    }

    /// Push an undo frame produced by a redo.
    pub fn push_undo_keep_redo(&mut self, frame: Frame) {
        if frame.is_empty() {
            return;
        }
        self.undo.push_back(frame);
        while self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.open = None;
        self.batch_depth = 0;
        self.paused = false;
    }

    fn close_if_done(&mut self) {
        if self.batch_depth == 0 && !self.paused {
            if let Some(frame) = self.open.take() {
                self.push_undo_keep_redo(frame);
            }
        }
    }
}
