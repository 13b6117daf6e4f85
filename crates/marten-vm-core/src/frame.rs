//! Call frames and variable references
//!
//! A frame owns the argument and local buffers for one activation. A
//! `VarRef` is a heap cell that either points into a live frame (open) or
//! owns its value (closed). The transition is monotonic: when a frame
//! unwinds, every `VarRef` still referring to one of its slots is closed
//! over the slot's current value.

use std::cell::RefCell;

use marten_vm_gc::{GcAny, GcRef, Trace};

use crate::value::Value;

/// Open/closed state of a variable cell.
pub enum VarRefState {
    /// Points at `locals[slot]` of the frame at stack depth `frame`
    Open {
        /// Stack depth of the owning frame
        frame: usize,
        /// Index into the frame's combined arg+local buffer
        slot: usize,
    },
    /// Owns its value
    Closed(Value),
}

/// A closure/module variable cell (GC kind `VarRef`).
pub struct VarRef {
    state: RefCell<VarRefState>,
}

impl Trace for VarRef {
    fn trace(&self, mark: &mut dyn FnMut(GcAny)) {
        if let VarRefState::Closed(v) = &*self.state.borrow() {
            v.trace(mark);
        }
    }
}

impl VarRef {
    /// A cell still pointing into a live frame.
    pub fn new_open(frame: usize, slot: usize) -> VarRef {
        VarRef {
            state: RefCell::new(VarRefState::Open { frame, slot }),
        }
    }

    /// A cell born closed (module bindings).
    pub fn new_closed(value: Value) -> VarRef {
        VarRef {
            state: RefCell::new(VarRefState::Closed(value)),
        }
    }

    /// True while the cell points into a frame.
    pub fn is_open(&self) -> bool {
        matches!(&*self.state.borrow(), VarRefState::Open { .. })
    }

    /// Open-state coordinates, if open.
    pub fn open_slot(&self) -> Option<(usize, usize)> {
        match &*self.state.borrow() {
            VarRefState::Open { frame, slot } => Some((*frame, *slot)),
            VarRefState::Closed(_) => None,
        }
    }

    /// Close over `value`. Open → closed only.
    pub fn close(&self, value: Value) {
        let mut state = self.state.borrow_mut();
        debug_assert!(matches!(&*state, VarRefState::Open { .. }));
        *state = VarRefState::Closed(value);
    }

    /// Read a closed cell's value.
    pub fn closed_value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            VarRefState::Closed(v) => Some(v.clone()),
            VarRefState::Open { .. } => None,
        }
    }

    /// Overwrite a closed cell (module binding initialization).
    pub fn set_closed_value(&self, value: Value) {
        *self.state.borrow_mut() = VarRefState::Closed(value);
    }
}

impl std::fmt::Debug for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.borrow() {
            VarRefState::Open { frame, slot } => write!(f, "VarRef(open {frame}:{slot})"),
            VarRefState::Closed(v) => write!(f, "VarRef(closed {v:?})"),
        }
    }
}

/// One activation on the runtime's frame stack.
pub struct Frame {
    /// The function being executed (object value)
    pub func: Value,
    /// `this` binding
    pub this: Value,
    /// Arguments followed by locals
    pub locals: Vec<Value>,
    /// How many leading `locals` entries are arguments
    pub arg_count: usize,
    /// Strict-mode activation
    pub strict: bool,
    /// Open cells whose slot lies in this frame
    pub var_refs: Vec<GcRef<VarRef>>,
}

impl Frame {
    /// Build a frame with `arg_count` arguments and `var_count` locals
    /// initialized to `undefined`.
    pub fn new(func: Value, this: Value, args: &[Value], var_count: usize, strict: bool) -> Frame {
        let mut locals = Vec::with_capacity(args.len() + var_count);
        locals.extend_from_slice(args);
        locals.resize(args.len() + var_count, Value::Undefined);
        Frame {
            func,
            this,
            locals,
            arg_count: args.len(),
            strict,
            var_refs: Vec::new(),
        }
    }

    /// Find an already-open cell for `slot`.
    pub fn find_var_ref(&self, frame_idx: usize, slot: usize) -> Option<GcRef<VarRef>> {
        self.var_refs
            .iter()
            .find(|vr| vr.open_slot() == Some((frame_idx, slot)))
            .cloned()
    }

    /// Close every cell still pointing into this frame (called on unwind).
    pub fn close_var_refs(&mut self) {
        for vr in self.var_refs.drain(..) {
            if let Some((_, slot)) = vr.open_slot() {
                let value = self.locals.get(slot).cloned().unwrap_or(Value::Undefined);
                vr.close(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let vr = VarRef::new_open(0, 2);
        assert!(vr.is_open());
        assert_eq!(vr.open_slot(), Some((0, 2)));
        vr.close(Value::Int(7));
        assert!(!vr.is_open());
        assert_eq!(vr.closed_value().unwrap().as_int(), Some(7));
    }

    #[test]
    fn test_frame_unwind_closes_cells() {
        let heap = marten_vm_gc::GcHeap::new();
        let mut frame = Frame::new(Value::Undefined, Value::Undefined, &[Value::Int(1)], 2, false);
        frame.locals[1] = Value::Int(42);
        let vr = heap.alloc(marten_vm_gc::GcKind::VarRef, VarRef::new_open(0, 1));
        frame.var_refs.push(vr.clone());
        frame.close_var_refs();
        assert!(!vr.is_open());
        assert_eq!(vr.closed_value().unwrap().as_int(), Some(42));
    }
}
