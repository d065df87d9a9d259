use core::marker::PhantomData;
use core::ptr::NonNull;
use std::cell::UnsafeCell;

use object::Cell;

use crate::Runtime;

pub const ROOT_CHUNK_CAPACITY: usize = 16;

type Chunk = [Cell; ROOT_CHUNK_CAPACITY];

/// Slots owned by one live [`RootFrame`].
///
/// Slots live in boxed chunks so a [`Root`] can point straight at its slot
/// while frames come and go around it.
struct FrameSlots {
    len: usize,
    chunks: Vec<Box<Chunk>>,
}

impl FrameSlots {
    fn slot(&mut self, index: usize) -> *mut Cell {
        let chunk = &mut self.chunks[index / ROOT_CHUNK_CAPACITY];
        &mut chunk[index % ROOT_CHUNK_CAPACITY]
    }
}

/// LIFO stack of root frames.
///
/// The collector walks it as the root set for references held by native
/// runtime code. Owned by the [`Runtime`] behind a `Box` so frames can keep
/// a stable pointer to it.
pub struct RootStack {
    frames: UnsafeCell<Vec<FrameSlots>>,
    /// Chunks of popped frames, reused by the next push.
    spare: UnsafeCell<Vec<Box<Chunk>>>,
}

impl RootStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: UnsafeCell::new(Vec::new()),
            spare: UnsafeCell::new(Vec::new()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn frames(&self) -> &mut Vec<FrameSlots> {
        // SAFETY: single mutator; no method holds this borrow across a call
        // that could reach it again
        unsafe { &mut *self.frames.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn spare(&self) -> &mut Vec<Box<Chunk>> {
        // SAFETY: see `frames`
        unsafe { &mut *self.spare.get() }
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.frames().len()
    }

    /// Number of registered roots across all live frames.
    pub fn root_count(&self) -> usize {
        self.frames().iter().map(|frame| frame.len).sum()
    }

    fn push(&self) -> usize {
        let frames = self.frames();
        frames.push(FrameSlots {
            len: 0,
            chunks: Vec::new(),
        });
        frames.len() - 1
    }

    fn pop(&self, index: usize) {
        let frames = self.frames();
        assert_eq!(
            frames.len().checked_sub(1),
            Some(index),
            "RootFrame popped out of LIFO order"
        );
        let Some(frame) = frames.pop() else {
            unreachable!()
        };
        self.spare().extend(frame.chunks);
    }

    fn register(&self, index: usize, cell: Cell) -> NonNull<Cell> {
        let frame = &mut self.frames()[index];
        let slot_index = frame.len;
        if slot_index == frame.chunks.len() * ROOT_CHUNK_CAPACITY {
            let chunk = self
                .spare()
                .pop()
                .unwrap_or_else(|| Box::new([Cell::NONE; ROOT_CHUNK_CAPACITY]));
            frame.chunks.push(chunk);
        }
        frame.len += 1;
        let slot = frame.slot(slot_index);
        // SAFETY: slot points into a chunk owned by this frame
        unsafe {
            slot.write(cell);
            NonNull::new_unchecked(slot)
        }
    }

    /// Visit every root of every live frame, innermost frame first.
    ///
    /// The visitor may rewrite a root in place; [`Root::get`] observes the
    /// new value afterwards.
    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Cell)) {
        for frame in self.frames.get_mut().iter_mut().rev() {
            for index in 0..frame.len {
                // SAFETY: index < len, so the slot is initialized
                visitor(unsafe { &mut *frame.slot(index) });
            }
        }
    }
}

/// Stack-scoped group of roots.
///
/// Pushed by [`RootFrame::new`], popped when dropped. Frames must be dropped
/// in reverse order of creation; anything else is fatal. A frame must not
/// outlive the runtime it was created from.
pub struct RootFrame {
    stack: NonNull<RootStack>,
    index: usize,
}

/// A copyable, frame-bounded root.
///
/// Points at a slot of its frame, not at the object: the collector rewrites
/// the slot when the referent moves, so [`Root::get`] always returns the
/// current address.
pub struct Root<'frame> {
    slot: NonNull<Cell>,
    _frame: PhantomData<&'frame RootFrame>,
}

impl Clone for Root<'_> {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for Root<'_> {}

impl RootFrame {
    #[inline]
    pub fn new(runtime: &Runtime) -> Self {
        Self::on(runtime.root_stack())
    }

    #[inline]
    pub fn on(stack: &RootStack) -> Self {
        let index = stack.push();
        Self {
            stack: NonNull::from(stack),
            index,
        }
    }

    #[inline(always)]
    fn stack(&self) -> &RootStack {
        // SAFETY: the stack outlives every frame pushed onto it
        unsafe { self.stack.as_ref() }
    }

    /// Register `cell` as a root for the lifetime of this frame.
    #[inline]
    pub fn register(&self, cell: Cell) -> Root<'_> {
        Root {
            slot: self.stack().register(self.index, cell),
            _frame: PhantomData,
        }
    }

    /// Number of roots registered in this frame.
    pub fn len(&self) -> usize {
        self.stack().frames()[self.index].len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RootFrame {
    fn drop(&mut self) {
        self.stack().pop(self.index);
    }
}

impl Root<'_> {
    #[inline(always)]
    pub fn get(&self) -> Cell {
        // SAFETY: the slot lives as long as the frame borrowed by 'frame
        unsafe { self.slot.as_ptr().read() }
    }

    #[inline(always)]
    pub fn set(&self, cell: Cell) {
        // SAFETY: see `get`
        unsafe { self.slot.as_ptr().write(cell) }
    }
}

impl core::fmt::Debug for Root<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Root({:?})", self.get())
    }
}
