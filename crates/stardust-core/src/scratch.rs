//! Per-task scratch memory.
//!
//! Every task owns a small bump arena for allocations whose lifetime equals
//! the task's: pattern state, hosted event groups, interpolation buffers.
//! The common case is served from a fixed area with nothing but a pointer
//! bump; requests that no longer fit fall back to dedicated heap chunks,
//! which is worth a warning because it means the area constant is too small
//! for whatever the task is doing.
//!
//! Nothing is freed individually. The whole arena is released when the task
//! finalizes.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr::NonNull;

/// Size of the fixed per-task arena.
pub const SCRATCH_AREA_SIZE: usize = 4 * 1024;

/// All scratch pointers are aligned to this.
const SCRATCH_ALIGN: usize = 16;

/// Fixed area, kept 16-byte aligned so bump offsets stay aligned too.
#[repr(C, align(16))]
struct ScratchBlock([u8; SCRATCH_AREA_SIZE]);

pub(crate) struct ScratchArena {
    /// `UnsafeCell` because callers write through the returned pointers
    /// while the arena is only ever borrowed shared.
    area: Box<UnsafeCell<ScratchBlock>>,
    head: Cell<usize>,
    /// One chunk per oversized request. `u128` elements keep the chunk
    /// 16-byte aligned.
    overflow: RefCell<Vec<Box<[u128]>>>,
}

impl ScratchArena {
    pub(crate) fn new() -> Self {
        ScratchArena {
            area: Box::new(UnsafeCell::new(ScratchBlock([0; SCRATCH_AREA_SIZE]))),
            head: Cell::new(0),
            overflow: RefCell::new(Vec::new()),
        }
    }

    /// Allocate `size` bytes of zeroed, 16-byte-aligned scratch memory.
    ///
    /// The pointer stays valid until the owning task finalizes. Callers are
    /// responsible for not outliving the task with it.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub(crate) fn alloc(&self, size: usize) -> NonNull<u8> {
        assert!(size > 0, "zero-size scratch allocation");

        let aligned = size
            .checked_add(SCRATCH_ALIGN - 1)
            .expect("scratch allocation size overflow")
            & !(SCRATCH_ALIGN - 1);

        let head = self.head.get();
        let available = SCRATCH_AREA_SIZE - head;

        if aligned <= available {
            self.head.set(head + aligned);
            // Safety: head + aligned <= SCRATCH_AREA_SIZE, so the offset is in
            // bounds of the fixed area, which outlives the arena handle.
            let ptr = unsafe { self.area.get().cast::<u8>().add(head) };
            return NonNull::new(ptr).expect("scratch area pointer is null");
        }

        log::warn!(
            "scratch arena exhausted (requested {size}, {available} left), serving from the heap"
        );

        let mut overflow = self.overflow.borrow_mut();
        overflow.push(vec![0u128; aligned / 16].into_boxed_slice());
        let chunk = overflow.last_mut().expect("chunk was just pushed");
        NonNull::new(chunk.as_mut_ptr().cast::<u8>()).expect("scratch chunk pointer is null")
    }

    /// Bytes consumed from the fixed area.
    #[cfg(test)]
    pub(crate) fn bytes_used(&self) -> usize {
        self.head.get()
    }

    /// Drop every overflow chunk. Called at task finalization; any pointers
    /// into the arena are dead after this.
    pub(crate) fn release(&self) {
        self.overflow.borrow_mut().clear();
    }
}
