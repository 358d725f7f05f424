//! Host Arena
//!
//! A bump allocator over a growable, offset-addressed byte region. Storage is
//! reserved logically up front and committed in page-rounded steps as pushes
//! cross the committed boundary:
//!
//! ```text
//!  0               offset           commit_pos                  reserve_size
//!  |#### in use ####|---- committed ----|........ reserved ..........|
//! ```
//!
//! Allocations are never freed individually. Memory is reclaimed by
//! [`HostArena::reset`] or by rewinding to a checkpoint, which invalidates
//! every span pushed after the checkpoint was taken.
//!
//! Pushes hand out typed [`ArenaSpan`]s (offset + length) rather than
//! addresses. Element access goes through [`HostArena::with_mut`] and
//! friends, which reinterpret the committed bytes via `bytemuck`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::errors::{FloeError, Result};

/// Platform page size commits are rounded to.
pub const PAGE_SIZE: usize = 4096;
/// Default reservation ceiling (1 GiB).
pub const DEFAULT_RESERVE_SIZE: usize = 1 << 30;
/// Default commit granularity (4 KiB).
pub const DEFAULT_COMMIT_SIZE: usize = 4 << 10;
/// Largest element alignment a typed span may require.
pub const MAX_VIEW_ALIGN: usize = 16;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing of a host arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    /// Hard ceiling in bytes; pushes past it fail.
    pub reserve_size: usize,
    /// Growth granularity in bytes, rounded up to [`PAGE_SIZE`].
    pub commit_size: usize,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            reserve_size: DEFAULT_RESERVE_SIZE,
            commit_size: DEFAULT_COMMIT_SIZE,
        }
    }
}

/// Process-unique identity of a [`HostArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C, align(16))]
struct Block([u8; MAX_VIEW_ALIGN]);

/// A typed region inside a [`HostArena`].
pub struct ArenaSpan<T> {
    arena: ArenaId,
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaSpan<T> {
    fn new(arena: ArenaId, offset: usize, len: usize) -> Self {
        Self {
            arena,
            offset,
            len,
            _marker: PhantomData,
        }
    }

    /// Arena this span was pushed from.
    #[inline]
    #[must_use]
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    /// Byte offset from the arena base.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of `T` elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// One past the last byte of the span.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.byte_len()
    }
}

impl<T> Clone for ArenaSpan<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaSpan<T> {}

impl<T> PartialEq for ArenaSpan<T> {
    fn eq(&self, other: &Self) -> bool {
        self.arena == other.arena && self.offset == other.offset && self.len == other.len
    }
}

impl<T> Eq for ArenaSpan<T> {}

impl<T> fmt::Debug for ArenaSpan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaSpan")
            .field("type", &std::any::type_name::<T>())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A saved cursor position. Consumed by [`HostArena::checkpoint_end`].
#[derive(Debug)]
#[must_use = "a checkpoint must be released with `checkpoint_end`"]
pub struct ArenaCheckpoint {
    arena: ArenaId,
    offset: usize,
    depth: usize,
}

impl ArenaCheckpoint {
    /// Cursor value the arena returns to on release.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Bump allocator with reserve/commit growth and checkpoint rewind.
///
/// All operations take `&self`; the arena is single-threaded (`!Sync`) and
/// uses interior mutability so that nested helpers can push while an outer
/// scope still holds spans.
pub struct HostArena {
    id: ArenaId,
    storage: RefCell<Vec<Block>>,
    offset: Cell<usize>,
    commit_pos: Cell<usize>,
    commit_size: usize,
    reserve_size: usize,
    depth: Cell<usize>,
}

impl HostArena {
    /// Reserve `reserve_size` bytes and commit the first `commit_size`
    /// (rounded up to the page size).
    #[must_use]
    pub fn new(reserve_size: usize, commit_size: usize) -> Self {
        assert!(reserve_size > 0, "host arena reserve size must be non-zero");
        let commit_size = commit_size.max(1).next_multiple_of(PAGE_SIZE);

        let arena = Self {
            id: ArenaId(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed)),
            storage: RefCell::new(Vec::new()),
            offset: Cell::new(0),
            commit_pos: Cell::new(0),
            commit_size,
            reserve_size,
            depth: Cell::new(0),
        };
        arena.commit_to(commit_size.min(reserve_size));
        arena
    }

    #[must_use]
    pub fn with_settings(settings: &ArenaSettings) -> Self {
        Self::new(settings.reserve_size, settings.commit_size)
    }

    fn commit_to(&self, pos: usize) {
        let blocks = pos.div_ceil(MAX_VIEW_ALIGN);
        let mut storage = self.storage.borrow_mut();
        if blocks > storage.len() {
            storage.resize(blocks, Block::zeroed());
        }
        log::trace!("Arena {:?} committed {} -> {} bytes", self.id, self.commit_pos.get(), pos);
        self.commit_pos.set(pos);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Push `size` zeroed bytes aligned to `align`.
    ///
    /// Fails with [`FloeError::ArenaExhausted`] when the aligned end would
    /// cross the reservation.
    pub fn push_bytes(&self, size: usize, align: usize) -> Result<ArenaSpan<u8>> {
        assert!(
            align.is_power_of_two(),
            "arena alignment must be a power of two, got {align}"
        );
        let exhausted = || FloeError::ArenaExhausted {
            requested: size,
            reserve: self.reserve_size,
        };

        let start = self
            .offset
            .get()
            .checked_next_multiple_of(align)
            .ok_or_else(exhausted)?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.reserve_size)
            .ok_or_else(exhausted)?;

        if end > self.commit_pos.get() {
            let target = end
                .checked_next_multiple_of(self.commit_size)
                .map_or(self.reserve_size, |pos| pos.min(self.reserve_size));
            self.commit_to(target);
        }

        {
            let mut storage = self.storage.borrow_mut();
            bytemuck::cast_slice_mut::<Block, u8>(&mut storage)[start..end].fill(0);
        }
        self.offset.set(end);
        Ok(ArenaSpan::new(self.id, start, size))
    }

    /// Push `count` zeroed elements of `T`.
    pub fn push<T: Pod>(&self, count: usize) -> Result<ArenaSpan<T>> {
        let align = std::mem::align_of::<T>();
        assert!(
            align <= MAX_VIEW_ALIGN,
            "{} requires {align}-byte alignment, arenas support at most {MAX_VIEW_ALIGN}",
            std::any::type_name::<T>()
        );
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(FloeError::ArenaExhausted {
                requested: usize::MAX,
                reserve: self.reserve_size,
            })?;
        let span = self.push_bytes(bytes, align)?;
        Ok(ArenaSpan::new(self.id, span.offset, count))
    }

    /// Push a copy of `values`.
    pub fn push_slice<T: Pod>(&self, values: &[T]) -> Result<ArenaSpan<T>> {
        let span = self.push::<T>(values.len())?;
        self.with_mut(span, |dst| dst.copy_from_slice(values));
        Ok(span)
    }

    // ========================================================================
    // Access
    // ========================================================================

    fn check_span<T>(&self, span: &ArenaSpan<T>) {
        assert_eq!(span.arena, self.id, "span belongs to a different arena");
        assert!(
            span.end() <= self.offset.get(),
            "span {span:?} was invalidated by a reset or rewind"
        );
    }

    /// Mutable access to the elements of `span`.
    ///
    /// The closure must not re-enter this arena's accessors.
    pub fn with_mut<T: Pod, R>(&self, span: ArenaSpan<T>, f: impl FnOnce(&mut [T]) -> R) -> R {
        self.check_span(&span);
        let mut storage = self.storage.borrow_mut();
        let bytes = &mut bytemuck::cast_slice_mut::<Block, u8>(&mut storage)[span.offset..span.end()];
        f(bytemuck::cast_slice_mut(bytes))
    }

    /// Shared access to the elements of `span`.
    pub fn with<T: Pod, R>(&self, span: ArenaSpan<T>, f: impl FnOnce(&[T]) -> R) -> R {
        self.check_span(&span);
        let storage = self.storage.borrow();
        let bytes = &bytemuck::cast_slice::<Block, u8>(&storage)[span.offset..span.end()];
        f(bytemuck::cast_slice(bytes))
    }

    #[must_use]
    pub fn to_vec<T: Pod>(&self, span: ArenaSpan<T>) -> Vec<T> {
        self.with(span, <[T]>::to_vec)
    }

    #[inline]
    #[must_use]
    pub fn get<T: Pod>(&self, span: ArenaSpan<T>, index: usize) -> T {
        self.with(span, |values| values[index])
    }

    // ========================================================================
    // Reclaim
    // ========================================================================

    /// Rewind the cursor to the base. Committed memory is kept.
    pub fn reset(&self) {
        assert_eq!(
            self.depth.get(),
            0,
            "host arena reset while checkpoints are outstanding"
        );
        self.offset.set(0);
    }

    /// Save the cursor.
    pub fn checkpoint_begin(&self) -> ArenaCheckpoint {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        ArenaCheckpoint {
            arena: self.id,
            offset: self.offset.get(),
            depth,
        }
    }

    /// Restore the cursor saved by `checkpoint`.
    ///
    /// Checkpoints must be released in reverse order of acquisition.
    pub fn checkpoint_end(&self, checkpoint: ArenaCheckpoint) {
        assert_eq!(checkpoint.arena, self.id, "checkpoint belongs to a different arena");
        assert_eq!(
            checkpoint.depth,
            self.depth.get(),
            "host arena checkpoints must be released in LIFO order"
        );
        self.rewind(&checkpoint);
    }

    fn rewind(&self, checkpoint: &ArenaCheckpoint) {
        self.offset.set(checkpoint.offset);
        self.depth.set(checkpoint.depth - 1);
    }

    /// Scoped checkpoint that rewinds when dropped.
    pub fn temp(&self) -> TempArena<'_> {
        TempArena {
            arena: self,
            checkpoint: Some(self.checkpoint_begin()),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Next free byte.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset.get()
    }

    /// Bytes physically backed.
    #[inline]
    #[must_use]
    pub fn commit_pos(&self) -> usize {
        self.commit_pos.get()
    }

    #[inline]
    #[must_use]
    pub fn commit_size(&self) -> usize {
        self.commit_size
    }

    #[inline]
    #[must_use]
    pub fn reserve_size(&self) -> usize {
        self.reserve_size
    }

    /// Number of outstanding checkpoints.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.get()
    }
}

impl Default for HostArena {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVE_SIZE, DEFAULT_COMMIT_SIZE)
    }
}

impl fmt::Debug for HostArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArena")
            .field("id", &self.id)
            .field("offset", &self.offset.get())
            .field("commit_pos", &self.commit_pos.get())
            .field("commit_size", &self.commit_size)
            .field("reserve_size", &self.reserve_size)
            .field("depth", &self.depth.get())
            .finish()
    }
}

/// A checkpoint scope over a [`HostArena`]; rewinds on drop.
pub struct TempArena<'a> {
    arena: &'a HostArena,
    checkpoint: Option<ArenaCheckpoint>,
}

impl TempArena<'_> {
    /// The arena this scope allocates from.
    #[inline]
    #[must_use]
    pub fn arena(&self) -> &HostArena {
        self.arena
    }
}

impl Deref for TempArena<'_> {
    type Target = HostArena;

    fn deref(&self) -> &Self::Target {
        self.arena
    }
}

impl Drop for TempArena<'_> {
    fn drop(&mut self) {
        if let Some(checkpoint) = self.checkpoint.take() {
            // Never double-panic while unwinding through a scope.
            if std::thread::panicking() {
                self.arena.rewind(&checkpoint);
            } else {
                self.arena.checkpoint_end(checkpoint);
            }
        }
    }
}

impl fmt::Debug for TempArena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempArena")
            .field("arena", &self.arena.id)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_commit_is_page_rounded() {
        let arena = HostArena::new(1 << 20, 100);
        assert_eq!(arena.commit_size(), PAGE_SIZE);
        assert_eq!(arena.commit_pos(), PAGE_SIZE);
        assert_eq!(arena.offset(), 0);
    }

    #[test]
    fn commit_never_exceeds_small_reserve() {
        let arena = HostArena::new(1000, PAGE_SIZE);
        assert_eq!(arena.commit_pos(), 1000);
        arena.push_bytes(1000, 1).unwrap();
        assert!(arena.push_bytes(1, 1).is_err());
        assert_eq!(arena.offset(), 1000);
    }

    #[test]
    fn push_grows_commit_in_granularity_steps() {
        let arena = HostArena::new(1 << 20, PAGE_SIZE);
        arena.push_bytes(PAGE_SIZE + 1, 1).unwrap();
        assert_eq!(arena.commit_pos(), 2 * PAGE_SIZE);
    }

    #[test]
    fn push_zeroes_reused_memory() {
        let arena = HostArena::new(1 << 16, PAGE_SIZE);
        let span = arena.push::<u32>(8).unwrap();
        arena.with_mut(span, |values| values.fill(0xDEAD_BEEF));
        arena.reset();

        let again = arena.push::<u32>(8).unwrap();
        assert_eq!(again.offset(), span.offset());
        assert!(arena.to_vec(again).iter().all(|&v| v == 0));
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    fn out_of_order_checkpoint_release_panics() {
        let arena = HostArena::new(1 << 16, PAGE_SIZE);
        let outer = arena.checkpoint_begin();
        let _inner = arena.checkpoint_begin();
        arena.checkpoint_end(outer);
    }

    #[test]
    #[should_panic(expected = "invalidated")]
    fn stale_span_access_panics() {
        let arena = HostArena::new(1 << 16, PAGE_SIZE);
        let span = {
            let temp = arena.temp();
            temp.push::<u64>(4).unwrap()
        };
        let _ = arena.to_vec(span);
    }
}
