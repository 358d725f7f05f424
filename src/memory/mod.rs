//! Host Memory
//!
//! Bump allocation for host-side transient and long-lived data:
//!
//! - [`HostArena`]: reserve/commit arena with checkpoint rewind
//! - [`ScratchPool`]: two lazily created scratch arenas with conflict exclusion

pub mod arena;
pub mod scratch;

pub use arena::{
    ArenaCheckpoint, ArenaId, ArenaSettings, ArenaSpan, HostArena, TempArena, PAGE_SIZE,
};
pub use scratch::{ScratchPool, SCRATCH_POOL_COUNT};
