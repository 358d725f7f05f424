//! Scratch Arena Pool
//!
//! A fixed set of host arenas handed out for transient, call-scoped
//! allocations. Each request returns a [`TempArena`] scope over one slot, so
//! everything pushed through it is reclaimed when the scope ends.
//!
//! A caller that is about to allocate from arena `A` while also needing
//! scratch memory passes `A`'s id as a conflict. The pool then hands out a
//! different slot, so the scratch pushes never alias memory the outer call is
//! still writing.
//!
//! Slots are created lazily on first use and live as long as the pool.

use std::cell::OnceCell;

use super::arena::{ArenaId, ArenaSettings, HostArena, TempArena};

/// Number of scratch slots.
pub const SCRATCH_POOL_COUNT: usize = 2;

/// Lazily initialised pool of scratch host arenas.
#[derive(Debug)]
pub struct ScratchPool {
    slots: [OnceCell<HostArena>; SCRATCH_POOL_COUNT],
    settings: ArenaSettings,
}

impl ScratchPool {
    #[must_use]
    pub fn new(settings: ArenaSettings) -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceCell::new()),
            settings,
        }
    }

    /// Scratch scope on the first slot.
    pub fn scratch(&self) -> TempArena<'_> {
        self.scratch_excluding(&[])
    }

    /// Scratch scope on the first slot whose arena is not in `conflicts`.
    ///
    /// # Panics
    ///
    /// Panics if `conflicts` names more arenas than there are slots, or if
    /// every slot conflicts.
    pub fn scratch_excluding(&self, conflicts: &[ArenaId]) -> TempArena<'_> {
        assert!(
            conflicts.len() <= SCRATCH_POOL_COUNT,
            "{} scratch exclusions requested, pool has {SCRATCH_POOL_COUNT} slots",
            conflicts.len()
        );

        for slot in &self.slots {
            if slot.get().is_some_and(|arena| conflicts.contains(&arena.id())) {
                continue;
            }
            let arena = slot.get_or_init(|| {
                log::debug!(
                    "Scratch arena initialised (reserve {} bytes)",
                    self.settings.reserve_size
                );
                HostArena::with_settings(&self.settings)
            });
            return arena.temp();
        }

        panic!("too many scratch conflicts: every pool slot is excluded");
    }

    /// Ids of the slots initialised so far.
    #[must_use]
    pub fn initialised(&self) -> Vec<ArenaId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.get().map(HostArena::id))
            .collect()
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(ArenaSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> ScratchPool {
        ScratchPool::new(ArenaSettings {
            reserve_size: 1 << 16,
            commit_size: 4096,
        })
    }

    #[test]
    fn slots_are_lazy() {
        let pool = small_pool();
        assert!(pool.initialised().is_empty());
        let _scratch = pool.scratch();
        assert_eq!(pool.initialised().len(), 1);
    }

    #[test]
    fn scratch_rewinds_on_drop() {
        let pool = small_pool();
        {
            let scratch = pool.scratch();
            scratch.push::<u32>(64).unwrap();
            assert_eq!(scratch.offset(), 256);
        }
        assert_eq!(pool.scratch().offset(), 0);
    }
}
