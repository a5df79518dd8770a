// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handle registries.
//!
//! A [`HandleTable`] maps small non-negative integers to owned entries. The
//! kernel keeps two of them: the thread table (entries are thread control
//! blocks, owned by value) and the named-object table (entries are
//! `Arc<KObject>`, so a looked-up object survives a concurrent `free`).
//!
//! The table is a two-level sparse array: a vector of block pointers, each
//! block holding a fixed number of slots. Released handles go on a free list
//! that is kept sorted so the *lowest* free number is reused first -- small
//! systems end up with dense low handles, and handle 0 / handle 1 are always
//! the idle and init threads after boot.

use abi::{ErrorCode, Handle, KResult};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Slots per block. A block is allocated the first time a handle inside it
/// is reserved.
pub const BLOCK_SLOTS: usize = 32;

/// Upper bound on table growth; `alloc` fails with `NoMemory` past this.
const MAX_BLOCKS: usize = 64;

enum Slot<T> {
    Free,
    /// Allocated but not yet populated by `set`.
    Reserved,
    Occupied(T),
}

impl<T> Slot<T> {
    fn as_ref(&self) -> Option<&T> {
        match self {
            Slot::Occupied(v) => Some(v),
            _ => None,
        }
    }
}

struct Block<T> {
    slots: [Slot<T>; BLOCK_SLOTS],
}

impl<T> Block<T> {
    fn new() -> KResult<Box<Self>> {
        // Fixed-size array of a non-Copy type; build it by hand.
        let mut slots = Vec::new();
        slots.try_reserve_exact(BLOCK_SLOTS).map_err(|_| ErrorCode::NoMemory)?;
        for _ in 0..BLOCK_SLOTS {
            slots.push(Slot::Free);
        }
        let boxed: Box<[Slot<T>; BLOCK_SLOTS]> = slots
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| panic!("block size mismatch"));
        Ok(Box::new(Block { slots: *boxed }))
    }
}

pub struct HandleTable<T> {
    blocks: Vec<Option<Box<Block<T>>>>,
    /// Released handles, sorted descending so `pop` yields the lowest.
    free_list: Vec<i32>,
    /// First handle value never yet allocated.
    high_water: i32,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free_list: Vec::new(),
            high_water: 0,
        }
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        if !handle.is_valid() {
            return None;
        }
        let index = handle.index();
        self.blocks
            .get(index / BLOCK_SLOTS)?
            .as_ref()
            .map(|b| &b.slots[index % BLOCK_SLOTS])
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot<T>> {
        if !handle.is_valid() {
            return None;
        }
        let index = handle.index();
        self.blocks
            .get_mut(index / BLOCK_SLOTS)?
            .as_mut()
            .map(|b| &mut b.slots[index % BLOCK_SLOTS])
    }

    /// Reserves an unused handle. The slot stays empty until `set`; `get`
    /// on a reserved handle returns `None`.
    pub fn alloc(&mut self) -> KResult<Handle> {
        if let Some(value) = self.free_list.pop() {
            let handle = Handle(value);
            *self.slot_mut(handle).expect("free list entry out of range") =
                Slot::Reserved;
            return Ok(handle);
        }

        let index = self.high_water as usize;
        let block_index = index / BLOCK_SLOTS;
        if block_index >= MAX_BLOCKS {
            return Err(ErrorCode::NoMemory);
        }
        if block_index >= self.blocks.len() {
            self.blocks
                .try_reserve(block_index + 1 - self.blocks.len())
                .map_err(|_| ErrorCode::NoMemory)?;
            while self.blocks.len() <= block_index {
                self.blocks.push(None);
            }
        }
        if self.blocks[block_index].is_none() {
            self.blocks[block_index] = Some(Block::new()?);
        }

        self.high_water += 1;
        let handle = Handle(index as i32);
        *self.slot_mut(handle).expect("fresh slot missing") = Slot::Reserved;
        Ok(handle)
    }

    /// Installs `value` at `handle`, releasing any previous entry.
    ///
    /// # Panics
    ///
    /// If `handle` was never allocated. Passing a made-up handle here is a
    /// kernel bug, not a recoverable condition.
    pub fn set(&mut self, handle: Handle, value: T) {
        let slot = self.slot_mut(handle).expect("set on unallocated handle");
        match slot {
            Slot::Free => panic!("set on freed handle"),
            _ => *slot = Slot::Occupied(value),
        }
    }

    /// Reserves a handle and installs `value` in one step.
    pub fn insert(&mut self, value: T) -> KResult<Handle> {
        let handle = self.alloc()?;
        self.set(handle, value);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slot_mut(handle)? {
            Slot::Occupied(v) => Some(v),
            _ => None,
        }
    }

    /// Removes the entry at `handle` and returns it. A second `free` of the
    /// same handle returns `None`; callers surface that as `InvalidArg`.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        let value = match core::mem::replace(slot, Slot::Free) {
            Slot::Occupied(v) => Some(v),
            Slot::Reserved => None,
            Slot::Free => {
                return None;
            }
        };
        // Keep the free list sorted descending so the lowest number is
        // reused first.
        let pos = self
            .free_list
            .binary_search_by(|other| handle.0.cmp(other))
            .unwrap_or_else(|p| p);
        self.free_list.insert(pos, handle.0);
        value
    }

    /// Iterates entries in handle order, starting after `prev` (pass
    /// `Handle::INVALID` to start from the beginning), skipping entries for
    /// which `filter` returns false.
    pub fn get_next(
        &self,
        prev: Handle,
        mut filter: impl FnMut(&T) -> bool,
    ) -> Option<(Handle, &T)> {
        let start = if prev.is_valid() { prev.0 + 1 } else { 0 };
        for value in start..self.high_water {
            let handle = Handle(value);
            if let Some(entry) = self.get(handle) {
                if filter(entry) {
                    return Some((handle, entry));
                }
            }
        }
        None
    }

    /// Number of occupied slots. O(allocated); used by tests and the debug
    /// surface only.
    pub fn count(&self) -> usize {
        (0..self.high_water)
            .filter(|&v| self.get(Handle(v)).is_some())
            .count()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_count_up_from_zero() {
        let mut table = HandleTable::new();
        for expected in 0..5 {
            let h = table.insert(expected).unwrap();
            assert_eq!(h, Handle(expected));
        }
    }

    #[test]
    fn lowest_freed_handle_is_reused_first() {
        let mut table = HandleTable::new();
        for i in 0..6 {
            table.insert(i).unwrap();
        }
        assert!(table.free(Handle(4)).is_some());
        assert!(table.free(Handle(1)).is_some());
        assert!(table.free(Handle(3)).is_some());

        assert_eq!(table.alloc().unwrap(), Handle(1));
        assert_eq!(table.alloc().unwrap(), Handle(3));
        assert_eq!(table.alloc().unwrap(), Handle(4));
        assert_eq!(table.alloc().unwrap(), Handle(6));
    }

    #[test]
    fn double_free_loses_the_race() {
        let mut table = HandleTable::new();
        let h = table.insert("x").unwrap();
        assert!(table.free(h).is_some());
        assert!(table.free(h).is_none());
    }

    #[test]
    fn get_on_reserved_slot_is_none() {
        let mut table: HandleTable<u32> = HandleTable::new();
        let h = table.alloc().unwrap();
        assert!(table.get(h).is_none());
        table.set(h, 7);
        assert_eq!(table.get(h), Some(&7));
    }

    #[test]
    fn invalid_handle_never_resolves() {
        let table: HandleTable<u32> = HandleTable::new();
        assert!(table.get(Handle::INVALID).is_none());
        assert!(table.get(Handle(12345)).is_none());
    }

    #[test]
    fn get_next_walks_in_handle_order_with_filter() {
        let mut table = HandleTable::new();
        for i in 0..10 {
            table.insert(i).unwrap();
        }
        table.free(Handle(2)).unwrap();

        let mut seen = alloc::vec::Vec::new();
        let mut prev = Handle::INVALID;
        while let Some((h, &v)) = table.get_next(prev, |&v| v % 2 == 1) {
            seen.push(v);
            prev = h;
        }
        assert_eq!(seen, [1, 3, 5, 7, 9]);
    }

    #[test]
    fn growth_spans_blocks() {
        let mut table = HandleTable::new();
        for i in 0..(BLOCK_SLOTS as i32 * 3) {
            assert_eq!(table.insert(i).unwrap(), Handle(i));
        }
        assert_eq!(table.count(), BLOCK_SLOTS * 3);
        assert_eq!(table.get(Handle(70)), Some(&70));
    }

    #[test]
    fn arc_entries_outlive_free() {
        use alloc::sync::Arc;
        let mut table = HandleTable::new();
        let h = table.insert(Arc::new(42u32)).unwrap();
        let held = table.get(h).unwrap().clone();
        assert!(table.free(h).is_some());
        // The registry entry is gone but the strong reference keeps the
        // object alive.
        assert!(table.get(h).is_none());
        assert_eq!(*held, 42);
    }
}
