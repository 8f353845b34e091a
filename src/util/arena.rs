//! Generational arena for live-record tables.
//!
//! Both tables in the crate are arenas: the scheduler's table of runnable
//! task records and each cache's table of in-flight block fetches. An
//! [`ArenaIndex`] pairs a slot index with a generation counter, so a stale
//! index left behind in a block-state cell or a waker can never resolve to
//! a record that reused the slot.
//!
//! No unsafe; bounds checks plus generation validation.

use core::fmt;

/// An index into an [`Arena`], invalidated when the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Builds an index from raw parts (tests and id helpers).
    #[must_use]
    pub const fn from_parts(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// The raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// The generation this index was issued under.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// A slab of records with generation-checked indices.
#[derive(Debug, Default)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True when no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value, reusing a vacant slot when one exists.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.insert_with(|_| value)
    }

    /// Inserts the value produced by `f`, which receives the index the
    /// record will live under. Lets a record embed its own id without a
    /// placeholder update (fetch tasks use this to know which grid cells
    /// they claimed).
    pub fn insert_with<F>(&mut self, f: F) -> ArenaIndex
    where
        F: FnOnce(ArenaIndex) -> T,
    {
        self.len += 1;
        if let Some(slot) = self.free_head {
            let Slot::Vacant {
                next_free,
                generation,
            } = self.slots[slot as usize]
            else {
                unreachable!("free list pointed at occupied slot");
            };
            self.free_head = next_free;
            let index = ArenaIndex { slot, generation };
            self.slots[slot as usize] = Slot::Occupied {
                value: f(index),
                generation,
            };
            index
        } else {
            let slot = u32::try_from(self.slots.len()).expect("arena overflow");
            let index = ArenaIndex {
                slot,
                generation: 0,
            };
            self.slots.push(Slot::Occupied {
                value: f(index),
                generation: 0,
            });
            index
        }
    }

    /// Removes and returns the record at `index`, bumping the slot's
    /// generation so the index dies with the record.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == index.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = core::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(index.slot);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Returns the record at `index`, if the index is still live.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Mutable access to the record at `index`, if still live.
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// True if `index` resolves to a live record.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over live records.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Slot::Occupied { value, generation } => Some((
                    ArenaIndex {
                        slot: u32::try_from(slot).expect("arena overflow"),
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut arena = Arena::new();
        let idx = arena.insert(7);
        assert_eq!(arena.get(idx), Some(&7));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn removed_slot_is_reused_with_new_generation() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.remove(a), Some("a"));
        assert!(!arena.contains(a));

        let c = arena.insert("c");
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c.generation(), a.generation());

        // Stale index stays dead even though the slot is occupied again.
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.get(c), Some(&"c"));
    }

    #[test]
    fn insert_with_sees_final_index() {
        let mut arena = Arena::new();
        let idx = arena.insert_with(|idx| idx.slot());
        assert_eq!(arena.get(idx), Some(&idx.slot()));
    }

    #[test]
    fn double_remove_is_none() {
        let mut arena = Arena::new();
        let idx = arena.insert(1);
        assert_eq!(arena.remove(idx), Some(1));
        assert_eq!(arena.remove(idx), None);
        assert!(arena.is_empty());
    }
}
