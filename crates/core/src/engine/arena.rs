//! Refcounted slot arena backing every wrapper handle.
//!
//! Handles are opaque u64s packing a slot index and a generation counter.
//! A handle is only ever handed across the wrapper boundary; nothing outside
//! the engine dereferences slot storage directly. Slots are recycled, and the
//! generation check turns any access through an outdated handle into a typed
//! error instead of a read of the new occupant.

use crate::error::{Error, Result};

/// Opaque resource handle. Zero is the null handle and never names a slot.
pub type RawHandle = u64;

pub const NULL_HANDLE: RawHandle = 0;

#[inline]
fn pack(index: u32, generation: u32) -> RawHandle {
    ((generation as u64) << 32) | (index as u64 + 1)
}

#[inline]
fn unpack(handle: RawHandle) -> Option<(u32, u32)> {
    let low = (handle & 0xffff_ffff) as u32;
    if low == 0 {
        return None;
    }
    Some((low - 1, (handle >> 32) as u32))
}

enum Slot<T> {
    Vacant { next_free: Option<u32> },
    Occupied { refcount: u32, value: T },
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

/// Generational arena with per-slot reference counts.
///
/// `insert` hands out a handle owning one reference; `retain`/`release`
/// adjust the count, and the payload is returned from the `release` that
/// drops it to zero so the caller can cascade into child handles.
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        Arena {
            entries: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        self.live += 1;
        if let Some(index) = self.free_head {
            let entry = &mut self.entries[index as usize];
            self.free_head = match entry.slot {
                Slot::Vacant { next_free } => next_free,
                Slot::Occupied { .. } => None,
            };
            entry.slot = Slot::Occupied {
                refcount: 1,
                value,
            };
            return pack(index, entry.generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Occupied {
                refcount: 1,
                value,
            },
        });
        pack(index, 0)
    }

    fn entry(&self, handle: RawHandle) -> Result<&Entry<T>> {
        let (index, generation) =
            unpack(handle).ok_or(Error::StaleHandle("null"))?;
        let entry = self
            .entries
            .get(index as usize)
            .ok_or(Error::StaleHandle("resource"))?;
        if entry.generation != generation {
            return Err(Error::StaleHandle("resource"));
        }
        Ok(entry)
    }

    pub fn get(&self, handle: RawHandle) -> Result<&T> {
        match &self.entry(handle)?.slot {
            Slot::Occupied { value, .. } => Ok(value),
            Slot::Vacant { .. } => Err(Error::StaleHandle("resource")),
        }
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Result<&mut T> {
        let (index, generation) =
            unpack(handle).ok_or(Error::StaleHandle("null"))?;
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(Error::StaleHandle("resource"))?;
        if entry.generation != generation {
            return Err(Error::StaleHandle("resource"));
        }
        match &mut entry.slot {
            Slot::Occupied { value, .. } => Ok(value),
            Slot::Vacant { .. } => Err(Error::StaleHandle("resource")),
        }
    }

    pub fn refcount(&self, handle: RawHandle) -> Result<u32> {
        match self.entry(handle)?.slot {
            Slot::Occupied { refcount, .. } => Ok(refcount),
            Slot::Vacant { .. } => Err(Error::StaleHandle("resource")),
        }
    }

    /// Adds one reference, returning the new count.
    pub fn retain(&mut self, handle: RawHandle) -> Result<u32> {
        let (index, generation) =
            unpack(handle).ok_or(Error::StaleHandle("null"))?;
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(Error::StaleHandle("resource"))?;
        if entry.generation != generation {
            return Err(Error::StaleHandle("resource"));
        }
        match &mut entry.slot {
            Slot::Occupied { refcount, .. } => {
                *refcount += 1;
                Ok(*refcount)
            }
            Slot::Vacant { .. } => Err(Error::StaleHandle("resource")),
        }
    }

    /// Drops one reference. Returns the payload when the count reaches zero;
    /// the slot is vacated and its generation bumped so the handle (and any
    /// copy of it) goes stale immediately.
    pub fn release(&mut self, handle: RawHandle) -> Result<Option<T>> {
        let (index, generation) =
            unpack(handle).ok_or(Error::StaleHandle("null"))?;
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(Error::StaleHandle("resource"))?;
        if entry.generation != generation {
            return Err(Error::StaleHandle("resource"));
        }
        match &mut entry.slot {
            Slot::Occupied { refcount, .. } if *refcount > 1 => {
                *refcount -= 1;
                Ok(None)
            }
            Slot::Occupied { .. } => {
                let old = std::mem::replace(
                    &mut entry.slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                    },
                );
                entry.generation = entry.generation.wrapping_add(1);
                self.free_head = Some(index);
                self.live -= 1;
                match old {
                    Slot::Occupied { value, .. } => Ok(Some(value)),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            Slot::Vacant { .. } => Err(Error::StaleHandle("resource")),
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena::new()
    }
}
