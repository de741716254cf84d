use crate::object::{ClassRecord, Object};
use crate::types::ObjectId;

enum Entry {
    Occupied { generation: u32, object: Object },
    Free { generation: u32, next: Option<u32> },
}

/// Statistics about arena usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub total_slots: usize,
    pub free_slots: usize,
    pub live: usize,
}

pub struct ObjectArena {
    slots: Vec<Entry>,
    free_head: Option<u32>,
    live: usize,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(64),
            free_head: None,
            live: 0,
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjectId {
        self.live += 1;
        match self.free_head {
            Some(idx) => {
                let entry = &mut self.slots[idx as usize];
                let (generation, next) = match entry {
                    Entry::Free { generation, next } => (generation.wrapping_add(1), *next),
                    // The free list only ever links free slots.
                    Entry::Occupied { .. } => unreachable!("corrupt free list"),
                };
                self.free_head = next;
                *entry = Entry::Occupied { generation, object };
                ObjectId {
                    index: idx,
                    generation,
                }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Entry::Occupied {
                    generation: 0,
                    object,
                });
                ObjectId {
                    index: idx,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        match self.slots.get(id.index as usize) {
            Some(Entry::Occupied { generation, object }) if *generation == id.generation => {
                Some(object)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        match self.slots.get_mut(id.index as usize) {
            Some(Entry::Occupied { generation, object }) if *generation == id.generation => {
                Some(object)
            }
            _ => None,
        }
    }

    pub fn class(&self, id: ObjectId) -> Option<&ClassRecord> {
        self.get(id).and_then(|o| o.class_data.as_deref())
    }

    pub fn class_mut(&mut self, id: ObjectId) -> Option<&mut ClassRecord> {
        self.get_mut(id).and_then(|o| o.class_data.as_deref_mut())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Reclaim a slot. The handle (and every copy of it) stops resolving.
    pub fn release(&mut self, id: ObjectId) -> Option<Object> {
        let idx = id.index as usize;
        if !self.contains(id) {
            return None;
        }
        let free = Entry::Free {
            generation: id.generation,
            next: self.free_head,
        };
        let old = std::mem::replace(&mut self.slots[idx], free);
        self.free_head = Some(id.index);
        self.live -= 1;
        match old {
            Entry::Occupied { object, .. } => Some(object),
            Entry::Free { .. } => None,
        }
    }

    #[cfg(test)]
    fn ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| match entry {
                Entry::Occupied { generation, .. } => Some(ObjectId {
                    index: idx as u32,
                    generation: *generation,
                }),
                Entry::Free { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total_slots: self.slots.len(),
            free_slots: self.slots.len() - self.live,
            live: self.live,
        }
    }
}

impl Default for ObjectArena {
    fn default() -> Self {
        Self::new()
    }
}
