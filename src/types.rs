/// Handle of an object slot: index into the arena plus the slot's generation.
/// A handle whose generation no longer matches refers to a reclaimed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub index: u32,
    pub generation: u32,
}

/// Classes are objects that additionally carry a class record.
pub type ClassId = ObjectId;

/// Identifier of an object system (root class / root metaclass pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}
