// TreeNX Objects - object and class records
//
// A class is an object whose `class_data` is present. Graph links and
// interceptor registrations are stored as handles into the arena.

use crate::method::{Guard, Method, Predicate};
use crate::types::{ClassId, ObjectId, SystemId};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Per-object state bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectFlags {
    pub destroy_called: bool,
    pub init_called: bool,
    pub mixin_order_valid: bool,
    pub mixin_order_defined: bool,
    pub filter_order_valid: bool,
    pub filter_order_defined: bool,
    pub during_delete: bool,
    pub deleted: bool,
    pub is_root_class: bool,
    pub is_root_metaclass: bool,
    /// Ensemble sub-objects with this flag run sub-methods with the caller as self
    pub keep_caller_self: bool,
}

/// Which assertions are checked for an object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    pub pre: bool,
    pub post: bool,
    pub object_invariants: bool,
    pub class_invariants: bool,
}

impl CheckOptions {
    pub fn all() -> Self {
        Self {
            pre: true,
            post: true,
            object_invariants: true,
            class_invariants: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// A mixin registration: class plus optional guard
#[derive(Debug, Clone)]
pub struct MixinReg {
    pub class: ClassId,
    pub guard: Option<Guard>,
}

impl MixinReg {
    pub fn new(class: ClassId) -> Self {
        Self { class, guard: None }
    }

    pub fn guarded(class: ClassId, guard: Guard) -> Self {
        Self {
            class,
            guard: Some(guard),
        }
    }
}

/// A filter registration: a method name resolved when the order is built
#[derive(Debug, Clone)]
pub struct FilterReg {
    pub name: String,
    pub guard: Option<Guard>,
}

impl FilterReg {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            guard: None,
        }
    }

    pub fn guarded(name: &str, guard: Guard) -> Self {
        Self {
            name: name.to_string(),
            guard: Some(guard),
        }
    }
}

/// Entry of a computed mixin order
#[derive(Debug, Clone)]
pub struct MixinEntry {
    pub class: ClassId,
    pub guard: Option<Guard>,
}

/// Entry of a computed filter order: one concrete implementation
#[derive(Debug, Clone)]
pub struct FilterEntry {
    pub name: String,
    /// Defining class; `None` for a method of the object itself
    pub cl: Option<ClassId>,
    pub method: Rc<Method>,
    pub guard: Option<Guard>,
}

impl FilterEntry {
    pub fn key(&self) -> FilterKey {
        FilterKey {
            cl: self.cl,
            name: self.name.clone(),
        }
    }
}

/// Position marker inside a filter order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterKey {
    pub cl: Option<ClassId>,
    pub name: String,
}

/// Filter position stack entry
#[derive(Debug, Clone)]
pub struct FilterStackEntry {
    pub current: Option<FilterKey>,
    /// Method originally requested by the caller
    pub called_method: String,
}

/// Object-level interceptor and assertion options
#[derive(Debug, Clone, Default)]
pub struct ObjectOptions {
    pub mixins: Vec<MixinReg>,
    pub filters: Vec<FilterReg>,
    pub check: CheckOptions,
    pub invariants: Vec<Predicate>,
}

/// Class-level options
#[derive(Debug, Clone, Default)]
pub struct ClassOptions {
    pub mixins: Vec<MixinReg>,
    pub filters: Vec<FilterReg>,
    /// Objects that use this class as per-object mixin
    pub is_object_mixin_of: Vec<ObjectId>,
    /// Classes that use this class as class mixin
    pub is_class_mixin_of: Vec<ClassId>,
    pub invariants: Vec<Predicate>,
}

/// Class-only part of an object
#[derive(Debug, Clone, Default)]
pub struct ClassRecord {
    /// Instance methods
    pub methods: BTreeMap<String, Rc<Method>>,
    /// Direct superclasses in declared order
    pub supers: Vec<ClassId>,
    /// Direct subclasses
    pub subs: Vec<ClassId>,
    /// Cached precedence order, starting with the class itself
    pub order: Option<Rc<[ClassId]>>,
    pub opt: ClassOptions,
    pub instances: BTreeSet<ObjectId>,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub class: ClassId,
    pub system: SystemId,
    /// Object-local methods; created on first definition
    pub methods: Option<BTreeMap<String, Rc<Method>>>,
    pub vars: BTreeMap<String, Value>,
    pub flags: ObjectFlags,
    pub opt: ObjectOptions,
    pub mixin_order: Option<Rc<[MixinEntry]>>,
    pub filter_order: Option<Rc<[FilterEntry]>>,
    pub mixin_stack: Vec<Option<ClassId>>,
    pub filter_stack: Vec<FilterStackEntry>,
    /// Number of call frames referencing this object
    pub refcount: u32,
    pub class_data: Option<Box<ClassRecord>>,
}

impl Object {
    pub fn new(name: &str, class: ClassId, system: SystemId) -> Self {
        Self {
            name: name.to_string(),
            class,
            system,
            methods: None,
            vars: BTreeMap::new(),
            flags: ObjectFlags::default(),
            opt: ObjectOptions::default(),
            mixin_order: None,
            filter_order: None,
            mixin_stack: Vec::new(),
            filter_stack: Vec::new(),
            refcount: 0,
            class_data: None,
        }
    }

    pub fn new_class(name: &str, metaclass: ClassId, system: SystemId) -> Self {
        let mut object = Self::new(name, metaclass, system);
        object.class_data = Some(Box::default());
        object
    }

    pub fn is_class(&self) -> bool {
        self.class_data.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.flags.is_root_class || self.flags.is_root_metaclass
    }

    pub fn method(&self, name: &str) -> Option<&Rc<Method>> {
        self.methods.as_ref().and_then(|m| m.get(name))
    }

    pub fn invalidate_mixin_order(&mut self) {
        self.flags.mixin_order_valid = false;
        self.flags.mixin_order_defined = false;
        self.mixin_order = None;
    }

    pub fn invalidate_filter_order(&mut self) {
        self.flags.filter_order_valid = false;
        self.flags.filter_order_defined = false;
        self.filter_order = None;
    }
}
