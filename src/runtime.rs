// TreeNX Runtime - per-interpreter object system context
//
// All object, class and call-stack state of one interpreter. Nothing here
// is shared between runtimes except the autoname counters.

use crate::arena::{ArenaStats, ObjectArena};
use crate::callstack::CallStack;
use crate::config::RuntimeConfig;
use crate::counters::next_autoname;
use crate::dispatch::DispatchFlags;
use crate::error::{DispatchError, Result};
use crate::graph::{add_superclass_edge, remove_superclass_edge};
use crate::interceptors::compile_pattern;
use crate::linearize::{self, dependent_subclasses, flush_orders, inherits_from, transitive_subclasses};
use crate::method::{ImplementationKind, Method, Predicate};
use crate::object::{CheckOptions, ClassRecord, Object};
use crate::types::{ClassId, ObjectId, SystemId};
use crate::value::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{debug, warn};

/// Names of the methods the runtime calls on its own
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemMethods {
    pub init: Option<String>,
    pub destroy: Option<String>,
    pub unknown: Option<String>,
    pub defaultmethod: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectSystem {
    pub id: SystemId,
    pub root_class: ClassId,
    pub root_metaclass: ClassId,
    pub methods: SystemMethods,
}

/// Fallback for calls no implementation answers. Returning `Ok(None)`
/// declines, which continues with the system `unknown` method.
pub trait UnknownHandler {
    fn unknown(
        &self,
        rt: &mut Runtime,
        object: ObjectId,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>>;
}

/// Entry of the command registry
pub(crate) struct Registration {
    /// Defining object or class; `None` for global commands
    pub owner: Option<ObjectId>,
    pub per_object: bool,
    pub method: Rc<Method>,
}

/// Where a method name resolves without interceptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodHandleInfo {
    pub definer: String,
    pub kind: ImplementationKind,
    /// Registry path of the implementation
    pub handle: String,
    pub per_object: bool,
}

fn qualify(name: &str) -> String {
    if name.starts_with("::") {
        name.to_string()
    } else {
        format!("::{}", name)
    }
}

pub struct Runtime {
    pub(crate) objects: ObjectArena,
    names: HashMap<String, ObjectId>,
    systems: Vec<ObjectSystem>,
    pub(crate) registry: BTreeMap<String, Registration>,
    /// Filter name -> objects and classes registering it
    pub(crate) filter_users: HashMap<String, BTreeSet<ObjectId>>,
    pub(crate) stack: CallStack,
    pub config: RuntimeConfig,
    pub(crate) guard_depth: usize,
    pub(crate) assertion_depth: usize,
    pub(crate) unknown_handler: Option<Rc<dyn UnknownHandler>>,
    epoch: u64,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            objects: ObjectArena::new(),
            names: HashMap::new(),
            systems: Vec::new(),
            registry: BTreeMap::new(),
            filter_users: HashMap::new(),
            stack: CallStack::new(),
            config,
            guard_depth: 0,
            assertion_depth: 0,
            unknown_handler: None,
            epoch: 0,
        }
    }

    // ---- access ----

    pub(crate) fn obj(&self, id: ObjectId) -> Result<&Object> {
        match self.objects.get(id) {
            Some(object) if !object.flags.deleted => Ok(object),
            _ => Err(DispatchError::Destroyed(id.to_string())),
        }
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        match self.objects.get_mut(id) {
            Some(object) if !object.flags.deleted => Ok(object),
            _ => Err(DispatchError::Destroyed(id.to_string())),
        }
    }

    pub(crate) fn class_rec(&self, id: ClassId) -> Result<&ClassRecord> {
        let object = self.obj(id)?;
        object
            .class_data
            .as_deref()
            .ok_or_else(|| DispatchError::Structural(format!("{} is not a class", object.name)))
    }

    pub(crate) fn class_rec_mut(&mut self, id: ClassId) -> Result<&mut ClassRecord> {
        let object = self.obj_mut(id)?;
        let name = object.name.clone();
        object
            .class_data
            .as_deref_mut()
            .ok_or_else(|| DispatchError::Structural(format!("{} is not a class", name)))
    }

    /// Name of a live object, or its handle once it is gone.
    pub fn name_of(&self, id: ObjectId) -> String {
        self.objects
            .get(id)
            .map_or_else(|| id.to_string(), |o| o.name.clone())
    }

    pub fn object_named(&self, name: &str) -> Option<ObjectId> {
        self.names.get(&qualify(name)).copied()
    }

    pub fn class_of(&self, obj: ObjectId) -> Result<ClassId> {
        Ok(self.obj(obj)?.class)
    }

    pub(crate) fn system_of(&self, id: ObjectId) -> Result<&ObjectSystem> {
        let system = self.obj(id)?.system;
        self.systems
            .get(system.0 as usize)
            .ok_or_else(|| DispatchError::Structural(format!("no object system {}", system.0)))
    }

    pub fn is_object(&self, id: ObjectId) -> bool {
        self.obj(id).is_ok()
    }

    pub fn is_class(&self, id: ObjectId) -> bool {
        self.obj(id).map_or(false, Object::is_class)
    }

    pub fn is_metaclass(&self, id: ObjectId) -> bool {
        match self.system_of(id) {
            Ok(system) if self.is_class(id) => inherits_from(&self.objects, id, system.root_metaclass),
            _ => false,
        }
    }

    pub(crate) fn is_root_class(&self, id: ClassId) -> bool {
        self.obj(id).map_or(false, Object::is_root)
    }

    /// Whether the class of `obj` is `cl` or inherits from it.
    pub fn is_instance_of(&self, obj: ObjectId, cl: ClassId) -> bool {
        self.obj(obj)
            .map_or(false, |o| inherits_from(&self.objects, o.class, cl))
    }

    pub fn precedence_order(&mut self, cl: ClassId) -> Result<Rc<[ClassId]>> {
        self.class_rec(cl)?;
        linearize::precedence_order(&mut self.objects, cl)
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.objects.stats()
    }

    pub(crate) fn class_method_path(&self, cl: ClassId, name: &str) -> String {
        format!("::classes{}::{}", qualify(&self.name_of(cl)), name)
    }

    pub(crate) fn object_method_path(&self, obj: ObjectId, name: &str) -> String {
        format!("{}::{}", qualify(&self.name_of(obj)), name)
    }

    pub(crate) fn retain(&mut self, obj: ObjectId) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.refcount += 1;
        }
    }

    /// Drop a frame reference; frees an object whose deletion was deferred.
    pub(crate) fn release_ref(&mut self, obj: ObjectId) {
        let free = match self.objects.get_mut(obj) {
            Some(object) => {
                object.refcount = object.refcount.saturating_sub(1);
                object.refcount == 0 && object.flags.deleted
            }
            None => false,
        };
        if free {
            self.objects.release(obj);
            debug!(object = %obj, "deferred release");
        }
    }

    pub fn set_unknown_handler(&mut self, handler: Rc<dyn UnknownHandler>) {
        self.unknown_handler = Some(handler);
    }

    pub fn clear_unknown_handler(&mut self) {
        self.unknown_handler = None;
    }

    // ---- creation ----

    fn claim_name(&self, name: &str) -> Result<String> {
        let name = qualify(name);
        if self.names.contains_key(&name) {
            return Err(DispatchError::Structural(format!("object {} already exists", name)));
        }
        Ok(name)
    }

    fn fresh_name(&self) -> String {
        loop {
            let name = next_autoname("treenx");
            if !self.names.contains_key(&name) {
                return name;
            }
        }
    }

    /// Bootstrap a root class and root metaclass. The root metaclass is an
    /// instance of itself and a subclass of the root class.
    pub fn create_object_system(
        &mut self,
        root: &str,
        root_meta: &str,
        methods: SystemMethods,
    ) -> Result<(ClassId, ClassId)> {
        let root_name = self.claim_name(root)?;
        let meta_name = self.claim_name(root_meta)?;
        if root_name == meta_name {
            return Err(DispatchError::Structural(format!(
                "root class and root metaclass both named {}",
                root_name
            )));
        }
        let id = SystemId(self.systems.len() as u32);
        let placeholder = ObjectId {
            index: 0,
            generation: 0,
        };
        let root_class = self.objects.alloc(Object::new_class(&root_name, placeholder, id));
        let root_metaclass = self.objects.alloc(Object::new_class(&meta_name, placeholder, id));

        for (cl, is_meta) in [(root_class, false), (root_metaclass, true)] {
            let object = self.obj_mut(cl)?;
            object.class = root_metaclass;
            object.flags.is_root_class = !is_meta;
            object.flags.is_root_metaclass = is_meta;
        }
        add_superclass_edge(&mut self.objects, root_metaclass, root_class);
        let meta = self.class_rec_mut(root_metaclass)?;
        meta.instances.insert(root_class);
        meta.instances.insert(root_metaclass);

        self.names.insert(root_name.clone(), root_class);
        self.names.insert(meta_name, root_metaclass);
        self.systems.push(ObjectSystem {
            id,
            root_class,
            root_metaclass,
            methods,
        });
        debug!(root = %root_name, system = id.0, "object system created");
        Ok((root_class, root_metaclass))
    }

    pub fn object_systems(&self) -> &[ObjectSystem] {
        &self.systems
    }

    /// Create a class with the given metaclass; no superclasses means the
    /// root class of the metaclass's object system.
    pub fn create_class(&mut self, name: &str, metaclass: ClassId, supers: &[ClassId]) -> Result<ClassId> {
        self.create_class_with(name, metaclass, supers, &[])
    }

    fn create_class_with(
        &mut self,
        name: &str,
        metaclass: ClassId,
        supers: &[ClassId],
        init_args: &[Value],
    ) -> Result<ClassId> {
        if !self.is_metaclass(metaclass) {
            return Err(DispatchError::Structural(format!(
                "{} is not a metaclass",
                self.name_of(metaclass)
            )));
        }
        let name = self.claim_name(name)?;
        let system = self.obj(metaclass)?.system;
        let cl = self.objects.alloc(Object::new_class(&name, metaclass, system));
        self.names.insert(name.clone(), cl);
        self.class_rec_mut(metaclass)?.instances.insert(cl);

        if let Err(err) = self.set_superclasses(cl, supers) {
            self.unlink_new(cl, metaclass, &name);
            return Err(err);
        }
        debug!(class = %name, "class created");
        self.run_init(cl, init_args)?;
        Ok(cl)
    }

    /// Undo a half-built creation.
    fn unlink_new(&mut self, id: ObjectId, class: ClassId, name: &str) {
        if let Some(record) = self.objects.class_mut(class) {
            record.instances.remove(&id);
        }
        if let Some(record) = self.objects.class(id) {
            let supers = record.supers.clone();
            for sup in supers {
                remove_superclass_edge(&mut self.objects, id, sup);
            }
        }
        self.names.remove(name);
        self.objects.release(id);
    }

    /// Create an instance of `class`, autonamed when `name` is `None`.
    /// Instances of metaclasses are classes.
    pub fn create_object(&mut self, class: ClassId, name: Option<&str>, init_args: &[Value]) -> Result<ObjectId> {
        if !self.is_class(class) {
            return Err(DispatchError::Structural(format!(
                "{} is not a class",
                self.name_of(class)
            )));
        }
        let name = match name {
            Some(name) => self.claim_name(name)?,
            None => self.fresh_name(),
        };
        if self.is_metaclass(class) {
            return self.create_class_with(&name, class, &[], init_args);
        }
        let system = self.obj(class)?.system;
        let obj = self.objects.alloc(Object::new(&name, class, system));
        self.names.insert(name.clone(), obj);
        self.class_rec_mut(class)?.instances.insert(obj);
        debug!(object = %name, class = %self.name_of(class), "object created");
        self.run_init(obj, init_args)?;
        Ok(obj)
    }

    /// Whether `name` has an implementation on `obj` in its mixins, its
    /// namespace or its class order.
    fn implements(&mut self, obj: ObjectId, name: &str) -> Result<bool> {
        let mixins = self.mixin_order(obj)?;
        let in_mixin = mixins.iter().any(|m| {
            self.objects
                .class(m.class)
                .map_or(false, |r| r.methods.contains_key(name))
        });
        Ok(in_mixin || self.search_object_and_classes(obj, name)?.is_some())
    }

    fn run_init(&mut self, obj: ObjectId, args: &[Value]) -> Result<()> {
        let init = self.system_of(obj)?.methods.init.clone();
        if let Some(init) = init {
            if self.implements(obj, &init)? {
                let flags = DispatchFlags {
                    ignore_permissions: true,
                    ..DispatchFlags::default()
                };
                if let Err(err) = self.dispatch_with(obj, &init, args, flags) {
                    if let Err(cleanup) = self.destroy(obj) {
                        warn!(object = %self.name_of(obj), error = %cleanup, "cleanup after failed init");
                    }
                    return Err(err);
                }
            }
        }
        if let Some(object) = self.objects.get_mut(obj) {
            object.flags.init_called = true;
        }
        Ok(())
    }

    // ---- methods ----

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Define (or redefine) an instance method of `cl`.
    pub fn define_method(&mut self, cl: ClassId, mut method: Method) -> Result<()> {
        self.class_rec(cl)?;
        method.epoch = self.next_epoch();
        let name = method.name.clone();
        let path = self.class_method_path(cl, &name);
        let method = Rc::new(method);
        self.class_rec_mut(cl)?.methods.insert(name.clone(), method.clone());
        self.registry.insert(
            path.clone(),
            Registration {
                owner: Some(cl),
                per_object: false,
                method,
            },
        );
        self.invalidate_filter_users(&name);
        debug!(path = %path, "method defined");
        Ok(())
    }

    /// Define (or redefine) a method on `obj` itself.
    pub fn define_object_method(&mut self, obj: ObjectId, mut method: Method) -> Result<()> {
        self.obj(obj)?;
        method.epoch = self.next_epoch();
        let name = method.name.clone();
        let path = self.object_method_path(obj, &name);
        let method = Rc::new(method);
        self.obj_mut(obj)?
            .methods
            .get_or_insert_with(BTreeMap::new)
            .insert(name.clone(), method.clone());
        self.registry.insert(
            path.clone(),
            Registration {
                owner: Some(obj),
                per_object: true,
                method,
            },
        );
        self.invalidate_filter_users(&name);
        debug!(path = %path, "object method defined");
        Ok(())
    }

    pub fn remove_method(&mut self, cl: ClassId, name: &str) -> Result<bool> {
        let removed = self.class_rec_mut(cl)?.methods.remove(name).is_some();
        if removed {
            let path = self.class_method_path(cl, name);
            self.registry.remove(&path);
            self.next_epoch();
            self.invalidate_filter_users(name);
            debug!(path = %path, "method removed");
        }
        Ok(removed)
    }

    pub fn remove_object_method(&mut self, obj: ObjectId, name: &str) -> Result<bool> {
        let removed = self
            .obj_mut(obj)?
            .methods
            .as_mut()
            .map_or(false, |m| m.remove(name).is_some());
        if removed {
            let path = self.object_method_path(obj, name);
            self.registry.remove(&path);
            self.next_epoch();
            self.invalidate_filter_users(name);
            debug!(path = %path, "object method removed");
        }
        Ok(removed)
    }

    /// Register a command under a fully qualified path; it is reachable
    /// only through that path.
    pub fn define_command(&mut self, path: &str, mut method: Method) -> Result<()> {
        if !path.starts_with("::") {
            return Err(DispatchError::Structural(format!(
                "command path {} is not fully qualified",
                path
            )));
        }
        method.epoch = self.next_epoch();
        self.registry.insert(
            path.to_string(),
            Registration {
                owner: None,
                per_object: false,
                method: Rc::new(method),
            },
        );
        debug!(path, "command defined");
        Ok(())
    }

    /// Ensemble method `name` on `cl` whose sub-methods are the methods of
    /// `container`.
    pub fn define_ensemble(&mut self, cl: ClassId, name: &str, container: ObjectId) -> Result<()> {
        self.obj(container)?;
        self.define_method(cl, Method::ensemble(name, container))
    }

    pub fn set_keep_caller_self(&mut self, obj: ObjectId, keep: bool) -> Result<()> {
        self.obj_mut(obj)?.flags.keep_caller_self = keep;
        Ok(())
    }

    // ---- assertions ----

    pub fn set_check_options(&mut self, obj: ObjectId, check: CheckOptions) -> Result<()> {
        self.obj_mut(obj)?.opt.check = check;
        Ok(())
    }

    pub fn check_options(&self, obj: ObjectId) -> Result<CheckOptions> {
        Ok(self.obj(obj)?.opt.check)
    }

    pub fn add_object_invariant(&mut self, obj: ObjectId, invariant: Predicate) -> Result<()> {
        self.obj_mut(obj)?.opt.invariants.push(invariant);
        Ok(())
    }

    pub fn add_class_invariant(&mut self, cl: ClassId, invariant: Predicate) -> Result<()> {
        self.class_rec_mut(cl)?.opt.invariants.push(invariant);
        Ok(())
    }

    // ---- variables ----

    pub fn set_var(&mut self, obj: ObjectId, name: &str, value: impl Into<Value>) -> Result<()> {
        self.obj_mut(obj)?.vars.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn var(&self, obj: ObjectId, name: &str) -> Result<Option<Value>> {
        Ok(self.obj(obj)?.vars.get(name).cloned())
    }

    pub fn unset_var(&mut self, obj: ObjectId, name: &str) -> Result<bool> {
        Ok(self.obj_mut(obj)?.vars.remove(name).is_some())
    }

    // ---- reclassing ----

    /// Change the class of `obj`. Objects stay objects and classes stay
    /// classes: a class needs a metaclass, an object a non-meta class.
    pub fn change_class(&mut self, obj: ObjectId, class: ClassId) -> Result<()> {
        let object = self.obj(obj)?;
        let (old, obj_is_class) = (object.class, object.is_class());
        if !self.is_class(class) {
            return Err(DispatchError::Reclass(format!(
                "{} is not a class",
                self.name_of(class)
            )));
        }
        let to_meta = self.is_metaclass(class);
        if obj_is_class && !to_meta {
            return Err(DispatchError::Reclass(format!(
                "cannot turn class {} into an object of {}",
                self.name_of(obj),
                self.name_of(class)
            )));
        }
        if !obj_is_class && to_meta {
            return Err(DispatchError::Reclass(format!(
                "cannot turn object {} into a class of {}",
                self.name_of(obj),
                self.name_of(class)
            )));
        }
        if old == class {
            return Ok(());
        }
        if let Some(record) = self.objects.class_mut(old) {
            record.instances.remove(&obj);
        }
        self.class_rec_mut(class)?.instances.insert(obj);
        self.obj_mut(obj)?.class = class;
        self.invalidate_object_orders(obj);
        debug!(object = %self.name_of(obj), class = %self.name_of(class), "class changed");
        Ok(())
    }

    // ---- destruction ----

    /// Destroy `obj`: the system destroy method runs once, then the object
    /// is unlinked. The slot is reclaimed when no frame references it.
    /// A failing destroy method does not stop the deletion; its error is
    /// returned afterwards.
    pub fn destroy(&mut self, obj: ObjectId) -> Result<()> {
        let object = self.obj(obj)?;
        if object.is_root() {
            return Err(DispatchError::Structural(format!(
                "cannot destroy root class {}",
                object.name
            )));
        }
        if object.flags.during_delete {
            return Ok(());
        }

        let mut outcome = Ok(());
        if !object.flags.destroy_called {
            self.obj_mut(obj)?.flags.destroy_called = true;
            let destroy = self.system_of(obj)?.methods.destroy.clone();
            if let Some(destroy) = destroy {
                if self.implements(obj, &destroy)? {
                    let flags = DispatchFlags {
                        ignore_permissions: true,
                        no_unknown: true,
                        ..DispatchFlags::default()
                    };
                    if let Err(err) = self.dispatch_with(obj, &destroy, &[], flags) {
                        warn!(object = %self.name_of(obj), error = %err, "destroy method failed");
                        outcome = Err(err);
                    }
                }
            }
        }

        let gone = self
            .objects
            .get(obj)
            .map_or(true, |o| o.flags.during_delete || o.flags.deleted);
        if !gone {
            self.delete_physical(obj)?;
        }
        outcome
    }

    fn delete_physical(&mut self, obj: ObjectId) -> Result<()> {
        self.obj_mut(obj)?.flags.during_delete = true;
        if self.is_class(obj) {
            self.delete_class_parts(obj)?;
        }

        let object = self.obj(obj)?;
        let name = object.name.clone();
        let class = object.class;
        let mixins: Vec<ClassId> = object.opt.mixins.iter().map(|m| m.class).collect();
        let filters = object.opt.filters.clone();

        if self.names.get(&name) == Some(&obj) {
            self.names.remove(&name);
        }
        self.registry.retain(|_, reg| reg.owner != Some(obj));
        for m in mixins {
            if let Some(record) = self.objects.class_mut(m) {
                record.opt.is_object_mixin_of.retain(|o| *o != obj);
            }
        }
        self.track_filter_names(obj, &filters, &[]);
        if let Some(record) = self.objects.class_mut(class) {
            record.instances.remove(&obj);
        }

        let object = self.obj_mut(obj)?;
        object.invalidate_mixin_order();
        object.invalidate_filter_order();
        object.flags.deleted = true;
        let in_use = object.refcount > 0;
        if in_use {
            debug!(object = %name, "deletion deferred while frames reference it");
        } else {
            self.objects.release(obj);
            debug!(object = %name, "object deleted");
        }
        Ok(())
    }

    /// Class part of a deletion: instances move to the root class (root
    /// metaclass for class instances), subclasses left without superclass
    /// are attached to the root class, registrations naming the class are
    /// dropped.
    fn delete_class_parts(&mut self, cl: ClassId) -> Result<()> {
        let system = self.system_of(cl)?;
        let (root_class, root_meta) = (system.root_class, system.root_metaclass);
        let is_meta = self.is_metaclass(cl);
        let dependents = dependent_subclasses(&self.objects, cl);
        let record = self.class_rec(cl)?;
        let instances: Vec<ObjectId> = record.instances.iter().copied().filter(|i| *i != cl).collect();
        let subs = record.subs.clone();
        let supers = record.supers.clone();
        let own_mixins: Vec<ClassId> = record.opt.mixins.iter().map(|m| m.class).collect();
        let object_users = record.opt.is_object_mixin_of.clone();
        let class_users = record.opt.is_class_mixin_of.clone();
        let class_filters = record.opt.filters.clone();

        let fallback = if is_meta { root_meta } else { root_class };
        for inst in instances {
            if let Some(object) = self.objects.get_mut(inst) {
                object.class = fallback;
            }
            self.class_rec_mut(fallback)?.instances.insert(inst);
            self.invalidate_object_orders(inst);
        }
        if let Some(record) = self.objects.class_mut(cl) {
            record.instances.clear();
        }

        for sub in subs {
            let sub_root = if self.is_metaclass(sub) { root_meta } else { root_class };
            remove_superclass_edge(&mut self.objects, sub, cl);
            if self.objects.class(sub).map_or(false, |r| r.supers.is_empty()) {
                add_superclass_edge(&mut self.objects, sub, sub_root);
            }
        }
        for sup in supers {
            remove_superclass_edge(&mut self.objects, cl, sup);
        }

        for user in object_users {
            if let Some(object) = self.objects.get_mut(user) {
                object.opt.mixins.retain(|m| m.class != cl);
            }
            self.invalidate_object_orders(user);
        }
        for user in class_users {
            if let Some(record) = self.objects.class_mut(user) {
                record.opt.mixins.retain(|m| m.class != cl);
            }
            self.invalidate_class_interceptors(user);
        }
        for m in own_mixins {
            if let Some(record) = self.objects.class_mut(m) {
                record.opt.is_class_mixin_of.retain(|c| *c != cl);
            }
        }
        self.track_filter_names(cl, &class_filters, &[]);

        flush_orders(&mut self.objects, &dependents);
        self.invalidate_dependents(cl, &dependents);
        debug!(class = %self.name_of(cl), dependents = dependents.len(), "class unlinked");
        Ok(())
    }

    // ---- introspection ----

    /// Instances of `cl`, with `closure` also those of its subclasses.
    pub fn instances(&self, cl: ClassId, pattern: Option<&str>, closure: bool) -> Result<Vec<ObjectId>> {
        let pattern = compile_pattern(pattern)?;
        self.class_rec(cl)?;
        let classes = if closure {
            transitive_subclasses(&self.objects, cl)
        } else {
            vec![cl]
        };
        let mut out = BTreeSet::new();
        for c in classes {
            if let Some(record) = self.objects.class(c) {
                out.extend(record.instances.iter().copied());
            }
        }
        Ok(out
            .into_iter()
            .filter(|o| pattern.as_ref().map_or(true, |p| p.matches(&self.name_of(*o))))
            .collect())
    }

    /// Whether `cl` is in the class order or mixin order of `obj`.
    pub fn is_type(&mut self, obj: ObjectId, cl: ClassId) -> Result<bool> {
        let class = self.obj(obj)?.class;
        if self.precedence_order(class)?.contains(&cl) {
            return Ok(true);
        }
        Ok(self.mixin_order(obj)?.iter().any(|m| m.class == cl))
    }

    /// Public method names callable on `obj` without interceptors.
    pub fn method_names(&mut self, obj: ObjectId, pattern: Option<&str>) -> Result<Vec<String>> {
        let pattern = compile_pattern(pattern)?;
        Ok(self
            .visible_method_names(obj)?
            .into_iter()
            .filter(|n| pattern.as_ref().map_or(true, |p| p.matches(n)))
            .collect())
    }

    /// Methods defined directly on `cl` for its instances.
    pub fn class_method_names(&self, cl: ClassId) -> Result<Vec<String>> {
        Ok(self.class_rec(cl)?.methods.keys().cloned().collect())
    }

    /// Where `name` resolves on `obj`, ignoring interceptors.
    pub fn resolve_method_handle(&mut self, obj: ObjectId, name: &str) -> Result<Option<MethodHandleInfo>> {
        if name.starts_with("::") {
            return Ok(self.registry.get(name).map(|reg| MethodHandleInfo {
                definer: reg.owner.map_or_else(String::new, |o| self.name_of(o)),
                kind: reg.method.implementation_kind(),
                handle: name.to_string(),
                per_object: reg.per_object,
            }));
        }
        Ok(match self.search_object_and_classes(obj, name)? {
            Some((method, Some(cl))) => Some(MethodHandleInfo {
                definer: self.name_of(cl),
                kind: method.implementation_kind(),
                handle: self.class_method_path(cl, name),
                per_object: false,
            }),
            Some((method, None)) => Some(MethodHandleInfo {
                definer: self.name_of(obj),
                kind: method.implementation_kind(),
                handle: self.object_method_path(obj, name),
                per_object: true,
            }),
            None => None,
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
