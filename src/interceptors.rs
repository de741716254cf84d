// TreeNX Interceptors - mixin and filter orders
//
// Per-object orders fold together per-object registrations, class-level
// registrations along the class precedence order and the class mixins of
// mixin classes. Orders are cached on the object and dropped whenever a
// registration, a class mixin or the ancestry of the object's class
// changes.

use crate::error::{DispatchError, Result};
use crate::linearize::dependent_subclasses;
use crate::method::Guard;
use crate::object::{FilterEntry, FilterReg, MixinEntry, MixinReg};
use crate::runtime::Runtime;
use crate::types::{ClassId, ObjectId};
use glob::Pattern;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::rc::Rc;
use tracing::{debug, warn};

/// One entry of an introspected mixin or filter order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterceptorInfo {
    pub name: String,
    pub guard: Option<String>,
}

pub(crate) fn compile_pattern(pattern: Option<&str>) -> Result<Option<Pattern>> {
    pattern
        .map(|p| {
            Pattern::new(p).map_err(|e| DispatchError::Pattern {
                pattern: p.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn matches(pattern: &Option<Pattern>, candidates: &[&str]) -> bool {
    match pattern {
        None => true,
        Some(p) => candidates.iter().any(|c| p.matches(c)),
    }
}

/// Keep the last occurrence of every class, drop classes of the own order.
fn flatten_mixins(raw: &[MixinEntry], class_order: &[ClassId]) -> Vec<MixinEntry> {
    let mut out = Vec::new();
    for (i, entry) in raw.iter().enumerate() {
        if raw[i + 1..].iter().any(|later| later.class == entry.class) {
            continue;
        }
        if class_order.contains(&entry.class) {
            continue;
        }
        let guard = raw
            .iter()
            .find(|first| first.class == entry.class)
            .and_then(|first| first.guard.clone());
        out.push(MixinEntry {
            class: entry.class,
            guard,
        });
    }
    out
}

impl Runtime {
    // ---- invalidation ----

    pub(crate) fn invalidate_object_orders(&mut self, obj: ObjectId) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.invalidate_mixin_order();
            object.invalidate_filter_order();
        }
    }

    /// Drop the orders of every object whose interceptors may depend on the
    /// given classes: their instances and the objects mixing them in.
    pub(crate) fn invalidate_dependents(&mut self, cl: ClassId, dependents: &[ClassId]) {
        let mut affected = BTreeSet::new();
        for dep in dependents {
            if let Some(record) = self.objects.class(*dep) {
                affected.extend(record.instances.iter().copied());
                affected.extend(record.opt.is_object_mixin_of.iter().copied());
            }
        }
        for obj in &affected {
            self.invalidate_object_orders(*obj);
        }
        debug!(
            class = %self.name_of(cl),
            classes = dependents.len(),
            objects = affected.len(),
            "invalidated interceptor orders"
        );
    }

    pub(crate) fn invalidate_class_interceptors(&mut self, cl: ClassId) {
        let dependents = dependent_subclasses(&self.objects, cl);
        self.invalidate_dependents(cl, &dependents);
    }

    /// A method named like a registered filter changed; drop the orders of
    /// everything registering that filter.
    pub(crate) fn invalidate_filter_users(&mut self, name: &str) {
        let users: Vec<ObjectId> = self
            .filter_users
            .get(name)
            .map(|u| u.iter().copied().collect())
            .unwrap_or_default();
        for user in users {
            if self.is_class(user) {
                self.invalidate_class_interceptors(user);
            }
            self.invalidate_object_orders(user);
        }
    }

    fn require_mixin_classes(&self, mixins: &[MixinReg]) -> Result<()> {
        for m in mixins {
            if !self.is_class(m.class) {
                return Err(DispatchError::Structural(format!(
                    "mixin {} is not a class",
                    self.name_of(m.class)
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn track_filter_names(&mut self, user: ObjectId, old: &[FilterReg], new: &[FilterReg]) {
        for reg in old {
            if let Some(users) = self.filter_users.get_mut(&reg.name) {
                users.remove(&user);
                if users.is_empty() {
                    self.filter_users.remove(&reg.name);
                }
            }
        }
        for reg in new {
            self.filter_users
                .entry(reg.name.clone())
                .or_default()
                .insert(user);
        }
    }

    // ---- per-object registrations ----

    pub fn set_object_mixins(&mut self, obj: ObjectId, mixins: Vec<MixinReg>) -> Result<()> {
        self.require_mixin_classes(&mixins)?;
        let old: Vec<ClassId> = self.obj(obj)?.opt.mixins.iter().map(|m| m.class).collect();
        for cl in old {
            if let Some(record) = self.objects.class_mut(cl) {
                record.opt.is_object_mixin_of.retain(|o| *o != obj);
            }
        }
        for m in &mixins {
            if let Some(record) = self.objects.class_mut(m.class) {
                if !record.opt.is_object_mixin_of.contains(&obj) {
                    record.opt.is_object_mixin_of.push(obj);
                }
            }
        }
        self.obj_mut(obj)?.opt.mixins = mixins;
        self.invalidate_object_orders(obj);
        debug!(object = %self.name_of(obj), "object mixins changed");
        Ok(())
    }

    /// Register `reg` in front of the existing per-object mixins.
    pub fn add_object_mixin(&mut self, obj: ObjectId, reg: MixinReg) -> Result<()> {
        let mut mixins = self.obj(obj)?.opt.mixins.clone();
        mixins.retain(|m| m.class != reg.class);
        mixins.insert(0, reg);
        self.set_object_mixins(obj, mixins)
    }

    pub fn remove_object_mixin(&mut self, obj: ObjectId, cl: ClassId) -> Result<bool> {
        let mut mixins = self.obj(obj)?.opt.mixins.clone();
        let before = mixins.len();
        mixins.retain(|m| m.class != cl);
        if mixins.len() == before {
            return Ok(false);
        }
        self.set_object_mixins(obj, mixins)?;
        Ok(true)
    }

    pub fn object_mixins(&self, obj: ObjectId) -> Result<Vec<ClassId>> {
        Ok(self.obj(obj)?.opt.mixins.iter().map(|m| m.class).collect())
    }

    pub fn set_object_mixin_guard(
        &mut self,
        obj: ObjectId,
        cl: ClassId,
        guard: Option<Guard>,
    ) -> Result<()> {
        let name = self.name_of(obj);
        let mixin = self.name_of(cl);
        let reg = self
            .obj_mut(obj)?
            .opt
            .mixins
            .iter_mut()
            .find(|m| m.class == cl)
            .ok_or_else(|| {
                DispatchError::Script(format!("{}: {} is not a mixin of this object", name, mixin))
            })?;
        reg.guard = guard;
        self.invalidate_object_orders(obj);
        Ok(())
    }

    pub fn set_object_filters(&mut self, obj: ObjectId, filters: Vec<FilterReg>) -> Result<()> {
        let old = self.obj(obj)?.opt.filters.clone();
        self.track_filter_names(obj, &old, &filters);
        self.obj_mut(obj)?.opt.filters = filters;
        self.invalidate_object_orders(obj);
        debug!(object = %self.name_of(obj), "object filters changed");
        Ok(())
    }

    pub fn add_object_filter(&mut self, obj: ObjectId, reg: FilterReg) -> Result<()> {
        let mut filters = self.obj(obj)?.opt.filters.clone();
        filters.retain(|f| f.name != reg.name);
        filters.insert(0, reg);
        self.set_object_filters(obj, filters)
    }

    pub fn remove_object_filter(&mut self, obj: ObjectId, name: &str) -> Result<bool> {
        let mut filters = self.obj(obj)?.opt.filters.clone();
        let before = filters.len();
        filters.retain(|f| f.name != name);
        if filters.len() == before {
            return Ok(false);
        }
        self.set_object_filters(obj, filters)?;
        Ok(true)
    }

    pub fn object_filters(&self, obj: ObjectId) -> Result<Vec<String>> {
        Ok(self.obj(obj)?.opt.filters.iter().map(|f| f.name.clone()).collect())
    }

    pub fn set_object_filter_guard(
        &mut self,
        obj: ObjectId,
        name: &str,
        guard: Option<Guard>,
    ) -> Result<()> {
        let oname = self.name_of(obj);
        let reg = self
            .obj_mut(obj)?
            .opt
            .filters
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                DispatchError::Script(format!("{}: {} is not a filter of this object", oname, name))
            })?;
        reg.guard = guard;
        self.invalidate_object_orders(obj);
        Ok(())
    }

    // ---- per-class registrations ----

    pub fn set_class_mixins(&mut self, cl: ClassId, mixins: Vec<MixinReg>) -> Result<()> {
        self.require_mixin_classes(&mixins)?;
        let old: Vec<ClassId> = self.class_rec(cl)?.opt.mixins.iter().map(|m| m.class).collect();
        for m in old {
            if let Some(record) = self.objects.class_mut(m) {
                record.opt.is_class_mixin_of.retain(|c| *c != cl);
            }
        }
        for m in &mixins {
            if let Some(record) = self.objects.class_mut(m.class) {
                if !record.opt.is_class_mixin_of.contains(&cl) {
                    record.opt.is_class_mixin_of.push(cl);
                }
            }
        }
        self.class_rec_mut(cl)?.opt.mixins = mixins;
        self.invalidate_class_interceptors(cl);
        Ok(())
    }

    pub fn add_class_mixin(&mut self, cl: ClassId, reg: MixinReg) -> Result<()> {
        let mut mixins = self.class_rec(cl)?.opt.mixins.clone();
        mixins.retain(|m| m.class != reg.class);
        mixins.insert(0, reg);
        self.set_class_mixins(cl, mixins)
    }

    pub fn remove_class_mixin(&mut self, cl: ClassId, mixin: ClassId) -> Result<bool> {
        let mut mixins = self.class_rec(cl)?.opt.mixins.clone();
        let before = mixins.len();
        mixins.retain(|m| m.class != mixin);
        if mixins.len() == before {
            return Ok(false);
        }
        self.set_class_mixins(cl, mixins)?;
        Ok(true)
    }

    pub fn class_mixins(&self, cl: ClassId) -> Result<Vec<ClassId>> {
        Ok(self.class_rec(cl)?.opt.mixins.iter().map(|m| m.class).collect())
    }

    pub fn set_class_mixin_guard(
        &mut self,
        cl: ClassId,
        mixin: ClassId,
        guard: Option<Guard>,
    ) -> Result<()> {
        let cname = self.name_of(cl);
        let mname = self.name_of(mixin);
        let reg = self
            .class_rec_mut(cl)?
            .opt
            .mixins
            .iter_mut()
            .find(|m| m.class == mixin)
            .ok_or_else(|| {
                DispatchError::Script(format!("{}: {} is not a class mixin", cname, mname))
            })?;
        reg.guard = guard;
        self.invalidate_class_interceptors(cl);
        Ok(())
    }

    pub fn set_class_filters(&mut self, cl: ClassId, filters: Vec<FilterReg>) -> Result<()> {
        let old = self.class_rec(cl)?.opt.filters.clone();
        self.track_filter_names(cl, &old, &filters);
        self.class_rec_mut(cl)?.opt.filters = filters;
        self.invalidate_class_interceptors(cl);
        Ok(())
    }

    pub fn add_class_filter(&mut self, cl: ClassId, reg: FilterReg) -> Result<()> {
        let mut filters = self.class_rec(cl)?.opt.filters.clone();
        filters.retain(|f| f.name != reg.name);
        filters.insert(0, reg);
        self.set_class_filters(cl, filters)
    }

    pub fn remove_class_filter(&mut self, cl: ClassId, name: &str) -> Result<bool> {
        let mut filters = self.class_rec(cl)?.opt.filters.clone();
        let before = filters.len();
        filters.retain(|f| f.name != name);
        if filters.len() == before {
            return Ok(false);
        }
        self.set_class_filters(cl, filters)?;
        Ok(true)
    }

    pub fn class_filters(&self, cl: ClassId) -> Result<Vec<String>> {
        Ok(self.class_rec(cl)?.opt.filters.iter().map(|f| f.name.clone()).collect())
    }

    pub fn set_class_filter_guard(
        &mut self,
        cl: ClassId,
        name: &str,
        guard: Option<Guard>,
    ) -> Result<()> {
        let cname = self.name_of(cl);
        let reg = self
            .class_rec_mut(cl)?
            .opt
            .filters
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                DispatchError::Script(format!("{}: {} is not a class filter", cname, name))
            })?;
        reg.guard = guard;
        self.invalidate_class_interceptors(cl);
        Ok(())
    }

    // ---- mixin order ----

    /// Effective mixin order of `obj`, computed on demand and cached.
    pub fn mixin_order(&mut self, obj: ObjectId) -> Result<Rc<[MixinEntry]>> {
        let object = self.obj(obj)?;
        if object.flags.mixin_order_valid {
            if let Some(order) = &object.mixin_order {
                return Ok(order.clone());
            }
        }
        let (class, own) = (object.class, object.opt.mixins.clone());
        let order: Rc<[MixinEntry]> = self.compute_mixin_order(&own, class)?.into();
        let object = self.obj_mut(obj)?;
        object.flags.mixin_order_valid = true;
        object.flags.mixin_order_defined = !order.is_empty();
        object.mixin_order = Some(order.clone());
        debug!(object = %self.name_of(obj), len = order.len(), "computed mixin order");
        Ok(order)
    }

    fn compute_mixin_order(&mut self, own: &[MixinReg], class: ClassId) -> Result<Vec<MixinEntry>> {
        let class_order = self.precedence_order(class)?;
        let mut raw = Vec::new();
        let mut checked = HashSet::new();
        let mut path = Vec::new();
        self.gather_mixins(own, &mut raw, &mut checked, &mut path)?;
        for cl in class_order.iter() {
            let regs = self.class_rec(*cl)?.opt.mixins.clone();
            if !regs.is_empty() {
                self.gather_mixins(&regs, &mut raw, &mut checked, &mut path)?;
            }
        }
        Ok(flatten_mixins(&raw, &class_order))
    }

    /// Append every registered mixin with its precedence order to `raw`;
    /// class mixins of those classes come first. A class is expanded at
    /// most once; meeting it again on its own expansion path is a cycle,
    /// which is logged and cut.
    fn gather_mixins(
        &mut self,
        regs: &[MixinReg],
        raw: &mut Vec<MixinEntry>,
        checked: &mut HashSet<ClassId>,
        path: &mut Vec<ClassId>,
    ) -> Result<()> {
        for reg in regs {
            if !self.is_class(reg.class) {
                continue;
            }
            let order = self.precedence_order(reg.class)?;
            for cl in order.iter().copied() {
                if self.is_root_class(cl) {
                    continue;
                }
                let class_mixins = self.class_rec(cl)?.opt.mixins.clone();
                if !class_mixins.is_empty() {
                    if path.contains(&cl) {
                        if self.config.warn_mixin_cycles {
                            warn!(class = %self.name_of(cl), "hit mixin recursion, expansion truncated");
                        }
                    } else if checked.insert(cl) {
                        path.push(cl);
                        let expanded = self.gather_mixins(&class_mixins, raw, checked, path);
                        path.pop();
                        expanded?;
                    }
                }
                raw.push(MixinEntry {
                    class: cl,
                    guard: reg.guard.clone(),
                });
            }
        }
        Ok(())
    }

    /// Mixins applying to instances of `cl` through class mixins only.
    pub fn class_mixin_order(&mut self, cl: ClassId) -> Result<Vec<ClassId>> {
        Ok(self
            .compute_mixin_order(&[], cl)?
            .into_iter()
            .map(|m| m.class)
            .collect())
    }

    // ---- filter order ----

    /// Effective filter order of `obj`, computed on demand and cached.
    pub fn filter_order(&mut self, obj: ObjectId) -> Result<Rc<[FilterEntry]>> {
        let object = self.obj(obj)?;
        if object.flags.filter_order_valid {
            if let Some(order) = &object.filter_order {
                return Ok(order.clone());
            }
        }
        let order: Rc<[FilterEntry]> = self.compute_filter_order(obj)?.into();
        let object = self.obj_mut(obj)?;
        object.flags.filter_order_valid = true;
        object.flags.filter_order_defined = !order.is_empty();
        object.filter_order = Some(order.clone());
        debug!(object = %self.name_of(obj), len = order.len(), "computed filter order");
        Ok(order)
    }

    fn compute_filter_order(&mut self, obj: ObjectId) -> Result<Vec<FilterEntry>> {
        let mixins = self.mixin_order(obj)?;
        let (class, own) = {
            let object = self.obj(obj)?;
            (object.class, object.opt.filters.clone())
        };
        let class_order = self.precedence_order(class)?;

        let mut raw = Vec::new();
        for m in mixins.iter() {
            for reg in self.class_rec(m.class)?.opt.filters.clone() {
                self.expand_class_filter(m.class, &reg.name, &mut raw)?;
            }
        }
        for reg in &own {
            self.expand_object_filter(obj, &reg.name, &mut raw)?;
        }
        for cl in class_order.iter() {
            for reg in self.class_rec(*cl)?.opt.filters.clone() {
                self.expand_class_filter(*cl, &reg.name, &mut raw)?;
            }
        }

        let mut order: Vec<FilterEntry> = Vec::new();
        for (i, entry) in raw.iter().enumerate() {
            if raw[i + 1..]
                .iter()
                .any(|later| later.cl == entry.cl && later.name == entry.name)
            {
                continue;
            }
            let mut entry = entry.clone();
            entry.guard = self.inherited_guard(obj, &entry, &mixins, &class_order, &order)?;
            order.push(entry);
        }
        Ok(order)
    }

    /// All implementations of `name` along the order of `cl`.
    fn expand_class_filter(&mut self, cl: ClassId, name: &str, raw: &mut Vec<FilterEntry>) -> Result<()> {
        let order = self.precedence_order(cl)?;
        let before = raw.len();
        for c in order.iter() {
            if let Some(method) = self.class_rec(*c)?.methods.get(name) {
                raw.push(FilterEntry {
                    name: name.to_string(),
                    cl: Some(*c),
                    method: method.clone(),
                    guard: None,
                });
            }
        }
        if raw.len() == before {
            debug!(class = %self.name_of(cl), filter = name, "filter has no implementation");
        }
        Ok(())
    }

    /// The object's own implementation of `name` followed by those of its
    /// class order.
    fn expand_object_filter(&mut self, obj: ObjectId, name: &str, raw: &mut Vec<FilterEntry>) -> Result<()> {
        let (own, class) = {
            let object = self.obj(obj)?;
            (object.method(name).cloned(), object.class)
        };
        if let Some(method) = own {
            raw.push(FilterEntry {
                name: name.to_string(),
                cl: None,
                method,
                guard: None,
            });
        }
        self.expand_class_filter(class, name, raw)
    }

    /// Where a filter registered on `cl` resolves first.
    fn class_filter_head(&mut self, cl: ClassId, name: &str) -> Result<Option<Option<ClassId>>> {
        let order = self.precedence_order(cl)?;
        for c in order.iter() {
            if self.class_rec(*c)?.methods.contains_key(name) {
                return Ok(Some(Some(*c)));
            }
        }
        Ok(None)
    }

    fn object_filter_head(&mut self, obj: ObjectId, name: &str) -> Result<Option<Option<ClassId>>> {
        let object = self.obj(obj)?;
        if object.method(name).is_some() {
            return Ok(Some(None));
        }
        let class = object.class;
        self.class_filter_head(class, name)
    }

    /// Guard of the registration that produced `entry`: mixin class filters
    /// first, then object filters, then class filters along the order, and
    /// finally the guard of a same-named entry already in the order.
    fn inherited_guard(
        &mut self,
        obj: ObjectId,
        entry: &FilterEntry,
        mixins: &[MixinEntry],
        class_order: &[ClassId],
        built: &[FilterEntry],
    ) -> Result<Option<Guard>> {
        for m in mixins {
            for reg in self.class_rec(m.class)?.opt.filters.clone() {
                if reg.name == entry.name
                    && reg.guard.is_some()
                    && self.class_filter_head(m.class, &reg.name)? == Some(entry.cl)
                {
                    return Ok(reg.guard);
                }
            }
        }
        for reg in self.obj(obj)?.opt.filters.clone() {
            if reg.name == entry.name
                && reg.guard.is_some()
                && self.object_filter_head(obj, &reg.name)? == Some(entry.cl)
            {
                return Ok(reg.guard);
            }
        }
        for cl in class_order {
            for reg in self.class_rec(*cl)?.opt.filters.clone() {
                if reg.name == entry.name
                    && reg.guard.is_some()
                    && self.class_filter_head(*cl, &reg.name)? == Some(entry.cl)
                {
                    return Ok(reg.guard);
                }
            }
        }
        Ok(built
            .iter()
            .find(|e| e.name == entry.name)
            .and_then(|e| e.guard.clone()))
    }

    // ---- introspection ----

    pub fn query_mixin_order(
        &mut self,
        obj: ObjectId,
        pattern: Option<&str>,
    ) -> Result<Vec<InterceptorInfo>> {
        let pattern = compile_pattern(pattern)?;
        let order = self.mixin_order(obj)?;
        Ok(order
            .iter()
            .map(|m| InterceptorInfo {
                name: self.name_of(m.class),
                guard: m.guard.as_ref().map(|g| g.source.clone()),
            })
            .filter(|info| matches(&pattern, &[&info.name]))
            .collect())
    }

    /// Filter order as qualified method paths.
    pub fn query_filter_order(
        &mut self,
        obj: ObjectId,
        pattern: Option<&str>,
        with_guards: bool,
    ) -> Result<Vec<InterceptorInfo>> {
        let pattern = compile_pattern(pattern)?;
        let order = self.filter_order(obj)?;
        let mut out = Vec::new();
        for entry in order.iter() {
            let path = match entry.cl {
                Some(cl) => self.class_method_path(cl, &entry.name),
                None => self.object_method_path(obj, &entry.name),
            };
            if !matches(&pattern, &[&entry.name, &path]) {
                continue;
            }
            out.push(InterceptorInfo {
                name: path,
                guard: if with_guards {
                    entry.guard.as_ref().map(|g| g.source.clone())
                } else {
                    None
                },
            });
        }
        Ok(out)
    }

    /// Precedence order of `cl`, optionally preceded by the mixins its
    /// instances get from class mixins, optionally without root classes.
    pub fn query_precedence_order(
        &mut self,
        cl: ClassId,
        pattern: Option<&str>,
        include_mixins: bool,
        include_root: bool,
    ) -> Result<Vec<ClassId>> {
        let pattern = compile_pattern(pattern)?;
        let mut classes = Vec::new();
        if include_mixins {
            classes.extend(self.class_mixin_order(cl)?);
        }
        classes.extend(self.precedence_order(cl)?.iter().copied());
        Ok(classes
            .into_iter()
            .filter(|c| include_root || !self.is_root_class(*c))
            .filter(|c| matches(&pattern, &[&self.name_of(*c)]))
            .collect())
    }
}
