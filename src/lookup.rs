// TreeNX Method Lookup - name to implementation resolution
//
// Search order: filter chain, mixin chain, object namespace, class
// precedence order. Qualified names ("::...") go straight to the command
// registry. Visibility rejections are reported as "not found".

use crate::callstack::{CallStackContent, FrameType};
use crate::dispatch::DispatchFlags;
use crate::error::{DispatchError, Result};
use crate::method::{Guard, Method, Visibility};
use crate::object::{FilterEntry, MixinEntry};
use crate::runtime::Runtime;
use crate::types::{ClassId, ObjectId};
use std::rc::Rc;
use tracing::trace;

/// Outcome of a successful lookup
pub(crate) struct Resolved {
    pub method: Rc<Method>,
    /// Defining class; `None` for object methods and global commands
    pub cl: Option<ClassId>,
    pub frame_type: FrameType,
    /// Name of the implementation (the filter name for filters)
    pub method_name: String,
    pub filter_pushed: bool,
    pub mixin_pushed: bool,
}

impl Resolved {
    pub(crate) fn new(method: Rc<Method>, cl: Option<ClassId>, frame_type: FrameType, name: &str) -> Self {
        Self {
            method,
            cl,
            frame_type,
            method_name: name.to_string(),
            filter_pushed: false,
            mixin_pushed: false,
        }
    }
}

#[derive(Default)]
struct Pushed {
    filter: bool,
    mixin: bool,
}

impl Runtime {
    /// Evaluate a guard in a frame of its own with filters and nested
    /// guards switched off.
    pub(crate) fn eval_guard(&mut self, obj: ObjectId, method: &str, guard: &Guard) -> Result<bool> {
        let mut csc = CallStackContent::new(obj, method);
        csc.flags.guard = true;
        self.stack.push(csc);
        self.guard_depth += 1;
        let outcome = guard.eval(self);
        self.guard_depth -= 1;
        self.stack.pop();
        trace!(object = %self.name_of(obj), guard = %guard.source, ?outcome, "guard");
        outcome.map_err(|e| DispatchError::Guard {
            object: self.name_of(obj),
            method: method.to_string(),
            expr: guard.source.clone(),
            message: e.to_string(),
        })
    }

    /// Calls made from inside an active filter of the receiver bypass filters.
    fn in_active_filter_of(&self, obj: ObjectId) -> bool {
        self.stack
            .find_active_frame()
            .and_then(|idx| self.stack.get(idx))
            .map_or(false, |f| f.object == obj && f.frame_type == FrameType::ActiveFilter)
    }

    /// First usable filter at or after `start`.
    pub(crate) fn search_filters(
        &mut self,
        obj: ObjectId,
        order: &[FilterEntry],
        start: usize,
    ) -> Result<Option<FilterEntry>> {
        let is_class = self.is_class(obj);
        for entry in order.iter().skip(start) {
            if entry.method.is_private() || (entry.method.class_only && !is_class) {
                continue;
            }
            if let Some(guard) = &entry.guard {
                if !self.eval_guard(obj, &entry.name, guard)? {
                    continue;
                }
            }
            return Ok(Some(entry.clone()));
        }
        Ok(None)
    }

    /// First mixin at or after `start` defining `name` whose guard passes.
    pub(crate) fn search_mixins(
        &mut self,
        obj: ObjectId,
        order: &[MixinEntry],
        start: usize,
        name: &str,
    ) -> Result<Option<(ClassId, Rc<Method>)>> {
        for entry in order.iter().skip(start) {
            let method = match self.objects.class(entry.class).and_then(|r| r.methods.get(name)) {
                Some(m) if !m.is_private() => m.clone(),
                _ => continue,
            };
            if self.guard_depth == 0 {
                if let Some(guard) = &entry.guard {
                    if !self.eval_guard(obj, name, guard)? {
                        continue;
                    }
                }
            }
            return Ok(Some((entry.class, method)));
        }
        Ok(None)
    }

    /// Object namespace, then class order; private methods are skipped.
    pub(crate) fn search_object_and_classes(
        &mut self,
        obj: ObjectId,
        name: &str,
    ) -> Result<Option<(Rc<Method>, Option<ClassId>)>> {
        let object = self.obj(obj)?;
        if let Some(m) = object.method(name).filter(|m| !m.is_private()) {
            return Ok(Some((m.clone(), None)));
        }
        let class = object.class;
        self.search_class_order(class, name, None)
    }

    /// Class order of `class` after `after` (from the start when `None`).
    pub(crate) fn search_class_order(
        &mut self,
        class: ClassId,
        name: &str,
        after: Option<ClassId>,
    ) -> Result<Option<(Rc<Method>, Option<ClassId>)>> {
        let order = self.precedence_order(class)?;
        let start = match after {
            None => 0,
            Some(cl) => order.iter().position(|c| *c == cl).map_or(order.len(), |p| p + 1),
        };
        for cl in order.iter().skip(start) {
            if let Some(m) = self.class_rec(*cl)?.methods.get(name) {
                if !m.is_private() {
                    return Ok(Some((m.clone(), Some(*cl))));
                }
            }
        }
        Ok(None)
    }

    /// Resolution in the namespace of the currently executing method;
    /// private methods are visible.
    fn search_local(&mut self, obj: ObjectId, name: &str) -> Result<Option<(Rc<Method>, Option<ClassId>)>> {
        let frame_class = self
            .stack
            .find_active_frame()
            .and_then(|idx| self.stack.get(idx))
            .and_then(|f| f.cl);
        match frame_class {
            Some(cl) => Ok(self
                .class_rec(cl)?
                .methods
                .get(name)
                .map(|m| (m.clone(), Some(cl)))),
            None => Ok(self.obj(obj)?.method(name).map(|m| (m.clone(), None))),
        }
    }

    fn search_system(&mut self, obj: ObjectId, name: &str) -> Result<Option<(Rc<Method>, Option<ClassId>)>> {
        let root = self.system_of(obj)?.root_class;
        Ok(self
            .class_rec(root)?
            .methods
            .get(name)
            .map(|m| (m.clone(), Some(root))))
    }

    fn search_registry(&self, path: &str) -> Option<(Rc<Method>, Option<ClassId>)> {
        self.registry.get(path).map(|reg| {
            let cl = if reg.per_object { None } else { reg.owner };
            (reg.method.clone(), cl)
        })
    }

    fn permitted(&self, obj: ObjectId, method: &Method) -> bool {
        if method.class_only && !self.is_class(obj) {
            return false;
        }
        match method.visibility {
            Visibility::Public => true,
            Visibility::Protected => self.caller_self() == Some(obj),
            Visibility::Private => false,
        }
    }

    /// Resolve `name` on `obj`. Position stacks pushed for the winning
    /// interceptor stay pushed for the dispatcher to pop; nothing stays
    /// pushed when the lookup fails.
    pub(crate) fn resolve(
        &mut self,
        obj: ObjectId,
        name: &str,
        flags: &DispatchFlags,
    ) -> Result<Option<Resolved>> {
        let mut pushed = Pushed::default();
        match self.resolve_in_order(obj, name, flags, &mut pushed) {
            Ok(Some(mut resolved)) => {
                resolved.filter_pushed = pushed.filter;
                resolved.mixin_pushed = pushed.mixin;
                Ok(Some(resolved))
            }
            outcome => {
                if pushed.filter {
                    self.pop_filter_stack(obj);
                }
                if pushed.mixin {
                    self.pop_mixin_stack(obj);
                }
                outcome
            }
        }
    }

    fn resolve_in_order(
        &mut self,
        obj: ObjectId,
        name: &str,
        flags: &DispatchFlags,
        pushed: &mut Pushed,
    ) -> Result<Option<Resolved>> {
        let qualified = name.starts_with("::");
        let restricted = flags.local_only || flags.system_only || flags.intrinsic_only;
        let interceptable = !qualified && !restricted;

        let mut found = None;
        if interceptable
            && self.config.filters_enabled
            && self.guard_depth == 0
            && !self.in_active_filter_of(obj)
        {
            let order = self.filter_order(obj)?;
            if let Some(entry) = self.search_filters(obj, &order, 0)? {
                self.push_filter_stack(obj, name);
                pushed.filter = true;
                self.set_filter_position(obj, Some(entry.key()));
                found = Some(Resolved::new(
                    entry.method,
                    entry.cl,
                    FrameType::ActiveFilter,
                    &entry.name,
                ));
            }
        }

        if interceptable {
            let order = self.mixin_order(obj)?;
            if !order.is_empty() {
                if found.is_some() {
                    // The filter chain ends in the mixin chain.
                    self.push_mixin_stack(obj);
                    pushed.mixin = true;
                } else if let Some((cl, method)) = self.search_mixins(obj, &order, 0, name)? {
                    self.push_mixin_stack(obj);
                    pushed.mixin = true;
                    self.set_mixin_position(obj, Some(cl));
                    if !flags.ignore_permissions && !self.permitted(obj, &method) {
                        trace!(object = %self.name_of(obj), method = name, "mixin method not permitted");
                        return Ok(None);
                    }
                    found = Some(Resolved::new(method, Some(cl), FrameType::ActiveMixin, name));
                }
            }
        }

        if found.is_some() {
            return Ok(found);
        }

        let candidate = if qualified {
            self.search_registry(name)
        } else if flags.local_only {
            self.search_local(obj, name)?
        } else if flags.system_only {
            self.search_system(obj, name)?
        } else {
            self.search_object_and_classes(obj, name)?
        };

        let Some((method, cl)) = candidate else {
            return Ok(None);
        };
        let exempt = qualified || flags.local_only || flags.ignore_permissions;
        if !exempt && !self.permitted(obj, &method) {
            trace!(object = %self.name_of(obj), method = name, "method not permitted");
            return Ok(None);
        }
        Ok(Some(Resolved::new(method, cl, FrameType::Plain, name)))
    }
}
