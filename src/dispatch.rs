// TreeNX Dispatcher - resolve, invoke, next and finalize
//
// A dispatch resolves the method, pushes a call frame, runs the
// implementation by kind and finalizes: position stacks pushed by the
// lookup are popped, declared return constraints are checked and deferred
// unknown handling runs.

use crate::callstack::{seek_current, CallStackContent, FrameType};
use crate::error::{ArgError, DispatchError, Result};
use crate::lookup::Resolved;
use crate::method::{Method, MethodKind, Predicate};
use crate::object::{FilterEntry, FilterKey, MixinEntry};
use crate::params::{parse_args, ParamSpec};
use crate::runtime::Runtime;
use crate::types::{ClassId, ObjectId};
use crate::value::Value;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, trace};

/// Alias chains longer than this are treated as broken.
const MAX_ALIAS_HOPS: usize = 16;

/// Dispatch modifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchFlags {
    /// Skip protected, private and class-only checks
    pub ignore_permissions: bool,
    /// Fail with `Unknown` instead of running unknown handling
    pub no_unknown: bool,
    /// Resolve in the namespace of the executing method, private included
    pub local_only: bool,
    /// Resolve in the root class of the receiver's object system
    pub system_only: bool,
    /// Skip filters and mixins
    pub intrinsic_only: bool,
    /// Ensembles do not consume the first argument as sub-method name
    pub no_arg_shift: bool,
    /// Give leaf native methods a frame
    pub force_frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pre,
    Post,
}

impl Runtime {
    pub fn dispatch(&mut self, obj: ObjectId, method: &str, args: &[Value]) -> Result<Value> {
        self.dispatch_with(obj, method, args, DispatchFlags::default())
    }

    pub fn dispatch_with(
        &mut self,
        obj: ObjectId,
        method: &str,
        args: &[Value],
        flags: DispatchFlags,
    ) -> Result<Value> {
        if self.stack.len() >= self.config.max_depth {
            return Err(DispatchError::Recursion(self.config.max_depth));
        }
        self.obj(obj)?;
        trace!(object = %self.name_of(obj), method, args = args.len(), "dispatch");

        match self.resolve(obj, method, &flags)? {
            Some(resolved) => self.method_dispatch(obj, method, resolved, args, &flags),
            None if flags.no_unknown => Err(DispatchError::Unknown {
                object: self.name_of(obj),
                method: method.to_string(),
            }),
            None => self.dispatch_unknown(obj, method, args),
        }
    }

    /// Replace an alias by the implementation currently registered under
    /// its path, refetching when the registration changed.
    fn refetch_alias(&mut self, method: Rc<Method>) -> Result<Rc<Method>> {
        let mut current = method;
        for _ in 0..MAX_ALIAS_HOPS {
            let MethodKind::Alias(target) = &current.kind else {
                return Ok(current);
            };
            let registered = self
                .registry
                .get(&target.path)
                .map(|reg| reg.method.clone())
                .ok_or_else(|| {
                    DispatchError::Structural(format!(
                        "target \"{}\" of alias {} apparently disappeared",
                        target.path, current.name
                    ))
                })?;
            let cached = target.cache.borrow().clone();
            let next = match cached {
                Some((epoch, m)) if epoch == registered.epoch && Rc::ptr_eq(&m, &registered) => m,
                _ => {
                    debug!(alias = %current.name, path = %target.path, "alias target refetched");
                    *target.cache.borrow_mut() = Some((registered.epoch, registered.clone()));
                    registered
                }
            };
            current = next;
        }
        Err(DispatchError::Structural(format!(
            "alias chain of {} is too long",
            current.name
        )))
    }

    fn method_dispatch(
        &mut self,
        obj: ObjectId,
        called: &str,
        resolved: Resolved,
        args: &[Value],
        flags: &DispatchFlags,
    ) -> Result<Value> {
        let method = match self.refetch_alias(resolved.method.clone()) {
            Ok(m) => m,
            Err(err) => {
                if resolved.filter_pushed {
                    self.pop_filter_stack(obj);
                }
                if resolved.mixin_pushed {
                    self.pop_mixin_stack(obj);
                }
                return Err(err);
            }
        };
        let leaf = matches!(method.kind, MethodKind::Native { leaf: true, .. });

        let mut csc = CallStackContent::new(obj, &resolved.method_name);
        csc.cl = resolved.cl;
        csc.cmd = Some(method.clone());
        csc.called_method = called.to_string();
        csc.method_path = called.to_string();
        csc.frame_type = resolved.frame_type;
        csc.flags.local = flags.local_only;
        csc.flags.force_frame = flags.force_frame;
        csc.flags.filter_stack_pushed = resolved.filter_pushed;
        csc.flags.mixin_stack_pushed = resolved.mixin_pushed;
        csc.args = args.iter().cloned().collect();
        csc.scoped = !leaf || flags.force_frame || resolved.frame_type != FrameType::Plain;

        let idx = self.stack.push(csc);
        self.retain(obj);
        let result = self.invoke(idx, obj, &method, args, flags);
        self.finalize(idx, result)
    }

    fn invoke(
        &mut self,
        idx: usize,
        obj: ObjectId,
        method: &Rc<Method>,
        args: &[Value],
        flags: &DispatchFlags,
    ) -> Result<Value> {
        match &method.kind {
            MethodKind::Scripted { params, body } => {
                let parsed = parse_args(self, params, args).map_err(|source| DispatchError::Argument {
                    object: self.name_of(obj),
                    method: method.name.clone(),
                    source,
                })?;
                self.check_assertions(obj, method, Phase::Pre)?;
                let result = body(self, &parsed)?;
                self.check_assertions(obj, method, Phase::Post)?;
                Ok(result)
            }
            MethodKind::Native { callback, .. } => callback(self, obj, args),
            MethodKind::Setter(spec) => self.invoke_setter(obj, &method.name, spec, args),
            MethodKind::Forward(spec) => self.invoke_forward(obj, &method.name, spec, args),
            MethodKind::Ensemble(container) => self.invoke_ensemble(idx, obj, *container, args, flags),
            MethodKind::Alias(target) => Err(DispatchError::Structural(format!(
                "alias {} to {} was not resolved",
                method.name, target.path
            ))),
        }
    }

    fn finalize(&mut self, idx: usize, result: Result<Value>) -> Result<Value> {
        let csc = match self.stack.pop() {
            Some(csc) => csc,
            None => return result,
        };
        debug_assert_eq!(self.stack.len(), idx);
        let obj = csc.object;
        if csc.flags.filter_stack_pushed {
            self.pop_filter_stack(obj);
        }
        if csc.flags.mixin_stack_pushed {
            self.pop_mixin_stack(obj);
        }

        let violation = match (&result, csc.cmd.as_ref().and_then(|m| m.returns)) {
            (Ok(value), Some(check)) if self.config.check_results && !check.matches(self, value) => {
                Some(DispatchError::ReturnType {
                    object: self.name_of(obj),
                    method: csc.method_path.clone(),
                    value: value.to_string(),
                    expected: check.to_string(),
                })
            }
            _ => None,
        };
        let mut result = match violation {
            Some(err) => Err(err),
            None => result,
        };
        if result.is_ok() && csc.flags.method_unknown {
            result = self.dispatch_unknown(obj, &csc.called_method, &csc.args);
        }
        trace!(object = %self.name_of(obj), method = %csc.method_path, ok = result.is_ok(), "finalize");
        self.release_ref(obj);
        result
    }

    /// Hand an unresolvable call to the installed handler, then to the
    /// object system's unknown method.
    pub(crate) fn dispatch_unknown(&mut self, obj: ObjectId, method: &str, args: &[Value]) -> Result<Value> {
        trace!(object = %self.name_of(obj), method, "unknown");
        if let Some(handler) = self.unknown_handler.clone() {
            if let Some(value) = handler.unknown(self, obj, method, args)? {
                return Ok(value);
            }
        }
        let unknown = self.system_of(obj).ok().and_then(|s| s.methods.unknown.clone());
        if let Some(unknown) = unknown {
            if unknown != method && self.search_object_and_classes(obj, &unknown)?.is_some() {
                let mut forwarded = Vec::with_capacity(args.len() + 1);
                forwarded.push(Value::from(method));
                forwarded.extend(args.iter().cloned());
                let flags = DispatchFlags {
                    ignore_permissions: true,
                    no_unknown: true,
                    ..DispatchFlags::default()
                };
                return self.dispatch_with(obj, &unknown, &forwarded, flags);
            }
        }
        Err(DispatchError::Unknown {
            object: self.name_of(obj),
            method: method.to_string(),
        })
    }

    /// Call the next implementation in the chain of the current method.
    /// Without `args` the arguments of the current call are passed on.
    pub fn next(&mut self, args: Option<&[Value]>) -> Result<Value> {
        let idx = self
            .stack
            .find_active_frame()
            .ok_or_else(|| DispatchError::NoActiveFrame("next".into()))?;
        let is_ensemble_leaf = self
            .stack
            .get(idx)
            .map_or(false, |f| f.frame_type == FrameType::Ensemble);
        if is_ensemble_leaf {
            let container = self
                .stack
                .find_ensemble_container(idx)
                .ok_or_else(|| DispatchError::NoActiveFrame("next".into()))?;
            return self.next_from(container, args, true);
        }
        self.next_from(idx, args, false)
    }

    pub(crate) fn next_from(&mut self, idx: usize, args: Option<&[Value]>, is_leaf_next: bool) -> Result<Value> {
        let frame = self
            .stack
            .get(idx)
            .cloned()
            .ok_or_else(|| DispatchError::NoActiveFrame("next".into()))?;
        let obj = frame.object;
        let args: Vec<Value> = match args {
            Some(args) => args.to_vec(),
            None => frame.args.to_vec(),
        };
        let saved_filter = self.filter_position(obj).and_then(|p| p.current);
        let saved_mixin = self.mixin_position(obj);

        let searched = self.search_next(&frame);
        let (found, end_of_chain) = match searched {
            Ok(found) => found,
            Err(err) => {
                self.set_filter_position(obj, saved_filter);
                self.set_mixin_position(obj, saved_mixin);
                return Err(err);
            }
        };

        let Some(resolved) = found else {
            let unknown = end_of_chain || (frame.flags.call_is_ensemble && !is_leaf_next);
            trace!(object = %self.name_of(obj), method = %frame.method_name, unknown, "no next method");
            if unknown {
                if let Some(f) = self.stack.get_mut(idx) {
                    f.flags.method_unknown = true;
                }
            }
            self.set_filter_position(obj, saved_filter);
            self.set_mixin_position(obj, saved_mixin);
            return Ok(Value::Nil);
        };

        trace!(object = %self.name_of(obj), method = %resolved.method_name, frame = ?resolved.frame_type, "next");
        if let Some(f) = self.stack.get_mut(idx) {
            f.flags.is_next_call = true;
            f.frame_type = frame.frame_type.deactivated();
        }
        let result = self.method_dispatch(
            obj,
            &frame.called_method,
            resolved,
            &args,
            &DispatchFlags::default(),
        );
        if let Some(f) = self.stack.get_mut(idx) {
            f.flags.is_next_call = false;
            f.frame_type = frame.frame_type;
        }
        self.set_filter_position(obj, saved_filter);
        self.set_mixin_position(obj, saved_mixin);
        result
    }

    /// Continue after the position of `frame`: remaining filters, then
    /// mixins, then the object namespace, then the class order. Reports
    /// whether the filter chain was exhausted.
    fn search_next(&mut self, frame: &CallStackContent) -> Result<(Option<Resolved>, bool)> {
        let obj = frame.object;
        let mut name = frame.method_name.clone();
        let mut cl = frame.cl;
        let mut end_of_chain = false;

        if matches!(frame.frame_type, FrameType::ActiveFilter | FrameType::InactiveFilter) {
            let order = self.filter_order(obj)?;
            let position = self.filter_position(obj);
            let current = position.as_ref().and_then(|p| p.current.clone());
            let start = seek_current(&order, current.as_ref(), |e: &FilterEntry, k: &FilterKey| {
                e.cl == k.cl && e.name == k.name
            });
            if let Some(entry) = self.search_filters(obj, &order, start)? {
                self.set_filter_position(obj, Some(entry.key()));
                let resolved = Resolved::new(entry.method, entry.cl, FrameType::ActiveFilter, &entry.name);
                return Ok((Some(resolved), false));
            }
            end_of_chain = true;
            name = position.map_or_else(|| frame.called_method.clone(), |p| p.called_method);
            cl = None;
        }

        let in_mixin = matches!(frame.frame_type, FrameType::ActiveMixin | FrameType::InactiveMixin);
        if (end_of_chain || in_mixin) && self.has_mixin_stack(obj) {
            let order = self.mixin_order(obj)?;
            let position = self.mixin_position(obj);
            let start = seek_current(&order, position.as_ref(), |e: &MixinEntry, c: &ClassId| e.class == *c);
            if let Some((mixin, method)) = self.search_mixins(obj, &order, start, &name)? {
                self.set_mixin_position(obj, Some(mixin));
                let resolved = Resolved::new(method, Some(mixin), FrameType::ActiveMixin, &name);
                return Ok((Some(resolved), end_of_chain));
            }
            cl = None;
        }

        let (own, class) = {
            let object = self.obj(obj)?;
            (object.method(&name).cloned(), object.class)
        };
        let running_own = match (&frame.cmd, &own) {
            (Some(current), Some(own)) => frame.cl.is_none() && Rc::ptr_eq(current, own),
            _ => false,
        };
        if (end_of_chain || cl.is_none()) && !running_own {
            if let Some(method) = own.filter(|m| !m.is_private()) {
                return Ok((Some(Resolved::new(method, None, FrameType::Plain, &name)), end_of_chain));
            }
        }

        let found = self
            .search_class_order(class, &name, cl)?
            .map(|(method, cl)| Resolved::new(method, cl, FrameType::Plain, &name));
        Ok((found, end_of_chain))
    }

    fn invoke_setter(&mut self, obj: ObjectId, method: &str, spec: &ParamSpec, args: &[Value]) -> Result<Value> {
        match args {
            [] => self.var(obj, &spec.name)?.ok_or_else(|| {
                DispatchError::Script(format!(
                    "{}: can't read \"{}\": no such variable",
                    self.name_of(obj),
                    spec.name
                ))
            }),
            [value] => {
                spec.validate(self, value).map_err(|source| DispatchError::Argument {
                    object: self.name_of(obj),
                    method: method.to_string(),
                    source,
                })?;
                self.set_var(obj, &spec.name, value.clone())?;
                Ok(value.clone())
            }
            [_, extra, ..] => Err(DispatchError::Argument {
                object: self.name_of(obj),
                method: method.to_string(),
                source: ArgError::TooManyArguments(extra.to_string()),
            }),
        }
    }

    fn invoke_ensemble(
        &mut self,
        idx: usize,
        obj: ObjectId,
        container: ObjectId,
        args: &[Value],
        flags: &DispatchFlags,
    ) -> Result<Value> {
        if let Some(f) = self.stack.get_mut(idx) {
            f.flags.call_is_ensemble = true;
        }
        let path = self
            .stack
            .get(idx)
            .map(|f| f.method_path.clone())
            .unwrap_or_default();

        let (sub, rest) = match args.split_first() {
            Some((first, rest)) if !flags.no_arg_shift => (first.to_string(), rest),
            _ => {
                let default = self.system_of(obj)?.methods.defaultmethod.clone();
                match default {
                    Some(name) => (name, args),
                    None => return Err(self.unknown_sub_method(obj, container, &path, "")),
                }
            }
        };

        if self.search_object_and_classes(container, &sub)?.is_none() {
            // A same-named ensemble further up may know the sub-method.
            let result = self.next_from(idx, Some(args), false)?;
            let unknown = self.stack.get_mut(idx).map_or(false, |f| {
                std::mem::replace(&mut f.flags.method_unknown, false)
            });
            if unknown {
                return Err(self.unknown_sub_method(obj, container, &path, &sub));
            }
            return Ok(result);
        }

        if !self.obj(container)?.flags.keep_caller_self {
            return self.dispatch(container, &sub, rest);
        }

        let Some((method, cl)) = self.search_object_and_classes(container, &sub)? else {
            return Err(self.unknown_sub_method(obj, container, &path, &sub));
        };
        let method = self.refetch_alias(method)?;
        let mut csc = CallStackContent::new(obj, &sub);
        csc.cl = cl;
        csc.cmd = Some(method.clone());
        csc.method_path = format!("{} {}", path, sub);
        csc.frame_type = FrameType::Ensemble;
        csc.args = rest.iter().cloned().collect();
        let sub_idx = self.stack.push(csc);
        self.retain(obj);
        trace!(object = %self.name_of(obj), path = %path, sub = %sub, "ensemble");
        let result = self.invoke(sub_idx, obj, &method, rest, &DispatchFlags::default());
        self.finalize(sub_idx, result)
    }

    fn unknown_sub_method(&mut self, obj: ObjectId, container: ObjectId, path: &str, sub: &str) -> DispatchError {
        let valid = self.visible_method_names(container).unwrap_or_default();
        DispatchError::UnknownSubMethod {
            object: self.name_of(obj),
            path: path.to_string(),
            sub: sub.to_string(),
            valid: valid.into_iter().collect::<Vec<_>>().join(", "),
        }
    }

    /// Public method names reachable on `obj` through its namespace and
    /// class order, without interceptors.
    pub(crate) fn visible_method_names(&mut self, obj: ObjectId) -> Result<BTreeSet<String>> {
        let object = self.obj(obj)?;
        let mut names: BTreeSet<String> = object
            .methods
            .iter()
            .flatten()
            .filter(|(_, m)| !m.is_private())
            .map(|(name, _)| name.clone())
            .collect();
        let class = object.class;
        for cl in self.precedence_order(class)?.iter() {
            if self.is_root_class(*cl) {
                continue;
            }
            names.extend(
                self.class_rec(*cl)?
                    .methods
                    .iter()
                    .filter(|(_, m)| !m.is_private())
                    .map(|(name, _)| name.clone()),
            );
        }
        Ok(names)
    }

    fn check_assertions(&mut self, obj: ObjectId, method: &Method, phase: Phase) -> Result<()> {
        if !self.config.assertions_enabled || self.assertion_depth > 0 {
            return Ok(());
        }
        // The method may have destroyed its own receiver.
        let Ok(object) = self.obj(obj) else {
            return Ok(());
        };
        let check = object.opt.check;
        let mut predicates: Vec<Predicate> = match phase {
            Phase::Pre if check.pre => method.pre.clone(),
            Phase::Post if check.post => method.post.clone(),
            _ => Vec::new(),
        };
        if check.object_invariants {
            predicates.extend(object.opt.invariants.iter().cloned());
        }
        let class = object.class;
        if check.class_invariants {
            for cl in self.precedence_order(class)?.iter() {
                predicates.extend(self.class_rec(*cl)?.opt.invariants.iter().cloned());
            }
        }
        if predicates.is_empty() {
            return Ok(());
        }

        self.assertion_depth += 1;
        let mut outcome = Ok(());
        for predicate in &predicates {
            match predicate.eval(self) {
                Ok(true) => {}
                Ok(false) => {
                    outcome = Err(DispatchError::Assertion {
                        object: self.name_of(obj),
                        method: method.name.clone(),
                        expr: predicate.source.clone(),
                    });
                    break;
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.assertion_depth -= 1;
        outcome
    }
}
