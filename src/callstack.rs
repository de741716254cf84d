// TreeNX Call Stack - per-invocation context and chain positions
//
// Every dispatch pushes a CallStackContent. Frames marked `scoped` are the
// ones a method body can see (self, next, calling context); leaf native
// calls are tracked without being scoped. Chain positions for mixins and
// filters live on the receiving object as LIFO stacks.

use crate::error::{DispatchError, Result};
use crate::method::Method;
use crate::object::{FilterKey, FilterStackEntry};
use crate::runtime::Runtime;
use crate::types::{ClassId, ObjectId};
use crate::value::Value;
use smallvec::SmallVec;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Plain,
    ActiveMixin,
    ActiveFilter,
    InactiveMixin,
    InactiveFilter,
    /// Sub-method of an ensemble
    Ensemble,
}

impl FrameType {
    pub fn is_inactive(self) -> bool {
        matches!(self, FrameType::InactiveMixin | FrameType::InactiveFilter)
    }

    /// Active interceptor frames become inactive while they run a next call.
    pub fn deactivated(self) -> Self {
        match self {
            FrameType::ActiveMixin => FrameType::InactiveMixin,
            FrameType::ActiveFilter => FrameType::InactiveFilter,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// This frame is currently running a next call
    pub is_next_call: bool,
    /// The method of this frame is an ensemble dispatching a sub-method
    pub call_is_ensemble: bool,
    pub force_frame: bool,
    pub immediate: bool,
    /// A next call found nothing; unknown handling runs when the frame finishes
    pub method_unknown: bool,
    /// Dispatched with local-only access
    pub local: bool,
    /// Frame of a guard evaluation
    pub guard: bool,
    pub mixin_stack_pushed: bool,
    pub filter_stack_pushed: bool,
}

#[derive(Debug, Clone)]
pub struct CallStackContent {
    pub object: ObjectId,
    /// Class whose method runs; `None` for object-local methods
    pub cl: Option<ClassId>,
    pub cmd: Option<Rc<Method>>,
    /// Name the implementation was found under
    pub method_name: String,
    /// Name the caller asked for (differs for filters)
    pub called_method: String,
    /// Full path used in error messages, e.g. "info children"
    pub method_path: String,
    pub frame_type: FrameType,
    pub flags: CallFlags,
    pub args: SmallVec<[Value; 4]>,
    pub scoped: bool,
}

impl CallStackContent {
    pub fn new(object: ObjectId, method_name: &str) -> Self {
        Self {
            object,
            cl: None,
            cmd: None,
            method_name: method_name.to_string(),
            called_method: method_name.to_string(),
            method_path: method_name.to_string(),
            frame_type: FrameType::Plain,
            flags: CallFlags::default(),
            args: SmallVec::new(),
            scoped: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallStackContent>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, csc: CallStackContent) -> usize {
        self.frames.push(csc);
        self.frames.len() - 1
    }

    pub fn pop(&mut self) -> Option<CallStackContent> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&CallStackContent> {
        self.frames.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut CallStackContent> {
        self.frames.get_mut(idx)
    }

    /// Nearest scoped frame, i.e. the currently executing method.
    pub fn find_active_frame(&self) -> Option<usize> {
        self.frames.iter().rposition(|f| f.scoped)
    }

    /// Nearest scoped frame below the active one that is a real invocation:
    /// frames running next, inactive interceptor frames and ensemble
    /// containers are skipped.
    pub fn find_last_invocation_frame(&self) -> Option<usize> {
        let active = self.find_active_frame()?;
        self.frames[..active].iter().rposition(|f| {
            f.scoped
                && !f.flags.guard
                && !f.flags.is_next_call
                && !f.flags.call_is_ensemble
                && !f.frame_type.is_inactive()
        })
    }

    /// Nearest ensemble container below `idx`.
    pub fn find_ensemble_container(&self, idx: usize) -> Option<usize> {
        self.frames[..idx.min(self.frames.len())]
            .iter()
            .rposition(|f| f.flags.call_is_ensemble)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallStackContent> {
        self.frames.iter()
    }
}

/// Index of the entry after `last` in `list`: 0 without a last position,
/// `list.len()` when the last position is no longer present.
pub fn seek_current<T, K: ?Sized>(list: &[T], last: Option<&K>, is: impl Fn(&T, &K) -> bool) -> usize {
    match last {
        None => 0,
        Some(key) => list
            .iter()
            .position(|entry| is(entry, key))
            .map_or(list.len(), |pos| pos + 1),
    }
}

impl Runtime {
    pub(crate) fn push_mixin_stack(&mut self, obj: ObjectId) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.mixin_stack.push(None);
        }
    }

    pub(crate) fn pop_mixin_stack(&mut self, obj: ObjectId) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.mixin_stack.pop();
        }
    }

    pub(crate) fn set_mixin_position(&mut self, obj: ObjectId, cl: Option<ClassId>) {
        if let Some(top) = self
            .objects
            .get_mut(obj)
            .and_then(|o| o.mixin_stack.last_mut())
        {
            *top = cl;
        }
    }

    pub(crate) fn mixin_position(&self, obj: ObjectId) -> Option<ClassId> {
        self.objects
            .get(obj)
            .and_then(|o| o.mixin_stack.last().copied())
            .flatten()
    }

    pub(crate) fn has_mixin_stack(&self, obj: ObjectId) -> bool {
        self.objects
            .get(obj)
            .map_or(false, |o| !o.mixin_stack.is_empty())
    }

    pub(crate) fn push_filter_stack(&mut self, obj: ObjectId, called_method: &str) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.filter_stack.push(FilterStackEntry {
                current: None,
                called_method: called_method.to_string(),
            });
        }
    }

    pub(crate) fn pop_filter_stack(&mut self, obj: ObjectId) {
        if let Some(object) = self.objects.get_mut(obj) {
            object.filter_stack.pop();
        }
    }

    pub(crate) fn set_filter_position(&mut self, obj: ObjectId, key: Option<FilterKey>) {
        if let Some(top) = self
            .objects
            .get_mut(obj)
            .and_then(|o| o.filter_stack.last_mut())
        {
            top.current = key;
        }
    }

    pub(crate) fn filter_position(&self, obj: ObjectId) -> Option<FilterStackEntry> {
        self.objects
            .get(obj)
            .and_then(|o| o.filter_stack.last().cloned())
    }

    fn active_frame(&self) -> Result<&CallStackContent> {
        self.stack
            .find_active_frame()
            .and_then(|idx| self.stack.get(idx))
            .ok_or_else(|| DispatchError::NoActiveFrame("current".into()))
    }

    /// Self of the currently executing method.
    pub fn current_self(&self) -> Result<ObjectId> {
        Ok(self.active_frame()?.object)
    }

    pub(crate) fn caller_self(&self) -> Option<ObjectId> {
        self.active_frame().ok().map(|f| f.object)
    }

    /// Class of the currently executing method; `None` for object methods.
    pub fn current_class(&self) -> Result<Option<ClassId>> {
        Ok(self.active_frame()?.cl)
    }

    pub fn current_method(&self) -> Result<String> {
        Ok(self.active_frame()?.method_name.clone())
    }

    pub fn current_args(&self) -> Result<Vec<Value>> {
        Ok(self.active_frame()?.args.to_vec())
    }

    pub fn current_frame_type(&self) -> Result<FrameType> {
        Ok(self.active_frame()?.frame_type)
    }

    /// Method the caller asked for; inside a filter this is the filtered
    /// method rather than the filter itself.
    pub fn called_method(&self) -> Result<String> {
        let frame = self.active_frame()?;
        if matches!(
            frame.frame_type,
            FrameType::ActiveFilter | FrameType::InactiveFilter
        ) {
            if let Some(entry) = self.filter_position(frame.object) {
                return Ok(entry.called_method);
            }
        }
        Ok(frame.called_method.clone())
    }

    /// Whether the current method was reached through next.
    pub fn is_next_call(&self) -> bool {
        match self.stack.find_active_frame() {
            Some(idx) if idx > 0 => self.stack.frames[..idx]
                .iter()
                .rev()
                .find(|f| f.scoped && !f.flags.guard)
                .map_or(false, |f| f.flags.is_next_call),
            _ => false,
        }
    }

    pub fn calling_object(&self) -> Option<ObjectId> {
        self.stack
            .find_last_invocation_frame()
            .and_then(|idx| self.stack.get(idx))
            .map(|f| f.object)
    }

    pub fn calling_class(&self) -> Option<ClassId> {
        self.stack
            .find_last_invocation_frame()
            .and_then(|idx| self.stack.get(idx))
            .and_then(|f| f.cl)
    }

    pub fn calling_method(&self) -> Option<String> {
        self.stack
            .find_last_invocation_frame()
            .and_then(|idx| self.stack.get(idx))
            .map(|f| f.method_name.clone())
    }

    /// Depth of the calling frame; 0 means the call came from top level.
    pub fn calling_level(&self) -> usize {
        self.stack
            .find_last_invocation_frame()
            .map_or(0, |idx| {
                self.stack.frames[..=idx].iter().filter(|f| f.scoped).count()
            })
    }

    pub fn call_depth(&self) -> usize {
        self.stack.len()
    }
}
