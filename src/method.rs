use crate::error::Result;
use crate::forward::ForwardSpec;
use crate::params::{ParamSpec, ParsedArgs, ValueCheck};
use crate::runtime::Runtime;
use crate::types::ObjectId;
use crate::value::Value;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Body of a scripted method. Self and the defining class are available
/// through the runtime's calling-context queries.
pub type ScriptBody = Rc<dyn Fn(&mut Runtime, &ParsedArgs) -> Result<Value>>;

/// Native callback: receives self and the raw argument vector.
pub type NativeFn = Rc<dyn Fn(&mut Runtime, ObjectId, &[Value]) -> Result<Value>>;

type PredicateFn = Rc<dyn Fn(&mut Runtime) -> Result<bool>>;

/// A named boolean test evaluated in the scope of a call on the receiver.
#[derive(Clone)]
pub struct Predicate {
    /// Source text reported in error messages
    pub source: String,
    test: PredicateFn,
}

/// Guards on mixin and filter registrations are predicates.
pub type Guard = Predicate;

impl Predicate {
    pub fn new<F>(source: &str, test: F) -> Self
    where
        F: Fn(&mut Runtime) -> Result<bool> + 'static,
    {
        Self {
            source: source.to_string(),
            test: Rc::new(test),
        }
    }

    pub fn constant(value: bool) -> Self {
        Self::new(if value { "true" } else { "false" }, move |_| Ok(value))
    }

    pub fn eval(&self, rt: &mut Runtime) -> Result<bool> {
        (self.test)(rt)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// Target of an alias: a registry path plus the last fetched implementation
pub struct AliasTarget {
    pub path: String,
    /// (epoch, implementation) seen on the last fetch
    pub(crate) cache: RefCell<Option<(u64, Rc<Method>)>>,
}

impl AliasTarget {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            cache: RefCell::new(None),
        }
    }
}

pub enum MethodKind {
    Scripted { params: Vec<ParamSpec>, body: ScriptBody },
    Native { callback: NativeFn, leaf: bool },
    Forward(ForwardSpec),
    Alias(AliasTarget),
    /// Reads or writes the instance variable named by the parameter
    Setter(ParamSpec),
    /// Sub-command namespace backed by an ensemble object
    Ensemble(ObjectId),
}

/// Implementation kind as reported by introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImplementationKind {
    Scripted,
    Native,
    Forward,
    Alias,
    Setter,
    Ensemble,
}

pub struct Method {
    pub name: String,
    pub kind: MethodKind,
    pub visibility: Visibility,
    /// Only callable on receivers that are classes
    pub class_only: bool,
    /// Declared return constraint
    pub returns: Option<ValueCheck>,
    pub pre: Vec<Predicate>,
    pub post: Vec<Predicate>,
    /// Registration epoch, bumped on every (re)definition
    pub(crate) epoch: u64,
}

impl Method {
    fn with_kind(name: &str, kind: MethodKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            visibility: Visibility::Public,
            class_only: false,
            returns: None,
            pre: Vec::new(),
            post: Vec::new(),
            epoch: 0,
        }
    }

    pub fn scripted<F>(name: &str, params: Vec<ParamSpec>, body: F) -> Self
    where
        F: Fn(&mut Runtime, &ParsedArgs) -> Result<Value> + 'static,
    {
        Self::with_kind(
            name,
            MethodKind::Scripted {
                params,
                body: Rc::new(body),
            },
        )
    }

    /// Native method; leaf by default (no frame, so no next or self queries)
    pub fn native<F>(name: &str, callback: F) -> Self
    where
        F: Fn(&mut Runtime, ObjectId, &[Value]) -> Result<Value> + 'static,
    {
        Self::with_kind(
            name,
            MethodKind::Native {
                callback: Rc::new(callback),
                leaf: true,
            },
        )
    }

    pub fn forward(name: &str, spec: ForwardSpec) -> Self {
        Self::with_kind(name, MethodKind::Forward(spec))
    }

    pub fn alias(name: &str, target_path: &str) -> Self {
        Self::with_kind(name, MethodKind::Alias(AliasTarget::new(target_path)))
    }

    pub fn setter(name: &str, spec: ParamSpec) -> Self {
        Self::with_kind(name, MethodKind::Setter(spec))
    }

    pub fn ensemble(name: &str, container: ObjectId) -> Self {
        Self::with_kind(name, MethodKind::Ensemble(container))
    }

    pub fn protected(mut self) -> Self {
        self.visibility = Visibility::Protected;
        self
    }

    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    pub fn class_only(mut self) -> Self {
        self.class_only = true;
        self
    }

    pub fn returns(mut self, check: ValueCheck) -> Self {
        self.returns = Some(check);
        self
    }

    pub fn pre(mut self, predicate: Predicate) -> Self {
        self.pre.push(predicate);
        self
    }

    pub fn post(mut self, predicate: Predicate) -> Self {
        self.post.push(predicate);
        self
    }

    /// Give a native method a frame so it can call next and query self.
    pub fn non_leaf(mut self) -> Self {
        if let MethodKind::Native { leaf, .. } = &mut self.kind {
            *leaf = false;
        }
        self
    }

    pub fn implementation_kind(&self) -> ImplementationKind {
        match self.kind {
            MethodKind::Scripted { .. } => ImplementationKind::Scripted,
            MethodKind::Native { .. } => ImplementationKind::Native,
            MethodKind::Forward(_) => ImplementationKind::Forward,
            MethodKind::Alias(_) => ImplementationKind::Alias,
            MethodKind::Setter(_) => ImplementationKind::Setter,
            MethodKind::Ensemble(_) => ImplementationKind::Ensemble,
        }
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("kind", &self.implementation_kind())
            .field("visibility", &self.visibility)
            .field("class_only", &self.class_only)
            .field("epoch", &self.epoch)
            .finish()
    }
}
