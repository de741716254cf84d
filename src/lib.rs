// TreeNX: Dynamic Object System Core
// Classes with multiple inheritance, per-object and per-class mixins and
// filters, and a dispatcher with next-chaining over all of them.

pub mod types;
pub mod value;
pub mod error;
pub mod config;
pub mod counters;
pub mod arena;
pub mod object;
pub mod method;
pub mod params;
pub mod graph;
pub mod linearize;
pub mod interceptors;
pub mod callstack;
pub mod lookup;
pub mod dispatch;
pub mod forward;
pub mod runtime;

pub use callstack::FrameType;
pub use config::RuntimeConfig;
pub use dispatch::DispatchFlags;
pub use error::{ArgError, DispatchError, Result};
pub use forward::{ForwardArg, ForwardSpec, ForwardTarget, Placement};
pub use interceptors::InterceptorInfo;
pub use method::{Guard, ImplementationKind, Method, Predicate, Visibility};
pub use object::{CheckOptions, FilterReg, MixinReg};
pub use params::{ParamSpec, ParsedArgs, ValueCheck};
pub use runtime::{MethodHandleInfo, Runtime, SystemMethods, UnknownHandler};
pub use types::{ClassId, ObjectId, SystemId};
pub use value::Value;
