use crate::error::{DispatchError, Result};
use crate::runtime::Runtime;
use crate::types::ObjectId;
use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

type EvalFn = Rc<dyn Fn(&mut Runtime, ObjectId) -> Result<Value>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    /// The receiver of the forwarder
    SelfObject,
    Object(ObjectId),
    /// Registered command path, e.g. "::log::write"
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    End,
    Index(usize),
}

#[derive(Clone)]
pub enum ForwardArg {
    Literal(Value),
    /// The receiver of the forwarder
    SelfRef,
    /// Name the forwarder was called under
    MethodName,
    /// Next unconsumed caller argument
    Positional { default: Option<Value> },
    /// "-flag value" taken from the caller arguments
    FlagPassThrough { flag: String, default: Option<Value> },
    Eval(EvalFn),
    /// Inserted at a position of the final argument list
    AtPosition { pos: Placement, arg: Box<ForwardArg> },
}

impl ForwardArg {
    pub fn literal(value: impl Into<Value>) -> Self {
        ForwardArg::Literal(value.into())
    }

    pub fn positional() -> Self {
        ForwardArg::Positional { default: None }
    }

    pub fn flag(flag: &str) -> Self {
        ForwardArg::FlagPassThrough {
            flag: flag.to_string(),
            default: None,
        }
    }

    pub fn eval<F>(f: F) -> Self
    where
        F: Fn(&mut Runtime, ObjectId) -> Result<Value> + 'static,
    {
        ForwardArg::Eval(Rc::new(f))
    }

    pub fn at(pos: Placement, arg: ForwardArg) -> Self {
        ForwardArg::AtPosition {
            pos,
            arg: Box::new(arg),
        }
    }
}

#[derive(Clone)]
pub struct ForwardSpec {
    pub target: ForwardTarget,
    pub template: Vec<ForwardArg>,
    /// Prepended to the method name sent to an object target
    pub method_prefix: Option<String>,
    /// Method of the receiver called with the error message when the
    /// forwarded call fails
    pub on_error: Option<String>,
}

impl ForwardSpec {
    pub fn new(target: ForwardTarget) -> Self {
        Self {
            target,
            template: Vec::new(),
            method_prefix: None,
            on_error: None,
        }
    }

    pub fn arg(mut self, arg: ForwardArg) -> Self {
        self.template.push(arg);
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.method_prefix = Some(prefix.to_string());
        self
    }

    pub fn on_error(mut self, method: &str) -> Self {
        self.on_error = Some(method.to_string());
        self
    }
}

struct CallerArgs<'a> {
    args: &'a [Value],
    consumed: Vec<bool>,
}

impl<'a> CallerArgs<'a> {
    fn new(args: &'a [Value]) -> Self {
        Self {
            args,
            consumed: vec![false; args.len()],
        }
    }

    fn take_flag(&mut self, flag: &str) -> Option<Value> {
        let pos = (0..self.args.len())
            .find(|i| !self.consumed[*i] && self.args[*i].as_str() == Some(flag))?;
        self.consumed[pos] = true;
        let value = pos + 1;
        if value < self.args.len() && !self.consumed[value] {
            self.consumed[value] = true;
            Some(self.args[value].clone())
        } else {
            None
        }
    }

    fn take_next(&mut self) -> Option<Value> {
        let pos = self.consumed.iter().position(|c| !c)?;
        self.consumed[pos] = true;
        Some(self.args[pos].clone())
    }

    fn rest(&self) -> impl Iterator<Item = &Value> {
        self.args
            .iter()
            .zip(&self.consumed)
            .filter(|(_, consumed)| !**consumed)
            .map(|(v, _)| v)
    }
}

fn collect_flags<'a>(template: &'a [ForwardArg], out: &mut Vec<&'a str>) {
    for arg in template {
        match arg {
            ForwardArg::FlagPassThrough { flag, .. } => out.push(flag),
            ForwardArg::AtPosition { arg, .. } => collect_flags(std::slice::from_ref(arg), out),
            _ => {}
        }
    }
}

/// Expand one template element; an absent flag without default and an
/// exhausted positional without default produce nothing.
fn expand(
    rt: &mut Runtime,
    arg: &ForwardArg,
    obj: ObjectId,
    method: &str,
    caller: &mut CallerArgs<'_>,
    flags: &HashMap<String, Option<Value>>,
    out: &mut Vec<Value>,
) -> Result<()> {
    match arg {
        ForwardArg::Literal(v) => out.push(v.clone()),
        ForwardArg::SelfRef => out.push(Value::Object(obj)),
        ForwardArg::MethodName => out.push(Value::from(method)),
        ForwardArg::Positional { default } => {
            if let Some(v) = caller.take_next().or_else(|| default.clone()) {
                out.push(v);
            }
        }
        ForwardArg::FlagPassThrough { flag, default } => {
            if let Some(v) = flags.get(flag).cloned().flatten().or_else(|| default.clone()) {
                out.push(Value::from(flag.as_str()));
                out.push(v);
            }
        }
        ForwardArg::Eval(f) => out.push(f(rt, obj)?),
        ForwardArg::AtPosition { arg, .. } => expand(rt, arg, obj, method, caller, flags, out)?,
    }
    Ok(())
}

/// Substitute the template against the caller arguments.
pub(crate) fn build_args(
    rt: &mut Runtime,
    spec: &ForwardSpec,
    obj: ObjectId,
    method: &str,
    args: &[Value],
) -> Result<Vec<Value>> {
    let mut caller = CallerArgs::new(args);

    let mut flag_names = Vec::new();
    collect_flags(&spec.template, &mut flag_names);
    let mut flags = HashMap::new();
    for flag in flag_names {
        let value = caller.take_flag(flag);
        flags.insert(flag.to_string(), value);
    }

    let mut out = Vec::new();
    let mut placed = Vec::new();
    for arg in &spec.template {
        match arg {
            ForwardArg::AtPosition { pos, arg } => {
                let mut values = Vec::new();
                expand(rt, arg, obj, method, &mut caller, &flags, &mut values)?;
                placed.push((*pos, values));
            }
            _ => expand(rt, arg, obj, method, &mut caller, &flags, &mut out)?,
        }
    }
    out.extend(caller.rest().cloned());

    for (pos, values) in placed {
        match pos {
            Placement::End => out.extend(values),
            Placement::Index(i) => {
                let at = i.min(out.len());
                out.splice(at..at, values);
            }
        }
    }
    Ok(out)
}

impl Runtime {
    pub(crate) fn invoke_forward(
        &mut self,
        obj: ObjectId,
        method: &str,
        spec: &ForwardSpec,
        args: &[Value],
    ) -> Result<Value> {
        let mut out = build_args(self, spec, obj, method, args)?;
        let result = match &spec.target {
            ForwardTarget::Command(path) => {
                trace!(object = %self.name_of(obj), command = %path, "forward");
                self.dispatch(obj, path, &out)
            }
            ForwardTarget::SelfObject | ForwardTarget::Object(_) => {
                let target = match spec.target {
                    ForwardTarget::Object(id) => id,
                    _ => obj,
                };
                let name = if spec.template.is_empty() || out.is_empty() {
                    method.to_string()
                } else {
                    out.remove(0).to_string()
                };
                let name = match &spec.method_prefix {
                    Some(prefix) => format!("{}{}", prefix, name),
                    None => name,
                };
                trace!(object = %self.name_of(obj), target = %self.name_of(target), method = %name, "forward");
                self.dispatch(target, &name, &out)
            }
        };
        match (result, &spec.on_error) {
            (Err(err), Some(handler)) if !matches!(err, DispatchError::Recursion(_)) => {
                self.dispatch(obj, handler, &[Value::from(err.to_string())])
            }
            (result, _) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[Value]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_unconsumed_args_are_appended() {
        let mut rt = Runtime::new();
        let obj = ObjectId {
            index: 0,
            generation: 0,
        };
        let spec = ForwardSpec::new(ForwardTarget::Command("::cmd".into()))
            .arg(ForwardArg::literal("put"))
            .arg(ForwardArg::positional());
        let args = vec![Value::from("a"), Value::from("b"), Value::from("c")];
        let out = build_args(&mut rt, &spec, obj, "m", &args).unwrap();
        assert_eq!(strings(&out), vec!["put", "a", "b", "c"]);
    }

    #[test]
    fn test_flag_pass_through_and_defaults() {
        let mut rt = Runtime::new();
        let obj = ObjectId {
            index: 0,
            generation: 0,
        };
        let spec = ForwardSpec::new(ForwardTarget::Command("::cmd".into()))
            .arg(ForwardArg::flag("-level"))
            .arg(ForwardArg::FlagPassThrough {
                flag: "-mode".into(),
                default: Some(Value::from("fast")),
            })
            .arg(ForwardArg::flag("-absent"))
            .arg(ForwardArg::Positional {
                default: Some(Value::from("none")),
            });
        let args = vec![Value::from("x"), Value::from("-level"), Value::from(3i64)];
        let out = build_args(&mut rt, &spec, obj, "m", &args).unwrap();
        assert_eq!(strings(&out), vec!["-level", "3", "-mode", "fast", "x"]);
    }

    #[test]
    fn test_placements() {
        let mut rt = Runtime::new();
        let obj = ObjectId {
            index: 0,
            generation: 0,
        };
        let spec = ForwardSpec::new(ForwardTarget::Command("::cmd".into()))
            .arg(ForwardArg::at(Placement::End, ForwardArg::literal("last")))
            .arg(ForwardArg::at(Placement::Index(0), ForwardArg::MethodName))
            .arg(ForwardArg::literal("mid"));
        let out = build_args(&mut rt, &spec, obj, "m", &[Value::from("a")]).unwrap();
        assert_eq!(strings(&out), vec!["m", "mid", "a", "last"]);
    }
}
