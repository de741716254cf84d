use crate::error::ArgError;
use crate::runtime::Runtime;
use crate::types::ClassId;
use crate::value::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Positional,
    /// "-name value"
    NonPositional,
    /// "-name" without a value
    Switch,
    /// Collects all remaining arguments as a list
    Rest,
}

/// Value constraint used by parameters, setters and return checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCheck {
    Integer,
    Boolean,
    Number,
    Str,
    Object,
    Class,
    /// Object whose class order contains the given class
    ObjectOf(ClassId),
}

impl ValueCheck {
    pub fn matches(&self, rt: &Runtime, value: &Value) -> bool {
        match self {
            ValueCheck::Integer => value.is_integer(),
            ValueCheck::Boolean => value.is_boolean(),
            ValueCheck::Number => value.is_number(),
            ValueCheck::Str => !matches!(value, Value::List(_)),
            ValueCheck::Object => value.as_object().map_or(false, |id| rt.is_object(id)),
            ValueCheck::Class => value.as_object().map_or(false, |id| rt.is_class(id)),
            ValueCheck::ObjectOf(cl) => value
                .as_object()
                .map_or(false, |id| rt.is_instance_of(id, *cl)),
        }
    }
}

impl fmt::Display for ValueCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueCheck::Integer => f.write_str("integer"),
            ValueCheck::Boolean => f.write_str("boolean"),
            ValueCheck::Number => f.write_str("number"),
            ValueCheck::Str => f.write_str("string"),
            ValueCheck::Object => f.write_str("object"),
            ValueCheck::Class => f.write_str("class"),
            ValueCheck::ObjectOf(cl) => write!(f, "object of type {}", cl),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub check: Option<ValueCheck>,
}

impl ParamSpec {
    fn with_kind(name: &str, kind: ParamKind, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required,
            default: None,
            check: None,
        }
    }

    /// Required positional parameter
    pub fn positional(name: &str) -> Self {
        Self::with_kind(name, ParamKind::Positional, true)
    }

    /// Optional "-name value" parameter
    pub fn flag(name: &str) -> Self {
        Self::with_kind(name, ParamKind::NonPositional, false)
    }

    pub fn switch(name: &str) -> Self {
        Self::with_kind(name, ParamKind::Switch, false)
    }

    pub fn rest(name: &str) -> Self {
        Self::with_kind(name, ParamKind::Rest, false)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// A default makes the parameter optional.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }

    pub fn check(mut self, check: ValueCheck) -> Self {
        self.check = Some(check);
        self
    }

    pub fn is_non_positional(&self) -> bool {
        matches!(self.kind, ParamKind::NonPositional | ParamKind::Switch)
    }

    pub(crate) fn validate(&self, rt: &Runtime, value: &Value) -> Result<(), ArgError> {
        match self.check {
            Some(check) if !check.matches(rt, value) => Err(ArgError::TypeMismatch {
                param: self.name.clone(),
                expected: check.to_string(),
                value: value.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Validated, defaulted arguments in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArgs {
    values: Vec<(String, Value)>,
}

impl ParsedArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn match_flag<'a>(specs: &'a [ParamSpec], flag: &str) -> Result<&'a ParamSpec, ArgError> {
    let name = &flag[1..];
    let flags: Vec<&ParamSpec> = specs.iter().filter(|s| s.is_non_positional()).collect();
    if let Some(spec) = flags.iter().find(|s| s.name == name) {
        return Ok(*spec);
    }
    let candidates: Vec<&'a ParamSpec> = flags
        .iter()
        .copied()
        .filter(|s| s.name.starts_with(name))
        .collect();
    match candidates.len() {
        1 => Ok(candidates[0]),
        0 => Err(ArgError::UnknownFlag {
            flag: flag.to_string(),
            valid: flags
                .iter()
                .map(|s| format!("-{}", s.name))
                .collect::<Vec<_>>()
                .join(", "),
        }),
        _ => Err(ArgError::AmbiguousFlag {
            flag: flag.to_string(),
            candidates: candidates
                .iter()
                .map(|s| format!("-{}", s.name))
                .collect::<Vec<_>>()
                .join(" and "),
        }),
    }
}

pub fn parse_args(rt: &Runtime, specs: &[ParamSpec], args: &[Value]) -> Result<ParsedArgs, ArgError> {
    let mut provided: Vec<Option<Value>> = vec![None; specs.len()];
    let has_flags = specs.iter().any(|s| s.is_non_positional());
    let mut pos = 0;

    if has_flags {
        while pos < args.len() {
            let arg = &args[pos];
            if arg.as_str() == Some("--") {
                pos += 1;
                break;
            }
            if !arg.is_flag() {
                break;
            }
            let flag = arg.to_string();
            let spec = match_flag(specs, &flag)?;
            let idx = specs
                .iter()
                .position(|s| std::ptr::eq(s, spec))
                .unwrap_or_default();
            match spec.kind {
                ParamKind::Switch => {
                    provided[idx] = Some(Value::Bool(true));
                    pos += 1;
                }
                _ => {
                    let value = args
                        .get(pos + 1)
                        .ok_or_else(|| ArgError::MissingFlagValue(spec.name.clone()))?;
                    provided[idx] = Some(value.clone());
                    pos += 2;
                }
            }
        }
    }

    for (idx, spec) in specs.iter().enumerate() {
        match spec.kind {
            ParamKind::Positional => {
                if let Some(value) = args.get(pos) {
                    provided[idx] = Some(value.clone());
                    pos += 1;
                }
            }
            ParamKind::Rest => {
                provided[idx] = Some(Value::List(args[pos.min(args.len())..].to_vec()));
                pos = args.len();
            }
            _ => {}
        }
    }

    if let Some(extra) = args.get(pos) {
        return Err(ArgError::TooManyArguments(extra.to_string()));
    }

    let mut parsed = ParsedArgs::default();
    for (spec, value) in specs.iter().zip(provided) {
        let value = match value {
            Some(v) => {
                spec.validate(rt, &v)?;
                v
            }
            None => match (&spec.default, spec.kind) {
                (Some(d), _) => d.clone(),
                (None, ParamKind::Switch) => Value::Bool(false),
                (None, _) if spec.required => {
                    return Err(ArgError::MissingRequired(spec.name.clone()))
                }
                (None, _) => continue,
            },
        };
        parsed.values.push((spec.name.clone(), value));
    }
    Ok(parsed)
}
