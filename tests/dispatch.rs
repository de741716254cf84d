use std::cell::RefCell;
use std::rc::Rc;
use treenx::{
    ArgError, CheckOptions, ClassId, DispatchError, DispatchFlags, ForwardArg, ForwardSpec,
    ForwardTarget, ImplementationKind, Method, MixinReg, ObjectId, ParamSpec, Predicate, Runtime,
    RuntimeConfig, SystemMethods, UnknownHandler, Value, ValueCheck,
};

fn system_methods() -> SystemMethods {
    SystemMethods {
        init: Some("init".into()),
        destroy: Some("destroy".into()),
        unknown: Some("unknown".into()),
        defaultmethod: Some("defaultmethod".into()),
    }
}

fn new_runtime() -> (Runtime, ClassId, ClassId) {
    let mut rt = Runtime::new();
    let (root, meta) = rt.create_object_system("Object", "Class", system_methods()).unwrap();
    (rt, root, meta)
}

fn constant(name: &'static str, value: &'static str) -> Method {
    Method::native(name, move |_, _, _| Ok(Value::from(value)))
}

fn text(result: Result<Value, DispatchError>) -> String {
    result.unwrap().to_string()
}

fn count(rt: &mut Runtime) -> Result<i64, DispatchError> {
    let me = rt.current_self()?;
    Ok(rt.var(me, "count")?.and_then(|v| v.as_int()).unwrap_or(0))
}

#[test]
fn next_walks_the_class_order() {
    let (mut rt, _, meta) = new_runtime();
    let base = rt.create_class("Base", meta, &[]).unwrap();
    let c = rt.create_class("C", meta, &[base]).unwrap();
    rt.define_method(base, constant("describe", "base")).unwrap();
    rt.define_method(
        c,
        Method::scripted("describe", vec![], |rt, _| {
            let inner = rt.next(None)?;
            Ok(Value::from(format!("c+{}", inner)))
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "describe", &[])), "c+base");
    assert_eq!(rt.call_depth(), 0);
}

#[test]
fn next_passes_explicit_arguments() {
    let (mut rt, _, meta) = new_runtime();
    let base = rt.create_class("Base", meta, &[]).unwrap();
    let c = rt.create_class("C", meta, &[base]).unwrap();
    rt.define_method(
        base,
        Method::scripted("scale", vec![ParamSpec::positional("x")], |_, args| {
            Ok(args.get("x").cloned().unwrap_or(Value::Nil))
        }),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::scripted("scale", vec![ParamSpec::positional("x")], |rt, args| {
            let x = args.get("x").and_then(|v| v.as_int()).unwrap_or(0);
            rt.next(Some(&[Value::from(x * 10)]))
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    let result = rt.dispatch(o, "scale", &[Value::from(4i64)]).unwrap();
    assert_eq!(result.as_int(), Some(40));
}

#[test]
fn next_without_a_successor_returns_nil() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, Method::scripted("last", vec![], |rt, _| rt.next(None)))
        .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    assert_eq!(rt.dispatch(o, "last", &[]).unwrap(), Value::Nil);
}

#[test]
fn next_outside_a_method_fails() {
    let mut rt = Runtime::new();
    assert!(matches!(
        rt.next(None),
        Err(DispatchError::NoActiveFrame(_))
    ));
}

#[test]
fn protected_methods_need_self_as_caller() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("secret", "s").protected()).unwrap();
    rt.define_method(
        c,
        Method::scripted("reveal", vec![], |rt, _| {
            let me = rt.current_self()?;
            rt.dispatch(me, "secret", &[])
        }),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::scripted("peek", vec![ParamSpec::positional("other")], |rt, args| {
            let other = args
                .get("other")
                .and_then(|v| v.as_object())
                .ok_or_else(|| DispatchError::script("not an object"))?;
            rt.dispatch(other, "secret", &[])
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    let p = rt.create_object(c, Some("p"), &[]).unwrap();

    assert!(rt.dispatch(o, "secret", &[]).unwrap_err().is_unknown());
    assert_eq!(text(rt.dispatch(o, "reveal", &[])), "s");
    assert!(rt
        .dispatch(p, "peek", &[Value::Object(o)])
        .unwrap_err()
        .is_unknown());

    let flags = DispatchFlags {
        ignore_permissions: true,
        ..DispatchFlags::default()
    };
    assert_eq!(text(rt.dispatch_with(o, "secret", &[], flags)), "s");
}

#[test]
fn private_methods_are_only_reachable_locally() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("hidden", "h").private()).unwrap();
    rt.define_method(
        c,
        Method::scripted("use_hidden", vec![], |rt, _| {
            let me = rt.current_self()?;
            let flags = DispatchFlags {
                local_only: true,
                ..DispatchFlags::default()
            };
            rt.dispatch_with(me, "hidden", &[], flags)
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert!(rt.dispatch(o, "hidden", &[]).unwrap_err().is_unknown());
    assert_eq!(text(rt.dispatch(o, "use_hidden", &[])), "h");
    assert_eq!(rt.method_names(o, None).unwrap(), vec!["use_hidden"]);
}

#[test]
fn class_only_methods_reject_plain_objects() {
    let (mut rt, _, meta) = new_runtime();
    let custom_meta = rt.create_class("Meta", meta, &[meta]).unwrap();
    rt.define_method(custom_meta, constant("kind", "class").class_only())
        .unwrap();
    let widget = rt.create_class("Widget", custom_meta, &[]).unwrap();
    rt.define_method(widget, constant("tag", "w").class_only()).unwrap();
    let w = rt.create_object(widget, Some("w"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(widget, "kind", &[])), "class");
    assert!(rt.dispatch(w, "tag", &[]).unwrap_err().is_unknown());
}

#[test]
fn unknown_method_of_the_object_system_is_called() {
    let (mut rt, root, meta) = new_runtime();
    rt.define_method(
        root,
        Method::native("unknown", |_, _, args| {
            let names: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            Ok(Value::from(format!("unknown:{}", names.join(","))))
        }),
    )
    .unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(
        text(rt.dispatch(o, "frobnicate", &[Value::from(1i64)])),
        "unknown:frobnicate,1"
    );

    let flags = DispatchFlags {
        no_unknown: true,
        ..DispatchFlags::default()
    };
    assert_eq!(
        rt.dispatch_with(o, "frobnicate", &[], flags).unwrap_err(),
        DispatchError::Unknown {
            object: "::o".into(),
            method: "frobnicate".into()
        }
    );
}

#[derive(Default)]
struct Recorder {
    seen: RefCell<Vec<String>>,
}

impl UnknownHandler for Recorder {
    fn unknown(
        &self,
        _rt: &mut Runtime,
        _object: ObjectId,
        method: &str,
        _args: &[Value],
    ) -> Result<Option<Value>, DispatchError> {
        self.seen.borrow_mut().push(method.to_string());
        if method == "ping" {
            Ok(Some(Value::from("pong")))
        } else {
            Ok(None)
        }
    }
}

#[test]
fn unknown_handler_answers_or_declines() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    let recorder = Rc::new(Recorder::default());
    rt.set_unknown_handler(recorder.clone());

    assert_eq!(text(rt.dispatch(o, "ping", &[])), "pong");
    assert!(rt.dispatch(o, "other", &[]).unwrap_err().is_unknown());
    assert_eq!(*recorder.seen.borrow(), vec!["ping", "other"]);

    rt.clear_unknown_handler();
    assert!(rt.dispatch(o, "ping", &[]).unwrap_err().is_unknown());
}

#[test]
fn alias_follows_redefinition_of_its_target() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("version", "v1")).unwrap();
    rt.define_method(c, Method::alias("ver", "::classes::C::version"))
        .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "ver", &[])), "v1");
    rt.define_method(c, constant("version", "v2")).unwrap();
    assert_eq!(text(rt.dispatch(o, "ver", &[])), "v2");

    rt.remove_method(c, "version").unwrap();
    let err = rt.dispatch(o, "ver", &[]).unwrap_err();
    assert!(err.to_string().contains("apparently disappeared"));
}

#[test]
fn qualified_names_use_the_registry() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("hidden", "h").private()).unwrap();
    rt.define_command(
        "::util::greet",
        Method::native("greet", |rt, obj, _| {
            Ok(Value::from(format!("hello {}", rt.name_of(obj))))
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "::util::greet", &[])), "hello ::o");
    assert_eq!(text(rt.dispatch(o, "::classes::C::hidden", &[])), "h");
    assert!(rt.dispatch(o, "greet", &[]).unwrap_err().is_unknown());
    assert!(rt.define_command("util::greet", constant("greet", "x")).is_err());
}

#[test]
fn restricted_lookups_skip_mixins() {
    let (mut rt, root, meta) = new_runtime();
    let m = rt.create_class("M", meta, &[]).unwrap();
    rt.define_method(m, constant("describe", "mixin")).unwrap();
    rt.define_method(root, constant("describe", "root")).unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("describe", "c")).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    rt.add_object_mixin(o, MixinReg::new(m)).unwrap();

    assert_eq!(text(rt.dispatch(o, "describe", &[])), "mixin");
    let intrinsic = DispatchFlags {
        intrinsic_only: true,
        ..DispatchFlags::default()
    };
    assert_eq!(text(rt.dispatch_with(o, "describe", &[], intrinsic)), "c");
    let system = DispatchFlags {
        system_only: true,
        ..DispatchFlags::default()
    };
    assert_eq!(text(rt.dispatch_with(o, "describe", &[], system)), "root");
}

#[test]
fn object_methods_shadow_class_methods() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("describe", "class")).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    rt.define_object_method(
        o,
        Method::scripted("describe", vec![], |rt, _| {
            let inner = rt.next(None)?;
            Ok(Value::from(format!("own/{}", inner)))
        }),
    )
    .unwrap();

    assert_eq!(text(rt.dispatch(o, "describe", &[])), "own/class");
    let handle = rt.resolve_method_handle(o, "describe").unwrap().unwrap();
    assert_eq!(handle.handle, "::o::describe");
    assert!(handle.per_object);
    assert_eq!(handle.kind, ImplementationKind::Scripted);

    rt.remove_object_method(o, "describe").unwrap();
    let handle = rt.resolve_method_handle(o, "describe").unwrap().unwrap();
    assert_eq!(handle.definer, "::C");
    assert_eq!(handle.handle, "::classes::C::describe");
}

fn ensemble_container(rt: &mut Runtime, root: ClassId, name: &str) -> ObjectId {
    rt.create_object(root, Some(name), &[]).unwrap()
}

#[test]
fn ensemble_dispatches_sub_methods() {
    let (mut rt, root, meta) = new_runtime();
    let ops = ensemble_container(&mut rt, root, "info_ops");
    rt.define_object_method(ops, constant("children", "kids")).unwrap();
    rt.define_object_method(ops, constant("vars", "vars")).unwrap();
    rt.define_object_method(ops, constant("defaultmethod", "default"))
        .unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_ensemble(c, "info", ops).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "info", &[Value::from("children")])), "kids");
    assert_eq!(text(rt.dispatch(o, "info", &[])), "default");
}

#[test]
fn unknown_sub_method_lists_valid_names() {
    let (mut rt, root, meta) = new_runtime();
    let ops = ensemble_container(&mut rt, root, "info_ops");
    rt.define_object_method(ops, constant("children", "kids")).unwrap();
    rt.define_object_method(ops, constant("vars", "vars")).unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_ensemble(c, "info", ops).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    match rt.dispatch(o, "info", &[Value::from("bogus")]) {
        Err(DispatchError::UnknownSubMethod {
            object,
            path,
            sub,
            valid,
        }) => {
            assert_eq!(object, "::o");
            assert_eq!(path, "info");
            assert_eq!(sub, "bogus");
            assert_eq!(valid, "children, vars");
        }
        other => panic!("expected unknown sub-method, got {:?}", other),
    }
    assert_eq!(rt.call_depth(), 0);
}

#[test]
fn ensemble_falls_back_to_inherited_ensemble() {
    let (mut rt, root, meta) = new_runtime();
    let base_ops = ensemble_container(&mut rt, root, "base_ops");
    rt.define_object_method(base_ops, constant("inherited", "from base"))
        .unwrap();
    let c_ops = ensemble_container(&mut rt, root, "c_ops");
    rt.define_object_method(c_ops, constant("children", "kids")).unwrap();
    let base = rt.create_class("Base", meta, &[]).unwrap();
    let c = rt.create_class("C", meta, &[base]).unwrap();
    rt.define_ensemble(base, "info", base_ops).unwrap();
    rt.define_ensemble(c, "info", c_ops).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(
        text(rt.dispatch(o, "info", &[Value::from("inherited")])),
        "from base"
    );
    assert_eq!(text(rt.dispatch(o, "info", &[Value::from("children")])), "kids");
}

#[test]
fn keep_caller_self_runs_sub_methods_on_the_caller() {
    let (mut rt, root, meta) = new_runtime();
    let base_ops = ensemble_container(&mut rt, root, "base_ops");
    rt.define_object_method(base_ops, constant("size", "base-size"))
        .unwrap();
    let ops = ensemble_container(&mut rt, root, "self_ops");
    rt.set_keep_caller_self(ops, true).unwrap();
    rt.define_object_method(
        ops,
        Method::scripted("whoami", vec![], |rt, _| {
            let me = rt.current_self()?;
            Ok(Value::from(rt.name_of(me)))
        }),
    )
    .unwrap();
    rt.define_object_method(
        ops,
        Method::scripted("size", vec![], |rt, _| {
            let inner = rt.next(None)?;
            Ok(Value::from(format!("c-size/{}", inner)))
        }),
    )
    .unwrap();
    let base = rt.create_class("Base", meta, &[]).unwrap();
    let c = rt.create_class("C", meta, &[base]).unwrap();
    rt.define_ensemble(base, "info", base_ops).unwrap();
    rt.define_ensemble(c, "info", ops).unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "info", &[Value::from("whoami")])), "::o");
    assert_eq!(
        text(rt.dispatch(o, "info", &[Value::from("size")])),
        "c-size/base-size"
    );
}

#[test]
fn forwarder_to_another_object() {
    let (mut rt, root, meta) = new_runtime();
    let logger = rt.create_object(root, Some("logger"), &[]).unwrap();
    rt.define_object_method(
        logger,
        Method::native("log", |rt, _, args| {
            let sender = args
                .first()
                .and_then(|v| v.as_object())
                .map(|o| rt.name_of(o))
                .unwrap_or_default();
            let rest: Vec<String> = args.iter().skip(1).map(|a| a.to_string()).collect();
            Ok(Value::from(format!("{}:{}", sender, rest.join(" "))))
        }),
    )
    .unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::forward(
            "note",
            ForwardSpec::new(ForwardTarget::Object(logger))
                .arg(ForwardArg::literal("log"))
                .arg(ForwardArg::SelfRef),
        ),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(
        text(rt.dispatch(o, "note", &[Value::from("hello"), Value::from("world")])),
        "::o:hello world"
    );
}

#[test]
fn forwarder_with_prefix_and_command_targets() {
    let (mut rt, _, meta) = new_runtime();
    rt.define_command(
        "::fmt::upper",
        Method::native("upper", |_, _, args| {
            Ok(Value::from(
                args.first().map(|a| a.to_string().to_uppercase()).unwrap_or_default(),
            ))
        }),
    )
    .unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("do_run", "ran")).unwrap();
    rt.define_method(
        c,
        Method::forward("run", ForwardSpec::new(ForwardTarget::SelfObject).prefix("do_")),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::forward("shout", ForwardSpec::new(ForwardTarget::Command("::fmt::upper".into()))),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(text(rt.dispatch(o, "run", &[])), "ran");
    assert_eq!(text(rt.dispatch(o, "shout", &[Value::from("hey")])), "HEY");
}

#[test]
fn forwarder_error_handler_receives_the_message() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::scripted("failed", vec![ParamSpec::positional("msg")], |_, args| {
            let msg = args.get("msg").map(|v| v.to_string()).unwrap_or_default();
            Ok(Value::from(format!("handled: {}", msg)))
        }),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::forward(
            "relay",
            ForwardSpec::new(ForwardTarget::SelfObject)
                .arg(ForwardArg::literal("missing_target"))
                .on_error("failed"),
        ),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(
        text(rt.dispatch(o, "relay", &[])),
        "handled: ::o: unable to dispatch method 'missing_target'"
    );
}

#[test]
fn setter_reads_and_validates() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::setter("size", ParamSpec::positional("size").check(ValueCheck::Integer)),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert!(matches!(
        rt.dispatch(o, "size", &[]),
        Err(DispatchError::Script(_))
    ));
    assert_eq!(rt.dispatch(o, "size", &[Value::from(5i64)]).unwrap(), Value::from(5i64));
    assert_eq!(rt.var(o, "size").unwrap(), Some(Value::from(5i64)));
    assert_eq!(rt.dispatch(o, "size", &[]).unwrap(), Value::from(5i64));

    match rt.dispatch(o, "size", &[Value::from("big")]) {
        Err(DispatchError::Argument { source, .. }) => {
            assert!(matches!(source, ArgError::TypeMismatch { .. }))
        }
        other => panic!("expected argument error, got {:?}", other),
    }
    assert!(matches!(
        rt.dispatch(o, "size", &[Value::from(1i64), Value::from(2i64)]),
        Err(DispatchError::Argument {
            source: ArgError::TooManyArguments(_),
            ..
        })
    ));
}

#[test]
fn scripted_parameters_are_parsed() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::scripted(
            "configure",
            vec![ParamSpec::flag("color").default("red"), ParamSpec::positional("name")],
            |_, args| {
                let name = args.get("name").map(|v| v.to_string()).unwrap_or_default();
                let color = args.get("color").map(|v| v.to_string()).unwrap_or_default();
                Ok(Value::from(format!("{}/{}", name, color)))
            },
        ),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    let args: Vec<Value> = ["-color", "blue", "box"].iter().map(|s| Value::from(*s)).collect();
    assert_eq!(text(rt.dispatch(o, "configure", &args)), "box/blue");
    assert_eq!(text(rt.dispatch(o, "configure", &[Value::from("box")])), "box/red");

    let err = rt.dispatch(o, "configure", &[]).unwrap_err();
    assert_eq!(err.to_string(), "::o configure: required argument 'name' is missing");
}

#[test]
fn declared_return_type_is_checked() {
    let (mut rt, _, meta) = new_runtime();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(c, constant("answer", "forty-two").returns(ValueCheck::Integer))
        .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    match rt.dispatch(o, "answer", &[]) {
        Err(DispatchError::ReturnType { value, expected, .. }) => {
            assert_eq!(value, "forty-two");
            assert_eq!(expected, "integer");
        }
        other => panic!("expected return type error, got {:?}", other),
    }

    rt.config.check_results = false;
    assert_eq!(text(rt.dispatch(o, "answer", &[])), "forty-two");
}

fn counter_class(rt: &mut Runtime, meta: ClassId) -> ClassId {
    let c = rt.create_class("Counter", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::scripted("incr", vec![], |rt, _| {
            let n = count(rt)? + 1;
            let me = rt.current_self()?;
            rt.set_var(me, "count", n)?;
            Ok(Value::from(n))
        })
        .pre(Predicate::new("count < 3", |rt| Ok(count(rt)? < 3)))
        .post(Predicate::new("count > 0", |rt| Ok(count(rt)? > 0))),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::scripted("decr", vec![], |rt, _| {
            let n = count(rt)? - 1;
            let me = rt.current_self()?;
            rt.set_var(me, "count", n)?;
            Ok(Value::from(n))
        }),
    )
    .unwrap();
    c
}

#[test]
fn pre_and_post_conditions() {
    let (mut rt, _, meta) = new_runtime();
    let c = counter_class(&mut rt, meta);
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    rt.set_check_options(o, CheckOptions::all()).unwrap();

    for expected in 1..=3i64 {
        assert_eq!(rt.dispatch(o, "incr", &[]).unwrap(), Value::from(expected));
    }
    assert_eq!(
        rt.dispatch(o, "incr", &[]).unwrap_err(),
        DispatchError::Assertion {
            object: "::o".into(),
            method: "incr".into(),
            expr: "count < 3".into()
        }
    );

    rt.config.assertions_enabled = false;
    assert_eq!(rt.dispatch(o, "incr", &[]).unwrap(), Value::from(4i64));
    rt.config.assertions_enabled = true;

    rt.set_check_options(o, CheckOptions::none()).unwrap();
    assert_eq!(rt.dispatch(o, "incr", &[]).unwrap(), Value::from(5i64));
}

#[test]
fn class_invariants_are_checked_after_the_body() {
    let (mut rt, _, meta) = new_runtime();
    let c = counter_class(&mut rt, meta);
    rt.add_class_invariant(c, Predicate::new("count >= 0", |rt| Ok(count(rt)? >= 0)))
        .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    rt.set_check_options(
        o,
        CheckOptions {
            class_invariants: true,
            ..CheckOptions::none()
        },
    )
    .unwrap();

    match rt.dispatch(o, "decr", &[]) {
        Err(DispatchError::Assertion { method, expr, .. }) => {
            assert_eq!(method, "decr");
            assert_eq!(expr, "count >= 0");
        }
        other => panic!("expected assertion error, got {:?}", other),
    }
    // The body ran before the failing check.
    assert_eq!(rt.var(o, "count").unwrap(), Some(Value::from(-1i64)));
}

#[test]
fn object_invariants_apply_per_object() {
    let (mut rt, _, meta) = new_runtime();
    let c = counter_class(&mut rt, meta);
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    let p = rt.create_object(c, Some("p"), &[]).unwrap();
    rt.add_object_invariant(o, Predicate::new("count != 2", |rt| Ok(count(rt)? != 2)))
        .unwrap();
    let check = CheckOptions {
        object_invariants: true,
        ..CheckOptions::none()
    };
    rt.set_check_options(o, check).unwrap();
    rt.set_check_options(p, check).unwrap();

    rt.dispatch(o, "incr", &[]).unwrap();
    assert!(matches!(
        rt.dispatch(o, "incr", &[]),
        Err(DispatchError::Assertion { .. })
    ));
    rt.dispatch(p, "incr", &[]).unwrap();
    rt.dispatch(p, "incr", &[]).unwrap();
}

#[test]
fn runaway_recursion_hits_the_depth_limit() {
    let mut rt = Runtime::with_config(RuntimeConfig {
        max_depth: 32,
        ..RuntimeConfig::default()
    });
    let (_, meta) = rt.create_object_system("Object", "Class", system_methods()).unwrap();
    let c = rt.create_class("C", meta, &[]).unwrap();
    rt.define_method(
        c,
        Method::scripted("recurse", vec![], |rt, _| {
            let me = rt.current_self()?;
            rt.dispatch(me, "recurse", &[])
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();

    assert_eq!(
        rt.dispatch(o, "recurse", &[]).unwrap_err(),
        DispatchError::Recursion(32)
    );
    assert_eq!(rt.call_depth(), 0);
}

#[test]
fn default_depth_limit_fits_a_spawned_thread_stack() {
    let limit = std::thread::spawn(|| {
        let (mut rt, _, meta) = new_runtime();
        let c = rt.create_class("C", meta, &[]).unwrap();
        rt.define_method(
            c,
            Method::scripted("recurse", vec![], |rt, _| {
                let me = rt.current_self()?;
                rt.dispatch(me, "recurse", &[])
            }),
        )
        .unwrap();
        let o = rt.create_object(c, Some("o"), &[]).unwrap();
        let limit = match rt.dispatch(o, "recurse", &[]) {
            Err(DispatchError::Recursion(n)) => Some(n),
            _ => None,
        };
        assert_eq!(rt.call_depth(), 0);
        limit
    })
    .join()
    .unwrap();

    assert_eq!(limit, Some(RuntimeConfig::default().max_depth));
}

#[test]
fn calling_context_queries() {
    let (mut rt, _, meta) = new_runtime();
    let base = rt.create_class("Base", meta, &[]).unwrap();
    let c = rt.create_class("C", meta, &[base]).unwrap();
    rt.define_method(
        base,
        Method::native("probe", |rt, _, _| Ok(Value::Bool(rt.is_next_call()))).non_leaf(),
    )
    .unwrap();
    rt.define_method(c, Method::scripted("probe", vec![], |rt, _| rt.next(None)))
        .unwrap();
    rt.define_method(
        c,
        Method::native("inner", |rt, _, _| {
            let caller = rt.calling_object().map(|o| rt.name_of(o)).unwrap_or_default();
            let method = rt.calling_method().unwrap_or_default();
            let class = rt.current_class()?.map(|cl| rt.name_of(cl)).unwrap_or_default();
            Ok(Value::from(format!(
                "{}:{}@{} level {}",
                caller,
                method,
                class,
                rt.calling_level()
            )))
        })
        .non_leaf(),
    )
    .unwrap();
    rt.define_method(
        c,
        Method::scripted("outer", vec![ParamSpec::positional("other")], |rt, args| {
            let other = args
                .get("other")
                .and_then(|v| v.as_object())
                .ok_or_else(|| DispatchError::script("not an object"))?;
            rt.dispatch(other, "inner", &[])
        }),
    )
    .unwrap();
    let o = rt.create_object(c, Some("o"), &[]).unwrap();
    let p = rt.create_object(c, Some("p"), &[]).unwrap();
    let b = rt.create_object(base, Some("b"), &[]).unwrap();

    assert_eq!(
        text(rt.dispatch(o, "outer", &[Value::Object(p)])),
        "::o:outer@::C level 1"
    );
    assert_eq!(rt.dispatch(o, "probe", &[]).unwrap(), Value::Bool(true));
    assert_eq!(rt.dispatch(b, "probe", &[]).unwrap(), Value::Bool(false));
    assert!(rt.calling_object().is_none());
    assert!(rt.current_self().is_err());
}
