//! The plugin host and function bridge, exercised through statically
//! registered plugins: arity tolerance, variadics, panic recovery, awaitable
//! callbacks and plugin promises.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gode::plugin_api::{
    Callable, ExportTable, Host, ParamKind, PluginError, PluginReturn, PluginValue, StaticPlugin,
};
use gode::{ErrorKind, Manifest, Vm};
use serde_json::json;
use tempfile::tempdir;

fn sum(_host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
    if args.is_empty() {
        return Err(PluginError::new("sum requires at least one number"));
    }
    let total: i64 = args.iter().filter_map(PluginValue::as_i64).sum();
    Ok(PluginReturn::from(total))
}

fn process(_host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
    let data = args[0].as_sequence().unwrap_or(&[]);
    let options = args[1].clone();
    let mut out = std::collections::BTreeMap::new();
    out.insert("processed".to_string(), PluginValue::Int(data.len() as i64));
    out.insert("options".to_string(), options);
    Ok(PluginReturn::Value(PluginValue::Mapping(out)))
}

fn explode(_host: &Host, _args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
    panic!("plugin blew up on purpose");
}

fn math_exports() -> ExportTable {
    ExportTable::new()
        .function("sum", Callable::new(sum).variadic(ParamKind::Int))
        .function(
            "process",
            Callable::new(process).params(&[ParamKind::Sequence, ParamKind::Mapping]),
        )
        .function("explode", Callable::new(explode))
        .value("answer", 42i64)
}

fn math_plugin() -> StaticPlugin {
    StaticPlugin {
        name: "mathx",
        version: "1.2.3",
        exports: math_exports,
        init: None,
        dispose: None,
    }
}

#[test]
fn variadic_sum() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let result = vm
        .eval(
            "main.js",
            "const plug = require('plugin:mathx'); plug.sum(1, 2, 3, 4, 5)",
        )
        .wait()
        .unwrap();
    assert_eq!(result, json!(15));
    vm.dispose();
}

#[test]
fn variadic_sum_with_no_arguments_raises_plugin_runtime() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let caught = vm
        .eval(
            "main.js",
            r#"
            const plug = require('plugin:mathx');
            let out = null;
            try { plug.sum(); } catch (e) { out = [e.name, e.message]; }
            JSON.stringify(out)
            "#,
        )
        .wait()
        .unwrap();
    let text = caught.as_str().unwrap();
    assert!(text.contains("PluginRuntime"), "got: {text}");
    assert!(text.contains("at least one number"), "got: {text}");
    vm.dispose();
}

#[test]
fn extra_arguments_are_discarded() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let result = vm
        .eval(
            "main.js",
            r#"
            const plug = require('plugin:mathx');
            JSON.stringify(plug.process([1, 2, 3], {mode: "fast"}, "ignored", 42, {extra: true}))
            "#,
        )
        .wait()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(result.as_str().unwrap()).unwrap();
    assert_eq!(parsed, json!({"processed": 3, "options": {"mode": "fast"}}));
    vm.dispose();
}

#[test]
fn missing_arguments_become_zero_values() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let result = vm
        .eval(
            "main.js",
            "JSON.stringify(require('plugin:mathx').process())",
        )
        .wait()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(result.as_str().unwrap()).unwrap();
    assert_eq!(parsed, json!({"processed": 0, "options": {}}));
    vm.dispose();
}

#[test]
fn plugin_panic_is_contained() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let caught = vm
        .eval(
            "main.js",
            r#"
            const plug = require('plugin:mathx');
            let out = "no error";
            try { plug.explode(); } catch (e) { out = e.name + ": " + e.message; }
            out
            "#,
        )
        .wait()
        .unwrap();
    let text = caught.as_str().unwrap();
    assert!(text.starts_with("PluginRuntime"), "got: {text}");
    assert!(text.contains("blew up on purpose"), "got: {text}");

    // The engine survived the panic.
    assert_eq!(vm.eval("again.js", "1 + 1").wait().unwrap(), json!(2));
    vm.dispose();
}

#[test]
fn plugin_exports_carry_metadata_and_values() {
    let vm = Vm::builder().static_plugin("mathx", math_plugin()).build().unwrap();
    let meta = vm
        .eval(
            "main.js",
            r#"
            const plug = require('plugin:mathx');
            JSON.stringify([plug.__pluginName, plug.__pluginVersion, plug.answer])
            "#,
        )
        .wait()
        .unwrap();
    assert_eq!(meta, json!(r#"["mathx","1.2.3",42]"#));
    vm.dispose();
}

static COUNTER_INITS: AtomicUsize = AtomicUsize::new(0);

fn counter_init(_host: Host) -> Result<(), PluginError> {
    COUNTER_INITS.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn counter_exports() -> ExportTable {
    ExportTable::new().value("ready", true)
}

#[test]
fn plugin_opens_at_most_once_across_specifiers() {
    let manifest = Manifest::from_json(r#"{"dependencies": {"counterdep": "plugin:counter"}}"#)
        .unwrap();
    let vm = Vm::builder()
        .manifest(manifest)
        .root("/")
        .static_plugin(
            "counter",
            StaticPlugin {
                name: "counter",
                version: "0.0.1",
                exports: counter_exports,
                init: Some(counter_init),
                dispose: None,
            },
        )
        .build()
        .unwrap();

    let same = vm
        .eval(
            "main.js",
            "require('plugin:counter') === require('counterdep')",
        )
        .wait()
        .unwrap();
    assert_eq!(same, json!(true));
    assert_eq!(COUNTER_INITS.load(Ordering::SeqCst), 1);
    vm.dispose();
}

fn failing_init(_host: Host) -> Result<(), PluginError> {
    Err(PluginError::new("refusing to initialize"))
}

#[test]
fn failing_initialize_is_cached_as_plugin_init() {
    let vm = Vm::builder()
        .static_plugin(
            "grumpy",
            StaticPlugin {
                name: "grumpy",
                version: "0.0.1",
                exports: counter_exports,
                init: Some(failing_init),
                dispose: None,
            },
        )
        .build()
        .unwrap();

    let first = vm.require("plugin:grumpy").wait().unwrap_err();
    assert_eq!(first.kind(), ErrorKind::PluginInit);
    let second = vm.require("plugin:grumpy").wait().unwrap_err();
    assert_eq!(second.kind(), ErrorKind::PluginInit);
    assert_eq!(second.message(), first.message());
    vm.dispose();
}

static DISPOSE_ORDER: std::sync::Mutex<Vec<&'static str>> = std::sync::Mutex::new(Vec::new());

fn dispose_first() -> Result<(), PluginError> {
    DISPOSE_ORDER.lock().unwrap().push("first");
    Ok(())
}

fn dispose_second() -> Result<(), PluginError> {
    DISPOSE_ORDER.lock().unwrap().push("second");
    Ok(())
}

#[test]
fn plugins_dispose_in_reverse_load_order() {
    let vm = Vm::builder()
        .static_plugin(
            "first",
            StaticPlugin {
                name: "first",
                version: "0",
                exports: counter_exports,
                init: None,
                dispose: Some(dispose_first),
            },
        )
        .static_plugin(
            "second",
            StaticPlugin {
                name: "second",
                version: "0",
                exports: counter_exports,
                init: None,
                dispose: Some(dispose_second),
            },
        )
        .build()
        .unwrap();

    vm.require("plugin:first").wait().unwrap();
    vm.require("plugin:second").wait().unwrap();
    vm.dispose();

    assert_eq!(*DISPOSE_ORDER.lock().unwrap(), vec!["second", "first"]);
}

fn process_with_feedback(host: &Host, args: &[PluginValue]) -> Result<PluginReturn, PluginError> {
    let data = args[0].as_sequence().unwrap_or(&[]).to_vec();
    let callback = args[1]
        .as_callback()
        .cloned()
        .ok_or_else(|| PluginError::new("processWithFeedback needs a callback"))?;

    let (promise, completer) = host.promise();
    std::thread::spawn(move || {
        let mut results = Vec::new();
        for chunk in data.chunks(2) {
            let progress = PluginValue::Int(chunk.len() as i64);
            match callback.call(vec![progress]).wait() {
                Ok(result) => results.push(result),
                Err(err) => {
                    completer.reject(err);
                    return;
                }
            }
        }
        completer.resolve(PluginValue::Sequence(results));
    });
    Ok(PluginReturn::Promise(promise))
}

fn feedback_exports() -> ExportTable {
    ExportTable::new().function(
        "processWithFeedback",
        Callable::new(process_with_feedback).params(&[ParamKind::Sequence, ParamKind::Callback]),
    )
}

#[test]
fn callbacks_are_awaitable_and_ordered() {
    let vm = Vm::builder()
        .static_plugin(
            "feedback",
            StaticPlugin {
                name: "feedback",
                version: "0.1.0",
                exports: feedback_exports,
                init: None,
                dispose: None,
            },
        )
        .build()
        .unwrap();

    vm.eval(
        "main.js",
        r#"
        globalThis.progress = [];
        globalThis.result = null;
        const plug = require('plugin:feedback');
        plug.processWithFeedback([1, 2, 3, 4, 5], (p) => {
            globalThis.progress.push(p);
            return p * 10;
        }).then((r) => { globalThis.result = r; });
        "started"
        "#,
    )
    .wait()
    .unwrap();

    // The plugin thread drives callbacks through the queue; poll until the
    // promise resolves.
    let deadline = Instant::now() + Duration::from_secs(5);
    let result = loop {
        let state = vm
            .eval("poll.js", "JSON.stringify(globalThis.result)")
            .wait()
            .unwrap();
        if state != json!("null") {
            break state;
        }
        assert!(Instant::now() < deadline, "promise never resolved");
        std::thread::sleep(Duration::from_millis(10));
    };
    // ceil(5 / 2) chunks, in order, each awaited before the next.
    assert_eq!(result, json!("[20,20,10]"));

    let progress = vm
        .eval("progress.js", "JSON.stringify(globalThis.progress)")
        .wait()
        .unwrap();
    assert_eq!(progress, json!("[2,2,1]"));
    vm.dispose();
}

#[test]
fn garbage_shared_object_is_plugin_load() {
    let dir = tempdir().unwrap();
    let lib_name = format!("libjunk.{}", plugin_ext());
    fs::write(dir.path().join(&lib_name), b"not a shared object").unwrap();
    let manifest = Manifest::from_json(&format!(
        r#"{{"dependencies": {{"junk": "file:./{lib_name}"}}}}"#
    ))
    .unwrap();

    let vm = Vm::builder()
        .manifest(manifest)
        .root(dir.path())
        .build()
        .unwrap();
    let err = vm.require("junk").wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PluginLoad);
    vm.dispose();
}

fn plugin_ext() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}
