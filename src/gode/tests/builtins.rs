//! Builtin module registration and the `gode:` scheme.

use gode::{BuiltinModule, ErrorKind, Vm};
use serde_json::json;

#[test]
fn require_registered_builtin() {
    let vm = Vm::builder()
        .builtin(
            "core",
            BuiltinModule::new()
                .value("version", "0.1")
                .value("platform", "host"),
        )
        .build()
        .unwrap();

    let result = vm
        .eval(
            "main.js",
            r#"const c = require("gode:core"); JSON.stringify([c.version, c.platform])"#,
        )
        .wait()
        .unwrap();
    assert_eq!(result, json!(r#"["0.1","host"]"#));
    vm.dispose();
}

#[test]
fn default_core_builtin_reports_platform() {
    let vm = Vm::builder().build().unwrap();
    let platform = vm.eval("main.js", "require('gode:core').platform").wait().unwrap();
    assert_eq!(platform, json!(std::env::consts::OS));
    vm.dispose();
}

#[test]
fn builtin_identity_is_stable() {
    let vm = Vm::builder().build().unwrap();
    let same = vm
        .eval(
            "main.js",
            "require('gode:core') === require('gode:core')",
        )
        .wait()
        .unwrap();
    assert_eq!(same, json!(true));
    vm.dispose();
}

#[test]
fn unknown_builtin_is_module_not_found() {
    let vm = Vm::builder().build().unwrap();
    let err = vm.require("gode:timers").wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    vm.dispose();
}

#[test]
fn serde_builtin_function_is_callable() {
    let vm = Vm::builder()
        .register_builtin_function("math", "add", |a: i64, b: i64| -> anyhow::Result<i64> {
            Ok(a + b)
        })
        .build()
        .unwrap();

    let result = vm
        .eval("main.js", "const m = require('gode:math'); m.add(40, 2)")
        .wait()
        .unwrap();
    assert_eq!(result, json!(42));
    vm.dispose();
}

#[test]
fn json_builtin_function_round_trips() {
    let vm = Vm::builder()
        .register_json_builtin_function("echo", "twice", |args: String| -> anyhow::Result<String> {
            // Args arrive as a JSON array of the call arguments.
            let values: Vec<serde_json::Value> = serde_json::from_str(&args)?;
            Ok(serde_json::to_string(&vec![values.clone(), values])?)
        })
        .build()
        .unwrap();

    let result = vm
        .eval(
            "main.js",
            "JSON.stringify(require('gode:echo').twice(1, 'a'))",
        )
        .wait()
        .unwrap();
    assert_eq!(result, json!(r#"[[1,"a"],[1,"a"]]"#));
    vm.dispose();
}

#[test]
fn failing_builtin_function_throws_into_script() {
    let vm = Vm::builder()
        .register_builtin_function("bad", "boom", |_code: i64| -> anyhow::Result<i64> {
            anyhow::bail!("configured to fail")
        })
        .build()
        .unwrap();

    let caught = vm
        .eval(
            "main.js",
            r#"
            let message = "no error";
            try { require('gode:bad').boom(1); } catch (e) { message = String(e.message || e); }
            message
            "#,
        )
        .wait()
        .unwrap();
    assert!(
        caught.as_str().unwrap().contains("configured to fail"),
        "got: {caught}"
    );
    vm.dispose();
}
