//! Filesystem modules: CommonJS semantics, cycles, caching, manifest-driven
//! resolution.

use std::fs;

use gode::{ErrorKind, Script, Vm};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn circular_require_exposes_partial_exports() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("a.js"),
        r#"exports.name = "A"; const b = require("./b"); exports.afterB = b.name;"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("b.js"),
        r#"exports.name = "B"; const a = require("./a"); exports.seenA = a.name;"#,
    )
    .unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();

    let a = vm.require("./a.js").wait().unwrap();
    assert_eq!(a, json!({"name": "A", "afterB": "B"}));

    // B finished evaluating during A's load; it saw A's partial exports,
    // which already carried `name`.
    let b = vm.require("./b.js").wait().unwrap();
    assert_eq!(b, json!({"name": "B", "seenA": "A"}));
    vm.dispose();
}

#[test]
fn failed_module_stays_failed() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("bad.js"),
        "exports.partial = true; throw new Error('broken at top level');",
    )
    .unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();

    let first = vm.require("./bad.js").wait().unwrap_err();
    assert_eq!(first.kind(), ErrorKind::ModuleEval);
    assert!(first.message().contains("broken at top level"));

    let second = vm.require("./bad.js").wait().unwrap_err();
    assert_eq!(second.kind(), ErrorKind::ModuleEval);
    assert_eq!(second.message(), first.message());

    // No partial exports leak through a failed record.
    let observed = vm
        .eval(
            "probe.js",
            r#"
            let out = "threw";
            try { out = require('./bad.js').partial; } catch (e) { out = e.name; }
            out
            "#,
        )
        .wait()
        .unwrap();
    assert_eq!(observed, json!("ModuleEval"));
    vm.dispose();
}

#[test]
fn same_artifact_shares_one_exports_object() {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/util.js"), "module.exports = { n: 1 };").unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();
    let same = vm
        .eval(
            "main.js",
            "require('./lib/util.js') === require('./lib/../lib/util.js')",
        )
        .wait()
        .unwrap();
    assert_eq!(same, json!(true));
    vm.dispose();
}

#[test]
fn json_modules_parse_to_exports() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("config.json"),
        r#"{"debug": true, "retries": 3}"#,
    )
    .unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();
    let config = vm.require("./config.json").wait().unwrap();
    assert_eq!(config, json!({"debug": true, "retries": 3}));
    vm.dispose();
}

#[test]
fn manifest_dependencies_and_aliases_resolve() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src/lib")).unwrap();
    fs::create_dir_all(dir.path().join("vendor")).unwrap();
    fs::write(
        dir.path().join("package.json"),
        r#"{
            "name": "fixture",
            "imports": {"lib": "./src/lib"},
            "dependencies": {"util": "file:./vendor/util.js"}
        }"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("src/lib/helper.js"),
        "module.exports = 'helper';",
    )
    .unwrap();
    fs::write(
        dir.path().join("vendor/util.js"),
        "module.exports = { kind: 'vendored' };",
    )
    .unwrap();

    let vm = Vm::builder()
        .manifest_file(dir.path().join("package.json"))
        .build()
        .unwrap();

    assert_eq!(vm.require("util").wait().unwrap(), json!({"kind": "vendored"}));
    assert_eq!(vm.require("lib/helper.js").wait().unwrap(), json!("helper"));
    vm.dispose();
}

#[test]
fn directory_resolution_probes_index() {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("pkg/index.js"), "module.exports = 'indexed';").unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();
    assert_eq!(vm.require("./pkg").wait().unwrap(), json!("indexed"));
    vm.dispose();
}

#[test]
fn nested_manifest_main_is_consulted() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("pkg/lib")).unwrap();
    fs::write(
        dir.path().join("pkg/package.json"),
        r#"{"main": "lib/entry.js"}"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("pkg/lib/entry.js"),
        "module.exports = 'from main';",
    )
    .unwrap();

    let vm = Vm::builder().root(dir.path()).build().unwrap();
    assert_eq!(vm.require("./pkg").wait().unwrap(), json!("from main"));
    vm.dispose();
}

#[test]
fn script_base_path_anchors_relative_requires() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("dep.js"), "module.exports = 7;").unwrap();
    let entry = dir.path().join("main.js");
    fs::write(&entry, "require('./dep.js') * 6").unwrap();

    let vm = Vm::builder().root("/").build().unwrap();
    let script = Script::from_file(&entry).unwrap();
    assert_eq!(vm.run_script(&script).wait().unwrap(), json!(42));
    vm.dispose();
}

#[test]
fn missing_module_is_module_not_found() {
    let dir = tempdir().unwrap();
    let vm = Vm::builder().root(dir.path()).build().unwrap();
    let err = vm.require("./nothing-here.js").wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    vm.dispose();
}

#[test]
fn url_modules_report_module_load() {
    let vm = Vm::builder().build().unwrap();
    let err = vm.require("https://example.com/remote.js").wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleLoad);
    assert!(err.message().contains("https://example.com/remote.js"));
    vm.dispose();
}

#[test]
fn virtual_modules_require_by_name() {
    let vm = Vm::builder()
        .virtual_module("answers", "exports.ultimate = 42;")
        .build()
        .unwrap();
    assert_eq!(
        vm.require("answers").wait().unwrap(),
        json!({"ultimate": 42})
    );
    vm.dispose();
}
