//! Run a JavaScript file and print its completion value.
//!
//! ```shell
//! cargo run --example run_script -- ./script.js
//! ```
//!
//! If a `package.json` sits next to the script it is used as the manifest,
//! so import-map aliases and dependencies resolve.

use std::env;
use std::path::{Path, PathBuf};

use gode::{Script, Vm};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let Some(file) = args.next() else {
        eprintln!("usage: run_script <file.js>");
        std::process::exit(2);
    };
    let file = PathBuf::from(file);
    let script = Script::from_file(&file)?;

    let mut builder = Vm::builder();
    let manifest = file.parent().unwrap_or(Path::new(".")).join("package.json");
    if manifest.exists() {
        builder = builder.manifest_file(manifest);
    }
    let vm = builder.build()?;

    match vm.run_script(&script).wait() {
        Ok(value) => println!("{value}"),
        Err(err) => {
            eprintln!("{}", err.render());
            vm.dispose();
            std::process::exit(1);
        }
    }

    vm.dispose();
    Ok(())
}
