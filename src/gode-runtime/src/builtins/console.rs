use std::io::Write as _;

use rquickjs::prelude::Rest;
use rquickjs::{Coerced, Ctx, Function, Object};

/// Install the global `console` object.
pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |txt: Rest<Coerced<String>>| write_line(false, txt))?,
    )?;
    console.set(
        "info",
        Function::new(ctx.clone(), |txt: Rest<Coerced<String>>| write_line(false, txt))?,
    )?;
    console.set(
        "warn",
        Function::new(ctx.clone(), |txt: Rest<Coerced<String>>| write_line(true, txt))?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), |txt: Rest<Coerced<String>>| write_line(true, txt))?,
    )?;
    ctx.globals().set("console", console)?;
    Ok(())
}

fn write_line(stderr: bool, parts: Rest<Coerced<String>>) {
    let line = parts
        .into_inner()
        .into_iter()
        .map(|part| part.0)
        .collect::<Vec<_>>()
        .join(" ");
    if stderr {
        let mut out = std::io::stderr().lock();
        let _ = writeln!(out, "{line}");
    } else {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}
