//! Chain Assembler: generates the wrapper module that ties a pipeline's
//! compiled functions into one entry point.
//!
//! The wrapper is regenerated from scratch for every sandbox, so its import
//! graph always matches the current function set.

use std::fmt::Write as _;

use fathom_config::ChainMode;

use crate::linker::{LinkedFunction, INTERNAL_URL};

/// Source of the generated chain module.
///
/// It imports every user module under its internal URL, wraps each default
/// export, exports `runChain`, and registers it for the host.
pub fn assemble(functions: &[LinkedFunction], mode: ChainMode) -> String {
    let mut source = String::new();
    let _ = writeln!(
        source,
        "import {{ wrap, runChain as run, register }} from {};",
        js_string(INTERNAL_URL)
    );
    for (index, function) in functions.iter().enumerate() {
        let _ = writeln!(
            source,
            "import * as m{index} from {};",
            js_string(&function.url)
        );
    }

    source.push_str("\nconst chain = Object.freeze([\n");
    for (index, function) in functions.iter().enumerate() {
        let _ = writeln!(
            source,
            "  wrap({}, {}, m{index}),",
            js_string(&function.id),
            js_string(&function.name)
        );
    }
    source.push_str("]);\n\n");

    let _ = writeln!(
        source,
        "export async function runChain() {{\n  return run({}, chain);\n}}\n",
        js_string(mode.as_str())
    );
    source.push_str("register(runChain);\n");
    source
}

/// A JSON string literal is a valid JS string literal.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
