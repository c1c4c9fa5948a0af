// ABOUTME: Generates the three workspace files (tool/runner/manifest) per invocation
// ABOUTME: Shared text templates used by both the container and fork executor backends

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;

use crate::model::DynamicTool;
use crate::sandbox::output::RESULT_MARKER;

/// The tool's code wrapped as the body of an exported async `run` function.
#[must_use]
pub fn render_tool_module(code: &str) -> String {
    format!(
        "export async function run(args) {{\n{code}\n}}\n"
    )
}

/// A small harness: decode base64 args, await `run(args)`, print the
/// marker-prefixed envelope. Circular-reference-safe via a `seen` WeakSet-like
/// array and a replacer that stringifies exceptions/bigints.
#[must_use]
pub fn render_runner_module() -> String {
    format!(
        r#"import {{ run }} from './tool.mjs';

function safeSerialize(value) {{
  const seen = [];
  const replacer = (_key, val) => {{
    if (typeof val === 'bigint') return val.toString();
    if (val instanceof Error) return {{ name: val.name, message: val.message, stack: val.stack }};
    if (typeof val === 'object' && val !== null) {{
      if (seen.includes(val)) return '[Circular]';
      seen.push(val);
    }}
    return val;
  }};
  return JSON.stringify(value, replacer);
}}

async function main() {{
  const encoded = process.env.DYNMCP_ARGS_B64 || '';
  let args = {{}};
  try {{
    args = JSON.parse(Buffer.from(encoded, 'base64').toString('utf8'));
  }} catch (_e) {{
    args = {{}};
  }}
  try {{
    const result = await run(args);
    process.stdout.write('{marker}' + safeSerialize({{ ok: true, result }}) + '\n');
  }} catch (err) {{
    const message = err && err.message ? err.message : String(err);
    process.stdout.write('{marker}' + safeSerialize({{ ok: false, error: message }}) + '\n');
  }}
}}

main();
"#,
        marker = RESULT_MARKER
    )
}

/// Declares module type and runtime dependencies for the package manager
/// invoked inside the container (no-op for the fork backend).
#[must_use]
pub fn render_manifest(tool: &DynamicTool) -> String {
    let deps: Value = serde_json::json!(tool
        .dependencies
        .iter()
        .map(|d| (d.name.clone(), d.version.clone()))
        .collect::<std::collections::BTreeMap<_, _>>());
    serde_json::json!({
        "type": "module",
        "private": true,
        "dependencies": deps,
    })
    .to_string()
}

/// Base64-encodes the invocation args for the harness's env var.
#[must_use]
pub fn encode_args(args: &Value) -> String {
    STANDARD.encode(args.to_string())
}
