//! Program serialization to JSON.

use crate::compiler::bytecode::Program;

/// Emit a compiled program as pretty-printed JSON.
pub fn emit_json(program: &Program) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(program)
}

/// Read a program back from [`emit_json`] output.
pub fn load_json(json: &str) -> Result<Program, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    #[test]
    fn test_emit_json() {
        let program = compile("fn main() { 42 }").unwrap();
        let json = emit_json(&program).unwrap();
        assert!(json.contains("\"main\""));
        assert!(json.contains("LoadConst"));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["source_hash"].as_str().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_load_json_preserves_code() {
        let program = compile("fn f(x) { if x { 1 } else { 2 } }").unwrap();
        let back = load_json(&emit_json(&program).unwrap()).unwrap();
        assert_eq!(back.functions["f"].code, program.functions["f"].code);
        assert_eq!(back.source_hash, program.source_hash);
    }
}
