// Bytecode-JSON module loading: translation, closures, table constants
// and load-time failures.

use super::assert_double;
use crate::lua_vm::Vm;
use crate::{call_function, load_module};

fn run_chunk(json: &str) -> (Vm, Vec<crate::TValue>) {
    let mut vm = Vm::new();
    let module = load_module(&mut vm, json).expect("module must load");
    let values = match call_function(&mut vm, module.entry_function, &[]) {
        Ok(v) => v,
        Err(_) => panic!("chunk raised: {}", vm.error_message()),
    };
    (*vm, values)
}

#[test]
fn test_minimal_chunk() {
    let json = r#"{
        "ChunkName": "min.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 4,
            "Upvalues": [], "NumberConstants": [], "ObjectConstants": [],
            "Bytecode": [
                {"OpCode": "KSHORT", "OpData": [0, 21]},
                {"OpCode": "KSHORT", "OpData": [1, 21]},
                {"OpCode": "ADDVV", "OpData": [2, 0, 1]},
                {"OpCode": "RET1", "OpData": [2, 2]}
            ]
        }]
    }"#;
    let (_vm, values) = run_chunk(json);
    assert_double(values[0], 42.0);
}

#[test]
fn test_comparison_jmp_fusion_and_loop() {
    // sum = 0; i = 0; while i < 5 do i = i + 1; sum = sum + i end
    let json = r#"{
        "ChunkName": "loop.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 6,
            "Upvalues": [],
            "NumberConstants": [{"Type": "Int32", "Value": 5}],
            "ObjectConstants": [],
            "Bytecode": [
                {"OpCode": "KSHORT", "OpData": [0, 0]},
                {"OpCode": "KSHORT", "OpData": [1, 0]},
                {"OpCode": "KNUM", "OpData": [2, 0]},
                {"OpCode": "ISGE", "OpData": [1, 2]},
                {"OpCode": "JMP", "OpData": [2, 4]},
                {"OpCode": "KSHORT", "OpData": [3, 1]},
                {"OpCode": "ADDVV", "OpData": [1, 1, 3]},
                {"OpCode": "ADDVV", "OpData": [0, 0, 1]},
                {"OpCode": "JMP", "OpData": [2, -6]},
                {"OpCode": "RET1", "OpData": [0, 2]}
            ]
        }]
    }"#;
    let (_vm, values) = run_chunk(json);
    assert_double(values[0], 15.0);
}

#[test]
fn test_closure_upvalue_roundtrip() {
    // local c = 10
    // local f = function() c = c + 1; return c end
    // f(); return f()
    let json = r#"{
        "ChunkName": "closure.lua",
        "FunctionPrototypes": [
            {
                "NumFixedParams": 0, "TakesVarArg": false, "MaxFrameSize": 4,
                "Upvalues": [{"IsParentLocal": true, "IsImmutable": false, "ParentLocalOrdinal": 0}],
                "NumberConstants": [], "ObjectConstants": [],
                "Bytecode": [
                    {"OpCode": "UGET", "OpData": [0, 0]},
                    {"OpCode": "KSHORT", "OpData": [1, 1]},
                    {"OpCode": "ADDVV", "OpData": [0, 0, 1]},
                    {"OpCode": "USETV", "OpData": [0, 0]},
                    {"OpCode": "RET1", "OpData": [0, 2]}
                ]
            },
            {
                "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 8,
                "Upvalues": [],
                "NumberConstants": [],
                "ObjectConstants": [{"Type": "FunctionPrototype", "Value": 0}],
                "Bytecode": [
                    {"OpCode": "KSHORT", "OpData": [0, 10]},
                    {"OpCode": "FNEW", "OpData": [1, 0]},
                    {"OpCode": "MOV", "OpData": [2, 1]},
                    {"OpCode": "CALL", "OpData": [2, 2, 1]},
                    {"OpCode": "MOV", "OpData": [3, 1]},
                    {"OpCode": "CALL", "OpData": [3, 2, 1]},
                    {"OpCode": "UCLO", "OpData": [0, 0]},
                    {"OpCode": "RET1", "OpData": [3, 2]}
                ]
            }
        ]
    }"#;
    let (_vm, values) = run_chunk(json);
    assert_double(values[0], 12.0);
}

#[test]
fn test_table_constant_and_access() {
    let json = r#"{
        "ChunkName": "tdup.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 6,
            "Upvalues": [],
            "NumberConstants": [],
            "ObjectConstants": [
                {"Type": "String", "Value": "answer"},
                {"Type": "Table", "AdditionalNamedKeys": 0, "Value": [
                    {"EntryKey": {"Type": "String", "Value": "answer"},
                     "EntryValue": {"Type": "Int32", "Value": 40}},
                    {"EntryKey": {"Type": "Int32", "Value": 1},
                     "EntryValue": {"Type": "Int32", "Value": 2}}
                ]}
            ],
            "Bytecode": [
                {"OpCode": "TDUP", "OpData": [0, 1]},
                {"OpCode": "TGETS", "OpData": [1, 0, 0]},
                {"OpCode": "TGETB", "OpData": [2, 0, 1]},
                {"OpCode": "ADDVV", "OpData": [3, 1, 2]},
                {"OpCode": "RET1", "OpData": [3, 2]}
            ]
        }]
    }"#;
    let (_vm, values) = run_chunk(json);
    assert_double(values[0], 42.0);
}

#[test]
fn test_globals_through_module() {
    let json = r#"{
        "ChunkName": "gset.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 6,
            "Upvalues": [],
            "NumberConstants": [],
            "ObjectConstants": [{"Type": "String", "Value": "exported"}],
            "Bytecode": [
                {"OpCode": "KSHORT", "OpData": [0, 99]},
                {"OpCode": "GSET", "OpData": [0, 0]},
                {"OpCode": "GGET", "OpData": [1, 0]},
                {"OpCode": "RET1", "OpData": [1, 2]}
            ]
        }]
    }"#;
    let (mut vm, values) = run_chunk(json);
    assert_double(values[0], 99.0);
    assert_double(vm.get_global("exported"), 99.0);
}

#[test]
fn test_vararg_chunk_name_and_errors() {
    let mut vm = Vm::new();
    // Chunk entry must be parameterless.
    let bad = r#"{
        "ChunkName": "bad.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 1, "TakesVarArg": false, "MaxFrameSize": 4,
            "Upvalues": [], "NumberConstants": [], "ObjectConstants": [],
            "Bytecode": [{"OpCode": "RET0", "OpData": []}]
        }]
    }"#;
    assert!(load_module(&mut vm, bad).is_err());

    // Unknown opcodes are load-time failures.
    let bad = r#"{
        "ChunkName": "bad2.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 4,
            "Upvalues": [], "NumberConstants": [], "ObjectConstants": [],
            "Bytecode": [{"OpCode": "FROBNICATE", "OpData": []}]
        }]
    }"#;
    let e = load_module(&mut vm, bad).unwrap_err();
    assert!(e.to_string().contains("bad opcode"), "{}", e);

    let module = load_module(
        &mut vm,
        r#"{"ChunkName": "named.lua", "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 2,
            "Upvalues": [], "NumberConstants": [], "ObjectConstants": [],
            "Bytecode": [{"OpCode": "RET0", "OpData": []}]
        }]}"#,
    )
    .unwrap();
    assert_eq!(module.name.as_str(), "named.lua");
}

#[test]
fn test_module_from_file() {
    use std::io::Write;
    let json = r#"{
        "ChunkName": "file.lua",
        "FunctionPrototypes": [{
            "NumFixedParams": 0, "TakesVarArg": true, "MaxFrameSize": 4,
            "Upvalues": [], "NumberConstants": [], "ObjectConstants": [],
            "Bytecode": [
                {"OpCode": "KSHORT", "OpData": [0, 7]},
                {"OpCode": "RET1", "OpData": [0, 2]}
            ]
        }]
    }"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    let content = std::fs::read_to_string(file.path()).unwrap();
    let (_vm, values) = run_chunk(&content);
    assert_double(values[0], 7.0);
}
