//! End-to-end exercise of the post-pass: a placeholder reserved by a [`Function`] gets spliced
//! with bytes from a stand-in "assembled" object, the way §4.E's steps 1, 3, 6, and 10-13 chain
//! together in practice. The external assembler invocation is stubbed with a shell script that
//! hands back a pre-built object, since this crate only ever shells out to one and cannot be
//! trusted to have a real MIPS assembler on the test machine.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;

use asm_processor::asm::Function;
use asm_processor::elf::object::ObjFile;
use asm_processor::elf::sym::{STB_GLOBAL, STT_NOTYPE};
use asm_processor::fixup::fixup_objfile;
use asm_processor::options::ConvertStatics;

/// Writes a `/bin/sh` script that, regardless of its own arguments, copies `payload` to
/// whatever path the real assembler would have been asked to write to (`-o <path>`, always the
/// third positional argument here since `fixup_objfile` invokes `<assembler> <asm> -o <obj>`).
fn fake_assembler(dir: &std::path::Path, payload: &std::path::Path) -> String {
    let script_path = dir.join("fake_as.sh");
    fs::write(&script_path, format!("#!/bin/sh\ncp \"{}\" \"$3\"\n", payload.display())).unwrap();
    let mut perms = fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).unwrap();
    format!("sh {}", script_path.display())
}

fn init_logging() {
    let _ = stderrlog::new().verbosity(4).init();
}

#[test]
fn splices_assembled_text_into_placeholder() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    // `O`: what the compiler produced, with an 8-byte placeholder reserved for the block.
    let o_bytes = common::build_text_object(
        &[0x11u8; 8],
        &[common::sym("_asmpp_func1", 0, 8, STB_GLOBAL, STT_NOTYPE)],
    );
    let o_path = dir.path().join("out.o");
    fs::write(&o_path, &o_bytes).unwrap();

    // `A`: what the assembler would have produced for that block — two real NOP words
    // (`0x00000000`) bracketed by the `_asm_start`/`_asm_end` markers `build_assembly_source`
    // emits.
    let a_bytes = common::build_text_object(
        &[0x00u8; 8],
        &[
            common::sym("_asmpp_func1_asm_start", 0, 0, STB_GLOBAL, STT_NOTYPE),
            common::sym("_asmpp_func1_asm_end", 8, 0, STB_GLOBAL, STT_NOTYPE),
        ],
    );
    let a_path = dir.path().join("assembled.o");
    fs::write(&a_path, &a_bytes).unwrap();

    let assembler = fake_assembler(dir.path(), &a_path);

    let mut function = Function::new("test_fn (2 instrs)".to_string());
    function.text_glabels = vec!["test_fn".to_string()];
    function.asm_conts = vec!["nop".to_string(), "nop".to_string()];
    function.text_segments = vec![("_asmpp_func1".to_string(), 8)];

    fixup_objfile(&o_path, std::slice::from_ref(&function), &[], &assembler, false, ConvertStatics::No).unwrap();

    let merged = ObjFile::from_file(&o_path).unwrap();
    let text = merged.find_section(".text").unwrap();
    assert_eq!(text.data, vec![0u8; 8], "placeholder bytes should have been overwritten with the assembled NOPs");

    // The placeholder symbol itself is a temp name (`_asmpp_`-prefixed) and must not survive
    // into the merged symbol table.
    assert!(merged.find_symbol("_asmpp_func1").is_none());
    assert!(merged.find_symbol("_asmpp_func1_asm_start").is_none());
}

#[test]
fn errors_when_assembled_definition_has_wrong_size() {
    let dir = tempfile::tempdir().unwrap();

    let o_bytes = common::build_text_object(
        &[0x11u8; 8],
        &[common::sym("_asmpp_func1", 0, 8, STB_GLOBAL, STT_NOTYPE)],
    );
    let o_path = dir.path().join("out.o");
    fs::write(&o_path, &o_bytes).unwrap();

    // The assembler only produced 4 bytes for a placeholder that reserved 8.
    let a_bytes = common::build_text_object(
        &[0x00u8; 4],
        &[
            common::sym("_asmpp_func1_asm_start", 0, 0, STB_GLOBAL, STT_NOTYPE),
            common::sym("_asmpp_func1_asm_end", 4, 0, STB_GLOBAL, STT_NOTYPE),
        ],
    );
    let a_path = dir.path().join("assembled.o");
    fs::write(&a_path, &a_bytes).unwrap();

    let assembler = fake_assembler(dir.path(), &a_path);

    let mut function = Function::new("test_fn (1 instr)".to_string());
    function.text_glabels = vec!["test_fn".to_string()];
    function.asm_conts = vec!["nop".to_string()];
    function.text_segments = vec![("_asmpp_func1".to_string(), 8)];

    let err = fixup_objfile(&o_path, std::slice::from_ref(&function), &[], &assembler, false, ConvertStatics::No).unwrap_err();
    assert!(err.to_string().contains("incorrectly sized"), "unexpected error: {err}");
}
