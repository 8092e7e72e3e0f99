//! The source preprocessor (§4.D): the pre-pass driver that walks a C/Pascal source file,
//! routes `GLOBAL_ASM`/`INCLUDE_ASM`/`INCLUDE_RODATA` blocks through [`AsmBlock`], and emits a
//! transformed source with byte-exact placeholder storage spliced in.
//!
//! Exactly one output line is produced per input line; a block's generated stub is distributed
//! across the physical lines it spanned, with multi-statement slots joined by interior
//! newlines (mirrors [`AsmBlock::finish`]'s `src` convention). Single-line forms
//! (`GLOBAL_ASM("path")`, `INCLUDE_ASM`, `INCLUDE_RODATA`, and inlined recursive includes) pack
//! their entire multi-line stub onto the one source line that triggered them.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::asm::{AsmBlock, Function};
use crate::error::{Error, Result};
use crate::options::Opts;
use crate::state::GlobalState;

lazy_static! {
    static ref RE_GLOBAL_ASM_FILE: Regex = Regex::new(r#"^(?:#pragma )?GLOBAL_ASM\("([^"]*)"\)$"#).unwrap();
    static ref RE_INCLUDE_ASM: Regex =
        Regex::new(r#"^(INCLUDE_ASM|INCLUDE_RODATA)\("([^"]*)",\s*"([^"]*)"\);$"#).unwrap();
    static ref RE_EARLY_INCLUDE: Regex = Regex::new(r#"^#include\s+"([^"]*)"$"#).unwrap();
    static ref CUTSCENE_DATA_RE: Regex = Regex::new(r"CutsceneData(?:.|\n)*\[\]\s*=\s*\{").unwrap();
    static ref FLOAT_RE: Regex = Regex::new(r"[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?f\b").unwrap();
}

fn repl_float_hex(caps: &regex::Captures) -> String {
    let token = caps.get(0).unwrap().as_str();
    let digits = &token[..token.len() - 1];
    match digits.parse::<f32>() {
        Ok(value) => u32::from_be_bytes(value.to_be_bytes()).to_string(),
        Err(_) => token.to_string(),
    }
}

enum Mode {
    Normal,
    InsideGlobalAsm { block: AsmBlock, start_line: usize },
    AwaitingInclude,
}

/// Preprocesses one source file, returning the transformed source text and the ordered list of
/// [`Function`]s extracted from its assembly blocks. `dependencies` accumulates every file path
/// opened to satisfy an include (recursively, for `#pragma asmproc recurse`).
pub fn preprocess_source<R: BufRead>(
    input: &mut R,
    filename: &Path,
    opts: &Opts,
    state: &mut GlobalState,
    dependencies: &mut Vec<String>,
) -> Result<(Vec<Function>, String)> {
    let mut functions = Vec::new();
    let mut output_lines: Vec<String> = vec![format!("#line 1 \"{}\"", filename.display())];
    let mut mode = Mode::Normal;
    let mut is_cutscene_data = false;
    let mut line_no = 0usize;

    for raw in input.lines() {
        let raw = raw?;
        let raw_line = raw.trim_end().to_string();
        let trimmed = raw_line.trim_start();
        line_no += 1;

        output_lines.push(String::new());
        let current = output_lines.len() - 1;

        if matches!(mode, Mode::InsideGlobalAsm { .. }) {
            if trimmed.starts_with(')') {
                let (block, start_line) = match std::mem::replace(&mut mode, Mode::Normal) {
                    Mode::InsideGlobalAsm { block, start_line } => (block, start_line),
                    _ => unreachable!(),
                };
                let (src, func) = block.finish(state)?;
                for (i, line) in src.into_iter().enumerate() {
                    output_lines[start_line + 1 + i] = line;
                }
                functions.push(func);
            } else if let Mode::InsideGlobalAsm { block, .. } = &mut mode {
                block.process_line(&raw_line, &opts.output_enc)?;
            }
            continue;
        }

        match &mut mode {
            Mode::AwaitingInclude => {
                mode = Mode::Normal;
                let caps = RE_EARLY_INCLUDE
                    .captures(trimmed)
                    .ok_or_else(|| Error::Preprocess("#pragma asmproc recurse must be followed by an #include".into()))?;
                let include_rel = &caps[1];
                let parent = filename.parent().unwrap_or_else(|| Path::new(""));
                let include_path = parent.join(include_rel);
                dependencies.push(include_path.to_string_lossy().into_owned());

                let include_file = File::open(&include_path)?;
                let mut reader = BufReader::new(include_file);
                let (mut nested_functions, nested_src) =
                    preprocess_source(&mut reader, &include_path, opts, state, dependencies)?;
                functions.append(&mut nested_functions);

                let mut combined = nested_src;
                combined.push_str(&format!("\n#line {} \"{}\"", line_no + 1, filename.display()));
                output_lines[current] = combined;
                continue;
            }
            Mode::Normal => {}
            Mode::InsideGlobalAsm { .. } => unreachable!("handled above"),
        }

        if trimmed == "GLOBAL_ASM(" || trimmed == "#pragma GLOBAL_ASM(" {
            let block = AsmBlock::new(format!("GLOBAL_ASM block at line {}", line_no));
            mode = Mode::InsideGlobalAsm { block, start_line: current };
            continue;
        }

        if let Some(caps) = RE_GLOBAL_ASM_FILE.captures(trimmed) {
            let path = PathBuf::from(&caps[1]);
            process_file_form(&path, Vec::new(), opts, state, dependencies, &mut functions, &mut output_lines[current])?;
            continue;
        }

        if let Some(caps) = RE_INCLUDE_ASM.captures(trimmed) {
            let is_rodata = &caps[1] == "INCLUDE_RODATA";
            let dir = &caps[2];
            let name = &caps[3];
            let path = PathBuf::from(format!("{}/{}.s", dir, name));
            let prologue = if is_rodata { vec![".section .rodata".to_string()] } else { Vec::new() };
            process_file_form(&path, prologue, opts, state, dependencies, &mut functions, &mut output_lines[current])?;
            continue;
        }

        if trimmed == "#pragma asmproc recurse" {
            mode = Mode::AwaitingInclude;
            continue;
        }

        if opts.enable_cutscene_data_float_encoding {
            if CUTSCENE_DATA_RE.is_match(trimmed) {
                is_cutscene_data = true;
            } else if trimmed.ends_with("};") {
                is_cutscene_data = false;
            }
            if is_cutscene_data {
                output_lines[current] = FLOAT_RE.replace_all(&raw_line, repl_float_hex).into_owned();
                continue;
            }
        }

        output_lines[current] = raw_line;
    }

    if matches!(mode, Mode::InsideGlobalAsm { .. }) {
        return Err(Error::Preprocess("unterminated GLOBAL_ASM( block: missing closing \")\"".into()));
    }

    Ok((functions, output_lines.join("\n")))
}

/// Handles the single-line forms (`GLOBAL_ASM("path")`, `INCLUDE_ASM`, `INCLUDE_RODATA`):
/// opens `path`, feeds `prologue` then the file's lines through a fresh [`AsmBlock`], and packs
/// the resulting stub onto `slot`. Degrades to `#include "GLOBAL_ASM:<path>"` if the file is
/// absent (§7's one sanctioned silent-degrade exception).
fn process_file_form(
    path: &Path,
    prologue: Vec<String>,
    opts: &Opts,
    state: &mut GlobalState,
    dependencies: &mut Vec<String>,
    functions: &mut Vec<Function>,
    slot: &mut String,
) -> Result<()> {
    match File::open(path) {
        Ok(file) => {
            let mut block = AsmBlock::new(path.display().to_string());
            for line in prologue {
                block.process_line(&line, &opts.output_enc)?;
            }
            for line in BufReader::new(file).lines() {
                block.process_line(&line?, &opts.output_enc)?;
            }
            let (src, func) = block.finish(state)?;
            *slot = src.join("\n");
            functions.push(func);
            dependencies.push(path.display().to_string());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            *slot = format!("#include \"GLOBAL_ASM:{}\"", path.display());
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConvertStatics;
    use std::io::Cursor;

    fn opts() -> Opts {
        Opts::new("O1", false, false, false, false, false, "test.c", "latin1", "latin1", false, ConvertStatics::No, false)
    }

    #[test]
    fn inline_global_asm_block_is_replaced_with_stub() {
        let src = "int before;\nGLOBAL_ASM(\nglabel foo\nnop\nnop\n)\nint after;\n";
        let mut input = Cursor::new(src);
        let mut state = GlobalState::from_opts("O1", false, false, false, false);
        let mut deps = Vec::new();
        let (functions, out) =
            preprocess_source(&mut input, Path::new("test.c"), &opts(), &mut state, &mut deps).unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].text_glabels, vec!["foo".to_string()]);
        assert!(out.contains("int before;"));
        assert!(out.contains("int after;"));
        assert!(out.contains("_asmpp_func1"));
        // The opening "GLOBAL_ASM(" line is blanked, not echoed, in the transformed source.
        assert!(!out.contains("GLOBAL_ASM("));
    }

    #[test]
    fn missing_include_asm_degrades_to_include_directive() {
        let src = "INCLUDE_ASM(\"asm/nonexistent\", \"func_80001234\");\n";
        let mut input = Cursor::new(src);
        let mut state = GlobalState::from_opts("O1", false, false, false, false);
        let mut deps = Vec::new();
        let (functions, out) =
            preprocess_source(&mut input, Path::new("test.c"), &opts(), &mut state, &mut deps).unwrap();
        assert!(functions.is_empty());
        assert!(out.contains("#include \"GLOBAL_ASM:asm/nonexistent/func_80001234.s\""));
        assert!(deps.is_empty());
    }

    #[test]
    fn cutscene_data_floats_are_rewritten_to_decimal_bit_patterns() {
        let src = "CutsceneData foo[] = {\n    1.0f,\n};\n";
        let mut input = Cursor::new(src);
        let mut o = opts();
        o.enable_cutscene_data_float_encoding = true;
        let mut state = GlobalState::from_opts("O1", false, false, false, false);
        let mut deps = Vec::new();
        let (_functions, out) = preprocess_source(&mut input, Path::new("test.c"), &o, &mut state, &mut deps).unwrap();
        let expected = u32::from_be_bytes(1.0f32.to_be_bytes()).to_string();
        assert!(out.contains(&expected));
        assert!(!out.contains("1.0f"));
    }

    #[test]
    fn cutscene_data_floats_untouched_when_flag_disabled() {
        let src = "CutsceneData foo[] = {\n    1.0f,\n};\n";
        let mut input = Cursor::new(src);
        let mut state = GlobalState::from_opts("O1", false, false, false, false);
        let mut deps = Vec::new();
        let (_functions, out) =
            preprocess_source(&mut input, Path::new("test.c"), &opts(), &mut state, &mut deps).unwrap();
        assert!(out.contains("1.0f"));
    }

    #[test]
    fn pragma_recurse_without_include_is_an_error() {
        let src = "#pragma asmproc recurse\nint x;\n";
        let mut input = Cursor::new(src);
        let mut state = GlobalState::from_opts("O1", false, false, false, false);
        let mut deps = Vec::new();
        let err = preprocess_source(&mut input, Path::new("test.c"), &opts(), &mut state, &mut deps).unwrap_err();
        assert!(err.to_string().contains("must be followed by an #include"));
    }
}
