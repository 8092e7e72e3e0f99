//! The assembly-block analyzer (§4.C): turns a sequence of raw assembly lines into per-section
//! byte sizes, a list of `.text` glabels, and — once [`AsmBlock::finish`] is called — the
//! placeholder C/Pascal stub that reserves byte-exact storage for each section.

use std::collections::{HashMap, VecDeque};

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

use crate::asm::function::Function;
use crate::error::{Error, Result};
use crate::state::GlobalState;

lazy_static! {
    static ref RE_COMMENT_OR_STRING: Regex = Regex::new(r#"#.*|/\*.*?\*/|"(?:\\.|[^\\"])*""#).unwrap();
    static ref RE_LEADING_LABEL: Regex = Regex::new(r"^[A-Za-z0-9_]+:\s*").unwrap();
}

fn strip_comments(line: &str) -> String {
    RE_COMMENT_OR_STRING
        .replace_all(line, |cap: &regex::Captures| {
            let s = cap.get(0).unwrap().as_str();
            if s.starts_with('#') || s.starts_with('/') { " ".to_string() } else { s.to_string() }
        })
        .to_string()
}

const SECTIONS: &[&str] = &[".text", ".data", ".rodata", ".late_rodata", ".bss"];

/// Accumulates one `GLOBAL_ASM`/`INCLUDE_ASM` block's worth of assembly lines.
#[derive(Debug, Clone)]
pub struct AsmBlock {
    fn_desc: String,
    cur_section: String,
    fn_section_sizes: HashMap<String, usize>,
    text_glabels: Vec<String>,
    asm_conts: Vec<String>,
    late_rodata_asm_conts: Vec<String>,
    /// `(line_index, instruction_count)`, in the order instructions were seen.
    fn_ins_inds: Vec<(usize, usize)>,
    /// 0, or the `.late_rodata_alignment` value (4 or 8) currently assumed.
    late_rodata_alignment: usize,
    late_rodata_alignment_from_content: bool,
    glued_line: String,
    num_lines: usize,
}

impl AsmBlock {
    pub fn new(fn_desc: impl Into<String>) -> AsmBlock {
        AsmBlock {
            fn_desc: fn_desc.into(),
            cur_section: ".text".to_string(),
            fn_section_sizes: SECTIONS.iter().map(|s| (s.to_string(), 0usize)).collect(),
            text_glabels: Vec::new(),
            asm_conts: Vec::new(),
            late_rodata_asm_conts: Vec::new(),
            fn_ins_inds: Vec::new(),
            late_rodata_alignment: 0,
            late_rodata_alignment_from_content: false,
            glued_line: String::new(),
            num_lines: 0,
        }
    }

    fn fail(&self, message: &str, line: Option<&str>) -> Error {
        Error::asm(&self.fn_desc, line, message)
    }

    fn align2(&mut self) {
        let size = self.fn_section_sizes.get_mut(&self.cur_section).unwrap();
        *size = size.div_ceil(2) * 2;
    }

    fn align4(&mut self) {
        let size = self.fn_section_sizes.get_mut(&self.cur_section).unwrap();
        *size = size.div_ceil(4) * 4;
    }

    fn add_sized(&mut self, size: isize, line: &str) -> Result<()> {
        if (self.cur_section == ".text" || self.cur_section == ".late_rodata") && size % 4 != 0 {
            return Err(self.fail("size must be a multiple of 4", Some(line)));
        }
        if size < 0 {
            return Err(self.fail("size cannot be negative", Some(line)));
        }
        *self.fn_section_sizes.get_mut(&self.cur_section).unwrap() += size as usize;

        if self.cur_section == ".text" {
            if self.text_glabels.is_empty() {
                return Err(self.fail(".text block before a glabel", Some(line)));
            }
            self.fn_ins_inds.push((self.num_lines - 1, size as usize / 4));
        }
        Ok(())
    }

    fn count_quoted_size(&self, line: &str, null_terminate: bool, real_line: &str, output_enc: &str) -> Result<usize> {
        let enc = Encoding::for_label(output_enc.as_bytes())
            .ok_or_else(|| self.fail(&format!("unknown output encoding {:?}", output_enc), Some(real_line)))?;
        let (encoded, _, _) = enc.encode(line);

        let mut in_quote = false;
        let mut has_comma = true;
        let mut num_parts = 0usize;
        let mut ret = 0usize;
        let bytes = encoded.as_ref();
        let mut i = 0usize;

        while i < bytes.len() {
            let c = bytes[i];
            i += 1;
            if !in_quote {
                if c == b'"' {
                    in_quote = true;
                    if null_terminate && !has_comma {
                        return Err(
                            self.fail(".asciz/.asciiz with glued strings is not supported", Some(real_line))
                        );
                    }
                    num_parts += 1;
                } else if c == b',' {
                    has_comma = true;
                }
                continue;
            }
            if c == b'"' {
                in_quote = false;
                has_comma = false;
                continue;
            }
            ret += 1;
            if c != b'\\' {
                continue;
            }
            if i == bytes.len() {
                return Err(self.fail("backslash at end of line", Some(real_line)));
            }
            let esc = bytes[i];
            i += 1;
            if esc == b'x' {
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
            } else if esc.is_ascii_digit() {
                let mut extra = 0;
                while i < bytes.len() && bytes[i].is_ascii_digit() && extra < 2 {
                    i += 1;
                    extra += 1;
                }
            }
        }

        if in_quote {
            return Err(self.fail("unterminated string literal", Some(real_line)));
        }
        if num_parts == 0 {
            return Err(self.fail(".ascii/.asciz/.asciiz with no string", Some(real_line)));
        }
        Ok(if null_terminate { ret + num_parts } else { ret })
    }

    /// Feed one (already backslash-joined-at-caller-level-agnostic) source line.
    pub fn process_line(&mut self, line: &str, output_enc: &str) -> Result<()> {
        self.num_lines += 1;

        if let Some(stripped) = line.strip_suffix('\\') {
            self.glued_line.push_str(stripped);
            return Ok(());
        }
        let joined = std::mem::take(&mut self.glued_line) + line;

        let real_line = joined.clone();
        let mut line = strip_comments(&joined);
        line = line.trim().to_string();
        line = RE_LEADING_LABEL.replace(&line, "").to_string();

        let mut changed_section = false;
        let mut emitting_double = false;

        if line.is_empty() {
            // nothing to do
        } else if (line.starts_with("glabel ") || line.starts_with("jlabel ")) && self.cur_section == ".text" {
            if let Some(label) = line.split_whitespace().nth(1) {
                self.text_glabels.push(label.to_string());
            }
        } else if line.starts_with("glabel ")
            || line.starts_with("dlabel ")
            || line.starts_with("jlabel ")
            || line.starts_with("endlabel ")
            || (!line.contains(' ') && line.ends_with(':'))
        {
            // a label outside .text, or a non-glabel label: ignored for sizing
        } else if line.starts_with(".section") || SECTIONS.contains(&line.as_str()) || line == ".rdata" {
            self.cur_section = if line == ".rdata" {
                ".rodata".to_string()
            } else {
                line.split(',')
                    .next()
                    .and_then(|s| s.split_whitespace().last())
                    .ok_or_else(|| self.fail("invalid .section directive", Some(&real_line)))?
                    .to_string()
            };
            if !SECTIONS.contains(&self.cur_section.as_str()) {
                return Err(self.fail("unrecognized section", Some(&real_line)));
            }
            changed_section = true;
        } else if line.starts_with(".late_rodata_alignment") {
            if self.cur_section != ".late_rodata" {
                return Err(self.fail(".late_rodata_alignment must occur within .late_rodata", Some(&real_line)));
            }
            let value: usize = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.fail("invalid .late_rodata_alignment value", Some(&real_line)))?;
            if value != 4 && value != 8 {
                return Err(self.fail(".late_rodata_alignment must be 4 or 8", Some(&real_line)));
            }
            if self.late_rodata_alignment != 0 && self.late_rodata_alignment != value {
                return Err(self.fail(
                    ".late_rodata_alignment conflicts with an earlier .double-inferred alignment",
                    Some(&real_line),
                ));
            }
            self.late_rodata_alignment = value;
            changed_section = true;
        } else if line.starts_with(".incbin") {
            let size: isize = line
                .rsplit(',')
                .next()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| self.fail("invalid .incbin size (must be a literal)", Some(&real_line)))?;
            self.add_sized(size, &real_line)?;
        } else if line.starts_with(".word") || line.starts_with(".gpword") || line.starts_with(".float") {
            self.align4();
            let count = line.split(',').count() as isize;
            self.add_sized(4 * count, &real_line)?;
        } else if line.starts_with(".double") {
            self.align4();
            if self.cur_section == ".late_rodata" {
                let align8 = self.fn_section_sizes[&self.cur_section] % 8;
                let needed = 8 - align8;
                if self.late_rodata_alignment == 0 {
                    self.late_rodata_alignment = needed;
                    self.late_rodata_alignment_from_content = true;
                } else if self.late_rodata_alignment != needed {
                    if self.late_rodata_alignment_from_content {
                        return Err(self.fail(
                            "two .double directives imply different start alignments mod 8",
                            Some(&real_line),
                        ));
                    }
                    return Err(self.fail(
                        ".double is not 0 mod 8 under the assumed .late_rodata_alignment",
                        Some(&real_line),
                    ));
                }
            }
            let count = line.split(',').count() as isize;
            self.add_sized(8 * count, &real_line)?;
            emitting_double = true;
        } else if line.starts_with(".space") {
            let size: isize = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.fail("invalid .space size", Some(&real_line)))?;
            self.add_sized(size, &real_line)?;
        } else if line.starts_with(".balign") {
            let align: usize = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.fail("invalid .balign value", Some(&real_line)))?;
            if align != 4 {
                return Err(self.fail("only .balign 4 is supported", Some(&real_line)));
            }
            self.align4();
        } else if line.starts_with(".align") {
            let align: usize = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| self.fail("invalid .align value", Some(&real_line)))?;
            if align != 2 {
                return Err(self.fail("only .align 2 is supported", Some(&real_line)));
            }
            self.align4();
        } else if line.starts_with(".asci") {
            let z = line.starts_with(".asciz") || line.starts_with(".asciiz");
            let size = self.count_quoted_size(&line, z, &real_line, output_enc)?;
            self.add_sized(size as isize, &real_line)?;
        } else if line.starts_with(".byte") {
            self.add_sized(line.split(',').count() as isize, &real_line)?;
        } else if line.starts_with(".half") || line.starts_with(".hword") || line.starts_with(".short") {
            self.align2();
            self.add_sized(2 * line.split(',').count() as isize, &real_line)?;
        } else if line.starts_with(".size") {
            // ignored
        } else if line.starts_with('.') {
            return Err(self.fail("assembler directive not supported", Some(&real_line)));
        } else {
            if self.cur_section != ".text" {
                return Err(self.fail("instruction outside .text is not supported", Some(&real_line)));
            }
            self.add_sized(4, &real_line)?;
        }

        if self.cur_section == ".late_rodata" && !changed_section {
            if emitting_double {
                self.late_rodata_asm_conts.push(".align 0".to_string());
            }
            self.late_rodata_asm_conts.push(real_line.clone());
            if emitting_double {
                self.late_rodata_asm_conts.push(".align 2".to_string());
            }
        } else if !changed_section && !real_line.trim().is_empty() {
            self.asm_conts.push(real_line);
        }

        Ok(())
    }

    /// Generates the placeholder stub (§4.C "Finish") and the [`Function`] the fixup pass will
    /// splice assembled bytes into. `num_lines` is the number of physical lines fed through
    /// [`AsmBlock::process_line`]; the returned `src` has `num_lines + 1` entries — one per fed
    /// line, plus a trailing slot for the closing brace/`end;` and any `.rodata`/`.data`/`.bss`
    /// declarations, which have no natural "last instruction" line to attach to.
    pub fn finish(mut self, state: &mut GlobalState) -> Result<(Vec<String>, Function)> {
        let num_lines = self.num_lines;
        let mut src = vec![String::new(); num_lines + 1];

        let text_size = self.fn_section_sizes[".text"];
        let has_text_fn = text_size > 0 || !self.late_rodata_asm_conts.is_empty();

        if has_text_fn && self.text_glabels.is_empty() {
            return Err(self.fail("no function labels found for this asm block", None));
        }

        // Build the late-rodata payload first: the text-generation pass below consumes it
        // line-by-line as it walks the function's instructions.
        let mut late_rodata_dummy_bytes = Vec::new();
        let mut jtbl_rodata_size = 0usize;
        let mut late_rodata_fn_output: VecDeque<String> = VecDeque::new();

        if self.fn_section_sizes[".late_rodata"] > 0 {
            let size = self.fn_section_sizes[".late_rodata"] / 4;
            let instr_count = text_size / 4;
            let mut skip_next = false;
            let mut needs_double = self.late_rodata_alignment != 0;
            let mut extra_mips1_nop = false;

            let (jtbl_size, jtbl_min_rodata_size) = if state.pascal {
                (if state.mips1 { 9 } else { 8 }, 2)
            } else {
                (if state.mips1 { 11 } else { 9 }, 5)
            };

            let mut i = 0usize;
            while i < size {
                if skip_next {
                    skip_next = false;
                    i += 1;
                    continue;
                }

                if !needs_double
                    && state.use_jtbl_for_rodata
                    && i >= 1
                    && size - i >= jtbl_min_rodata_size
                    && instr_count.saturating_sub(late_rodata_fn_output.len()) >= jtbl_size + 1
                {
                    let line = if state.pascal {
                        let cases = (0..size - i).map(|k| format!("{}: ;", k)).collect::<Vec<_>>().join(" ");
                        format!("case 0 of {} otherwise end;", cases)
                    } else {
                        let cases = (0..size - i).map(|k| format!("case {}:", k)).collect::<Vec<_>>().join(" ");
                        format!("switch (*(volatile int*)0) {{ {} ; }}", cases)
                    };
                    late_rodata_fn_output.push_back(line);
                    late_rodata_fn_output.extend(std::iter::repeat(String::new()).take(jtbl_size - 1));
                    jtbl_rodata_size = (size - i) * 4;
                    extra_mips1_nop = i != 2;
                    break;
                }

                let b0 = state.next_late_rodata_hex();
                late_rodata_dummy_bytes.push(b0);

                if self.late_rodata_alignment == 4 * ((i + 1) % 2 + 1) && i + 1 < size {
                    let b1 = state.next_late_rodata_hex();
                    late_rodata_dummy_bytes.push(b1);
                    let mut combined = [0u8; 8];
                    combined[..4].copy_from_slice(&b0);
                    combined[4..].copy_from_slice(&b1);
                    let fval = f64::from_be_bytes(combined);
                    let line = if state.pascal {
                        state.pascal_assignment("d", &format!("{:e}", fval))
                    } else {
                        format!("*(volatile double*)0 = {:e};", fval)
                    };
                    late_rodata_fn_output.push_back(line);
                    skip_next = true;
                    needs_double = false;
                    if state.mips1 {
                        late_rodata_fn_output.extend(std::iter::repeat(String::new()).take(2));
                    }
                    extra_mips1_nop = false;
                } else {
                    let fval = f32::from_be_bytes(b0);
                    let line = if state.pascal {
                        state.pascal_assignment("f", &format!("{:e}", fval))
                    } else {
                        format!("*(volatile float*)0 = {:e}f;", fval)
                    };
                    late_rodata_fn_output.push_back(line);
                    extra_mips1_nop = true;
                }
                late_rodata_fn_output.extend(std::iter::repeat(String::new()).take(2));
                i += 1;
            }

            if state.mips1 && extra_mips1_nop {
                late_rodata_fn_output.push_back(String::new());
            }
        }

        let mut text_segments_out: Vec<(String, usize)> = Vec::new();

        if has_text_fn {
            let instr_count = text_size / 4;
            if instr_count < state.min_instr_count {
                return Err(self.fail(
                    &format!("not enough instructions in .text (need at least {})", state.min_instr_count),
                    None,
                ));
            }

            let mut name = state.make_name("func");
            for line in state.func_prologue(&name) {
                push_line(&mut src[0], &line);
            }

            let mut total_emitted = 0usize;
            let mut total_skipped = 0usize;
            let mut fn_emitted = 0usize;
            let mut fn_skipped = 0usize;
            let mut text_segments: Vec<(String, usize)> = Vec::new();
            let mut seg_size = 0usize;

            const MAX_FN_SIZE: usize = 4000;

            for &(line_index, count) in &self.fn_ins_inds {
                for _ in 0..count {
                    let mid_empty_line = late_rodata_fn_output.front().is_some_and(|l| l.is_empty());
                    if fn_emitted > MAX_FN_SIZE
                        && instr_count - total_emitted >= state.min_instr_count
                        && !mid_empty_line
                    {
                        for line in state.func_epilogue() {
                            push_line(&mut src[line_index], &line);
                        }
                        text_segments.push((name.clone(), seg_size));
                        seg_size = 0;
                        name = state.make_name("large_func");
                        for line in state.func_prologue(&name) {
                            push_line(&mut src[line_index], &line);
                        }
                        fn_emitted = 0;
                        fn_skipped = 0;
                    }

                    // Every slot here, skipped or emitted, reserves one 4-byte instruction in
                    // the current placeholder function.
                    seg_size += 4;

                    let skip_budget =
                        state.skip_instr_count + if !late_rodata_fn_output.is_empty() { state.prelude_if_late_rodata } else { 0 };
                    if fn_skipped < skip_budget {
                        fn_skipped += 1;
                        total_skipped += 1;
                        continue;
                    }

                    total_emitted += 1;
                    fn_emitted += 1;
                    let statement = match late_rodata_fn_output.pop_front() {
                        Some(line) => line,
                        None => {
                            if state.pascal {
                                state.pascal_assignment("i", "0")
                            } else {
                                "*(volatile int*)0 = 0;".to_string()
                            }
                        }
                    };
                    push_line(&mut src[line_index], &statement);
                }
            }

            if !late_rodata_fn_output.is_empty() {
                let size = self.fn_section_sizes[".late_rodata"] / 4;
                let available = instr_count.saturating_sub(total_skipped);
                return Err(self.fail(
                    &format!("late rodata to text ratio is too high: {} / {} must be <= 1/3", size, available),
                    None,
                ));
            }

            for line in state.func_epilogue() {
                push_line(&mut src[num_lines], &line);
            }
            text_segments.push((name.clone(), seg_size));

            text_segments_out = text_segments;
        }

        let mut data = HashMap::new();

        if self.fn_section_sizes[".rodata"] > 0 {
            if state.pascal {
                return Err(self.fail(".rodata is not supported with Pascal", None));
            }
            let size = self.fn_section_sizes[".rodata"];
            let name = state.make_name("rodata");
            push_line(&mut src[num_lines], &format!(" const char {}[{}] = {{1}};", name, size));
            data.insert(".rodata".to_string(), (name, size));
        }

        if self.fn_section_sizes[".data"] > 0 {
            let size = self.fn_section_sizes[".data"];
            let name = state.make_name("data");
            let line = if state.pascal {
                format!(" var {}: packed array[1..{}] of char;", name, size)
            } else {
                format!(" char {}[{}] = {{1}};", name, size)
            };
            push_line(&mut src[num_lines], &line);
            data.insert(".data".to_string(), (name, size));
        }

        if self.fn_section_sizes[".bss"] > 0 {
            if state.pascal {
                return Err(self.fail(".bss is not supported with Pascal", None));
            }
            let size = self.fn_section_sizes[".bss"];
            let name = state.make_name("bss");
            push_line(&mut src[num_lines], &format!(" char {}[{}];", name, size));
            data.insert(".bss".to_string(), (name, size));
        }

        Ok((
            src,
            Function {
                text_glabels: self.text_glabels,
                asm_conts: self.asm_conts,
                late_rodata_dummy_bytes,
                jtbl_rodata_size,
                late_rodata_asm_conts: self.late_rodata_asm_conts,
                fn_desc: self.fn_desc,
                data,
                text_segments: text_segments_out,
            },
        ))
    }
}

fn push_line(slot: &mut String, line: &str) {
    if !slot.is_empty() {
        slot.push('\n');
    }
    slot.push_str(line);
}
