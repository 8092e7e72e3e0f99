//! The ELF surgeon (§4.E): splices an assembled object's section bytes, symbols, and
//! relocations back into the compiler's object in place of the placeholder storage the
//! pre-pass reserved.
//!
//! This is the single post-pass entry point. It owns the whole of §4.E steps 1-15: locating
//! placeholders, assembling the collected [`Function`]s via an external assembler, relocating
//! `.late_rodata` by content search, splicing section bytes, merging symbol tables, and
//! rewriting relocations, before writing the result back over the original object path.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::process::Command;

use scroll::Pwrite;

use crate::asm::Function;
use crate::elf::object::ObjFile;
use crate::elf::reloc::{Relocation, SIZEOF_REL, SIZEOF_RELA};
use crate::elf::section_header::{SHT_MIPS_REGINFO, SHT_REL, SHT_RELA};
use crate::elf::sym::{
    Symbol, SIZEOF_SYM, SHN_ABS, SHN_UNDEF, STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_OBJECT, STT_SECTION,
};
use crate::error::{Error, Result};
use crate::options::ConvertStatics;

const ENDIAN: scroll::Endian = scroll::BE;
const CORE_DATA_SECTIONS: [&str; 3] = [".rodata", ".data", ".bss"];

fn is_temp_name(name: &str) -> bool {
    name.starts_with("_asmpp_")
}

/// A placeholder span recorded during step 1, ready to splice in step 6.
#[derive(Debug, Clone)]
struct SectionCopy {
    pos: u32,
    count: u32,
    placeholder: String,
    fn_desc: String,
}

/// Runs the whole post-pass: assembles `functions` via `assembler`, then splices the result
/// into the object at `objfile_path` in place.
#[allow(clippy::too_many_arguments)]
pub fn fixup_objfile(
    objfile_path: &Path,
    functions: &[Function],
    asm_prelude: &[u8],
    assembler: &str,
    drop_mdebug_gptab: bool,
    convert_statics: ConvertStatics,
) -> Result<()> {
    let mut o = ObjFile::from_file(objfile_path)?;
    log::debug!("loaded {} ({} sections)", objfile_path.display(), o.sections.len());

    // Steps 1 + 2: locate placeholders and build the assembly source that will produce `A`.
    let (asm_source, to_copy, late_rodata_present) = build_assembly_source(&o, functions, asm_prelude)?;

    // Step 3: assemble.
    let workdir = tempfile::tempdir()?;
    let asm_path = workdir.path().join("asmproc.s");
    fs::write(&asm_path, asm_source.as_bytes())?;
    let obj_path = workdir.path().join("asmproc.o");
    run_assembler(assembler, &asm_path, &obj_path)?;
    let a = ObjFile::from_file(&obj_path)?;
    log::debug!("assembled {} functions into {}", functions.len(), obj_path.display());

    // Step 4: late-rodata relocation by content search.
    let (moved_late_rodata, jtbl_rodata_positions) = if late_rodata_present {
        locate_late_rodata(&o, &a, functions)?
    } else {
        (HashMap::new(), HashSet::new())
    };

    // Step 5: symbol relocation intent, across both objects.
    let mut relocated_symbols = collect_relocated_symbols(&o, false);
    relocated_symbols.extend(collect_relocated_symbols(&a, true));

    // Step 6: splice section bytes (+ the late-rodata word copy step 4 makes possible).
    let mut modified_positions = splice_sections(&mut o, &a, &to_copy, &moved_late_rodata)?;
    modified_positions.entry(".rodata").or_default().extend(jtbl_rodata_positions);

    // Step 7: merge .reginfo.
    merge_reginfo(&mut o, &a);

    // Step 8: optional drop.
    if drop_mdebug_gptab {
        o.drop_mdebug_gptab();
    }

    // Step 9: promote statics recovered from .mdebug.
    let objfile_name = objfile_path.file_name().and_then(|s| s.to_str()).unwrap_or("a.out").to_string();
    let mdebug_statics = if convert_statics != ConvertStatics::No {
        promote_mdebug_statics(&o, convert_statics, &objfile_name)?
    } else {
        Vec::new()
    };

    // Steps 10-12: merge, dedupe, and reorder the symbol tables.
    let all_text_glabels: HashSet<&str> = functions.iter().flat_map(|f| f.text_glabels.iter().map(|s| s.as_str())).collect();
    let merged = merge_symbol_tables(&o, &a, &mdebug_statics, &relocated_symbols, &all_text_glabels)?;

    // Step 13: rewrite relocations in O, remap and import A's.
    rewrite_relocations(&mut o, &a, &merged.o_final, &merged.a_final, &modified_positions, &moved_late_rodata)?;

    write_symtab(&mut o, merged.symbols, merged.num_locals, merged.strtab)?;
    for section in &mut o.sections {
        if section.sh_type == SHT_REL || section.sh_type == SHT_RELA {
            serialize_relocations(section)?;
        }
    }

    // Step 14 (`.mdebug` offset rewriting) happens inside `ObjFile::write` whenever the
    // section's file position moves during re-packing.
    // Step 15: write back. `ObjFile::write` only touches `objfile_path` once every prior step
    // has succeeded, so there is no partial write on any failure path above.
    o.write(objfile_path)?;
    log::debug!("wrote {} functions back to {}", functions.len(), objfile_path.display());
    Ok(())
}

fn run_assembler(assembler: &str, asm_path: &Path, obj_path: &Path) -> Result<()> {
    let mut parts = assembler.split_whitespace();
    let program = parts.next().ok_or_else(|| Error::Fixup("empty --assembler command".into()))?;
    let status = Command::new(program).args(parts).arg(asm_path).arg("-o").arg(obj_path).status()?;
    if !status.success() {
        return Err(Error::Subprocess { status: status.code().unwrap_or(-1) });
    }
    Ok(())
}

/// `(section, placeholder_name, size)` triples for one [`Function`], in the order its
/// placeholder declarations were emitted by [`crate::asm::AsmBlock::finish`].
fn ordered_placeholders(f: &Function) -> Vec<(&'static str, String, u32)> {
    let mut v = Vec::new();
    for (name, size) in &f.text_segments {
        v.push((".text", name.clone(), *size as u32));
    }
    for &sec in &CORE_DATA_SECTIONS {
        if let Some((name, size)) = f.data.get(sec) {
            v.push((sec, name.clone(), *size as u32));
        }
    }
    v
}

/// Steps 1 & 2. Returns the assembly source to feed the external assembler, the splice list
/// for step 6, and whether any `.late_rodata` content was collected.
fn build_assembly_source(
    o: &ObjFile,
    functions: &[Function],
    asm_prelude: &[u8],
) -> Result<(String, HashMap<&'static str, Vec<SectionCopy>>, bool)> {
    let mut asm_lines: Vec<String> = vec![String::from_utf8_lossy(asm_prelude).into_owned()];
    let mut to_copy: HashMap<&'static str, Vec<SectionCopy>> = HashMap::new();
    let mut prev_loc: HashMap<&'static str, u32> = CORE_DATA_SECTIONS.iter().map(|&s| (s, 0u32)).collect();
    prev_loc.insert(".text", 0);

    for function in functions {
        let placeholders = ordered_placeholders(function);

        for (sec, name, size) in &placeholders {
            let section = o
                .find_section(sec)
                .ok_or_else(|| Error::Fixup(format!("object has no {sec} section, but {} reserves one", function.fn_desc)))?;
            let loc = o.find_symbol_in_section(name, section).ok_or_else(|| {
                Error::Fixup(format!("placeholder {name:?} for {} not found in {sec} of the compiled object", function.fn_desc))
            })?;
            let prev = prev_loc[sec];
            if loc < prev {
                return Err(Error::Fixup(format!(
                    "placeholder {name:?} for {} is at {loc:#x} in {sec}, before the previous placeholder ending at {prev:#x}",
                    function.fn_desc
                )));
            }
            if loc > prev {
                asm_lines.push(format!(".section {sec}"));
                if *sec == ".text" {
                    for _ in 0..(loc - prev) / 4 {
                        asm_lines.push("nop".to_string());
                    }
                } else {
                    asm_lines.push(format!(".space {}", loc - prev));
                }
            }
            asm_lines.push(format!(".section {sec}"));
            asm_lines.push(format!("glabel {name}_asm_start"));
            to_copy.entry(sec).or_default().push(SectionCopy {
                pos: loc,
                count: *size,
                placeholder: name.clone(),
                fn_desc: function.fn_desc.clone(),
            });
            prev_loc.insert(sec, loc + size);
        }

        asm_lines.push(".text".to_string());
        asm_lines.extend(function.asm_conts.iter().cloned());

        for (sec, name, _size) in &placeholders {
            asm_lines.push(format!(".section {sec}"));
            asm_lines.push(format!("glabel {name}_asm_end"));
        }
    }

    let late_rodata_present = functions.iter().any(|f| !f.late_rodata_asm_conts.is_empty());
    if late_rodata_present {
        asm_lines.push(".section .late_rodata".to_string());
        asm_lines.push(".word 0, 0".to_string());
        asm_lines.push("glabel _asmpp_late_rodata_start".to_string());
        for function in functions {
            asm_lines.extend(function.late_rodata_asm_conts.iter().cloned());
        }
        asm_lines.push("glabel _asmpp_late_rodata_end".to_string());
    }

    Ok((asm_lines.join("\n") + "\n", to_copy, late_rodata_present))
}

/// Step 4: searches `O`'s real `.rodata` for the dummy sentinel words the pre-pass's stub
/// placed there, recovering where `A`'s real `.late_rodata` content must ultimately live. The
/// jump-table suffix (§3 "switch trick") isn't searchable, so its bytes are just skipped over
/// by length; those positions are recorded as jtbl-reserved so step 13 can drop whatever stale
/// relocations the compiler left pointing into them.
fn locate_late_rodata(o: &ObjFile, a: &ObjFile, functions: &[Function]) -> Result<(HashMap<u32, u32>, HashSet<u32>)> {
    let rodata = o.find_section(".rodata").ok_or_else(|| Error::Fixup("object has .late_rodata content but no .rodata".into()))?;
    let late_rodata_start = a
        .find_symbol("_asmpp_late_rodata_start")
        .ok_or_else(|| Error::Fixup("assembled object is missing _asmpp_late_rodata_start".into()))?
        .st_value;

    let mut moved = HashMap::new();
    let mut jtbl_positions = HashSet::new();
    let mut a_pos = late_rodata_start;
    let mut rodata_cursor = 0u32;

    for function in functions {
        for (index, dummy) in function.late_rodata_dummy_bytes.iter().enumerate() {
            let found = find_bytes_in_section(&rodata.data, dummy, rodata_cursor as usize)
                .ok_or_else(|| Error::Fixup(format!("could not locate late-rodata sentinel for {}", function.fn_desc)))?
                as u32;

            if index == 0
                && function.late_rodata_dummy_bytes.len() > 1
                && rodata.data.get(found as usize + 4..found as usize + 8) == Some(&[0, 0, 0, 0][..])
            {
                a_pos += 4;
                continue;
            }

            moved.insert(a_pos, found);
            rodata_cursor = found + 4;
            a_pos += 4;
        }

        if function.jtbl_rodata_size > 0 {
            let jtbl_end = rodata_cursor + function.jtbl_rodata_size as u32;
            let mut pos = rodata_cursor;
            while pos < jtbl_end {
                jtbl_positions.insert(pos);
                pos += 4;
            }
            rodata_cursor = jtbl_end;
        }
    }

    Ok((moved, jtbl_positions))
}

fn find_bytes_in_section(haystack: &[u8], needle: &[u8; 4], start: usize) -> Option<usize> {
    if start > haystack.len() {
        return None;
    }
    haystack[start..].windows(4).position(|w| w == needle).map(|p| p + start)
}

/// Step 5: every symbol referenced by a relocation in the four core sections of `obj` (plus
/// `.late_rodata`, present only in the assembled object).
fn collect_relocated_symbols(obj: &ObjFile, include_late_rodata: bool) -> HashSet<String> {
    let mut sections: Vec<&str> = vec![".text", ".data", ".rodata", ".bss"];
    if include_late_rodata {
        sections.push(".late_rodata");
    }
    let mut out = HashSet::new();
    let Some(symtab) = obj.symtab() else { return out };
    for name in sections {
        let Some(section) = obj.find_section(name) else { continue };
        for &reltab_idx in &section.relocated_by {
            for reloc in &obj.sections[reltab_idx].relocations {
                if let Some(sym) = symtab.symbols.get(reloc.sym_index as usize) {
                    if !sym.name.is_empty() {
                        out.insert(sym.name.clone());
                    }
                }
            }
        }
    }
    out
}

/// Step 6 (plus the late-rodata word copy step 4 makes possible). Returns, per spliced
/// section, the set of word offsets that now hold content from the assembled object — used by
/// step 13 to drop whichever of `O`'s own relocations used to cover them.
fn splice_sections(
    o: &mut ObjFile,
    a: &ObjFile,
    to_copy: &HashMap<&'static str, Vec<SectionCopy>>,
    moved_late_rodata: &HashMap<u32, u32>,
) -> Result<HashMap<&'static str, HashSet<u32>>> {
    let mut modified: HashMap<&'static str, HashSet<u32>> = HashMap::new();

    for &sec in &[".data", ".text", ".rodata"] {
        let Some(copies) = to_copy.get(sec) else { continue };
        let a_section = a.find_section(sec).ok_or_else(|| Error::Fixup(format!("assembled object has no {sec}")))?;
        for copy in copies {
            let start = a.find_symbol_in_section(&format!("{}_asm_start", copy.placeholder), a_section);
            let end = a.find_symbol_in_section(&format!("{}_asm_end", copy.placeholder), a_section);
            let (start, end) = match (start, end) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(Error::Fixup(format!(
                        "assembled object is missing {}_asm_start/_asm_end for {}",
                        copy.placeholder, copy.fn_desc
                    )))
                }
            };
            if end < start || (end - start) != copy.count {
                return Err(Error::Fixup(format!(
                    "incorrectly sized definition for {} in {sec}: expected {} bytes, assembled {} bytes",
                    copy.fn_desc,
                    copy.count,
                    end.saturating_sub(start)
                )));
            }

            let src = a_section.data[start as usize..end as usize].to_vec();
            let o_section = o.find_section_mut(sec).ok_or_else(|| Error::Fixup(format!("object lost its {sec} section")))?;
            let dst_start = copy.pos as usize;
            let dst_end = dst_start + copy.count as usize;
            if dst_end > o_section.data.len() {
                return Err(Error::Fixup(format!("{sec} placeholder for {} runs past the end of the section", copy.fn_desc)));
            }
            o_section.data[dst_start..dst_end].copy_from_slice(&src);

            let entry = modified.entry(sec).or_default();
            for word in (copy.pos..copy.pos + copy.count).step_by(4) {
                entry.insert(word);
            }
        }
    }

    if !moved_late_rodata.is_empty() {
        if let Some(a_late_rodata) = a.find_section(".late_rodata") {
            let a_data = a_late_rodata.data.clone();
            if let Some(o_rodata) = o.find_section_mut(".rodata") {
                let entry = modified.entry(".rodata").or_default();
                for (&a_pos, &o_pos) in moved_late_rodata {
                    let (a_pos, o_pos) = (a_pos as usize, o_pos as usize);
                    if a_pos + 4 <= a_data.len() && o_pos + 4 <= o_rodata.data.len() {
                        o_rodata.data[o_pos..o_pos + 4].copy_from_slice(&a_data[a_pos..a_pos + 4]);
                        entry.insert(o_pos as u32);
                    }
                }
            }
        }
    }

    Ok(modified)
}

/// Step 7: OR the first 20 bytes of `.reginfo` byte-for-byte, if both objects have one.
fn merge_reginfo(o: &mut ObjFile, a: &ObjFile) {
    let a_data = match a.find_section(".reginfo") {
        Some(s) if s.sh_type == SHT_MIPS_REGINFO => s.data.clone(),
        _ => return,
    };
    if let Some(o_section) = o.find_section_mut(".reginfo") {
        let n = o_section.data.len().min(a_data.len()).min(20);
        for i in 0..n {
            o_section.data[i] |= a_data[i];
        }
    }
}

const MIPS_DEBUG_MAGIC: u16 = 0x7009;

// MIPS symbolic-debug (`st`) symbol type codes relevant to static-symbol promotion.
const ST_PROC: u32 = 6;
const ST_BLOCK: u32 = 7;
const ST_END: u32 = 8;
const ST_FILE: u32 = 11;
const ST_STATIC_PROC: u32 = 14;
const ST_STATIC: u32 = 2;
const ST_STRUCT: u32 = 26;
const ST_UNION: u32 = 27;
const ST_ENUM: u32 = 28;

// MIPS symbolic-debug storage classes this crate promotes (.text/.data/.bss/.rodata).
const SC_TEXT: u32 = 1;
const SC_DATA: u32 = 2;
const SC_BSS: u32 = 3;
const SC_RDATA: u32 = 15;

fn be_u32(raw: &[u8], offset: usize) -> Option<u32> {
    raw.get(offset..offset + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn c_str_at(raw: &[u8], offset: usize) -> String {
    let end = raw.get(offset..).and_then(|s| s.iter().position(|&b| b == 0)).map(|p| offset + p).unwrap_or(raw.len());
    raw[offset..end].iter().map(|&b| b as char).collect()
}

/// Step 9: recovers local static symbols from `.mdebug`'s HDRR-formatted symbolic header and
/// synthesizes ELF symbols for them. Every sub-table offset in `.mdebug` is an *absolute file
/// offset*, so this reads against `o.raw` (the file as it was opened), not against the section's
/// own (possibly already-modified) data blob.
fn promote_mdebug_statics(o: &ObjFile, mode: ConvertStatics, objfile_name: &str) -> Result<Vec<Symbol>> {
    let Some(mdebug) = o.find_section(".mdebug") else { return Ok(Vec::new()) };
    let raw = &o.raw;
    let base = mdebug.sh_offset as usize;

    let magic = raw.get(base..base + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    if magic != Some(MIPS_DEBUG_MAGIC) {
        return Err(Error::Fixup("`.mdebug` does not start with the expected HDRR magic 0x7009".into()));
    }

    let ifd_max = be_u32(raw, base + 18 * 4).ok_or_else(|| Error::Fixup("truncated .mdebug header".into()))?;
    let cb_fd_offset = be_u32(raw, base + 19 * 4).unwrap_or(0) as usize;
    let cb_sym_offset = be_u32(raw, base + 9 * 4).unwrap_or(0) as usize;
    let cb_ss_offset = be_u32(raw, base + 15 * 4).unwrap_or(0) as usize;

    let section_index = |sc: u32| -> Option<u16> {
        let name = match sc {
            SC_TEXT => ".text",
            SC_DATA => ".data",
            SC_BSS => ".bss",
            SC_RDATA => ".rodata",
            _ => return None,
        };
        o.find_section(name).map(|s| s.index as u16)
    };

    let mut out = Vec::new();
    let mut dup_counts: HashMap<String, u32> = HashMap::new();

    for fd_index in 0..ifd_max {
        let fd_off = cb_fd_offset + 18 * 4 * fd_index as usize;
        let iss_base = be_u32(raw, fd_off + 2 * 4).ok_or_else(|| Error::Fixup("truncated .mdebug file descriptor".into()))?;
        let isym_base = be_u32(raw, fd_off + 4 * 4).unwrap_or(0);
        let csym = be_u32(raw, fd_off + 5 * 4).unwrap_or(0);

        let mut scope_level: i32 = 0;
        for sym_index in 0..csym {
            let sym_off = cb_sym_offset + 12 * (isym_base + sym_index) as usize;
            let iss = be_u32(raw, sym_off).unwrap_or(0);
            let value = be_u32(raw, sym_off + 4).unwrap_or(0);
            let packed = be_u32(raw, sym_off + 8).unwrap_or(0);
            let st = packed >> 26;
            let sc = (packed >> 21) & 0x1f;

            match st {
                ST_FILE | ST_STRUCT | ST_UNION | ST_ENUM | ST_BLOCK | ST_PROC | ST_STATIC_PROC => scope_level += 1,
                ST_END => scope_level -= 1,
                _ => {}
            }

            if !(st == ST_STATIC || st == ST_STATIC_PROC) {
                continue;
            }
            let Some(shndx) = section_index(sc) else { continue };

            let base_name = c_str_at(raw, cb_ss_offset + (iss_base + iss) as usize);
            let mut name = base_name.clone();
            if scope_level > 1 {
                let count = dup_counts.entry(base_name).or_insert(0);
                *count += 1;
                name = format!("{name}:{count}");
            }
            if mode == ConvertStatics::GlobalWithFilename {
                name = format!("{objfile_name}:{name}");
            }

            let bind = if matches!(mode, ConvertStatics::Global | ConvertStatics::GlobalWithFilename) { STB_GLOBAL } else { STB_LOCAL };
            let typ = if st == ST_STATIC_PROC { STT_FUNC } else { STT_OBJECT };

            out.push(Symbol {
                st_name: 0,
                st_value: value,
                st_size: 0,
                st_info: (bind << 4) | typ,
                st_other: 0,
                st_shndx: shndx,
                name,
            });
        }

        if scope_level != 0 {
            return Err(Error::Fixup(format!("`.mdebug` file descriptor {fd_index} has unbalanced scope nesting")));
        }
    }

    Ok(out)
}

struct MergedSymbols {
    symbols: Vec<Symbol>,
    strtab: Vec<u8>,
    num_locals: usize,
    /// `O`'s original symbol table index -> final physical index in `symbols`.
    o_final: Vec<usize>,
    /// `A`'s original symbol table index -> final physical index in `symbols`.
    a_final: Vec<usize>,
}

/// Steps 10-12: merges `O`'s and `A`'s symbol tables (plus any statics promoted in step 9),
/// drops temp-named placeholders, deduplicates by name, and reorders locals-then-globals with
/// `_gp_disp` last among locals. `O`'s `STT_SECTION` symbols stand in directly for `A`'s section
/// symbols of the same target, since those aren't covered by the "global or relocated" import
/// criterion but `A`'s section-relative relocations still need to resolve to something.
fn merge_symbol_tables(
    o: &ObjFile,
    a: &ObjFile,
    mdebug_statics: &[Symbol],
    relocated_symbols: &HashSet<String>,
    all_text_glabels: &HashSet<&str>,
) -> Result<MergedSymbols> {
    let o_symtab = o.symtab().ok_or_else(|| Error::Fixup("object has no symbol table".into()))?;
    let a_symtab = a.symtab().ok_or_else(|| Error::Fixup("assembled object has no symbol table".into()))?;

    let o_strtab_idx = o_symtab.sh_link as usize;
    let o_strtab_data = o.sections.get(o_strtab_idx).map(|s| s.data.clone()).unwrap_or_else(|| vec![0]);
    let a_strtab_idx = a_symtab.sh_link as usize;
    let a_strtab_data = a.sections.get(a_strtab_idx).map(|s| s.data.clone()).unwrap_or_default();

    // strtab layout: O's existing bytes, then fresh names for step-9 statics, then A's strtab
    // verbatim (so A's untouched st_name offsets only need a flat `+ strtab_adj`).
    let mut strtab = o_strtab_data;
    let mut mdebug_symbols = Vec::with_capacity(mdebug_statics.len());
    for sym in mdebug_statics {
        let offset = strtab.len() as u32;
        strtab.extend(sym.name.bytes());
        strtab.push(0);
        let mut sym = sym.clone();
        sym.st_name = offset;
        mdebug_symbols.push(sym);
    }
    let strtab_adj = strtab.len() as u32;
    strtab.extend_from_slice(&a_strtab_data);

    // Pass 1: build the candidate list (O's kept symbols, then step-9 statics, then A's
    // imports), tracking where each original index landed.
    let mut candidates: Vec<Symbol> = vec![Symbol::default()];
    let mut o_cand: Vec<Option<usize>> = vec![None; o_symtab.symbols.len()];
    let mut section_symbol_of: HashMap<u16, usize> = HashMap::new();

    for (i, sym) in o_symtab.symbols.iter().enumerate().skip(1) {
        if is_temp_name(&sym.name) {
            continue;
        }
        o_cand[i] = Some(candidates.len());
        if sym.typ() == STT_SECTION {
            section_symbol_of.entry(sym.st_shndx).or_insert(candidates.len());
        }
        candidates.push(sym.clone());
    }
    for sym in mdebug_symbols {
        candidates.push(sym);
    }

    let mut a_cand: Vec<Option<usize>> = vec![None; a_symtab.symbols.len()];
    for (i, sym) in a_symtab.symbols.iter().enumerate().skip(1) {
        if is_temp_name(&sym.name) {
            continue;
        }
        if sym.typ() == STT_SECTION {
            let a_section_name = a.sections.get(sym.st_shndx as usize).map(|s| s.name.as_str()).unwrap_or("");
            let o_section_name = if a_section_name == ".late_rodata" { ".rodata" } else { a_section_name };
            if let Some(o_section) = o.find_section(o_section_name) {
                a_cand[i] = section_symbol_of.get(&(o_section.index as u16)).copied();
            }
            continue;
        }

        let should_import = sym.bind() != STB_LOCAL || relocated_symbols.contains(&sym.name);
        if !should_import {
            continue;
        }

        let mut imported = sym.clone();
        imported.st_name = sym.st_name + strtab_adj;
        if sym.st_shndx != SHN_UNDEF && sym.st_shndx != SHN_ABS {
            let a_section_name = a.sections.get(sym.st_shndx as usize).map(|s| s.name.as_str()).unwrap_or("");
            let o_section_name = if a_section_name == ".late_rodata" { ".rodata" } else { a_section_name };
            let o_section = o
                .find_section(o_section_name)
                .ok_or_else(|| Error::Fixup(format!("assembled symbol {:?} targets {o_section_name}, absent from the object", sym.name)))?;
            imported.st_shndx = o_section.index as u16;
        }
        if all_text_glabels.contains(sym.name.as_str()) {
            imported.set_type(STT_FUNC);
        }

        a_cand[i] = Some(candidates.len());
        candidates.push(imported);
    }

    // Pass 2: dedupe by name. Conflicting *defined* entries of the same name are an error;
    // an otherwise-undefined entry just resolves to whatever the name already denotes.
    let mut name_to_dedup: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Symbol> = vec![Symbol::default()];
    let mut cand_to_dedup: Vec<usize> = vec![0; candidates.len()];

    for (idx, sym) in candidates.iter().enumerate().skip(1) {
        if sym.name.is_empty() {
            cand_to_dedup[idx] = deduped.len();
            deduped.push(sym.clone());
            continue;
        }
        match name_to_dedup.get(&sym.name) {
            None => {
                name_to_dedup.insert(sym.name.clone(), deduped.len());
                cand_to_dedup[idx] = deduped.len();
                deduped.push(sym.clone());
            }
            Some(&pos) => {
                let existing_defined = deduped[pos].st_shndx != SHN_UNDEF;
                let new_defined = sym.st_shndx != SHN_UNDEF;
                if existing_defined && new_defined {
                    if deduped[pos].st_shndx != sym.st_shndx || deduped[pos].st_value != sym.st_value {
                        return Err(Error::Fixup(format!("symbol \"{}\" defined twice with differing value", sym.name)));
                    }
                } else if new_defined && !existing_defined {
                    let name = deduped[pos].name.clone();
                    deduped[pos] = sym.clone();
                    deduped[pos].name = name;
                }
                cand_to_dedup[idx] = pos;
            }
        }
    }

    // Pass 3: reorder locals (with `_gp_disp` last among them) before globals.
    let mut locals: Vec<(usize, Symbol)> = Vec::new();
    let mut globals: Vec<(usize, Symbol)> = Vec::new();
    let mut gp_disp: Option<(usize, Symbol)> = None;
    for (dedup_idx, sym) in deduped.into_iter().enumerate().skip(1) {
        if sym.bind() == STB_LOCAL {
            if sym.name == "_gp_disp" {
                gp_disp = Some((dedup_idx, sym));
            } else {
                locals.push((dedup_idx, sym));
            }
        } else {
            globals.push((dedup_idx, sym));
        }
    }
    let num_locals = 1 + locals.len() + gp_disp.is_some() as usize;

    let mut symbols = vec![Symbol::default()];
    let mut dedup_to_final: HashMap<usize, usize> = HashMap::new();
    for (dedup_idx, sym) in locals.into_iter().chain(gp_disp).chain(globals) {
        dedup_to_final.insert(dedup_idx, symbols.len());
        symbols.push(sym);
    }

    let resolve = |cand: &[Option<usize>]| -> Vec<usize> {
        cand.iter().map(|c| c.map(|i| dedup_to_final[&cand_to_dedup[i]]).unwrap_or(0)).collect()
    };
    let o_final = resolve(&o_cand);
    let a_final = resolve(&a_cand);

    Ok(MergedSymbols { symbols, strtab, num_locals, o_final, a_final })
}

/// Step 13: drops `O`'s relocations that used to cover positions overwritten in step 6,
/// remaps the survivors' symbol indices, and imports `A`'s relocations on the spliced sections
/// (translating `.late_rodata`-relative offsets via `moved_late_rodata`).
fn rewrite_relocations(
    o: &mut ObjFile,
    a: &ObjFile,
    o_final: &[usize],
    a_final: &[usize],
    modified_positions: &HashMap<&'static str, HashSet<u32>>,
    moved_late_rodata: &HashMap<u32, u32>,
) -> Result<()> {
    let rel_rela_indices: Vec<usize> =
        o.sections.iter().enumerate().filter(|(_, s)| s.sh_type == SHT_REL || s.sh_type == SHT_RELA).map(|(i, _)| i).collect();

    for idx in rel_rela_indices {
        let target = o.sections[idx].sh_info as usize;
        let target_name = o.sections.get(target).map(|s| s.name.clone()).unwrap_or_default();
        let stale = modified_positions.get(target_name.as_str());
        let kept: Vec<Relocation> = o.sections[idx]
            .relocations
            .iter()
            .filter(|r| stale.map_or(true, |s| !s.contains(&r.r_offset)))
            .map(|r| Relocation { sym_index: o_final[r.sym_index as usize] as u32, ..*r })
            .collect();
        o.sections[idx].relocations = kept;
    }

    for &(a_sec_name, o_sec_name) in &[(".text", ".text"), (".data", ".data"), (".rodata", ".rodata"), (".late_rodata", ".rodata")] {
        let Some(a_section) = a.find_section(a_sec_name) else { continue };
        let Some(target_idx) = o.find_section(o_sec_name).map(|s| s.index) else { continue };

        for &reltab_idx in &a_section.relocated_by {
            let is_rela = a.sections[reltab_idx].sh_type == SHT_RELA;
            for reloc in a.sections[reltab_idx].relocations.clone() {
                let new_offset = if a_sec_name == ".late_rodata" {
                    match moved_late_rodata.get(&reloc.r_offset) {
                        Some(&p) => p,
                        None => {
                            log::warn!("dropping unresolved .late_rodata relocation at {:#x}", reloc.r_offset);
                            continue;
                        }
                    }
                } else {
                    reloc.r_offset
                };
                let new_sym = a_final[reloc.sym_index as usize] as u32;
                let new_reloc = Relocation { r_offset: new_offset, sym_index: new_sym, r_type: reloc.r_type, r_addend: reloc.r_addend };
                let table_idx = relocation_table_for(o, target_idx, is_rela);
                push_relocation(o, table_idx, new_reloc);
            }
        }
    }

    Ok(())
}

fn relocation_table_for(o: &mut ObjFile, target: usize, prefer_rela: bool) -> usize {
    if let Some(idx) = o.sections.iter().position(|s| (s.sh_type == SHT_REL || s.sh_type == SHT_RELA) && s.sh_info as usize == target) {
        return idx;
    }
    let symtab_idx = o.symtab().map(|s| s.index).unwrap_or(0);
    let sh_type = if prefer_rela { SHT_RELA } else { SHT_REL };
    let entsize = if prefer_rela { SIZEOF_RELA } else { SIZEOF_REL } as u32;
    let prefix = if prefer_rela { ".rela" } else { ".rel" };
    let name = format!("{prefix}{}", o.sections[target].name);
    o.add_section(&name, sh_type, 0, symtab_idx as u32, target as u32, 4, entsize, Vec::new())
}

fn push_relocation(o: &mut ObjFile, table_idx: usize, mut reloc: Relocation) {
    let is_rela = o.sections[table_idx].sh_type == SHT_RELA;
    if is_rela {
        reloc.r_addend = Some(reloc.r_addend.unwrap_or(0));
    } else {
        reloc.r_addend = None;
    }
    o.sections[table_idx].relocations.push(reloc);
}

fn serialize_relocations(section: &mut crate::elf::Section) -> Result<()> {
    let is_rela = section.sh_type == SHT_RELA;
    let entsize = if is_rela { SIZEOF_RELA } else { SIZEOF_REL };
    let mut data = vec![0u8; section.relocations.len() * entsize];
    for (i, reloc) in section.relocations.iter().enumerate() {
        if is_rela {
            data.pwrite_with(reloc.to_rela(), i * entsize, ENDIAN).map_err(|e| Error::Elf(e.into()))?;
        } else {
            data.pwrite_with(reloc.to_rel(), i * entsize, ENDIAN).map_err(|e| Error::Elf(e.into()))?;
        }
    }
    section.data = data;
    Ok(())
}

/// Replaces `O`'s symbol table and string table contents with the merged result.
fn write_symtab(o: &mut ObjFile, symbols: Vec<Symbol>, num_locals: usize, strtab: Vec<u8>) -> Result<()> {
    let symtab_idx = o.symtab().ok_or_else(|| Error::Fixup("object lost its symbol table".into()))?.index;
    let strtab_idx = o.sections[symtab_idx].sh_link as usize;

    let mut data = vec![0u8; symbols.len() * SIZEOF_SYM];
    for (i, sym) in symbols.iter().enumerate() {
        data.pwrite_with(sym.to_raw(), i * SIZEOF_SYM, ENDIAN).map_err(|e| Error::Elf(e.into()))?;
    }

    o.sections[symtab_idx].data = data;
    o.sections[symtab_idx].symbols = symbols;
    o.sections[symtab_idx].sh_info = num_locals as u32;
    o.sections[strtab_idx].data = strtab;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_name_detection() {
        assert!(is_temp_name("_asmpp_func1"));
        assert!(!is_temp_name("my_function"));
    }

    #[test]
    fn find_bytes_respects_start_offset() {
        let haystack = [0u8, 0, 0, 0, 1, 2, 3, 4, 1, 2, 3, 4];
        let needle = [1u8, 2, 3, 4];
        assert_eq!(find_bytes_in_section(&haystack, &needle, 0), Some(4));
        assert_eq!(find_bytes_in_section(&haystack, &needle, 5), Some(8));
        assert_eq!(find_bytes_in_section(&haystack, &needle, 9), None);
    }

    #[test]
    fn c_str_at_stops_on_nul() {
        let raw = b"\x00foo\x00bar\x00";
        assert_eq!(c_str_at(raw, 1), "foo");
        assert_eq!(c_str_at(raw, 5), "bar");
    }

    #[test]
    fn merge_symbol_tables_rejects_conflicting_definitions() {
        use crate::elf::header::{Header, EM_MIPS, ET_REL, SIZEOF_EHDR};
        use crate::elf::section_header::{Section, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB};

        fn obj_with_symbol(name: &str, shndx: u16, value: u32) -> ObjFile {
            let header = Header {
                e_ident: {
                    let mut id = [0u8; 16];
                    id[0..4].copy_from_slice(b"\x7fELF");
                    id[4] = 1;
                    id[5] = 2;
                    id
                },
                e_type: ET_REL,
                e_machine: EM_MIPS,
                e_version: 1,
                e_entry: 0,
                e_phoff: 0,
                e_shoff: 0,
                e_flags: 0,
                e_ehsize: SIZEOF_EHDR as u16,
                e_phentsize: 0,
                e_phnum: 0,
                e_shentsize: 0,
                e_shnum: 0,
                e_shstrndx: 0,
            };
            let null = Section::default();
            let text = Section { name: ".text".into(), sh_type: SHT_PROGBITS, index: 1, data: vec![0; 4], ..Default::default() };
            let mut symtab = Section { name: ".symtab".into(), sh_type: SHT_SYMTAB, index: 2, sh_link: 3, ..Default::default() };
            let strtab = Section { name: ".strtab".into(), sh_type: SHT_STRTAB, index: 3, data: vec![0], ..Default::default() };
            symtab.symbols.push(Symbol::default());
            symtab.symbols.push(Symbol {
                st_name: 0,
                st_value: value,
                st_size: 0,
                st_info: (STB_GLOBAL << 4) | STT_OBJECT,
                st_other: 0,
                st_shndx: shndx,
                name: name.to_string(),
            });
            ObjFile { header, sections: vec![null, text, symtab, strtab], raw: Vec::new() }
        }

        let o = obj_with_symbol("conflict", 1, 0);
        let a = obj_with_symbol("conflict", 1, 4);
        let relocated = HashSet::new();
        let glabels = HashSet::new();
        let err = merge_symbol_tables(&o, &a, &[], &relocated, &glabels).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }
}
