//! Shared fixture builder for integration tests: hand-assembles a minimal MIPS `ET_REL` object
//! with one `.text` section and a caller-supplied symbol list, the same byte-level construction
//! `src/elf/object.rs`'s own unit tests use for `build_minimal_elf`.

use asm_processor::elf::header::{Header, ELFCLASS32, ELFDATA2MSB, ELFMAG, EM_MIPS, ET_REL, SIZEOF_EHDR};
use asm_processor::elf::section_header::{SectionHeader, SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB, SIZEOF_SHDR};
use asm_processor::elf::sym::{SymRaw, SIZEOF_SYM};
use scroll::Pwrite;

const ENDIAN: scroll::Endian = scroll::BE;

/// `(name, value, size, bind, type)`, all defined in the single `.text` section.
pub struct SymSpec {
    pub name: &'static str,
    pub value: u32,
    pub size: u32,
    pub bind: u8,
    pub typ: u8,
}

pub fn sym(name: &'static str, value: u32, size: u32, bind: u8, typ: u8) -> SymSpec {
    SymSpec { name, value, size, bind, typ }
}

/// Sections: `[0]=NULL, [1]=.shstrtab, [2]=.text, [3]=.symtab, [4]=.strtab`.
pub fn build_text_object(text_data: &[u8], symbols: &[SymSpec]) -> Vec<u8> {
    let mut shstrtab = vec![0u8];
    let shstrtab_name_off = shstrtab.len() as u32;
    shstrtab.extend(b".shstrtab\0");
    let text_name_off = shstrtab.len() as u32;
    shstrtab.extend(b".text\0");
    let symtab_name_off = shstrtab.len() as u32;
    shstrtab.extend(b".symtab\0");
    let strtab_name_off = shstrtab.len() as u32;
    shstrtab.extend(b".strtab\0");

    let mut strtab = vec![0u8];
    let mut sym_name_offs = Vec::with_capacity(symbols.len());
    for s in symbols {
        sym_name_offs.push(strtab.len() as u32);
        strtab.extend(s.name.as_bytes());
        strtab.push(0);
    }

    let mut symtab_data = vec![0u8; SIZEOF_SYM];
    for (i, s) in symbols.iter().enumerate() {
        let raw = SymRaw {
            st_name: sym_name_offs[i],
            st_value: s.value,
            st_size: s.size,
            st_info: (s.bind << 4) | s.typ,
            st_other: 0,
            st_shndx: 2,
        };
        let mut buf = [0u8; SIZEOF_SYM];
        buf.pwrite_with(raw, 0, ENDIAN).unwrap();
        symtab_data.extend_from_slice(&buf);
    }

    let mut offset = SIZEOF_EHDR as u32;
    let shstrtab_off = offset;
    offset += shstrtab.len() as u32;
    let text_off = offset;
    offset += text_data.len() as u32;
    let symtab_off = offset;
    offset += symtab_data.len() as u32;
    let strtab_off = offset;
    offset += strtab.len() as u32;
    let shoff = offset.div_ceil(4) * 4;

    let headers = [
        SectionHeader::default(),
        SectionHeader {
            sh_name: shstrtab_name_off,
            sh_type: SHT_STRTAB,
            sh_offset: shstrtab_off,
            sh_size: shstrtab.len() as u32,
            sh_addralign: 1,
            ..Default::default()
        },
        SectionHeader {
            sh_name: text_name_off,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_offset: text_off,
            sh_size: text_data.len() as u32,
            sh_addralign: 4,
            ..Default::default()
        },
        SectionHeader {
            sh_name: symtab_name_off,
            sh_type: SHT_SYMTAB,
            sh_offset: symtab_off,
            sh_size: symtab_data.len() as u32,
            sh_link: 4,
            sh_info: 1,
            sh_entsize: SIZEOF_SYM as u32,
            sh_addralign: 4,
            ..Default::default()
        },
        SectionHeader {
            sh_name: strtab_name_off,
            sh_type: SHT_STRTAB,
            sh_offset: strtab_off,
            sh_size: strtab.len() as u32,
            sh_addralign: 1,
            ..Default::default()
        },
    ];

    let mut e_ident = [0u8; asm_processor::elf::header::EI_NIDENT];
    e_ident[0..4].copy_from_slice(ELFMAG);
    e_ident[4] = ELFCLASS32;
    e_ident[5] = ELFDATA2MSB;
    let header = Header {
        e_ident,
        e_type: ET_REL,
        e_machine: EM_MIPS,
        e_version: 1,
        e_entry: 0,
        e_phoff: 0,
        e_shoff: shoff,
        e_flags: 0,
        e_ehsize: SIZEOF_EHDR as u16,
        e_phentsize: 0,
        e_phnum: 0,
        e_shentsize: SIZEOF_SHDR as u16,
        e_shnum: headers.len() as u16,
        e_shstrndx: 1,
    };

    let mut buf = vec![0u8; shoff as usize + headers.len() * SIZEOF_SHDR];
    buf.pwrite_with(header, 0, ENDIAN).unwrap();
    buf[shstrtab_off as usize..shstrtab_off as usize + shstrtab.len()].copy_from_slice(&shstrtab);
    buf[text_off as usize..text_off as usize + text_data.len()].copy_from_slice(text_data);
    buf[symtab_off as usize..symtab_off as usize + symtab_data.len()].copy_from_slice(&symtab_data);
    buf[strtab_off as usize..strtab_off as usize + strtab.len()].copy_from_slice(&strtab);
    for (i, hdr) in headers.iter().enumerate() {
        buf.pwrite_with(*hdr, shoff as usize + i * SIZEOF_SHDR, ENDIAN).unwrap();
    }
    buf
}
