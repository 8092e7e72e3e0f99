//! The ELF reader/writer (§4.A): parses a 32-bit big-endian MIPS `ET_REL` object into an arena
//! of [`Section`]s and serializes it back, recomputing layout from scratch.

use std::fs;
use std::path::Path;

use scroll::{Pread, Pwrite};

use crate::elf::header::{Header, SIZEOF_EHDR};
use crate::elf::reloc::{RelEntry, RelaEntry, Relocation, SIZEOF_REL, SIZEOF_RELA};
use crate::elf::section_header::{Section, SectionHeader, SHT_NOBITS, SHT_REL, SHT_RELA, SHT_SYMTAB, SIZEOF_SHDR};
use crate::elf::strtab::Strtab;
use crate::elf::sym::{Symbol, SymRaw, SIZEOF_SYM};
use crate::elf::ElfError;

/// A parsed relocatable ELF object, ready for the fixup pass to splice into.
#[derive(Debug, Clone)]
pub struct ObjFile {
    pub header: Header,
    pub sections: Vec<Section>,
    /// The complete original file bytes, kept around because the MIPS `.mdebug` symbolic
    /// header (§4.E step 9) addresses its sub-tables with absolute file offsets, not offsets
    /// relative to the section — those must be resolved against the file as it was read, before
    /// any section gets repacked by [`ObjFile::write`].
    pub raw: Vec<u8>,
}

const ENDIAN: scroll::Endian = scroll::BE;

impl ObjFile {
    pub fn from_file(path: &Path) -> Result<ObjFile, ElfError> {
        let raw = fs::read(path)?;
        Self::parse(raw)
    }

    pub fn parse(raw: Vec<u8>) -> Result<ObjFile, ElfError> {
        let header: Header = raw.pread_with(0, ENDIAN)?;
        header.validate()?;

        let shoff = header.e_shoff as usize;
        let first: SectionHeader = raw.pread_with(shoff, ENDIAN)?;
        let shnum = if header.e_shnum == 0 {
            if first.sh_size == 0 {
                return Err(ElfError::Malformed("zero sections in section header table".into()));
            }
            first.sh_size as usize
        } else {
            header.e_shnum as usize
        };

        let mut raw_headers = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let hdr: SectionHeader = raw.pread_with(shoff + i * SIZEOF_SHDR, ENDIAN)?;
            raw_headers.push(hdr);
        }

        let shstrndx = header.e_shstrndx as usize;
        let shstrtab_hdr = raw_headers
            .get(shstrndx)
            .ok_or_else(|| ElfError::Malformed("e_shstrndx out of range".into()))?;
        let shstrtab = Strtab::parse(slice_section(&raw, shstrtab_hdr)?);

        let mut sections = Vec::with_capacity(shnum);
        for (index, hdr) in raw_headers.iter().enumerate() {
            let data = if hdr.sh_type == SHT_NOBITS { Vec::new() } else { slice_section(&raw, hdr)?.to_vec() };
            let name = shstrtab.lookup(hdr.sh_name as usize);
            sections.push(Section {
                name,
                sh_name: hdr.sh_name,
                sh_type: hdr.sh_type,
                sh_flags: hdr.sh_flags,
                sh_addr: hdr.sh_addr,
                sh_offset: hdr.sh_offset,
                sh_size: hdr.sh_size,
                sh_link: hdr.sh_link,
                sh_info: hdr.sh_info,
                sh_addralign: hdr.sh_addralign,
                sh_entsize: hdr.sh_entsize,
                data,
                index,
                relocated_by: Vec::new(),
                symbols: Vec::new(),
                relocations: Vec::new(),
            });
        }

        let mut obj = ObjFile { header, sections, raw };
        obj.late_init()?;
        Ok(obj)
    }

    /// Builds typed children (symbols, relocations) and the `relocated_by` back-references.
    /// Run once after every structural change to `sections` that a caller makes by hand
    /// (today only [`ObjFile::parse`] needs this — [`ObjFile::add_section`] maintains the
    /// invariants incrementally).
    fn late_init(&mut self) -> Result<(), ElfError> {
        let symtab_indices: Vec<usize> =
            self.sections.iter().enumerate().filter(|(_, s)| s.sh_type == SHT_SYMTAB).map(|(i, _)| i).collect();
        if symtab_indices.len() > 1 {
            return Err(ElfError::Malformed("more than one SHT_SYMTAB section".into()));
        }
        if let Some(&symtab_idx) = symtab_indices.first() {
            let strtab_idx = self.sections[symtab_idx].sh_link as usize;
            let strtab_data = self
                .sections
                .get(strtab_idx)
                .ok_or_else(|| ElfError::Malformed("symtab sh_link out of range".into()))?
                .data
                .clone();
            let strtab = Strtab::parse(&strtab_data);

            let data = self.sections[symtab_idx].data.clone();
            let mut symbols = Vec::with_capacity(data.len() / SIZEOF_SYM);
            for chunk in data.chunks_exact(SIZEOF_SYM) {
                let raw: SymRaw = chunk.pread_with(0, ENDIAN)?;
                let name = strtab.lookup(raw.st_name as usize);
                symbols.push(Symbol::parse(raw, name)?);
            }
            self.sections[symtab_idx].symbols = symbols;
        }

        for index in 0..self.sections.len() {
            let (sh_type, sh_info, data) = {
                let s = &self.sections[index];
                (s.sh_type, s.sh_info as usize, s.data.clone())
            };
            if sh_type != SHT_REL && sh_type != SHT_RELA {
                continue;
            }
            let mut relocations = Vec::new();
            if sh_type == SHT_REL {
                for chunk in data.chunks_exact(SIZEOF_REL) {
                    let entry: RelEntry = chunk.pread_with(0, ENDIAN)?;
                    relocations.push(Relocation::from_rel(entry));
                }
            } else {
                for chunk in data.chunks_exact(SIZEOF_RELA) {
                    let entry: RelaEntry = chunk.pread_with(0, ENDIAN)?;
                    relocations.push(Relocation::from_rela(entry));
                }
            }
            self.sections[index].relocations = relocations;
            if let Some(target) = self.sections.get_mut(sh_info) {
                target.relocated_by.push(index);
            }
        }
        Ok(())
    }

    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn find_section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    pub fn symtab(&self) -> Option<&Section> {
        self.sections.iter().find(|s| s.sh_type == SHT_SYMTAB)
    }

    pub fn symtab_mut(&mut self) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.sh_type == SHT_SYMTAB)
    }

    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symtab()?.symbols.iter().find(|s| s.name == name)
    }

    /// Find `name` defined within `section`, returning its `st_value`.
    pub fn find_symbol_in_section(&self, name: &str, section: &Section) -> Option<u32> {
        self.symtab()?
            .symbols
            .iter()
            .find(|s| s.name == name && s.st_shndx as usize == section.index)
            .map(|s| s.st_value)
    }

    /// Appends a new section (§4.A "Add section"): registers its name in shstrtab, pushes the
    /// section record, and — if it is itself a relocation table — registers it in its target's
    /// `relocated_by`.
    pub fn add_section(
        &mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u32,
        sh_link: u32,
        sh_info: u32,
        sh_addralign: u32,
        sh_entsize: u32,
        data: Vec<u8>,
    ) -> usize {
        let shstrndx = self.header.e_shstrndx as usize;
        let sh_name = {
            let shstrtab_data = &mut self.sections[shstrndx].data;
            let offset = shstrtab_data.len() as u32;
            shstrtab_data.extend(name.bytes());
            shstrtab_data.push(0);
            offset
        };

        let index = self.sections.len();
        let sh_size = data.len() as u32;
        self.sections.push(Section {
            name: name.to_string(),
            sh_name,
            sh_type,
            sh_flags,
            sh_addr: 0,
            sh_offset: 0,
            sh_size,
            sh_link,
            sh_info,
            sh_addralign,
            sh_entsize,
            data,
            index,
            relocated_by: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
        });

        if sh_type == SHT_REL || sh_type == SHT_RELA {
            if let Some(target) = self.sections.get_mut(sh_info as usize) {
                target.relocated_by.push(index);
            }
        }
        index
    }

    /// Drops all `.mdebug*`/`.gptab*` sections, renumbering every index-valued field
    /// (`sh_link`, `sh_info`, `relocated_by`, `e_shstrndx`) that refers past the removed
    /// sections (§4.A "Drop mdebug/gptab").
    pub fn drop_mdebug_gptab(&mut self) {
        let keep: Vec<bool> =
            self.sections.iter().map(|s| !(s.name.starts_with(".mdebug") || s.name.starts_with(".gptab"))).collect();
        if keep.iter().all(|&k| k) {
            return;
        }

        let mut remap = vec![0usize; self.sections.len()];
        let mut next = 0usize;
        for (old, &k) in keep.iter().enumerate() {
            if k {
                remap[old] = next;
                next += 1;
            }
        }

        let mut new_sections = Vec::with_capacity(next);
        for (old, section) in std::mem::take(&mut self.sections).into_iter().enumerate() {
            if !keep[old] {
                continue;
            }
            let mut section = section;
            section.index = remap[old];
            section.sh_link = remap.get(section.sh_link as usize).copied().unwrap_or(0) as u32;
            section.sh_info = remap.get(section.sh_info as usize).copied().unwrap_or(0) as u32;
            section.relocated_by = section.relocated_by.iter().filter(|&&r| keep[r]).map(|&r| remap[r]).collect();
            new_sections.push(section);
        }
        self.sections = new_sections;
        self.header.e_shstrndx = remap[self.header.e_shstrndx as usize] as u16;
    }

    /// Recomputes section file offsets, rewrites `.mdebug`'s internal HDRR offsets if it moved
    /// (§4.A Write, §4.E step 14), writes section data, the section header table, and finally
    /// the file header with the true `e_shoff`.
    pub fn write(&mut self, path: &Path) -> Result<(), ElfError> {
        let old_offsets: Vec<u32> = self.sections.iter().map(|s| s.sh_offset).collect();

        let mut running = SIZEOF_EHDR as u32;
        for (index, section) in self.sections.iter_mut().enumerate() {
            if index == 0 {
                section.sh_offset = 0;
                section.sh_size = 0;
                continue;
            }
            if section.sh_type == SHT_NOBITS {
                section.sh_offset = running;
                continue;
            }
            let align = section.sh_addralign.max(1);
            running = running.div_ceil(align) * align;
            section.sh_offset = running;
            section.sh_size = section.data.len() as u32;
            running += section.sh_size;
        }

        for (index, section) in self.sections.iter_mut().enumerate() {
            if section.name.starts_with(".mdebug") {
                let delta = section.sh_offset as i64 - old_offsets[index] as i64;
                if delta != 0 {
                    rewrite_mdebug_offsets(&mut section.data, delta);
                }
            }
        }

        let mut out = vec![0u8; running as usize];
        for section in &self.sections {
            if section.sh_type == SHT_NOBITS || section.index == 0 {
                continue;
            }
            let start = section.sh_offset as usize;
            out[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        running = (running as usize).div_ceil(4) as u32 * 4;
        out.resize(running as usize, 0);
        let shoff = running;
        for (i, section) in self.sections.iter().enumerate() {
            out.gwrite_with(section.header(), &mut (shoff as usize + i * SIZEOF_SHDR), ENDIAN)?;
        }

        self.header.e_shoff = shoff;
        self.header.e_shnum = self.sections.len() as u16;
        out.pwrite_with(self.header, 0, ENDIAN)?;

        fs::write(path, out)?;
        Ok(())
    }
}

fn slice_section<'a>(raw: &'a [u8], hdr: &SectionHeader) -> Result<&'a [u8], ElfError> {
    let start = hdr.sh_offset as usize;
    let end = start
        .checked_add(hdr.sh_size as usize)
        .ok_or_else(|| ElfError::Malformed("section size overflow".into()))?;
    raw.get(start..end).ok_or_else(|| ElfError::Malformed("section data out of file bounds".into()))
}

/// The MIPS symbolic header (`HDRR`) is a fixed 24-field, 96-byte struct of `(count, offset)`
/// pairs (plus a 4-byte magic/version word). Every offset is an *absolute file offset*; moving
/// the enclosing `.mdebug` section by `delta` bytes requires shifting every populated one
/// in lockstep (§4.E step 14).
const MDEBUG_OFFSET_FIELDS: &[(usize, usize)] = &[
    (2, 3),   // ilineMax, cbLineOffset
    (4, 5),   // idnMax, cbDnOffset
    (6, 7),   // ipdMax, cbPdOffset
    (8, 9),   // isymMax, cbSymOffset
    (10, 11), // ioptMax, cbOptOffset
    (12, 13), // iauxMax, cbAuxOffset
    (14, 15), // issMax, cbSsOffset
    (16, 17), // issExtMax, cbSsExtOffset
    (18, 19), // ifdMax, cbFdOffset
    (20, 21), // crfd, cbRfdOffset
    (22, 23), // iextMax, cbExtOffset
];

pub fn rewrite_mdebug_offsets(data: &mut [u8], delta: i64) {
    for &(count_word, offset_word) in MDEBUG_OFFSET_FIELDS {
        let count_pos = count_word * 4;
        if count_pos + 4 > data.len() {
            continue;
        }
        let count: u32 = data[count_pos..count_pos + 4].pread_with(0, ENDIAN).unwrap_or(0);
        if count == 0 {
            continue;
        }
        let offset_pos = offset_word * 4;
        if offset_pos + 4 > data.len() {
            continue;
        }
        let offset: u32 = data[offset_pos..offset_pos + 4].pread_with(0, ENDIAN).unwrap_or(0);
        let new_offset = (offset as i64 + delta) as u32;
        let _ = data[offset_pos..offset_pos + 4].pwrite_with(new_offset, 0, ENDIAN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::header::{EM_MIPS, ET_REL};
    use scroll::Pwrite;

    fn build_minimal_elf() -> Vec<u8> {
        // Sections: [0]=NULL, [1]=.shstrtab, [2]=.text, [3]=.symtab, [4]=.strtab
        let mut shstrtab = vec![0u8];
        let shstrtab_off = shstrtab.len() as u32;
        shstrtab.extend(b".shstrtab\0");
        let text_off = shstrtab.len() as u32;
        shstrtab.extend(b".text\0");
        let symtab_off = shstrtab.len() as u32;
        shstrtab.extend(b".symtab\0");
        let strtab_off = shstrtab.len() as u32;
        shstrtab.extend(b".strtab\0");

        let mut strtab = vec![0u8];
        let foo_off = strtab.len() as u32;
        strtab.extend(b"foo\0");

        let text_data = vec![0u8; 8];

        let sym = SymRaw { st_name: foo_off, st_value: 0, st_size: 0, st_info: (1 << 4) | 2, st_other: 0, st_shndx: 2 };
        let mut symtab_data = vec![0u8; SIZEOF_SYM];
        symtab_data.pwrite_with(sym, SIZEOF_SYM, ENDIAN).ok();
        let mut full_symtab = vec![0u8; SIZEOF_SYM];
        full_symtab.extend_from_slice(&{
            let mut b = [0u8; SIZEOF_SYM];
            b.pwrite_with(sym, 0, ENDIAN).unwrap();
            b
        });

        let header_size = SIZEOF_EHDR;
        let mut offset = header_size as u32;
        let shstrtab_data_off = offset;
        offset += shstrtab.len() as u32;
        let text_data_off = offset;
        offset += text_data.len() as u32;
        let symtab_data_off = offset;
        offset += full_symtab.len() as u32;
        let strtab_data_off = offset;
        offset += strtab.len() as u32;
        let shoff = offset.div_ceil(4) * 4;

        let headers = [
            SectionHeader::default(),
            SectionHeader {
                sh_name: shstrtab_off,
                sh_type: crate::elf::section_header::SHT_STRTAB,
                sh_offset: shstrtab_data_off,
                sh_size: shstrtab.len() as u32,
                sh_addralign: 1,
                ..Default::default()
            },
            SectionHeader {
                sh_name: text_off,
                sh_type: crate::elf::section_header::SHT_PROGBITS,
                sh_flags: 0x6,
                sh_offset: text_data_off,
                sh_size: text_data.len() as u32,
                sh_addralign: 4,
                ..Default::default()
            },
            SectionHeader {
                sh_name: symtab_off,
                sh_type: SHT_SYMTAB,
                sh_offset: symtab_data_off,
                sh_size: full_symtab.len() as u32,
                sh_link: 4,
                sh_info: 1,
                sh_entsize: SIZEOF_SYM as u32,
                sh_addralign: 4,
                ..Default::default()
            },
            SectionHeader {
                sh_name: strtab_off,
                sh_type: crate::elf::section_header::SHT_STRTAB,
                sh_offset: strtab_data_off,
                sh_size: strtab.len() as u32,
                sh_addralign: 1,
                ..Default::default()
            },
        ];

        let mut e_ident = [0u8; 16];
        e_ident[0..4].copy_from_slice(b"\x7fELF");
        e_ident[4] = 1;
        e_ident[5] = 2;
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

        let mut buf = vec![0u8; (shoff as usize) + headers.len() * SIZEOF_SHDR];
        buf.pwrite_with(header, 0, ENDIAN).unwrap();
        buf[shstrtab_data_off as usize..(shstrtab_data_off as usize + shstrtab.len())].copy_from_slice(&shstrtab);
        buf[text_data_off as usize..(text_data_off as usize + text_data.len())].copy_from_slice(&text_data);
        buf[symtab_data_off as usize..(symtab_data_off as usize + full_symtab.len())].copy_from_slice(&full_symtab);
        buf[strtab_data_off as usize..(strtab_data_off as usize + strtab.len())].copy_from_slice(&strtab);
        for (i, hdr) in headers.iter().enumerate() {
            buf.pwrite_with(*hdr, shoff as usize + i * SIZEOF_SHDR, ENDIAN).unwrap();
        }
        buf
    }

    #[test]
    fn parses_sections_symbols_and_names() {
        let obj = ObjFile::parse(build_minimal_elf()).unwrap();
        assert_eq!(obj.sections.len(), 5);
        assert_eq!(obj.find_section(".text").unwrap().index, 2);
        let sym = obj.find_symbol("foo").unwrap();
        assert_eq!(sym.st_shndx, 2);
        assert_eq!(sym.bind(), 1);
    }

    #[test]
    fn round_trip_write_preserves_semantics() {
        let mut obj = ObjFile::parse(build_minimal_elf()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.o");
        obj.write(&path).unwrap();
        let reparsed = ObjFile::parse(fs::read(&path).unwrap()).unwrap();
        assert_eq!(reparsed.sections.len(), obj.sections.len());
        assert_eq!(reparsed.find_section(".text").unwrap().data, obj.find_section(".text").unwrap().data);
        assert_eq!(reparsed.find_symbol("foo").unwrap().name, "foo");
    }

    #[test]
    fn drop_mdebug_renumbers_links() {
        let mut obj = ObjFile::parse(build_minimal_elf()).unwrap();
        let mdebug_data = vec![0u8; 96];
        obj.add_section(".mdebug", crate::elf::section_header::SHT_MIPS_DEBUG, 0, 0, 0, 1, 0, mdebug_data);
        assert_eq!(obj.sections.len(), 6);
        obj.drop_mdebug_gptab();
        assert_eq!(obj.sections.len(), 5);
        assert!(obj.find_section(".mdebug").is_none());
        assert_eq!(obj.symtab().unwrap().sh_link, 4);
    }
}
