use crate::{*, error::*, os::*, util::*};
use std::{fs::File, mem, str, collections::HashMap, io::{self, BufRead}};
use memmap2::Mmap;

pub struct ElfSegment {
    pub idx: usize,
    pub segment_type: u32,
    pub flags: u32,
    pub offset: usize,
    pub address: usize,
    pub size_in_file: usize,
    pub size_in_memory: usize,
    pub alignment: usize,
}

impl ElfSegment {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr < self.address + self.size_in_memory
    }

    // File offset of a virtual address inside this segment.
    pub fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr) || addr == self.address + self.size_in_memory);
        self.offset + (addr - self.address)
    }
}

pub struct ElfSection {
    pub idx: usize,
    pub name: String,
    pub section_type: u32,
    pub flags: u64,
    pub address: usize,
    pub offset: usize,
    pub size: usize,
    pub link: u32,
    pub info: u32,
    pub alignment: usize,
    pub entry_size: usize,
    pub name_offset_in_strtab: u32,
}

impl ElfSection {
    pub fn size_in_file(&self) -> usize {
        if self.section_type == SHT_NOBITS {0} else {self.size}
    }
}

pub struct ElfNote<'a> {
    pub type_: u32,
    pub name: &'a [u8],
    pub desc: &'a [u8],
}

// A memory-mapped ELF file with typed accessors. Owns either the mapping or
// a byte vector (the latter for images assembled in memory, mostly in tests).
pub struct ElfImage {
    pub name: String, // just for logging
    pub header: ElfEhdr,
    pub segments: Vec<ElfSegment>,
    pub sections: Vec<ElfSection>,
    pub section_by_name: HashMap<String, usize>,
    pub entry_point: usize,
    pub is_core_dump: bool,
    mmapped: Option<Mmap>,
    owned: Vec<u8>,
}

impl ElfImage {
    pub fn from_path(name: &str) -> Result<Self> {
        let file = File::open(name)?;
        let mmapped = unsafe {Mmap::map(&file)}?;
        open_elf(name.to_string(), Some(mmapped), Vec::new())
    }

    pub fn from_contents(name: String, contents: Vec<u8>) -> Result<Self> {
        open_elf(name, None, contents)
    }

    pub fn data(&self) -> &[u8] {
        match &self.mmapped {
            Some(m) => &m[..],
            None => &self.owned[..],
        }
    }

    pub fn len(&self) -> usize { self.data().len() }

    pub fn has_section_headers(&self) -> bool {
        self.header.e_shnum != 0 && self.header.e_shoff != 0
    }

    // Side channel into the on-disk binary's own section headers. Both return
    // None when the binary was stripped of them.
    pub fn section_addr(&self, name: &str) -> Option<usize> {
        self.section_by_name.get(name).map(|&i| self.sections[i].address)
    }
    pub fn section_size(&self, name: &str) -> Option<usize> {
        self.section_by_name.get(name).map(|&i| self.sections[i].size)
    }

    // First executable PT_LOAD mapped at virtual address zero means the
    // loader gets to pick the base, i.e. the binary is position independent.
    pub fn is_pie(&self) -> bool {
        for s in &self.segments {
            if s.segment_type == PT_LOAD && s.flags & PF_X != 0 {
                return s.address == 0;
            }
        }
        false
    }

    pub fn is_dynamically_linked(&self) -> bool {
        self.segments.iter().any(|s| s.segment_type == PT_INTERP)
    }
}

pub fn parse_elf_note<'a>(data: &'a [u8]) -> Result<(ElfNote<'a>, /*remainder*/ &'a [u8])> {
    let mut reader = io::Cursor::new(data);
    let name_len = reader.read_u32()? as usize;
    let desc_len = reader.read_u32()? as usize;
    let type_ = reader.read_u32()?;
    let name_len_padded = (name_len + 3) & !3;
    let desc_len_padded = (desc_len + 3) & !3;
    let pos = reader.position() as usize;
    if pos + name_len_padded + desc_len_padded > data.len() {
        return err!(MalformedCore, "ELF note is too short");
    }
    Ok((ElfNote {type_, name: &data[pos..pos+name_len], desc: &data[pos+name_len_padded..pos+name_len_padded+desc_len]}, &data[pos+name_len_padded+desc_len_padded..]))
}

// Read the ELF headers.
fn open_elf(name: String, mmapped: Option<Mmap>, owned: Vec<u8>) -> Result<ElfImage> {
    let data: &[u8] = match &mmapped {
        Some(m) => &m[..],
        None => &owned[..],
    };

    let (header, _) = unsafe {memcpy_struct::<ElfEhdr>(data, "ElfEhdr")}?;

    if &header.e_ident[..4] != &[0x7f, 0x45, 0x4c, 0x46] { return err!(MalformedExecutable, "invalid ELF magic bytes: {} in {}", hexdump(&header.e_ident[..4], 100), name); }

    let expected_class = if cfg!(target_pointer_width = "64") {2} else {1};
    if header.e_ident[4] != expected_class { return err!(UnsupportedExecutable, "wrong EI_CLASS for this worker: {} in {}", header.e_ident[4], name); }

    if header.e_ident[5] == 2 { return err!(UnsupportedExecutable, "big-endian executables are not supported"); }
    if header.e_ident[5] != 1 { return err!(MalformedExecutable, "invalid EI_DATA: {}", header.e_ident[5]); }

    if header.e_ident[6] != 1 { return err!(MalformedExecutable, "invalid EI_VERSION: {}", header.e_ident[6]); }

    let is_core_dump = header.e_type == ET_CORE;
    if !is_core_dump && header.e_type != ET_EXEC && header.e_type != ET_DYN { return err!(UnsupportedExecutable, "unexpected or unsupported species of elf: e_type = {}", header.e_type); }

    if header.e_phnum > 0 && (header.e_phentsize as usize) < mem::size_of::<ElfPhdr>() { return err!(MalformedExecutable, "ELF e_phentsize too small in {}", name); }
    if header.e_shnum > 0 && (header.e_shentsize as usize) < mem::size_of::<ElfShdr>() { return err!(MalformedExecutable, "ELF e_shentsize too small in {}", name); }
    if (header.e_phnum as usize).saturating_mul(header.e_phentsize as usize).saturating_add(header.e_phoff as usize) > data.len() { return err!(MalformedExecutable, "ELF program header out of bounds in {}", name); }
    if (header.e_shnum as usize).saturating_mul(header.e_shentsize as usize).saturating_add(header.e_shoff as usize) > data.len() { return err!(MalformedExecutable, "ELF section header out of bounds in {}", name); }

    let mut segments: Vec<ElfSegment> = Vec::new();
    for idx in 0..header.e_phnum as usize {
        let (segment, _) = unsafe {memcpy_struct::<ElfPhdr>(&data[header.e_phoff as usize + idx * header.e_phentsize as usize..], "ElfPhdr")}?;

        let mut offset = segment.p_offset as usize;
        let mut size_in_file = segment.p_filesz as usize;
        if offset.saturating_add(size_in_file) > data.len() {
            log_line!("warning: ELF segment {} out of bounds (offset: {}, size in file: {}, file size: {})", idx, offset, size_in_file, data.len());
            offset = offset.min(data.len());
            size_in_file = size_in_file.min(data.len() - offset);
        }

        segments.push(ElfSegment {idx, segment_type: segment.p_type, flags: segment.p_flags, offset, address: segment.p_vaddr as usize, size_in_file, size_in_memory: segment.p_memsz as usize, alignment: segment.p_align as usize});
    }

    let mut sections: Vec<ElfSection> = Vec::new();
    for idx in 0..header.e_shnum as usize {
        let (section, _) = unsafe {memcpy_struct::<ElfShdr>(&data[header.e_shoff as usize + idx * header.e_shentsize as usize..], "ElfShdr")}?;
        sections.push(ElfSection {
            idx, name: String::new(), name_offset_in_strtab: section.sh_name, section_type: section.sh_type, flags: section.sh_flags as u64,
            address: section.sh_addr as usize, offset: section.sh_offset as usize, size: section.sh_size as usize, link: section.sh_link,
            info: section.sh_info, alignment: section.sh_addralign as usize, entry_size: section.sh_entsize as usize});
    }

    let entry_point = header.e_entry as usize;
    let mut elf = ElfImage {name, header, mmapped, owned, segments, sections, entry_point, section_by_name: HashMap::new(), is_core_dump};

    if !elf.sections.is_empty() && (elf.header.e_shstrndx as usize) < elf.sections.len() {
        let data_len = elf.data().len();
        let strtab_offset = elf.sections[elf.header.e_shstrndx as usize].offset;
        for idx in 0..elf.sections.len() {
            let name_offset = strtab_offset + elf.sections[idx].name_offset_in_strtab as usize;
            let name = match name_from_strtab(elf.data(), name_offset) {
                Some(n) => n.to_string(),
                None => {
                    log_line!("warning: section {} name out of bounds in {}", idx, elf.name);
                    String::new()
                }
            };
            elf.sections[idx].name = name.clone();

            let s = &mut elf.sections[idx];
            if s.offset.saturating_add(s.size_in_file()) > data_len {
                log_line!("warning: ELF section {} out of bounds: {} + {} > {}", name, s.offset, s.size_in_file(), data_len);
                // Clamp the range to make sure we won't read the mmap out of bounds.
                s.offset = s.offset.min(data_len);
                s.size = s.size.min(data_len - s.offset);
            }

            let prev = elf.section_by_name.insert(name, idx);
            if prev.is_some() && !is_core_dump {
                log_line!("warning: ELF has duplicate section name: {}", elf.sections[idx].name);
            }
        }
    }

    Ok(elf)
}

fn name_from_strtab(data: &[u8], offset: usize) -> Option<&str> {
    if offset >= data.len() {
        return None;
    }
    let rest = &data[offset..];
    let len = rest.iter().position(|&c| c == b'\0')?;
    str::from_utf8(&rest[..len]).ok()
}

#[cfg(test)]
pub mod testelf {
    // Builders for synthetic ELF images used by several modules' tests.
    use crate::{os::*, util::*};
    use std::mem;

    pub fn ehdr(e_type: u16, phnum: u16, shoff: usize, shnum: u16, shstrndx: u16) -> ElfEhdr {
        let mut h: ElfEhdr = unsafe {mem::zeroed()};
        h.e_ident[..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
        h.e_ident[4] = if cfg!(target_pointer_width = "64") {2} else {1};
        h.e_ident[5] = 1;
        h.e_ident[6] = 1;
        h.e_type = e_type;
        h.e_machine = 0x3e;
        h.e_version = 1;
        h.e_ehsize = mem::size_of::<ElfEhdr>() as u16;
        h.e_phoff = if phnum > 0 {mem::size_of::<ElfEhdr>() as _} else {0};
        h.e_phentsize = mem::size_of::<ElfPhdr>() as u16;
        h.e_phnum = phnum;
        h.e_shoff = shoff as _;
        h.e_shentsize = mem::size_of::<ElfShdr>() as u16;
        h.e_shnum = shnum;
        h.e_shstrndx = shstrndx;
        h
    }

    pub fn phdr(p_type: u32, flags: u32, offset: usize, vaddr: usize, filesz: usize, memsz: usize) -> ElfPhdr {
        let mut p: ElfPhdr = unsafe {mem::zeroed()};
        p.p_type = p_type;
        p.p_flags = flags;
        p.p_offset = offset as _;
        p.p_vaddr = vaddr as _;
        p.p_filesz = filesz as _;
        p.p_memsz = memsz as _;
        p.p_align = 4096;
        p
    }

    // Byte image with the headers at the front and the payload appended.
    pub fn image(e_type: u16, phdrs: &[ElfPhdr], payload: &[u8]) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_struct(&ehdr(e_type, phdrs.len() as u16, 0, 0, 0)).unwrap();
        for p in phdrs {
            buf.write_struct(p).unwrap();
        }
        buf.extend_from_slice(payload);
        buf
    }
}
