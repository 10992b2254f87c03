use crate::{*, error::*, core::*, layout::*, os::*, payload::*, process_info::*, procfs::*, util::*};
use std::{fs::OpenOptions, io::{Seek, SeekFrom, Write}, mem};
use memmap2::MmapOptions;

// Everything the synthesizer needs to lay down the section header table.
pub struct SectionInputs<'a> {
    pub layout: &'a Layout,
    pub dynmeta: &'a DynMeta,
    pub overrides: &'a LayoutOverrides,
    pub libs: &'a [LibraryRecord],
    pub maps: &'a MemMapsInfo,
    pub core: &'a CoreFile,
    pub payload: &'a PayloadLayout,
}

pub struct SectionTable {
    pub headers: Vec<ElfShdr>,
    pub shstrtab: Vec<u8>,
    pub text_index: usize,
    pub dynsym_index: usize, // 0 when statically linked
    pub symtab_index: usize,
    pub strtab_index: usize,
    pub eh_frame_workaround: bool,
}

fn or_unknown(size: Option<usize>) -> usize {
    match size {
        Some(s) if s > 0 => s,
        _ => UNKNOWN_SHDR_SIZE,
    }
}

struct ShdrBuilder {
    headers: Vec<ElfShdr>,
    shstrtab: Vec<u8>,
}

impl ShdrBuilder {
    fn new() -> Self {
        ShdrBuilder {headers: Vec::new(), shstrtab: Vec::new()}
    }

    fn push(&mut self, name: &str, section_type: u32, flags: u64, addr: usize, offset: usize, size: usize, link: u32, entsize: usize, align: usize) -> usize {
        let mut shdr: ElfShdr = unsafe {mem::zeroed()};
        shdr.sh_name = self.shstrtab.len() as u32;
        shdr.sh_type = section_type;
        shdr.sh_flags = flags as _;
        shdr.sh_addr = addr as _;
        shdr.sh_offset = offset as _;
        shdr.sh_size = size as _;
        shdr.sh_link = link;
        shdr.sh_entsize = entsize as _;
        shdr.sh_addralign = align as _;
        self.shstrtab.extend_from_slice(name.as_bytes());
        self.shstrtab.push(b'\0');
        self.headers.push(shdr);
        self.headers.len() - 1
    }
}

// File offset inside the core for one of the special mappings. The stack
// probe is a range check: the kernel dumps the stack segment one page below
// where the maps line puts it.
fn special_map_offset(core: &CoreFile, maps: &MemMapsInfo, kind: &MapKind, range_probe: bool) -> (usize, usize, usize) {
    let map = match maps.first_of_kind(kind) {
        Some(m) => m,
        None => return (0, 0, 0),
    };
    let seg = if range_probe {
        core.segment_containing(map.start)
    } else {
        core.segment_at_address(map.start)
    };
    (seg.map_or(0, |s| s.offset), map.start, map.len)
}

pub fn build_section_headers(inp: &SectionInputs) -> SectionTable {
    let l = inp.layout;
    let m = inp.dynmeta;
    let o = inp.overrides;
    let p = inp.payload;
    let dynamic = l.dynlinked;
    let mut b = ShdrBuilder::new();

    b.push("", SHT_NULL, 0, 0, 0, 0, 0, 0, 0);

    if dynamic {
        b.push(".interp", SHT_PROGBITS, SHF_ALLOC, l.interp_vaddr, l.interp_offset, l.interp_size, 0, 0, 1);
    }

    b.push(".note", SHT_NOTE, SHF_ALLOC, l.note_vaddr, l.note_offset, l.note_size, 0, 0, 4);

    let mut dynsym_index = 0usize;
    if dynamic {
        b.push(".hash", SHT_GNU_HASH, SHF_ALLOC, m.hash_vaddr, m.hash_off, or_unknown(o.hash_size), 0, 0, 4);

        dynsym_index = b.headers.len();
        b.push(".dynsym", SHT_DYNSYM, SHF_ALLOC, m.dynsym_vaddr, m.dynsym_off, m.dynstr_off.saturating_sub(m.dynsym_off), dynsym_index as u32 + 1, mem::size_of::<ElfSym>(), mem::size_of::<usize>());
        b.push(".dynstr", SHT_STRTAB, SHF_ALLOC, m.dynstr_vaddr, m.dynstr_off, m.strsz, 0, 0, 1);

        let (reloc_dyn, reloc_plt) = if cfg!(target_pointer_width = "64") {(".rela.dyn", ".rela.plt")} else {(".rel.dyn", ".rel.plt")};
        let (reloc_vaddr, reloc_off) = if cfg!(target_pointer_width = "64") {(m.rela_vaddr, m.rela_off)} else {(m.rel_vaddr, m.rel_off)};
        b.push(reloc_dyn, SHT_RELOC, SHF_ALLOC, reloc_vaddr, reloc_off, or_unknown(o.rela_size), dynsym_index as u32, mem::size_of::<ElfRel>(), mem::size_of::<usize>());
        b.push(reloc_plt, SHT_RELOC, SHF_ALLOC, m.plt_rela_vaddr, m.plt_rela_off, or_unknown(o.plt_rela_size), dynsym_index as u32, mem::size_of::<ElfRel>(), mem::size_of::<usize>());

        let init_size = or_unknown(o.init_size);
        b.push(".init", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, m.init_vaddr, m.init_off, init_size, 0, 0, mem::size_of::<usize>());

        // .plt sits right after .init, aligned the way the original file
        // aligns it: push the offset forward by however far the address has
        // to travel to reach its 16-byte boundary.
        let plt_end_of_init = m.init_vaddr + init_size;
        let plt_offset = m.init_off + init_size + (align_up(plt_end_of_init, 16) - plt_end_of_init);
        b.push(".plt", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, o.plt_vaddr.unwrap_or(0), plt_offset, or_unknown(o.plt_size), 0, 16, 16);
    }

    let text_index = b.headers.len();
    b.push(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, l.text_vaddr, l.text_offset, l.text_size, 0, 0, 16);

    if dynamic {
        b.push(".fini", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, m.fini_vaddr, m.fini_off, or_unknown(o.fini_size), 0, 0, 16);
        b.push(".eh_frame_hdr", SHT_PROGBITS, SHF_ALLOC, l.ehframe_vaddr, l.ehframe_offset, l.ehframe_size, 0, 0, 4);
    }

    // For the dynamic case ehframe_offset points at .eh_frame_hdr and the
    // real .eh_frame starts right after it. Statically linked binaries have
    // no PT_GNU_EH_FRAME, so without the executable's own section headers
    // the address is unknowable and the section is not emitted at all.
    let mut eh_frame_workaround = false;
    if dynamic || o.ehframe_vaddr.is_some() {
        let mut eh_frame_offset = if dynamic {l.ehframe_offset + l.ehframe_size} else {l.ehframe_offset};
        let eh_frame_addr = if dynamic {l.ehframe_vaddr + l.ehframe_size} else {o.ehframe_vaddr.unwrap_or(0)};
        // Sometimes the dump carries four zero bytes of padding where .eh_frame
        // should begin; skip them or the FDE walk sees a terminator up front.
        let core_data = inp.core.elf.data();
        if eh_frame_offset + 4 <= core_data.len() && core_data[eh_frame_offset..eh_frame_offset + 4] == [0, 0, 0, 0] {
            eh_frame_offset += 4;
            eh_frame_workaround = true;
        }
        let eh_frame_fallback_size = (l.ehframe_vaddr + l.ehframe_size).saturating_sub(l.text_vaddr);
        b.push(".eh_frame", SHT_PROGBITS, SHF_ALLOC, eh_frame_addr, eh_frame_offset, o.ehframe_size.unwrap_or(eh_frame_fallback_size), 0, 0, 8);
    }

    if dynamic {
        b.push(".dynamic", SHT_DYNAMIC, SHF_ALLOC | SHF_WRITE, l.dyn_vaddr, l.dyn_offset, l.dyn_size, 0, mem::size_of::<ElfDyn>(), mem::size_of::<usize>());
        b.push(".got.plt", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, m.got_vaddr, m.got_off, or_unknown(o.got_size), 0, mem::size_of::<usize>(), mem::size_of::<usize>());
    }

    b.push(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, l.data_vaddr, l.data_offset, l.data_size, 0, 0, mem::size_of::<usize>());
    // Emitted as PROGBITS rather than NOBITS: the dump has the real bytes.
    b.push(".bss", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, l.bss_vaddr, l.bss_offset, l.bss_size, 0, 0, mem::size_of::<usize>());

    let (heap_off, heap_addr, heap_size) = special_map_offset(inp.core, inp.maps, &MapKind::Heap, false);
    b.push(".heap", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, heap_addr, heap_off, heap_size, 0, 0, mem::size_of::<usize>());

    let mut data_count = 0;
    for lib in inp.libs {
        let section_type = if lib.injected {SHT_INJECTED} else {SHT_SHLIB};
        let name = match lib.flags {
            f if f == PF_R | PF_X => format!("{}.text", lib.name),
            f if f == PF_R | PF_W => {
                let n = format!("{}.data.{}", lib.name, data_count);
                data_count += 1;
                n
            }
            PF_R => format!("{}.relro", lib.name),
            _ => format!("{}.undef", lib.name),
        };
        b.push(&name, section_type, SHF_ALLOC, lib.addr, lib.offset, lib.size, 0, 0, 8);
    }

    b.push(".prstatus", SHT_PROGBITS, 0, 0, p.prstatus_offset, p.prstatus_size, 0, mem::size_of::<elf_prstatus>(), 4);
    b.push(".fdinfo", SHT_PROGBITS, 0, 0, p.fdinfo_offset, p.fdinfo_size, 0, mem::size_of::<fd_info>(), 4);
    b.push(".siginfo", SHT_PROGBITS, 0, 0, p.siginfo_offset, p.siginfo_size, 0, mem::size_of::<libc::siginfo_t>(), 4);
    b.push(".auxvector", SHT_PROGBITS, 0, 0, p.auxv_offset, p.auxv_size, 0, 8, 8);
    b.push(".exepath", SHT_PROGBITS, 0, 0, p.exepath_offset, p.exepath_size, 0, 8, 1);
    b.push(".personality", SHT_PROGBITS, 0, 0, p.personality_offset, p.personality_size, 0, mem::size_of::<elf_stat>(), 1);
    b.push(".arglist", SHT_PROGBITS, 0, 0, p.arglist_offset, p.arglist_size, 0, 1, 1);

    let (stack_off, stack_addr, stack_size) = special_map_offset(inp.core, inp.maps, &MapKind::Stack, true);
    b.push(".stack", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, stack_addr, stack_off, stack_size, 0, 0, mem::size_of::<usize>());
    let (vdso_off, vdso_addr, vdso_size) = special_map_offset(inp.core, inp.maps, &MapKind::Vdso, false);
    b.push(".vdso", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vdso_addr, vdso_off, vdso_size, 0, 0, mem::size_of::<usize>());
    let (vsyscall_off, vsyscall_addr, vsyscall_size) = special_map_offset(inp.core, inp.maps, &MapKind::Vsyscall, false);
    b.push(".vsyscall", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, vsyscall_addr, vsyscall_off, vsyscall_size, 0, 0, mem::size_of::<usize>());

    // Offsets and sizes of these two are patched once the eh_frame symbol
    // reconstruction has produced the actual bytes.
    let symtab_index = b.headers.len();
    b.push(".symtab", SHT_SYMTAB, 0, 0, 0, 0, symtab_index as u32 + 1, mem::size_of::<ElfSym>(), 4);
    let strtab_index = b.headers.len();
    b.push(".strtab", SHT_STRTAB, 0, 0, 0, 0, 0, 0, 1);

    // .shstrtab lands right after the header table itself; its offset is
    // resolved in write_section_table when the final count is known.
    b.push(".shstrtab", SHT_STRTAB, 0, 0, 0, 0, 0, 0, 1);
    let shstrtab_index = b.headers.len() - 1;
    b.headers[shstrtab_index].sh_size = b.shstrtab.len() as _;

    SectionTable {
        headers: b.headers,
        shstrtab: b.shstrtab,
        text_index,
        dynsym_index,
        symtab_index,
        strtab_index,
        eh_frame_workaround,
    }
}

// Appends the table and its string table at the payload tail, then patches
// the ELF header so section-aware tooling picks everything up.
pub fn write_section_table(outfile: &str, table: &mut SectionTable, stb_offset: usize, entry: usize) -> Result<()> {
    let shnum = table.headers.len();
    let shstrndx = shnum - 1;
    let shstrtab_offset = stb_offset + shnum * mem::size_of::<ElfShdr>();
    table.headers[shstrndx].sh_offset = shstrtab_offset as _;

    let mut file = OpenOptions::new().read(true).write(true).open(outfile)?;
    let end = file.seek(SeekFrom::End(0))? as usize;
    if end != stb_offset {
        return err!(Internal, "section table expected at offset {} but file ends at {}", stb_offset, end);
    }
    for shdr in &table.headers {
        file.write_struct(shdr)?;
    }
    file.write_all(&table.shstrtab)?;
    file.sync_all()?;

    let mut map = unsafe {MmapOptions::new().map_mut(&file)}?;
    let (mut header, _) = unsafe {memcpy_struct::<ElfEhdr>(&map[..], "ElfEhdr")}?;
    header.e_entry = entry as _;
    header.e_shoff = stb_offset as _;
    header.e_shnum = shnum as u16;
    header.e_shstrndx = shstrndx as u16;
    header.e_shentsize = mem::size_of::<ElfShdr>() as u16;
    header.e_type = ET_NONE;
    map[..mem::size_of::<ElfEhdr>()].copy_from_slice(struct_bytes(&header));
    map.flush()?;
    Ok(())
}

// Name of a header, resolved against the table's own string table.
pub fn section_name<'a>(table: &'a SectionTable, idx: usize) -> &'a str {
    let start = table.headers[idx].sh_name as usize;
    let rest = &table.shstrtab[start..];
    let len = rest.iter().position(|&c| c == b'\0').unwrap_or(rest.len());
    std::str::from_utf8(&rest[..len]).unwrap_or("")
}
