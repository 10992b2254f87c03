use crate::{*, error::*, core::*, elf::*, os::*, util::*, notes::NtFileTable};
use std::mem;

// Virtual addresses, file offsets and sizes of everything the section
// synthesizer needs. Offsets are into the (reinjected) core file.
#[derive(Clone, Copy, Default, Debug)]
pub struct Layout {
    pub pie: bool,
    pub dynlinked: bool,
    pub entry: usize,

    pub text_vaddr: usize,
    pub text_offset: usize,
    pub text_size: usize,

    pub data_vaddr: usize,
    pub data_offset: usize,
    pub data_size: usize,
    pub o_data_filesz: usize, // p_filesz of the on-disk exe's data segment

    pub bss_vaddr: usize,
    pub bss_offset: usize,
    pub bss_size: usize,

    pub dyn_vaddr: usize,
    pub dyn_offset: usize,
    pub dyn_size: usize,

    pub interp_vaddr: usize,
    pub interp_offset: usize,
    pub interp_size: usize,

    pub ehframe_vaddr: usize,
    pub ehframe_offset: usize,
    pub ehframe_size: usize,

    pub note_vaddr: usize,
    pub note_offset: usize,
    pub note_size: usize,
}

// Dynamic-tag derived addresses and their core-file offsets.
#[derive(Clone, Copy, Default, Debug)]
pub struct DynMeta {
    pub rel_vaddr: usize,
    pub rel_off: usize,
    pub rela_vaddr: usize,
    pub rela_off: usize,
    pub plt_rela_vaddr: usize,
    pub plt_rela_off: usize,
    pub got_vaddr: usize,
    pub got_off: usize,
    pub hash_vaddr: usize,
    pub hash_off: usize,
    pub init_vaddr: usize,
    pub init_off: usize,
    pub fini_vaddr: usize,
    pub fini_off: usize,
    pub dynsym_vaddr: usize,
    pub dynsym_off: usize,
    pub dynstr_vaddr: usize,
    pub dynstr_off: usize,
    pub strsz: usize,
    pub pltrelsz: usize,
}

// Section sizes and addresses that only the on-disk executable's own section
// header table knows. All None when that table was stripped; the synthesizer
// then falls back to sentinel sizes.
#[derive(Clone, Copy, Default, Debug)]
pub struct LayoutOverrides {
    pub stripped: bool,
    pub hash_size: Option<usize>,
    pub rela_size: Option<usize>,
    pub plt_rela_size: Option<usize>,
    pub init_size: Option<usize>,
    pub fini_size: Option<usize>,
    pub got_size: Option<usize>,
    pub plt_size: Option<usize>,
    pub ehframe_size: Option<usize>,
    pub plt_vaddr: Option<usize>,
    pub ehframe_vaddr: Option<usize>,
}

impl LayoutOverrides {
    pub fn collect(exe: &ElfImage) -> LayoutOverrides {
        let mut o = LayoutOverrides::default();
        if !exe.has_section_headers() {
            o.stripped = true;
            return o;
        }
        o.hash_size = exe.section_size(".gnu.hash");
        if cfg!(target_pointer_width = "64") {
            o.rela_size = exe.section_size(".rela.dyn");
            o.plt_rela_size = exe.section_size(".rela.plt");
        } else {
            o.rela_size = exe.section_size(".rel.dyn");
            o.plt_rela_size = exe.section_size(".rel.plt");
        }
        o.init_size = exe.section_size(".init");
        o.fini_size = exe.section_size(".fini");
        o.got_size = exe.section_size(".got.plt");
        o.plt_size = exe.section_size(".plt");
        o.ehframe_size = exe.section_size(".eh_frame");
        o.plt_vaddr = exe.section_addr(".plt");
        // For statically linked binaries there is no PT_GNU_EH_FRAME segment,
        // so the executable's section header is the only source of this one.
        o.ehframe_vaddr = exe.section_addr(".eh_frame");
        o
    }
}

// Walks the on-disk executable's program headers, locating text and data by
// the file-offset criterion (text has offset zero) and fixing addresses up
// against the NT_FILE table, which holds the load addresses that were in
// effect when the process died.
pub fn parse_exe_phdrs(exe: &ElfImage, comm: &str, files: &NtFileTable) -> Result<Layout> {
    let mut layout = Layout::default();

    let text_base = match files.text_base(comm) {
        Some(b) => b,
        None => return err!(ProcessState, "unable to locate executable base address for '{}' in NT_FILE", comm),
    };

    layout.pie = exe.is_pie();
    layout.dynlinked = exe.is_dynamically_linked();
    layout.entry = exe.entry_point;
    let bias = if layout.pie {text_base} else {0};

    for seg in &exe.segments {
        match seg.segment_type {
            PT_LOAD => {
                if seg.offset != 0 {
                    // The data segment.
                    layout.data_vaddr = files.data_base(comm).unwrap_or(seg.address + bias);
                    layout.data_size = files.data_size(comm).unwrap_or(seg.size_in_memory);
                    layout.bss_size = seg.size_in_memory - seg.size_in_file;
                    layout.o_data_filesz = seg.size_in_file;
                    if !layout.pie {
                        layout.bss_vaddr = seg.address + seg.size_in_file;
                    }
                } else {
                    // The text segment.
                    layout.text_vaddr = text_base;
                    layout.text_size = files.text_size(comm).unwrap_or(seg.size_in_memory);
                }
            }
            PT_DYNAMIC => {
                layout.dyn_vaddr = seg.address + bias;
                layout.dyn_size = seg.size_in_memory;
            }
            PT_GNU_EH_FRAME => {
                layout.ehframe_vaddr = seg.address + bias;
                layout.ehframe_size = seg.size_in_memory;
            }
            PT_INTERP => {
                layout.interp_vaddr = seg.address + bias;
                layout.interp_size = if seg.size_in_memory != 0 {seg.size_in_memory} else {seg.size_in_file};
            }
            _ => (),
        }
    }

    if layout.text_vaddr == 0 {
        return err!(MalformedExecutable, "no text PT_LOAD found in {}", exe.name);
    }
    Ok(layout)
}

// Cross-references the core's program headers to find where each piece landed
// in the (already reinjected) file. For statically linked binaries the
// eh_frame address comes from the overrides side channel.
pub fn xref_core_offsets(layout: &mut Layout, core: &CoreFile, overrides: &LayoutOverrides) {
    layout.note_offset = core.note_offset;
    layout.note_size = core.note_size;

    if !layout.dynlinked {
        if let Some(addr) = overrides.ehframe_vaddr {
            layout.ehframe_vaddr = addr;
        }
        if let Some(size) = overrides.ehframe_size {
            layout.ehframe_size = size;
        }
    }

    for seg in &core.elf.segments {
        if seg.segment_type == PT_NOTE {
            layout.note_vaddr = seg.address;
            continue;
        }
        if seg.segment_type != PT_LOAD {
            continue;
        }
        if layout.interp_vaddr != 0 && seg.contains(layout.interp_vaddr) {
            layout.interp_offset = seg.offset_of(layout.interp_vaddr);
        }
        if layout.dyn_vaddr != 0 && seg.contains(layout.dyn_vaddr) {
            layout.dyn_offset = seg.offset_of(layout.dyn_vaddr);
        }
        if layout.ehframe_vaddr != 0 && seg.contains(layout.ehframe_vaddr) {
            layout.ehframe_offset = seg.offset_of(layout.ehframe_vaddr);
        }
        if seg.address == layout.text_vaddr {
            layout.text_offset = seg.offset;
            layout.text_size = seg.size_in_memory;
        }
        if seg.address == layout.data_vaddr {
            layout.data_offset = seg.offset;
            if layout.pie {
                layout.bss_vaddr = layout.data_vaddr + layout.o_data_filesz;
            }
            layout.bss_offset = seg.offset + (layout.bss_vaddr - layout.data_vaddr);
        }
    }
}

// Walks the PT_DYNAMIC tag array out of the core's data segment. The tag set
// is closed; anything we don't recognize is skipped.
pub fn extract_dyntag_info(core: &CoreFile, layout: &Layout) -> Result<DynMeta> {
    let seg = match core.segment_at_address(layout.data_vaddr) {
        Some(s) => s,
        None => return err!(MalformedCore, "unable to find dynamic segment in core file"),
    };
    let dyn_file_offset = seg.offset + (layout.dyn_vaddr - layout.data_vaddr);
    let data = core.elf.data();
    if dyn_file_offset >= data.len() {
        return err!(MalformedCore, "dynamic segment offset 0x{:x} is outside the core", dyn_file_offset);
    }

    // Offset of a tag value inside the reconstructed core. Wrapping on
    // purpose: unrelocated values in odd binaries must not abort the walk.
    let text_off = |addr: usize| layout.text_offset.wrapping_add(addr.wrapping_sub(layout.text_vaddr));
    let data_off = |addr: usize| layout.data_offset.wrapping_add(addr.wrapping_sub(layout.data_vaddr));
    let pie_bias = if layout.pie {layout.text_vaddr} else {0};

    let mut meta = DynMeta::default();
    let entry_size = mem::size_of::<ElfDyn>();
    let mut pos = dyn_file_offset;
    while pos + entry_size <= data.len() {
        let (dt, _) = unsafe {memcpy_struct::<ElfDyn>(&data[pos..], "ElfDyn")}?;
        pos += entry_size;
        match dt.d_tag {
            DT_NULL => break,
            DT_REL => {
                meta.rel_vaddr = dt.d_val;
                meta.rel_off = text_off(dt.d_val);
            }
            DT_RELA => {
                meta.rela_vaddr = dt.d_val;
                meta.rela_off = text_off(dt.d_val);
            }
            DT_JMPREL => {
                meta.plt_rela_vaddr = dt.d_val;
                meta.plt_rela_off = text_off(dt.d_val);
            }
            DT_PLTGOT => {
                meta.got_vaddr = dt.d_val;
                meta.got_off = data_off(dt.d_val);
            }
            DT_GNU_HASH | DT_HASH => {
                meta.hash_vaddr = dt.d_val;
                meta.hash_off = text_off(dt.d_val);
            }
            DT_INIT => {
                meta.init_vaddr = dt.d_val + pie_bias;
                meta.init_off = text_off(meta.init_vaddr);
            }
            DT_FINI => {
                meta.fini_vaddr = dt.d_val + pie_bias;
                meta.fini_off = text_off(meta.fini_vaddr);
            }
            DT_SYMTAB => {
                meta.dynsym_vaddr = dt.d_val;
                meta.dynsym_off = text_off(dt.d_val);
            }
            DT_STRTAB => {
                meta.dynstr_vaddr = dt.d_val;
                meta.dynstr_off = text_off(dt.d_val);
            }
            DT_STRSZ => meta.strsz = dt.d_val,
            DT_PLTRELSZ => meta.pltrelsz = dt.d_val,
            _ => (),
        }
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use crate::{layout::*, core::*, elf::*, elf::testelf::*, notes::*, os::*, util::*};
    use std::{fs, io::Write};

    fn files_for(comm: &str, text_base: usize, text_size: usize, data_base: usize, data_size: usize) -> NtFileTable {
        let path = format!("/usr/bin/{}", comm);
        NtFileTable {
            page_size: 4096,
            entries: vec![
                NtFileEntry {start: text_base, end: text_base + text_size, page_ofs: 0, path: path.clone()},
                NtFileEntry {start: data_base, end: data_base + data_size, page_ofs: 2, path},
            ],
        }
    }

    fn exe_image(e_type: u16, text_vaddr: usize, data_vaddr: usize, with_interp: bool) -> ElfImage {
        let mut phdrs = vec![
            phdr(PT_LOAD, PF_R | PF_X, 0, text_vaddr, 0x1000, 0x1000),
            phdr(PT_LOAD, PF_R | PF_W, 0x1000, data_vaddr, 0x800, 0x1000),
            phdr(PT_DYNAMIC, PF_R | PF_W, 0x1200, data_vaddr + 0x200, 0x100, 0x100),
            phdr(PT_GNU_EH_FRAME, PF_R, 0xe00, text_vaddr + 0xe00, 0x80, 0x80),
        ];
        if with_interp {
            phdrs.push(phdr(PT_INTERP, PF_R, 0x200, text_vaddr + 0x200, 0x1c, 0x1c));
        }
        let mut bytes = image(e_type, &phdrs, &[]);
        bytes.resize(0x2000, 0u8);
        ElfImage::from_contents("exe".to_string(), bytes).unwrap()
    }

    #[test]
    fn non_pie_layout() {
        let exe = exe_image(ET_EXEC, 0x400000, 0x600000, true);
        let files = files_for("hello", 0x400000, 0x1000, 0x600000, 0x1000);
        let layout = parse_exe_phdrs(&exe, "hello", &files).unwrap();
        assert!(!layout.pie);
        assert!(layout.dynlinked);
        assert_eq!(layout.text_vaddr, 0x400000);
        assert_eq!(layout.data_vaddr, 0x600000);
        assert_eq!(layout.bss_vaddr, 0x600800);
        assert_eq!(layout.bss_size, 0x800);
        assert_eq!(layout.o_data_filesz, 0x800);
        assert_eq!(layout.dyn_vaddr, 0x600200);
        assert_eq!(layout.ehframe_vaddr, 0x400e00);
        assert_eq!(layout.interp_vaddr, 0x400200);
    }

    #[test]
    fn pie_layout_is_rebased() {
        let base = 0x555555554000usize;
        let exe = exe_image(ET_DYN, 0, 0x200000, true);
        let files = files_for("hello", base, 0x1000, base + 0x200000, 0x1000);
        let layout = parse_exe_phdrs(&exe, "hello", &files).unwrap();
        assert!(layout.pie);
        assert_eq!(layout.text_vaddr, base);
        assert_eq!(layout.data_vaddr, base + 0x200000);
        assert_eq!(layout.dyn_vaddr, base + 0x200200);
        assert_eq!(layout.ehframe_vaddr, base + 0xe00);
        // bss for PIE is resolved only once data_vaddr is known from the core.
        assert_eq!(layout.bss_vaddr, 0);
    }

    #[test]
    fn missing_text_base_is_fatal() {
        let exe = exe_image(ET_EXEC, 0x400000, 0x600000, true);
        let files = files_for("other", 0x400000, 0x1000, 0x600000, 0x1000);
        assert!(parse_exe_phdrs(&exe, "hello", &files).is_err());
    }

    fn core_on_disk(tag: &str, phdrs: &[ElfPhdr], payload_at: usize, payload: &[u8]) -> CoreFile {
        let mut bytes = image(ET_CORE, phdrs, &[]);
        bytes.resize(payload_at, 0u8);
        bytes.extend_from_slice(payload);
        let path = std::env::temp_dir().join(format!("recore_layout_test_{}_{}", tag, std::process::id()));
        let path = path.to_string_lossy().into_owned();
        fs::File::create(&path).unwrap().write_all(&bytes).unwrap();
        let core = CoreFile::load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        core
    }

    #[test]
    fn xref_and_dyntags() {
        let exe = exe_image(ET_EXEC, 0x400000, 0x600000, true);
        let files = files_for("hello", 0x400000, 0x1000, 0x600000, 0x1000);
        let mut layout = parse_exe_phdrs(&exe, "hello", &files).unwrap();

        // Build the dynamic tag array that will sit inside the core's data
        // segment at vaddr 0x600200.
        let mut dyntags: Vec<u8> = Vec::new();
        for (tag, val) in [
            (DT_RELA, 0x400400usize),
            (DT_JMPREL, 0x400500),
            (DT_PLTGOT, 0x600900),
            (DT_GNU_HASH, 0x400300),
            (DT_INIT, 0x400600),
            (DT_FINI, 0x400700),
            (DT_SYMTAB, 0x400320),
            (DT_STRTAB, 0x400380),
            (DT_STRSZ, 0x40),
            (DT_PLTRELSZ, 0x60),
            (DT_NULL, 0),
        ] {
            dyntags.write_struct(&ElfDyn {d_tag: tag, d_val: val}).unwrap();
        }

        let phdrs = [
            phdr(PT_NOTE, 0, 0x400, 0, 0x100, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x1000, 0x400000, 0x1000, 0x1000),
            phdr(PT_LOAD, PF_R | PF_W, 0x2000, 0x600000, 0x1000, 0x1000),
        ];
        let core = core_on_disk("xref", &phdrs, 0x2200, &dyntags);

        let overrides = LayoutOverrides::default();
        xref_core_offsets(&mut layout, &core, &overrides);
        assert_eq!(layout.text_offset, 0x1000);
        assert_eq!(layout.data_offset, 0x2000);
        assert_eq!(layout.dyn_offset, 0x2200);
        assert_eq!(layout.interp_offset, 0x1200);
        assert_eq!(layout.ehframe_offset, 0x1e00);
        assert_eq!(layout.bss_offset, 0x2800);
        assert_eq!(layout.note_offset, 0x400);

        let meta = extract_dyntag_info(&core, &layout).unwrap();
        assert_eq!(meta.rela_off, 0x1400);
        assert_eq!(meta.plt_rela_off, 0x1500);
        assert_eq!(meta.got_off, 0x2900);
        assert_eq!(meta.hash_off, 0x1300);
        assert_eq!(meta.init_off, 0x1600);
        assert_eq!(meta.fini_off, 0x1700);
        assert_eq!(meta.dynsym_off, 0x1320);
        assert_eq!(meta.dynstr_off, 0x1380);
        assert_eq!(meta.strsz, 0x40);
        assert_eq!(meta.pltrelsz, 0x60);
    }

    #[test]
    fn dyntags_require_data_segment() {
        let exe = exe_image(ET_EXEC, 0x400000, 0x600000, true);
        let files = files_for("hello", 0x400000, 0x1000, 0x600000, 0x1000);
        let layout = parse_exe_phdrs(&exe, "hello", &files).unwrap();
        // Core without the data segment.
        let phdrs = [
            phdr(PT_NOTE, 0, 0x400, 0, 0x100, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x1000, 0x400000, 0x1000, 0x1000),
        ];
        let core = core_on_disk("nodata", &phdrs, 0x2000, &[]);
        assert!(extract_dyntag_info(&core, &layout).is_err());
    }

    #[test]
    fn overrides_from_stripped_binary() {
        let exe = exe_image(ET_EXEC, 0x400000, 0x600000, false);
        let o = LayoutOverrides::collect(&exe);
        assert!(o.stripped);
        assert!(o.hash_size.is_none());
        assert!(o.plt_vaddr.is_none());
    }
}
