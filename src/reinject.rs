use crate::{*, error::*, elf::*, os::*, procfs::*, util::*};
use std::{fs, fs::File, io::Write, mem, os::unix::fs::PermissionsExt};
use libc::pid_t;
use memmap2::MmapOptions;

// The kernel writes only the first page of each executable text segment into
// the core. These transforms replace that stub with the full text image
// captured from the still-live process, shifting every later PT_LOAD by the
// grown amount. Each rewrite goes to a temp sibling that replaces the
// original by rename, so a crash mid-way leaves the previous snapshot intact.

pub const TEXT_STUB_SIZE: usize = 4096;

fn pick_temp_name(path: &str) -> String {
    let mut tmp = format!("{}.tmp_merge", path);
    let mut i = 0;
    while fs::metadata(&tmp).is_ok() {
        i += 1;
        tmp = format!("{}.tmp_merge.{}", path, i);
    }
    tmp
}

fn replace_with(path: &str, tmp: &str) -> Result<()> {
    fs::rename(tmp, path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    Ok(())
}

// Merges the executable's full text image into the core at the PT_LOAD that
// covers text_vaddr. The following PT_LOAD is the data segment; it and every
// later PT_LOAD move forward by image.len() - 4096.
pub fn merge_exe_text_into_core(path: &str, text_vaddr: usize, text_image: &[u8]) -> Result<()> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len() as usize;
    let mut mem_map = unsafe {MmapOptions::new().map_copy(&file)}?;
    let delta = text_image.len().wrapping_sub(TEXT_STUB_SIZE);

    let (header, _) = unsafe {memcpy_struct::<ElfEhdr>(&mem_map[..], "ElfEhdr")}?;
    let phoff = header.e_phoff as usize;
    let phentsize = header.e_phentsize as usize;

    let mut text_offset = 0usize;
    let mut next_offset = 0usize;
    let mut found_text = false;
    let mut data_index = usize::MAX;
    for i in 0..header.e_phnum as usize {
        let pos = phoff + i * phentsize;
        let (mut phdr, _) = unsafe {memcpy_struct::<ElfPhdr>(&mem_map[pos..], "ElfPhdr")}?;
        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        if !found_text && text_vaddr >= vaddr && text_vaddr < vaddr + memsz {
            text_offset = phdr.p_offset as usize;
            found_text = true;
            data_index = i + 1;
            phdr.p_filesz = phdr.p_memsz;
            mem_map[pos..pos + mem::size_of::<ElfPhdr>()].copy_from_slice(struct_bytes(&phdr));
            // The data segment follows the text; its pre-shift offset is the
            // resume point for the copy below.
            if data_index >= header.e_phnum as usize {
                return err!(MalformedCore, "text segment is the last program header in {}", path);
            }
            let (mut next, _) = unsafe {memcpy_struct::<ElfPhdr>(&mem_map[phoff + data_index * phentsize..], "ElfPhdr")}?;
            next_offset = next.p_offset as usize;
            next.p_offset = (next.p_offset as usize).wrapping_add(delta) as _;
            let npos = phoff + data_index * phentsize;
            mem_map[npos..npos + mem::size_of::<ElfPhdr>()].copy_from_slice(struct_bytes(&next));
        } else if found_text && i != data_index {
            phdr.p_offset = (phdr.p_offset as usize).wrapping_add(delta) as _;
            mem_map[pos..pos + mem::size_of::<ElfPhdr>()].copy_from_slice(struct_bytes(&phdr));
        }
    }
    if !found_text {
        return err!(ProcessState, "could not find text address 0x{:x} in the core's program headers", text_vaddr);
    }

    let tmp = pick_temp_name(path);
    let mut out = File::create(&tmp)?;
    out.write_all(&mem_map[..text_offset])?;
    out.write_all(text_image)?;
    out.write_all(&mem_map[next_offset..file_len])?;
    out.sync_all()?;
    drop(out);
    drop(mem_map);

    replace_with(path, &tmp)
}

// Same transform for one shared library's text, keyed by exact base address.
// Assumes a data PT_LOAD follows the text one; a library whose text is the
// final program header is rejected rather than read past the table.
fn merge_text_image(path: &str, text_addr: usize, text_image: &[u8]) -> Result<()> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len() as usize;
    let mut mem_map = unsafe {MmapOptions::new().map_copy(&file)}?;
    let delta = text_image.len().wrapping_sub(TEXT_STUB_SIZE);

    let (header, _) = unsafe {memcpy_struct::<ElfEhdr>(&mem_map[..], "ElfEhdr")}?;
    let phoff = header.e_phoff as usize;
    let phentsize = header.e_phentsize as usize;

    let mut text_offset = 0usize;
    let mut next_offset = 0usize;
    let mut found_text = false;
    for i in 0..header.e_phnum as usize {
        let pos = phoff + i * phentsize;
        let (mut phdr, _) = unsafe {memcpy_struct::<ElfPhdr>(&mem_map[pos..], "ElfPhdr")}?;
        if !found_text && phdr.p_vaddr as usize == text_addr {
            if i + 1 >= header.e_phnum as usize {
                return err!(ProcessState, "library text at 0x{:x} is the last program header", text_addr);
            }
            text_offset = phdr.p_offset as usize;
            let (next, _) = unsafe {memcpy_struct::<ElfPhdr>(&mem_map[phoff + (i + 1) * phentsize..], "ElfPhdr")}?;
            next_offset = next.p_offset as usize;
            phdr.p_filesz = phdr.p_memsz;
            mem_map[pos..pos + mem::size_of::<ElfPhdr>()].copy_from_slice(struct_bytes(&phdr));
            found_text = true;
        } else if found_text && phdr.p_type == PT_LOAD {
            phdr.p_offset = (phdr.p_offset as usize).wrapping_add(delta) as _;
            mem_map[pos..pos + mem::size_of::<ElfPhdr>()].copy_from_slice(struct_bytes(&phdr));
        }
    }
    if !found_text {
        return err!(ProcessState, "could not find library text address 0x{:x} in the core", text_addr);
    }

    let tmp = pick_temp_name(path);
    let mut out = File::create(&tmp)?;
    out.write_all(&mem_map[..text_offset])?;
    out.write_all(text_image)?;
    out.write_all(&mem_map[next_offset..file_len])?;
    out.sync_all()?;
    drop(out);
    drop(mem_map);

    replace_with(path, &tmp)
}

// Captures and merges the text of every mapped shared library, one at a time
// against the current file. A large process can hold hundreds of megabytes of
// library text, so each image is dropped the moment its merge is done.
// Per-library failures are logged and skipped; the result is advisory.
pub fn merge_shlib_texts_into_core(path: &str, pid: pid_t, maps: &MemMapsInfo) -> Result<()> {
    for map in &maps.maps {
        if map.kind != MapKind::Shlib || !map.perms.contains(MemMapPermissions::EXECUTE) {
            continue;
        }
        let image = match read_process_segment(pid, map.start, map.len) {
            Ok(img) => img,
            Err(e) => {
                log_line!("warning: could not capture library text at 0x{:x}: {}", map.start, e);
                continue;
            }
        };
        if let Err(e) = merge_text_image(path, map.start, &image[..]) {
            log_line!("warning: could not merge library text at 0x{:x}: {}", map.start, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{reinject::*, core::*, elf::testelf::*, os::*};
    use std::{fs, io::Write};

    fn temp_core(tag: &str, bytes: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!("recore_reinject_test_{}_{}", tag, std::process::id()));
        let path = path.to_string_lossy().into_owned();
        fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    // Core with a 4096-byte text stub followed by data and stack segments.
    fn stub_core(text_vaddr: usize) -> Vec<u8> {
        let phdrs = [
            phdr(PT_NOTE, 0, 0x1000, 0, 0x200, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x2000, text_vaddr, TEXT_STUB_SIZE, 0x3000),
            phdr(PT_LOAD, PF_R | PF_W, 0x3000, 0x600000, 0x1000, 0x1000),
            phdr(PT_LOAD, PF_R | PF_W, 0x4000, 0x7ffc00000000, 0x1000, 0x1000),
        ];
        let mut bytes = image(ET_CORE, &phdrs, &[]);
        bytes.resize(0x2000, 0u8);
        bytes.extend_from_slice(&vec![0xAAu8; TEXT_STUB_SIZE]); // the stub
        bytes.extend_from_slice(&vec![0xBBu8; 0x1000]); // data
        bytes.extend_from_slice(&vec![0xCCu8; 0x1000]); // stack
        bytes
    }

    #[test]
    fn exe_text_merge_shifts_offsets() {
        let text_vaddr = 0x400000usize;
        let path = temp_core("exe", &stub_core(text_vaddr));
        let image_bytes = vec![0x90u8; 0x3000]; // full text, 3 pages

        merge_exe_text_into_core(&path, text_vaddr, &image_bytes).unwrap();

        let core = CoreFile::load(&path).unwrap();
        let delta = 0x3000 - TEXT_STUB_SIZE;
        let text = core.segment_at_address(text_vaddr).unwrap();
        assert_eq!(text.size_in_file, text.size_in_memory);
        assert_eq!(text.offset, 0x2000);
        let data = core.segment_at_address(0x600000).unwrap();
        assert_eq!(data.offset, 0x3000 + delta);
        let stack = core.segment_at_address(0x7ffc00000000).unwrap();
        assert_eq!(stack.offset, 0x4000 + delta);

        // The file contents moved with the offsets.
        let bytes = core.elf.data();
        assert!(bytes[0x2000..0x5000].iter().all(|&b| b == 0x90));
        assert!(bytes[data.offset..data.offset + 0x1000].iter().all(|&b| b == 0xBB));
        assert!(bytes[stack.offset..stack.offset + 0x1000].iter().all(|&b| b == 0xCC));

        drop(core);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn shlib_text_merge_by_exact_base() {
        let lib_base = 0x7f0000000000usize;
        let phdrs = [
            phdr(PT_NOTE, 0, 0x1000, 0, 0x200, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x2000, lib_base, TEXT_STUB_SIZE, 0x2000),
            phdr(PT_LOAD, PF_R | PF_W, 0x3000, lib_base + 0x200000, 0x1000, 0x1000),
        ];
        let mut bytes = image(ET_CORE, &phdrs, &[]);
        bytes.resize(0x2000, 0u8);
        bytes.extend_from_slice(&vec![0x11u8; TEXT_STUB_SIZE]);
        bytes.extend_from_slice(&vec![0x22u8; 0x1000]);
        let path = temp_core("shlib", &bytes);

        merge_text_image(&path, lib_base, &vec![0x33u8; 0x2000]).unwrap();

        let core = CoreFile::load(&path).unwrap();
        let text = core.segment_at_address(lib_base).unwrap();
        assert_eq!(text.size_in_file, 0x2000);
        let data = core.segment_at_address(lib_base + 0x200000).unwrap();
        assert_eq!(data.offset, 0x3000 + 0x1000);
        assert!(core.elf.data()[0x2000..0x4000].iter().all(|&b| b == 0x33));
        assert!(core.elf.data()[data.offset..data.offset + 0x1000].iter().all(|&b| b == 0x22));

        drop(core);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn text_as_last_phdr_is_rejected() {
        let lib_base = 0x7f0000000000usize;
        let phdrs = [
            phdr(PT_NOTE, 0, 0x1000, 0, 0x200, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x2000, lib_base, TEXT_STUB_SIZE, 0x2000),
        ];
        let mut bytes = image(ET_CORE, &phdrs, &[]);
        bytes.resize(0x2000, 0u8);
        bytes.extend_from_slice(&vec![0x11u8; TEXT_STUB_SIZE]);
        let path = temp_core("last", &bytes);
        assert!(merge_text_image(&path, lib_base, &vec![0u8; 0x2000]).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_text_is_an_error() {
        let path = temp_core("missing", &stub_core(0x400000));
        assert!(merge_exe_text_into_core(&path, 0xdead0000, &vec![0u8; 0x2000]).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn temp_names_do_not_collide() {
        let path = temp_core("names", b"x");
        let a = pick_temp_name(&path);
        fs::File::create(&a).unwrap();
        let b = pick_temp_name(&path);
        assert_ne!(a, b);
        fs::remove_file(&a).unwrap();
        fs::remove_file(&path).unwrap();
    }
}
