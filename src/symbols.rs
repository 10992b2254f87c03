use crate::{*, error::*, os::*, sections::*, util::*};
use std::{fs::OpenOptions, io::{Seek, SeekFrom, Write}, mem};
use gimli::{BaseAddresses, CieOrFde, CommonInformationEntry, EhFrame, EndianSlice, LittleEndian, UnwindOffset, UnwindSection};
use memmap2::MmapOptions;

type SliceType<'a> = EndianSlice<'a, LittleEndian>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FuncEntry {
    pub addr: usize,
    pub size: usize,
}

fn find_cie_in<'a>(offset: u64, cies: &Vec<CommonInformationEntry<SliceType<'a>>>) -> gimli::read::Result<CommonInformationEntry<SliceType<'a>>> {
    let idx = cies.partition_point(|cie| cie.offset() < offset as usize);
    if idx < cies.len() && cies[idx].offset() == offset as usize {
        Ok(cies[idx].clone())
    } else {
        Err(gimli::read::Error::NoEntryAtGivenOffset)
    }
}

// Enumerates every FDE in the .eh_frame bytes and reports one (address, size)
// per function covered. Addresses come back sorted and deduplicated.
pub fn enumerate_functions(eh_frame_data: &[u8], eh_frame_addr: usize, text_addr: usize) -> Result<Vec<FuncEntry>> {
    let section = EhFrame::new(eh_frame_data, LittleEndian);
    let bases = BaseAddresses::default().set_eh_frame(eh_frame_addr as u64).set_text(text_addr as u64);

    let mut cies: Vec<CommonInformationEntry<SliceType>> = Vec::new();
    let mut funcs: Vec<FuncEntry> = Vec::new();
    let mut entries_iter = section.entries(&bases);
    while let Some(entry) = entries_iter.next()? {
        match entry {
            CieOrFde::Cie(cie) => cies.push(cie),
            CieOrFde::Fde(fde) => {
                let fde = fde.parse(|_, _, offset| find_cie_in(UnwindOffset::into(offset) as u64, &cies))?;
                funcs.push(FuncEntry {addr: fde.initial_address() as usize, size: fde.len() as usize});
            }
        }
    }

    funcs.sort_unstable_by_key(|f| f.addr);
    funcs.dedup_by_key(|f| f.addr);
    Ok(funcs)
}

// Builds the symbol records and the string table they index. Each function
// becomes a global FUNC symbol named after its address, attached to .text.
pub fn build_symtab(funcs: &[FuncEntry], text_shndx: usize) -> (Vec<ElfSym>, Vec<u8>) {
    let mut symtab: Vec<ElfSym> = Vec::with_capacity(funcs.len());
    let mut strtab: Vec<u8> = Vec::new();
    for f in funcs {
        let mut sym: ElfSym = unsafe {mem::zeroed()};
        sym.st_name = strtab.len() as u32;
        sym.st_info = (STB_GLOBAL << 4) | (STT_FUNC & 0xf);
        sym.st_other = 0;
        sym.st_shndx = text_shndx as u16;
        sym.st_value = f.addr as _;
        sym.st_size = f.size as _;
        symtab.push(sym);
        strtab.extend_from_slice(format!("sub_{:x}", f.addr).as_bytes());
        strtab.push(b'\0');
    }
    (symtab, strtab)
}

// Walks the freshly written output's .eh_frame, appends .symtab and .strtab
// payloads at the tail and patches their headers into place. Also resizes
// .got.plt now that the dynamic symbol count is known. A failed FDE walk
// degrades to an empty symbol table; the output stays valid.
pub fn build_local_symtab_and_finalize(outfile: &str, table: &SectionTable) -> Result<usize> {
    let text_addr = table.headers[table.text_index].sh_addr as usize;

    let mut file = OpenOptions::new().read(true).write(true).open(outfile)?;
    let file_len = file.metadata()?.len() as usize;

    let funcs = match find_named(table, ".eh_frame") {
        Err(_) => {
            log_line!("warning: no .eh_frame section was synthesized, emitting no local symbols");
            Vec::new()
        }
        Ok(eh_index) => {
            let eh_shdr = &table.headers[eh_index];
            let (eh_offset, eh_size) = (eh_shdr.sh_offset as usize, eh_shdr.sh_size as usize);
            let eh_addr = eh_shdr.sh_addr as usize;
            if eh_offset.saturating_add(eh_size) > file_len {
                return err!(Internal, ".eh_frame section [{}, {}) lies outside the file", eh_offset, eh_offset + eh_size);
            }
            let map = unsafe {MmapOptions::new().map_copy_read_only(&file)}?;
            match enumerate_functions(&map[eh_offset..eh_offset + eh_size], eh_addr, text_addr) {
                Ok(f) => f,
                Err(e) => {
                    log_line!("warning: eh_frame function enumeration failed: {}, emitting no local symbols", e);
                    Vec::new()
                }
            }
        }
    };
    log_line!("info: recovered {} local functions from .eh_frame", funcs.len());

    let (symtab, strtab) = build_symtab(&funcs, table.text_index);

    let symtab_offset = file.seek(SeekFrom::End(0))? as usize;
    for sym in &symtab {
        file.write_struct(sym)?;
    }
    let strtab_offset = symtab_offset + symtab.len() * mem::size_of::<ElfSym>();
    file.write_all(&strtab)?;
    file.sync_all()?;

    // Patch the placeholder headers in the file.
    let mut map = unsafe {MmapOptions::new().map_mut(&file)}?;
    let (header, _) = unsafe {memcpy_struct::<ElfEhdr>(&map[..], "ElfEhdr")}?;
    let shoff = header.e_shoff as usize;
    let entsize = mem::size_of::<ElfShdr>();

    let mut patch = |idx: usize, f: &mut dyn FnMut(&mut ElfShdr)| -> Result<()> {
        let pos = shoff + idx * entsize;
        let (mut shdr, _) = unsafe {memcpy_struct::<ElfShdr>(&map[pos..], "ElfShdr")}?;
        f(&mut shdr);
        map[pos..pos + entsize].copy_from_slice(struct_bytes(&shdr));
        Ok(())
    };

    patch(table.symtab_index, &mut |s| {
        s.sh_offset = symtab_offset as _;
        s.sh_size = (symtab.len() * mem::size_of::<ElfSym>()) as _;
    })?;
    patch(table.strtab_index, &mut |s| {
        s.sh_offset = strtab_offset as _;
        s.sh_size = strtab.len() as _;
    })?;

    // The GOT holds three reserved entries plus one slot per dynamic symbol.
    if table.dynsym_index != 0 {
        let dsym_size = table.headers[table.dynsym_index].sh_size as usize;
        let dsymcount = dsym_size / mem::size_of::<ElfSym>();
        if let Ok(got_index) = find_named(table, ".got.plt") {
            patch(got_index, &mut |s| {
                s.sh_size = ((dsymcount + 3) * mem::size_of::<usize>()) as _;
            })?;
        }
    }

    drop(patch);
    map.flush()?;
    Ok(symtab.len())
}

fn find_named(table: &SectionTable, name: &str) -> Result<usize> {
    for i in 0..table.headers.len() {
        if section_name(table, i) == name {
            return Ok(i);
        }
    }
    err!(NoSection, "no {} section in the synthesized table", name)
}

#[cfg(test)]
mod tests {
    use crate::{symbols::*, os::*, util::*};

    // A hand-assembled .eh_frame: one CIE and two FDEs with absolute
    // 8-byte address encoding, terminated by a zero length entry.
    fn synthetic_eh_frame(funcs: &[(u64, u64)]) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        // CIE: length, id 0, version 1, aug "", code align 1, data align -8 (0x78), ra reg 16.
        let cie_body: &[u8] = &[1, 0, 1, 0x78, 16, 0, 0, 0];
        buf.write_u32((cie_body.len() + 4) as u32).unwrap(); // length
        buf.write_u32(0).unwrap(); // CIE id
        buf.extend_from_slice(cie_body);
        for &(addr, size) in funcs {
            let fde_start = buf.len();
            buf.write_u32(4 + 8 + 8 + 4).unwrap(); // length: ciepointer + pc begin + pc range + padding
            buf.write_u32((fde_start + 4) as u32).unwrap(); // CIE pointer, offset back to CIE
            buf.write_u64(addr).unwrap();
            buf.write_u64(size).unwrap();
            buf.extend_from_slice(&[0, 0, 0, 0]);
        }
        buf.write_u32(0).unwrap(); // terminator
        buf
    }

    #[test]
    fn fde_enumeration() {
        let data = synthetic_eh_frame(&[(0x401000, 0x80), (0x401100, 0x40)]);
        let funcs = enumerate_functions(&data, 0x400e80, 0x401000).unwrap();
        assert_eq!(funcs, [FuncEntry {addr: 0x401000, size: 0x80}, FuncEntry {addr: 0x401100, size: 0x40}]);
    }

    #[test]
    fn fde_enumeration_dedups_and_sorts() {
        let data = synthetic_eh_frame(&[(0x401100, 0x40), (0x401000, 0x80), (0x401000, 0x80)]);
        let funcs = enumerate_functions(&data, 0x400e80, 0x401000).unwrap();
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[0].addr, 0x401000);
        assert_eq!(funcs[1].addr, 0x401100);
    }

    #[test]
    fn garbage_eh_frame_is_an_error() {
        let data = vec![0xffu8; 64];
        assert!(enumerate_functions(&data, 0, 0).is_err());
    }

    #[test]
    fn symtab_records() {
        let funcs = [FuncEntry {addr: 0x401000, size: 0x80}, FuncEntry {addr: 0x4011a0, size: 0x40}];
        let (symtab, strtab) = build_symtab(&funcs, 10);
        assert_eq!(symtab.len(), 2);
        assert_eq!(symtab[0].st_value as usize, 0x401000);
        assert_eq!(symtab[0].st_size as usize, 0x80);
        assert_eq!(symtab[0].st_info, (STB_GLOBAL << 4) | STT_FUNC);
        assert_eq!(symtab[0].st_shndx, 10);
        assert_eq!(symtab[1].st_shndx, 10);

        // Names index into the string table at st_name.
        let name_at = |off: usize| {
            let rest = &strtab[off..];
            let len = rest.iter().position(|&c| c == b'\0').unwrap();
            std::str::from_utf8(&rest[..len]).unwrap().to_string()
        };
        assert_eq!(name_at(symtab[0].st_name as usize), "sub_401000");
        assert_eq!(name_at(symtab[1].st_name as usize), "sub_4011a0");
    }

    #[test]
    fn empty_function_list_builds_empty_tables() {
        let (symtab, strtab) = build_symtab(&[], 3);
        assert!(symtab.is_empty());
        assert!(strtab.is_empty());
    }
}
