use crate::{*, error::*, core::*, notes::*, os::*, procfs::*, util::*};
use libc::pid_t;

// Identity of the dumped process, stitched together from the notes and the
// still-live procfs view.
pub struct ProcessState {
    pub pid: pid_t,
    pub exe_path: String,
    pub exe_comm: String,
    pub uid: u32,
    pub gid: u32,
    pub ppid: pid_t,
    pub exit_signal: i32,
    pub arglist: [u8; ELF_PRARGSZ],
}

impl ProcessState {
    pub fn from_notes(pid: pid_t, exe_path: String, exe_comm: String, notes: &NoteData) -> Result<ProcessState> {
        let psinfo = match &notes.prpsinfo {
            Some(p) => p,
            None => return err!(MalformedCore, "core has no NT_PRPSINFO note"),
        };
        Ok(ProcessState {
            pid,
            exe_path,
            exe_comm,
            uid: psinfo.pr_uid,
            gid: psinfo.pr_gid,
            ppid: psinfo.pr_ppid,
            exit_signal: notes.prstatus().pr_info.si_signo,
            arglist: psinfo.pr_psargs,
        })
    }
}

// A file-backed shared object mapping, one record per mapped region of the
// library. The injected flag is an input to the section synthesizer; the
// heuristics deciding it live outside this pipeline.
pub struct LibraryRecord {
    pub path: String,
    pub name: String,
    pub addr: usize,
    pub size: usize,
    pub flags: u32, // PF_*
    pub offset: usize, // in the reconstructed core image
    pub injected: bool,
}

pub fn collect_libraries(files: &NtFileTable, maps: &MemMapsInfo, core: &CoreFile) -> Vec<LibraryRecord> {
    let mut res: Vec<LibraryRecord> = Vec::new();
    for entry in &files.entries {
        let name = entry.basename();
        if !name.contains(".so") {
            continue;
        }
        let flags = match maps.map_at_base(entry.start) {
            Some(m) => m.perms.pf_flags(),
            None => {
                log_line!("warning: library mapping 0x{:x} ({}) not present in live maps", entry.start, name);
                0
            }
        };
        let offset = match core.segment_at_address(entry.start) {
            Some(seg) => seg.offset,
            None => 0,
        };
        res.push(LibraryRecord {
            path: entry.path.clone(),
            name: name.to_string(),
            addr: entry.start,
            size: entry.size(),
            flags,
            offset,
            injected: false,
        });
    }
    res
}

#[cfg(test)]
mod tests {
    use crate::{process_info::*, notes::*, core::*, elf::testelf::*, os::*, procfs::*};
    use std::{fs, io::Write};

    #[test]
    fn library_collection() {
        let phdrs = [
            phdr(PT_NOTE, 0, 0x400, 0, 0x10, 0),
            phdr(PT_LOAD, PF_R | PF_X, 0x1000, 0x7f0000000000, 0x1000, 0x1000),
            phdr(PT_LOAD, PF_R | PF_W, 0x2000, 0x7f0000200000, 0x1000, 0x1000),
        ];
        let mut bytes = image(ET_CORE, &phdrs, &[]);
        bytes.resize(0x3000, 0u8);
        let path = std::env::temp_dir().join(format!("recore_libs_test_{}", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        fs::File::create(&path).unwrap().write_all(&bytes).unwrap();
        let core = CoreFile::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        let files = NtFileTable {
            page_size: 4096,
            entries: vec![
                NtFileEntry {start: 0x400000, end: 0x401000, page_ofs: 0, path: "/usr/bin/hello".to_string()},
                NtFileEntry {start: 0x7f0000000000, end: 0x7f0000001000, page_ofs: 0, path: "/usr/lib/libc.so.6".to_string()},
                NtFileEntry {start: 0x7f0000200000, end: 0x7f0000201000, page_ofs: 0x1ff, path: "/usr/lib/libc.so.6".to_string()},
                NtFileEntry {start: 0x7f0000400000, end: 0x7f0000401000, page_ofs: 0, path: "/usr/share/fonts/f.ttf".to_string()},
            ],
        };
        let maps = MemMapsInfo {maps: vec![
            parse_maps_line("7f0000000000-7f0000001000 r-xp 00000000 08:01 1 /usr/lib/libc.so.6").unwrap(),
            parse_maps_line("7f0000200000-7f0000201000 rw-p 001ff000 08:01 1 /usr/lib/libc.so.6").unwrap(),
        ]};

        let libs = collect_libraries(&files, &maps, &core);
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[0].name, "libc.so.6");
        assert_eq!(libs[0].flags, PF_R | PF_X);
        assert_eq!(libs[0].offset, 0x1000);
        assert_eq!(libs[1].flags, PF_R | PF_W);
        assert_eq!(libs[1].offset, 0x2000);
        assert!(!libs[0].injected);
    }
}
