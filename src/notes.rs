use crate::{*, error::*, core::*, elf::*, os::*, util::*};
use std::{io::{self, BufRead}, mem, str};

pub struct ThreadState {
    pub prstatus: elf_prstatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NtFileEntry {
    pub start: usize,
    pub end: usize,
    pub page_ofs: usize,
    pub path: String,
}

impl NtFileEntry {
    pub fn size(&self) -> usize { self.end - self.start }
    pub fn basename(&self) -> &str { basename(&self.path) }
}

// The kernel's NT_FILE note: packed (start, end, file_ofs) triples followed
// by the same count of NUL-terminated paths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NtFileTable {
    pub page_size: usize,
    pub entries: Vec<NtFileEntry>,
}

impl NtFileTable {
    pub fn decode(desc: &[u8]) -> Result<NtFileTable> {
        let mut reader = io::Cursor::new(desc);
        let count = reader.read_usize()?;
        let page_size = reader.read_usize()?;
        if count > desc.len() / (3 * mem::size_of::<usize>()) {
            return err!(MalformedCore, "NT_FILE count {} does not fit in {} descriptor bytes", count, desc.len());
        }
        let mut entries: Vec<NtFileEntry> = Vec::with_capacity(count);
        for _ in 0..count {
            let start = reader.read_usize()?;
            let end = reader.read_usize()?;
            if end < start {
                return err!(MalformedCore, "inverted address range in NT_FILE");
            }
            let page_ofs = reader.read_usize()?;
            entries.push(NtFileEntry {start, end, page_ofs, path: String::new()});
        }
        for i in 0..count {
            let mut filename: Vec<u8> = Vec::new();
            reader.read_until(b'\0', &mut filename)?;
            if !filename.ends_with(b"\0") {
                return err!(MalformedCore, "non-null-terminated filename in NT_FILE");
            }
            filename.pop();
            entries[i].path = str::from_utf8(&filename)?.to_string();
        }
        Ok(NtFileTable {page_size, entries})
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_usize(self.entries.len()).unwrap();
        buf.write_usize(self.page_size).unwrap();
        for e in &self.entries {
            buf.write_usize(e.start).unwrap();
            buf.write_usize(e.end).unwrap();
            buf.write_usize(e.page_ofs).unwrap();
        }
        for e in &self.entries {
            buf.extend_from_slice(e.path.as_bytes());
            buf.push(b'\0');
        }
        buf
    }

    pub fn entry_at_base(&self, addr: usize) -> Option<&NtFileEntry> {
        self.entries.iter().find(|e| e.start == addr)
    }

    // The executable's lowest file-backed mapping, i.e. the text base.
    pub fn text_base(&self, comm: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.basename() == comm).map(|e| e.start)
    }

    pub fn text_size(&self, comm: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.basename() == comm).map(|e| e.size())
    }

    // The mapping right after the text one, when it belongs to the same file.
    // That adjacency is how the kernel lays out the exe's data mapping.
    pub fn data_base(&self, comm: &str) -> Option<usize> {
        self.data_entry(comm).map(|e| e.start)
    }

    pub fn data_size(&self, comm: &str) -> Option<usize> {
        self.data_entry(comm).map(|e| e.size())
    }

    fn data_entry(&self, comm: &str) -> Option<&NtFileEntry> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.basename() == comm {
                return self.entries.get(i + 1).filter(|next| next.basename() == comm);
            }
        }
        None
    }
}

// Everything recovered from the core's note segment.
pub struct NoteData {
    pub threads: Vec<ThreadState>, // thread 0 first, i.e. the group leader
    pub prpsinfo: Option<elf_prpsinfo>,
    pub siginfo: Option<libc::siginfo_t>,
    pub fpregs: Option<libc::user_fpregs_struct>,
    pub auxv: Vec<u8>,
    pub files: Option<NtFileTable>,
}

impl NoteData {
    pub fn prstatus(&self) -> &elf_prstatus {
        &self.threads[0].prstatus
    }
}

pub fn parse_notes_area(core: &CoreFile) -> Result<NoteData> {
    let mut res = NoteData {threads: Vec::new(), prpsinfo: None, siginfo: None, fpregs: None, auxv: Vec::new(), files: None};
    let mut data = core.note_data();
    while !data.is_empty() {
        let note;
        (note, data) = parse_elf_note(data)?;
        match note.type_ {
            NT_PRSTATUS => {
                if note.desc.len() != mem::size_of::<elf_prstatus>() {
                    log_line!("warning: NT_PRSTATUS note has wrong size {} (expected {}), skipping", note.desc.len(), mem::size_of::<elf_prstatus>());
                    continue;
                }
                let (prstatus, _) = unsafe {memcpy_struct::<elf_prstatus>(note.desc, "NT_PRSTATUS")}?;
                res.threads.push(ThreadState {prstatus});
            }
            NT_PRPSINFO => {
                if note.desc.len() != mem::size_of::<elf_prpsinfo>() {
                    log_line!("warning: NT_PRPSINFO note has wrong size {} (expected {}), skipping", note.desc.len(), mem::size_of::<elf_prpsinfo>());
                    continue;
                }
                let (prpsinfo, _) = unsafe {memcpy_struct::<elf_prpsinfo>(note.desc, "NT_PRPSINFO")}?;
                res.prpsinfo = Some(prpsinfo);
            }
            NT_SIGINFO => {
                if note.desc.len() != mem::size_of::<libc::siginfo_t>() {
                    log_line!("warning: NT_SIGINFO note has wrong size {} (expected {}), skipping", note.desc.len(), mem::size_of::<libc::siginfo_t>());
                    continue;
                }
                let (siginfo, _) = unsafe {memcpy_struct::<libc::siginfo_t>(note.desc, "NT_SIGINFO")}?;
                res.siginfo = Some(siginfo);
            }
            NT_PRFPREG => {
                if note.desc.len() != mem::size_of::<libc::user_fpregs_struct>() {
                    log_line!("warning: NT_PRFPREG note has wrong size {} (expected {}), skipping", note.desc.len(), mem::size_of::<libc::user_fpregs_struct>());
                    continue;
                }
                let (fpregs, _) = unsafe {memcpy_struct::<libc::user_fpregs_struct>(note.desc, "NT_PRFPREG")}?;
                res.fpregs = Some(fpregs);
            }
            NT_AUXV => {
                res.auxv = note.desc.to_vec();
            }
            NT_FILE => {
                if res.files.is_some() {
                    return err!(MalformedCore, "multiple NT_FILE notes in core");
                }
                res.files = Some(NtFileTable::decode(note.desc)?);
            }
            _ => (),
        }
    }

    if res.threads.is_empty() {
        return err!(MalformedCore, "core has no NT_PRSTATUS note");
    }
    Ok(res)
}
