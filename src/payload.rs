use crate::{*, error::*, core::*, layout::*, notes::*, os::*, process_info::*, procfs::*, util::*};
use std::{fs, fs::File, io::Write, mem, os::unix::fs::PermissionsExt};

// Offsets of everything appended after the core body, in append order.
// stb_offset is where the section header table will start.
#[derive(Clone, Copy, Default, Debug)]
pub struct PayloadLayout {
    pub prstatus_offset: usize,
    pub prstatus_size: usize,
    pub fdinfo_offset: usize,
    pub fdinfo_size: usize,
    pub siginfo_offset: usize,
    pub siginfo_size: usize,
    pub auxv_offset: usize,
    pub auxv_size: usize,
    pub exepath_offset: usize,
    pub exepath_size: usize,
    pub personality_offset: usize,
    pub personality_size: usize,
    pub arglist_offset: usize,
    pub arglist_size: usize,
    pub stb_offset: usize,
}

impl fd_info {
    pub fn from_link(link: &FdLink) -> fd_info {
        let mut rec = fd_info::default();
        rec.fd = link.fd;
        let bytes = link.path.as_bytes();
        let n = bytes.len().min(FD_PATH_MAX - 1);
        rec.path[..n].copy_from_slice(&bytes[..n]);
        rec.net = link.net;
        rec.src_addr = link.socket.src_addr;
        rec.dst_addr = link.socket.dst_addr;
        rec.src_port = link.socket.src_port;
        rec.dst_port = link.socket.dst_port;
        rec
    }
}

// Creates the output file: the reconstructed core body first, then the
// auxiliary payloads in this exact order. The section synthesizer and the
// symbol reconstructor both key off the returned offsets.
pub fn write_payloads(outfile: &str, core: &CoreFile, notes: &NoteData, fds: &[FdLink], pstate: &ProcessState, personality: Personality) -> Result<PayloadLayout> {
    let core_size = core.size();
    let mut layout = PayloadLayout::default();

    layout.prstatus_offset = core_size;
    layout.prstatus_size = notes.threads.len() * mem::size_of::<elf_prstatus>();
    layout.fdinfo_offset = layout.prstatus_offset + layout.prstatus_size;
    layout.fdinfo_size = fds.len() * mem::size_of::<fd_info>();
    layout.siginfo_offset = layout.fdinfo_offset + layout.fdinfo_size;
    layout.siginfo_size = mem::size_of::<libc::siginfo_t>();
    layout.auxv_offset = layout.siginfo_offset + layout.siginfo_size;
    layout.auxv_size = notes.auxv.len();
    layout.exepath_offset = layout.auxv_offset + layout.auxv_size;
    layout.exepath_size = pstate.exe_path.len() + 1;
    layout.personality_offset = layout.exepath_offset + layout.exepath_size;
    layout.personality_size = mem::size_of::<elf_stat>();
    layout.arglist_offset = layout.personality_offset + layout.personality_size;
    layout.arglist_size = ELF_PRARGSZ;
    layout.stb_offset = layout.arglist_offset + layout.arglist_size;

    let mut out = File::create(outfile)?;
    fs::set_permissions(outfile, fs::Permissions::from_mode(0o770))?;

    out.write_all(core.elf.data())?;

    for thread in &notes.threads {
        out.write_struct(&thread.prstatus)?;
    }

    for link in fds {
        out.write_struct(&fd_info::from_link(link))?;
    }

    match &notes.siginfo {
        Some(si) => out.write_struct(si)?,
        None => {
            log_line!("warning: core has no NT_SIGINFO note, writing zeroes");
            let zeroed: libc::siginfo_t = unsafe {mem::zeroed()};
            out.write_struct(&zeroed)?;
        }
    }

    out.write_all(&notes.auxv)?;

    out.write_all(pstate.exe_path.as_bytes())?;
    out.write_u8(0)?;

    out.write_struct(&elf_stat {personality: personality.bits()})?;

    out.write_all(&pstate.arglist)?;

    out.sync_all()?;
    debug_assert_eq!(out.metadata()?.len() as usize, layout.stb_offset);
    Ok(layout)
}

pub fn detect_personality(layout: &Layout, overrides: &LayoutOverrides, heuristics: bool) -> Personality {
    let mut p = Personality::empty();
    if !layout.dynlinked {
        p.insert(Personality::STATIC);
    }
    if layout.pie {
        p.insert(Personality::PIE);
    }
    if heuristics {
        p.insert(Personality::HEURISTICS);
    }
    if overrides.stripped {
        p.insert(Personality::STRIPPED_SHDRS);
    }
    p
}
