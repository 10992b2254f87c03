use crate::{*, error::*, os::*, util::*};
use std::{fs, fs::File, io::{BufRead, BufReader}, os::fd::AsRawFd, str::FromStr};
use bitflags::*;
use libc::{pid_t, c_void};
use memmap2::MmapMut;

bitflags! { pub struct MemMapPermissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
}}

impl MemMapPermissions {
    pub fn pf_flags(&self) -> u32 {
        let mut f = 0;
        if self.contains(MemMapPermissions::READ) {f |= PF_R;}
        if self.contains(MemMapPermissions::WRITE) {f |= PF_W;}
        if self.contains(MemMapPermissions::EXECUTE) {f |= PF_X;}
        f
    }
}

// What a region of the address space is, decided once per region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapKind {
    Heap,
    Stack,
    ThreadStack(pid_t),
    Vdso,
    Vsyscall,
    Shlib,
    ExeFileMap,
    FileMap,
    AnonExec,
    Padding,
    Special,
    Other,
}

#[derive(Clone, Debug)]
pub struct MemMapInfo {
    pub start: usize,
    pub len: usize,
    pub perms: MemMapPermissions,
    pub kind: MapKind,
    pub path: Option<String>,
}

// Information from /proc/[pid]/maps
#[derive(Default, Clone)]
pub struct MemMapsInfo {
    pub maps: Vec<MemMapInfo>, // in file order, i.e. sorted by address
}

impl MemMapsInfo {
    pub fn read_proc_maps(pid: pid_t) -> Result<MemMapsInfo> {
        let reader = BufReader::new(File::open(format!("/proc/{}/maps", pid))?);
        let mut res: Vec<MemMapInfo> = Vec::new();
        for line in reader.lines() {
            let line = line?;
            res.push(parse_maps_line(&line)?);
        }
        Ok(MemMapsInfo {maps: res})
    }

    pub fn first_of_kind(&self, kind: &MapKind) -> Option<&MemMapInfo> {
        self.maps.iter().find(|m| &m.kind == kind)
    }

    // The mapping holding the executable's text, found by basename so that a
    // symlinked install path still matches the comm recorded in the core.
    pub fn exe_text_map(&self, comm: &str) -> Option<&MemMapInfo> {
        self.maps.iter().find(|m| {
            m.perms.contains(MemMapPermissions::EXECUTE)
                && m.path.as_ref().is_some_and(|p| basename(p) == comm)
        })
    }

    pub fn map_at_base(&self, addr: usize) -> Option<&MemMapInfo> {
        self.maps.iter().find(|m| m.start == addr)
    }
}

// One line looks like:
// 7f01c8a09000-7f01c8bf1000 r-xp 001ff000 103:02 3151375  /usr/lib/libc.so.6
pub fn parse_maps_line(line: &str) -> Result<MemMapInfo> {
    // The last field is the path, which may contain spaces, so the line can't
    // just be split on whitespace.
    let mut s = line.trim_start().splitn(2, ' ');
    let (range, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(Format, "too few fields in maps line"); }

    let mut s = range.unwrap().splitn(2, '-');
    let (start, end) = (s.next(), s.next());
    if end.is_none() { return err!(Format, "bad range in maps line"); }
    let start = usize::from_str_radix(start.unwrap(), 16)?;
    let end = usize::from_str_radix(end.unwrap(), 16)?;

    let mut s = rest.unwrap().trim_start().splitn(2, ' ');
    let (perms_str, rest) = (s.next(), s.next());
    if rest.is_none() { return err!(Format, "too few fields in maps line"); }
    let perms_str = perms_str.unwrap();
    let mut perms = MemMapPermissions::empty();
    for ch in perms_str.chars() {
        match ch {
            'r' => perms.insert(MemMapPermissions::READ),
            'w' => perms.insert(MemMapPermissions::WRITE),
            'x' => perms.insert(MemMapPermissions::EXECUTE),
            's' => perms.insert(MemMapPermissions::SHARED),
            'p' => perms.insert(MemMapPermissions::PRIVATE),
            _ => (),
        }
    }

    // Skip offset, dev, inode.
    let mut rest = rest.unwrap();
    for _ in 0..3 {
        let mut s = rest.trim_start().splitn(2, ' ');
        let (field, r) = (s.next(), s.next());
        if field.is_none() { return err!(Format, "too few fields in maps line"); }
        rest = r.unwrap_or("");
    }
    let path = match rest.trim_start() {
        "" => None,
        p => Some(p.to_string()),
    };

    let kind = classify_map(path.as_deref(), perms);
    Ok(MemMapInfo {start, len: end - start, perms, kind, path})
}

// Exactly one kind per region.
fn classify_map(path: Option<&str>, perms: MemMapPermissions) -> MapKind {
    let exec = perms.contains(MemMapPermissions::EXECUTE);
    if let Some(p) = path {
        if p == "[heap]" {
            return MapKind::Heap;
        }
        if p == "[stack]" {
            return MapKind::Stack;
        }
        if let Some(tid) = p.strip_prefix("[stack:").and_then(|r| r.strip_suffix("]")) {
            if let Ok(tid) = pid_t::from_str(tid) {
                return MapKind::ThreadStack(tid);
            }
        }
        if p == "[vdso]" {
            return MapKind::Vdso;
        }
        if p == "[vsyscall]" {
            return MapKind::Vsyscall;
        }
    }
    if perms == MemMapPermissions::PRIVATE {
        // "---p", a guard region.
        return MapKind::Padding;
    }
    if perms.contains(MemMapPermissions::SHARED) {
        return MapKind::Special;
    }
    if let Some(p) = path.filter(|p| p.starts_with('/')) {
        if basename(p).contains(".so") {
            return MapKind::Shlib;
        }
        return if exec {MapKind::ExeFileMap} else {MapKind::FileMap};
    }
    if exec {
        return MapKind::AnonExec;
    }
    MapKind::Other
}

// /proc/[pid]/exe resolved twice, since the link may point at another link
// (containers, wrapper managers).
pub fn get_exe_path(pid: pid_t) -> Result<String> {
    let first = fs::read_link(format!("/proc/{}/exe", pid))?;
    let path = match fs::read_link(&first) {
        Ok(second) => second,
        Err(_) => first,
    };
    match path.into_os_string().into_string() {
        Ok(s) => Ok(s),
        Err(_) => err!(Format, "executable path is not valid utf-8"),
    }
}

pub const MAX_FD_COUNT: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct SocketTuple {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Clone, Debug)]
pub struct FdLink {
    pub fd: i32,
    pub path: String,
    pub net: u32, // NET_NONE / NET_TCP / NET_UDP
    pub socket: SocketTuple,
}

pub fn read_fd_links(pid: pid_t) -> Result<Vec<FdLink>> {
    let mut res: Vec<FdLink> = Vec::new();
    for entry in fs::read_dir(format!("/proc/{}/fd", pid))? {
        if res.len() >= MAX_FD_COUNT {
            log_line!("warning: process has more than {} fds, truncating fd table", MAX_FD_COUNT);
            break;
        }
        let entry = entry?;
        let name = entry.file_name().into_string().unwrap_or_default();
        let fd = match i32::from_str(&name) {
            Ok(x) => x,
            Err(_) => continue,
        };
        let target = fs::read_link(entry.path())?;
        let path = target.to_string_lossy().into_owned();

        let mut link = FdLink {fd, path, net: NET_NONE, socket: SocketTuple::default()};
        if let Some(inode) = parse_socket_link(&link.path) {
            match fill_sock_info(inode) {
                Ok(Some((net, socket))) => {
                    link.net = net;
                    link.socket = socket;
                }
                Ok(None) => (),
                Err(e) => log_line!("warning: socket inode {} lookup failed: {}", inode, e),
            }
        }
        res.push(link);
    }
    res.sort_by_key(|l| l.fd);
    Ok(res)
}

// "socket:[12345]" -> 12345
fn parse_socket_link(path: &str) -> Option<u64> {
    let inner = path.strip_prefix("socket:[")?.strip_suffix("]")?;
    u64::from_str(inner).ok()
}

// The inode is searched in the TCP table first, then UDP. The first table
// that knows it decides the protocol.
fn fill_sock_info(inode: u64) -> Result<Option<(u32, SocketTuple)>> {
    if let Some(tuple) = scan_socket_table("/proc/net/tcp", inode)? {
        return Ok(Some((NET_TCP, tuple)));
    }
    if let Some(tuple) = scan_socket_table("/proc/net/udp", inode)? {
        return Ok(Some((NET_UDP, tuple)));
    }
    Ok(None)
}

fn scan_socket_table(path: &str, inode: u64) -> Result<Option<SocketTuple>> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines().skip(1) {
        let line = line?;
        match parse_socket_line(&line) {
            Ok((tuple, line_inode)) if line_inode == inode => return Ok(Some(tuple)),
            Ok(_) => (),
            Err(e) => log_line!("warning: unparsable line in {}: {}", path, e),
        }
    }
    Ok(None)
}

// "  0: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000  0  0 12345 ..."
pub fn parse_socket_line(line: &str) -> Result<(SocketTuple, u64)> {
    let mut tokens = line.split_whitespace();
    let (local, remote, inode) = match (tokens.next(), tokens.next(), tokens.next(), tokens.nth(6)) {
        (Some(_sl), Some(l), Some(r), Some(i)) => (l, r, i),
        _ => return err!(Format, "too few fields in socket table line"),
    };
    let parse_endpoint = |s: &str| -> Result<(u32, u16)> {
        let mut halves = s.splitn(2, ':');
        match (halves.next(), halves.next()) {
            (Some(a), Some(p)) => Ok((u32::from_str_radix(a, 16)?, u16::from_str_radix(p, 16)?)),
            _ => err!(Format, "bad socket endpoint: {}", s),
        }
    };
    let (src_addr, src_port) = parse_endpoint(local)?;
    let (dst_addr, dst_port) = parse_endpoint(remote)?;
    let inode = u64::from_str(inode)?;
    Ok((SocketTuple {src_addr, dst_addr, src_port, dst_port}, inode))
}

pub fn deliver_signal(pid: pid_t, sig: i32) -> Result<()> {
    let r = unsafe {libc::kill(pid, sig)};
    if r != 0 {
        return errno_err!("kill({}, {}) failed", pid, signal_name(sig));
    }
    Ok(())
}

// Captures one mapped region from /proc/[pid]/mem into an anonymous mapping.
// The target is stopped for the duration of the read so the snapshot is
// consistent; the caller is expected to drop the mapping as soon as the
// bytes have been consumed.
pub fn read_process_segment(pid: pid_t, addr: usize, len: usize) -> Result<MmapMut> {
    let mut buf = MmapMut::map_anon(len)?;
    let file = File::open(format!("/proc/{}/mem", pid))?;

    deliver_signal(pid, libc::SIGSTOP)?;
    let read_result = pread_exact(&file, &mut buf[..], addr);
    deliver_signal(pid, libc::SIGCONT)?;

    read_result?;
    Ok(buf)
}

fn pread_exact(file: &File, buf: &mut [u8], offset: usize) -> Result<()> {
    let mut pos = 0usize;
    while pos < buf.len() {
        let r = unsafe {libc::pread(file.as_raw_fd(), buf[pos..].as_mut_ptr() as *mut c_void, buf.len() - pos, (offset + pos) as i64)};
        if r < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return errno_err!("pread of {} bytes at 0x{:x} failed", buf.len(), offset);
        }
        if r == 0 {
            return err!(ProcessState, "unexpected EOF in mem @0x{:x}:0x{:x}", offset, buf.len());
        }
        pos += r as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{procfs::*, os::*};

    #[test]
    fn maps_classification() {
        let cases: &[(&str, MapKind)] = &[
            ("00400000-00401000 r-xp 00000000 08:01 123 /usr/bin/cat", MapKind::ExeFileMap),
            ("00600000-00601000 rw-p 00000000 08:01 123 /usr/bin/cat", MapKind::FileMap),
            ("7f0000000000-7f0000200000 r-xp 001ff000 08:01 77 /usr/lib/libc.so.6", MapKind::Shlib),
            ("7f0000200000-7f0000201000 ---p 00000000 00:00 0", MapKind::Padding),
            ("01000000-01002000 rw-p 00000000 00:00 0  [heap]", MapKind::Heap),
            ("7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0  [stack]", MapKind::Stack),
            ("7ffc10000000-7ffc10021000 rw-p 00000000 00:00 0  [stack:4242]", MapKind::ThreadStack(4242)),
            ("7ffc00050000-7ffc00052000 r-xp 00000000 00:00 0  [vdso]", MapKind::Vdso),
            ("ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0  [vsyscall]", MapKind::Vsyscall),
            ("7f2000000000-7f2000001000 rwxp 00000000 00:00 0", MapKind::AnonExec),
            ("7f3000000000-7f3000001000 rw-s 00000000 00:05 44 /dev/shm/x", MapKind::Special),
            ("7f4000000000-7f4000001000 rw-p 00000000 00:00 0", MapKind::Other),
        ];
        for (line, expected) in cases {
            let m = parse_maps_line(line).unwrap();
            assert_eq!(&m.kind, expected, "line: {}", line);
        }
    }

    #[test]
    fn maps_fields() {
        let m = parse_maps_line("7f01c8a09000-7f01c8bf1000 r-xp 001ff000 103:02 3151375  /usr/lib/libc.so.6").unwrap();
        assert_eq!(m.start, 0x7f01c8a09000);
        assert_eq!(m.len, 0x7f01c8bf1000 - 0x7f01c8a09000);
        assert!(m.perms.contains(MemMapPermissions::READ | MemMapPermissions::EXECUTE));
        assert!(!m.perms.contains(MemMapPermissions::WRITE));
        assert_eq!(m.path.as_deref(), Some("/usr/lib/libc.so.6"));
        assert_eq!(m.perms.pf_flags(), PF_R | PF_X);
    }

    #[test]
    fn maps_path_with_spaces() {
        let m = parse_maps_line("00400000-00401000 r--p 00000000 08:01 9 /tmp/with space (deleted)").unwrap();
        assert_eq!(m.path.as_deref(), Some("/tmp/with space (deleted)"));
    }

    #[test]
    fn socket_table_line() {
        let line = "   1: 0100007F:1F90 0200A8C0:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 31337 1 0000000000000000 20 4 30 10 -1";
        let (t, inode) = parse_socket_line(line).unwrap();
        assert_eq!(t.src_addr, 0x0100007f);
        assert_eq!(t.src_port, 0x1f90);
        assert_eq!(t.dst_addr, 0x0200a8c0);
        assert_eq!(t.dst_port, 0x01bb);
        assert_eq!(inode, 31337);
    }

    #[test]
    fn socket_link_inode() {
        assert_eq!(parse_socket_link("socket:[4099]"), Some(4099));
        assert_eq!(parse_socket_link("/dev/null"), None);
        assert_eq!(parse_socket_link("pipe:[17]"), None);
    }
}
