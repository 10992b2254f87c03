use bitflags::*;
use libc::pid_t;

// Linux and ELF api stuff.
//  * Class-selected aliases for the ELF structs, one worker binary per class.
//  * Constants and structs that are not in the libc rust crate.

#[cfg(target_pointer_width = "64")]
pub use libc::{Elf64_Ehdr as ElfEhdr, Elf64_Phdr as ElfPhdr, Elf64_Shdr as ElfShdr, Elf64_Sym as ElfSym};
#[cfg(target_pointer_width = "32")]
pub use libc::{Elf32_Ehdr as ElfEhdr, Elf32_Phdr as ElfPhdr, Elf32_Shdr as ElfShdr, Elf32_Sym as ElfSym};

// Dynamic table entry; not bound by the libc crate. d_un collapsed to one
// field, the val/ptr distinction is tag-dependent and both are word sized.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ElfDyn {
    pub d_tag: isize,
    pub d_val: usize,
}

// Relocation record, only used for its size (sh_entsize of the reloc
// sections). 64-bit uses RELA entries, 32-bit plain REL.
#[cfg(target_pointer_width = "64")]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ElfRel {
    pub r_offset: usize,
    pub r_info: usize,
    pub r_addend: isize,
}
#[cfg(target_pointer_width = "32")]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ElfRel {
    pub r_offset: usize,
    pub r_info: usize,
}

pub const ET_NONE: u16 = 0;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_GNU_EH_FRAME: u32 = 0x60000000 + 0x474e550;

// Segment permissions.
pub const PF_R: u32 = 0x4;
pub const PF_W: u32 = 0x2;
pub const PF_X: u32 = 0x1;

pub const SHT_NULL: u32 = 0x0;
pub const SHT_PROGBITS: u32 = 0x1;
pub const SHT_SYMTAB: u32 = 0x2;
pub const SHT_STRTAB: u32 = 0x3;
pub const SHT_RELA: u32 = 0x4;
pub const SHT_DYNAMIC: u32 = 0x6;
pub const SHT_NOTE: u32 = 0x7;
pub const SHT_NOBITS: u32 = 0x8;
pub const SHT_REL: u32 = 0x9;
pub const SHT_SHLIB: u32 = 0xa;
pub const SHT_DYNSYM: u32 = 0xb;
pub const SHT_GNU_HASH: u32 = 0x6ffffff6;
// Our own marker for mappings the heuristics pass flagged as planted.
pub const SHT_INJECTED: u32 = 0x200000;

#[cfg(target_pointer_width = "64")]
pub const SHT_RELOC: u32 = SHT_RELA;
#[cfg(target_pointer_width = "32")]
pub const SHT_RELOC: u32 = SHT_REL;

pub const SHF_WRITE: u64 = 1 << 0;
pub const SHF_ALLOC: u64 = 1 << 1;
pub const SHF_EXECINSTR: u64 = 1 << 2;

pub const STB_GLOBAL: u8 = 1;
pub const STT_FUNC: u8 = 2;

// These are used in core dumps.
pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_SIGINFO: u32 = 0x53494749;
pub const NT_FILE: u32 = 0x46494c45;

pub const DT_NULL: isize = 0;
pub const DT_PLTRELSZ: isize = 2;
pub const DT_PLTGOT: isize = 3;
pub const DT_HASH: isize = 4;
pub const DT_STRTAB: isize = 5;
pub const DT_SYMTAB: isize = 6;
pub const DT_RELA: isize = 7;
pub const DT_STRSZ: isize = 10;
pub const DT_INIT: isize = 12;
pub const DT_FINI: isize = 13;
pub const DT_REL: isize = 17;
pub const DT_JMPREL: isize = 23;
pub const DT_GNU_HASH: isize = 0x6ffffef5;

// Size written for sections whose true size is unknowable because the
// original executable was stripped of section headers.
pub const UNKNOWN_SHDR_SIZE: usize = 64;

pub const ELF_PRARGSZ: usize = 80;

bitflags! { pub struct Personality: u32 {
        const STATIC = 1;
        const PIE = 2;
        const HEURISTICS = 4;
        const STRIPPED_SHDRS = 8;
}}

// Structs found in core dump notes.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_siginfo {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_errno: i32,
}
#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_prstatus {
    pub pr_info: elf_siginfo,
    pub pr_cursig: i16, // Current signal
    pub pr_sigpend: usize, // Set of pending signals
    pub pr_sighold: usize, // Set of held signals
    pub pr_pid: pid_t,
    pub pr_ppid: pid_t,
    pub pr_pgrp: pid_t,
    pub pr_sid: pid_t,
    pub pr_utime: libc::timeval, // User time
    pub pr_stime: libc::timeval, // System time
    pub pr_cutime: libc::timeval, // Cumulative user time
    pub pr_cstime: libc::timeval, // Cumulative system time
    pub pr_reg: libc::user_regs_struct, // GP registers
    pub pr_fpvalid: i32, // True if math co-processor being used.
}
#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_prpsinfo {
    pub pr_state: i8, // numeric process state
    pub pr_sname: i8, // char for pr_state
    pub pr_zomb: i8, // zombie
    pub pr_nice: i8, // nice val
    pub pr_flag: u64, // flags
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: pid_t,
    pub pr_ppid: pid_t,
    pub pr_pgrp: pid_t,
    pub pr_sid: pid_t,
    pub pr_fname: [u8; 16], // filename of executable
    pub pr_psargs: [u8; ELF_PRARGSZ], // initial part of arg list
}

// Fixed-layout records appended to the output tail. Downstream readers index
// these by sh_offset/sh_entsize, so the layout is part of the file format.
pub const FD_PATH_MAX: usize = 512;

pub const NET_NONE: u32 = 0;
pub const NET_TCP: u32 = 1;
pub const NET_UDP: u32 = 2;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct fd_info {
    pub fd: i32,
    pub path: [u8; FD_PATH_MAX],
    pub net: u32,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}
impl Default for fd_info {
    fn default() -> Self {
        fd_info {fd: -1, path: [0; FD_PATH_MAX], net: NET_NONE, src_addr: 0, dst_addr: 0, src_port: 0, dst_port: 0}
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct elf_stat {
    pub personality: u32,
}

const SIGNAL_NAMES: [&str; 32] = ["[unknown signal number]", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE", "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT", "SIGCHLD", "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU", "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS"];

pub fn signal_name(sig: i32) -> &'static str {
    // strsignal() is not thread safe, and sigabbrev_np() is not in rust libc bindings.
    let sig = sig as usize;
    SIGNAL_NAMES[if sig >= SIGNAL_NAMES.len() {0} else {sig}]
}
