use recore::{*, error::*, core::*, elf::*, layout::*, notes::*, os::*, payload::*, process_info::*, procfs::*, reinject::*, sections::*, symbols::*};
use std::{collections::HashSet, fs::File, io, io::{Read, Write}, process, str::FromStr};
use libc::pid_t;

struct Opts {
    exe_comm: String,
    pid: pid_t,
    outfile: String,
    all_text: bool,   // -t: include full shared library text
    heuristics: bool, // -h
    core_path: Option<String>, // spooled from stdin when -i
}

fn usage() -> ! {
    eprintln!("usage: recore -e <exe-comm> -p <pid> -o <out-path> [-t] [-h] [-i] [core-path]");
    eprintln!("  -e   basename of the dumped executable (matched against NT_FILE paths)");
    eprintln!("  -p   pid of the dumped process (its /proc entries must still exist)");
    eprintln!("  -o   path of the reconstructed output");
    eprintln!("  -t   merge full text of every shared library, not just the executable");
    eprintln!("  -h   mark the output as built with injection heuristics enabled");
    eprintln!("  -i   read the raw core from stdin and spool it next to the output");
    eprintln!("  a positional core-path names an already spooled core; required without -i");
    process::exit(1);
}

fn parse_arg(args: &mut &[String], seen_args: &mut HashSet<String>, name: &str, bool_switch: bool) -> Option<String> {
    assert!(!args.is_empty());
    if &args[0][..] != name {
        return None;
    }
    if !seen_args.insert(name.to_string()) {
        eprintln!("{} can't be specified multiple times", name);
        process::exit(1);
    }
    if bool_switch {
        *args = &args[1..];
        return Some(String::new());
    }
    if args.len() == 1 {
        eprintln!("{} requires an argument", name);
        process::exit(1);
    }
    let v = args[1].clone();
    *args = &args[2..];
    Some(v)
}

fn parse_opts() -> Opts {
    let all_args: Vec<String> = std::env::args().collect();
    let mut args = &all_args[1..];
    let mut seen_args: HashSet<String> = HashSet::new();

    let mut exe_comm: Option<String> = None;
    let mut pid: Option<pid_t> = None;
    let mut outfile: Option<String> = None;
    let mut all_text = false;
    let mut heuristics = false;
    let mut stdin_core = false;
    let mut core_path: Option<String> = None;

    while !args.is_empty() {
        if let Some(v) = parse_arg(&mut args, &mut seen_args, "-e", false) {
            exe_comm = Some(v);
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "-p", false) {
            pid = match pid_t::from_str(&v) {
                Ok(x) if x > 0 => Some(x),
                _ => {
                    eprintln!("invalid pid: {}", v);
                    process::exit(1);
                }
            };
        } else if let Some(v) = parse_arg(&mut args, &mut seen_args, "-o", false) {
            outfile = Some(v);
        } else if let Some(_) = parse_arg(&mut args, &mut seen_args, "-t", true) {
            all_text = true;
        } else if let Some(_) = parse_arg(&mut args, &mut seen_args, "-h", true) {
            heuristics = true;
        } else if let Some(_) = parse_arg(&mut args, &mut seen_args, "-i", true) {
            stdin_core = true;
        } else if !args[0].starts_with('-') && core_path.is_none() {
            core_path = Some(args[0].clone());
            args = &args[1..];
        } else {
            eprintln!("unrecognized argument: {}", args[0]);
            usage();
        }
    }

    let (exe_comm, pid, outfile) = match (exe_comm, pid, outfile) {
        (Some(e), Some(p), Some(o)) => (e, p, o),
        _ => usage(),
    };
    if stdin_core == core_path.is_some() {
        eprintln!("exactly one core source is required: either -i or a core-path argument");
        usage();
    }

    Opts {exe_comm, pid, outfile, all_text, heuristics, core_path}
}

// Spools the kernel's core stream into a sibling of the output file.
fn spool_stdin_core(outfile: &str) -> Result<String> {
    let path = format!("{}.core", outfile);
    let mut out = File::create(&path)?;
    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0usize;
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.write_all(&buf[..n])?;
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    out.sync_all()?;
    log_line!("info: spooled {} bytes of core from stdin to {}", total, path);
    Ok(path)
}

fn run(opts: &Opts) -> Result<()> {
    let core_path = match &opts.core_path {
        Some(p) => p.clone(),
        None => spool_stdin_core(&opts.outfile)?,
    };

    let mut core = CoreFile::load(&core_path)?;
    let notes = parse_notes_area(&core)?;
    let files = match &notes.files {
        Some(f) => f.clone(),
        None => return err!(MalformedCore, "core has no NT_FILE note"),
    };

    let maps = match MemMapsInfo::read_proc_maps(opts.pid) {
        Ok(m) => m,
        Err(e) if e.is_io_not_found() => return err!(ProcessState, "no process with pid {} in /proc", opts.pid),
        Err(e) => return Err(e),
    };
    let exe_path = get_exe_path(opts.pid)?;
    let exe = ElfImage::from_path(&exe_path)?;
    let overrides = LayoutOverrides::collect(&exe);

    let mut layout = parse_exe_phdrs(&exe, &opts.exe_comm, &files)?;
    core.text_size_with_hint(layout.text_vaddr);

    // Capture the executable's full text while the process is still there,
    // then rewrite the core around it.
    let text_map = match maps.exe_text_map(&opts.exe_comm) {
        Some(m) => m,
        None => return err!(ProcessState, "no live text mapping found for '{}'", opts.exe_comm),
    };
    let text_image = match read_process_segment(opts.pid, text_map.start, text_map.len) {
        Ok(img) => img,
        Err(e) if e.is_io_permission_denied() => return err!(Usage, "cannot read /proc/{}/mem: operation not permitted - missing privileges?", opts.pid),
        Err(e) => return Err(e),
    };
    merge_exe_text_into_core(&core_path, layout.text_vaddr, &text_image[..])?;
    drop(text_image);

    if opts.all_text {
        merge_shlib_texts_into_core(&core_path, opts.pid, &maps)?;
    }

    // The rewrite moved every offset after the text, so remap and re-resolve.
    core = core.reload()?;
    xref_core_offsets(&mut layout, &core, &overrides);
    let dynmeta = if layout.dynlinked {
        extract_dyntag_info(&core, &layout)?
    } else {
        DynMeta::default()
    };

    let libs = collect_libraries(&files, &maps, &core);
    let fds = read_fd_links(opts.pid)?;
    let pstate = ProcessState::from_notes(opts.pid, exe_path, opts.exe_comm.clone(), &notes)?;
    let personality = detect_personality(&layout, &overrides, opts.heuristics);

    let payload = write_payloads(&opts.outfile, &core, &notes, &fds, &pstate, personality)?;

    let inputs = SectionInputs {
        layout: &layout,
        dynmeta: &dynmeta,
        overrides: &overrides,
        libs: &libs,
        maps: &maps,
        core: &core,
        payload: &payload,
    };
    let mut table = build_section_headers(&inputs);
    write_section_table(&opts.outfile, &mut table, payload.stb_offset, layout.entry)?;

    let symcount = build_local_symtab_and_finalize(&opts.outfile, &table)?;
    log_line!("info: wrote {} with {} sections, {} threads, {} local symbols", opts.outfile, table.headers.len(), notes.threads.len(), symcount);
    Ok(())
}

fn main() {
    let opts = parse_opts();
    match run(&opts) {
        Ok(()) => (),
        Err(e) => {
            log_line!("error: {}", e);
            process::exit(1);
        }
    }
}
