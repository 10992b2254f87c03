use crate::{*, error::*, elf::*, os::*};

// The kernel-produced core, mapped read-only. After the reinjector rewrites
// the file on disk the old mapping is stale; callers get a fresh handle from
// reload() and must not keep the old one.
pub struct CoreFile {
    pub path: String,
    pub elf: ElfImage,
    pub note_offset: usize,
    pub note_size: usize,
    // Sizes of the program header right after PT_NOTE. For non-PIE cores that
    // is the text stub; for PIE it is corrected later by text_size_with_hint.
    pub text_stub_filesz: usize,
    pub text_stub_memsz: usize,
}

impl CoreFile {
    pub fn load(path: &str) -> Result<CoreFile> {
        let elf = ElfImage::from_path(path)?;
        if elf.header.e_type != ET_CORE {
            return err!(MalformedCore, "{} is not an ELF core file (e_type = {})", path, elf.header.e_type);
        }

        let mut note = None;
        let mut text_stub = (0usize, 0usize);
        for (i, seg) in elf.segments.iter().enumerate() {
            if seg.segment_type == PT_NOTE {
                note = Some((seg.offset, seg.size_in_file));
                if let Some(next) = elf.segments.get(i + 1) {
                    text_stub = (next.size_in_file, next.size_in_memory);
                }
                break;
            }
        }
        let (note_offset, note_size) = match note {
            Some(x) => x,
            None => return err!(MalformedCore, "{} has no PT_NOTE segment", path),
        };

        Ok(CoreFile {path: path.to_string(), elf, note_offset, note_size, text_stub_filesz: text_stub.0, text_stub_memsz: text_stub.1})
    }

    // Unmaps the stale image and maps whatever is on disk now.
    pub fn reload(self) -> Result<CoreFile> {
        let path = self.path.clone();
        drop(self);
        CoreFile::load(&path)
    }

    pub fn note_data(&self) -> &[u8] {
        &self.elf.data()[self.note_offset..self.note_offset + self.note_size]
    }

    pub fn size(&self) -> usize {
        self.elf.len()
    }

    // Corrects the text stub sizes for PIE cores, where the segment after
    // PT_NOTE is not the text. The hint is the known text base address.
    pub fn text_size_with_hint(&mut self, hint: usize) {
        for seg in &self.elf.segments {
            if seg.contains(hint) {
                self.text_stub_filesz = seg.size_in_file;
                self.text_stub_memsz = seg.size_in_memory;
                break;
            }
        }
    }

    pub fn segment_at_address(&self, addr: usize) -> Option<&ElfSegment> {
        self.elf.segments.iter().find(|s| s.segment_type == PT_LOAD && s.address == addr)
    }

    pub fn segment_containing(&self, addr: usize) -> Option<&ElfSegment> {
        self.elf.segments.iter().find(|s| s.segment_type == PT_LOAD && s.contains(addr))
    }
}
