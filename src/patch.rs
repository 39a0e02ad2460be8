//! the decoded patch description
//!
//! A patch description names the victim object, the replacement object, the
//! replacement's program headers and the function redirections to install.
//! It arrives as JSON and is read-only once decoded; before any victim is
//! touched the description is checked for internal consistency and against
//! the replacement object's actual program headers on disk.

use std::fs::File;
use std::path::Path;

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::debug;
use serde::Deserialize;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct PatchInfo {
    /// build id of the object being replaced, for the audit trail
    pub old_bid: String,
    /// build id of the replacement
    pub new_bid: String,
    /// path of the victim's target object, as it appears in its memory map
    pub old_path: String,
    /// path of the replacement image, visible to the victim
    pub path: String,
    pub segments: Vec<Segment>,
    pub func_jumps: Vec<FuncJump>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub mem_sz: u64,
    pub file_sz: u64,
    pub flags: u32,
    pub align: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FuncJump {
    pub name: String,
    /// old entry point, relative to the victim's load base of the old object
    pub func_value: u64,
    /// bytes at the old entry that may be overwritten
    pub func_size: u64,
    /// new entry point, relative to the replacement's load bias
    pub patch_value: u64,
}

impl Segment {
    pub fn is_load(&self) -> bool {
        self.kind == "PT_LOAD"
    }

    pub fn prot(&self) -> i32 {
        let mut prot = 0;
        if self.flags & PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

pub fn load_patch_info(path: &Path) -> Result<PatchInfo> {
    let file = File::open(path)?;
    let info: PatchInfo =
        serde_json::from_reader(file).map_err(|e| Error::FormatError(format!("{}", e)))?;
    validate(&info)?;
    debug!(
        "decoded patch description: {} -> {} ({} segments, {} func jumps)",
        info.old_bid,
        info.new_bid,
        info.segments.len(),
        info.func_jumps.len()
    );
    Ok(info)
}

fn validate(info: &PatchInfo) -> Result<()> {
    if !info.segments.iter().any(Segment::is_load) {
        return Err(Error::FormatError("no PT_LOAD segment".into()));
    }
    for seg in info.segments.iter().filter(|s| s.is_load()) {
        if seg.file_sz > seg.mem_sz {
            return Err(Error::FormatError(format!(
                "segment at {:#x}: file_sz {:#x} exceeds mem_sz {:#x}",
                seg.vaddr, seg.file_sz, seg.mem_sz
            )));
        }
        if seg.align == 0 || !seg.align.is_power_of_two() {
            return Err(Error::FormatError(format!(
                "segment at {:#x}: bad alignment {:#x}",
                seg.vaddr, seg.align
            )));
        }
        if seg.offset % seg.align != seg.vaddr % seg.align {
            return Err(Error::FormatError(format!(
                "segment at {:#x}: offset {:#x} incongruent with vaddr",
                seg.vaddr, seg.offset
            )));
        }
    }
    for jump in &info.func_jumps {
        if jump.name.is_empty() || jump.func_size == 0 {
            return Err(Error::FormatError(format!(
                "bad func jump {:?}",
                jump.name
            )));
        }
    }
    Ok(())
}

/// cross-check the description against the replacement object on disk
pub fn verify_image(info: &PatchInfo) -> Result<()> {
    let buf = std::fs::read(&info.path)?;
    let elf =
        Elf::parse(&buf).map_err(|e| Error::FormatError(format!("{}: {}", info.path, e)))?;
    let disk: Vec<_> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .collect();
    let described: Vec<_> = info.segments.iter().filter(|s| s.is_load()).collect();
    if disk.len() != described.len() {
        return Err(Error::FormatError(format!(
            "{}: {} PT_LOAD headers on disk, {} described",
            info.path,
            disk.len(),
            described.len()
        )));
    }
    for (ph, seg) in disk.iter().zip(described.iter()) {
        if ph.p_offset != seg.offset
            || ph.p_vaddr != seg.vaddr
            || ph.p_filesz != seg.file_sz
            || ph.p_memsz != seg.mem_sz
            || ph.p_flags != seg.flags
            || ph.p_align != seg.align
        {
            return Err(Error::FormatError(format!(
                "{}: segment at {:#x} disagrees with program header",
                info.path, seg.vaddr
            )));
        }
    }
    debug!("{} matches its description", info.path);
    Ok(())
}
