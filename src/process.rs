//! the patching session
//!
//! `patch_process` drives one session over a frozen victim:
//! attach, inventory the address space, map the replacement image, rewrite
//! the function entries, detach. Any failure after the victim is stopped
//! restores the syscall stub and detaches, so the victim keeps running
//! unpatched.

use std::path::Path;

use log::{debug, info, warn};
use nix::unistd::Pid;

use crate::errors::{Error, Result};
use crate::image;
use crate::insn::{self, JumpKind};
use crate::patch::{FuncJump, PatchInfo};
use crate::place::PlaceSet;
use crate::remote::{self, Remote, RemoteSyscall};
use crate::tracer::TracedProcess;
use crate::vma::{VmaArea, VmaMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Detached,
    Stopped,
    Inventoried,
    ImageLoaded,
    Redirected,
    Resumed,
}

/// one applied patch: the description, where its image landed, and the
/// scratch places holding synthesized trampolines
pub struct Patch {
    pub info: PatchInfo,
    pub load_addr: u64,
    pub places: PlaceSet,
}

pub struct ProcessContext {
    pid: Pid,
    task: TracedProcess,
    vmas: VmaMap,
    state: PatchState,
    /// victim VMAs backed by the object being patched; the lowest one is the
    /// object's load base
    deps: Vec<VmaArea>,
    patch: Option<Patch>,
}

/// apply one patch description to a running process
pub fn patch_process(pid: Pid, info: PatchInfo) -> Result<()> {
    let mut ctx = ProcessContext::attach(pid)?;
    match ctx.apply(info) {
        Ok(()) => {
            ctx.resume_victim()?;
            info!("process {} patched", pid);
            Ok(())
        }
        Err(err) => {
            warn!("resuming {} unpatched after failure: {}", pid, err);
            if let Err(resume_err) = ctx.resume_victim() {
                warn!("could not resume {}: {}", pid, resume_err);
            }
            Err(err)
        }
    }
}

impl ProcessContext {
    pub fn attach(pid: Pid) -> Result<ProcessContext> {
        let mut task = TracedProcess::attach(pid)?;
        if let Err(err) = task.prepare() {
            let _ = task.detach();
            return Err(err);
        }
        Ok(ProcessContext {
            pid,
            task,
            vmas: VmaMap::default(),
            state: PatchState::Stopped,
            deps: Vec::new(),
            patch: None,
        })
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    fn apply(&mut self, info: PatchInfo) -> Result<()> {
        self.collect_vmas(&info)?;
        self.load_patch_image(info)?;
        self.install_func_jumps()?;
        Ok(())
    }

    fn old_base(&self) -> u64 {
        self.deps.first().map(|vma| vma.start).unwrap_or(0)
    }

    fn collect_vmas(&mut self, info: &PatchInfo) -> Result<()> {
        self.vmas = VmaMap::collect(self.pid)?;
        for vma in self.vmas.iter() {
            debug!("{:?}", vma);
        }
        self.deps = self
            .vmas
            .iter()
            .filter(|vma| vma.path.as_ref().map(|p| p.as_path()) == Some(Path::new(&info.old_path)))
            .cloned()
            .collect();
        if self.deps.is_empty() {
            return Err(Error::FormatError(format!(
                "{} is not mapped in process {}",
                info.old_path, self.pid
            )));
        }
        info!(
            "{} mapped at {:#x} in {} (build id {})",
            info.old_path,
            self.old_base(),
            self.pid,
            info.old_bid
        );
        self.state = PatchState::Inventoried;
        Ok(())
    }

    fn load_patch_image(&mut self, info: PatchInfo) -> Result<()> {
        let hint = self.old_base();
        let fd = remote::open_file(&mut self.task, Path::new(&info.path), libc::O_RDONLY, 0)?;
        let loaded = image::load_image(&mut self.task, &info, fd, hint);
        if let Err(close_err) = remote::close_file(&mut self.task, fd) {
            warn!("closing remote fd {} failed: {}", fd, close_err);
        }
        let load_addr = loaded?;
        info!(
            "{} (build id {}) loaded at {:#x}",
            info.path, info.new_bid, load_addr
        );
        self.patch = Some(Patch {
            info,
            load_addr,
            places: PlaceSet::new(),
        });
        self.state = PatchState::ImageLoaded;
        Ok(())
    }

    fn install_func_jumps(&mut self) -> Result<()> {
        let old_base = self.old_base();
        let patch = match self.patch.as_mut() {
            Some(patch) => patch,
            None => return Err(Error::FormatError("no image loaded".into())),
        };
        for jump in &patch.info.func_jumps {
            let written = install_jump(
                &mut self.task,
                &self.vmas,
                &mut patch.places,
                jump,
                old_base,
                patch.load_addr,
            )?;
            info!(
                "redirected {} at {:#x} ({} bytes)",
                jump.name,
                old_base + jump.func_value,
                written
            );
        }
        patch.places.seal(&mut self.task)?;
        self.state = PatchState::Redirected;
        Ok(())
    }

    fn resume_victim(&mut self) -> Result<()> {
        let redirected = self.state == PatchState::Redirected;
        self.task.detach()?;
        self.state = if redirected {
            PatchState::Resumed
        } else {
            PatchState::Detached
        };
        debug!("resumed {}", self.pid);
        Ok(())
    }
}

/// overwrite one function entry with a jump to its replacement; returns the
/// number of bytes written
fn install_jump<T: Remote + RemoteSyscall>(
    task: &mut T,
    vmas: &VmaMap,
    places: &mut PlaceSet,
    jump: &FuncJump,
    old_base: u64,
    load_addr: u64,
) -> Result<u64> {
    let cur = old_base + jump.func_value;
    let tgt = load_addr + jump.patch_value;

    let code = match insn::relative_jump(JumpKind::Jmpq, cur, tgt) {
        Ok(code) => code,
        Err(Error::EncodingRange { .. }) => {
            // target out of 32-bit reach: route through an absolute stub in
            // a place near the entry
            let stub = insn::indirect_jump(tgt);
            let stub_addr = places.get_place(task, vmas, cur, stub.len() as u64)?;
            task.poke_bytes(stub_addr, &stub)?;
            debug!(
                "indirect stub for {} at {:#x} -> {:#x}",
                jump.name, stub_addr, tgt
            );
            insn::relative_jump(JumpKind::Jmpq, cur, stub_addr)?
        }
        Err(err) => return Err(err),
    };

    if code.len() as u64 > jump.func_size {
        return Err(Error::FormatError(format!(
            "function {} is only {} bytes, need {}",
            jump.name,
            jump.func_size,
            code.len()
        )));
    }
    // single write, opcode first; the victim is frozen so no reader can see
    // a partial instruction
    task.poke_bytes(cur, &code)?;
    Ok(code.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::FuncJump;
    use crate::remote::testing::MockTask;
    use crate::vma::VmaArea;

    fn inventory() -> VmaMap {
        let area = |start: u64, end: u64| VmaArea {
            start,
            end,
            prot: libc::PROT_READ | libc::PROT_EXEC,
            flags: libc::MAP_PRIVATE,
            pgoff: 0,
            dev: 0,
            inode: 0,
            path: None,
        };
        VmaMap::from_areas(vec![
            area(0x7f00_0000_0000, 0x7f00_0000_1000),
            area(0x7f00_0010_0000, 0x7f00_0010_1000),
        ])
        .unwrap()
    }

    fn jump(func_value: u64, func_size: u64, patch_value: u64) -> FuncJump {
        FuncJump {
            name: "compute".into(),
            func_value,
            func_size,
            patch_value,
        }
    }

    #[test]
    fn in_reach_entry_gets_a_plain_jmpq() -> Result<()> {
        let mut task = MockTask::new();
        let mut places = PlaceSet::new();
        let vmas = inventory();
        let written = install_jump(
            &mut task,
            &vmas,
            &mut places,
            &jump(0x1234, 16, 0),
            0x7f00_0000_0000,
            0x7f00_0001_0000,
        )?;
        assert_eq!(written, 5);
        let bytes = task.peek_bytes(0x7f00_0000_1234, 5)?;
        assert_eq!(bytes, vec![0xe9, 0xc7, 0xed, 0x00, 0x00]);
        // no scratch place was needed
        assert!(places.iter().next().is_none());
        Ok(())
    }

    #[test]
    fn out_of_reach_entry_routes_through_a_stub() -> Result<()> {
        let mut task = MockTask::new();
        let mut places = PlaceSet::new();
        let vmas = inventory();
        let old_base = 0x7f00_0000_0000u64;
        let load_addr = 0x7f10_0000_0000u64;
        let written = install_jump(
            &mut task,
            &vmas,
            &mut places,
            &jump(0x1234, 16, 0x2000),
            old_base,
            load_addr,
        )?;
        assert_eq!(written, 5);

        // the stub landed in a fresh place inside the hole at 0x7f0000001000
        let stub_addr = 0x7f00_0000_1000u64;
        let stub = task.peek_bytes(stub_addr, 14)?;
        assert_eq!(&stub[..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        let tgt = u64::from_le_bytes([
            stub[6], stub[7], stub[8], stub[9], stub[10], stub[11], stub[12], stub[13],
        ]);
        assert_eq!(tgt, load_addr + 0x2000);

        // the entry jumps to the stub: disp = stub - cur - 5
        let cur = old_base + 0x1234;
        let entry = task.peek_bytes(cur, 5)?;
        assert_eq!(entry[0], 0xe9);
        let disp = i32::from_le_bytes([entry[1], entry[2], entry[3], entry[4]]) as i64;
        assert_eq!(cur as i64 + 5 + disp, stub_addr as i64);
        Ok(())
    }

    #[test]
    fn oversized_jump_is_refused() {
        let mut task = MockTask::new();
        let mut places = PlaceSet::new();
        let vmas = inventory();
        match install_jump(
            &mut task,
            &vmas,
            &mut places,
            &jump(0x1234, 4, 0),
            0x7f00_0000_0000,
            0x7f00_0001_0000,
        ) {
            Err(Error::FormatError(_)) => (),
            other => panic!("expected FormatError, got {:?}", other),
        }
        // nothing was written over the entry
        let bytes = task.peek_bytes(0x7f00_0000_1234, 1).unwrap();
        assert_eq!(bytes, vec![0]);
    }
}
