//! ptrace control of the victim
//!
//! `TracedProcess` freezes the victim for the whole patching session. Remote
//! syscalls run on a 3-byte `syscall; int3` stub planted over the word at the
//! interrupted instruction pointer; the saved word and registers form the
//! control handle and are restored on detach, so the victim resumes exactly
//! where it was interrupted.

use log::{debug, warn};
use nix::sys::signal;
use nix::sys::uio;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::errors::{Error, Result};
use crate::remote::{Remote, RemoteSyscall};

// syscall; int3 in the low three bytes of a poked word
const SYSCALL_TRAP_STUB: i64 = 0x00cc_050f;
const SYSCALL_TRAP_MASK: i64 = 0x00ff_ffff;

struct SyscallCtl {
    ip: u64,
    saved_insn: i64,
    saved_regs: libc::user_regs_struct,
}

pub struct TracedProcess {
    pid: Pid,
    attached: bool,
    ctl: Option<SyscallCtl>,
    pending_signal: Option<signal::Signal>,
}

/// refuse victims that are already stopped, traced or dying
fn ensure_runnable(pid: Pid) -> Result<()> {
    let proc = procfs::process::Process::new(pid.as_raw()).map_err(|e| Error::NotTraceable {
        pid: pid.as_raw(),
        reason: format!("{:?}", e),
    })?;
    match proc.stat.state {
        'R' | 'S' | 'D' => Ok(()),
        state => Err(Error::NotTraceable {
            pid: pid.as_raw(),
            reason: format!("task state '{}'", state),
        }),
    }
}

impl TracedProcess {
    pub fn attach(pid: Pid) -> Result<TracedProcess> {
        ensure_runnable(pid)?;
        ptrace::attach(pid).map_err(|e| Error::NotTraceable {
            pid: pid.as_raw(),
            reason: format!("ptrace attach: {}", e),
        })?;
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(p, _)) if p == pid => (),
            status => {
                let _ = ptrace::detach(pid);
                return Err(Error::NotTraceable {
                    pid: pid.as_raw(),
                    reason: format!("unexpected wait status {:?}", status),
                });
            }
        }
        debug!("attached to {}", pid);
        Ok(TracedProcess {
            pid,
            attached: true,
            ctl: None,
            pending_signal: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// plant the syscall stub at the interrupted rip; must run while stopped
    pub fn prepare(&mut self) -> Result<()> {
        if !self.attached {
            return Err(Error::NotTraceable {
                pid: self.pid.as_raw(),
                reason: "not attached".into(),
            });
        }
        let regs = self.getregs()?;
        let ip = regs.rip;
        let saved = ptrace::read(self.pid, ip as ptrace::AddressType)?;
        let stub = (saved & !SYSCALL_TRAP_MASK) | SYSCALL_TRAP_STUB;
        ptrace::write(
            self.pid,
            ip as ptrace::AddressType,
            stub as *mut libc::c_void,
        )?;
        debug!("syscall stub planted at {:#x} in {}", ip, self.pid);
        self.ctl = Some(SyscallCtl {
            ip,
            saved_insn: saved,
            saved_regs: regs,
        });
        Ok(())
    }

    /// undo the stub and let the victim run again
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        if let Some(ctl) = self.ctl.take() {
            ptrace::write(
                self.pid,
                ctl.ip as ptrace::AddressType,
                ctl.saved_insn as *mut libc::c_void,
            )?;
            self.setregs(ctl.saved_regs)?;
        }
        if let Some(sig) = self.pending_signal.take() {
            // a signal stopped us mid-stub; requeue it so it is not lost
            warn!("requeueing {:?} for {}", sig, self.pid);
            let _ = signal::kill(self.pid, sig);
        }
        ptrace::detach(self.pid)?;
        self.attached = false;
        debug!("detached from {}", self.pid);
        Ok(())
    }

    fn wait_trap(&mut self) -> Result<()> {
        match waitpid(self.pid, None)? {
            WaitStatus::Stopped(_, signal::SIGTRAP) => Ok(()),
            WaitStatus::Stopped(_, sig) => {
                self.pending_signal = Some(sig);
                Ok(())
            }
            status => Err(Error::NotTraceable {
                pid: self.pid.as_raw(),
                reason: format!("unexpected wait status {:?}", status),
            }),
        }
    }
}

impl Remote for TracedProcess {
    fn peek_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        if size <= std::mem::size_of::<u64>() {
            let word = ptrace::read(self.pid, addr as ptrace::AddressType)? as u64;
            Ok(word.to_le_bytes().iter().cloned().take(size).collect())
        } else {
            let mut buf = vec![0u8; size];
            let local = [uio::IoVec::from_mut_slice(buf.as_mut_slice())];
            let remote = [uio::RemoteIoVec {
                base: addr as usize,
                len: size,
            }];
            uio::process_vm_readv(self.pid, &local, &remote)?;
            Ok(buf)
        }
    }

    fn poke_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let size = bytes.len();
        if size <= std::mem::size_of::<u64>() {
            // read-modify-write a word so the trailing bytes survive; the
            // ptrace path also works on pages the victim maps read-only
            let mut word = if size < std::mem::size_of::<u64>() {
                (ptrace::read(self.pid, addr as ptrace::AddressType)? as u64).to_le_bytes()
            } else {
                [0u8; 8]
            };
            word[..size].copy_from_slice(bytes);
            ptrace::write(
                self.pid,
                addr as ptrace::AddressType,
                u64::from_le_bytes(word) as *mut libc::c_void,
            )?;
            Ok(())
        } else {
            let local = [uio::IoVec::from_slice(bytes)];
            let remote = [uio::RemoteIoVec {
                base: addr as usize,
                len: size,
            }];
            uio::process_vm_writev(self.pid, &local, &remote)?;
            Ok(())
        }
    }

    fn getregs(&self) -> Result<libc::user_regs_struct> {
        Ok(ptrace::getregs(self.pid)?)
    }

    fn setregs(&self, regs: libc::user_regs_struct) -> Result<()> {
        Ok(ptrace::setregs(self.pid, regs)?)
    }
}

impl RemoteSyscall for TracedProcess {
    fn remote_syscall(&mut self, nr: i64, args: [i64; 6]) -> Result<i64> {
        let ip = match &self.ctl {
            Some(ctl) => ctl.ip,
            None => {
                return Err(Error::NotTraceable {
                    pid: self.pid.as_raw(),
                    reason: "no syscall stub prepared".into(),
                })
            }
        };
        let old_regs = self.getregs()?;
        let mut regs = old_regs;
        regs.rip = ip;
        regs.orig_rax = nr as u64;
        regs.rax = nr as u64;
        regs.rdi = args[0] as u64;
        regs.rsi = args[1] as u64;
        regs.rdx = args[2] as u64;
        regs.r10 = args[3] as u64;
        regs.r8 = args[4] as u64;
        regs.r9 = args[5] as u64;
        self.setregs(regs)?;

        ptrace::cont(self.pid, None)?;
        self.wait_trap()?;

        let after = self.getregs()?;
        self.setregs(old_regs)?;

        // kernel errors come back as small negative values in rax
        if after.rax > (-4096i64) as u64 {
            Err(Error::RemoteSyscall {
                nr,
                errno: -(after.rax as i64) as i32,
            })
        } else {
            Ok(after.rax as i64)
        }
    }
}
