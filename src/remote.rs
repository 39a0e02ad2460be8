//! seams for operating on the victim
//!
//! `Remote` moves bytes and registers; `RemoteSyscall` runs syscalls in the
//! victim's context. The live implementation is `tracer::TracedProcess`; the
//! loader, the place allocator and the orchestrator only ever see the traits.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::debug;

use crate::consts::page_size;
use crate::errors::Result;

pub trait Remote {
    fn peek_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>>;
    fn poke_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;
    fn getregs(&self) -> Result<libc::user_regs_struct>;
    fn setregs(&self, regs: libc::user_regs_struct) -> Result<()>;
}

pub trait RemoteSyscall {
    /// run a syscall in the victim; returns the raw kernel return value
    fn remote_syscall(&mut self, nr: i64, args: [i64; 6]) -> Result<i64>;

    fn remote_mmap(
        &mut self,
        addr: u64,
        size: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        self.remote_syscall(
            libc::SYS_mmap,
            [
                addr as i64,
                size as i64,
                i64::from(prot),
                i64::from(flags),
                i64::from(fd),
                offset as i64,
            ],
        )
        .map(|ret| ret as u64)
    }

    fn remote_munmap(&mut self, addr: u64, size: u64) -> Result<()> {
        self.remote_syscall(libc::SYS_munmap, [addr as i64, size as i64, 0, 0, 0, 0])
            .map(|_| ())
    }

    fn remote_mprotect(&mut self, addr: u64, size: u64, prot: i32) -> Result<()> {
        self.remote_syscall(
            libc::SYS_mprotect,
            [addr as i64, size as i64, i64::from(prot), 0, 0, 0],
        )
        .map(|_| ())
    }
}

/// open `path` inside the victim; the path string travels through a one-page
/// anonymous scratch mapping so no victim memory is clobbered
pub fn open_file<T: Remote + RemoteSyscall>(
    task: &mut T,
    path: &Path,
    flags: i32,
    mode: u32,
) -> Result<i32> {
    let mut bytes = path.as_os_str().as_bytes().to_vec();
    bytes.push(0);

    let scratch = task.remote_mmap(
        0,
        page_size(),
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    )?;
    task.poke_bytes(scratch, &bytes)?;
    let fd = task.remote_syscall(
        libc::SYS_open,
        [
            scratch as i64,
            i64::from(flags),
            i64::from(mode),
            0,
            0,
            0,
        ],
    );
    task.remote_munmap(scratch, page_size())?;
    let fd = fd? as i32;
    debug!("opened {:?} in victim as fd {}", path, fd);
    Ok(fd)
}

pub fn close_file<T: RemoteSyscall>(task: &mut T, fd: i32) -> Result<()> {
    task.remote_syscall(libc::SYS_close, [i64::from(fd), 0, 0, 0, 0, 0])
        .map(|_| ())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::errors::Error;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SyscallRecord {
        pub nr: i64,
        pub args: [i64; 6],
    }

    /// scripted victim: byte-addressable memory plus a syscall log
    pub struct MockTask {
        pub mem: BTreeMap<u64, u8>,
        pub regs: libc::user_regs_struct,
        pub calls: Vec<SyscallRecord>,
        /// overrides for mmap returns, consumed in order; an empty list
        /// echoes the requested address (or `anon_base` for addr == 0)
        pub mmap_returns: Vec<u64>,
        pub anon_base: u64,
        pub fail_mmap_with: Option<i32>,
    }

    impl MockTask {
        pub fn new() -> MockTask {
            MockTask {
                mem: BTreeMap::new(),
                regs: unsafe { std::mem::zeroed() },
                calls: Vec::new(),
                mmap_returns: Vec::new(),
                anon_base: 0x7000_0000,
                fail_mmap_with: None,
            }
        }

        pub fn mmap_calls(&self) -> Vec<&SyscallRecord> {
            self.calls
                .iter()
                .filter(|c| c.nr == libc::SYS_mmap)
                .collect()
        }
    }

    impl Remote for MockTask {
        fn peek_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
            Ok((0..size as u64)
                .map(|i| *self.mem.get(&(addr + i)).unwrap_or(&0))
                .collect())
        }
        fn poke_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
            for (i, b) in bytes.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
            Ok(())
        }
        fn getregs(&self) -> Result<libc::user_regs_struct> {
            Ok(self.regs)
        }
        fn setregs(&self, _regs: libc::user_regs_struct) -> Result<()> {
            Ok(())
        }
    }

    impl RemoteSyscall for MockTask {
        fn remote_syscall(&mut self, nr: i64, args: [i64; 6]) -> Result<i64> {
            self.calls.push(SyscallRecord { nr, args });
            if nr == libc::SYS_mmap {
                if let Some(errno) = self.fail_mmap_with {
                    return Err(Error::RemoteSyscall { nr, errno });
                }
                if !self.mmap_returns.is_empty() {
                    return Ok(self.mmap_returns.remove(0) as i64);
                }
                let want = args[0] as u64;
                return Ok(if want == 0 { self.anon_base } else { want } as i64);
            }
            if nr == libc::SYS_open {
                return Ok(3);
            }
            Ok(0)
        }
    }

    #[test]
    fn open_file_round_trips_the_path() -> Result<()> {
        let mut task = MockTask::new();
        let fd = open_file(&mut task, Path::new("/tmp/new.so"), libc::O_RDONLY, 0)?;
        assert_eq!(fd, 3);
        // mmap scratch, open, munmap scratch
        let nrs: Vec<i64> = task.calls.iter().map(|c| c.nr).collect();
        assert_eq!(nrs, vec![libc::SYS_mmap, libc::SYS_open, libc::SYS_munmap]);
        let open = &task.calls[1];
        let path = task.peek_bytes(open.args[0] as u64, 12)?;
        assert_eq!(&path, b"/tmp/new.so\0");
        Ok(())
    }
}
