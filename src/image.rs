//! mapping the replacement object into the victim
//!
//! Mirrors the kernel's own PT_LOAD placement: the first segment floats (the
//! kernel may relocate it), every later segment is pinned with MAP_FIXED
//! relative to wherever the first one landed. The returned load bias is what
//! turns the object's vaddrs into victim addresses.

use log::debug;

use crate::consts::{page_align, page_offset, page_start};
use crate::errors::Result;
use crate::patch::PatchInfo;
use crate::remote::RemoteSyscall;

// 256 MiB floor near the hint; keeps the whole image within a 32-bit
// displacement of the code being redirected
const LOAD_BIAS_MASK: u64 = !0x0fff_ffff;

/// map all PT_LOAD segments of `info` into the victim through `fd` (a file
/// descriptor valid in the victim) and return the load bias
pub fn load_image<T: RemoteSyscall>(
    task: &mut T,
    info: &PatchInfo,
    fd: i32,
    hint: u64,
) -> Result<u64> {
    let mut load_bias = hint & LOAD_BIAS_MASK;
    let mut flags = libc::MAP_PRIVATE;
    let mut mapped: Vec<(u64, u64)> = Vec::new();

    for seg in info.segments.iter().filter(|s| s.is_load()) {
        let addr = page_start(load_bias + seg.vaddr);
        let size = page_align(seg.file_sz + page_offset(seg.vaddr));
        if size == 0 {
            continue;
        }
        let offset = seg.offset - page_offset(seg.vaddr);
        let prot = seg.prot();

        let ret = match task.remote_mmap(addr, size, prot, flags, fd, offset) {
            Ok(ret) => ret,
            Err(err) => {
                rollback(task, &mapped);
                return Err(err);
            }
        };
        debug!(
            "mapped segment {:#x}-{:#x} prot {:#x} offset {:#x}",
            ret,
            ret + size,
            prot,
            offset
        );
        mapped.push((ret, size));

        // absorb any relocation the kernel applied to the floating first
        // segment; later segments are then pinned relative to it
        load_bias += ret - page_start(load_bias + seg.vaddr);
        flags = libc::MAP_PRIVATE | libc::MAP_FIXED;
    }

    Ok(load_bias)
}

fn rollback<T: RemoteSyscall>(task: &mut T, mapped: &[(u64, u64)]) {
    for &(addr, size) in mapped {
        let _ = task.remote_munmap(addr, size);
    }
}
