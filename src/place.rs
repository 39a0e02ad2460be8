//! scratch regions for synthesized code
//!
//! A patch place is a page-rounded anonymous mapping created inside the
//! victim, handed out to the orchestrator in 16-byte chunks. A place can
//! serve a request only when its address shares the upper 32 bits of the
//! request's hint, which keeps everything carved from it within a 32-bit
//! displacement of the hint.

use log::debug;

use crate::consts::{page_size, round_up, PLACE_ALIGN};
use crate::errors::{Error, Result};
use crate::remote::RemoteSyscall;
use crate::vma::VmaMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlace {
    start: u64,
    size: u64,
    used: u64,
}

impl PatchPlace {
    fn new(start: u64, size: u64) -> PatchPlace {
        PatchPlace {
            start,
            size,
            used: 0,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free(&self) -> u64 {
        self.size - self.used
    }

    fn reaches(&self, hint: u64) -> bool {
        self.start & 0xffff_ffff_0000_0000 == hint & 0xffff_ffff_0000_0000
    }

    fn take(&mut self, size: u64) -> u64 {
        let addr = self.start + round_up(self.used, PLACE_ALIGN);
        self.used += size;
        addr
    }
}

#[derive(Debug, Default)]
pub struct PlaceSet {
    places: Vec<PatchPlace>,
}

impl PlaceSet {
    pub fn new() -> PlaceSet {
        PlaceSet { places: Vec::new() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchPlace> {
        self.places.iter()
    }

    /// reserve `size` bytes of executable scratch reachable from `hint`
    pub fn get_place<T: RemoteSyscall>(
        &mut self,
        task: &mut T,
        vmas: &VmaMap,
        hint: u64,
        size: u64,
    ) -> Result<u64> {
        let size = round_up(size, PLACE_ALIGN);

        if let Some(place) = self.places.iter_mut().find(|p| p.reaches(hint)) {
            if place.free() < size {
                return Err(Error::PlaceExhausted {
                    start: place.start,
                    size,
                    free: place.free(),
                });
            }
            let addr = place.take(size);
            debug!("reusing place {:#x} for {:#x} (hint {:#x})", place.start, addr, hint);
            return Ok(addr);
        }

        let span = round_up(size, page_size());
        let addr = vmas
            .find_hole(hint, span)
            .ok_or(Error::NoReachableHole { hint, size: span })?;
        let mapped = task.remote_mmap(
            addr,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )?;
        if mapped != addr {
            let _ = task.remote_munmap(mapped, span);
            return Err(Error::MapMismatch {
                want: addr,
                got: mapped,
            });
        }
        debug!(
            "created place {:#x}-{:#x} (hint {:#x})",
            addr,
            addr + span,
            hint
        );
        let mut place = PatchPlace::new(addr, span);
        let taken = place.take(size);
        self.places.push(place);
        Ok(taken)
    }

    /// drop the write permission once all code is written
    pub fn seal<T: RemoteSyscall>(&self, task: &mut T) -> Result<()> {
        for place in &self.places {
            task.remote_mprotect(
                place.start,
                place.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )?;
            debug!("sealed place {:#x}-{:#x}", place.start, place.start + place.size);
        }
        Ok(())
    }
}
