//! error kinds surfaced by the patching pipeline
//!
//! every component reports through this enum so the orchestrator can log a
//! diagnostic naming the failure and the victim pid before curing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("process {pid} cannot be traced: {reason}")]
    NotTraceable { pid: libc::pid_t, reason: String },

    #[error("malformed memory map: {0}")]
    MapParse(String),

    #[error("remote syscall {nr} failed with errno {errno}")]
    RemoteSyscall { nr: i64, errno: i32 },

    #[error("no mapping hole of {size:#x} bytes within reach of {hint:#x}")]
    NoReachableHole { hint: u64, size: u64 },

    #[error("no room left for {size} bytes in place {start:#x} (free: {free})")]
    PlaceExhausted { start: u64, size: u64, free: u64 },

    #[error("mmap returned {got:#x}, expected {want:#x}")]
    MapMismatch { want: u64, got: u64 },

    #[error("jump from {cur:#x} to {tgt:#x} does not fit a {bits}-bit displacement")]
    EncodingRange { cur: u64, tgt: u64, bits: u32 },

    #[error("bad patch description: {0}")]
    FormatError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("ptrace: {0}")]
    Trace(#[from] nix::Error),
}
