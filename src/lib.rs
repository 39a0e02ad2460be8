//! live binary patching for running Linux/x86_64 processes
//!
//! binpatch attaches to a victim process, maps a replacement shared object
//! into its address space with syscalls executed by the victim itself under
//! tracer control, and rewrites selected function entries with rip-relative
//! jumps so that subsequent calls land in the replacement code. The victim
//! is frozen for the whole session and never restarted.

#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate lazy_static;

pub mod consts;
pub mod errors;
pub mod image;
pub mod insn;
pub mod patch;
pub mod place;
pub mod process;
pub mod remote;
pub mod tracer;
pub mod vma;
