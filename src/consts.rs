//! page arithmetic shared by the loader and the place allocator

lazy_static! {
    static ref PAGE_SIZE: u64 = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
}

/// trampoline code is carved out of places in 16-byte chunks
pub const PLACE_ALIGN: u64 = 16;

pub fn page_size() -> u64 {
    *PAGE_SIZE
}

pub fn page_start(addr: u64) -> u64 {
    addr & !(page_size() - 1)
}

pub fn page_offset(addr: u64) -> u64 {
    addr & (page_size() - 1)
}

pub fn page_align(size: u64) -> u64 {
    round_up(size, page_size())
}

/// `align` must be a power of two
pub fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[test]
fn rounding_is_sane() {
    assert_eq!(round_up(0, 16), 0);
    assert_eq!(round_up(1, 16), 16);
    assert_eq!(round_up(16, 16), 16);
    assert_eq!(round_up(17, 16), 32);
    let psz = page_size();
    assert_eq!(page_start(psz + 1), psz);
    assert_eq!(page_offset(psz + 7), 7);
    assert_eq!(page_align(1), psz);
}
