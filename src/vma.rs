//! victim address-space inventory
//!
//! One `VmaArea` per row of `/proc/<pid>/maps`, kept sorted by start address.
//! The inventory answers the queries the loader and the place allocator need:
//! which VMA holds an address, which VMA backs a path, and where the holes
//! between mappings are.

use std::path::{Path, PathBuf};

use combine::error::ParseError;
use combine::parser::char::{char, digit, hex_digit, spaces};
use combine::Parser;
use combine::{choice, many1, none_of, optional, Stream};

use log::debug;
use nix::unistd::Pid;

use crate::errors::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct VmaArea {
    pub start: u64,
    pub end: u64,
    pub prot: i32,
    pub flags: i32,
    pub pgoff: u64,
    pub dev: i32,
    pub inode: u64,
    pub path: Option<PathBuf>,
}

impl VmaArea {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

fn format_prot_flags(prot: i32, flags: i32) -> String {
    let mut res = String::new();
    res.push(if prot & libc::PROT_READ != 0 { 'r' } else { '-' });
    res.push(if prot & libc::PROT_WRITE != 0 { 'w' } else { '-' });
    res.push(if prot & libc::PROT_EXEC != 0 { 'x' } else { '-' });
    res.push(if flags & libc::MAP_SHARED != 0 { 's' } else { 'p' });
    res
}

impl std::fmt::Debug for VmaArea {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {} {}",
            self.start,
            self.end,
            &format_prot_flags(self.prot, self.flags),
            self.pgoff,
            self.dev.wrapping_shr(8),
            self.dev & 0xff,
            self.inode,
            self.path
                .as_ref()
                .and_then(|p| p.to_str())
                .unwrap_or("")
        )
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit()).map(|s| u64::from_str_radix(&s, 16).unwrap_or(0))
}

fn dec_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(digit()).map(|s| s.parse::<u64>().unwrap_or(0))
}

fn dev<I>() -> impl Parser<Input = I, Output = i32>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        many1::<String, _>(hex_digit()),
        char(':'),
        many1::<String, _>(hex_digit()),
    )
        .map(|(_, major, _, minor)| {
            i32::from_str_radix(&major, 16).unwrap_or(0) * 256
                + i32::from_str_radix(&minor, 16).unwrap_or(0)
        })
}

fn prot<I>() -> impl Parser<Input = I, Output = (i32, i32)>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        // sharing must be 's' or 'p', anything else fails the parse
        choice([char('s'), char('p')]),
    )
        .map(|(_, r, w, x, p)| {
            let mut prot: i32 = 0;
            if r == 'r' {
                prot |= libc::PROT_READ;
            }
            if w == 'w' {
                prot |= libc::PROT_WRITE;
            }
            if x == 'x' {
                prot |= libc::PROT_EXEC;
            }
            let flags = if p == 's' {
                libc::MAP_SHARED
            } else {
                libc::MAP_PRIVATE
            };
            (prot, flags)
        })
}

fn filepath<I>() -> impl Parser<Input = I, Output = Option<PathBuf>>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        optional(many1::<String, _>(none_of("\r\n".chars()))),
    )
        .map(|(_, path)| path.map(PathBuf::from))
}

fn vma_parser<I>() -> impl Parser<Input = I, Output = VmaArea>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        hex_value(),
        char('-'),
        hex_value(),
        prot(),
        spaces(),
        hex_value(),
        dev(),
        spaces(),
        dec_value(),
        filepath(),
    )
        .map(
            |(start, _, end, (prot_val, flags_val), _, pgoff, devno, _, inode, path)| VmaArea {
                start,
                end,
                prot: prot_val,
                flags: flags_val,
                pgoff,
                dev: devno,
                inode,
                path,
            },
        )
}

fn parse_vma_line(line: &str) -> Result<VmaArea> {
    match vma_parser().easy_parse(line) {
        Ok((area, _)) => Ok(area),
        Err(err) => Err(Error::MapParse(format!("{}: {}", line, err))),
    }
}

fn upper32(addr: u64) -> u64 {
    addr & 0xffff_ffff_0000_0000
}

#[derive(Debug, Clone, Default)]
pub struct VmaMap {
    areas: Vec<VmaArea>,
}

impl VmaMap {
    /// decode `/proc/<pid>/maps` into an ordered inventory
    pub fn collect(pid: Pid) -> Result<VmaMap> {
        let path = PathBuf::from("/proc")
            .join(&format!("{}", pid))
            .join("maps");
        let contents = std::fs::read_to_string(path)?;
        let areas = contents
            .lines()
            .map(parse_vma_line)
            .collect::<Result<Vec<_>>>()?;
        let map = VmaMap::from_areas(areas)?;
        debug!("collected {} mappings for {}", map.areas.len(), pid);
        Ok(map)
    }

    pub fn from_areas(areas: Vec<VmaArea>) -> Result<VmaMap> {
        for w in areas.windows(2) {
            if w[0].end > w[1].start {
                return Err(Error::MapParse(format!(
                    "overlapping mappings {:x?} and {:x?}",
                    w[0], w[1]
                )));
            }
        }
        Ok(VmaMap { areas })
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmaArea> {
        self.areas.iter()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn find_by_addr(&self, addr: u64) -> Option<&VmaArea> {
        self.areas.iter().find(|vma| vma.contains(addr))
    }

    pub fn find_by_prot(&self, prot: i32) -> Option<&VmaArea> {
        self.areas.iter().find(|vma| vma.prot & prot != 0)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&VmaArea> {
        self.areas
            .iter()
            .find(|vma| vma.path.as_ref().map(|p| p.as_path()) == Some(path))
    }

    /// first gap of at least `size` bytes between consecutive mappings,
    /// preferring gaps that share the hint's upper 32 address bits so the
    /// result stays within a 32-bit displacement of `hint`
    pub fn find_hole(&self, hint: u64, size: u64) -> Option<u64> {
        let mut fallback = None;
        for w in self.areas.windows(2) {
            let (lower, upper) = (&w[0], &w[1]);
            if upper.start - lower.end < size {
                continue;
            }
            if upper32(lower.end) == upper32(hint) {
                return Some(lower.end);
            }
            if fallback.is_none() {
                fallback = Some(lower.end);
            }
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    fn area(start: u64, end: u64) -> VmaArea {
        VmaArea {
            start,
            end,
            prot: libc::PROT_READ,
            flags: libc::MAP_PRIVATE,
            pgoff: 0,
            dev: 0,
            inode: 0,
            path: None,
        }
    }

    #[test]
    fn can_decode_proc_self_maps() -> Result<()> {
        let decoded = VmaMap::collect(unistd::getpid())?;
        assert!(!decoded.is_empty());
        Ok(())
    }

    #[test]
    fn parses_a_maps_line() -> Result<()> {
        let line = "7f8a1c000000-7f8a1c021000 rw-p 00000000 08:02 173521 /usr/lib/libfoo.so";
        let vma = parse_vma_line(line)?;
        assert_eq!(vma.start, 0x7f8a_1c00_0000);
        assert_eq!(vma.end, 0x7f8a_1c02_1000);
        assert_eq!(vma.prot, libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(vma.flags, libc::MAP_PRIVATE);
        assert_eq!(vma.path, Some(PathBuf::from("/usr/lib/libfoo.so")));
        Ok(())
    }

    #[test]
    fn parses_anonymous_mapping() -> Result<()> {
        let line = "7ffd4a2b0000-7ffd4a2d1000 r-xp 00022000 00:00 0";
        let vma = parse_vma_line(line)?;
        assert_eq!(vma.prot, libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(vma.pgoff, 0x22000);
        assert_eq!(vma.path, None);
        Ok(())
    }

    #[test]
    fn rejects_unknown_sharing_flag() {
        let line = "00400000-00452000 r-x? 00000000 08:02 173521 /usr/bin/true";
        assert!(parse_vma_line(line).is_err());
    }

    #[test]
    fn rejects_overlapping_inventory() {
        let res = VmaMap::from_areas(vec![area(0x1000, 0x3000), area(0x2000, 0x4000)]);
        assert!(res.is_err());
    }

    #[test]
    fn finds_by_addr_and_path() -> Result<()> {
        let mut a = area(0x1000, 0x2000);
        a.path = Some(PathBuf::from("/lib/x.so"));
        let map = VmaMap::from_areas(vec![a, area(0x4000, 0x5000)])?;
        assert_eq!(map.find_by_addr(0x1800).map(|v| v.start), Some(0x1000));
        assert!(map.find_by_addr(0x3000).is_none());
        assert_eq!(
            map.find_by_path(Path::new("/lib/x.so")).map(|v| v.start),
            Some(0x1000)
        );
        Ok(())
    }

    #[test]
    fn hole_selection_prefers_first_fit() -> Result<()> {
        let map = VmaMap::from_areas(vec![
            area(0x0000, 0x1000),
            area(0x4000, 0x5000),
            area(0x9000, 0xa000),
        ])?;
        assert_eq!(map.find_hole(0x2000, 0x2000), Some(0x1000));
        assert_eq!(map.find_hole(0x2000, 0x4000), Some(0x5000));
        assert_eq!(map.find_hole(0x2000, 0x10000), None);
        Ok(())
    }

    #[test]
    fn hole_selection_honors_hint_reach() -> Result<()> {
        let map = VmaMap::from_areas(vec![
            area(0x0000, 0x1000),
            area(0x4000, 0x5000),
            area(0x7f00_0000_0000, 0x7f00_0000_1000),
            area(0x7f00_0010_0000, 0x7f00_0010_1000),
        ])?;
        // the low gap fits but does not share the hint's upper 32 bits
        assert_eq!(
            map.find_hole(0x7f00_0000_2000, 0x1000),
            Some(0x7f00_0000_1000)
        );
        Ok(())
    }
}
