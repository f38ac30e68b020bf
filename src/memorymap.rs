//! # Memory Map Module
//!
//! Snapshots of the address space of a process and the gaps between its mappings.
//!
//! An [`AddressSpaceMap`] is parsed from the textual `/proc/<pid>/maps` description of a process.
//! It is a snapshot: the traced process may map or unmap memory as soon as it runs again, so a
//! map should be taken right before it is used and thrown away afterwards.
//!
//! [`free_regions`] derives the unmapped gaps between consecutive mappings. The space below the
//! first mapping is never considered free, and nothing above the last mapping is either.

use std::fmt::{self, Display};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::addr::Addr;
use crate::errors::{InjectorError, Result};

/// Access permissions of a mapping, as given by the `rwxp` column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
    pub private: bool,
}

impl MemoryPermissions {
    fn parse(flags: &str) -> Self {
        let flag = |idx: usize, c: u8| flags.as_bytes().get(idx) == Some(&c);
        MemoryPermissions {
            read: flag(0, b'r'),
            write: flag(1, b'w'),
            execute: flag(2, b'x'),
            shared: flag(3, b's'),
            private: flag(3, b'p'),
        }
    }
}

impl Display for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" },
            if self.private {
                "p"
            } else if self.shared {
                "s"
            } else {
                "-"
            },
        )
    }
}

/// A single mapped range of a process, `start` inclusive and `end` exclusive
///
/// # Examples
///
/// ```
/// use coreinject::memorymap::MappedRange;
/// use coreinject::addr::Addr;
///
/// let range = MappedRange::parse_line("00400000-00401000 r-xp 00000000 08:01 42 /usr/bin/cat")
///     .unwrap();
/// assert_eq!(range.start, Addr::from(0x400000usize));
/// assert_eq!(range.size(), 0x1000);
/// assert!(range.permissions.execute);
/// assert_eq!(range.path.as_deref(), Some("/usr/bin/cat"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedRange {
    pub start: Addr,
    pub end: Addr,
    pub permissions: MemoryPermissions,
    /// Path or pseudo path like `[stack]`, if the line had one
    pub path: Option<String>,
}

impl MappedRange {
    /// Parses one line of a maps file
    ///
    /// Returns [`None`] if the line does not start with two hex numbers separated by a hyphen,
    /// or if the range is empty.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if start >= end {
            return None;
        }

        let permissions = fields.next().map(MemoryPermissions::parse).unwrap_or_default();
        // offset, device and inode come before the path
        let path: Vec<&str> = fields.skip(3).collect();

        Some(MappedRange {
            start: start.into(),
            end: end.into(),
            permissions,
            path: if path.is_empty() {
                None
            } else {
                Some(path.join(" "))
            },
        })
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// An unmapped gap between the end of one mapping and the start of the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeRegion {
    pub start: Addr,
    pub end: Addr,
}

impl FreeRegion {
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl Display for FreeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:016x} ({} bytes)",
            self.start,
            self.end,
            self.size()
        )
    }
}

/// Computes the gaps between consecutive ranges
///
/// The input is expected in ascending order. A gap is produced for every adjacent pair where
/// the first ends before the second starts. Overlapping or touching pairs produce nothing.
///
/// # Examples
///
/// ```
/// use coreinject::memorymap::{free_regions, AddressSpaceMap};
/// use coreinject::addr::Addr;
///
/// let map = AddressSpaceMap::parse(
///     "00400000-00401000 r-xp 00000000 08:01 1 /bin/a\n\
///      00500000-00501000 r-xp 00000000 08:01 1 /bin/a\n",
/// );
/// let free = free_regions(map.ranges());
/// assert_eq!(free.len(), 1);
/// assert_eq!(free[0].start, Addr::from(0x401000usize));
/// assert_eq!(free[0].end, Addr::from(0x500000usize));
/// ```
#[must_use]
pub fn free_regions(ranges: &[MappedRange]) -> Vec<FreeRegion> {
    ranges
        .windows(2)
        .filter(|pair| pair[0].end < pair[1].start)
        .map(|pair| FreeRegion {
            start: pair[0].end,
            end: pair[1].start,
        })
        .collect()
}

/// The mapped ranges of one process at one point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct AddressSpaceMap {
    ranges: Vec<MappedRange>,
}

impl AddressSpaceMap {
    /// Parses the text of a maps file
    ///
    /// Lines that do not start with a `<hex>-<hex>` range are skipped with a warning, the rest
    /// of the text is still parsed.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut ranges = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match MappedRange::parse_line(line) {
                Some(range) => ranges.push(range),
                None => warn!("skipping malformed maps line {}: {line:?}", lineno + 1),
            }
        }
        Self { ranges }
    }

    /// Reads and parses `/proc/<pid>/maps`
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::MapParse`] if the maps file can not be read.
    pub fn from_pid(pid: i32) -> Result<Self> {
        let path = format!("/proc/{pid}/maps");
        let text = std::fs::read_to_string(&path).map_err(|e| InjectorError::MapParse {
            pid,
            reason: format!("{path}: {e}"),
        })?;
        let map = Self::parse(&text);
        debug!("process {pid} has {} mapped ranges", map.len());
        Ok(map)
    }

    /// Like [`Self::from_pid`], but logs a failure and yields an empty map
    ///
    /// An empty map means nothing can be said about the process, not that all of its memory is
    /// free.
    #[must_use]
    pub fn from_pid_or_empty(pid: i32) -> Self {
        Self::from_pid(pid).unwrap_or_else(|e| {
            error!("{e}");
            Self::default()
        })
    }

    /// Snapshot of the address space of the supervisor itself
    ///
    /// # Errors
    ///
    /// Fails if [`proc_maps`] can not read the maps of the own process.
    pub fn of_self() -> Result<Self> {
        Ok(proc_maps::get_process_maps(nix::unistd::Pid::this().into())?.into())
    }

    #[must_use]
    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn free_regions(&self) -> Vec<FreeRegion> {
        free_regions(&self.ranges)
    }

    /// The range that contains `addr`, if any
    #[must_use]
    pub fn containing(&self, addr: Addr) -> Option<&MappedRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    /// Whether `len` bytes starting at `addr` are covered by contiguous readable mappings
    #[must_use]
    pub fn is_readable(&self, addr: Addr, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cursor = addr;
        while cursor < end {
            match self
                .ranges
                .iter()
                .find(|r| r.contains(cursor) && r.permissions.read)
            {
                Some(r) => cursor = r.end,
                None => return false,
            }
        }
        true
    }

    /// Start of the first mapping whose path contains `name`
    ///
    /// That is where the loader placed the module, so static offsets of that module are
    /// relative to it.
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::ModuleNotMapped`] if no mapping matches.
    pub fn module_base(&self, name: &str) -> Result<Addr> {
        self.ranges
            .iter()
            .find(|r| r.path.as_deref().is_some_and(|p| p.contains(name)))
            .map(|r| r.start)
            .ok_or_else(|| InjectorError::ModuleNotMapped(name.to_string()))
    }
}

impl From<Vec<proc_maps::MapRange>> for AddressSpaceMap {
    fn from(ranges: Vec<proc_maps::MapRange>) -> Self {
        let ranges = ranges
            .iter()
            .filter(|range| range.size() > 0)
            .map(|range| MappedRange {
                start: Addr::from(range.start()),
                end: Addr::from(range.start() + range.size()),
                permissions: MemoryPermissions::parse(&range.flags),
                path: range.filename().map(|p| p.to_string_lossy().to_string()),
            })
            .collect();
        AddressSpaceMap { ranges }
    }
}

impl Display for AddressSpaceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mapped ranges: {}", self.ranges.len())?;
        for (i, region) in self.ranges.iter().enumerate() {
            writeln!(
                f,
                "#{}: {:016x}-{:016x} {} ({} bytes) {}",
                i,
                region.start,
                region.end,
                region.permissions,
                region.size(),
                region.path.as_deref().unwrap_or("[anonymous]")
            )?;
        }
        Ok(())
    }
}
