//! # Placement Module
//!
//! Finds a landing address for code near a reference address.
//!
//! Code that is reached through a 32 bit relative displacement has to be placed within
//! `i32::MAX` bytes of the place that refers to it. [`ReachableAddressFinder`] searches the free
//! regions of an [`AddressSpaceMap`] for a page aligned address inside that window. When several
//! regions qualify, the lowest address wins.

use tracing::debug;

use crate::addr::{Addr, PAGE_SIZE};
use crate::errors::{InjectorError, Result};
use crate::memorymap::{AddressSpaceMap, FreeRegion};

/// Largest distance between a placement and its reference, in either direction
pub const MAX_DISPLACEMENT: usize = i32::MAX as usize;

/// Searches the gaps of one address space snapshot
///
/// # Examples
///
/// ```
/// use coreinject::addr::Addr;
/// use coreinject::memorymap::AddressSpaceMap;
/// use coreinject::placement::ReachableAddressFinder;
///
/// let map = AddressSpaceMap::parse(
///     "00400000-00401000 r-xp 00000000 08:01 1 /bin/a\n\
///      00500000-00501000 r-xp 00000000 08:01 1 /bin/a\n",
/// );
/// let finder = ReachableAddressFinder::new(&map);
///
/// // already mapped, nothing to relocate
/// let inside = Addr::from(0x400010usize);
/// assert_eq!(finder.find(inside, 23), Some(inside));
///
/// // the gap between the two mappings starts at 0x401000
/// assert_eq!(finder.find(Addr::from(0x450123usize), 23), Some(Addr::from(0x401000usize)));
/// ```
#[derive(Debug, Clone)]
pub struct ReachableAddressFinder<'map> {
    map: &'map AddressSpaceMap,
    free: Vec<FreeRegion>,
    align: usize,
}

impl<'map> ReachableAddressFinder<'map> {
    #[must_use]
    pub fn new(map: &'map AddressSpaceMap) -> Self {
        Self {
            map,
            free: map.free_regions(),
            align: PAGE_SIZE,
        }
    }

    /// Use another alignment than [`PAGE_SIZE`], must be a power of two
    #[must_use]
    pub fn with_alignment(mut self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.align = align;
        self
    }

    #[must_use]
    pub fn free_regions(&self) -> &[FreeRegion] {
        &self.free
    }

    /// Returns `target` itself if it is mapped, otherwise the result of [`Self::find_near`]
    #[must_use]
    pub fn find(&self, target: Addr, len: usize) -> Option<Addr> {
        if self.map.containing(target).is_some() {
            debug!("{target} is mapped already, no relocation needed");
            return Some(target);
        }
        self.find_near(target, len)
    }

    /// Lowest aligned address in a free region within [`MAX_DISPLACEMENT`] of `target`
    ///
    /// The region has to have room for `len` bytes (at least one) after the returned address.
    /// Returns [`None`] if no region qualifies.
    #[must_use]
    pub fn find_near(&self, target: Addr, len: usize) -> Option<Addr> {
        let len = len.max(1);
        let lowest = target.usize().saturating_sub(MAX_DISPLACEMENT);
        let highest = target.usize().saturating_add(MAX_DISPLACEMENT);

        let found = self.free.iter().find_map(|region| {
            let floor = Addr::from(region.start.usize().max(lowest));
            let candidate = floor.align_up(self.align)?;
            let end = candidate.checked_add(len)?;
            (candidate.usize() <= highest && end <= region.end).then_some(candidate)
        });

        match found {
            Some(addr) => debug!(
                "placement for {target}: {addr} (displacement {})",
                addr.displacement(target)
            ),
            None => debug!("no placement within reach of {target}"),
        }
        found
    }

    /// [`Self::find_near`] for callers that must not go on without a placement
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::NoPlacementFound`] if no region qualifies.
    pub fn require_near(&self, target: Addr, len: usize) -> Result<Addr> {
        self.find_near(target, len)
            .ok_or(InjectorError::NoPlacementFound { target, len })
    }
}
