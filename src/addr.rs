//! # Address Module
//!
//! Addresses inside the traced process are not pointers of the supervisor. [`Addr`] wraps them
//! in a plain integer newtype so they can never be dereferenced by accident; every access to the
//! memory behind an [`Addr`] has to go through [`crate::remote::RemoteMemory`].

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Serialize, Serializer};

use crate::Word;

pub type RawPointer = *mut std::ffi::c_void;

/// Page granularity used for placements
pub const PAGE_SIZE: usize = 0x1000;

#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Addr(usize);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub fn usize(&self) -> usize {
        self.0
    }
    pub fn u64(&self) -> u64 {
        self.0 as u64
    }
    pub fn raw_pointer(&self) -> RawPointer {
        self.0 as RawPointer
    }

    /// Signed distance from `origin` to `self`, that is `self - origin`
    ///
    /// Computed in 128 bit so that it can not wrap for any pair of 64 bit addresses.
    #[must_use]
    pub fn displacement(&self, origin: Addr) -> i128 {
        self.0 as i128 - origin.0 as i128
    }

    /// Round up to the next multiple of `align`, `None` on overflow
    ///
    /// `align` must be a power of two.
    #[must_use]
    pub fn align_up(&self, align: usize) -> Option<Addr> {
        debug_assert!(align.is_power_of_two());
        self.0.checked_add(align - 1).map(|a| Addr(a & !(align - 1)))
    }

    /// Round down to the previous multiple of `align`
    ///
    /// `align` must be a power of two.
    #[must_use]
    pub fn align_down(&self, align: usize) -> Addr {
        debug_assert!(align.is_power_of_two());
        Addr(self.0 & !(align - 1))
    }

    #[must_use]
    pub fn is_aligned(&self, align: usize) -> bool {
        self.0 % align == 0
    }

    #[must_use]
    pub fn checked_add(&self, rhs: usize) -> Option<Addr> {
        self.0.checked_add(rhs).map(Addr)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl Add<usize> for Addr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<usize> for Addr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs
    }
}

impl Sub for Addr {
    type Output = usize;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Sub<usize> for Addr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl SubAssign<usize> for Addr {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 -= rhs
    }
}

impl From<RawPointer> for Addr {
    fn from(value: RawPointer) -> Self {
        Addr(value as usize)
    }
}

impl From<Addr> for RawPointer {
    fn from(value: Addr) -> Self {
        value.0 as RawPointer
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value)
    }
}

impl From<Word> for Addr {
    fn from(value: Word) -> Self {
        Addr(value as usize)
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value as usize)
    }
}

impl From<Addr> for Word {
    fn from(value: Addr) -> Self {
        value.0 as Word
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0 as u64
    }
}
