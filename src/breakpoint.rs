//! # Breakpoint Module
//!
//! A single software breakpoint in the traced process.
//!
//! Installing the breakpoint replaces the byte at its address with `int3` and remembers the
//! byte it replaced. When the traced process executes it, it stops with `SIGTRAP` and the
//! program counter points one byte past the breakpoint address. Removing writes the original
//! byte back.

use serde::Serialize;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::{InjectorError, Result};
use crate::remote::WordMemory;
use crate::Word;

pub const MASK_ALL: Word = -1; // yup for real, two's complement
pub const INT3_BYTE: u8 = 0xcc;
pub const INT3: Word = INT3_BYTE as Word;
pub const WORD_MASK: Word = 0x00000000000000ff;
pub const WORD_MASK_INV: Word = MASK_ALL ^ WORD_MASK;

/// An installed breakpoint and the byte it replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Breakpoint {
    addr: Addr,
    saved_data: u8,
}

impl Breakpoint {
    #[inline]
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    #[inline]
    #[must_use]
    pub fn saved_data(&self) -> u8 {
        self.saved_data
    }
}

/// Keeps track of the one breakpoint that may be installed at a time
#[derive(Debug, Default)]
pub struct BreakpointManager {
    current: Option<Breakpoint>,
}

impl BreakpointManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.current.is_some()
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<Breakpoint> {
        self.current
    }

    /// Address the breakpoint was installed at, given the program counter after the trap
    #[inline]
    #[must_use]
    pub fn hit_address(pc: Addr) -> Addr {
        pc - 1usize
    }

    /// Whether a trap with program counter `pc` came from the installed breakpoint
    #[must_use]
    pub fn was_hit(&self, pc: Addr) -> bool {
        self.current
            .is_some_and(|bp| pc > Addr::NULL && bp.addr == Self::hit_address(pc))
    }

    /// Patches `int3` into the low byte of the word at `addr`
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::BreakpointAlreadyInstalled`] if a breakpoint is installed
    /// already, or the error of the underlying word access.
    pub fn install(&mut self, mem: &mut (impl WordMemory + ?Sized), addr: Addr) -> Result<()> {
        if let Some(bp) = self.current {
            return Err(InjectorError::BreakpointAlreadyInstalled(bp.addr));
        }

        let data_word: Word = mem.read_word(addr)?;
        trace!("original word: {data_word:016x}");
        let saved_data = (data_word & WORD_MASK) as u8;
        let data_word_modified: Word = (data_word & WORD_MASK_INV) | INT3;
        trace!("modified word: {data_word_modified:016x}");
        mem.write_word(addr, data_word_modified)?;

        self.current = Some(Breakpoint { addr, saved_data });
        debug!("installed breakpoint at {addr}, saved byte {saved_data:02x}");
        Ok(())
    }

    /// Writes the saved byte back
    ///
    /// Does nothing if no breakpoint is installed. Returns the breakpoint that was removed.
    ///
    /// # Errors
    ///
    /// Fails if the word access fails. The breakpoint stays recorded in that case.
    pub fn remove(&mut self, mem: &mut (impl WordMemory + ?Sized)) -> Result<Option<Breakpoint>> {
        let Some(bp) = self.current else {
            return Ok(None);
        };

        let data_word: Word = mem.read_word(bp.addr)?;
        trace!("patched word: {data_word:016x}");
        let data_word_restored: Word = (data_word & WORD_MASK_INV) | Word::from(bp.saved_data);
        trace!("restored word: {data_word_restored:016x}");
        mem.write_word(bp.addr, data_word_restored)?;

        self.current = None;
        debug!("removed breakpoint at {}", bp.addr);
        Ok(Some(bp))
    }

    /// Drops the record without touching memory, for when the process is gone
    pub(crate) fn forget(&mut self) -> Option<Breakpoint> {
        self.current.take()
    }
}
