//! # Redirect Module
//!
//! Patching a function pointer slot of the traced process, usually an entry of its global
//! offset table. Every call that goes through the slot afterwards lands at the new address.

use tracing::info;

use crate::addr::Addr;
use crate::errors::Result;
use crate::remote::{RemoteMemory, WordMemory, WriteStats};
use crate::Word;

/// Result of a redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirection {
    pub slot: Addr,
    pub previous: Addr,
    pub replacement: Addr,
    pub stats: WriteStats,
}

pub struct ControlFlowRedirector;

impl ControlFlowRedirector {
    /// Points the slot at `slot` to `replacement` and verifies it by reading it back
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::VerificationMismatch`](crate::errors::InjectorError) if the
    /// slot does not hold `replacement` afterwards, or the error of the word access.
    pub fn redirect(
        mem: &mut (impl WordMemory + ?Sized),
        slot: Addr,
        replacement: Addr,
    ) -> Result<Redirection> {
        let mut remote = RemoteMemory::new(mem);
        let previous = Addr::from(remote.read_word(slot)?);
        let stats = remote.write_verified(slot, &Word::from(replacement).to_ne_bytes())?;
        info!("redirected slot {slot}: {previous} -> {replacement}");
        Ok(Redirection {
            slot,
            previous,
            replacement,
            stats,
        })
    }

    /// Puts the previous value of a redirection back
    ///
    /// # Errors
    ///
    /// Same as [`Self::redirect`].
    pub fn restore(mem: &mut (impl WordMemory + ?Sized), redirection: &Redirection) -> Result<()> {
        Self::redirect(mem, redirection.slot, redirection.previous)?;
        Ok(())
    }
}
