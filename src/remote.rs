//! # Remote Memory Module
//!
//! Byte exact transfers between local buffers and the memory of the traced process.
//!
//! The OS only lets the supervisor move whole machine words in and out of the traced process.
//! [`RemoteMemory`] builds byte ranges on top of that: a buffer is written as a sequence of
//! independent word writes, and a trailing partial word is composed with the bytes that are
//! already there (read, overlay, write back), so nothing past the end of the buffer is changed.
//!
//! Transfers are not atomic across words. If something else resumes the traced process in the
//! middle of a transfer, it can observe a half written buffer.

use serde::Serialize;
use tracing::trace;

use crate::addr::Addr;
use crate::errors::{InjectorError, Result};
use crate::{Word, WORD_BYTES};

/// Word granular access to the memory of some process
pub trait WordMemory {
    fn read_word(&mut self, addr: Addr) -> Result<Word>;
    fn write_word(&mut self, addr: Addr, value: Word) -> Result<()>;
}

/// What a call to [`RemoteMemory::write_bytes`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    /// Words that were overwritten completely
    pub full_words: usize,
    /// Words that were read, partially overlaid and written back
    pub partial_words: usize,
}

/// Byte range reader and writer on top of a [`WordMemory`]
pub struct RemoteMemory<'m, M: WordMemory + ?Sized> {
    mem: &'m mut M,
}

impl<'m, M: WordMemory + ?Sized> RemoteMemory<'m, M> {
    pub fn new(mem: &'m mut M) -> Self {
        Self { mem }
    }

    #[inline]
    pub fn read_word(&mut self, addr: Addr) -> Result<Word> {
        self.mem.read_word(addr)
    }

    #[inline]
    pub fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
        self.mem.write_word(addr, value)
    }

    /// Reads `len` bytes starting at `addr`
    ///
    /// Whole words are read, so the word containing the last byte must be readable as a whole.
    ///
    /// # Errors
    ///
    /// Fails if any of the word reads fails.
    pub fn read_bytes(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.next_multiple_of(WORD_BYTES));
        let mut cursor = addr;
        while buf.len() < len {
            buf.extend_from_slice(&self.mem.read_word(cursor)?.to_ne_bytes());
            cursor += WORD_BYTES;
        }
        buf.truncate(len);
        Ok(buf)
    }

    /// Writes `data` starting at `addr`
    ///
    /// If the length of `data` is not a multiple of the word size, the last word is read first
    /// and only its leading bytes are replaced.
    ///
    /// # Errors
    ///
    /// Fails if any of the word reads or writes fails. Words before the failing one have already
    /// been written at that point.
    pub fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<WriteStats> {
        let mut stats = WriteStats::default();
        let mut cursor = addr;

        for chunk in data.chunks(WORD_BYTES) {
            let mut bytes = if chunk.len() == WORD_BYTES {
                stats.full_words += 1;
                [0u8; WORD_BYTES]
            } else {
                stats.partial_words += 1;
                trace!("partial word at {cursor}: {} of {WORD_BYTES} bytes", chunk.len());
                self.mem.read_word(cursor)?.to_ne_bytes()
            };
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.mem.write_word(cursor, Word::from_ne_bytes(bytes))?;
            cursor += WORD_BYTES;
        }

        Ok(stats)
    }

    /// Writes `data` and reads it back
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::VerificationMismatch`] if the read back bytes differ from `data`.
    /// This is never retried, a mismatch means something else is changing that memory.
    pub fn write_verified(&mut self, addr: Addr, data: &[u8]) -> Result<WriteStats> {
        let stats = self.write_bytes(addr, data)?;
        let actual = self.read_bytes(addr, data.len())?;
        if actual != data {
            return Err(InjectorError::VerificationMismatch {
                addr,
                expected: data.to_vec(),
                actual,
            });
        }
        trace!("verified {} bytes at {addr}", data.len());
        Ok(stats)
    }
}
