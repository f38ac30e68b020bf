//! # Extraction Module
//!
//! Copies machine code out of the supervisor's own address space.
//!
//! The length of a function can not be derived from its address alone, so it has to be given
//! by the caller. No relocation happens: the copied bytes only work at another address if the
//! code is position independent.

use serde::Serialize;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::Result;
use crate::memorymap::AddressSpaceMap;

/// Bytes copied from a local address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeBlob {
    source: Addr,
    #[serde(skip)]
    bytes: Vec<u8>,
}

impl CodeBlob {
    #[must_use]
    pub fn source(&self) -> Addr {
        self.source
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Reads code from the supervisor's own memory
#[derive(Debug)]
pub struct CodeExtractor {
    own: AddressSpaceMap,
}

impl CodeExtractor {
    /// Snapshots the supervisor's own address space
    ///
    /// Libraries that are loaded after this call are not known to the extractor.
    ///
    /// # Errors
    ///
    /// Fails if the own memory map can not be read.
    pub fn new() -> Result<Self> {
        Ok(Self {
            own: AddressSpaceMap::of_self()?,
        })
    }

    /// Copies `len` bytes starting at `addr`
    ///
    /// # Panics
    ///
    /// Panics if the range is not mapped readable in this process. That is only possible with a
    /// wrong symbol address or length, which can not be recovered from.
    #[must_use]
    pub fn extract(&self, addr: Addr, len: usize) -> CodeBlob {
        if len == 0 {
            return CodeBlob {
                source: addr,
                bytes: Vec::new(),
            };
        }
        assert!(
            self.own.is_readable(addr, len),
            "{len} bytes at {addr} are not readable in the own address space"
        );

        // SAFETY: the range was just checked to be mapped and readable, and u8 has no alignment
        // or validity requirements
        let bytes = unsafe { std::slice::from_raw_parts(addr.usize() as *const u8, len) }.to_vec();
        debug!("extracted {len} bytes from {addr}");
        trace!("code: {bytes:02x?}");

        CodeBlob {
            source: addr,
            bytes,
        }
    }
}
