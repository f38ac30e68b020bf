//! # Symbol Module
//!
//! Resolving the local address of the function that should be injected.
//!
//! [`DlResolver`] loads the library into the supervisor with the dynamic loader and asks it for
//! the symbol. Libraries stay loaded until the resolver is dropped, so addresses it returned stay
//! valid for that long.

use std::ffi::{c_void, CStr, CString};

use tracing::{debug, warn};

use crate::addr::Addr;
use crate::errors::{InjectorError, Result};

/// Turns a library and symbol name into an address in the supervisor's address space
pub trait SymbolResolver {
    fn resolve(&mut self, library: &str, symbol: &str) -> Result<Addr>;
}

/// [`SymbolResolver`] using `dlopen` and `dlsym`
#[derive(Debug, Default)]
pub struct DlResolver {
    handles: Vec<(String, *mut c_void)>,
}

impl DlResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn last_error() -> String {
        // SAFETY: dlerror returns null or a valid C string owned by the loader
        let err = unsafe { nix::libc::dlerror() };
        if err.is_null() {
            "unknown error".to_string()
        } else {
            // SAFETY: checked for null above
            unsafe { CStr::from_ptr(err) }.to_string_lossy().to_string()
        }
    }

    fn handle(&mut self, library: &str, symbol: &str) -> Result<*mut c_void> {
        if let Some((_, handle)) = self.handles.iter().find(|(name, _)| name == library) {
            return Ok(*handle);
        }

        let cname = CString::new(library)?;
        // SAFETY: cname is a valid C string, the handle is closed in Drop
        let handle = unsafe { nix::libc::dlopen(cname.as_ptr(), nix::libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(InjectorError::SymbolNotFound {
                library: library.to_string(),
                symbol: symbol.to_string(),
                reason: Self::last_error(),
            });
        }
        debug!("loaded {library}");
        self.handles.push((library.to_string(), handle));
        Ok(handle)
    }
}

impl SymbolResolver for DlResolver {
    fn resolve(&mut self, library: &str, symbol: &str) -> Result<Addr> {
        let handle = self.handle(library, symbol)?;
        let csym = CString::new(symbol)?;
        // SAFETY: handle came from dlopen and is still open, csym is a valid C string
        let addr = unsafe { nix::libc::dlsym(handle, csym.as_ptr()) };
        if addr.is_null() {
            return Err(InjectorError::SymbolNotFound {
                library: library.to_string(),
                symbol: symbol.to_string(),
                reason: Self::last_error(),
            });
        }
        let addr = Addr::from(addr);
        debug!("{symbol} in {library} is at {addr}");
        Ok(addr)
    }
}

impl Drop for DlResolver {
    fn drop(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            // SAFETY: every handle was returned by dlopen and is closed exactly once
            if unsafe { nix::libc::dlclose(handle) } != 0 {
                warn!("could not unload {name}: {}", Self::last_error());
            }
        }
    }
}
