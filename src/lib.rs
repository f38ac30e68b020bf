//! # Coreinject
//!
//! Places the machine code of a function into another process and makes that process call it.
//!
//! The supervisor attaches to the traced process with ptrace, stops it at a breakpoint, copies a
//! function out of a library loaded into its own address space, writes it into the traced
//! process and then rewrites a function pointer slot (usually a GOT entry) so that calls through
//! it end up in the injected code.
//!
//! The pieces, roughly in the order they are used:
//!
//! - [`memorymap`]: snapshots of the mapped ranges of a process and the gaps between them
//! - [`placement`]: picking a landing address within 32 bit reach of a reference address
//! - [`symbols`] and [`extract`]: resolving and copying the function in the supervisor
//! - [`tracer`] and [`session`]: controlling the traced process
//! - [`breakpoint`]: the one software breakpoint used to stop it
//! - [`remote`]: byte exact memory transfers into and out of the traced process
//! - [`redirect`]: patching the function pointer slot
//! - [`injector`]: all of the above in order, driven by a [`config::InjectionConfig`]
//!
//! Only x86_64 Linux is supported.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("coreinject only supports x86_64 Linux");

pub mod addr;
pub mod breakpoint;
pub mod config;
pub mod errors;
pub mod extract;
pub mod injector;
pub mod memorymap;
pub mod placement;
pub mod redirect;
pub mod remote;
pub mod session;
pub mod symbols;
pub mod tracer;

#[cfg(test)]
pub(crate) mod testing;

pub use addr::Addr;
pub use errors::{InjectorError, Result};

/// One machine word of the traced process, the unit of ptrace memory access
pub type Word = i64;

pub const WORD_BYTES: usize = std::mem::size_of::<Word>();
