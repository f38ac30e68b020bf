use thiserror::Error;

use crate::addr::Addr;
use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, InjectorError>;

#[derive(Error, Debug)]
pub enum InjectorError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not read the memory map of process {pid}: {reason}")]
    MapParse { pid: i32, reason: String },
    #[error("Could not attach to process {pid}: {source}")]
    Attach { pid: i32, source: nix::Error },
    #[error("No free region within a 32 bit displacement of {target} has room for {len} bytes")]
    NoPlacementFound { target: Addr, len: usize },
    #[error("The traced process has exited")]
    TargetExited,
    #[error("Read back at {addr} does not match what was written: expected {expected:02x?}, got {actual:02x?}")]
    VerificationMismatch {
        addr: Addr,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    #[error("Operation needs the session to be {expected}, but it is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },
    #[error("A breakpoint is already installed at {0}")]
    BreakpointAlreadyInstalled(Addr),
    #[error("No mapping of the traced process matches the module name {0:?}")]
    ModuleNotMapped(String),
    #[error("Could not resolve symbol {symbol:?} in {library:?}: {reason}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
}
