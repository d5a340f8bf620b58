//! Error types for the emulator core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort emulation or machine setup.
///
/// Guest-visible I/O problems (a host file missing during a BIOS sector
/// read, a short write on flush) are *not* errors at this level: they are
/// logged and the BIOS call returns a status byte to the guest.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Can't load '{path}': {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("BIOS jump table not found")]
    BiosTableNotFound,

    #[error("Aborting: illegal memory write of {value:#04X} to {address:#06X} at PC={pc:#06X}")]
    FatalWrite { address: u16, value: u8, pc: u16 },

    #[error("BIOS tampering: write to {address:#06X} at PC={pc:#06X}")]
    BiosWrite { address: u16, pc: u16 },

    #[error("BIOS function #{0} is not implemented")]
    UnimplementedBios(u8),

    #[error("Can't open symbol file '{path}': {source}")]
    SymbolFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
