//! CP/M 2.2 emulator core.
//!
//! A genuine CP/M 2.2 BDOS/CCP binary image runs unmodified inside a full
//! Z80 emulation; only the layer below it - the BIOS - is intercepted and
//! translated into host file and terminal I/O. That keeps the authentic
//! CP/M file-system semantics of the real BDOS while the host provides
//! the storage.
//!
//! # Architecture
//!
//! - [`cpu::Cpu`]: the Z80 interpreter, talking to the machine through the
//!   [`cpu::Bus`] trait.
//! - [`hardware::Hardware`]: owns RAM, CPU, BIOS, watch sets and symbols;
//!   implements the bus, including memory-access checking and BDOS/BIOS
//!   interception.
//! - [`bios::Bios`]: rewrites the guest BIOS jump table into RET stubs and
//!   services the intercepted calls against the emulated [`disk::Disk`]
//!   and a [`terminal::Terminal`].
//! - [`system::System`]: bring-up and run orchestration.

pub mod bdos;
pub mod bios;
pub mod cpu;
pub mod debug;
pub mod disk;
pub mod error;
pub mod fcb;
pub mod hardware;
pub mod memory;
pub mod registers;
pub mod symbols;
pub mod system;
pub mod terminal;

pub use cpu::{Bus, Cpu};
pub use debug::DebugAction;
pub use error::{CoreError, CoreResult};
pub use hardware::{Config, Hardware};
pub use registers::{InterruptMode, Registers};
pub use symbols::SymbolTable;
pub use system::{System, TPA_BASE};
pub use terminal::{HeadlessTerminal, Terminal};
