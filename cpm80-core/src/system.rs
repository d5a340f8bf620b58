//! Machine assembly and orchestration.
//!
//! The expected bring-up order is: load the BDOS image, `setup_bios`,
//! load the user program at 0x0100, `load_fcb`, `reset`, `setup_bdos`,
//! `reset` again, then `run`.

use std::path::Path;

use log::trace;

use crate::error::{CoreError, CoreResult};
use crate::fcb::Fcb;
use crate::hardware::{Config, Hardware};
use crate::terminal::Terminal;

/// Standard load address for CP/M transient programs.
pub const TPA_BASE: u16 = 0x0100;

/// Where the startup FCB is built from the command-line arguments.
const FCB_BASE: u16 = 0x005C;

/// Where the command tail lives: a length byte, then the text.
const COMMAND_TAIL_BASE: u16 = 0x0080;

/// BDOS function 13: reset disk system.
const DRV_ALLRESET: u8 = 13;

pub struct System {
    hardware: Hardware,
}

impl System {
    pub fn new(terminal: Box<dyn Terminal>, config: Config) -> Self {
        Self {
            hardware: Hardware::new(terminal, config),
        }
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut Hardware {
        &mut self.hardware
    }

    /// Install the page-zero vectors and build the BIOS interception over
    /// the loaded BDOS image, then run BOOT/WBOOT so the BIOS data
    /// structures are initialised before any guest code runs.
    pub fn setup_bios(&mut self, fbase: u16, wboot: u16) -> CoreResult<()> {
        self.hardware.set_fbase_and_wboot(fbase, wboot)?;
        self.hardware.call_bios_boot();
        Ok(())
    }

    /// Let the guest BDOS initialise its own data structures by running
    /// its disk-reset entry point under emulation. Memory checks are
    /// suspended: this traffic is setup, not guest behaviour.
    pub fn setup_bdos(&mut self) -> CoreResult<()> {
        self.hardware.check_memory_accesses(false);

        trace!("Directly calling BDOS fn#{}", DRV_ALLRESET);
        self.hardware.call_bdos(DRV_ALLRESET)?;

        self.hardware.check_memory_accesses(true);
        Ok(())
    }

    /// Read a whole binary file into guest RAM at `base`. Transient
    /// programs always load at [`TPA_BASE`]; the BDOS image loads at its
    /// configured base.
    pub fn load_binary(&mut self, base: u16, path: &Path) -> CoreResult<()> {
        let bytes = std::fs::read(path).map_err(|source| CoreError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        trace!(
            "Reading {} bytes into memory at {:04X} from {}",
            bytes.len(),
            base,
            path.display()
        );
        self.hardware.copy_to_ram(&bytes, base);
        Ok(())
    }

    /// Build the startup FCB at 0x005C from up to two program arguments,
    /// and the command tail at 0x0080: a length byte, then each argument
    /// upper-cased with a leading space, then a terminating NUL.
    pub fn load_fcb(&mut self, args: &[String]) -> CoreResult<()> {
        let mut fcb = Fcb::new();
        if let Some(first) = args.first() {
            fcb.set_first(first);
        }
        if let Some(second) = args.get(1) {
            // CP/M only deals with two names.
            fcb.set_second(second);
        }
        self.hardware.copy_to_ram(fcb.bytes(), FCB_BASE);

        let mut tail = String::new();
        for arg in args {
            tail.push(' ');
            tail.push_str(&arg.to_uppercase());
        }
        self.hardware
            .write_byte(COMMAND_TAIL_BASE, tail.len() as u8)?;
        for (i, byte) in tail.bytes().enumerate() {
            self.hardware
                .write_byte(COMMAND_TAIL_BASE + 1 + i as u16, byte)?;
        }
        self.hardware
            .write_byte(COMMAND_TAIL_BASE + 1 + tail.len() as u16, 0x00)?;

        Ok(())
    }

    /// Point the machine at the loaded program: PC at the TPA, a fresh
    /// stack seeded with zero return addresses so a stray RET unwinds to
    /// 0x0000 and terminates through WBOOT.
    pub fn reset(&mut self) -> CoreResult<()> {
        self.hardware.reset();
        self.hardware.registers_mut().pc = TPA_BASE;

        let sp = 0xF800;
        self.hardware.registers_mut().sp = sp;
        self.hardware.write_word(sp, 0x0000)?;
        self.hardware.write_word(sp + 2, 0x0000)?;
        self.hardware.write_word(sp + 4, 0x0000)?;

        self.hardware.check_memory_accesses(true);
        Ok(())
    }

    /// Run the guest until it terminates or a debug action fires.
    pub fn run(&mut self) -> CoreResult<u64> {
        self.hardware.set_finished(false);
        trace!("Starting execution of user code");
        self.hardware.run()
    }

    /// Execute `instruction_count` single instructions.
    pub fn step(&mut self, instruction_count: usize) -> CoreResult<u64> {
        self.hardware.set_finished(false);
        let mut cycles = 0;
        for _ in 0..instruction_count {
            cycles += self.hardware.step_one()?;
        }
        Ok(cycles)
    }
}
