//! The machine: RAM, CPU, BIOS, watch sets, symbols and console glued
//! together.
//!
//! `Hardware` owns every component. The CPU cannot hold a reference back
//! to its owner, so each emulation call builds a short-lived [`HostBus`]
//! view over the non-CPU fields and lends it to the CPU; that view is
//! where memory-access checking, port I/O and BDOS/BIOS interception
//! live.

use std::collections::HashSet;
use std::path::PathBuf;

use log::{info, trace, warn};

use crate::bdos;
use crate::bios::{Bios, BiosCtx};
use crate::cpu::{Bus, Cpu};
use crate::disk::Disk;
use crate::error::{CoreError, CoreResult};
use crate::memory::{dump_to_log, Ram};
use crate::registers::Registers;
use crate::symbols::SymbolTable;
use crate::terminal::Terminal;

/// Namespace for the emulator's own symbols.
const OWN_NAMESPACE: &str = "CPM80";

/// Handler for Z80 `IN`: given the port, produce the byte. An error is
/// logged and reads as zero.
pub type InputHandler = Box<dyn FnMut(u8) -> Result<u8, Box<dyn std::error::Error>>>;

/// Handler for Z80 `OUT`. An error is logged and the write is dropped.
pub type OutputHandler = Box<dyn FnMut(u8, u8) -> Result<(), Box<dyn std::error::Error>>>;

/// Behaviour switches, fixed for the lifetime of the machine.
pub struct Config {
    /// Master switch for memory-access checking.
    pub memcheck: bool,
    /// Log each BDOS call as it is entered.
    pub log_bdos: bool,
    /// Treat writes to the warm-start vector (0x0000-0x0002) as fatal.
    pub protect_warm_vector: bool,
    /// Treat writes to the BDOS jump (0x0005-0x0007) as fatal.
    pub protect_bdos_jump: bool,
    /// Optional symbol files for the BDOS image and the user program.
    pub bdos_sym: Option<PathBuf>,
    pub user_sym: Option<PathBuf>,
    /// Name of the log sink; the disk scanner must skip it.
    pub logfile_name: String,
    /// Host directory exposed as the CP/M disk.
    pub disk_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memcheck: true,
            log_bdos: true,
            protect_warm_vector: true,
            protect_bdos_jump: true,
            bdos_sym: None,
            user_sym: None,
            logfile_name: "zcpm.log".to_string(),
            disk_root: PathBuf::from("."),
        }
    }
}

pub struct Hardware {
    cpu: Cpu,
    ram: Ram,
    watch_read: HashSet<u16>,
    watch_write: HashSet<u16>,
    symbols: SymbolTable,
    terminal: Box<dyn Terminal>,
    bios: Option<Bios>,
    config: Config,
    /// Temporary override used to suppress checks while the emulator
    /// itself rearranges memory.
    checks_enabled: bool,
    finished: bool,
    fbase: u16,
    input_handler: Option<InputHandler>,
    output_handler: Option<OutputHandler>,
}

impl Hardware {
    pub fn new(terminal: Box<dyn Terminal>, config: Config) -> Self {
        let mut hardware = Self {
            cpu: Cpu::new(),
            ram: Ram::new(),
            watch_read: HashSet::new(),
            watch_write: HashSet::new(),
            symbols: SymbolTable::new(),
            terminal,
            bios: None,
            config,
            checks_enabled: false,
            finished: false,
            fbase: 0,
            input_handler: None,
            output_handler: None,
        };

        // Monitor any write in page zero, and reads everywhere in page
        // zero except the BDOS/BIOS jump vectors.
        hardware.add_watch_write(0x0000, 0x0100);
        hardware.add_watch_read(0x0003, 2);
        hardware.add_watch_read(0x0008, 0x0100 - 8);

        for (path, namespace) in [
            (hardware.config.bdos_sym.clone(), "BDOS"),
            (hardware.config.user_sym.clone(), "USER"),
        ] {
            if let Some(path) = path {
                if let Err(e) = hardware.symbols.load(&path, namespace) {
                    warn!("{}", e);
                }
            }
        }

        // Accesses right at the top of memory come from the startup BDOS
        // call; label them so the logs stay readable.
        hardware.add_symbol(0xFFF0, "TBD!");

        hardware
    }

    /// Record where FBASE is, point page zero at WBOOT and the BDOS entry,
    /// and build the BIOS (which rewrites the guest jump table).
    pub fn set_fbase_and_wboot(&mut self, fbase: u16, wboot: u16) -> CoreResult<()> {
        self.fbase = fbase;

        self.write_byte(0x0000, 0xC3)?;
        self.write_byte(0x0001, wboot as u8)?;
        self.write_byte(0x0002, (wboot >> 8) as u8)?;

        self.write_byte(0x0005, 0xC3)?;
        self.write_byte(0x0006, fbase as u8)?;
        self.write_byte(0x0007, (fbase >> 8) as u8)?;

        let disk = Disk::new(&self.config.disk_root, &self.config.logfile_name);
        let bios = Bios::new(&mut self.ram, disk)?;
        let layout = *bios.layout();
        self.bios = Some(bios);

        let dph_len = layout.dph_top - layout.dph_base + 1;
        self.add_watch_read(layout.dph_base, dph_len);
        self.add_watch_write(layout.dph_base, dph_len);

        self.add_symbol(layout.dph_base, "DPHBASE");
        self.add_symbol(layout.dirbuf, "DIRBF");
        self.add_symbol(layout.dpb, "HDBLK");
        self.add_symbol(layout.alv, "ALLHD1");
        self.add_symbol(layout.dph_top, "DPHTOP");

        Ok(())
    }

    /// Run BIOS BOOT and the setup half of WBOOT directly, so the BIOS
    /// data structures are live before any guest code runs.
    pub fn call_bios_boot(&mut self) {
        if let Some(bios) = self.bios.as_mut() {
            bios.boot(&mut self.ram);
            bios.wboot_init(self.cpu.registers_mut());
        }
    }

    /// Call a BDOS function by seeding C and entering through 0x0005.
    pub fn call_bdos(&mut self, function: u8) -> CoreResult<u64> {
        self.cpu.registers_mut().set_c(function);
        self.cpu.registers_mut().pc = 0x0005;
        self.run()
    }

    pub fn reset(&mut self) {
        self.cpu.reset_state();
    }

    pub fn run(&mut self) -> CoreResult<u64> {
        self.finished = false;
        self.with_bus(|cpu, bus| cpu.emulate(bus))
    }

    /// Execute exactly one instruction.
    pub fn step_one(&mut self) -> CoreResult<u64> {
        self.with_bus(|cpu, bus| cpu.emulate_instruction(bus))
    }

    pub fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn registers(&self) -> &Registers {
        self.cpu.registers()
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        self.cpu.registers_mut()
    }

    pub fn bios(&self) -> Option<&Bios> {
        self.bios.as_ref()
    }

    pub fn set_input_handler(&mut self, handler: InputHandler) {
        self.input_handler = Some(handler);
    }

    pub fn set_output_handler(&mut self, handler: OutputHandler) {
        self.output_handler = Some(handler);
    }

    pub fn add_watch_read(&mut self, base: u16, count: u16) {
        for address in base..base.saturating_add(count) {
            self.watch_read.insert(address);
        }
    }

    pub fn add_watch_write(&mut self, base: u16, count: u16) {
        for address in base..base.saturating_add(count) {
            self.watch_write.insert(address);
        }
    }

    pub fn add_symbol(&mut self, address: u16, label: &str) {
        self.symbols.add(OWN_NAMESPACE, address, label);
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn evaluate_address_expression(&self, s: &str) -> Option<u16> {
        self.symbols.evaluate_address_expression(s)
    }

    pub fn dump_symbol_table(&self) {
        self.symbols.dump();
    }

    /// Checked single-byte access, as the guest would see it.
    pub fn read_byte(&mut self, address: u16) -> u8 {
        self.with_bus(|_, bus| bus.read_byte(address))
    }

    pub fn read_word(&mut self, address: u16) -> u16 {
        self.with_bus(|_, bus| bus.read_word(address))
    }

    pub fn write_byte(&mut self, address: u16, value: u8) -> CoreResult<()> {
        self.with_bus(|_, bus| bus.write_byte(address, value))
    }

    pub fn write_word(&mut self, address: u16, value: u16) -> CoreResult<()> {
        self.with_bus(|_, bus| bus.write_word(address, value))
    }

    /// Unconditional bulk loads bypass the watch machinery entirely.
    pub fn copy_to_ram(&mut self, buffer: &[u8], base: u16) {
        self.ram.copy_to_ram(buffer, base);
    }

    pub fn copy_from_ram(&self, buffer: &mut [u8], base: u16) {
        self.ram.copy_from_ram(buffer, base);
    }

    pub fn dump(&self, base: u16, count: usize) {
        dump_to_log(&self.ram, base, count);
    }

    /// Temporarily enable or disable memory-access checks. A no-op when
    /// the master switch is off.
    pub fn check_memory_accesses(&mut self, enable: bool) {
        if self.config.memcheck && self.checks_enabled != enable {
            info!(
                "{} memory access checks",
                if enable { "Enabling" } else { "Disabling" }
            );
            self.checks_enabled = enable;
        }
    }

    /// Human-readable backtrace fragment from the guest stack, used on
    /// BDOS/BIOS log lines.
    pub fn format_stack_info(&self) -> String {
        stack_trail(&self.ram, &self.symbols, self.registers().sp, self.fbase)
    }

    fn with_bus<T>(&mut self, f: impl FnOnce(&mut Cpu, &mut HostBus) -> T) -> T {
        let Self {
            cpu,
            ram,
            watch_read,
            watch_write,
            symbols,
            terminal,
            bios,
            config,
            checks_enabled,
            finished,
            fbase,
            input_handler,
            output_handler,
        } = self;

        let mut bus = HostBus {
            ram,
            watch_read,
            watch_write,
            symbols,
            terminal: terminal.as_mut(),
            bios: bios.as_mut(),
            config,
            checks_enabled: *checks_enabled,
            finished,
            fbase: *fbase,
            input_handler,
            output_handler,
            last_pc: cpu.effective_pc(),
        };

        f(cpu, &mut bus)
    }
}

/// The CPU's view of the machine for one emulation call.
struct HostBus<'a> {
    ram: &'a mut Ram,
    watch_read: &'a HashSet<u16>,
    watch_write: &'a HashSet<u16>,
    symbols: &'a SymbolTable,
    terminal: &'a mut dyn Terminal,
    bios: Option<&'a mut Bios>,
    config: &'a Config,
    checks_enabled: bool,
    finished: &'a mut bool,
    fbase: u16,
    input_handler: &'a mut Option<InputHandler>,
    output_handler: &'a mut Option<OutputHandler>,
    /// Instruction address most recently offered for interception; gives
    /// watch-hit lines their "at PC=" context.
    last_pc: u16,
}

impl HostBus<'_> {
    fn checks_on(&self) -> bool {
        self.config.memcheck && self.checks_enabled
    }

    fn describe(&self, address: u16) -> String {
        describe_address(self.symbols, address)
    }

    fn is_fatal_write(&self, address: u16) -> bool {
        // Some programs hook themselves in by rewriting the warm-start
        // vector; debuggers patch the BDOS jump. Both are configurable.
        (address <= 0x0002 && self.config.protect_warm_vector)
            || ((0x0005..=0x0007).contains(&address) && self.config.protect_bdos_jump)
    }

    fn in_bios_region(&self, address: u16) -> bool {
        self.bios.as_ref().is_some_and(|bios| bios.is_bios(address))
    }

    fn check_write(&self, address: u16, value: u8) -> CoreResult<()> {
        if !self.checks_on() {
            return Ok(());
        }
        if self.watch_write.contains(&address) {
            trace!(
                "    {:02X} -> {} at PC={}",
                value,
                self.describe(address),
                self.describe(self.last_pc)
            );
            if self.is_fatal_write(address) {
                return Err(CoreError::FatalWrite {
                    address,
                    value,
                    pc: self.last_pc,
                });
            }
        }
        if self.in_bios_region(address) {
            info!(
                "BIOS write to {} at PC={}",
                self.describe(address),
                self.describe(self.last_pc)
            );
            return Err(CoreError::BiosWrite {
                address,
                pc: self.last_pc,
            });
        }
        Ok(())
    }
}

impl Bus for HostBus<'_> {
    fn read_byte(&mut self, address: u16) -> u8 {
        let value = self.ram.get(address);
        if self.checks_on() && self.watch_read.contains(&address) {
            trace!(
                "    {:02X} <- {} at PC={}",
                value,
                self.describe(address),
                self.describe(self.last_pc)
            );
        }
        value
    }

    fn read_word(&mut self, address: u16) -> u16 {
        let value = self.ram.get_word(address);
        if self.checks_on()
            && (self.watch_read.contains(&address)
                || self.watch_read.contains(&address.wrapping_add(1)))
        {
            trace!(
                "  {:04X} <- {} at PC={}",
                value,
                self.describe(address),
                self.describe(self.last_pc)
            );
        }
        value
    }

    fn write_byte(&mut self, address: u16, value: u8) -> CoreResult<()> {
        self.check_write(address, value)?;
        self.ram.set(address, value);
        Ok(())
    }

    fn write_word(&mut self, address: u16, value: u16) -> CoreResult<()> {
        if self.checks_on() {
            if self.watch_write.contains(&address)
                || self.watch_write.contains(&address.wrapping_add(1))
            {
                trace!(
                    "  {:04X} -> {} at PC={}",
                    value,
                    self.describe(address),
                    self.describe(self.last_pc)
                );
                if self.is_fatal_write(address) {
                    return Err(CoreError::FatalWrite {
                        address,
                        value: value as u8,
                        pc: self.last_pc,
                    });
                }
            }
            if self.in_bios_region(address) || self.in_bios_region(address.wrapping_add(1)) {
                info!(
                    "BIOS write to {} at PC={}",
                    self.describe(address),
                    self.describe(self.last_pc)
                );
                return Err(CoreError::BiosWrite {
                    address,
                    pc: self.last_pc,
                });
            }
        }
        self.ram.set_word(address, value);
        Ok(())
    }

    fn input_byte(&mut self, port: u8) -> u8 {
        match self.input_handler.as_mut() {
            Some(handler) => match handler(port) {
                Ok(value) => value,
                Err(e) => {
                    info!("Error in user input handler: {}", e);
                    0
                }
            },
            None => 0,
        }
    }

    fn output_byte(&mut self, port: u8, value: u8) {
        if let Some(handler) = self.output_handler.as_mut() {
            if let Err(e) = handler(port, value) {
                info!("Error in user output handler: {}", e);
            }
        }
    }

    fn running(&self) -> bool {
        !*self.finished
    }

    fn set_finished(&mut self, finished: bool) {
        *self.finished = finished;
    }

    fn intercept(&mut self, pc: u16, regs: &mut Registers) -> CoreResult<bool> {
        self.last_pc = pc;

        // BDOS calls are logged but never intercepted: a real BDOS is
        // running inside the emulation and will do the work itself,
        // calling back into our BIOS for the physical I/O.
        if pc == self.fbase {
            if self.config.log_bdos {
                let (name, description) = bdos::describe_call(regs, self.ram);
                let trail = stack_trail(self.ram, self.symbols, regs.sp, self.fbase);
                info!("BDOS: {}{}", name, trail);
                info!("BDOS: {}", description);
            }
            return Ok(false);
        }

        if let Some(bios) = self.bios.as_mut() {
            if bios.in_stubs(pc) {
                let trail = stack_trail(self.ram, self.symbols, regs.sp, self.fbase);
                let ctx = BiosCtx {
                    ram: &mut *self.ram,
                    regs,
                    terminal: &mut *self.terminal,
                    finished: &mut *self.finished,
                    trail: &trail,
                };
                return bios.check_and_handle(pc, ctx);
            }
        }

        Ok(false)
    }
}

fn describe_address(symbols: &SymbolTable, address: u16) -> String {
    if symbols.is_empty() {
        format!("{:04X}", address)
    } else {
        format!("{:04X} ({})", address, symbols.describe(address))
    }
}

/// Walk up to four return addresses from SP, stopping once the trail
/// reaches user space or the startup sentinel near the top of memory.
/// Stack words hold return addresses; displaying them minus 3 points at
/// the call site, hence the `+3` suffix.
fn stack_trail(ram: &Ram, symbols: &SymbolTable, sp: u16, fbase: u16) -> String {
    const MAX_STEPS: u16 = 4;

    let mut out = String::new();
    let mut step = 0;
    while step < MAX_STEPS {
        let ret = ram.get_word(sp.wrapping_add(step * 2)).wrapping_sub(3);
        out.push_str(&format!(" << {}+3", describe_address(symbols, ret)));
        if (0x0100..fbase).contains(&ret) || ret >= 0xFFF0 {
            // User space or the startup frames: nothing useful beyond.
            break;
        }
        step += 1;
    }
    out
}
