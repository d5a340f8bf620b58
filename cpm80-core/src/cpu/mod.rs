//! Z80 instruction-set interpreter.
//!
//! The CPU owns the register file and the debug actions; memory, port I/O
//! and the pre-instruction observer arrive through a [`Bus`] borrowed for
//! the duration of each call, so the owning machine can service BIOS
//! interceptions with full access to its own state.
//!
//! Before every opcode byte (prefixes included) the loop checks the
//! termination sentinel at 0x0008, asks the bus whether it should still be
//! running, and offers the PC for BDOS/BIOS interception. Cycle counts are
//! charged 4 per opcode byte, 3 per byte and 6 per word of memory traffic,
//! plus the per-instruction extras of the real device.

mod alu;
mod decode;


use std::collections::BTreeMap;

use log::{info, trace};

use crate::debug::DebugAction;
use crate::error::CoreResult;
use crate::registers::{InterruptMode, Registers};

use self::alu::{OVERFLOW, SZYXP_FLAGS, SZYX_FLAGS};
use self::decode::{admits_index_prefix, cb_op, ed_op, main_op, p, q, y, z, Op};
use self::flags::{C, H, HC, N, PV, SYX, SZ, SZC, SZPV, YX, Z};

/// Z80 flag bits within the F register.
pub mod flags {
    pub const S: u8 = 0x80;
    pub const Z: u8 = 0x40;
    pub const Y: u8 = 0x20;
    pub const H: u8 = 0x10;
    pub const X: u8 = 0x08;
    pub const PV: u8 = 0x04;
    pub const N: u8 = 0x02;
    pub const C: u8 = 0x01;

    pub(crate) const SZ: u8 = S | Z;
    pub(crate) const YX: u8 = Y | X;
    pub(crate) const SZC: u8 = S | Z | C;
    pub(crate) const SZPV: u8 = S | Z | PV;
    pub(crate) const SYX: u8 = S | Y | X;
    pub(crate) const HC: u8 = H | C;
}

/// The CPU's window onto the rest of the machine.
///
/// Reads are infallible; writes can fail with a fatal memory violation
/// which unwinds the fetch loop. `intercept` runs before every opcode
/// byte and is where BDOS logging and BIOS servicing happen.
pub trait Bus {
    fn read_byte(&mut self, address: u16) -> u8;
    fn read_word(&mut self, address: u16) -> u16;
    fn write_byte(&mut self, address: u16, value: u8) -> CoreResult<()>;
    fn write_word(&mut self, address: u16, value: u16) -> CoreResult<()>;

    fn input_byte(&mut self, port: u8) -> u8;
    fn output_byte(&mut self, port: u8, value: u8);

    /// Should the fetch loop keep going?
    fn running(&self) -> bool;
    fn set_finished(&mut self, finished: bool);

    /// Offer the PC for BDOS/BIOS interception; returns true if a BIOS
    /// stub was serviced.
    fn intercept(&mut self, pc: u16, regs: &mut Registers) -> CoreResult<bool>;
}

/// Which register set DD/FD prefixes have selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexPrefix {
    None,
    Ix,
    Iy,
}

/// Which opcode table the current byte decodes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Main,
    Cb,
    Ed,
}

pub struct Cpu {
    pub(crate) regs: Registers,
    /// Address of the first byte of the instruction in flight. The live
    /// `pc` advances byte by byte inside the loop; this is what debuggers
    /// and interception want to see.
    effective_pc: u16,
    actions: BTreeMap<u16, Vec<DebugAction>>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            effective_pc: 0,
            actions: BTreeMap::new(),
        }
    }

    /// Power-on state: AF=SP=0xFFFF, everything else cleared, IM0.
    pub fn reset_state(&mut self) {
        self.regs.reset();
        self.effective_pc = 0;
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// The address of the instruction currently (or most recently) in
    /// flight, as opposed to the byte-by-byte fetch position.
    pub fn effective_pc(&self) -> u16 {
        self.effective_pc
    }

    /// Run instructions until the bus stops us (termination sentinel,
    /// WBOOT interception, debug action) or HALT. Returns elapsed cycles.
    pub fn emulate<B: Bus>(&mut self, bus: &mut B) -> CoreResult<u64> {
        self.effective_pc = self.regs.pc;
        let opcode = bus.read_byte(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.run(bus, opcode, true, 0, 0)
    }

    /// Execute exactly one instruction, prefixes included.
    pub fn emulate_instruction<B: Bus>(&mut self, bus: &mut B) -> CoreResult<u64> {
        self.effective_pc = self.regs.pc;
        let opcode = bus.read_byte(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        self.run(bus, opcode, false, 0, 0)
    }

    /// Accept a maskable interrupt with `data_on_bus` on the data lines.
    /// Returns the cycles consumed, zero if interrupts are disabled.
    pub fn interrupt<B: Bus>(&mut self, bus: &mut B, data_on_bus: u8) -> CoreResult<u64> {
        if !self.regs.iff1 {
            return Ok(0);
        }
        self.regs.iff1 = false;
        self.regs.iff2 = false;
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);

        match self.regs.im {
            // The byte on the bus is decoded as an opcode, normally RST n;
            // accepting it costs 2 cycles on top of the instruction.
            InterruptMode::Im0 => self.run(bus, data_on_bus, false, 2, 4),
            InterruptMode::Im1 => {
                self.regs.sp = self.regs.sp.wrapping_sub(2);
                bus.write_word(self.regs.sp, self.regs.pc)?;
                self.regs.pc = 0x0038;
                Ok(13)
            }
            InterruptMode::Im2 => {
                self.regs.sp = self.regs.sp.wrapping_sub(2);
                bus.write_word(self.regs.sp, self.regs.pc)?;
                let vector = ((self.regs.i as u16) << 8) | data_on_bus as u16;
                self.regs.pc = bus.read_word(vector);
                Ok(19)
            }
        }
    }

    /// Accept a non-maskable interrupt (11 cycles).
    pub fn non_maskable_interrupt<B: Bus>(&mut self, bus: &mut B) -> CoreResult<u64> {
        self.regs.iff2 = self.regs.iff1;
        self.regs.iff1 = false;
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);

        self.regs.sp = self.regs.sp.wrapping_sub(2);
        bus.write_word(self.regs.sp, self.regs.pc)?;
        self.regs.pc = 0x0066;
        Ok(11)
    }

    pub fn add_action(&mut self, action: DebugAction) {
        self.actions.entry(action.address()).or_default().push(action);
    }

    /// Remove the `index`-th action (1-based, in address order with
    /// insertion order within an address). Returns false if out of range.
    pub fn remove_action(&mut self, index: usize) -> bool {
        let total: usize = self.actions.values().map(Vec::len).sum();
        if index == 0 || index > total {
            return false;
        }
        let mut remaining = index;
        let mut empty_key = None;
        for (&address, bucket) in self.actions.iter_mut() {
            if remaining <= bucket.len() {
                bucket.remove(remaining - 1);
                if bucket.is_empty() {
                    empty_key = Some(address);
                }
                break;
            }
            remaining -= bucket.len();
        }
        if let Some(address) = empty_key {
            self.actions.remove(&address);
        }
        true
    }

    pub fn show_actions(&self) {
        info!("{} action(s) are defined.", self.action_count());
        let mut count = 0;
        for bucket in self.actions.values() {
            for action in bucket {
                count += 1;
                info!("{}: {}", count, action);
            }
        }
    }

    pub fn action_count(&self) -> usize {
        self.actions.values().map(Vec::len).sum()
    }

    /// The four opcode bytes at `pc + offset`, after skipping a spurious
    /// DD/FD prefix run (one that precedes an opcode the prefix cannot
    /// apply to). The skipped bytes come back separately so a debugger can
    /// still display them.
    pub fn opcodes_at<B: Bus>(&self, bus: &mut B, pc: u16, offset: u16) -> ([u8; 4], Vec<u8>) {
        let base = pc.wrapping_add(offset);

        let mut skip = 0u16;
        let mut non_prefix_byte = 0u8;
        while base as u32 + skip as u32 <= 0xFFFF {
            let byte = bus.read_byte(base.wrapping_add(skip));
            if byte == 0xDD || byte == 0xFD {
                skip += 1;
            } else {
                non_prefix_byte = byte;
                break;
            }
        }

        let mut skipped = Vec::new();
        if skip > 0 {
            if admits_index_prefix(non_prefix_byte) {
                skip = 0;
            } else {
                for i in 0..skip {
                    skipped.push(bus.read_byte(base.wrapping_add(i)));
                }
            }
        }

        let mut opcodes = [0u8; 4];
        for (i, slot) in opcodes.iter_mut().enumerate() {
            *slot = bus.read_byte(base.wrapping_add(skip).wrapping_add(i as u16));
        }
        (opcodes, skipped)
    }

    /// Evaluate debug actions registered for `pc`; true means stop.
    fn evaluate_actions(&mut self, pc: u16) -> bool {
        match self.actions.get_mut(&pc) {
            Some(bucket) => bucket.iter_mut().any(|action| !action.evaluate(pc)),
            None => false,
        }
    }

    /// The fetch-decode-execute loop. `opcode` has already been fetched
    /// and the live PC advanced past it. Bounded runs stop once `elapsed`
    /// reaches `max_cycles` (zero max = exactly one instruction).
    fn run<B: Bus>(
        &mut self,
        bus: &mut B,
        mut opcode: u8,
        unbounded: bool,
        mut elapsed: u64,
        mut max_cycles: u64,
    ) -> CoreResult<u64> {
        let mut pc = self.regs.pc;
        let mut r = self.regs.r & 0x7F;

        'outer: loop {
            let mut prefix = IndexPrefix::None;
            let mut table = Table::Main;

            'decode: loop {
                // CP/M programs terminate by reaching 0x0008, e.g. via RET
                // or RST 0. Treat that as the end of the run.
                if self.effective_pc == 0x0008 || !bus.running() {
                    trace!("Stopping execution at PC={:04X}", self.effective_pc);
                    bus.set_finished(true);
                    break 'outer;
                }

                bus.intercept(self.effective_pc, &mut self.regs)?;

                elapsed += 4;
                r = r.wrapping_add(1);

                let op = match table {
                    Table::Main => main_op(opcode),
                    Table::Cb => {
                        let op = cb_op(opcode);
                        if prefix == IndexPrefix::None {
                            op
                        } else {
                            promote_indexed(op)
                        }
                    }
                    Table::Ed => ed_op(opcode),
                };

                match op {
                    // Prefix group

                    Op::DdPrefix => {
                        prefix = IndexPrefix::Ix;
                        opcode = bus.read_byte(pc);
                        pc = pc.wrapping_add(1);
                        table = Table::Main;
                        continue 'decode;
                    }

                    Op::FdPrefix => {
                        prefix = IndexPrefix::Iy;
                        opcode = bus.read_byte(pc);
                        pc = pc.wrapping_add(1);
                        table = Table::Main;
                        continue 'decode;
                    }

                    Op::EdPrefix => {
                        prefix = IndexPrefix::None;
                        opcode = bus.read_byte(pc);
                        pc = pc.wrapping_add(1);
                        table = Table::Ed;
                        continue 'decode;
                    }

                    Op::CbPrefix => {
                        if prefix == IndexPrefix::None {
                            opcode = bus.read_byte(pc);
                            pc = pc.wrapping_add(1);
                        } else {
                            // DD/FD CB d op: the operation byte sits after
                            // the displacement; R advances only twice for
                            // the whole sequence.
                            r = r.wrapping_sub(1);
                            opcode = bus.read_byte(pc.wrapping_add(1));
                        }
                        table = Table::Cb;
                        continue 'decode;
                    }

                    // 8-bit load group

                    Op::LdRR => {
                        let value = r8(&self.regs, prefix, z(opcode));
                        set_r8(&mut self.regs, prefix, y(opcode), value);
                    }

                    Op::LdRN => {
                        let value = fetch_byte(bus, &mut pc, &mut elapsed);
                        set_r8(&mut self.regs, prefix, y(opcode), value);
                    }

                    Op::LdRIndHl => {
                        if prefix == IndexPrefix::None {
                            let value = rb(bus, self.regs.hl, &mut elapsed);
                            set_s8(&mut self.regs, y(opcode), value);
                        } else {
                            let d = fetch_byte(bus, &mut pc, &mut elapsed);
                            let address = indexed(&self.regs, prefix, d);
                            let value = rb(bus, address, &mut elapsed);
                            set_s8(&mut self.regs, y(opcode), value);
                            elapsed += 5;
                        }
                    }

                    Op::LdIndHlR => {
                        if prefix == IndexPrefix::None {
                            let value = s8(&self.regs, z(opcode));
                            wb(bus, self.regs.hl, value, &mut elapsed)?;
                        } else {
                            let d = fetch_byte(bus, &mut pc, &mut elapsed);
                            let address = indexed(&self.regs, prefix, d);
                            let value = s8(&self.regs, z(opcode));
                            wb(bus, address, value, &mut elapsed)?;
                            elapsed += 5;
                        }
                    }

                    Op::LdIndHlN => {
                        if prefix == IndexPrefix::None {
                            let value = fetch_byte(bus, &mut pc, &mut elapsed);
                            wb(bus, self.regs.hl, value, &mut elapsed)?;
                        } else {
                            let d = fetch_byte(bus, &mut pc, &mut elapsed);
                            let address = indexed(&self.regs, prefix, d);
                            let value = fetch_byte(bus, &mut pc, &mut elapsed);
                            wb(bus, address, value, &mut elapsed)?;
                            elapsed += 2;
                        }
                    }

                    Op::LdAIndBc => {
                        let value = rb(bus, self.regs.bc, &mut elapsed);
                        self.regs.set_a(value);
                    }

                    Op::LdAIndDe => {
                        let value = rb(bus, self.regs.de, &mut elapsed);
                        self.regs.set_a(value);
                    }

                    Op::LdAIndNn => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        let value = rb(bus, nn, &mut elapsed);
                        self.regs.set_a(value);
                    }

                    Op::LdIndBcA => {
                        wb(bus, self.regs.bc, self.regs.a(), &mut elapsed)?;
                    }

                    Op::LdIndDeA => {
                        wb(bus, self.regs.de, self.regs.a(), &mut elapsed)?;
                    }

                    Op::LdIndNnA => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        wb(bus, nn, self.regs.a(), &mut elapsed)?;
                    }

                    Op::LdAIR => {
                        // LD A,I / LD A,R. An interrupt during these would
                        // reset parity on real silicon; that can't happen
                        // here.
                        let a = if opcode == 0x57 {
                            self.regs.i
                        } else {
                            (self.regs.r & 0x80) | (r & 0x7F)
                        };
                        let mut f = SZYX_FLAGS[a as usize];
                        if self.regs.iff2 {
                            f |= PV;
                        }
                        f |= self.regs.f() & C;
                        self.regs.af = ((a as u16) << 8) | f as u16;
                        elapsed += 1;
                    }

                    Op::LdIRA => {
                        if opcode == 0x47 {
                            self.regs.i = self.regs.a();
                        } else {
                            self.regs.r = self.regs.a();
                            r = self.regs.a() & 0x7F;
                        }
                        elapsed += 1;
                    }

                    // 16-bit load group

                    Op::LdRrNn => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        set_rr16(&mut self.regs, prefix, p(opcode), nn);
                    }

                    Op::LdHlIndNn => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        let value = rw(bus, nn, &mut elapsed);
                        set_hlx(&mut self.regs, prefix, value);
                    }

                    Op::LdRrIndNn => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        let value = rw(bus, nn, &mut elapsed);
                        set_rr16(&mut self.regs, prefix, p(opcode), value);
                    }

                    Op::LdIndNnHl => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        ww(bus, nn, hlx(&self.regs, prefix), &mut elapsed)?;
                    }

                    Op::LdIndNnRr => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        ww(bus, nn, rr16(&self.regs, prefix, p(opcode)), &mut elapsed)?;
                    }

                    Op::LdSpHl => {
                        self.regs.sp = hlx(&self.regs, prefix);
                        elapsed += 2;
                    }

                    Op::PushSs => {
                        let value = ss16_value(&self.regs, prefix, p(opcode));
                        push(bus, &mut self.regs, value, &mut elapsed)?;
                        elapsed += 1;
                    }

                    Op::PopSs => {
                        let value = pop(bus, &mut self.regs, &mut elapsed);
                        set_ss16(&mut self.regs, prefix, p(opcode), value);
                    }

                    // Exchange, block transfer and search group

                    Op::ExDeHl => {
                        std::mem::swap(&mut self.regs.de, &mut self.regs.hl);
                    }

                    Op::ExAfAf => {
                        std::mem::swap(&mut self.regs.af, &mut self.regs.alt_af);
                    }

                    Op::Exx => {
                        std::mem::swap(&mut self.regs.bc, &mut self.regs.alt_bc);
                        std::mem::swap(&mut self.regs.de, &mut self.regs.alt_de);
                        std::mem::swap(&mut self.regs.hl, &mut self.regs.alt_hl);
                    }

                    Op::ExIndSpHl => {
                        let t = rw(bus, self.regs.sp, &mut elapsed);
                        ww(bus, self.regs.sp, hlx(&self.regs, prefix), &mut elapsed)?;
                        set_hlx(&mut self.regs, prefix, t);
                        elapsed += 3;
                    }

                    Op::LdiLdd => {
                        let n = rb(bus, self.regs.hl, &mut elapsed);
                        wb(bus, self.regs.de, n, &mut elapsed)?;

                        let mut f = self.regs.f() & SZC;
                        self.regs.bc = self.regs.bc.wrapping_sub(1);
                        if self.regs.bc != 0 {
                            f |= PV;
                        }

                        let n = n.wrapping_add(self.regs.a());
                        f |= n & flags::X;
                        f |= (n << 4) & flags::Y;
                        self.regs.set_f(f);

                        let d = direction(opcode);
                        self.regs.de = self.regs.de.wrapping_add(d);
                        self.regs.hl = self.regs.hl.wrapping_add(d);

                        elapsed += 2;
                    }

                    Op::LdirLddr => {
                        let d = direction(opcode);

                        let mut f = self.regs.f() & SZC;
                        let mut bc = self.regs.bc;
                        let mut de = self.regs.de;
                        let mut hl = self.regs.hl;
                        let mut n;

                        r = r.wrapping_sub(2);
                        elapsed -= 8;
                        loop {
                            r = r.wrapping_add(2);

                            n = bus.read_byte(hl);
                            bus.write_byte(de, n)?;

                            hl = hl.wrapping_add(d);
                            de = de.wrapping_add(d);

                            bc = bc.wrapping_sub(1);
                            if bc != 0 {
                                elapsed += 21;
                            } else {
                                elapsed += 16;
                                break;
                            }

                            if unbounded || elapsed < max_cycles || max_cycles == 0 {
                                continue;
                            }
                            // Out of budget: leave PV set and back the PC
                            // up so the next call re-enters this opcode.
                            f |= PV;
                            pc = pc.wrapping_sub(2);
                            break;
                        }

                        self.regs.hl = hl;
                        self.regs.de = de;
                        self.regs.bc = bc;

                        let n = n.wrapping_add(self.regs.a());
                        f |= n & flags::X;
                        f |= (n << 4) & flags::Y;
                        self.regs.set_f(f);
                    }

                    Op::CpiCpd => {
                        let a = self.regs.a();
                        let n = rb(bus, self.regs.hl, &mut elapsed);
                        let zr = a.wrapping_sub(n);

                        self.regs.hl = self.regs.hl.wrapping_add(direction(opcode));

                        let mut f = (a ^ n ^ zr) & H;
                        let n = zr.wrapping_sub(f >> 4);
                        f |= (n << 4) & flags::Y;
                        f |= n & flags::X;
                        f |= SZYX_FLAGS[zr as usize] & SZ;
                        self.regs.bc = self.regs.bc.wrapping_sub(1);
                        if self.regs.bc != 0 {
                            f |= PV;
                        }
                        self.regs.set_f(f | N | (self.regs.f() & C));

                        elapsed += 5;
                    }

                    Op::CpirCpdr => {
                        let d = direction(opcode);

                        let a = self.regs.a();
                        let mut bc = self.regs.bc;
                        let mut hl = self.regs.hl;
                        let mut n;
                        let mut zr;

                        r = r.wrapping_sub(2);
                        elapsed -= 8;
                        loop {
                            r = r.wrapping_add(2);

                            n = bus.read_byte(hl);
                            zr = a.wrapping_sub(n);

                            hl = hl.wrapping_add(d);
                            bc = bc.wrapping_sub(1);
                            if bc != 0 && zr != 0 {
                                elapsed += 21;
                            } else {
                                elapsed += 16;
                                break;
                            }

                            if unbounded || elapsed < max_cycles || max_cycles == 0 {
                                continue;
                            }
                            pc = pc.wrapping_sub(2);
                            break;
                        }

                        self.regs.hl = hl;
                        self.regs.bc = bc;

                        let mut f = (a ^ n ^ zr) & H;
                        let n = zr.wrapping_sub(f >> 4);
                        f |= (n << 4) & flags::Y;
                        f |= n & flags::X;
                        f |= SZYX_FLAGS[zr as usize] & SZ;
                        if bc != 0 {
                            f |= PV;
                        }
                        self.regs.set_f(f | N | (self.regs.f() & C));
                    }

                    // 8-bit arithmetic and logical group

                    Op::AddR => self.op_add(r8(&self.regs, prefix, z(opcode))),
                    Op::AddN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_add(n);
                    }
                    Op::AddIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_add(x);
                    }

                    Op::AdcR => self.op_adc(r8(&self.regs, prefix, z(opcode))),
                    Op::AdcN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_adc(n);
                    }
                    Op::AdcIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_adc(x);
                    }

                    Op::SubR => self.op_sub(r8(&self.regs, prefix, z(opcode))),
                    Op::SubN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_sub(n);
                    }
                    Op::SubIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_sub(x);
                    }

                    Op::SbcR => self.op_sbc(r8(&self.regs, prefix, z(opcode))),
                    Op::SbcN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_sbc(n);
                    }
                    Op::SbcIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_sbc(x);
                    }

                    Op::AndR => self.op_and(r8(&self.regs, prefix, z(opcode))),
                    Op::AndN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_and(n);
                    }
                    Op::AndIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_and(x);
                    }

                    Op::OrR => self.op_or(r8(&self.regs, prefix, z(opcode))),
                    Op::OrN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_or(n);
                    }
                    Op::OrIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_or(x);
                    }

                    Op::XorR => self.op_xor(r8(&self.regs, prefix, z(opcode))),
                    Op::XorN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_xor(n);
                    }
                    Op::XorIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_xor(x);
                    }

                    Op::CpR => self.op_cp(r8(&self.regs, prefix, z(opcode))),
                    Op::CpN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        self.op_cp(n);
                    }
                    Op::CpIndHl => {
                        let x = read_operand(bus, &self.regs, prefix, &mut pc, &mut elapsed);
                        self.op_cp(x);
                    }

                    Op::IncR => {
                        let index = y(opcode);
                        let x = r8(&self.regs, prefix, index);
                        let x = self.op_inc(x);
                        set_r8(&mut self.regs, prefix, index, x);
                    }

                    Op::IncIndHl => {
                        if prefix == IndexPrefix::None {
                            let x = rb(bus, self.regs.hl, &mut elapsed);
                            let x = self.op_inc(x);
                            wb(bus, self.regs.hl, x, &mut elapsed)?;
                            elapsed += 1;
                        } else {
                            let d = fetch_byte(bus, &mut pc, &mut elapsed);
                            let address = indexed(&self.regs, prefix, d);
                            let x = rb(bus, address, &mut elapsed);
                            let x = self.op_inc(x);
                            wb(bus, address, x, &mut elapsed)?;
                            elapsed += 6;
                        }
                    }

                    Op::DecR => {
                        let index = y(opcode);
                        let x = r8(&self.regs, prefix, index);
                        let x = self.op_dec(x);
                        set_r8(&mut self.regs, prefix, index, x);
                    }

                    Op::DecIndHl => {
                        if prefix == IndexPrefix::None {
                            let x = rb(bus, self.regs.hl, &mut elapsed);
                            let x = self.op_dec(x);
                            wb(bus, self.regs.hl, x, &mut elapsed)?;
                            elapsed += 1;
                        } else {
                            let d = fetch_byte(bus, &mut pc, &mut elapsed);
                            let address = indexed(&self.regs, prefix, d);
                            let x = rb(bus, address, &mut elapsed);
                            let x = self.op_dec(x);
                            wb(bus, address, x, &mut elapsed)?;
                            elapsed += 6;
                        }
                    }

                    // General-purpose arithmetic and CPU control group

                    Op::Daa => {
                        let a = self.regs.a();
                        let mut c = 0u8;
                        let mut d = 0u8;
                        if a > 0x99 || self.regs.f() & C != 0 {
                            c = C;
                            d = 0x60;
                        }
                        if a & 0x0F > 0x09 || self.regs.f() & H != 0 {
                            d += 0x06;
                        }
                        let new_a = if self.regs.f() & N != 0 {
                            a.wrapping_sub(d)
                        } else {
                            a.wrapping_add(d)
                        };
                        self.regs.set_a(new_a);
                        self.regs.set_f(
                            SZYXP_FLAGS[new_a as usize]
                                | ((new_a ^ a) & H)
                                | (self.regs.f() & N)
                                | c,
                        );
                    }

                    Op::Cpl => {
                        let a = !self.regs.a();
                        self.regs.set_a(a);
                        self.regs
                            .set_f((self.regs.f() & (SZPV | C)) | (a & YX) | H | N);
                    }

                    Op::Neg => {
                        let a = self.regs.a() as i32;
                        let zr = -a;
                        let mut c = (a ^ zr) as u32;
                        let mut f = N | (c as u8 & H);
                        f |= SZYX_FLAGS[(zr & 0xFF) as usize];
                        c &= 0x0180;
                        f |= OVERFLOW[(c >> 7) as usize];
                        f |= (c >> 8) as u8;
                        self.regs.set_a(zr as u8);
                        self.regs.set_f(f);
                    }

                    Op::Ccf => {
                        let c = self.regs.f() & C;
                        self.regs.set_f(
                            (self.regs.f() & (SZPV | YX))
                                | (c << 4)
                                | (self.regs.a() & YX)
                                | (c ^ C),
                        );
                    }

                    Op::Scf => {
                        self.regs
                            .set_f((self.regs.f() & (SZPV | YX)) | (self.regs.a() & YX) | C);
                    }

                    Op::Nop | Op::EdUndefined => {}

                    Op::Halt => {
                        // The device would fetch NOPs until an interrupt;
                        // nothing happens for the rest of the budget.
                        if elapsed < max_cycles {
                            elapsed = max_cycles;
                        }
                        break 'outer;
                    }

                    Op::Di => {
                        self.regs.iff1 = false;
                        self.regs.iff2 = false;
                        // No interrupt can be accepted straight after DI or
                        // EI; stretching the budget guarantees at least one
                        // more instruction runs.
                        max_cycles += 4;
                    }

                    Op::Ei => {
                        self.regs.iff1 = true;
                        self.regs.iff2 = true;
                        max_cycles += 4;
                    }

                    Op::ImN => {
                        // ED 4E / 6E ("IM 0/1") behave as IM 0.
                        let sel = y(opcode);
                        self.regs.im = if sel & 0x03 <= 0x01 {
                            InterruptMode::Im0
                        } else if sel & 1 == 0 {
                            InterruptMode::Im1
                        } else {
                            InterruptMode::Im2
                        };
                    }

                    // 16-bit arithmetic group

                    Op::AddHlRr => {
                        let x = hlx(&self.regs, prefix) as u32;
                        let yv = rr16(&self.regs, prefix, p(opcode)) as u32;
                        let zr = x + yv;

                        let c = x ^ yv ^ zr;
                        let mut f = self.regs.f() & SZPV;
                        f |= ((zr >> 8) as u8) & YX;
                        f |= ((c >> 8) as u8) & H;
                        f |= (c >> 16) as u8;

                        set_hlx(&mut self.regs, prefix, zr as u16);
                        self.regs.set_f(f);

                        elapsed += 7;
                    }

                    Op::AdcHlRr => {
                        let x = self.regs.hl as u32;
                        let yv = rr16(&self.regs, prefix, p(opcode)) as u32;
                        let zr = x + yv + (self.regs.f() & C) as u32;

                        let c = x ^ yv ^ zr;
                        let mut f = if zr & 0xFFFF != 0 {
                            ((zr >> 8) as u8) & SYX
                        } else {
                            Z
                        };
                        f |= ((c >> 8) as u8) & H;
                        f |= OVERFLOW[((c >> 15) & 0x03) as usize];
                        f |= (zr >> 16) as u8;

                        self.regs.hl = zr as u16;
                        self.regs.set_f(f);

                        elapsed += 7;
                    }

                    Op::SbcHlRr => {
                        let x = self.regs.hl as i32;
                        let yv = rr16(&self.regs, prefix, p(opcode)) as i32;
                        let zr = x - yv - (self.regs.f() & C) as i32;

                        let mut c = (x ^ yv ^ zr) as u32;
                        let mut f = N;
                        f |= if zr & 0xFFFF != 0 {
                            ((zr >> 8) as u8) & SYX
                        } else {
                            Z
                        };
                        f |= ((c >> 8) as u8) & H;
                        c &= 0x01_8000;
                        f |= OVERFLOW[(c >> 15) as usize];
                        f |= (c >> 16) as u8;

                        self.regs.hl = zr as u16;
                        self.regs.set_f(f);

                        elapsed += 7;
                    }

                    Op::IncRr => {
                        let value = rr16(&self.regs, prefix, p(opcode)).wrapping_add(1);
                        set_rr16(&mut self.regs, prefix, p(opcode), value);
                        elapsed += 2;
                    }

                    Op::DecRr => {
                        let value = rr16(&self.regs, prefix, p(opcode)).wrapping_sub(1);
                        set_rr16(&mut self.regs, prefix, p(opcode), value);
                        elapsed += 2;
                    }

                    // Rotate and shift group

                    Op::Rlca => {
                        let a = self.regs.a().rotate_left(1);
                        self.regs.set_a(a);
                        self.regs
                            .set_f((self.regs.f() & SZPV) | (a & (YX | C)));
                    }

                    Op::Rla => {
                        let old = self.regs.a();
                        let a = old << 1;
                        let f = (self.regs.f() & SZPV) | (a & YX) | (old >> 7);
                        self.regs.set_a(a | (self.regs.f() & C));
                        self.regs.set_f(f);
                    }

                    Op::Rrca => {
                        let c = self.regs.a() & 0x01;
                        let a = self.regs.a().rotate_right(1);
                        self.regs.set_a(a);
                        self.regs.set_f((self.regs.f() & SZPV) | (a & YX) | c);
                    }

                    Op::Rra => {
                        let c = self.regs.a() & 0x01;
                        let a = (self.regs.a() >> 1) | ((self.regs.f() & C) << 7);
                        self.regs.set_a(a);
                        self.regs.set_f((self.regs.f() & SZPV) | (a & YX) | c);
                    }

                    Op::RlcR => self.rmw_register(prefix, opcode, Cpu::op_rlc),
                    Op::RlR => self.rmw_register(prefix, opcode, Cpu::op_rl),
                    Op::RrcR => self.rmw_register(prefix, opcode, Cpu::op_rrc),
                    Op::RrR => self.rmw_register(prefix, opcode, Cpu::op_rr),
                    Op::SlaR => self.rmw_register(prefix, opcode, Cpu::op_sla),
                    Op::SllR => self.rmw_register(prefix, opcode, Cpu::op_sll),
                    Op::SraR => self.rmw_register(prefix, opcode, Cpu::op_sra),
                    Op::SrlR => self.rmw_register(prefix, opcode, Cpu::op_srl),

                    Op::RlcIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_rlc)?
                    }
                    Op::RlIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_rl)?
                    }
                    Op::RrcIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_rrc)?
                    }
                    Op::RrIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_rr)?
                    }
                    Op::SlaIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_sla)?
                    }
                    Op::SllIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_sll)?
                    }
                    Op::SraIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_sra)?
                    }
                    Op::SrlIndHl => {
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, Cpu::op_srl)?
                    }

                    Op::RldRrd => {
                        let x = rb(bus, self.regs.hl, &mut elapsed) as u32;
                        let a = self.regs.a() as u32;

                        let mut yv = (a & 0xF0) << 8;
                        yv |= if opcode == 0x6F {
                            (x << 4) | (a & 0x0F)
                        } else {
                            ((x & 0x0F) << 8) | ((a & 0x0F) << 4) | (x >> 4)
                        };
                        wb(bus, self.regs.hl, yv as u8, &mut elapsed)?;
                        let yv = (yv >> 8) as u8;

                        self.regs.set_a(yv);
                        self.regs
                            .set_f(SZYXP_FLAGS[yv as usize] | (self.regs.f() & C));

                        elapsed += 4;
                    }

                    // Bit set, reset and test group

                    Op::BitBR => {
                        let x = r8(&self.regs, prefix, z(opcode)) & (1 << y(opcode));
                        self.regs.set_f(
                            (if x != 0 { 0 } else { Z | PV })
                                | (x & flags::S)
                                | (r8(&self.regs, prefix, z(opcode)) & YX)
                                | H
                                | (self.regs.f() & C),
                        );
                    }

                    Op::BitBIndHl => {
                        let address;
                        if prefix == IndexPrefix::None {
                            address = self.regs.hl;
                            elapsed += 1;
                        } else {
                            let d = bus.read_byte(pc);
                            address = indexed(&self.regs, prefix, d);
                            pc = pc.wrapping_add(2);
                            elapsed += 5;
                        }

                        let x = rb(bus, address, &mut elapsed) & (1 << y(opcode));
                        self.regs.set_f(
                            (if x != 0 { 0 } else { Z | PV })
                                | (x & flags::S)
                                | ((address as u8) & YX)
                                | H
                                | (self.regs.f() & C),
                        );
                    }

                    Op::SetBR => {
                        let index = z(opcode);
                        let value = r8(&self.regs, prefix, index) | (1 << y(opcode));
                        set_r8(&mut self.regs, prefix, index, value);
                    }

                    Op::SetBIndHl => {
                        let mask = 1 << y(opcode);
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, move |_, x| {
                            x | mask
                        })?;
                    }

                    Op::ResBR => {
                        let index = z(opcode);
                        let value = r8(&self.regs, prefix, index) & !(1 << y(opcode));
                        set_r8(&mut self.regs, prefix, index, value);
                    }

                    Op::ResBIndHl => {
                        let mask = !(1 << y(opcode));
                        self.rmw_indirect(bus, prefix, opcode, &mut pc, &mut elapsed, move |_, x| {
                            x & mask
                        })?;
                    }

                    // Jump group

                    Op::JpNn => {
                        pc = bus.read_word(pc);
                        elapsed += 6;
                    }

                    Op::JpCcNn => {
                        if self.test_cc(y(opcode)) {
                            pc = bus.read_word(pc);
                        } else {
                            pc = pc.wrapping_add(2);
                        }
                        elapsed += 6;
                    }

                    Op::JrE => {
                        let e = bus.read_byte(pc) as i8;
                        pc = pc.wrapping_add(e as u16).wrapping_add(1);
                        elapsed += 8;
                    }

                    Op::JrDdE => {
                        if self.test_cc(q(opcode)) {
                            let e = bus.read_byte(pc) as i8;
                            pc = pc.wrapping_add(e as u16).wrapping_add(1);
                            elapsed += 8;
                        } else {
                            pc = pc.wrapping_add(1);
                            elapsed += 3;
                        }
                    }

                    Op::JpHl => {
                        pc = hlx(&self.regs, prefix);
                    }

                    Op::DjnzE => {
                        let b = self.regs.b().wrapping_sub(1);
                        self.regs.set_b(b);
                        if b != 0 {
                            let e = bus.read_byte(pc) as i8;
                            pc = pc.wrapping_add(e as u16).wrapping_add(1);
                            elapsed += 9;
                        } else {
                            pc = pc.wrapping_add(1);
                            elapsed += 4;
                        }
                    }

                    // Call and return group

                    Op::CallNn => {
                        let nn = fetch_word(bus, &mut pc, &mut elapsed);
                        push(bus, &mut self.regs, pc, &mut elapsed)?;
                        pc = nn;
                        elapsed += 1;
                    }

                    Op::CallCcNn => {
                        if self.test_cc(y(opcode)) {
                            let nn = fetch_word(bus, &mut pc, &mut elapsed);
                            push(bus, &mut self.regs, pc, &mut elapsed)?;
                            pc = nn;
                            elapsed += 1;
                        } else {
                            pc = pc.wrapping_add(2);
                            elapsed += 6;
                        }
                    }

                    Op::Ret => {
                        pc = pop(bus, &mut self.regs, &mut elapsed);
                    }

                    Op::RetCc => {
                        if self.test_cc(y(opcode)) {
                            pc = pop(bus, &mut self.regs, &mut elapsed);
                        }
                        elapsed += 1;
                    }

                    Op::RetiRetn => {
                        self.regs.iff1 = self.regs.iff2;
                        pc = pop(bus, &mut self.regs, &mut elapsed);
                    }

                    Op::RstP => {
                        push(bus, &mut self.regs, pc, &mut elapsed)?;
                        pc = (y(opcode) as u16) << 3;
                        elapsed += 1;
                    }

                    // Input and output group

                    Op::InAN => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        let value = bus.input_byte(n);
                        self.regs.set_a(value);
                        elapsed += 4;
                    }

                    Op::InRC => {
                        let x = bus.input_byte(self.regs.c());
                        if y(opcode) != 6 {
                            set_s8(&mut self.regs, y(opcode), x);
                        }
                        self.regs
                            .set_f(SZYXP_FLAGS[x as usize] | (self.regs.f() & C));
                        elapsed += 4;
                    }

                    Op::IniInd => {
                        // The undocumented flags here follow "The
                        // Undocumented Z80 Documented".
                        let x = bus.input_byte(self.regs.c()) as u32;
                        wb(bus, self.regs.hl, x as u8, &mut elapsed)?;

                        let b = self.regs.b().wrapping_sub(1);
                        self.regs.set_b(b);
                        let mut f = SZYX_FLAGS[b as usize] | ((x as u8) >> 6);
                        let x = if opcode & 0x08 == 0 {
                            self.regs.hl = self.regs.hl.wrapping_add(1);
                            x + (self.regs.c().wrapping_add(1)) as u32
                        } else {
                            self.regs.hl = self.regs.hl.wrapping_sub(1);
                            x + (self.regs.c().wrapping_sub(1)) as u32
                        };
                        if x & 0x100 != 0 {
                            f |= HC;
                        }
                        f |= SZYXP_FLAGS[((x as u8 & 0x07) ^ b) as usize] & PV;
                        self.regs.set_f(f);

                        elapsed += 5;
                    }

                    Op::InirIndr => {
                        let d = direction(opcode);

                        let mut b = self.regs.b();
                        let mut hl = self.regs.hl;
                        let mut x;
                        let mut f;

                        r = r.wrapping_sub(2);
                        elapsed -= 8;
                        loop {
                            r = r.wrapping_add(2);

                            x = bus.input_byte(self.regs.c()) as u32;
                            bus.write_byte(hl, x as u8)?;

                            hl = hl.wrapping_add(d);

                            b = b.wrapping_sub(1);
                            if b != 0 {
                                elapsed += 21;
                            } else {
                                f = Z;
                                elapsed += 16;
                                break;
                            }

                            if unbounded || elapsed < max_cycles || max_cycles == 0 {
                                continue;
                            }
                            f = SZYX_FLAGS[b as usize];
                            pc = pc.wrapping_sub(2);
                            break;
                        }

                        self.regs.hl = hl;
                        self.regs.set_b(b);

                        f |= (x as u8) >> 6;
                        let x = x + self.regs.c().wrapping_add(d as u8) as u32;
                        if x & 0x100 != 0 {
                            f |= HC;
                        }
                        f |= SZYXP_FLAGS[((x as u8 & 0x07) ^ b) as usize] & PV;
                        self.regs.set_f(f);
                    }

                    Op::OutNA => {
                        let n = fetch_byte(bus, &mut pc, &mut elapsed);
                        bus.output_byte(n, self.regs.a());
                        elapsed += 4;
                    }

                    Op::OutCR => {
                        let x = if y(opcode) != 6 {
                            s8(&self.regs, y(opcode))
                        } else {
                            0
                        };
                        bus.output_byte(self.regs.c(), x);
                        elapsed += 4;
                    }

                    Op::OutiOutd => {
                        let x = rb(bus, self.regs.hl, &mut elapsed);
                        bus.output_byte(self.regs.c(), x);

                        self.regs.hl = self
                            .regs
                            .hl
                            .wrapping_add(direction(opcode));

                        let b = self.regs.b().wrapping_sub(1);
                        self.regs.set_b(b);
                        let mut f = SZYX_FLAGS[b as usize] | (x >> 6);
                        let x = x.wrapping_add(self.regs.hl as u8);
                        f |= SZYXP_FLAGS[((x & 0x07) ^ b) as usize] & PV;
                        self.regs.set_f(f);
                    }

                    Op::OtirOtdr => {
                        let d = direction(opcode);

                        let mut b = self.regs.b();
                        let mut hl = self.regs.hl;
                        let mut x;
                        let mut f;

                        r = r.wrapping_sub(2);
                        elapsed -= 8;
                        loop {
                            r = r.wrapping_add(2);

                            x = bus.read_byte(hl);
                            bus.output_byte(self.regs.c(), x);

                            hl = hl.wrapping_add(d);
                            b = b.wrapping_sub(1);
                            if b != 0 {
                                elapsed += 21;
                            } else {
                                f = Z;
                                elapsed += 16;
                                break;
                            }

                            if unbounded || elapsed < max_cycles || max_cycles == 0 {
                                continue;
                            }
                            f = SZYX_FLAGS[b as usize];
                            pc = pc.wrapping_sub(2);
                            break;
                        }

                        self.regs.hl = hl;
                        self.regs.set_b(b);

                        f |= x >> 6;
                        let x = x.wrapping_add(hl as u8);
                        f |= SZYXP_FLAGS[((x & 0x07) ^ b) as usize] & PV;
                        self.regs.set_f(f);
                    }
                }

                break 'decode;
            }

            // Bounded runs stop once the budget is spent.
            if !unbounded && elapsed >= max_cycles {
                break 'outer;
            }

            if self.evaluate_actions(pc) {
                bus.set_finished(true);
                break 'outer;
            }

            self.effective_pc = pc;
            opcode = bus.read_byte(pc);
            pc = pc.wrapping_add(1);
        }

        self.regs.r = (self.regs.r & 0x80) | (r & 0x7F);
        self.regs.pc = pc;
        self.effective_pc = pc;

        Ok(elapsed)
    }

    /// CB-space read-modify-write on a register operand.
    fn rmw_register(&mut self, prefix: IndexPrefix, opcode: u8, op: impl Fn(&mut Cpu, u8) -> u8) {
        debug_assert_eq!(prefix, IndexPrefix::None);
        let index = z(opcode);
        let x = r8(&self.regs, prefix, index);
        let x = op(self, x);
        set_r8(&mut self.regs, prefix, index, x);
    }

    /// CB-space read-modify-write on (HL) or (IX/IY+d). The indexed form
    /// also copies the result into the register named by the low bits,
    /// which is how the undocumented DD CB d r opcodes behave.
    fn rmw_indirect<B: Bus>(
        &mut self,
        bus: &mut B,
        prefix: IndexPrefix,
        opcode: u8,
        pc: &mut u16,
        elapsed: &mut u64,
        op: impl Fn(&mut Cpu, u8) -> u8,
    ) -> CoreResult<()> {
        if prefix == IndexPrefix::None {
            let x = rb(bus, self.regs.hl, elapsed);
            let x = op(self, x);
            wb(bus, self.regs.hl, x, elapsed)?;
            *elapsed += 1;
        } else {
            let d = bus.read_byte(*pc);
            let address = indexed(&self.regs, prefix, d);

            let x = rb(bus, address, elapsed);
            let x = op(self, x);
            wb(bus, address, x, elapsed)?;

            if z(opcode) != 6 {
                set_s8(&mut self.regs, z(opcode), x);
            }
            *pc = pc.wrapping_add(2);

            *elapsed += 5;
        }
        Ok(())
    }
}

/// When a DD/FD prefix is active, every CB-space operation works on the
/// indexed address (the register forms become copy-back variants).
fn promote_indexed(op: Op) -> Op {
    match op {
        Op::RlcR => Op::RlcIndHl,
        Op::RrcR => Op::RrcIndHl,
        Op::RlR => Op::RlIndHl,
        Op::RrR => Op::RrIndHl,
        Op::SlaR => Op::SlaIndHl,
        Op::SraR => Op::SraIndHl,
        Op::SllR => Op::SllIndHl,
        Op::SrlR => Op::SrlIndHl,
        Op::BitBR => Op::BitBIndHl,
        Op::ResBR => Op::ResBIndHl,
        Op::SetBR => Op::SetBIndHl,
        other => other,
    }
}

/// Block-instruction direction from opcode bit 3: the incrementing forms
/// (LDI, CPI, INI, OUTI and repeats) step +1, the rest -1.
fn direction(opcode: u8) -> u16 {
    if opcode & 0x08 == 0 {
        1
    } else {
        0xFFFF
    }
}

/// Sign-extended displacement from an index register.
fn indexed(regs: &Registers, prefix: IndexPrefix, d: u8) -> u16 {
    hlx(regs, prefix).wrapping_add(d as i8 as i16 as u16)
}

/// 3-bit register decode in the current prefix. Index 6 is the memory
/// operand and is resolved by the caller.
fn r8(regs: &Registers, prefix: IndexPrefix, index: u8) -> u8 {
    match index {
        0 => regs.b(),
        1 => regs.c(),
        2 => regs.d(),
        3 => regs.e(),
        4 => match prefix {
            IndexPrefix::None => regs.h(),
            IndexPrefix::Ix => regs.ixh(),
            IndexPrefix::Iy => regs.iyh(),
        },
        5 => match prefix {
            IndexPrefix::None => regs.l(),
            IndexPrefix::Ix => regs.ixl(),
            IndexPrefix::Iy => regs.iyl(),
        },
        7 => regs.a(),
        _ => unreachable!("memory operand is resolved by the caller"),
    }
}

fn set_r8(regs: &mut Registers, prefix: IndexPrefix, index: u8, value: u8) {
    match index {
        0 => regs.set_b(value),
        1 => regs.set_c(value),
        2 => regs.set_d(value),
        3 => regs.set_e(value),
        4 => match prefix {
            IndexPrefix::None => regs.set_h(value),
            IndexPrefix::Ix => regs.set_ixh(value),
            IndexPrefix::Iy => regs.set_iyh(value),
        },
        5 => match prefix {
            IndexPrefix::None => regs.set_l(value),
            IndexPrefix::Ix => regs.set_ixl(value),
            IndexPrefix::Iy => regs.set_iyl(value),
        },
        7 => regs.set_a(value),
        _ => unreachable!("memory operand is resolved by the caller"),
    }
}

/// Unprefixed 3-bit register decode, for the forms where DD/FD moves only
/// the memory operand (e.g. `LD H,(IX+d)` still targets H).
fn s8(regs: &Registers, index: u8) -> u8 {
    r8(regs, IndexPrefix::None, index)
}

fn set_s8(regs: &mut Registers, index: u8, value: u8) {
    set_r8(regs, IndexPrefix::None, index, value)
}

/// 2-bit register-pair decode: BC, DE, HL/IX/IY, SP.
fn rr16(regs: &Registers, prefix: IndexPrefix, index: u8) -> u16 {
    match index {
        0 => regs.bc,
        1 => regs.de,
        2 => hlx(regs, prefix),
        _ => regs.sp,
    }
}

fn set_rr16(regs: &mut Registers, prefix: IndexPrefix, index: u8, value: u16) {
    match index {
        0 => regs.bc = value,
        1 => regs.de = value,
        2 => set_hlx(regs, prefix, value),
        _ => regs.sp = value,
    }
}

/// PUSH/POP register-pair decode: BC, DE, HL/IX/IY, AF.
fn ss16_value(regs: &Registers, prefix: IndexPrefix, index: u8) -> u16 {
    match index {
        0 => regs.bc,
        1 => regs.de,
        2 => hlx(regs, prefix),
        _ => regs.af,
    }
}

fn set_ss16(regs: &mut Registers, prefix: IndexPrefix, index: u8, value: u16) {
    match index {
        0 => regs.bc = value,
        1 => regs.de = value,
        2 => set_hlx(regs, prefix, value),
        _ => regs.af = value,
    }
}

fn hlx(regs: &Registers, prefix: IndexPrefix) -> u16 {
    match prefix {
        IndexPrefix::None => regs.hl,
        IndexPrefix::Ix => regs.ix,
        IndexPrefix::Iy => regs.iy,
    }
}

fn set_hlx(regs: &mut Registers, prefix: IndexPrefix, value: u16) {
    match prefix {
        IndexPrefix::None => regs.hl = value,
        IndexPrefix::Ix => regs.ix = value,
        IndexPrefix::Iy => regs.iy = value,
    }
}

/// Timed byte read: 3 cycles.
fn rb<B: Bus>(bus: &mut B, address: u16, elapsed: &mut u64) -> u8 {
    *elapsed += 3;
    bus.read_byte(address)
}

/// Timed word read: 6 cycles.
fn rw<B: Bus>(bus: &mut B, address: u16, elapsed: &mut u64) -> u16 {
    *elapsed += 6;
    bus.read_word(address)
}

/// Timed byte write: 3 cycles.
fn wb<B: Bus>(bus: &mut B, address: u16, value: u8, elapsed: &mut u64) -> CoreResult<()> {
    *elapsed += 3;
    bus.write_byte(address, value)
}

/// Timed word write: 6 cycles.
fn ww<B: Bus>(bus: &mut B, address: u16, value: u16, elapsed: &mut u64) -> CoreResult<()> {
    *elapsed += 6;
    bus.write_word(address, value)
}

fn fetch_byte<B: Bus>(bus: &mut B, pc: &mut u16, elapsed: &mut u64) -> u8 {
    let value = rb(bus, *pc, elapsed);
    *pc = pc.wrapping_add(1);
    value
}

fn fetch_word<B: Bus>(bus: &mut B, pc: &mut u16, elapsed: &mut u64) -> u16 {
    let value = rw(bus, *pc, elapsed);
    *pc = pc.wrapping_add(2);
    value
}

fn push<B: Bus>(bus: &mut B, regs: &mut Registers, value: u16, elapsed: &mut u64) -> CoreResult<()> {
    regs.sp = regs.sp.wrapping_sub(2);
    ww(bus, regs.sp, value, elapsed)
}

fn pop<B: Bus>(bus: &mut B, regs: &mut Registers, elapsed: &mut u64) -> u16 {
    let value = rw(bus, regs.sp, elapsed);
    regs.sp = regs.sp.wrapping_add(2);
    value
}

/// ALU (HL) / (IX+d) / (IY+d) operand read.
fn read_operand<B: Bus>(
    bus: &mut B,
    regs: &Registers,
    prefix: IndexPrefix,
    pc: &mut u16,
    elapsed: &mut u64,
) -> u8 {
    if prefix == IndexPrefix::None {
        rb(bus, regs.hl, elapsed)
    } else {
        let d = fetch_byte(bus, pc, elapsed);
        let value = rb(bus, indexed(regs, prefix, d), elapsed);
        *elapsed += 5;
        value
    }
}
