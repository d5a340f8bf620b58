//! BDOS call decoding for the run log.
//!
//! The BDOS itself executes as guest code inside the emulation; calls are
//! recognised when the PC reaches FBASE and logged here, never intercepted.

use crate::fcb::Fcb;
use crate::memory::Ram;
use crate::registers::Registers;

/// Decode the pending BDOS call (function number in C, argument in DE)
/// into a (name, description) pair for logging.
pub fn describe_call(regs: &Registers, ram: &Ram) -> (String, String) {
    let function = regs.c();
    let de = regs.de;
    let prefix = format!("fn#{} ", function);

    let (name, description) = match function {
        0 => ("P_TERMCPM", "System reset".to_string()),
        1 => ("C_READ", "Console input".to_string()),
        2 => {
            let ch = regs.e();
            let printable = if ch.is_ascii_graphic() || ch == b' ' {
                ch as char
            } else {
                '?'
            };
            (
                "C_WRITE",
                format!("Console output '{}' (ASCII 0x{:02X})", printable, ch),
            )
        }
        6 => ("C_RAWIO", "Direct console I/O".to_string()),
        9 => (
            "C_WRITESTR",
            format!("Print string \"{}\"", cpm_string_at(ram, de)),
        ),
        10 => (
            "C_READSTR",
            format!(
                "Read console buffer (buffer at {:04X}, {} bytes max)",
                de,
                ram.get(de)
            ),
        ),
        11 => ("C_STAT", "Get console status".to_string()),
        12 => ("S_BDOSVER", "Return version number".to_string()),
        13 => ("DRV_ALLRESET", "Reset disk system".to_string()),
        14 => ("DRV_SET", "Select disk".to_string()),
        15 => ("F_OPEN", format!("Open file ({})", describe_fcb(ram, de, false))),
        16 => ("F_CLOSE", format!("Close file ({})", describe_fcb(ram, de, false))),
        17 => (
            "F_SFIRST",
            format!("Search for first ({})", describe_fcb(ram, de, false)),
        ),
        18 => (
            "F_SNEXT",
            format!("Search for next ({})", describe_fcb(ram, de, false)),
        ),
        19 => (
            "F_DELETE",
            format!("Delete file ({})", describe_fcb(ram, de, false)),
        ),
        20 => (
            "F_READ",
            format!("Read sequential ({})", describe_fcb(ram, de, false)),
        ),
        21 => (
            "F_WRITE",
            format!("Write sequential ({})", describe_fcb(ram, de, false)),
        ),
        22 => ("F_MAKE", format!("Make file ({})", describe_fcb(ram, de, false))),
        23 => (
            "F_RENAME",
            format!("Rename file ({})", describe_fcb(ram, de, true)),
        ),
        24 => ("DRV_LOGINVEC", "Return login vector".to_string()),
        25 => ("DRV_GET", "Return current disk".to_string()),
        26 => ("F_DMAOFF", format!("Set DMA address to {:04X}", de)),
        27 => ("DRV_ALLOCVEC", "Get addr(alloc)".to_string()),
        29 => ("DRV_ROVEC", "Get readonly vector".to_string()),
        30 => (
            "F_ATTRIB",
            format!("Set file attributes ({})", describe_fcb(ram, de, false)),
        ),
        31 => ("DRV_DPB", "Get addr(diskparams)".to_string()),
        32 => {
            let e = regs.e();
            (
                "F_USERNUM",
                format!(
                    "Set/get user code (E={:02X} means '{}')",
                    e,
                    if e == 0xFF { "get" } else { "set" }
                ),
            )
        }
        33 => (
            "F_READRAND",
            format!("Read random ({})", describe_fcb(ram, de, false)),
        ),
        34 => (
            "F_WRITERAND",
            format!("Write random ({})", describe_fcb(ram, de, false)),
        ),
        35 => (
            "F_SIZE",
            format!("Compute file size ({})", describe_fcb(ram, de, false)),
        ),
        36 => (
            "F_RANDREC",
            format!("Set random record ({})", describe_fcb(ram, de, false)),
        ),
        _ => ("???", String::new()),
    };

    (prefix + name, description)
}

/// Capture a `$`-terminated guest string for logging: length-capped in
/// case the guest points at garbage, non-printables escaped.
fn cpm_string_at(ram: &Ram, address: u16) -> String {
    const LIMIT: u16 = 30;

    let mut result = String::new();
    for offset in 0..LIMIT {
        let ch = ram.get(address.wrapping_add(offset));
        if ch == b'$' {
            return result;
        }
        if ch.is_ascii_graphic() || ch == b' ' {
            result.push(ch as char);
        } else {
            result.push_str(&format!("<{:02X}>", ch));
        }
    }
    result + " (etc)"
}

fn describe_fcb(ram: &Ram, address: u16, both: bool) -> String {
    let fcb = Fcb::from_ram(ram, address);
    format!("FCB at {:04X}: {}", address, fcb.describe(both))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_call() {
        let ram = Ram::new();
        let mut regs = Registers::default();
        regs.set_c(13);
        let (name, description) = describe_call(&regs, &ram);
        assert_eq!(name, "fn#13 DRV_ALLRESET");
        assert_eq!(description, "Reset disk system");
    }

    #[test]
    fn test_console_output_call() {
        let ram = Ram::new();
        let mut regs = Registers::default();
        regs.set_c(2);
        regs.set_e(b'A');
        let (name, description) = describe_call(&regs, &ram);
        assert_eq!(name, "fn#2 C_WRITE");
        assert_eq!(description, "Console output 'A' (ASCII 0x41)");
    }

    #[test]
    fn test_print_string_call() {
        let mut ram = Ram::new();
        ram.copy_to_ram(b"Hello\x07!$", 0x0200);
        let mut regs = Registers::default();
        regs.set_c(9);
        regs.de = 0x0200;
        let (_, description) = describe_call(&regs, &ram);
        assert_eq!(description, "Print string \"Hello<07>!\"");
    }

    #[test]
    fn test_unterminated_string_is_capped() {
        let mut ram = Ram::new();
        for i in 0..64u16 {
            ram.set(0x0300 + i, b'x');
        }
        let mut regs = Registers::default();
        regs.set_c(9);
        regs.de = 0x0300;
        let (_, description) = describe_call(&regs, &ram);
        assert!(description.ends_with(" (etc)\""));
    }

    #[test]
    fn test_open_file_renders_fcb() {
        let mut ram = Ram::new();
        let mut fcb = crate::fcb::Fcb::new();
        fcb.set_first("test.txt");
        ram.copy_to_ram(fcb.bytes(), 0x005C);
        let mut regs = Registers::default();
        regs.set_c(15);
        regs.de = 0x005C;
        let (name, description) = describe_call(&regs, &ram);
        assert_eq!(name, "fn#15 F_OPEN");
        assert!(description.contains("FCB at 005C"));
        assert!(description.contains("TEST.TXT"));
    }
}
