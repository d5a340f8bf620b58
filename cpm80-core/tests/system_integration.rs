//! End-to-end tests against a synthetic BDOS/BIOS image.
//!
//! The image is the smallest thing that satisfies the bring-up contract:
//! a RET at FBASE (so the startup disk-reset call unwinds straight into
//! warm boot) and a 33-entry JP table whose second vector is WBOOT. User
//! programs then exercise the rewritten table exactly as a real BDOS
//! would.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use cpm80_core::error::CoreError;
use cpm80_core::hardware::Config;
use cpm80_core::system::System;
use cpm80_core::terminal::Terminal;

/// The fake BDOS image loads here.
const IMAGE_BASE: u16 = 0xE400;
/// FBASE within the image: a lone RET.
const FBASE: u16 = 0xE406;
/// The BIOS jump table within the image.
const JUMP_BASE: u16 = 0xF200;
/// WBOOT is the second table entry.
const WBOOT: u16 = JUMP_BASE + 3;

/// Terminal whose output buffer outlives the system under test.
struct SharedTerminal {
    output: Rc<RefCell<Vec<u8>>>,
    input: Vec<u8>,
}

impl Terminal for SharedTerminal {
    fn print(&mut self, ch: u8) {
        self.output.borrow_mut().push(ch);
    }

    fn is_character_ready(&mut self) -> bool {
        !self.input.is_empty()
    }

    fn get_char(&mut self) -> u8 {
        if self.input.is_empty() {
            0
        } else {
            self.input.remove(0)
        }
    }
}

struct Fixture {
    dir: PathBuf,
    system: System,
    output: Rc<RefCell<Vec<u8>>>,
}

impl Fixture {
    fn new(tag: &str) -> Self {
        Self::with_setup(tag, &[], b"")
    }

    /// Create a work directory holding the fake BDOS image plus any extra
    /// host files, then bring the machine up to the point where a user
    /// program can load. `input` is queued console input.
    fn with_setup(tag: &str, files: &[(&str, &[u8])], input: &[u8]) -> Self {
        let dir = std::env::temp_dir().join(format!("cpm80-e2e-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        // Image spans IMAGE_BASE..=end of the jump table.
        let mut image = vec![0u8; (JUMP_BASE - IMAGE_BASE) as usize + 33 * 3];
        image[(FBASE - IMAGE_BASE) as usize] = 0xC9; // RET at FBASE
        for i in 0..33 {
            image[(JUMP_BASE - IMAGE_BASE) as usize + i * 3] = 0xC3;
        }
        let image_path = dir.join("bdos.bin");
        std::fs::write(&image_path, &image).unwrap();

        for (name, contents) in files {
            std::fs::write(dir.join(name), contents).unwrap();
        }

        let output = Rc::new(RefCell::new(Vec::new()));
        let terminal = SharedTerminal {
            output: Rc::clone(&output),
            input: input.to_vec(),
        };
        let config = Config {
            disk_root: dir.clone(),
            ..Config::default()
        };
        let mut system = System::new(Box::new(terminal), config);

        system.load_binary(IMAGE_BASE, &image_path).unwrap();
        system.setup_bios(FBASE, WBOOT).unwrap();

        Self {
            dir,
            system,
            output,
        }
    }

    fn load_program(&mut self, program: &[u8]) {
        self.system.hardware_mut().copy_to_ram(program, 0x0100);
    }

    fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Address of BIOS jump-table entry `n`.
fn bios_entry(n: u16) -> [u8; 2] {
    (JUMP_BASE + n * 3).to_le_bytes()
}

#[test]
fn test_full_bring_up_sequence() {
    let mut fixture = Fixture::new("bringup");

    // The startup disk-reset runs the guest's FBASE RET, unwinds to the
    // zeroed stack, reaches 0x0000 and terminates through WBOOT.
    fixture.system.load_fcb(&[]).unwrap();
    fixture.system.reset().unwrap();
    fixture.system.setup_bdos().unwrap();
    assert!(fixture.system.hardware().finished());
}

#[test]
fn test_hello_via_bios_conout() {
    let mut fixture = Fixture::new("hello");

    let conout = bios_entry(4);
    #[rustfmt::skip]
    let program = [
        0x0E, b'H',                   // LD C,'H'
        0xCD, conout[0], conout[1],   // CALL CONOUT
        0x0E, b'i',                   // LD C,'i'
        0xCD, conout[0], conout[1],   // CALL CONOUT
        0xC3, 0x00, 0x00,             // JP 0 -> warm boot
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();

    fixture.system.run().unwrap();

    assert_eq!(fixture.output_string(), "Hi");
    assert!(fixture.system.hardware().finished());
}

#[test]
fn test_termination_by_rst_08() {
    let mut fixture = Fixture::new("rst08");

    fixture.load_program(&[0xCF]); // RST 08
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();

    assert!(fixture.system.hardware().finished());
    assert_eq!(fixture.system.hardware().registers().pc, 0x0008);
}

#[test]
fn test_sector_read_reaches_host_file() {
    // "aaa.dat" sorts ahead of "bdos.bin", so its first data block is
    // block 0x10: track 2, sector 0.
    let mut contents = vec![0u8; 200];
    contents[0] = b'X';
    let mut fixture = Fixture::with_setup("diskread", &[("aaa.dat", &contents)], b"");

    let settrk = bios_entry(10);
    let setsec = bios_entry(11);
    let setdma = bios_entry(12);
    let read = bios_entry(13);
    let conout = bios_entry(4);
    #[rustfmt::skip]
    let program = [
        0x01, 0x02, 0x00,             // LD BC,2
        0xCD, settrk[0], settrk[1],   // CALL SETTRK
        0x01, 0x00, 0x00,             // LD BC,0
        0xCD, setsec[0], setsec[1],   // CALL SETSEC
        0x01, 0x00, 0x40,             // LD BC,0x4000
        0xCD, setdma[0], setdma[1],   // CALL SETDMA
        0xCD, read[0], read[1],       // CALL READ
        0x3A, 0x00, 0x40,             // LD A,(0x4000)
        0x4F,                         // LD C,A
        0xCD, conout[0], conout[1],   // CALL CONOUT
        0xC3, 0x00, 0x00,             // JP 0
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();

    assert_eq!(fixture.output_string(), "X");
}

#[test]
fn test_sector_write_read_round_trip() {
    let mut fixture = Fixture::new("diskrw");

    let settrk = bios_entry(10);
    let setsec = bios_entry(11);
    let setdma = bios_entry(12);
    let read = bios_entry(13);
    let write = bios_entry(14);
    let conout = bios_entry(4);
    #[rustfmt::skip]
    let program = [
        // Stamp a marker at 0x4000 and write that sector to (2,0).
        0x3E, b'Q',                   // LD A,'Q'
        0x32, 0x00, 0x40,             // LD (0x4000),A
        0x01, 0x02, 0x00,             // LD BC,2
        0xCD, settrk[0], settrk[1],
        0x01, 0x00, 0x00,             // LD BC,0
        0xCD, setsec[0], setsec[1],
        0x01, 0x00, 0x40,             // LD BC,0x4000
        0xCD, setdma[0], setdma[1],
        0xCD, write[0], write[1],     // CALL WRITE
        // Clear the marker, read the sector back, print the marker.
        0xAF,                         // XOR A
        0x32, 0x00, 0x40,             // LD (0x4000),A
        0xCD, read[0], read[1],       // CALL READ
        0x3A, 0x00, 0x40,             // LD A,(0x4000)
        0x4F,                         // LD C,A
        0xCD, conout[0], conout[1],
        0xC3, 0x00, 0x00,             // JP 0
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();

    assert_eq!(fixture.output_string(), "Q");
}

#[test]
fn test_console_input_via_bios() {
    let mut fixture = Fixture::with_setup("conin", &[], b"ok");

    let conin = bios_entry(3);
    let conout = bios_entry(4);
    #[rustfmt::skip]
    let program = [
        0xCD, conin[0], conin[1],     // CALL CONIN
        0x4F,                         // LD C,A
        0xCD, conout[0], conout[1],   // CALL CONOUT
        0xCD, conin[0], conin[1],
        0x4F,
        0xCD, conout[0], conout[1],
        0xC3, 0x00, 0x00,
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();

    assert_eq!(fixture.output_string(), "ok");
}

#[test]
fn test_const_reports_readiness() {
    let mut fixture = Fixture::with_setup("const", &[], b"z");

    let const_entry = bios_entry(2);
    let conin = bios_entry(3);
    let conout = bios_entry(4);
    #[rustfmt::skip]
    let program = [
        // CONST with a key queued: A=0xFF, add '0' to prove it; then
        // drain the key and poll again: A=0x00.
        0xCD, const_entry[0], const_entry[1], // CALL CONST
        0xCD, conin[0], conin[1],             // CALL CONIN (drain 'z')
        0xCD, const_entry[0], const_entry[1], // CALL CONST -> A=0
        0xC6, b'0',                           // ADD A,'0'
        0x4F,                                 // LD C,A
        0xCD, conout[0], conout[1],           // CALL CONOUT
        0xC3, 0x00, 0x00,
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();

    assert_eq!(fixture.output_string(), "0");
}

#[test]
fn test_write_to_warm_start_vector_is_fatal() {
    let mut fixture = Fixture::new("fatal");

    #[rustfmt::skip]
    let program = [
        0x3E, 0x12,       // LD A,0x12
        0x32, 0x00, 0x00, // LD (0x0000),A
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();

    let result = fixture.system.run();
    assert!(matches!(
        result,
        Err(CoreError::FatalWrite { address: 0, .. })
    ));
}

#[test]
fn test_write_into_bios_region_is_fatal() {
    let mut fixture = Fixture::new("tamper");

    let target = JUMP_BASE.to_le_bytes();
    #[rustfmt::skip]
    let program = [
        0x3E, 0x00,                 // LD A,0
        0x32, target[0], target[1], // LD (jump table),A
    ];
    fixture.load_program(&program);
    fixture.system.reset().unwrap();

    let result = fixture.system.run();
    assert!(matches!(result, Err(CoreError::BiosWrite { .. })));
}

#[test]
fn test_stray_ret_terminates_cleanly() {
    let mut fixture = Fixture::new("strayret");

    // A bare RET unwinds through the zeroed stack to 0x0000, which jumps
    // to WBOOT and finishes the run.
    fixture.load_program(&[0xC9]);
    fixture.system.reset().unwrap();
    fixture.system.run().unwrap();
    assert!(fixture.system.hardware().finished());
}

#[test]
fn test_command_tail_matches_arguments() {
    let mut fixture = Fixture::new("tail");

    let args = vec!["foo.txt".to_string(), "bar".to_string()];
    fixture.system.load_fcb(&args).unwrap();

    let expected = b" FOO.TXT BAR";
    let mut tail = [0u8; 16];
    fixture.system.hardware().copy_from_ram(&mut tail, 0x0080);
    assert_eq!(tail[0] as usize, expected.len());
    assert_eq!(&tail[1..=expected.len()], expected);
    assert_eq!(tail[1 + expected.len()], 0x00);
}
