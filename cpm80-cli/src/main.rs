//! Run an unmodified CP/M 2.2 program on the host.
//!
//! A real BDOS/CCP binary image is loaded into the emulated 64 KiB and
//! runs untouched; only the BIOS underneath it is intercepted. The
//! current working directory is the emulated disk.
//!
//! Usage:
//!   cpm80 [options] <binary> [args...]
//!
//! Examples:
//!   cpm80 mbasic.com
//!   cpm80 stat.com foo.txt
//!   cpm80 --terminal vt100 --trace wordstar.com

mod keymap;
mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use log::{error, LevelFilter};

use cpm80_core::hardware::Config;
use cpm80_core::system::{System, TPA_BASE};

use crate::keymap::Keymap;
use crate::terminal::{HostTerminal, TerminalKind};

/// Run CP/M programs
#[derive(Parser, Debug)]
#[command(name = "cpm80")]
#[command(about = "Run CP/M 2.2 programs")]
struct Args {
    /// Binary file that provides BDOS/CCP
    #[arg(long, default_value_os_t = default_bdos_file())]
    bdosfile: PathBuf,

    /// Load address of the BDOS binary
    #[arg(long, default_value = "DC00", value_parser = parse_hex)]
    bdosbase: u16,

    /// Address of WBOOT in the loaded BDOS
    #[arg(long, default_value = "F203", value_parser = parse_hex)]
    wboot: u16,

    /// Address of FBASE in the loaded BDOS
    #[arg(long, default_value = "E406", value_parser = parse_hex)]
    fbase: u16,

    /// Symbol (.lab) file for the BDOS
    #[arg(long, default_value = "bdos.lab")]
    bdossym: PathBuf,

    /// Optional symbol (.lab) file for the user executable
    #[arg(long)]
    usersym: Option<PathBuf>,

    /// Terminal emulation
    #[arg(long, value_enum, default_value_t = TerminalKind::Plain)]
    terminal: TerminalKind,

    /// Keymap file for the terminal
    #[arg(long, default_value = "wordstar.keys")]
    keymap: PathBuf,

    /// Terminal geometry
    #[arg(long, default_value_t = 80)]
    columns: u16,
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Enable memory access checks
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    memcheck: bool,

    /// Log BDOS calls
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    logbdos: bool,

    /// Treat writes to the warm-start vector as fatal
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    protectwarm: bool,

    /// Treat writes to the BDOS jump vector as fatal
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    protectbdosjump: bool,

    /// Verbose trace logging
    #[arg(long)]
    trace: bool,

    /// Log sink path
    #[arg(long, default_value = "zcpm.log")]
    logfile: PathBuf,

    /// CP/M .COM binary to execute
    binary: PathBuf,

    /// Arguments for the binary
    args: Vec<String>,
}

fn default_bdos_file() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join("zcpm").join("bdos.bin")
}

fn parse_hex(s: &str) -> Result<u16, String> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| format!("not a hex address: {}", e))
}

/// Puts the terminal back the way we found it, error paths included.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        Self {
            enabled: enable_raw_mode().is_ok(),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = disable_raw_mode();
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Can't open log file '{}': {}", args.logfile.display(), e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            error!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) -> std::io::Result<()> {
    let sink = std::fs::File::create(&args.logfile)?;
    env_logger::Builder::new()
        .filter_level(if args.trace {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        })
        .target(env_logger::Target::Pipe(Box::new(sink)))
        .init();
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let keymap = if args.keymap.exists() {
        Keymap::load(&args.keymap)?
    } else {
        log::warn!("Keymap file '{}' not found", args.keymap.display());
        Keymap::empty()
    };

    let host_terminal = HostTerminal::new(args.terminal, keymap, args.columns, args.rows);

    let config = Config {
        memcheck: args.memcheck,
        log_bdos: args.logbdos,
        protect_warm_vector: args.protectwarm,
        protect_bdos_jump: args.protectbdosjump,
        bdos_sym: args.bdossym.exists().then(|| args.bdossym.clone()),
        user_sym: args.usersym.clone(),
        logfile_name: args
            .logfile
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "zcpm.log".to_string()),
        disk_root: PathBuf::from("."),
    };

    let mut system = System::new(Box::new(host_terminal), config);

    // The BDOS/CCP image is a real CP/M 2.2 reconstruction; once loaded,
    // its BIOS jump table is discovered and rewritten for interception.
    system.load_binary(args.bdosbase, &args.bdosfile)?;
    system.setup_bios(args.fbase, args.wboot)?;

    // CP/M transient programs always load at 0x0100.
    system.load_binary(TPA_BASE, &args.binary)?;
    system.load_fcb(&args.args)?;

    system.reset()?;
    // Let the BDOS initialise its disk structures before the program runs.
    system.setup_bdos()?;
    system.reset()?;

    let _raw_mode = RawModeGuard::enable();
    system.run()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("DC00"), Ok(0xDC00));
        assert_eq!(parse_hex("0xdc00"), Ok(0xDC00));
        assert_eq!(parse_hex("f203"), Ok(0xF203));
        assert!(parse_hex("not-hex").is_err());
    }

    #[test]
    fn test_argument_defaults() {
        let args = Args::parse_from(["cpm80", "prog.com"]);
        assert_eq!(args.bdosbase, 0xDC00);
        assert_eq!(args.wboot, 0xF203);
        assert_eq!(args.fbase, 0xE406);
        assert_eq!(args.terminal, TerminalKind::Plain);
        assert_eq!(args.columns, 80);
        assert_eq!(args.rows, 24);
        assert!(args.memcheck);
        assert!(args.logbdos);
        assert!(args.protectwarm);
        assert!(args.protectbdosjump);
        assert!(!args.trace);
        assert_eq!(args.logfile, PathBuf::from("zcpm.log"));
        assert_eq!(args.binary, PathBuf::from("prog.com"));
        assert!(args.args.is_empty());
    }

    #[test]
    fn test_positional_arguments() {
        let args = Args::parse_from(["cpm80", "stat.com", "foo.txt", "bar"]);
        assert_eq!(args.binary, PathBuf::from("stat.com"));
        assert_eq!(args.args, vec!["foo.txt".to_string(), "bar".to_string()]);
    }

    #[test]
    fn test_boolean_options_take_values() {
        let args = Args::parse_from(["cpm80", "--memcheck", "false", "--trace", "prog.com"]);
        assert!(!args.memcheck);
        assert!(args.trace);
    }
}
