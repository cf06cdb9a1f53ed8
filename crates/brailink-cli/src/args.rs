//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use brailink_core::InputMode;
use clap::{Parser, Subcommand, ValueEnum};

const DRIVER_HELP: &str = "Driver code (ir, eu, ts, np); see 'brailink drivers'";
const DEVICE_HELP: &str = "Device identifier (serial:/dev/ttyUSB0, usb:, bluetooth:, host:port)";
const PARAMETERS_HELP: &str = "Driver parameters as name=value,name=value";

/// Host for refreshable braille displays.
///
/// Connects to a display over serial, USB, Bluetooth or TCP, identifies
/// it, writes cells, and reports key presses as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "brailink", version)]
pub struct Cli {
    /// Session configuration file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the available drivers as JSON
    Drivers,

    /// Open a display and print its input events until interrupted
    #[command(after_help = "\
Examples:
  brailink run -d ir -D serial:/dev/ttyS0            # Iris on a serial port
  brailink run -d eu -D usb: --mode commands         # Esys over USB, resolved commands
  brailink run -d eu -D serial:/dev/ttyUSB0 -p protocol=clio
  brailink run -d ts -D serial:/dev/ttyS0 -p highbaud=yes --text 'hello'
  brailink run -d np -D localhost:35752              # Simulator over TCP")]
    Run(RunArgs),

    /// Write text to a display and close it
    #[command(after_help = "\
Text is shown one character per cell. Letters and space have their braille
patterns, other characters show dots 7 and 8.

Examples:
  brailink write -d ir -D serial:/dev/ttyS0 'hello world'
  brailink write -d ts -D bluetooth: 'ready'")]
    Write(WriteArgs),

    /// Show an end-to-end usage example
    Examples,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    #[arg(short, long, help = DRIVER_HELP)]
    pub driver: String,

    #[arg(short = 'D', long, help = DEVICE_HELP)]
    pub device: String,

    #[arg(short, long, default_value = "", help = PARAMETERS_HELP)]
    pub parameters: String,

    /// What to report: raw key transitions or resolved commands.
    /// Overrides the configuration file.
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Text to show once the display is identified
    #[arg(short, long)]
    pub text: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct WriteArgs {
    #[arg(short, long, help = DRIVER_HELP)]
    pub driver: String,

    #[arg(short = 'D', long, help = DEVICE_HELP)]
    pub device: String,

    #[arg(short, long, default_value = "", help = PARAMETERS_HELP)]
    pub parameters: String,

    /// Text to show
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Key transitions (key set, number, pressed)
    Keys,
    /// Commands such as routing, clip operations and navigation
    Commands,
}

impl From<ModeArg> for InputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Keys => InputMode::Keys,
            ModeArg::Commands => InputMode::Commands,
        }
    }
}

/// End-to-end example text for the `examples` command.
pub const EXAMPLES_TEXT: &str = r#"End-to-end example: Watch a TSI display's keys

This example finds the right driver, shows some text, and watches the keys.

# 1. List the drivers, their parameters and connection kinds
brailink drivers

# 2. Open the display, show a greeting, and report commands
brailink run -d ts -D serial:/dev/ttyUSB0 --mode commands --text "hello"

# 3. Press routing keys; each press prints one JSON line, e.g.
#    {"timestamp":"2026-01-01T12:00:00+00:00","event":"command","command":"route","cell":3}

# 4. Press Ctrl+C to close the session

# 5. Write a line without watching keys
brailink write -d ts -D serial:/dev/ttyUSB0 "goodbye"

# Timing can be tuned in ~/.config/brailink/config.json, e.g.
#    {"poll_interval_ms": 20, "timing": {"identify_timeout_ms": 2000}}
# Set RUST_LOG=debug to see every packet.
"#;

#[cfg(test)]
mod tests {
    use super::{Cli, Commands, ModeArg};
    use clap::Parser;

    #[test]
    fn test_run_parses_all_options() {
        let cli = Cli::parse_from([
            "brailink",
            "run",
            "-d",
            "eu",
            "-D",
            "serial:/dev/ttyUSB0",
            "-p",
            "protocol=clio",
            "--mode",
            "commands",
            "--text",
            "hi there",
        ]);

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.driver, "eu");
                assert_eq!(args.device, "serial:/dev/ttyUSB0");
                assert_eq!(args.parameters, "protocol=clio");
                assert_eq!(args.mode, Some(ModeArg::Commands));
                assert_eq!(args.text.as_deref(), Some("hi there"));
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["brailink", "run", "-d", "ir", "-D", "serial:/dev/ttyS0"]);

        match cli.command {
            Commands::Run(args) => {
                assert!(args.parameters.is_empty());
                assert!(args.mode.is_none());
                assert!(args.text.is_none());
            }
            _ => panic!("Expected run command"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::parse_from([
            "brailink",
            "write",
            "-d",
            "ts",
            "-D",
            "bluetooth:",
            "--config",
            "/tmp/brailink.json",
            "ready",
        ]);

        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/brailink.json"))
        );
        match cli.command {
            Commands::Write(args) => assert_eq!(args.text, "ready"),
            _ => panic!("Expected write command"),
        }
    }

    #[test]
    fn test_run_requires_device() {
        assert!(Cli::try_parse_from(["brailink", "run", "-d", "ir"]).is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from([
            "brailink", "run", "-d", "ir", "-D", "usb:", "--mode", "dots"
        ])
        .is_err());
    }
}
