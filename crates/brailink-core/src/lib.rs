//! Core types and logic for brailink.
//!
//! This crate talks to refreshable braille displays over serial, USB,
//! Bluetooth and network links. It frames and verifies device packets,
//! decodes key reports into key events and commands, and writes display
//! contents differentially. It's used by the `brailink` CLI.
//!
//! # Modules
//!
//! - [`transport`]: device identifiers, connection kinds and the byte pipe
//! - [`packet`]: frame assembly with resynchronization and byte stuffing
//! - [`link`]: one open connection with its reader, timing and write delay
//! - [`keys`]: key events, commands and per-session key state
//! - [`routing`]: routing-key chords and gestures
//! - [`display`]: differential display updates
//! - [`driver`]: the driver trait and the driver table
//! - [`session`]: connect, identify, read, write, restart and close
//! - [`error`]: error types with actionable suggestions
//!
//! # Drivers
//!
//! | Code | Family | Connections | Identify |
//! |------|--------|-------------|----------|
//! | `ir` | Iris | serial | version and serial number requests |
//! | `eu` | EuroBraille Esys/Iris and Clio | serial, USB, Bluetooth | `S I` system request |
//! | `ts` | TSI Navigator and Power Braille | serial, Bluetooth | `FF FF 0A` query |
//! | `np` | NinePoint | serial, Bluetooth | none |
//!
//! A [`session::Session`] owns one driver and one link. Hosts poll
//! [`session::Session::read_input`] and push cells with
//! [`session::Session::write_window`].

pub mod config;
pub mod display;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod keys;
pub mod link;
pub mod model;
pub mod packet;
pub mod routing;
pub mod session;
pub mod transport;

pub use config::{SessionConfig, Timing};
pub use error::{BrailleError, ErrorCode, ErrorReport, Result};
pub use keys::{Command, InputEvent, InputMode, KeyEvent, KeySet};
pub use model::Identity;
pub use session::{Session, SessionState, WriteRequest};
