//! Session lifecycle: connect, identify, poll, write, restart, close.
//!
//! ```text
//! Uninitialized -> Connecting -> Identifying -> Ready
//!                                   |             |
//!                                   v             v
//!                                 Error -> Reconnecting -> Identifying
//!                                   |
//!                                   v
//!                                 Closed
//! ```
//!
//! A session is synchronous and single-owner. Hosts poll
//! [`Session::read_input`] and call the write methods from the same thread.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::display::DisplayWriter;
use crate::driver::{Driver, DriverEntry};
use crate::error::{BrailleError, Result};
use crate::keys::{InputEvent, KeyState};
use crate::link::Link;
use crate::model::Identity;
use crate::transport::{DeviceIdentifier, Endpoint, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Connecting,
    Identifying,
    Ready,
    Error,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Identifying => "identifying",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How an exchange handler judged one response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Not the answer yet; keep reading.
    Continue,
    /// This packet is the answer.
    Done,
    /// The device answered negatively; stop without retrying.
    Fail,
    /// Not related to the request; logged and skipped.
    Unexpected,
}

/// Send a request and wait for its answer, re-sending up to `retry_limit`
/// times in total.
///
/// Returns the accepted packet, `None` when the device never answered or
/// refused, and `Err` on transport failure.
pub fn exchange<W, R, H>(
    link: &mut Link,
    retry_limit: u32,
    input_timeout: Duration,
    mut write_request: W,
    mut read_packet: R,
    mut handle_response: H,
) -> Result<Option<Vec<u8>>>
where
    W: FnMut(&mut Link) -> Result<bool>,
    R: FnMut(&mut Link) -> Result<Option<Vec<u8>>>,
    H: FnMut(&[u8]) -> Reply,
{
    for attempt in 1..=retry_limit.max(1) {
        if !write_request(link)? {
            break;
        }
        link.drain_output(0);

        while link.await_input(input_timeout)? {
            let Some(packet) = read_packet(link)? else {
                break;
            };
            match handle_response(&packet) {
                Reply::Done => return Ok(Some(packet)),
                Reply::Fail => return Ok(None),
                Reply::Continue => {}
                Reply::Unexpected => link.log_unexpected_packet(&packet),
            }
        }

        debug!("no response to attempt {} of {}", attempt, retry_limit);
    }
    Ok(None)
}

/// A full display update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub cells: Vec<u8>,
    #[serde(default)]
    pub cursor: Option<usize>,
    #[serde(default)]
    pub status: Option<Vec<u8>>,
}

enum Connector {
    Device(DeviceIdentifier),
    /// A caller-supplied transport; reconnecting reuses the same link.
    Supplied,
}

pub struct Session {
    entry: &'static DriverEntry,
    connector: Connector,
    config: SessionConfig,
    driver: Box<dyn Driver>,
    link: Option<Link>,
    state: SessionState,
    identity: Option<Identity>,
    display: DisplayWriter,
    keys: KeyState,
    pending: VecDeque<InputEvent>,
}

impl Session {
    fn new(
        entry: &'static DriverEntry,
        connector: Connector,
        parameters: &str,
        config: SessionConfig,
    ) -> Result<Self> {
        let driver = entry.instantiate(parameters)?;
        Ok(Self {
            entry,
            connector,
            config,
            driver,
            link: None,
            state: SessionState::Uninitialized,
            identity: None,
            display: DisplayWriter::new(0),
            keys: KeyState::new(),
            pending: VecDeque::new(),
        })
    }

    /// Connect to `identifier` and identify the display.
    pub fn open(
        entry: &'static DriverEntry,
        identifier: &str,
        parameters: &str,
        config: SessionConfig,
    ) -> Result<Self> {
        let identifier = DeviceIdentifier::parse(identifier)?;
        let mut session = Self::new(entry, Connector::Device(identifier), parameters, config)?;
        let link = session.connect()?;
        session.start(link)?;
        Ok(session)
    }

    /// Identify a display over an already-open transport.
    pub fn with_transport(
        entry: &'static DriverEntry,
        transport: Box<dyn Transport>,
        bytes_per_second: u32,
        parameters: &str,
        config: SessionConfig,
    ) -> Result<Self> {
        let mut session = Self::new(entry, Connector::Supplied, parameters, config)?;
        let endpoint = Endpoint::from_transport(transport, bytes_per_second, &session.config.timing);
        let link = Link::new(
            endpoint,
            session.driver.packet_capacity(),
            session.config.timing.clone(),
        );
        session.start(link)?;
        Ok(session)
    }

    fn connect(&mut self) -> Result<Link> {
        let Connector::Device(identifier) = &self.connector else {
            return Err(BrailleError::Closed);
        };
        self.state = SessionState::Connecting;
        let resource = self.driver.resource();
        match Endpoint::connect(self.entry.code, identifier, &resource, &self.config.timing) {
            Ok(endpoint) => Ok(Link::new(
                endpoint,
                self.driver.packet_capacity(),
                self.config.timing.clone(),
            )),
            Err(error) => {
                warn!("{}: cannot connect: {}", self.entry.code, error);
                self.state = SessionState::Error;
                Err(error)
            }
        }
    }

    fn start(&mut self, mut link: Link) -> Result<()> {
        self.state = SessionState::Identifying;
        self.driver.reset();
        self.keys.reset();
        self.pending.clear();

        match self.driver.identify(&mut link) {
            Ok(identity) => {
                info!(
                    "{}: {} with {} cells (key table {})",
                    self.entry.code, identity.model, identity.cells, identity.key_table
                );
                self.display = DisplayWriter::new(identity.cells)
                    .with_freshen(self.driver.freshen(self.config.freshen_every));
                self.identity = Some(identity);
                self.link = Some(link);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(error) => {
                warn!("{}: identification failed: {}", self.entry.code, error);
                if let Err(close_error) = link.close() {
                    debug!("close after failed identify: {}", close_error);
                }
                self.state = SessionState::Error;
                Err(error)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn driver(&self) -> &'static DriverEntry {
        self.entry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn fail(&mut self, error: BrailleError) -> BrailleError {
        warn!("{}: session failed: {}", self.entry.code, error);
        self.state = SessionState::Error;
        error
    }

    /// The next input event, or `None` when nothing is ready yet.
    pub fn read_input(&mut self) -> Result<Option<InputEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        self.ensure_ready()?;
        let Some(link) = self.link.as_mut() else {
            return Err(BrailleError::NotReady(self.state));
        };

        let mode = self.config.input_mode;
        loop {
            let decoded = match self.driver.read_input(link, &mut self.keys) {
                Ok(decoded) => decoded,
                Err(error) => return Err(self.fail(error)),
            };
            if link.exceeded_fault_limit() {
                let faults = link.consecutive_faults();
                return Err(self.fail(BrailleError::TooManyFaults(faults)));
            }
            let Some(decoded) = decoded else {
                break;
            };
            self.pending.extend(decoded.into_events(mode));
            if !self.pending.is_empty() {
                break;
            }
        }

        Ok(self.pending.pop_front())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state != SessionState::Ready || self.link.is_none() {
            return Err(BrailleError::NotReady(self.state));
        }
        Ok(())
    }

    fn check_write(&mut self, result: Result<()>) -> Result<()> {
        result.map_err(|error| {
            let error = match error {
                BrailleError::Io(io) => BrailleError::WriteFailed(io.to_string()),
                other => other,
            };
            self.fail(error)
        })
    }

    /// Write the text cells. Only the changed part goes over the link.
    pub fn write_window(&mut self, cells: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let expected = self.display.cells();
        if cells.len() != expected {
            return Err(BrailleError::CellCount {
                expected,
                actual: cells.len(),
            });
        }
        let Some(link) = self.link.as_mut() else {
            return Err(BrailleError::NotReady(self.state));
        };
        let result = self.driver.write_window(link, &mut self.display, cells);
        self.check_write(result)
    }

    pub fn write_cursor(&mut self, cursor: Option<usize>) -> Result<()> {
        self.ensure_ready()?;
        let Some(link) = self.link.as_mut() else {
            return Err(BrailleError::NotReady(self.state));
        };
        let result = self.driver.write_cursor(link, &mut self.display, cursor);
        self.check_write(result)
    }

    pub fn write_status(&mut self, status: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let Some(link) = self.link.as_mut() else {
            return Err(BrailleError::NotReady(self.state));
        };
        let result = self.driver.write_status(link, &mut self.display, status);
        self.check_write(result)
    }

    /// Show `text` on a text display, for models that have one. The text
    /// is blank-padded or truncated to the cell count.
    pub fn write_visual(&mut self, text: &str) -> Result<()> {
        self.ensure_ready()?;
        let Some(link) = self.link.as_mut() else {
            return Err(BrailleError::NotReady(self.state));
        };
        let width = self.display.cells();
        let mut characters: Vec<char> = text.chars().take(width).collect();
        characters.resize(width, ' ');
        let result = self.driver.write_visual(link, &characters);
        self.check_write(result)
    }

    pub fn write(&mut self, request: &WriteRequest) -> Result<()> {
        self.write_window(&request.cells)?;
        if request.cursor.is_some() {
            self.write_cursor(request.cursor)?;
        }
        if let Some(status) = &request.status {
            self.write_status(status)?;
        }
        Ok(())
    }

    /// Force the next window write to send every cell.
    pub fn mark_for_rewrite(&mut self) {
        self.display.mark_for_rewrite();
    }

    /// Reconnect and identify again, typically after an error.
    pub fn restart(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(BrailleError::NotReady(self.state));
        }
        self.state = SessionState::Reconnecting;
        info!("{}: restarting session", self.entry.code);

        let link = if matches!(self.connector, Connector::Device(_)) {
            if let Some(mut old) = self.link.take() {
                if let Err(error) = old.close() {
                    debug!("close before reconnect: {}", error);
                }
            }
            self.connect()?
        } else {
            match self.link.take() {
                Some(mut link) => {
                    link.discard_input()?;
                    link
                }
                None => {
                    self.state = SessionState::Error;
                    return Err(BrailleError::Closed);
                }
            }
        };
        self.start(link)
    }

    pub fn close(&mut self) -> Result<()> {
        self.state = SessionState::Closed;
        self.pending.clear();
        match self.link.take() {
            Some(mut link) => {
                debug!("{}: closing session", self.entry.code);
                link.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(error) = link.close() {
                warn!("{}: close on drop failed: {}", self.entry.code, error);
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("driver", &self.entry.code)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .finish()
    }
}
