//! In-memory transport for tests and simulations.
//!
//! A [`MockTransport`] is handed to the session while the paired
//! [`MockHandle`] stays with the test. Both share one state snapshot behind a
//! mutex: the handle queues device output, installs a responder that answers
//! each written packet, and inspects what was written.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{SerialParameters, Transport, TransportKind};

/// Answers a written chunk. Receives the chunk and the current baud rate
/// (`None` until the transport is reconfigured).
pub type Responder = Box<dyn FnMut(&[u8], Option<u32>) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    input: VecDeque<u8>,
    responder: Option<Responder>,
    written: Vec<Vec<u8>>,
    bauds: Vec<u32>,
    baud: Option<u32>,
    closed: bool,
    fail_writes: bool,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        Self::with_kind(TransportKind::Mock)
    }

    /// A mock that reports itself as another transport kind.
    pub fn with_kind(kind: TransportKind) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let handle = MockHandle {
            state: Arc::clone(&state),
        };
        (Self { kind, state }, handle)
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        let count = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        state.written.push(data.to_vec());
        let baud = state.baud;
        if let Some(responder) = state.responder.as_mut() {
            let reply = responder(data, baud);
            state.input.extend(reply);
        }
        Ok(data.len())
    }

    fn await_input(&mut self, _timeout: Duration) -> io::Result<bool> {
        let state = lock(&self.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        Ok(!state.input.is_empty())
    }

    fn reconfigure(&mut self, parameters: &SerialParameters) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.baud = Some(parameters.baud);
        state.bauds.push(parameters.baud);
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        lock(&self.state).input.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue bytes as if the device had sent them.
    pub fn push_input(&self, bytes: &[u8]) {
        lock(&self.state).input.extend(bytes.iter().copied());
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8], Option<u32>) -> Vec<u8> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
    }

    /// Every chunk written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    /// Remove and return the chunks written so far.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock(&self.state).written)
    }

    /// Baud rates applied through reconfiguration, in order.
    pub fn bauds(&self) -> Vec<u32> {
        lock(&self.state).bauds.clone()
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.state).input.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Make every following write fail.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }
}
