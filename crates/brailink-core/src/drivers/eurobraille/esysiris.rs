//! The Esys/Iris protocol: `STX length payload ETX`, where the big-endian
//! length counts the payload plus the two length bytes. Payloads start with
//! a packet type (`S` system, `K` keys) and a subtype.

use tracing::{debug, warn};

use super::Protocol;
use crate::display::DisplayWriter;
use crate::error::{BrailleError, Result};
use crate::keys::{Command, Decoded, KeyQueue, KeySet, KeyState, PassKey, ShiftLevel};
use crate::link::Link;
use crate::model::{Identity, ModelDescriptor};
use crate::packet::stuffing::{ETX, STX};
use crate::packet::Verdict;
use crate::routing::RoutingMode;
use crate::session::{exchange, Reply};

/// Command key bits of Iris models.
pub mod iris_key {
    pub const L1: u32 = 1 << 0;
    pub const L2: u32 = 1 << 1;
    pub const L3: u32 = 1 << 2;
    pub const L4: u32 = 1 << 3;
    pub const L5: u32 = 1 << 4;
    pub const L6: u32 = 1 << 5;
    pub const L7: u32 = 1 << 6;
    pub const L8: u32 = 1 << 7;
    pub const FG: u32 = 1 << 8;
    pub const FD: u32 = 1 << 9;
    pub const FB: u32 = 1 << 10;
    pub const FH: u32 = 1 << 11;
}

/// Command key bits of Esys models: four switches with left, middle and
/// right positions, then the left and right joysticks.
pub mod esys_key {
    pub const SWITCHES: u32 = 0x0FFF;
    pub const M1M: u32 = 1 << 1;
    pub const M4M: u32 = 1 << 10;

    pub const JGG: u32 = 1 << 16;
    pub const JGH: u32 = 1 << 17;
    pub const JGD: u32 = 1 << 18;
    pub const JGB: u32 = 1 << 19;
    pub const LEFT_JOYSTICK: u32 = 0x1F << 16;

    pub const JDG: u32 = 1 << 24;
    pub const JDH: u32 = 1 << 25;
    pub const JDD: u32 = 1 << 26;
    pub const JDB: u32 = 1 << 27;
    pub const JDM: u32 = 1 << 28;
    pub const RIGHT_JOYSTICK: u32 = 0x1F << 24;
}

const SYSTEM: u8 = b'S';
const KEYS: u8 = b'K';

static MODELS: [ModelDescriptor; 8] = [
    ModelDescriptor::new("IRIS 20", 20, "iris").with_routing_keys(),
    ModelDescriptor::new("IRIS 40", 40, "iris").with_routing_keys(),
    ModelDescriptor::new("IRIS S-20", 20, "iris").with_routing_keys(),
    ModelDescriptor::new("IRIS S-32", 32, "iris").with_routing_keys(),
    ModelDescriptor::new("IRIS KB-20", 20, "iris").with_routing_keys(),
    ModelDescriptor::new("IRIS KB-40", 40, "iris").with_routing_keys(),
    ModelDescriptor::new("ESYS 12", 12, "esys").with_routing_keys(),
    ModelDescriptor::new("ESYS 40", 40, "esys").with_routing_keys(),
];

/// Hardware types 7 and 8 are Esys.
const FIRST_ESYS_TYPE: u8 = 7;

fn model_for_type(code: u8) -> Option<&'static ModelDescriptor> {
    MODELS.get(usize::from(code).checked_sub(1)?)
}

pub(super) fn verify(bytes: &[u8], length: &mut usize) -> Verdict {
    let index = bytes.len() - 1;
    let byte = bytes[index];
    match index {
        0 if byte == STX => *length = 3,
        0 => return Verdict::Invalid,
        2 => {
            let declared = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
            if declared < 3 {
                return Verdict::Invalid;
            }
            *length = declared + 2;
        }
        _ if index + 1 == *length && byte != ETX => return Verdict::Invalid,
        _ => {}
    }
    Verdict::Include
}

pub(super) fn encode(payload: &[u8]) -> Vec<u8> {
    let declared = (payload.len() + 2) as u16;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(STX);
    frame.extend_from_slice(&declared.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(ETX);
    frame
}

fn payload(frame: &[u8]) -> &[u8] {
    match frame {
        [STX, _, _, payload @ .., ETX] => payload,
        _ => &[],
    }
}

/// Iris command keys, resolved under the latched shift level.
fn iris_command(code: u32, keys: &mut KeyState) -> Option<Command> {
    use iris_key::*;

    if code == 0 {
        return None;
    }
    if code == FD | FB {
        keys.latch.toggle(ShiftLevel::Level2);
        debug!("level 2 latched: {}", keys.latch.level() == ShiftLevel::Level2);
        return None;
    }
    if code == FG | FB {
        keys.latch.toggle(ShiftLevel::Level1);
        debug!("level 1 latched: {}", keys.latch.level() == ShiftLevel::Level1);
        return None;
    }

    let command = match keys.latch.take() {
        ShiftLevel::Level1 => match code {
            L1 => Command::TopLeft,
            L3 => Command::PreviousSearch,
            L4 => Command::Help,
            L5 => Command::Learn,
            L6 => Command::NextSearch,
            L8 => Command::BottomLeft,
            FG => Command::LineBegin,
            FD => Command::LineEnd,
            FH => Command::Home,
            FB => Command::Return,
            _ => Command::Noop,
        },
        ShiftLevel::Level2 => match code {
            L1 => return set_routing_mode(keys, RoutingMode::ClipNew),
            L2 => return set_routing_mode(keys, RoutingMode::ClipAdd),
            L6 => return set_routing_mode(keys, RoutingMode::CopyRect),
            L8 => return set_routing_mode(keys, RoutingMode::CopyLine),
            L3 => Command::CursorVisibility,
            L7 => Command::Paste,
            FH => Command::PrefMenu,
            FB => Command::CursorTracking,
            FD => Command::Tunes,
            _ => Command::Noop,
        },
        ShiftLevel::Normal => match code {
            L1 => Command::WindowLeft,
            L2 => Command::LineUp,
            L3 => Command::PreviousPrompt,
            L4 => Command::PrefMenu,
            L5 => Command::Info,
            L6 => Command::NextPrompt,
            L7 => Command::LineDown,
            L8 => Command::WindowRight,
            FB => Command::PassKey { key: PassKey::CursorDown },
            FH => Command::PassKey { key: PassKey::CursorUp },
            FG => Command::PassKey { key: PassKey::CursorLeft },
            FD => Command::PassKey { key: PassKey::CursorRight },
            c if c == L1 | L2 => Command::TopLeft,
            c if c == L3 | L4 => Command::Freeze,
            c if c == L6 | L7 => Command::Home,
            c if c == L7 | L8 => Command::BottomLeft,
            c if c == L1 | L2 | L3 | L4 => Command::RestartBraille,
            c if c == L5 | L6 | L7 | L8 => Command::RestartSpeech,
            _ => return None,
        },
    };
    Some(command)
}

fn set_routing_mode(keys: &mut KeyState, mode: RoutingMode) -> Option<Command> {
    debug!("routing mode {:?}", mode);
    keys.routing_mode = mode;
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPosition {
    Left,
    Middle,
    Right,
}

/// The single switch position in `code`, if exactly one switch is pressed.
fn switch_position(code: u32) -> Option<SwitchPosition> {
    let switches = code & esys_key::SWITCHES;
    if switches.count_ones() != 1 {
        return None;
    }
    Some(match switches.trailing_zeros() % 3 {
        0 => SwitchPosition::Left,
        1 => SwitchPosition::Middle,
        _ => SwitchPosition::Right,
    })
}

/// Esys switches and joysticks.
fn esys_command(code: u32, keys: &mut KeyState) -> Option<Command> {
    use esys_key::*;
    use SwitchPosition::{Left, Middle, Right};

    let switches = code & SWITCHES;
    let position = switch_position(code);
    let command = match (code & LEFT_JOYSTICK, code & RIGHT_JOYSTICK, position) {
        (0, 0, Some(Left)) => Command::WindowLeft,
        (0, 0, Some(Right)) => Command::WindowRight,
        (0, 0, Some(Middle)) => Command::Freeze,
        (0, JDG, None) => Command::WindowLeft,
        (0, JDH, None) => Command::LineUp,
        (0, JDD, None) => Command::WindowRight,
        (0, JDB, None) => Command::LineDown,
        (0, JDM, None) => Command::Home,
        (JGH, 0, None) => Command::TopLeft,
        (JGB, 0, None) => Command::BottomLeft,

        (JGD, JDG, None) => return set_routing_mode(keys, RoutingMode::ClipNew),
        (JGD, JDD, None) => return set_routing_mode(keys, RoutingMode::CopyLine),
        (JGD, JDM, None) => Command::Paste,
        (JGD, JDH, None) => Command::Learn,
        (JGD, JDB, None) => Command::Help,
        (JGD, 0, Some(Left)) => Command::LineBegin,
        (JGD, 0, Some(Right)) => Command::LineEnd,
        (JGD, 0, Some(Middle)) if switches == M1M => Command::PrefMenu,
        (JGD, 0, Some(Middle)) if switches == M4M => Command::CursorTracking,

        (JGG, JDG, None) => Command::SaySofter,
        (JGG, JDH, None) => Command::SayAbove,
        (JGG, JDD, None) => Command::SayLouder,
        (JGG, JDB, None) => Command::SayBelow,
        (JGG, JDM, None) => Command::SayLine,
        (JGG, 0, Some(Left)) => Command::SaySlower,
        (JGG, 0, Some(Right)) => Command::SayFaster,
        (JGG, 0, Some(Middle)) => Command::Mute,
        _ => return None,
    };
    Some(command)
}

/// PC keyboard input: `mode key flags character`.
fn keyboard_command(mode: u8, key: u8, flags: u8, character: u8) -> Option<Command> {
    let control = flags & 0x02 != 0;
    let meta = flags & 0x04 != 0;
    let pass_key = |key| Some(Command::PassKey { key });

    match (mode, key) {
        (0, _) if character != 0 => Some(Command::PassChar {
            character: char::from(character),
            control,
            meta,
        }),
        (0, 0x08) => pass_key(PassKey::Backspace),
        (0, 0x70..=0x7B) if meta => Some(Command::SwitchVt {
            number: u16::from(key - 0x70),
        }),
        (0, 0x70..=0x7B) => pass_key(PassKey::Function(key - 0x70)),
        (0, 0) => None,
        (0, _) => Some(Command::PassChar {
            character: char::from(key),
            control,
            meta,
        }),
        (1, 0x07) => pass_key(PassKey::Home),
        (1, 0x08) => pass_key(PassKey::End),
        (1, 0x09) => pass_key(PassKey::PageUp),
        (1, 0x0A) => pass_key(PassKey::PageDown),
        (1, 0x0B) => pass_key(PassKey::CursorLeft),
        (1, 0x0C) => pass_key(PassKey::CursorRight),
        (1, 0x0D) => pass_key(PassKey::CursorUp),
        (1, 0x0E) => pass_key(PassKey::CursorDown),
        (1, 0x10) => pass_key(PassKey::Delete),
        _ => None,
    }
}

pub struct EsysIrisProtocol {
    model: Option<&'static ModelDescriptor>,
    cells: usize,
}

impl EsysIrisProtocol {
    pub fn new() -> Self {
        Self {
            model: None,
            cells: 0,
        }
    }

    fn is_esys(&self) -> bool {
        self.model
            .is_some_and(|model| MODELS[usize::from(FIRST_ESYS_TYPE) - 1..].contains(model))
    }

    /// Record `S` packets. Returns true once both the type and the cell
    /// count are known.
    fn note_system(&mut self, payload: &[u8]) -> bool {
        match *payload {
            [SYSTEM, b'G', cells, ..] => self.cells = usize::from(cells),
            [SYSTEM, b'T', code, ..] => match model_for_type(code) {
                Some(model) => self.model = Some(model),
                None => warn!("unknown EuroBraille hardware type {}", code),
            },
            [SYSTEM, other, ..] => debug!("system information {:?} ignored", char::from(other)),
            _ => {}
        }
        self.model.is_some() && self.cells > 0
    }

    fn decode(&self, payload: &[u8], keys: &mut KeyState) -> Option<Decoded> {
        let mut queue = KeyQueue::new();
        let command = match *payload {
            [KEYS, b'B', high, low, ..] => {
                let bits = u32::from(u16::from_be_bytes([high, low])) & 0x3FF;
                queue.enqueue_keys(bits, KeySet::Braille, 0);
                None
            }
            [KEYS, b'I', _, key, ..] => {
                let number = key & 0xBF;
                if number == 0 || usize::from(number) > self.cells {
                    return None;
                }
                let cell = u16::from(number - 1);
                queue.enqueue_key(KeySet::Routing, cell);
                let mode = std::mem::take(&mut keys.routing_mode);
                mode.gesture(cell).command()
            }
            [KEYS, b'C', a, b, c, d, ..] if self.is_esys() => {
                let code = u32::from_be_bytes([a, b, c, d]) & 0x7FFF_FFFF;
                queue.enqueue_keys(code, KeySet::Navigation, 0);
                esys_command(code, keys)
            }
            [KEYS, b'C', high, low, ..] => {
                let code = u32::from(u16::from_be_bytes([high, low])) & 0x0FFF;
                queue.enqueue_keys(code, KeySet::Navigation, 0);
                iris_command(code, keys)
            }
            [KEYS, b'Z', mode, key, flags, character, ..] => {
                debug!("PC key {:02X} {:02X} {:02X} {:02X}", mode, key, flags, character);
                keyboard_command(mode, key, flags, character)
            }
            [SYSTEM, ..] => {
                debug!("late system information");
                None
            }
            _ => return None,
        };
        Some(Decoded::keys(queue).with_command(command))
    }
}

impl Default for EsysIrisProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for EsysIrisProtocol {
    fn name(&self) -> &'static str {
        "esysiris"
    }

    fn identify(&mut self, link: &mut Link) -> Result<Identity> {
        let timing = link.timing().clone();
        self.model = None;
        self.cells = 0;

        let answered = exchange(
            link,
            timing.retry_limit,
            timing.identify_timeout(),
            |link| link.write_packet(&encode(&[SYSTEM, b'I'])).map(|_| true),
            |link| link.read_packet(&mut verify),
            |frame| {
                let payload = payload(frame);
                if payload.first() != Some(&SYSTEM) {
                    Reply::Unexpected
                } else if self.note_system(payload) {
                    Reply::Done
                } else {
                    Reply::Continue
                }
            },
        )?;
        if answered.is_none() {
            return Err(BrailleError::IdentifyTimeout {
                attempts: timing.retry_limit,
            });
        }

        let model = self
            .model
            .ok_or_else(|| BrailleError::UnknownModel("no hardware type".to_string()))?;
        Ok(model.with_cells(self.cells).identity())
    }

    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>> {
        let Some(frame) = link.read_packet(&mut verify)? else {
            return Ok(None);
        };
        match self.decode(payload(&frame), keys) {
            Some(decoded) => Ok(Some(decoded)),
            None => {
                link.log_unexpected_packet(&frame);
                Ok(Some(Decoded::default()))
            }
        }
    }

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()> {
        if display.plan(cells).is_none() {
            return Ok(());
        }
        let mut packet = Vec::with_capacity(cells.len() + 2);
        packet.extend_from_slice(b"BS");
        packet.extend_from_slice(cells);
        link.write_packet(&encode(&packet))?;
        display.commit(cells, 0..cells.len());
        Ok(())
    }
}
