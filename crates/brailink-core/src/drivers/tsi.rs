//! TSI Navigator and Power Braille displays.
//!
//! Nothing on this link is escaped. Key reports are two bytes (Navigator,
//! Power Braille 40) or six bytes (Power Braille 65/80), each byte carrying a
//! signature in its top three bits. Other input starts with `0x00`: the
//! identity reply, routing switch reports and the low battery warning.
//!
//! Power Braille models can be moved from 9600 to 19200 baud. A display that
//! keeps answering at 9600 after being told to switch is taken to be an
//! emulator and gets a full refresh on every write.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::display::{DisplayWriter, FreshenPolicy};
use crate::driver::{Driver, DriverParameters};
use crate::error::{BrailleError, Result};
use crate::keys::{Command, Decoded, Feature, KeyQueue, KeySet, KeyState, PassKey};
use crate::link::Link;
use crate::model::{Identity, ModelDescriptor};
use crate::packet::{hex, PacketVerifier, Verdict};
use crate::routing::{decode_bitmap, RoutingGesture};
use crate::session::{exchange, Reply};
use crate::transport::{ResourceDescriptor, SerialParameters};

/// Bits of the combined key code.
///
/// The Power Braille reuses the Navigator's left panel bits for its own
/// buttons, hence the aliases.
pub mod key {
    pub const BLEFT: u32 = 1 << 0;
    pub const BUP: u32 = 1 << 1;
    pub const BRIGHT: u32 = 1 << 2;
    pub const BDOWN: u32 = 1 << 3;
    pub const BROUND: u32 = 1 << 4;
    pub const CLEFT: u32 = 1 << 5;
    pub const CUP: u32 = 1 << 6;
    pub const CRIGHT: u32 = 1 << 7;
    pub const CDOWN: u32 = 1 << 8;
    pub const CROUND: u32 = 1 << 9;

    pub const S1UP: u32 = 1 << 10;
    pub const S1DN: u32 = 1 << 11;
    pub const S2UP: u32 = 1 << 12;
    pub const S2DN: u32 = 1 << 13;
    pub const S3UP: u32 = 1 << 14;
    pub const S3DN: u32 = 1 << 15;
    pub const S4UP: u32 = 1 << 16;
    pub const S4DN: u32 = 1 << 17;

    pub const BAR3: u32 = 1 << 18;
    pub const BAR4: u32 = 1 << 20;
    pub const BUT3: u32 = 1 << 21;
    pub const BUT4: u32 = 1 << 23;

    pub const BAR1: u32 = 1 << 24;
    pub const R2UP: u32 = 1 << 25;
    pub const BAR2: u32 = 1 << 26;
    pub const R2DN: u32 = 1 << 27;
    pub const CNCV: u32 = 1 << 28;

    pub const BUT1: u32 = CLEFT;
    pub const R1UP: u32 = CUP;
    pub const BUT2: u32 = CRIGHT;
    pub const R1DN: u32 = CDOWN;
    pub const CNVX: u32 = CROUND;
}

use key::*;

const NORMAL_BAUD: u32 = 9600;
const HIGH_BAUD: u32 = 19200;

const SERIAL: SerialParameters = SerialParameters::new(NORMAL_BAUD);

const QUERY: [u8; 3] = [0xFF, 0xFF, 0x0A];
const SWITCH_TO_HIGH_BAUD: [u8; 4] = [0xFF, 0xFF, 0x05, 0x04];
const RESET_TYPEMATIC: [u8; 5] = [0xFF, 0xFF, 0x0D, 0x09, 0x09];
const WRITE_HEADER: [u8; 6] = [0xFF, 0xFF, 0x04, 0x00, 0x99, 0x00];

const IDENTITY_H1: u8 = 0x00;
const IDENTITY_H2: u8 = 0x05;
const BATTERY_H2: u8 = 0x01;
const SWITCHES_H2: u8 = 0x08;
const IDENTITY_LENGTH: usize = 12;
const VERTICAL_SWITCH_BYTES: usize = 4;

/// Unchanged cells cheaper to resend than to start a new packet for.
const MAXIMUM_GAP: usize = (WRITE_HEADER.len() + 2) / 2;

const KEYS_SIGNATURE_MASK: u8 = 0xE0;

/// Where one key byte's bits go in the combined code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyByte {
    signature: u8,
    mask: u8,
    shift: u8,
}

const fn key_byte(signature: u8, mask: u8, shift: u8) -> KeyByte {
    KeyByte {
        signature,
        mask,
        shift,
    }
}

static NAVIGATOR_KEYS: [KeyByte; 2] = [key_byte(0x60, 0x1F, 0), key_byte(0xE0, 0x1F, 5)];

static POWER_BRAILLE_KEYS: [KeyByte; 6] = [
    key_byte(0x40, 0x0F, 10),
    key_byte(0xC0, 0x0F, 14),
    key_byte(0x20, 0x05, 18),
    key_byte(0xA0, 0x05, 21),
    key_byte(0x60, 0x1F, 24),
    key_byte(0xE0, 0x1F, 5),
];

fn key_layout(first: u8) -> Option<&'static [KeyByte]> {
    [&NAVIGATOR_KEYS[..], &POWER_BRAILLE_KEYS[..]]
        .into_iter()
        .find(|layout| first & KEYS_SIGNATURE_MASK == layout[0].signature)
}

fn key_code(layout: &[KeyByte], bytes: &[u8]) -> u32 {
    layout.iter().zip(bytes).fold(0, |code, (byte, &value)| {
        code | (u32::from(value & byte.mask) << byte.shift)
    })
}

#[derive(Debug)]
struct TsiModel {
    descriptor: ModelDescriptor,
    /// Length of a switch report, vertical switches included.
    switch_bytes: u8,
}

static NAVIGATOR_20: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Navigator 20", 20, "nav20_nav40"),
    switch_bytes: 9,
};

static NAVIGATOR_40: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Navigator 40", 40, "nav20_nav40").with_slow_update(1),
    switch_bytes: 9,
};

static NAVIGATOR_80: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Navigator 80", 80, "nav80")
        .with_routing_keys()
        .with_slow_update(2),
    switch_bytes: 14,
};

static POWER_BRAILLE_40: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Power Braille 40", 40, "pb40")
        .with_routing_keys()
        .with_high_baud(),
    switch_bytes: 9,
};

static POWER_BRAILLE_65: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Power Braille 65", 65, "pb65_pb81")
        .with_routing_keys()
        .with_slow_update(2)
        .with_high_baud(),
    switch_bytes: 15,
};

static POWER_BRAILLE_80: TsiModel = TsiModel {
    descriptor: ModelDescriptor::new("Power Braille 80", 81, "pb65_pb81")
        .with_routing_keys()
        .with_slow_update(2)
        .with_high_baud(),
    switch_bytes: 15,
};

/// Pick the model from the identity reply. Forty cells is either a
/// Navigator or, from hardware version 4 on, a Power Braille.
fn model_for(columns: u8, hardware: &[u8]) -> Option<&'static TsiModel> {
    match columns {
        20 => Some(&NAVIGATOR_20),
        40 if hardware.first().is_some_and(|&major| major > b'3') => Some(&POWER_BRAILLE_40),
        40 => Some(&NAVIGATOR_40),
        80 => Some(&NAVIGATOR_80),
        65 => Some(&POWER_BRAILLE_65),
        81 => Some(&POWER_BRAILLE_80),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Identity,
    Switches,
    Battery,
    Keys(&'static [KeyByte]),
}

fn packet_kind(frame: &[u8]) -> Option<PacketKind> {
    match *frame {
        [IDENTITY_H1, IDENTITY_H2, ..] if frame.len() == IDENTITY_LENGTH => Some(PacketKind::Identity),
        [IDENTITY_H1, SWITCHES_H2, count, ..] if frame.len() == 3 + usize::from(count) => {
            Some(PacketKind::Switches)
        }
        [IDENTITY_H1, BATTERY_H2] => Some(PacketKind::Battery),
        [first, ..] => key_layout(first)
            .filter(|layout| layout.len() == frame.len())
            .map(PacketKind::Keys),
        [] => None,
    }
}

#[derive(Debug, Clone, Default)]
struct TsiVerifier {
    kind: Option<PacketKind>,
}

impl PacketVerifier for TsiVerifier {
    fn verify(&mut self, bytes: &[u8], length: &mut usize) -> Verdict {
        let index = bytes.len() - 1;
        let byte = bytes[index];

        if index == 0 {
            if byte == IDENTITY_H1 {
                self.kind = Some(PacketKind::Identity);
                *length = 2;
                return Verdict::Include;
            }
            return match key_layout(byte) {
                Some(layout) => {
                    self.kind = Some(PacketKind::Keys(layout));
                    *length = layout.len();
                    Verdict::Include
                }
                None => Verdict::Invalid,
            };
        }

        match self.kind {
            Some(PacketKind::Identity) if index == 1 => match byte {
                IDENTITY_H2 => *length = IDENTITY_LENGTH,
                SWITCHES_H2 => {
                    self.kind = Some(PacketKind::Switches);
                    *length = 3;
                }
                BATTERY_H2 => self.kind = Some(PacketKind::Battery),
                _ => return Verdict::Invalid,
            },
            Some(PacketKind::Switches) if index == 2 => *length += usize::from(byte),
            Some(PacketKind::Keys(layout)) => {
                if byte & KEYS_SIGNATURE_MASK != layout[index].signature {
                    return Verdict::Invalid;
                }
            }
            _ => {}
        }
        Verdict::Include
    }

    fn reset(&mut self) {
        self.kind = None;
    }
}

/// Key combinations and what they mean on their own.
static BINDINGS: &[(u32, Command)] = &[
    // movement
    (BAR1, Command::LineUp),
    (R2UP, Command::LineUp),
    (BUP, Command::LineUp),
    (BAR2, Command::LineDown),
    (BAR3, Command::LineDown),
    (BAR4, Command::LineDown),
    (R2DN, Command::LineDown),
    (BDOWN, Command::LineDown),
    (BUT3, Command::WindowLeft),
    (BLEFT, Command::WindowLeft),
    (BUT4, Command::WindowRight),
    (BRIGHT, Command::WindowRight),
    (CNCV, Command::Home),
    (BROUND, Command::Home),
    (CNCV | CUP, Command::Back),
    (BROUND | CUP, Command::Back),
    (CROUND, Command::CursorTracking),
    (BUT1 | BAR1, Command::TopLeft),
    (BLEFT | BUP, Command::TopLeft),
    (BUT1 | BAR2, Command::BottomLeft),
    (BLEFT | BDOWN, Command::BottomLeft),
    (BUT2 | BAR1, Command::PreviousDifferentLine),
    (BROUND | BUP, Command::PreviousDifferentLine),
    (BUT2 | BAR2, Command::NextDifferentLine),
    (BUT2 | BAR3, Command::NextDifferentLine),
    (BUT2 | BAR4, Command::NextDifferentLine),
    (BROUND | BDOWN, Command::NextDifferentLine),
    (BUT2 | R2UP, Command::AttributeUp),
    (CROUND | BUP, Command::AttributeUp),
    (BUT2 | R2DN, Command::AttributeDown),
    (CROUND | BDOWN, Command::AttributeDown),
    (CLEFT | CROUND, Command::CharLeft),
    (CRIGHT | CROUND, Command::CharRight),
    (CLEFT | CUP, Command::HalfWindowLeft),
    (CRIGHT | CUP, Command::HalfWindowRight),
    (BUT1 | BUT2 | BAR1, Command::WindowUp),
    (CROUND | CUP, Command::WindowUp),
    (BUT1 | BUT2 | BAR2, Command::WindowDown),
    (CROUND | CDOWN, Command::WindowDown),
    (R1UP | BUT3, Command::LineBegin),
    (CUP | BLEFT, Command::LineBegin),
    (R1UP | BUT4, Command::LineEnd),
    (CUP | BRIGHT, Command::LineEnd),
    // cursor keys
    (CLEFT, Command::PassKey { key: PassKey::CursorLeft }),
    (CRIGHT, Command::PassKey { key: PassKey::CursorRight }),
    (CUP, Command::PassKey { key: PassKey::CursorUp }),
    (CDOWN, Command::PassKey { key: PassKey::CursorDown }),
    // special modes
    (CLEFT | CRIGHT, Command::Help),
    (BUT1 | BUT2 | BUT3 | BUT4, Command::Learn),
    (CLEFT | CRIGHT | CUP | CDOWN, Command::Learn),
    (CROUND | BROUND, Command::Freeze),
    (CUP | BDOWN, Command::Info),
    (BUT3 | BUT4, Command::Info),
    (BUP | BDOWN, Command::Info),
    (CDOWN | BUP, Command::AttributesVisible),
    (CUP | CDOWN, Command::AttributesVisible),
    (CDOWN | BUP | CROUND, Command::DisplayMode),
    (CUP | CDOWN | CROUND, Command::DisplayMode),
    // routing emulation
    (R1DN | R2DN, Command::CursorJumpVertical),
    (CDOWN | BDOWN, Command::CursorJumpVertical),
    (CDOWN | BROUND, Command::Paste),
    // speech
    (CRIGHT | BLEFT, Command::SayLine),
    (BAR2 | R2DN, Command::SayLine),
    (BRIGHT | BDOWN, Command::SayLine),
    (BAR1 | BAR2 | R2DN, Command::SayBelow),
    (BLEFT | BRIGHT | BDOWN, Command::SayBelow),
    (BROUND | BAR2, Command::SpeechHome),
    (BROUND | BRIGHT, Command::SpeechHome),
    (CRIGHT | CUP | BLEFT | BUP, Command::Mute),
    (BAR2 | R2UP, Command::Mute),
    (BRIGHT | BUP, Command::Mute),
    (BAR1 | BAR2 | R1UP | R2UP, Command::RestartSpeech),
    (BRIGHT | BUP | CUP | BLEFT, Command::RestartSpeech),
    // preferences
    (BAR1 | BAR2, Command::PrefMenu),
    (BLEFT | BRIGHT, Command::PrefMenu),
    (BAR1 | BAR2 | CNCV, Command::PrefSave),
    (BLEFT | BRIGHT | BROUND, Command::PrefSave),
    (BAR1 | BAR2 | CNVX | CNCV, Command::PrefLoad),
    (CROUND | BLEFT | BRIGHT | BROUND, Command::PrefLoad),
    (BLEFT | BRIGHT | BROUND | BDOWN, Command::SkipIdenticalLines),
    (BLEFT | BRIGHT | CROUND | BDOWN, Command::SkipIdenticalLines),
    (CLEFT | BLEFT | BRIGHT, Command::SlideWindow),
    (BUT2 | BAR1 | BAR2, Command::Tunes),
    (CLEFT | CROUND | BLEFT | BRIGHT, Command::Tunes),
    (BUT1 | BAR1 | BAR2, Command::CursorVisibility),
    (CUP | BLEFT | BRIGHT, Command::CursorVisibility),
    (R1DN | BAR1 | BAR2, Command::SixDots),
    (CDOWN | BLEFT | BRIGHT, Command::SixDots),
    (BUT1 | BAR1 | BAR2 | CNVX, Command::CursorBlink),
    (CROUND | CUP | BLEFT | BRIGHT, Command::CursorBlink),
    (BUT2 | BAR1 | BAR2 | CNVX, Command::CapitalBlink),
    (CROUND | CDOWN | BLEFT | BRIGHT, Command::CapitalBlink),
    (CROUND | BUP | BLEFT | BRIGHT, Command::AttributeBlink),
    (CROUND | CRIGHT | BLEFT | BRIGHT, Command::AttributeBlink),
];

/// Power Braille 80 sensor switches: (up, down, feature).
static SWITCHES: &[(u32, u32, Feature)] = &[
    (S1UP, S1DN, Feature::AttributesVisible),
    (S1UP | BAR1 | BAR2 | CNVX, S1DN | BAR1 | BAR2 | CNVX, Feature::AttributeBlink),
    (S1UP | CNVX, S1DN | CNVX, Feature::AttributeBlink),
    (S2UP, S2DN, Feature::Freeze),
    (S3UP, S3DN, Feature::SkipIdenticalLines),
    (S3UP | BAR1, S3DN | BAR1, Feature::SkipIdenticalLines),
    (S4UP, S4DN, Feature::DisplayMode),
];

/// The command bound to `code` with no routing key held.
fn key_command(code: u32, columns: u16) -> Option<Command> {
    let last = columns.saturating_sub(1);
    let command = match code {
        c if c == CDOWN | BDOWN | BLEFT => Command::Route { cell: 0 },
        c if c == CDOWN | BDOWN | BRIGHT => Command::Route {
            cell: (3 * columns / 4).saturating_sub(1),
        },
        c if c == CLEFT | BROUND => Command::ClipNew { cell: 0 },
        c if c == CLEFT | BROUND | BUP => Command::ClipAdd { cell: 0 },
        c if c == CRIGHT | BROUND => Command::CopyRect { cell: last },
        c if c == CRIGHT | BROUND | BUP => Command::CopyLine { cell: last },
        _ => {
            if let Some(&(_, command)) = BINDINGS.iter().find(|(bound, _)| *bound == code) {
                return Some(command);
            }
            let (on, feature) = SWITCHES.iter().find_map(|&(up, down, feature)| {
                if code == up {
                    Some((true, feature))
                } else if code == down {
                    Some((false, feature))
                } else {
                    None
                }
            })?;
            Command::Switch { feature, on }
        }
    };
    Some(command)
}

/// The command for `code` pressed while the routing keys `held` are down.
fn routing_combination(code: u32, held: &[u16]) -> Option<Command> {
    let command = match *held {
        [cell] => match code {
            BRIGHT | BUT3 => Command::ClipNew { cell },
            BLEFT | BUT2 => Command::CopyRect { cell },
            BDOWN | R2DN => Command::NextIndent { cell },
            BUP | R2UP => Command::PreviousIndent { cell },
            CROUND => Command::SetMark { cell },
            BROUND | CNCV => Command::GotoMark { cell },
            CUP => Command::SetLeft { cell },
            CDOWN => Command::SwitchVt { number: cell },
            c if c == CUP | CDOWN || c == CDOWN | BUP => Command::DescribeChar { cell },
            _ => return None,
        },
        [first, second] if first + 1 == second && matches!(code, BRIGHT | BUT3) => {
            Command::ClipAdd { cell: first }
        }
        [first, second] if first + 1 == second && matches!(code, BLEFT | BUT2) => {
            Command::CopyLine { cell: second }
        }
        [0, 1] => match code {
            BDOWN | R2DN => Command::NextParagraph,
            BUP | R2UP => Command::PreviousParagraph,
            _ => return None,
        },
        [1, 2] => match code {
            BDOWN => Command::NextPrompt,
            BUP => Command::PreviousPrompt,
            _ => return None,
        },
        [0, 2] => match code {
            BDOWN | R2DN => Command::NextSearch,
            BUP | R2UP => Command::PreviousSearch,
            _ => return None,
        },
        _ => return None,
    };
    Some(command)
}

pub struct TsiDriver {
    allow_high_baud: bool,
    verifier: TsiVerifier,
    model: &'static TsiModel,
    emulator: bool,
}

pub fn create(parameters: &DriverParameters) -> Result<Box<dyn Driver>> {
    let allow_high_baud = parameters.flag("highbaud", true)?;
    Ok(Box::new(TsiDriver::new(allow_high_baud)))
}

impl TsiDriver {
    pub fn new(allow_high_baud: bool) -> Self {
        Self {
            allow_high_baud,
            verifier: TsiVerifier::default(),
            model: &NAVIGATOR_40,
            emulator: false,
        }
    }

    fn columns(&self) -> u16 {
        self.model.descriptor.cells as u16
    }

    fn set_baud(link: &mut Link, baud: u32) -> Result<()> {
        debug!("trying with {} baud", baud);
        link.reconfigure(&SERIAL.with_baud(baud))
    }

    /// Ask for the identity reply. `None` when the display stays silent.
    fn query(&mut self, link: &mut Link) -> Result<Option<Vec<u8>>> {
        let timing = link.timing().clone();
        let verifier = &mut self.verifier;
        exchange(
            link,
            timing.retry_limit,
            timing.identify_timeout(),
            |link| link.write_packet(&QUERY).map(|_| true),
            |link| link.read_packet(&mut *verifier),
            |packet| match packet_kind(packet) {
                Some(PacketKind::Identity) => Reply::Done,
                _ => Reply::Unexpected,
            },
        )
    }

    fn decode(&self, frame: &[u8], keys: &mut KeyState) -> Option<Decoded> {
        let mut queue = KeyQueue::new();
        let routing = self.model.descriptor.routing_keys;

        match packet_kind(frame)? {
            PacketKind::Keys(layout) => {
                let code = key_code(layout, frame);
                queue.enqueue_updated_keys(code, &mut keys.navigation, KeySet::Navigation, 0);
                let command = if code == 0 {
                    None
                } else if routing && keys.routing.is_active() {
                    keys.routing
                        .consume()
                        .and_then(|held| routing_combination(code, &held))
                } else {
                    key_command(code, self.columns())
                };
                Some(Decoded::keys(queue).with_command(command))
            }

            PacketKind::Switches => {
                if frame[2] != self.model.switch_bytes {
                    debug!("switch report of {} bytes ignored", frame[2]);
                    return Some(Decoded::default());
                }
                if !routing {
                    return Some(Decoded::default());
                }

                let horizontal = &frame[3 + VERTICAL_SWITCH_BYTES..];
                let pressed = decode_bitmap(horizontal, self.model.descriptor.cells);
                let held = keys.routing.keys();
                let command = match keys.routing.update(&pressed) {
                    Some(chord) => {
                        for &cell in &held {
                            queue.enqueue_key_event(KeySet::Routing, cell, false);
                        }
                        let last = self.model.descriptor.last_routing_key();
                        RoutingGesture::classify(&chord, last).command()
                    }
                    None => {
                        if pressed.is_empty() {
                            for &cell in &held {
                                queue.enqueue_key_event(KeySet::Routing, cell, false);
                            }
                        }
                        for &cell in pressed.iter().filter(|cell| !held.contains(*cell)) {
                            queue.enqueue_key_event(KeySet::Routing, cell, true);
                        }
                        None
                    }
                };
                Some(Decoded::keys(queue).with_command(command))
            }

            PacketKind::Battery => {
                warn!("battery low");
                Some(Decoded::default())
            }

            PacketKind::Identity => {
                debug!("late identity reply: {}", hex(frame));
                Some(Decoded::default())
            }
        }
    }

    fn write_range(&self, link: &mut Link, cells: &[u8], from: usize, to: usize) -> Result<()> {
        let count = to - from;
        let mut packet = Vec::with_capacity(WRITE_HEADER.len() + 2 + 2 * count);
        packet.extend_from_slice(&WRITE_HEADER);
        packet.push((2 * count) as u8);
        packet.push(from as u8);
        for &cell in &cells[from..to] {
            packet.extend_from_slice(&[0, cell]);
        }
        link.write_packet(&packet)?;
        let settle = u64::from(self.model.descriptor.slow_update) * link.timing().slow_update_ms;
        link.add_delay(settle);
        Ok(())
    }
}

impl Driver for TsiDriver {
    fn resource(&self) -> ResourceDescriptor {
        ResourceDescriptor::serial(SERIAL)
    }

    fn packet_capacity(&self) -> usize {
        3 + 0xFF
    }

    fn identify(&mut self, link: &mut Link) -> Result<Identity> {
        let timing = link.timing().clone();
        let silent = || BrailleError::IdentifyTimeout {
            attempts: timing.retry_limit,
        };

        Self::set_baud(link, NORMAL_BAUD)?;
        let mut baud = NORMAL_BAUD;
        let reply = match self.query(link)? {
            Some(reply) => reply,
            None => {
                // A Power Braille may have been left at the higher speed.
                if !self.allow_high_baud {
                    return Err(silent());
                }
                Self::set_baud(link, HIGH_BAUD)?;
                baud = HIGH_BAUD;
                self.query(link)?.ok_or_else(silent)?
            }
        };

        let columns = reply[2];
        let hardware = &reply[5..8];
        let model = model_for(columns, hardware).ok_or_else(|| {
            BrailleError::UnknownModel(format!("TSI display with {} cells", columns))
        })?;
        let version = String::from_utf8_lossy(hardware).to_string();
        info!(
            "display replied: {} cells, version {}; detected {}",
            columns, version, model.descriptor.name
        );
        self.model = model;
        self.emulator = false;

        if baud < HIGH_BAUD && self.allow_high_baud && model.descriptor.high_baud {
            warn!("changing display to {} baud", HIGH_BAUD);
            link.write_packet(&SWITCH_TO_HIGH_BAUD)?;
            link.drain_output(timing.baud_switch_delay_ms);
            Self::set_baud(link, HIGH_BAUD)?;

            if self.query(link)?.is_some() {
                debug!("display responded at {} baud", HIGH_BAUD);
            } else {
                info!(
                    "display did not respond at {} baud, falling back to {} baud",
                    HIGH_BAUD, NORMAL_BAUD
                );
                Self::set_baud(link, NORMAL_BAUD)?;
                link.drain_output(timing.baud_switch_delay_ms);
                if self.query(link)?.is_none() {
                    error!("display lost after baud switch");
                    return Err(silent());
                }
                info!(
                    "found display again at {} baud, must be a TSI emulator",
                    NORMAL_BAUD
                );
                self.emulator = true;
            }
        }

        link.write_packet(&RESET_TYPEMATIC)?;
        Ok(model.descriptor.identity().with_firmware(version))
    }

    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>> {
        let now = Instant::now();
        let window = link.timing().non_repeat();
        let stale = keys.typematic.begin_read(now, window);

        let Some(frame) = link.read_packet(&mut self.verifier)? else {
            return Ok(None);
        };
        let Some(mut decoded) = self.decode(&frame, keys) else {
            link.log_unexpected_packet(&frame);
            return Ok(Some(Decoded::default()));
        };
        decoded.command = decoded
            .command
            .and_then(|command| keys.typematic.filter(command, now, window, stale));
        Ok(Some(decoded))
    }

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()> {
        let single_packet = self.model.descriptor.slow_update == 2;
        for range in display.plan_ranges(cells, MAXIMUM_GAP, single_packet) {
            self.write_range(link, cells, range.start, range.end)?;
            display.commit(cells, range);
        }
        Ok(())
    }

    fn freshen(&self, configured: u32) -> FreshenPolicy {
        if self.emulator {
            FreshenPolicy::Every(1)
        } else if configured == 0 {
            FreshenPolicy::Never
        } else {
            FreshenPolicy::Every(configured)
        }
    }

    fn reset(&mut self) {
        self.verifier.reset();
        self.emulator = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyEvent;
    use crate::packet::PacketReader;

    fn frames(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut reader = PacketReader::new(3 + 0xFF);
        let mut verifier = TsiVerifier::default();
        bytes
            .iter()
            .filter_map(|&b| reader.push_byte(b, &mut verifier))
            .collect()
    }

    fn driver_for(model: &'static TsiModel) -> TsiDriver {
        let mut driver = TsiDriver::new(true);
        driver.model = model;
        driver
    }

    fn switches(model: &TsiModel, horizontal: &[u8]) -> Vec<u8> {
        let mut packet = vec![IDENTITY_H1, SWITCHES_H2, model.switch_bytes, 0, 0, 0, 0];
        let mut bits = vec![0u8; usize::from(model.switch_bytes) - VERTICAL_SWITCH_BYTES];
        bits[..horizontal.len()].copy_from_slice(horizontal);
        packet.extend(bits);
        packet
    }

    /// Navigator key bytes for a code using only the low ten bits.
    fn navigator_keys(code: u32) -> Vec<u8> {
        vec![0x60 | (code & 0x1F) as u8, 0xE0 | ((code >> 5) & 0x1F) as u8]
    }

    #[test]
    fn test_frames_of_every_kind() {
        let identity = [0x00, 0x05, 40, 8, b'v', b'4', b'.', b'0', 1, 2, 3, 4];
        let mut input = identity.to_vec();
        input.extend([0x00, 0x01]);
        input.extend(navigator_keys(BUP));
        let found = frames(&input);
        assert_eq!(found.len(), 3);
        assert_eq!(packet_kind(&found[0]), Some(PacketKind::Identity));
        assert_eq!(packet_kind(&found[1]), Some(PacketKind::Battery));
        assert!(matches!(packet_kind(&found[2]), Some(PacketKind::Keys(_))));
    }

    #[test]
    fn test_switch_report_length_comes_from_count() {
        let packet = switches(&POWER_BRAILLE_80, &[0x01]);
        assert_eq!(packet.len(), 3 + 15);
        assert_eq!(frames(&packet), vec![packet]);
    }

    #[test]
    fn test_bad_signature_resyncs() {
        // Second byte lacks the 0xE0 signature; the following pair parses.
        let mut input = vec![0x61, 0x02];
        input.extend(navigator_keys(BDOWN));
        assert_eq!(frames(&input), vec![navigator_keys(BDOWN)]);
    }

    #[test]
    fn test_power_braille_key_bytes() {
        let bytes = [0x40 | 0x01, 0xC0, 0x20, 0xA0, 0x60 | 0x01, 0xE0];
        assert_eq!(frames(&bytes).len(), 1);
        assert_eq!(key_code(&POWER_BRAILLE_KEYS, &bytes), S1UP | BAR1);
    }

    #[test]
    fn test_key_commands() {
        let mut keys = KeyState::new();
        let driver = driver_for(&NAVIGATOR_40);
        let decoded = driver.decode(&navigator_keys(BUP), &mut keys).unwrap();
        assert_eq!(decoded.command, Some(Command::LineUp));
        assert_eq!(decoded.keys, vec![KeyEvent::press(KeySet::Navigation, 1)]);

        let decoded = driver.decode(&navigator_keys(0), &mut keys).unwrap();
        assert_eq!(decoded.command, None);
        assert_eq!(decoded.keys, vec![KeyEvent::release(KeySet::Navigation, 1)]);

        assert_eq!(key_command(CLEFT | CRIGHT, 40), Some(Command::Help));
        assert_eq!(
            key_command(CDOWN | BDOWN | BRIGHT, 40),
            Some(Command::Route { cell: 29 })
        );
        assert_eq!(
            key_command(CRIGHT | BROUND, 40),
            Some(Command::CopyRect { cell: 39 })
        );
        assert_eq!(
            key_command(CLEFT, 40),
            Some(Command::PassKey {
                key: PassKey::CursorLeft
            })
        );
        assert_eq!(key_command(S2DN, 81), Some(Command::Switch { feature: Feature::Freeze, on: false }));
        assert_eq!(key_command(BLEFT | BUP | BRIGHT | BDOWN | BROUND, 40), None);
    }

    #[test]
    fn test_bindings_are_unambiguous() {
        for (index, (code, _)) in BINDINGS.iter().enumerate() {
            assert!(
                BINDINGS[index + 1..].iter().all(|(other, _)| other != code),
                "key code {:#X} bound twice",
                code
            );
        }
    }

    #[test]
    fn test_routing_chord_on_release() {
        let mut keys = KeyState::new();
        let driver = driver_for(&NAVIGATOR_80);
        let held = driver
            .decode(&switches(&NAVIGATOR_80, &[0b0000_0011]), &mut keys)
            .unwrap();
        assert_eq!(held.command, None);
        assert_eq!(held.keys.len(), 2);

        let released = driver
            .decode(&switches(&NAVIGATOR_80, &[]), &mut keys)
            .unwrap();
        assert_eq!(released.command, Some(Command::Paste));
        assert!(released.keys.iter().all(|k| !k.pressed));
    }

    #[test]
    fn test_routing_plus_key_consumes_chord() {
        let mut keys = KeyState::new();
        let driver = driver_for(&POWER_BRAILLE_40);
        driver.decode(&switches(&POWER_BRAILLE_40, &[0b0010_0000]), &mut keys);
        let combined = driver.decode(&navigator_keys(CROUND), &mut keys).unwrap();
        assert_eq!(combined.command, Some(Command::SetMark { cell: 5 }));

        let again = driver.decode(&navigator_keys(CUP), &mut keys).unwrap();
        assert_eq!(again.command, None, "chord already used");

        let released = driver
            .decode(&switches(&POWER_BRAILLE_40, &[]), &mut keys)
            .unwrap();
        assert_eq!(released.command, None);
    }

    #[test]
    fn test_routing_combinations() {
        assert_eq!(
            routing_combination(BRIGHT, &[3, 4]),
            Some(Command::ClipAdd { cell: 3 })
        );
        assert_eq!(
            routing_combination(BUT2, &[3, 4]),
            Some(Command::CopyLine { cell: 4 })
        );
        assert_eq!(routing_combination(BDOWN, &[0, 1]), Some(Command::NextParagraph));
        assert_eq!(routing_combination(BUP, &[1, 2]), Some(Command::PreviousPrompt));
        assert_eq!(routing_combination(R2DN, &[0, 2]), Some(Command::NextSearch));
        assert_eq!(
            routing_combination(CUP | CDOWN, &[7]),
            Some(Command::DescribeChar { cell: 7 })
        );
        assert_eq!(routing_combination(BDOWN, &[0, 5]), None);
    }

    #[test]
    fn test_switch_report_for_other_model_is_ignored() {
        let mut keys = KeyState::new();
        let driver = driver_for(&POWER_BRAILLE_80);
        let decoded = driver
            .decode(&switches(&NAVIGATOR_80, &[0x01]), &mut keys)
            .unwrap();
        assert!(decoded.is_empty());
        assert!(!keys.routing.is_active());
    }

    #[test]
    fn test_model_selection() {
        assert_eq!(model_for(40, b"4.0").map(|m| m.descriptor.name), Some("Power Braille 40"));
        assert_eq!(model_for(40, b"3.1").map(|m| m.descriptor.name), Some("Navigator 40"));
        assert_eq!(model_for(81, b"1.0").map(|m| m.descriptor.last_routing_key()), Some(80));
        assert!(model_for(32, b"1.0").is_none());
    }

    #[test]
    fn test_freshen_policy() {
        let mut driver = TsiDriver::new(true);
        assert_eq!(driver.freshen(12), FreshenPolicy::Every(12));
        assert_eq!(driver.freshen(0), FreshenPolicy::Never);
        driver.emulator = true;
        assert_eq!(driver.freshen(12), FreshenPolicy::Every(1));
    }
}
