//! Key events, resolved commands and the key state a session carries.
//!
//! Drivers turn key frames into two parallel outputs:
//!
//! | Output | Type | Consumer |
//! |--------|------|----------|
//! | Raw key transitions | [`KeyEvent`] | key-table engines |
//! | Direct-dispatch result | [`Command`] | hosts without a key table |
//!
//! [`KeyQueue`] produces the ordered press/release sequences, and
//! [`KeyState`] holds everything that must survive between frames: the
//! pressed navigation keys, the shift-level latch, the routing chord and the
//! typematic filter.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::routing::{RoutingChord, RoutingMode};

/// Group a key number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySet {
    Navigation,
    Routing,
    Status,
    Braille,
    Separator,
    Keyboard,
    KeyboardE0,
    KeyboardE1,
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeySet::Navigation => "navigation",
            KeySet::Routing => "routing",
            KeySet::Status => "status",
            KeySet::Braille => "braille",
            KeySet::Separator => "separator",
            KeySet::Keyboard => "keyboard",
            KeySet::KeyboardE0 => "keyboard_e0",
            KeySet::KeyboardE1 => "keyboard_e1",
        };
        f.write_str(name)
    }
}

/// One key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub set: KeySet,
    pub number: u16,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn press(set: KeySet, number: u16) -> Self {
        Self {
            set,
            number,
            pressed: true,
        }
    }

    pub fn release(set: KeySet, number: u16) -> Self {
        Self {
            set,
            number,
            pressed: false,
        }
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.pressed { "press" } else { "release" };
        write!(f, "{} {}.{}", action, self.set, self.number)
    }
}

/// Ordered key transitions produced while decoding one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyQueue {
    events: Vec<KeyEvent>,
}

impl KeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_key_event(&mut self, set: KeySet, number: u16, pressed: bool) {
        self.events.push(KeyEvent {
            set,
            number,
            pressed,
        });
    }

    /// A complete keystroke: press then release.
    pub fn enqueue_key(&mut self, set: KeySet, number: u16) {
        self.enqueue_key_event(set, number, true);
        self.enqueue_key_event(set, number, false);
    }

    /// Press every key whose bit is set, lowest bit first, then release
    /// them in reverse order. Bit `i` is key `first + i`.
    pub fn enqueue_keys(&mut self, bits: u32, set: KeySet, first: u16) {
        let numbers: Vec<u16> = (0..32u16)
            .filter(|bit| bits & (1 << bit) != 0)
            .map(|bit| first + bit)
            .collect();
        for &number in &numbers {
            self.enqueue_key_event(set, number, true);
        }
        for &number in numbers.iter().rev() {
            self.enqueue_key_event(set, number, false);
        }
    }

    /// Emit the transitions from `old` to `new` and store `new` in `old`.
    ///
    /// Releases are emitted immediately; presses are collected and emitted
    /// afterwards, highest key first.
    pub fn enqueue_updated_keys(&mut self, new: u32, old: &mut u32, set: KeySet, first: u16) {
        let mut pressed = Vec::new();
        for bit in 0..32u16 {
            let mask = 1u32 << bit;
            if new & mask == *old & mask {
                continue;
            }
            if new & mask != 0 {
                pressed.push(first + bit);
            } else {
                self.enqueue_key_event(set, first + bit, false);
            }
        }
        *old = new;
        for number in pressed.into_iter().rev() {
            self.enqueue_key_event(set, number, true);
        }
    }

    /// Decode an XT scan code. `escape` selects the set (`0x00`, `0xE0` or
    /// `0xE1`) and bit 7 of `code` marks a release. Returns false for an
    /// unknown escape.
    pub fn enqueue_xt_scan_code(&mut self, code: u8, escape: u8) -> bool {
        let set = match escape {
            0x00 => KeySet::Keyboard,
            0xE0 => KeySet::KeyboardE0,
            0xE1 => KeySet::KeyboardE1,
            other => {
                warn!("unsupported xt scan code escape: {:02X}", other);
                return false;
            }
        };
        self.enqueue_key_event(set, u16::from(code & 0x7F), code & 0x80 == 0);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[KeyEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<KeyEvent> {
        self.events
    }
}

/// Keys passed through to the host as if typed on a keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKey {
    CursorLeft,
    CursorRight,
    CursorUp,
    CursorDown,
    Backspace,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    Function(u8),
}

/// Toggleable host features driven by hardware switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AttributesVisible,
    AttributeBlink,
    Freeze,
    SkipIdenticalLines,
    DisplayMode,
}

/// Commands resolved directly by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Noop,
    Offline,

    // Window and line movement
    WindowLeft,
    WindowRight,
    WindowUp,
    WindowDown,
    HalfWindowLeft,
    HalfWindowRight,
    LineUp,
    LineDown,
    CharLeft,
    CharRight,
    LineBegin,
    LineEnd,
    TopLeft,
    BottomLeft,
    Home,
    Back,
    Return,
    PreviousDifferentLine,
    NextDifferentLine,
    AttributeUp,
    AttributeDown,
    PreviousParagraph,
    NextParagraph,
    PreviousPrompt,
    NextPrompt,
    PreviousSearch,
    NextSearch,
    CursorJumpVertical,
    SlideWindow,

    // Modes and preferences
    CursorTracking,
    CursorVisibility,
    CursorBlink,
    CapitalBlink,
    AttributeBlink,
    AttributesVisible,
    DisplayMode,
    SixDots,
    SkipIdenticalLines,
    Freeze,
    Tunes,
    Info,
    Help,
    Learn,
    PrefMenu,
    PrefSave,
    PrefLoad,
    RestartBraille,

    // Speech
    SayLine,
    SayAbove,
    SayBelow,
    SaySofter,
    SayLouder,
    SaySlower,
    SayFaster,
    SpeechHome,
    Mute,
    RestartSpeech,

    // Cells and clipboard
    Route { cell: u16 },
    Paste,
    ClipNew { cell: u16 },
    ClipAdd { cell: u16 },
    CopyRect { cell: u16 },
    CopyLine { cell: u16 },
    ClipCopy { from: u16, to: u16 },
    NextIndent { cell: u16 },
    PreviousIndent { cell: u16 },
    SetMark { cell: u16 },
    GotoMark { cell: u16 },
    SetLeft { cell: u16 },
    DescribeChar { cell: u16 },
    SwitchVt { number: u16 },

    // Keyboard
    PassKey { key: PassKey },
    PassChar { character: char, control: bool, meta: bool },

    Switch { feature: Feature, on: bool },
}

impl Command {
    /// Movement commands that may legitimately repeat while a key is held.
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            Command::WindowRight
                | Command::WindowLeft
                | Command::LineUp
                | Command::LineDown
                | Command::WindowUp
                | Command::WindowDown
                | Command::CharLeft
                | Command::CharRight
                | Command::CursorTracking
                | Command::PassKey {
                    key: PassKey::CursorLeft
                        | PassKey::CursorRight
                        | PassKey::CursorUp
                        | PassKey::CursorDown
                }
        )
    }
}

/// Either kind of input a session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    Key(KeyEvent),
    Command(Command),
}

/// What a session queues for the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Raw key transitions, falling back to commands.
    #[default]
    Keys,
    /// Resolved commands, falling back to key transitions.
    Commands,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub keys: Vec<KeyEvent>,
    pub command: Option<Command>,
}

impl Decoded {
    pub fn keys(keys: KeyQueue) -> Self {
        Self {
            keys: keys.into_events(),
            command: None,
        }
    }

    pub fn command(command: Command) -> Self {
        Self {
            keys: Vec::new(),
            command: Some(command),
        }
    }

    pub fn with_command(mut self, command: Option<Command>) -> Self {
        self.command = command;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.command.is_none()
    }

    /// Events for `mode`, using the other output when the preferred one is
    /// empty.
    pub fn into_events(self, mode: InputMode) -> Vec<InputEvent> {
        let keys: Vec<InputEvent> = self.keys.into_iter().map(InputEvent::Key).collect();
        let command: Vec<InputEvent> = self.command.map(InputEvent::Command).into_iter().collect();
        match mode {
            InputMode::Keys if keys.is_empty() => command,
            InputMode::Keys => keys,
            InputMode::Commands if command.is_empty() => keys,
            InputMode::Commands => command,
        }
    }
}

/// Shift level applied to the next command key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftLevel {
    #[default]
    Normal,
    Level1,
    Level2,
}

/// Latch for level-shift trigger keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelLatch {
    level: ShiftLevel,
}

impl LevelLatch {
    pub fn level(&self) -> ShiftLevel {
        self.level
    }

    /// Toggle `level`. Ignored while a different level is latched.
    pub fn toggle(&mut self, level: ShiftLevel) {
        if self.level == level {
            self.level = ShiftLevel::Normal;
        } else if self.level == ShiftLevel::Normal {
            self.level = level;
        }
    }

    /// The level for the key being resolved; the latch resets.
    pub fn take(&mut self) -> ShiftLevel {
        std::mem::take(&mut self.level)
    }
}

/// Drops typematic repeats of commands that should fire once per press.
#[derive(Debug, Clone, Default)]
pub struct Typematic {
    last_command: Option<Command>,
    last_command_at: Option<Instant>,
    last_read_at: Option<Instant>,
}

impl Typematic {
    /// Note a read at `now`. Returns true when the previous read was more
    /// than `window` ago, in which case buffered repeats are stale.
    pub fn begin_read(&mut self, now: Instant, window: Duration) -> bool {
        let stale = self
            .last_read_at
            .is_some_and(|at| now.saturating_duration_since(at) > window);
        self.last_read_at = Some(now);
        stale
    }

    /// Pass `command` through unless it repeats the previous one too soon.
    pub fn filter(
        &mut self,
        command: Command,
        now: Instant,
        window: Duration,
        stale: bool,
    ) -> Option<Command> {
        if self.last_command == Some(command) && !command.is_repeatable() {
            if stale {
                self.last_command_at = Some(now);
                return None;
            }
            let recent = self
                .last_command_at
                .is_some_and(|at| now.saturating_duration_since(at) < window);
            if recent {
                return None;
            }
        }
        self.last_command = Some(command);
        self.last_command_at = Some(now);
        Some(command)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Key state kept between frames.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    /// Currently pressed navigation keys, one bit per key.
    pub navigation: u32,
    pub latch: LevelLatch,
    pub routing: RoutingChord,
    pub routing_mode: RoutingMode,
    pub typematic: Typematic,
}

impl KeyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, as after a reconnect.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(set: KeySet, number: u16) -> KeyEvent {
        KeyEvent::press(set, number)
    }

    fn release(set: KeySet, number: u16) -> KeyEvent {
        KeyEvent::release(set, number)
    }

    #[test]
    fn test_enqueue_key_is_press_then_release() {
        let mut queue = KeyQueue::new();
        queue.enqueue_key(KeySet::Routing, 7);
        assert_eq!(
            queue.events(),
            &[press(KeySet::Routing, 7), release(KeySet::Routing, 7)]
        );
    }

    #[test]
    fn test_enqueue_keys_releases_in_reverse() {
        let mut queue = KeyQueue::new();
        queue.enqueue_keys(0b1010_0001, KeySet::Braille, 1);
        assert_eq!(
            queue.into_events(),
            vec![
                press(KeySet::Braille, 1),
                press(KeySet::Braille, 6),
                press(KeySet::Braille, 8),
                release(KeySet::Braille, 8),
                release(KeySet::Braille, 6),
                release(KeySet::Braille, 1),
            ]
        );
    }

    #[test]
    fn test_enqueue_keys_zero_is_empty() {
        let mut queue = KeyQueue::new();
        queue.enqueue_keys(0, KeySet::Braille, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_updated_keys() {
        let mut old = 0b0011;
        let mut queue = KeyQueue::new();
        queue.enqueue_updated_keys(0b1101, &mut old, KeySet::Navigation, 0);
        assert_eq!(old, 0b1101);
        assert_eq!(
            queue.into_events(),
            vec![
                release(KeySet::Navigation, 1),
                press(KeySet::Navigation, 3),
                press(KeySet::Navigation, 2),
            ],
            "releases first, then presses highest first"
        );
    }

    #[test]
    fn test_all_zero_releases_everything() {
        let mut old = 0b101;
        let mut queue = KeyQueue::new();
        queue.enqueue_updated_keys(0, &mut old, KeySet::Navigation, 10);
        assert_eq!(old, 0);
        assert_eq!(
            queue.into_events(),
            vec![
                release(KeySet::Navigation, 10),
                release(KeySet::Navigation, 12)
            ]
        );
    }

    #[test]
    fn test_xt_scan_codes() {
        let mut queue = KeyQueue::new();
        assert!(queue.enqueue_xt_scan_code(0x1E, 0x00));
        assert!(queue.enqueue_xt_scan_code(0xC8, 0xE0));
        assert!(!queue.enqueue_xt_scan_code(0x10, 0x42));
        assert_eq!(
            queue.into_events(),
            vec![press(KeySet::Keyboard, 0x1E), release(KeySet::KeyboardE0, 0x48)]
        );
    }

    #[test]
    fn test_decoded_mode_fallback() {
        let key = press(KeySet::Routing, 3);
        let both = Decoded {
            keys: vec![key],
            command: Some(Command::Route { cell: 3 }),
        };
        assert_eq!(
            both.clone().into_events(InputMode::Keys),
            vec![InputEvent::Key(key)]
        );
        assert_eq!(
            both.into_events(InputMode::Commands),
            vec![InputEvent::Command(Command::Route { cell: 3 })]
        );

        let keys_only = Decoded {
            keys: vec![key],
            command: None,
        };
        assert_eq!(
            keys_only.into_events(InputMode::Commands),
            vec![InputEvent::Key(key)],
            "commands mode falls back to keys"
        );
        assert_eq!(
            Decoded::command(Command::Paste).into_events(InputMode::Keys),
            vec![InputEvent::Command(Command::Paste)]
        );
    }

    #[test]
    fn test_level_latch() {
        let mut latch = LevelLatch::default();
        latch.toggle(ShiftLevel::Level2);
        assert_eq!(latch.level(), ShiftLevel::Level2);

        latch.toggle(ShiftLevel::Level1);
        assert_eq!(
            latch.level(),
            ShiftLevel::Level2,
            "another level cannot replace a latched one"
        );

        assert_eq!(latch.take(), ShiftLevel::Level2);
        assert_eq!(latch.level(), ShiftLevel::Normal);

        latch.toggle(ShiftLevel::Level1);
        latch.toggle(ShiftLevel::Level1);
        assert_eq!(latch.level(), ShiftLevel::Normal, "second trigger cancels");
    }

    #[test]
    fn test_typematic_drops_quick_repeat() {
        let window = Duration::from_millis(300);
        let start = Instant::now();
        let mut typematic = Typematic::default();

        assert_eq!(
            typematic.filter(Command::Help, start, window, false),
            Some(Command::Help)
        );
        let soon = start + Duration::from_millis(100);
        assert_eq!(typematic.filter(Command::Help, soon, window, false), None);
        let later = start + Duration::from_millis(400);
        assert_eq!(
            typematic.filter(Command::Help, later, window, false),
            Some(Command::Help)
        );
    }

    #[test]
    fn test_typematic_allows_movement_repeat() {
        let window = Duration::from_millis(300);
        let start = Instant::now();
        let mut typematic = Typematic::default();
        let soon = start + Duration::from_millis(50);
        assert!(typematic
            .filter(Command::LineDown, start, window, false)
            .is_some());
        assert!(typematic
            .filter(Command::LineDown, soon, window, false)
            .is_some());
        let left = Command::PassKey {
            key: PassKey::CursorLeft,
        };
        assert!(typematic.filter(left, start, window, false).is_some());
        assert!(typematic.filter(left, soon, window, false).is_some());
    }

    #[test]
    fn test_typematic_stale_read_drops_repeat() {
        let window = Duration::from_millis(300);
        let start = Instant::now();
        let mut typematic = Typematic::default();
        assert!(!typematic.begin_read(start, window));
        typematic.filter(Command::Info, start, window, false);

        let late = start + Duration::from_secs(2);
        let stale = typematic.begin_read(late, window);
        assert!(stale);
        assert_eq!(typematic.filter(Command::Info, late, window, stale), None);
        assert_eq!(
            typematic.filter(Command::Help, late, window, stale),
            Some(Command::Help),
            "a different command is never stale"
        );
    }

    #[test]
    fn test_command_serialization() {
        let json = serde_json::to_string(&Command::Route { cell: 4 }).unwrap();
        assert_eq!(json, r#"{"command":"route","cell":4}"#);
        let event = InputEvent::Key(press(KeySet::Navigation, 0x41));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"key","set":"navigation","number":65,"pressed":true}"#
        );
        let parsed: InputEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
