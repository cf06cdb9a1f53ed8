//! Routing-key chords.
//!
//! Displays that report routing keys as a bitmap resend the bitmap while keys
//! are held and send an all-zero bitmap when everything is released. A chord
//! is the union of every key seen between two all-zero bitmaps, so keys count
//! together only when they were held at the same time.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::keys::Command;

/// Decode a routing bitmap, least significant bit of the first byte being
/// cell 0. Bits beyond `cells` are ignored.
pub fn decode_bitmap(bytes: &[u8], cells: usize) -> Vec<u16> {
    (0..cells.min(bytes.len() * 8))
        .filter(|cell| bytes[cell / 8] & (1 << (cell % 8)) != 0)
        .map(|cell| cell as u16)
        .collect()
}

/// Routing keys accumulated until release-all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingChord {
    held: BTreeSet<u16>,
    ignore_release: bool,
}

impl RoutingChord {
    /// Keys held so far, ascending.
    pub fn keys(&self) -> Vec<u16> {
        self.held.iter().copied().collect()
    }

    pub fn is_active(&self) -> bool {
        !self.held.is_empty()
    }

    /// Feed one report. Returns the completed chord when `pressed` is empty,
    /// unless the chord was already consumed by [`RoutingChord::consume`].
    pub fn update(&mut self, pressed: &[u16]) -> Option<Vec<u16>> {
        if !pressed.is_empty() {
            self.held.extend(pressed.iter().copied());
            return None;
        }
        let keys = self.keys();
        let ignored = std::mem::take(&mut self.ignore_release);
        self.held.clear();
        if ignored || keys.is_empty() {
            return None;
        }
        Some(keys)
    }

    /// Mark the held keys as used by a combination with other keys, so the
    /// coming release produces nothing. Returns the held keys, or `None` if
    /// they were already consumed.
    pub fn consume(&mut self) -> Option<Vec<u16>> {
        if self.ignore_release {
            return None;
        }
        self.ignore_release = true;
        Some(self.keys())
    }

    pub fn reset(&mut self) {
        self.held.clear();
        self.ignore_release = false;
    }
}

/// What a routing chord means on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gesture", rename_all = "snake_case")]
pub enum RoutingGesture {
    Route { cell: u16 },
    Paste,
    CharLeft,
    CharRight,
    HalfWindowLeft,
    HalfWindowRight,
    Help,
    Learn,
    ClipNew { cell: u16 },
    ClipAdd { cell: u16 },
    CopyRect { cell: u16 },
    CopyLine { cell: u16 },
    ClipCopy { from: u16, to: u16 },
    Unknown,
}

impl RoutingGesture {
    /// Classify a chord. `keys` must be ascending; `last` is the highest
    /// routing key of the model.
    pub fn classify(keys: &[u16], last: u16) -> Self {
        let near_end = |offset: u16| last.checked_sub(offset);
        match *keys {
            [cell] => RoutingGesture::Route { cell },
            [0, 1] => RoutingGesture::Paste,
            [1, 2] => RoutingGesture::CharLeft,
            [a, b] if Some(a) == near_end(1) && b == last => RoutingGesture::CharRight,
            [0, 2] => RoutingGesture::HalfWindowLeft,
            [a, b] if Some(a) == near_end(2) && b == last => RoutingGesture::HalfWindowRight,
            [0, b] if b == last => RoutingGesture::Help,
            [0, 1, c, d] if Some(c) == near_end(1) && d == last => RoutingGesture::Learn,
            [from, middle, to] if from.checked_add(2) == Some(middle) => {
                RoutingGesture::ClipCopy { from, to }
            }
            _ => RoutingGesture::Unknown,
        }
    }

    pub fn command(self) -> Option<Command> {
        let command = match self {
            RoutingGesture::Route { cell } => Command::Route { cell },
            RoutingGesture::Paste => Command::Paste,
            RoutingGesture::CharLeft => Command::CharLeft,
            RoutingGesture::CharRight => Command::CharRight,
            RoutingGesture::HalfWindowLeft => Command::HalfWindowLeft,
            RoutingGesture::HalfWindowRight => Command::HalfWindowRight,
            RoutingGesture::Help => Command::Help,
            RoutingGesture::Learn => Command::Learn,
            RoutingGesture::ClipNew { cell } => Command::ClipNew { cell },
            RoutingGesture::ClipAdd { cell } => Command::ClipAdd { cell },
            RoutingGesture::CopyRect { cell } => Command::CopyRect { cell },
            RoutingGesture::CopyLine { cell } => Command::CopyLine { cell },
            RoutingGesture::ClipCopy { from, to } => Command::ClipCopy { from, to },
            RoutingGesture::Unknown => return None,
        };
        Some(command)
    }
}

/// How the next single routing key is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    Route,
    ClipNew,
    ClipAdd,
    CopyRect,
    CopyLine,
}

impl RoutingMode {
    pub fn gesture(self, cell: u16) -> RoutingGesture {
        match self {
            RoutingMode::Route => RoutingGesture::Route { cell },
            RoutingMode::ClipNew => RoutingGesture::ClipNew { cell },
            RoutingMode::ClipAdd => RoutingGesture::ClipAdd { cell },
            RoutingMode::CopyRect => RoutingGesture::CopyRect { cell },
            RoutingMode::CopyLine => RoutingGesture::CopyLine { cell },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bitmap() {
        assert_eq!(decode_bitmap(&[0b0000_0101, 0b1000_0000], 16), vec![0, 2, 15]);
        assert_eq!(
            decode_bitmap(&[0, 0b1000_0000], 12),
            Vec::<u16>::new(),
            "bits past the cell count are ignored"
        );
    }

    #[test]
    fn test_simultaneous_keys_form_one_chord() {
        let mut chord = RoutingChord::default();
        assert_eq!(chord.update(&[0]), None);
        assert_eq!(chord.update(&[0, 1]), None);
        assert_eq!(chord.update(&[]), Some(vec![0, 1]));
        assert!(!chord.is_active());
    }

    #[test]
    fn test_sequential_keys_are_separate() {
        let mut chord = RoutingChord::default();
        chord.update(&[0]);
        assert_eq!(chord.update(&[]), Some(vec![0]));
        chord.update(&[1]);
        assert_eq!(chord.update(&[]), Some(vec![1]));
    }

    #[test]
    fn test_keys_released_one_by_one_stay_in_chord() {
        // The display resends the bitmap with fewer keys as they lift.
        let mut chord = RoutingChord::default();
        chord.update(&[3, 4]);
        chord.update(&[4]);
        assert_eq!(chord.update(&[]), Some(vec![3, 4]));
    }

    #[test]
    fn test_consumed_chord_release_is_ignored() {
        let mut chord = RoutingChord::default();
        chord.update(&[5]);
        assert_eq!(chord.consume(), Some(vec![5]));
        assert_eq!(chord.consume(), None);
        assert_eq!(chord.update(&[]), None);
        chord.update(&[6]);
        assert_eq!(chord.update(&[]), Some(vec![6]), "next chord is normal");
    }

    #[test]
    fn test_classify() {
        let last = 39;
        assert_eq!(
            RoutingGesture::classify(&[12], last),
            RoutingGesture::Route { cell: 12 }
        );
        assert_eq!(RoutingGesture::classify(&[0, 1], last), RoutingGesture::Paste);
        assert_eq!(RoutingGesture::classify(&[1, 2], last), RoutingGesture::CharLeft);
        assert_eq!(RoutingGesture::classify(&[38, 39], last), RoutingGesture::CharRight);
        assert_eq!(
            RoutingGesture::classify(&[0, 2], last),
            RoutingGesture::HalfWindowLeft
        );
        assert_eq!(
            RoutingGesture::classify(&[37, 39], last),
            RoutingGesture::HalfWindowRight
        );
        assert_eq!(RoutingGesture::classify(&[0, 39], last), RoutingGesture::Help);
        assert_eq!(
            RoutingGesture::classify(&[0, 1, 38, 39], last),
            RoutingGesture::Learn
        );
        assert_eq!(
            RoutingGesture::classify(&[4, 6, 20], last),
            RoutingGesture::ClipCopy { from: 4, to: 20 }
        );
        assert_eq!(
            RoutingGesture::classify(&[4, 9], last),
            RoutingGesture::Unknown
        );
        assert_eq!(RoutingGesture::classify(&[], last), RoutingGesture::Unknown);
    }

    #[test]
    fn test_classify_tiny_display() {
        assert_eq!(
            RoutingGesture::classify(&[0, 1], 1),
            RoutingGesture::Paste,
            "overlapping offsets resolve to the first match"
        );
    }

    #[test]
    fn test_routing_mode() {
        assert_eq!(
            RoutingMode::CopyLine.gesture(3).command(),
            Some(Command::CopyLine { cell: 3 })
        );
        assert_eq!(RoutingMode::default().gesture(0), RoutingGesture::Route { cell: 0 });
        assert_eq!(RoutingGesture::Unknown.command(), None);
    }
}
