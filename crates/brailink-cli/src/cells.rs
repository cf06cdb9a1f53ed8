//! Text to braille cells for the `run --text` and `write` commands.
//!
//! Cells use the usual dot numbering: bit 0 is dot 1 through bit 7 for
//! dot 8. Letters get their literary braille patterns (uppercase adds dot
//! 7), space is blank, and anything else shows dots 7 and 8.

const LETTERS: [u8; 26] = [
    0x01, 0x03, 0x09, 0x19, 0x11, 0x0B, 0x1B, 0x13, 0x0A, 0x1A, // a-j
    0x05, 0x07, 0x0D, 0x1D, 0x15, 0x0F, 0x1F, 0x17, 0x0E, 0x1E, // k-t
    0x25, 0x27, 0x3A, 0x2D, 0x3D, 0x35, // u-z
];

const DOT_7: u8 = 0x40;
const UNKNOWN: u8 = 0xC0;

fn cell(character: char) -> u8 {
    match character {
        ' ' => 0,
        'a'..='z' => LETTERS[(character as u8 - b'a') as usize],
        'A'..='Z' => LETTERS[(character as u8 - b'A') as usize] | DOT_7,
        _ => UNKNOWN,
    }
}

/// One cell per character, blank-padded or truncated to `width`.
pub fn text_cells(text: &str, width: usize) -> Vec<u8> {
    let mut cells: Vec<u8> = text.chars().map(cell).take(width).collect();
    cells.resize(width, 0);
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letters() {
        assert_eq!(text_cells("abc", 3), vec![0x01, 0x03, 0x09]);
        assert_eq!(text_cells("w", 1), vec![0x3A]);
        assert_eq!(text_cells("z", 1), vec![0x35]);
    }

    #[test]
    fn test_uppercase_adds_dot_7() {
        assert_eq!(text_cells("Hi", 2), vec![0x13 | 0x40, 0x0A]);
    }

    #[test]
    fn test_pads_and_truncates() {
        assert_eq!(text_cells("a", 4), vec![0x01, 0, 0, 0]);
        assert_eq!(text_cells("hello", 2), vec![0x13, 0x11]);
        assert!(text_cells("", 0).is_empty());
    }

    #[test]
    fn test_other_characters() {
        assert_eq!(text_cells("a 1!", 4), vec![0x01, 0, 0xC0, 0xC0]);
    }
}
