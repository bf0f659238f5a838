//! Line-level G-code helpers used by the G-code job variant.

use serde::{Deserialize, Serialize};

/// Per-axis offsets added to absolute X/Y/Z coordinates of move commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisOffsets {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl AxisOffsets {
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    fn for_axis(&self, axis: char) -> Option<f64> {
        match axis {
            'X' => Some(self.x),
            'Y' => Some(self.y),
            'Z' => Some(self.z),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositioningMode {
    Absolute,
    Relative,
}

/// Drop everything from the first `;` on.
pub fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Command word of a line, e.g. `('G', 1)` for `G01 X10`.
pub fn command_word(line: &str) -> Option<(char, u32)> {
    let token = line.split_whitespace().next()?;
    let mut chars = token.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let number = chars.as_str().parse::<u32>().ok()?;
    Some((letter, number))
}

/// `G90`/`G91` switch the positioning mode of subsequent moves.
pub fn positioning_mode_change(line: &str) -> Option<PositioningMode> {
    match command_word(line)? {
        ('G', 90) => Some(PositioningMode::Absolute),
        ('G', 91) => Some(PositioningMode::Relative),
        _ => None,
    }
}

pub fn is_move(line: &str) -> bool {
    matches!(command_word(line), Some(('G', 0..=3)))
}

/// Add `offsets` to the X/Y/Z words of a line. Words that do not parse as
/// numbers are left alone.
pub fn apply_offsets(line: &str, offsets: &AxisOffsets) -> String {
    let tokens: Vec<String> = line
        .split_whitespace()
        .enumerate()
        .map(|(i, token)| {
            if i == 0 {
                return token.to_string();
            }
            let mut chars = token.chars();
            let axis = match chars.next() {
                Some(c) => c.to_ascii_uppercase(),
                None => return token.to_string(),
            };
            match (offsets.for_axis(axis), chars.as_str().parse::<f64>()) {
                (Some(offset), Ok(value)) if offset != 0.0 => {
                    format!("{}{}", axis, format_coordinate(value + offset))
                }
                _ => token.to_string(),
            }
        })
        .collect();
    tokens.join(" ")
}

fn format_coordinate(value: f64) -> String {
    let formatted = format!("{:.5}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
