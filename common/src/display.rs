//! What the 4-digit display shows, derived purely from session state.

use serde::Serialize;

use crate::types::OperationStatus;

pub const STOPPED_TEXT: &str = "--:--";
pub const FREE_TEXT: &str = "FREE";
pub const AWAITING_TEXT: &str = "----";
pub const BLANK_TEXT: &str = "    ";

/// Longest span the display can show.
const MAX_DISPLAY_SECONDS: u32 = 99 * 60 + 59;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayFrame {
    pub text: String,
    /// Colon segment lit, i.e. the text is a time.
    pub colon: bool,
}

impl DisplayFrame {
    fn fixed(text: &str) -> Self {
        Self {
            text: text.to_string(),
            colon: false,
        }
    }

    fn time(seconds: u32) -> Self {
        Self {
            text: format_mmss(seconds),
            colon: true,
        }
    }
}

pub fn format_mmss(seconds: u32) -> String {
    let seconds = seconds.min(MAX_DISPLAY_SECONDS);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

pub fn render(
    status: OperationStatus,
    remaining_seconds: u32,
    extra_seconds: u32,
    counting_down: bool,
    blink_on: bool,
) -> DisplayFrame {
    let shown = if counting_down {
        remaining_seconds
    } else {
        extra_seconds
    };

    match status {
        OperationStatus::Stopped => DisplayFrame::fixed(STOPPED_TEXT),
        OperationStatus::LiberatedFree => DisplayFrame::fixed(FREE_TEXT),
        OperationStatus::Paused if blink_on => DisplayFrame::time(shown),
        OperationStatus::Paused => DisplayFrame::fixed(BLANK_TEXT),
        OperationStatus::Active | OperationStatus::LiberatedWithTime => {
            if counting_down && remaining_seconds == 0 {
                DisplayFrame::fixed(AWAITING_TEXT)
            } else {
                DisplayFrame::time(shown)
            }
        }
    }
}
