/// Which glyph set the terminal can be trusted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlyphProfile {
    /// Braille spinner and block-element progress bar.
    Rich,
    /// Plain 7-bit characters only.
    Ascii,
}

const RICH_SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const ASCII_SPINNER: [&str; 4] = ["-", "\\", "|", "/"];

const RICH_PARTIALS: [&str; 4] = ["", "░", "▒", "▓"];

/// Ten density levels, lightest first. ASCII in every profile so the trend
/// line never turns into tofu.
pub const SPARK_LEVELS: [char; 10] = [' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

impl GlyphProfile {
    pub fn from_ascii_flag(ascii: bool) -> Self {
        if ascii {
            GlyphProfile::Ascii
        } else {
            GlyphProfile::Rich
        }
    }

    pub fn spinner(self) -> &'static [&'static str] {
        match self {
            GlyphProfile::Rich => &RICH_SPINNER,
            GlyphProfile::Ascii => &ASCII_SPINNER,
        }
    }

    pub fn spinner_frame(self, tick: usize) -> &'static str {
        let frames = self.spinner();
        frames[tick % frames.len()]
    }

    pub fn bar_fill(self) -> &'static str {
        match self {
            GlyphProfile::Rich => "█",
            GlyphProfile::Ascii => "#",
        }
    }

    /// Sub-cell glyphs indexed by quarter, or `None` when only whole cells
    /// can be drawn.
    pub fn bar_partials(self) -> Option<&'static [&'static str; 4]> {
        match self {
            GlyphProfile::Rich => Some(&RICH_PARTIALS),
            GlyphProfile::Ascii => None,
        }
    }
}
