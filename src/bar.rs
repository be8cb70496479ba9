use crate::glyphs::GlyphProfile;

pub const MIN_BAR_WIDTH: usize = 10;
pub const DEFAULT_BAR_WIDTH: usize = 48;
pub const MAX_BAR_WIDTH: usize = 500;

/// Bracketed progress bar with `width` inner cells.
///
/// Rich glyphs get a quarter-resolution partial cell; ASCII rounds to the
/// nearest whole cell.
pub fn render(percent: f64, width: usize, glyphs: GlyphProfile) -> String {
    let percent = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let width = width.clamp(MIN_BAR_WIDTH, MAX_BAR_WIDTH);
    let cells = percent / 100.0 * width as f64;

    let mut bar = String::with_capacity(width * 3 + 2);
    bar.push('[');

    let mut filled = match glyphs.bar_partials() {
        Some(partials) => {
            let mut full = (cells.floor() as usize).min(width);
            let frac = cells - full as f64;
            bar.push_str(&glyphs.bar_fill().repeat(full));
            if full < width {
                let idx = ((frac * 4.0 + 0.5) as usize).min(3);
                if idx > 0 {
                    bar.push_str(partials[idx]);
                    full += 1;
                }
            }
            full
        }
        None => {
            let full = ((cells + 0.5) as usize).min(width);
            bar.push_str(&glyphs.bar_fill().repeat(full));
            full
        }
    };

    while filled < width {
        bar.push(' ');
        filled += 1;
    }
    bar.push(']');
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(bar: &str, glyph: &str) -> usize {
        bar.matches(glyph).count()
    }

    #[test]
    fn empty_and_full() {
        for &g in &[GlyphProfile::Rich, GlyphProfile::Ascii] {
            let empty = render(0.0, 48, g);
            assert_eq!(count(&empty, g.bar_fill()), 0);
            assert_eq!(empty, format!("[{}]", " ".repeat(48)));

            let full = render(100.0, 48, g);
            assert_eq!(count(&full, g.bar_fill()), 48);
            assert!(!full.contains(' '));
        }
    }

    #[test]
    fn ascii_rounds_to_whole_cells() {
        assert_eq!(render(50.0, 10, GlyphProfile::Ascii), "[#####     ]");
        assert_eq!(count(&render(37.5, 48, GlyphProfile::Ascii), "#"), 18);
        // 0.96 cells rounds up
        assert_eq!(count(&render(9.6, 10, GlyphProfile::Ascii), "#"), 1);
    }

    #[test]
    fn rich_draws_partial_cell() {
        // 2.5 cells: two full blocks plus a half block
        let bar = render(25.0, 10, GlyphProfile::Rich);
        assert_eq!(bar, "[██▒       ]");
        assert_eq!(bar.chars().count(), 12);
    }

    #[test]
    fn rich_caps_partial_at_dark_shade() {
        // 0.99 cells would round to 4 quarters; capped at the 3rd glyph
        let bar = render(9.9, 10, GlyphProfile::Rich);
        assert!(bar.starts_with("[▓"));
    }

    #[test]
    fn percent_is_clamped_and_width_floored() {
        assert_eq!(render(-20.0, 10, GlyphProfile::Ascii), "[          ]");
        assert_eq!(render(250.0, 4, GlyphProfile::Ascii), format!("[{}]", "#".repeat(10)));
        assert_eq!(render(f64::NAN, 10, GlyphProfile::Ascii), "[          ]");
    }

    #[test]
    fn huge_width_is_capped() {
        let bar = render(100.0, usize::MAX, GlyphProfile::Rich);
        assert_eq!(bar.chars().count(), MAX_BAR_WIDTH + 2);
    }
}
