use crate::glyphs::SPARK_LEVELS;

/// Renders the most recent `width` samples as a density strip, right-aligned
/// so the last glyph is always "now".
pub fn render(history: &[f64], width: usize) -> String {
    if history.is_empty() || width == 0 {
        return String::new();
    }
    let max = history.iter().copied().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return " ".repeat(width);
    }

    let n = history.len().min(width);
    let mut out = String::with_capacity(width);
    for _ in n..width {
        out.push(' ');
    }
    for &v in &history[history.len() - n..] {
        if !(v > 0.0) {
            out.push(' ');
            continue;
        }
        let idx = ((v / max) * 9.0).floor().clamp(0.0, 9.0) as usize;
        out.push(SPARK_LEVELS[idx]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_draw() {
        assert_eq!(render(&[], 30), "");
        assert_eq!(render(&[1.0, 2.0], 0), "");
    }

    #[test]
    fn all_zero_is_blank() {
        assert_eq!(render(&[0.0; 7], 12), " ".repeat(12));
        assert_eq!(render(&[0.0; 250], 30), " ".repeat(30));
    }

    #[test]
    fn single_peak_uses_densest_glyph() {
        let out = render(&[0.0, 0.0, 10.0, 0.0], 4);
        assert_eq!(out, "  @ ");
    }

    #[test]
    fn short_history_is_right_aligned() {
        let out = render(&[5.0, 10.0], 6);
        assert_eq!(out.chars().count(), 6);
        assert_eq!(out, "    =@");
    }

    #[test]
    fn long_history_keeps_latest_samples() {
        let history: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let out = render(&history, 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with('@'));
        // 91/100 * 9 = 8.19
        assert!(out.starts_with('%'));
    }
}
