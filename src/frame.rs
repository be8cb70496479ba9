use crate::bar;
use crate::config::{RenderConfig, VERSION};
use crate::engine::StatusSnapshot;
use crate::humanize::{format_eta, human_rate, human_size};
use crate::sparkline;
use crossterm::style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor};
use std::fmt::Write;

pub const SPARKLINE_WIDTH: usize = 30;

const GREEN: Tone = Tone::Fg(Color::DarkGreen);
const YELLOW: Tone = Tone::Fg(Color::DarkYellow);
const BLUE: Tone = Tone::Fg(Color::DarkBlue);
const MAGENTA: Tone = Tone::Fg(Color::DarkMagenta);
const CYAN: Tone = Tone::Fg(Color::DarkCyan);
const WHITE: Tone = Tone::Fg(Color::Grey);
const BOLD: Tone = Tone::Attr(Attribute::Bold);
const DIM: Tone = Tone::Attr(Attribute::Dim);

#[derive(Debug, Clone, Copy)]
enum Tone {
    Fg(Color),
    Attr(Attribute),
}

/// Styling commands, or nothing when color is off.
#[derive(Debug, Clone, Copy)]
struct Palette {
    enabled: bool,
}

impl Palette {
    fn start(self, out: &mut String, tone: Tone) {
        if !self.enabled {
            return;
        }
        // Writing into a String cannot fail.
        let _ = match tone {
            Tone::Fg(color) => write!(out, "{}", SetForegroundColor(color)),
            Tone::Attr(attr) => write!(out, "{}", SetAttribute(attr)),
        };
    }

    fn reset(self, out: &mut String) {
        if self.enabled {
            let _ = write!(out, "{}", ResetColor);
        }
    }

    fn paint(self, out: &mut String, tone: Tone, text: &str) {
        self.start(out, tone);
        out.push_str(text);
        self.reset(out);
    }
}

pub struct FrameBuilder<'a> {
    config: &'a RenderConfig,
    palette: Palette,
}

impl<'a> FrameBuilder<'a> {
    pub fn new(config: &'a RenderConfig) -> Self {
        FrameBuilder {
            config,
            palette: Palette {
                enabled: config.color,
            },
        }
    }

    fn separator(&self) -> String {
        let width = self
            .config
            .bar_width
            .clamp(bar::MIN_BAR_WIDTH, bar::MAX_BAR_WIDTH);
        "=".repeat((width + 18).max(60))
    }

    fn limit(&self, bytes_per_sec: u64) -> String {
        if bytes_per_sec == 0 {
            "unlimited".to_string()
        } else {
            human_rate(bytes_per_sec as f64)
        }
    }

    /// One full dashboard frame, every line newline-terminated.
    pub fn build(&self, status: &StatusSnapshot, history: &[f64], tick: usize) -> String {
        let cfg = self.config;
        let p = self.palette;
        let sep = self.separator();
        let percent = status.percent();
        let mut out = String::with_capacity(1024);

        p.start(&mut out, BOLD);
        p.paint(
            &mut out,
            GREEN,
            &format!("{} TorFrog", cfg.glyphs.spinner_frame(tick)),
        );
        out.push(' ');
        out.push_str(VERSION);
        out.push('\n');

        p.paint(&mut out, DIM, &format!("Save: {}", cfg.save_path));
        out.push('\n');

        p.paint(&mut out, GREEN, &sep);
        out.push('\n');

        p.paint(&mut out, YELLOW, &format!("Progress: {:.1}% ", percent));
        p.paint(&mut out, WHITE, &bar::render(percent, cfg.bar_width, cfg.glyphs));
        out.push_str("  ");
        p.paint(&mut out, WHITE, &format_eta(status.eta_seconds()));
        out.push('\n');

        p.paint(
            &mut out,
            GREEN,
            &format!("DL: {}", human_rate(status.download_rate)),
        );
        out.push_str("    ");
        p.paint(
            &mut out,
            MAGENTA,
            &format!("UP: {}", human_rate(status.upload_rate)),
        );
        out.push_str("    ");
        p.paint(&mut out, CYAN, &format!("Peers: {}", status.num_peers));
        out.push('\n');

        p.paint(
            &mut out,
            DIM,
            &format!("DL trend: {}", sparkline::render(history, SPARKLINE_WIDTH)),
        );
        out.push('\n');

        p.paint(
            &mut out,
            BLUE,
            &format!("Done: {}", human_size(status.total_done)),
        );
        out.push_str(" / ");
        p.paint(&mut out, BLUE, &human_size(status.total_wanted));
        out.push('\n');

        p.paint(
            &mut out,
            WHITE,
            &format!("Seq: {}", if cfg.sequential { "ON" } else { "OFF" }),
        );
        out.push_str(&format!(
            "    Limits: DL {}, UP {}",
            self.limit(cfg.download_limit),
            self.limit(cfg.upload_limit)
        ));
        out.push('\n');

        p.paint(&mut out, CYAN, &sep);
        out.push('\n');

        p.paint(&mut out, DIM, &format!("Name: {}", status.name));
        out.push('\n');

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glyphs::GlyphProfile;

    fn plain_ascii() -> RenderConfig {
        RenderConfig {
            color: false,
            glyphs: GlyphProfile::Ascii,
            ..RenderConfig::default()
        }
    }

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            progress_ppm: 375_000,
            download_rate: 1_572_864.0,
            upload_rate: 2048.0,
            total_done: 300 * 1024 * 1024,
            total_wanted: 800 * 1024 * 1024,
            num_peers: 12,
            name: "debian-12.iso".to_string(),
        }
    }

    #[test]
    fn progress_and_rate_lines() {
        let cfg = plain_ascii();
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[1_572_864.0], 0);
        let lines: Vec<&str> = frame.lines().collect();
        assert_eq!(lines.len(), 10);

        assert!(lines[3].starts_with("Progress: 37.5% ["));
        assert_eq!(lines[3].matches('#').count(), 18);
        assert!(lines[3].ends_with("ETA 5m 33s"));

        assert_eq!(lines[4], "DL: 1.5 MB/s    UP: 2.0 KB/s    Peers: 12");
        assert_eq!(lines[6], "Done: 300.0 MB / 800.0 MB");
        assert_eq!(lines[7], "Seq: ON    Limits: DL unlimited, UP unlimited");
        assert_eq!(lines[9], "Name: debian-12.iso");
    }

    #[test]
    fn layout_order_and_separators() {
        let cfg = plain_ascii();
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[], 1);
        let lines: Vec<&str> = frame.lines().collect();
        assert_eq!(lines[0], format!("\\ TorFrog {}", VERSION));
        assert_eq!(lines[1], "Save: ./downloads");
        assert_eq!(lines[2], "=".repeat(66));
        assert_eq!(lines[8], lines[2]);
        assert_eq!(lines[5], "DL trend: ");
    }

    #[test]
    fn no_escape_codes_without_color() {
        let cfg = plain_ascii();
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[10.0, 20.0], 3);
        assert!(!frame.contains('\x1b'));
        assert!(frame.is_ascii());
    }

    #[test]
    fn color_wraps_segments() {
        let cfg = RenderConfig::default();
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[], 0);
        let title = format!(
            "{}{}⠋ TorFrog{}",
            SetAttribute(Attribute::Bold),
            SetForegroundColor(Color::DarkGreen),
            ResetColor
        );
        assert!(frame.starts_with(&title));
        let progress = format!(
            "{}Progress: 37.5% {}",
            SetForegroundColor(Color::DarkYellow),
            ResetColor
        );
        assert!(frame.contains(&progress));
        assert!(frame.contains('\x1b'));
    }

    #[test]
    fn limits_are_humanized() {
        let cfg = RenderConfig {
            sequential: false,
            download_limit: 512 * 1024,
            upload_limit: 0,
            ..plain_ascii()
        };
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[], 0);
        assert!(frame.contains("Seq: OFF    Limits: DL 512.0 KB/s, UP unlimited\n"));
    }

    #[test]
    fn huge_bar_width_is_capped() {
        let cfg = RenderConfig {
            bar_width: usize::MAX,
            ..plain_ascii()
        };
        let frame = FrameBuilder::new(&cfg).build(&snapshot(), &[], 0);
        let lines: Vec<&str> = frame.lines().collect();
        assert_eq!(lines[2].len(), bar::MAX_BAR_WIDTH + 18);
        assert!(lines[3].len() < 600);
    }

    #[test]
    fn same_inputs_same_frame() {
        let cfg = RenderConfig::default();
        let history = [0.0, 100.0, 250.0, 50.0];
        let builder = FrameBuilder::new(&cfg);
        let a = builder.build(&snapshot(), &history, 7);
        let b = builder.build(&snapshot(), &history, 7);
        assert_eq!(a, b);
    }
}
