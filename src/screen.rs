use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::queue;
use crossterm::terminal::{Clear, ClearType};
use std::io::{self, Write};

/// Terminal sink. Full-screen mode redraws in place; stream mode appends one
/// block per frame, which is what pipes and dumb terminals want.
pub struct Screen<W: Write> {
    out: W,
    full_screen: bool,
    cursor_hidden: bool,
}

impl<W: Write> Screen<W> {
    pub fn new(out: W, full_screen: bool) -> Self {
        Screen {
            out,
            full_screen,
            cursor_hidden: false,
        }
    }

    pub fn begin(&mut self) -> io::Result<()> {
        if self.full_screen {
            queue!(self.out, Clear(ClearType::All), MoveTo(0, 0), Hide)?;
            self.cursor_hidden = true;
            self.out.flush()?;
        }
        Ok(())
    }

    /// Writes a whole frame with a single `write_all`.
    pub fn present(&mut self, frame: &str) -> io::Result<()> {
        let mut buf: Vec<u8> = Vec::with_capacity(frame.len() + 64);
        if self.full_screen {
            queue!(buf, MoveTo(0, 0))?;
            for line in frame.lines() {
                buf.extend_from_slice(line.as_bytes());
                queue!(buf, Clear(ClearType::UntilNewLine))?;
                buf.push(b'\n');
            }
            queue!(buf, Clear(ClearType::FromCursorDown))?;
        } else {
            buf.extend_from_slice(frame.as_bytes());
            buf.push(b'\n');
        }
        self.out.write_all(&buf)?;
        self.out.flush()
    }

    /// Shows the cursor again if `begin` hid it.
    pub fn restore(&mut self) -> io::Result<()> {
        if self.cursor_hidden {
            queue!(self.out, Show)?;
            self.cursor_hidden = false;
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn finish(&mut self, message: &str) -> io::Result<()> {
        self.restore()?;
        writeln!(self.out, "{}", message)?;
        self.out.flush()
    }
}

impl<W: Write> Drop for Screen<W> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::warn!("Failed to restore the terminal: {}", e);
        }
    }
}
