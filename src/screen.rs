use std::io::{self, Stdout, Write};

use crossterm::{cursor, execute, queue, style, terminal};

/// Full-screen line writer: every update erases the terminal and rewrites it
/// from the top. Takes over the screen on construction and hands it back on
/// drop.
pub struct Screen {
    out: Stdout,
}

impl Screen {
    pub fn new() -> io::Result<Screen> {
        let mut out = io::stdout();
        execute!(out, terminal::EnterAlternateScreen, cursor::Hide)?;
        Ok(Screen { out })
    }

    pub fn put_lines<'a, I>(&mut self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        queue!(
            self.out,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        for (row, line) in lines.into_iter().enumerate() {
            queue!(self.out, cursor::MoveTo(0, row as u16), style::Print(line))?;
        }
        self.out.flush()
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = execute!(self.out, cursor::Show, terminal::LeaveAlternateScreen);
    }
}
