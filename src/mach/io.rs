/*!
## Console port

All console traffic goes through this trait so the interpreter can be
driven by a terminal, a test harness, or an embedding host.

*/

use std::io::{BufRead, Write};

/// Print zones are 14 columns wide.
pub const ZONE_WIDTH: usize = 14;

pub trait Console {
    /// Writes text and keeps the column counter honest: `\n` resets it,
    /// `\t` snaps to the next print zone.
    fn print(&mut self, text: &str);

    /// Emits the prompt and reads one line, newline stripped.
    fn input(&mut self, prompt: &str) -> String;

    /// Non-blocking key poll for `INKEY$`.
    fn inkey(&mut self) -> Option<u8>;

    fn column(&self) -> usize;
    fn set_column(&mut self, column: usize);
    fn width(&self) -> usize;
    fn set_width(&mut self, width: usize);

    fn clear_screen(&mut self) {
        self.print("\x1b[2J\x1b[H");
    }
}

/// Tracks the column advance a chunk of text causes.
pub fn advance_column(column: usize, text: &str) -> usize {
    let mut column = column;
    for c in text.chars() {
        match c {
            '\n' => column = 0,
            '\r' => column = 0,
            '\t' => column = (column / ZONE_WIDTH + 1) * ZONE_WIDTH,
            _ => column += 1,
        }
    }
    column
}

/// Standard terminal console over stdin/stdout.
pub struct StdConsole {
    column: usize,
    width: usize,
}

impl StdConsole {
    pub fn new() -> StdConsole {
        StdConsole {
            column: 0,
            width: 80,
        }
    }
}

impl Default for StdConsole {
    fn default() -> StdConsole {
        StdConsole::new()
    }
}

impl Console for StdConsole {
    fn print(&mut self, text: &str) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(text.as_bytes());
        let _ = lock.flush();
        self.column = advance_column(self.column, text);
    }

    fn input(&mut self, prompt: &str) -> String {
        self.print(prompt);
        let mut line = String::new();
        let stdin = std::io::stdin();
        let _ = stdin.lock().read_line(&mut line);
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        self.column = 0;
        line
    }

    fn inkey(&mut self) -> Option<u8> {
        // Raw keyboard polling belongs to the embedding terminal.
        None
    }

    fn column(&self) -> usize {
        self.column
    }

    fn set_column(&mut self, column: usize) {
        self.column = column;
    }

    fn width(&self) -> usize {
        self.width
    }

    fn set_width(&mut self, width: usize) {
        self.width = width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_column() {
        assert_eq!(advance_column(0, "hello"), 5);
        assert_eq!(advance_column(5, "a\n"), 0);
        assert_eq!(advance_column(3, "\t"), 14);
        assert_eq!(advance_column(14, "\t"), 28);
    }
}
