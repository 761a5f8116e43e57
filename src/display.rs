//! Boot progress display.
//!
//! The engine reports step progress through this collaborator; no boot
//! decision depends on it. The terminal implementation paints an item
//! grid at a fixed origin with a styled state column, ANSI-style.

use std::io::{self, Write};
use tracing::{error, info};

/// Style of an item state or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStyle {
    /// Default rendering
    Plain,
    /// Success (green)
    Good,
    /// Transient problem (yellow)
    Warn,
    /// Failure (red)
    Severe,
}

impl ItemStyle {
    fn code(self) -> &'static str {
        match self {
            ItemStyle::Plain => "\x1b[0m",
            ItemStyle::Good => "\x1b[0;32m",
            ItemStyle::Warn => "\x1b[0;33m",
            ItemStyle::Severe => "\x1b[0;31;1m",
        }
    }
}

/// Progress display collaborator.
pub trait BootDisplay: Send {
    /// Prepare the display surface.
    fn init(&mut self);

    /// Register the next progress item.
    fn add_item(&mut self, name: &str);

    /// Update the state column of a registered item.
    fn set_item_state(&mut self, name: &str, style: ItemStyle, text: &str);

    /// Drop all registered items.
    fn clear_items(&mut self);

    /// Move the item grid origin.
    fn set_items_location(&mut self, row: u16, col: u16);

    /// Print the rescue message and leave the terminal interactive.
    fn bailout(&mut self, msg: &str);
}

/// Column offset of the state field relative to the item origin.
const STATE_COLUMN: u16 = 32;

/// Row of the bailout message.
const BAILOUT_ROW: u16 = 2;

/// ANSI terminal implementation of the boot display.
pub struct TermDisplay {
    items: Vec<String>,
    row: u16,
    col: u16,
}

impl TermDisplay {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            row: 10,
            col: 4,
        }
    }

    fn write(&self, text: &str) {
        let mut out = io::stdout();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn set_cursor(&self, row: u16, col: u16) {
        self.write(&format!("\x1b[{};{}H", row, col));
    }
}

impl Default for TermDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl BootDisplay for TermDisplay {
    fn init(&mut self) {
        self.clear_items();
        // hide cursor, clear screen, banner on the first row
        self.write("\x1b[?25l\x1b[2J");
        self.set_cursor(1, 1);
        self.write("\x1b[0;47;30m  ignite  \x1b[0m");
    }

    fn add_item(&mut self, name: &str) {
        let row = self.row + self.items.len() as u16;
        self.items.push(name.to_string());
        self.set_cursor(row, self.col);
        self.write(&format!("\x1b[0m{}", name));
    }

    fn set_item_state(&mut self, name: &str, style: ItemStyle, text: &str) {
        let Some(index) = self.items.iter().position(|item| item == name) else {
            return;
        };
        let row = self.row + index as u16;
        self.set_cursor(row, self.col + STATE_COLUMN);
        // pad over the previous state text
        self.write(&format!("{}{:<10}\x1b[0m", style.code(), text));
        info!(step = name, state = text, "Boot step state");
    }

    fn clear_items(&mut self) {
        self.items.clear();
    }

    fn set_items_location(&mut self, row: u16, col: u16) {
        self.row = row;
        self.col = col;
    }

    fn bailout(&mut self, msg: &str) {
        self.set_cursor(BAILOUT_ROW, 1);
        self.write(&format!(
            "{}{}\x1b[0m\x1b[?25h\n",
            ItemStyle::Severe.code(),
            msg
        ));
        error!(message = msg, "Boot bailout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_registration_order() {
        let mut display = TermDisplay::new();
        display.set_items_location(5, 2);
        display.add_item("mount procfs");
        display.add_item("start execd");
        assert_eq!(display.items, vec!["mount procfs", "start execd"]);
        display.clear_items();
        assert!(display.items.is_empty());
    }

    #[test]
    fn test_unknown_item_is_ignored() {
        let mut display = TermDisplay::new();
        // must not panic on an unregistered name
        display.set_item_state("ghost", ItemStyle::Good, "ok");
    }
}
