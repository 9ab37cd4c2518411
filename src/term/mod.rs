//! Headless terminal screen model per session.
//!
//! Consumes the PTY output byte stream through a `vt100` parser and exposes
//! immutable [`Snapshot`]s of the visible grid for the buffer endpoints and
//! the WebSocket hub. Snapshot construction happens under the same lock as
//! `feed`, so a snapshot is always consistent with a prefix of the output
//! stream.
//!
//! Subscribers wait on the engine's [`Notify`] and coalesce: however many
//! feeds happen between two polls, a subscriber takes at most one snapshot
//! per wakeup (the hub additionally caps fan-out at one frame per 16 ms).

pub mod encode;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Attribute bits in a [`Cell`] (and in the binary cell encoding).
pub const ATTR_BOLD: u8 = 0x01;
pub const ATTR_DIM: u8 = 0x02;
pub const ATTR_ITALIC: u8 = 0x04;
pub const ATTR_UNDERLINE: u8 = 0x08;
pub const ATTR_INVERSE: u8 = 0x10;
pub const ATTR_STRIKE: u8 = 0x20;

/// One rendered cell. A `width` of 2 means the glyph covers this column and
/// the next; no cell is emitted for the covered column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub glyph: char,
    pub width: u8,
    /// ARGB, alpha always 0xFF. `None` means the default color.
    pub fg: Option<u32>,
    pub bg: Option<u32>,
    pub attrs: u8,
}

impl Cell {
    fn is_blank(&self) -> bool {
        (self.glyph == ' ' || self.glyph == '\0')
            && self.width == 1
            && self.fg.is_none()
            && self.bg.is_none()
            && self.attrs == 0
    }
}

/// One row of the grid; empty rows compress to a marker byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Empty,
    Content(Vec<Cell>),
}

/// Immutable point-in-time view of the terminal grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub cols: u32,
    pub rows: u32,
    pub viewport_y: i32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub grid: Vec<Row>,
}

/// Per-session terminal engine. Shared between the PTY bridge (feeder) and
/// the HTTP/WS consumers; the mutex is held only for short, non-blocking
/// sections.
pub struct TerminalEngine {
    parser: Mutex<vt100::Parser>,
    notify: Arc<Notify>,
    generation: AtomicU64,
    last_update_ms: AtomicU64,
}

impl TerminalEngine {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: Mutex::new(vt100::Parser::new(rows, cols, 0)),
            notify: Arc::new(Notify::new()),
            generation: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
        }
    }

    /// Feed PTY output bytes and wake subscribers.
    pub fn feed(&self, bytes: &[u8]) {
        {
            let mut parser = self.parser.lock().expect("terminal engine poisoned");
            parser.process(bytes);
        }
        self.generation.fetch_add(1, Ordering::Release);
        self.last_update_ms
            .store(crate::util::now_ms(), Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Unix-ms timestamp of the last output feed (0 if none yet).
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Acquire)
    }

    /// Resize the grid, clamping the cursor to the new bounds.
    pub fn resize(&self, cols: u16, rows: u16) {
        {
            let mut parser = self.parser.lock().expect("terminal engine poisoned");
            parser.screen_mut().set_size(rows, cols);
        }
        self.generation.fetch_add(1, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Notifier for update wakeups.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Monotonic feed counter; lets pollers skip redundant snapshots.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Plain-text contents of the visible grid.
    pub fn text(&self) -> String {
        let parser = self.parser.lock().expect("terminal engine poisoned");
        parser.screen().contents()
    }

    /// Contents with SGR styling escape sequences preserved.
    pub fn text_styled(&self) -> String {
        let parser = self.parser.lock().expect("terminal engine poisoned");
        String::from_utf8_lossy(&parser.screen().contents_formatted()).into_owned()
    }

    /// Take an immutable snapshot, atomic relative to `feed`/`resize`.
    pub fn snapshot(&self) -> Snapshot {
        let parser = self.parser.lock().expect("terminal engine poisoned");
        let screen = parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_row, cursor_col) = screen.cursor_position();

        let mut grid = Vec::with_capacity(usize::from(rows));
        for row in 0..rows {
            let mut cells: Vec<Cell> = Vec::with_capacity(usize::from(cols));
            let mut all_blank = true;
            let mut col = 0;
            while col < cols {
                let Some(cell) = screen.cell(row, col) else {
                    break;
                };
                if cell.is_wide_continuation() {
                    col += 1;
                    continue;
                }
                let converted = convert_cell(cell);
                if !converted.is_blank() {
                    all_blank = false;
                }
                col += u16::from(converted.width);
                cells.push(converted);
            }
            grid.push(if all_blank {
                Row::Empty
            } else {
                Row::Content(cells)
            });
        }

        Snapshot {
            cols: u32::from(cols),
            rows: u32::from(rows),
            viewport_y: 0,
            cursor_x: i32::from(cursor_col),
            cursor_y: i32::from(cursor_row),
            grid,
        }
    }
}

fn convert_cell(cell: &vt100::Cell) -> Cell {
    let contents = cell.contents();
    let glyph = contents.chars().next().unwrap_or(' ');
    let width = if cell.is_wide() { 2 } else { 1 };

    let mut attrs = 0u8;
    if cell.bold() {
        attrs |= ATTR_BOLD;
    }
    if cell.italic() {
        attrs |= ATTR_ITALIC;
    }
    if cell.underline() {
        attrs |= ATTR_UNDERLINE;
    }
    if cell.inverse() {
        attrs |= ATTR_INVERSE;
    }

    Cell {
        glyph,
        width,
        fg: color_to_argb(cell.fgcolor()),
        bg: color_to_argb(cell.bgcolor()),
        attrs,
    }
}

/// Convert a vt100 color to ARGB (alpha 0xFF); `Default` maps to `None`.
fn color_to_argb(color: vt100::Color) -> Option<u32> {
    match color {
        vt100::Color::Default => None,
        vt100::Color::Idx(i) => {
            let (r, g, b) = indexed_to_rgb(i);
            Some(argb(r, g, b))
        }
        vt100::Color::Rgb(r, g, b) => Some(argb(r, g, b)),
    }
}

fn argb(r: u8, g: u8, b: u8) -> u32 {
    0xFF00_0000 | (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// xterm 256-color palette: 16 base colors, a 6×6×6 cube, and a 24-step
/// grayscale ramp.
fn indexed_to_rgb(i: u8) -> (u8, u8, u8) {
    const BASE: [(u8, u8, u8); 16] = [
        (0x00, 0x00, 0x00),
        (0x80, 0x00, 0x00),
        (0x00, 0x80, 0x00),
        (0x80, 0x80, 0x00),
        (0x00, 0x00, 0x80),
        (0x80, 0x00, 0x80),
        (0x00, 0x80, 0x80),
        (0xc0, 0xc0, 0xc0),
        (0x80, 0x80, 0x80),
        (0xff, 0x00, 0x00),
        (0x00, 0xff, 0x00),
        (0xff, 0xff, 0x00),
        (0x00, 0x00, 0xff),
        (0xff, 0x00, 0xff),
        (0x00, 0xff, 0xff),
        (0xff, 0xff, 0xff),
    ];
    const CUBE: [u8; 6] = [0x00, 0x5f, 0x87, 0xaf, 0xd7, 0xff];

    if i < 16 {
        BASE[usize::from(i)]
    } else if i < 232 {
        let i = i - 16;
        (
            CUBE[usize::from(i / 36)],
            CUBE[usize::from((i / 6) % 6)],
            CUBE[usize::from(i % 6)],
        )
    } else {
        let v = 8 + 10 * (i - 232);
        (v, v, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_and_text() {
        let engine = TerminalEngine::new(20, 5);
        engine.feed(b"hello");
        assert!(engine.text().contains("hello"));
    }

    #[test]
    fn test_snapshot_basic() {
        let engine = TerminalEngine::new(20, 5);
        engine.feed(b"hi");
        let snap = engine.snapshot();
        assert_eq!(snap.cols, 20);
        assert_eq!(snap.rows, 5);
        assert_eq!(snap.cursor_x, 2);
        assert_eq!(snap.cursor_y, 0);
        match &snap.grid[0] {
            Row::Content(cells) => {
                assert_eq!(cells[0].glyph, 'h');
                assert_eq!(cells[1].glyph, 'i');
            }
            Row::Empty => panic!("first row should have content"),
        }
        assert_eq!(snap.grid[1], Row::Empty);
    }

    #[test]
    fn test_cursor_positioning() {
        let engine = TerminalEngine::new(20, 5);
        // CUP to row 3, col 5 (1-based in the escape sequence)
        engine.feed(b"\x1b[3;5Hx");
        let snap = engine.snapshot();
        assert_eq!(snap.cursor_y, 2);
        assert_eq!(snap.cursor_x, 5);
        match &snap.grid[2] {
            Row::Content(cells) => assert_eq!(cells[4].glyph, 'x'),
            Row::Empty => panic!("row 2 should have content"),
        }
    }

    #[test]
    fn test_sgr_attributes_and_color() {
        let engine = TerminalEngine::new(20, 5);
        engine.feed(b"\x1b[1;4;31mE\x1b[0m");
        let snap = engine.snapshot();
        let Row::Content(cells) = &snap.grid[0] else {
            panic!("expected content row");
        };
        let cell = &cells[0];
        assert_eq!(cell.glyph, 'E');
        assert!(cell.attrs & ATTR_BOLD != 0);
        assert!(cell.attrs & ATTR_UNDERLINE != 0);
        assert_eq!(cell.fg, Some(argb(0x80, 0x00, 0x00)));
    }

    #[test]
    fn test_truecolor() {
        let engine = TerminalEngine::new(20, 5);
        engine.feed(b"\x1b[38;2;10;20;30mZ");
        let snap = engine.snapshot();
        let Row::Content(cells) = &snap.grid[0] else {
            panic!("expected content row");
        };
        assert_eq!(cells[0].fg, Some(argb(10, 20, 30)));
    }

    #[test]
    fn test_wide_char_covers_two_columns() {
        let engine = TerminalEngine::new(10, 3);
        engine.feed("日a".as_bytes());
        let snap = engine.snapshot();
        let Row::Content(cells) = &snap.grid[0] else {
            panic!("expected content row");
        };
        assert_eq!(cells[0].glyph, '日');
        assert_eq!(cells[0].width, 2);
        // 'a' lands in column 2 but is the second emitted cell
        assert_eq!(cells[1].glyph, 'a');
        assert_eq!(cells[1].width, 1);
    }

    #[test]
    fn test_resize_clamps_cursor() {
        let engine = TerminalEngine::new(80, 24);
        engine.feed(b"\x1b[24;80H");
        engine.resize(40, 10);
        let snap = engine.snapshot();
        assert_eq!(snap.cols, 40);
        assert_eq!(snap.rows, 10);
        assert!(snap.cursor_x < 40);
        assert!(snap.cursor_y < 10);
    }

    #[test]
    fn test_generation_increments() {
        let engine = TerminalEngine::new(10, 3);
        let g0 = engine.generation();
        engine.feed(b"x");
        assert!(engine.generation() > g0);
    }

    #[test]
    fn test_indexed_palette() {
        assert_eq!(indexed_to_rgb(0), (0, 0, 0));
        assert_eq!(indexed_to_rgb(15), (0xff, 0xff, 0xff));
        assert_eq!(indexed_to_rgb(16), (0, 0, 0));
        assert_eq!(indexed_to_rgb(231), (0xff, 0xff, 0xff));
        assert_eq!(indexed_to_rgb(232), (8, 8, 8));
        assert_eq!(indexed_to_rgb(255), (238, 238, 238));
    }

    #[test]
    fn test_erase_display() {
        let engine = TerminalEngine::new(20, 5);
        engine.feed(b"junk\x1b[2J");
        let snap = engine.snapshot();
        assert!(snap.grid.iter().all(|r| *r == Row::Empty));
    }
}
