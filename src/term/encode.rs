//! Binary encoding of terminal buffer snapshots.
//!
//! Payload layout (all multi-byte integers little-endian):
//!
//! ```text
//! 0x56 0x54        magic "VT"
//! u8               version (0x01)
//! u8               flags (reserved, 0)
//! u32              cols
//! u32              rows
//! i32              cursorX
//! i32              cursorY
//! i32              viewportY
//! rows × row       0xFE = empty row
//!                  0xFD = content row, followed by cell entries covering
//!                         exactly `cols` columns
//! ```
//!
//! Cell entry: a width byte, the glyph's UTF-8 bytes, then optional fields
//! in order. Width byte: bits 0–1 = cell width (1 or 2; a width-2 cell covers
//! the following column, which gets no entry of its own), bit 5 = attrs
//! present, bit 6 = fg present, bit 7 = bg present. fg/bg are ARGB u32,
//! attrs is a u32 bitmask (see the `ATTR_*` constants).

use super::{Cell, Row, Snapshot};

/// Payload magic: "VT".
pub const PAYLOAD_MAGIC: [u8; 2] = [0x56, 0x54];
/// Current payload version.
pub const PAYLOAD_VERSION: u8 = 0x01;

const ROW_EMPTY: u8 = 0xFE;
const ROW_CONTENT: u8 = 0xFD;

const WIDTH_MASK: u8 = 0b0000_0011;
const FLAG_ATTRS: u8 = 0b0010_0000;
const FLAG_FG: u8 = 0b0100_0000;
const FLAG_BG: u8 = 0b1000_0000;

/// Encode a snapshot into the binary payload.
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    // Rough pre-size: header + one byte per row + a few bytes per cell.
    let mut out = Vec::with_capacity(24 + snapshot.grid.len() * (1 + snapshot.cols as usize * 3));
    out.extend_from_slice(&PAYLOAD_MAGIC);
    out.push(PAYLOAD_VERSION);
    out.push(0); // flags
    out.extend_from_slice(&snapshot.cols.to_le_bytes());
    out.extend_from_slice(&snapshot.rows.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_x.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_y.to_le_bytes());
    out.extend_from_slice(&snapshot.viewport_y.to_le_bytes());

    for row in &snapshot.grid {
        match row {
            Row::Empty => out.push(ROW_EMPTY),
            Row::Content(cells) => {
                out.push(ROW_CONTENT);
                for cell in cells {
                    encode_cell(&mut out, cell);
                }
            }
        }
    }
    out
}

fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    let mut width_byte = cell.width & WIDTH_MASK;
    if cell.attrs != 0 {
        width_byte |= FLAG_ATTRS;
    }
    if cell.fg.is_some() {
        width_byte |= FLAG_FG;
    }
    if cell.bg.is_some() {
        width_byte |= FLAG_BG;
    }
    out.push(width_byte);

    let mut buf = [0u8; 4];
    out.extend_from_slice(cell.glyph.encode_utf8(&mut buf).as_bytes());

    if cell.attrs != 0 {
        out.extend_from_slice(&u32::from(cell.attrs).to_le_bytes());
    }
    if let Some(fg) = cell.fg {
        out.extend_from_slice(&fg.to_le_bytes());
    }
    if let Some(bg) = cell.bg {
        out.extend_from_slice(&bg.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::TerminalEngine;

    #[test]
    fn test_payload_header() {
        let engine = TerminalEngine::new(80, 24);
        let payload = encode_snapshot(&engine.snapshot());
        assert_eq!(&payload[0..2], &PAYLOAD_MAGIC);
        assert_eq!(payload[2], PAYLOAD_VERSION);
        assert_eq!(payload[3], 0);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 80);
        assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 24);
    }

    #[test]
    fn test_empty_screen_compresses_to_row_markers() {
        let engine = TerminalEngine::new(80, 24);
        let payload = encode_snapshot(&engine.snapshot());
        // header (24 bytes) + one empty-row marker per row
        assert_eq!(payload.len(), 24 + 24);
        assert!(payload[24..].iter().all(|&b| b == ROW_EMPTY));
    }

    #[test]
    fn test_content_row_encoding() {
        let engine = TerminalEngine::new(4, 2);
        engine.feed(b"ab");
        let payload = encode_snapshot(&engine.snapshot());
        let body = &payload[24..];
        assert_eq!(body[0], ROW_CONTENT);
        // first cell: width 1, no colors/attrs, glyph 'a'
        assert_eq!(body[1], 0b0000_0001);
        assert_eq!(body[2], b'a');
        assert_eq!(body[3], 0b0000_0001);
        assert_eq!(body[4], b'b');
        // remaining two cells are blank spaces
        assert_eq!(body[5], 0b0000_0001);
        assert_eq!(body[6], b' ');
        assert_eq!(body[7], 0b0000_0001);
        assert_eq!(body[8], b' ');
        // second row is empty
        assert_eq!(body[9], ROW_EMPTY);
        assert_eq!(body.len(), 10);
    }

    #[test]
    fn test_colored_cell_carries_fg() {
        let engine = TerminalEngine::new(2, 1);
        engine.feed(b"\x1b[31mx");
        let payload = encode_snapshot(&engine.snapshot());
        let body = &payload[24..];
        assert_eq!(body[0], ROW_CONTENT);
        let width_byte = body[1];
        assert_eq!(width_byte & WIDTH_MASK, 1);
        assert!(width_byte & FLAG_FG != 0);
        assert!(width_byte & FLAG_BG == 0);
        assert_eq!(body[2], b'x');
        let fg = u32::from_le_bytes(body[3..7].try_into().unwrap());
        assert_eq!(fg, 0xFF80_0000); // ARGB for the red base color
    }

    #[test]
    fn test_wide_glyph_utf8() {
        let engine = TerminalEngine::new(4, 1);
        engine.feed("日".as_bytes());
        let payload = encode_snapshot(&engine.snapshot());
        let body = &payload[24..];
        assert_eq!(body[0], ROW_CONTENT);
        assert_eq!(body[1] & WIDTH_MASK, 2);
        // 3-byte UTF-8 sequence follows the width byte
        assert_eq!(&body[2..5], "日".as_bytes());
    }
}
