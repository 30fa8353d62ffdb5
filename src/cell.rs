//! Grid cells: one codepoint plus style per position.

use bitflags::bitflags;

use crate::color::Color;

bitflags! {
    /// Text attributes carried by a cell.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CellFlags: u16 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const UNDERLINE = 1 << 2;
        const STRIKETHROUGH = 1 << 3;
    }
}

/// The semantic character at one grid position.
///
/// A glyph spanning N cells repeats `displayed_code` across all of them with
/// `segment_count = N` and `segment_index` running 0..N-1; `true_code` keeps
/// the codepoint that was actually received.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cell {
    pub displayed_code: u32,
    pub true_code: u32,
    pub flags: CellFlags,
    pub segment_index: u16,
    pub segment_count: u16,
}

impl Cell {
    pub fn new(code: u32, flags: CellFlags, segment_index: u16, segment_count: u16) -> Self {
        Self {
            displayed_code: code,
            true_code: code,
            flags,
            segment_index,
            segment_count,
        }
    }
}

/// A cell plus its resolved colors, as stored in the grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColoredCell {
    pub cell: Cell,
    pub foreground: Color,
    pub background: Color,
}

impl ColoredCell {
    pub fn new(cell: Cell, foreground: Color, background: Color) -> Self {
        Self {
            cell,
            foreground,
            background,
        }
    }

    /// Returns a copy with foreground and background exchanged; the renderer
    /// uses this to paint the cell under the cursor in reverse video.
    pub fn swap_colors(self) -> Self {
        Self {
            cell: self.cell,
            foreground: self.background,
            background: self.foreground,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cell_is_empty() {
        let cell = Cell::default();
        assert_eq!(cell.displayed_code, 0);
        assert_eq!(cell.segment_count, 0);
        assert_eq!(cell.flags, CellFlags::empty());
    }

    #[test]
    fn new_cell_mirrors_code() {
        let cell = Cell::new(0x4E2D, CellFlags::BOLD, 1, 2);
        assert_eq!(cell.displayed_code, cell.true_code);
        assert_eq!(cell.segment_index, 1);
        assert_eq!(cell.segment_count, 2);
    }

    #[test]
    fn swap_colors_exchanges() {
        let fg = Color::new(255, 1, 2, 3);
        let bg = Color::new(255, 9, 8, 7);
        let swapped = ColoredCell::new(Cell::new(b'x' as u32, CellFlags::empty(), 0, 1), fg, bg)
            .swap_colors();
        assert_eq!(swapped.foreground, bg);
        assert_eq!(swapped.background, fg);
    }
}
