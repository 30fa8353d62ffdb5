//! Font measurements the grid depends on.
//!
//! Rasterization lives outside the core; the terminal only needs the cell
//! pixel dimensions and how many cells a codepoint occupies. The metrics are
//! a plain value threaded through construction instead of a global service.

use unicode_width::UnicodeWidthChar;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FontMetrics {
    cell_width_px: u32,
    cell_height_px: u32,
}

impl FontMetrics {
    pub fn new(cell_width_px: u32, cell_height_px: u32) -> Self {
        assert!(
            cell_width_px > 0 && cell_height_px > 0,
            "cell dimensions must be non-zero"
        );
        Self {
            cell_width_px,
            cell_height_px,
        }
    }

    pub fn cell_width_px(&self) -> u32 {
        self.cell_width_px
    }

    pub fn cell_height_px(&self) -> u32 {
        self.cell_height_px
    }

    /// Number of grid cells a codepoint occupies: 1 or 2.
    pub fn width_in_cells(&self, codepoint: u32) -> u32 {
        char::from_u32(codepoint)
            .and_then(UnicodeWidthChar::width)
            .map_or(1, |w| w.clamp(1, 2) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_is_single_width() {
        let font = FontMetrics::new(8, 16);
        assert_eq!(font.width_in_cells(b'a' as u32), 1);
        assert_eq!(font.width_in_cells(b' ' as u32), 1);
    }

    #[test]
    fn cjk_is_double_width() {
        let font = FontMetrics::new(8, 16);
        assert_eq!(font.width_in_cells('中' as u32), 2);
        assert_eq!(font.width_in_cells('あ' as u32), 2);
    }

    #[test]
    fn invalid_codepoints_fall_back_to_one() {
        let font = FontMetrics::new(8, 16);
        assert_eq!(font.width_in_cells(0xD800), 1);
    }
}
