//! The terminal grid: a pitch-addressed 2-D array of colored cells with
//! scrollback, an independent pixel-based user scroll, and a dirty mask the
//! renderer drains.
//!
//! Rows are stored at a `pitch >= width` stride so the buffer can grow wider
//! without re-laying every row. `scroll_in_cells` positions the live window
//! inside the (history + visible) grid; `user_scroll_in_pixels` is where the
//! user is actually looking, which detaches from the live window while they
//! review history.

use crate::cell::ColoredCell;
use crate::font::FontMetrics;
use crate::geometry::{ceil_div, Mat4, Rect, MAT4_IDENTITY};

/// Fixed-capacity bit set addressed by visible cell index.
#[derive(Debug)]
struct DirtyMask {
    words: Vec<u64>,
    len: usize,
}

impl DirtyMask {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[inline]
    fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    fn set_range(&mut self, start: usize, count: usize) {
        for index in start..start.saturating_add(count).min(self.len) {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    fn set_all(&mut self) {
        self.words.fill(!0);
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }

    /// First set bit at or after `from`, if any.
    fn next_set(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }

        let mut word_idx = from / 64;
        let mut word = self.words[word_idx] & (!0u64 << (from % 64));

        loop {
            if word != 0 {
                let index = word_idx * 64 + word.trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    #[cfg(test)]
    fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }
}

/// Grid of [`ColoredCell`] with scrollback history above the visible window.
pub struct CellBuffer {
    data: Vec<ColoredCell>,
    width: u32,
    height: u32,
    visible_height: u32,
    pitch: u32,
    dirty_mask: DirtyMask,
    transform: Mat4,
    user_scroll_in_pixels: i32,
    scroll_in_cells: i32,
    font: FontMetrics,
}

impl CellBuffer {
    pub fn new(width: u32, height: u32, visible_height: u32, font: FontMetrics) -> Self {
        assert!(
            width > 0 && visible_height > 0 && height >= visible_height,
            "invalid cell buffer dimensions"
        );

        Self {
            data: vec![ColoredCell::default(); (width * height) as usize],
            width,
            height,
            visible_height,
            pitch: width,
            dirty_mask: DirtyMask::new((width * visible_height) as usize),
            transform: MAT4_IDENTITY,
            user_scroll_in_pixels: 0,
            scroll_in_cells: 0,
            font,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn visible_height(&self) -> u32 {
        self.visible_height
    }

    pub fn history_size_in_cells(&self) -> u32 {
        self.height - self.visible_height
    }

    pub fn scroll_in_cells(&self) -> u32 {
        self.scroll_in_cells as u32
    }

    pub fn user_scroll_in_cells(&self) -> u32 {
        ceil_div(
            self.user_scroll_in_pixels,
            self.font.cell_height_px() as i32,
        ) as u32
    }

    pub fn screen_width_px(&self) -> u32 {
        self.font.cell_width_px() * self.width
    }

    pub fn screen_height_px(&self) -> u32 {
        self.font.cell_height_px() * self.visible_height
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }

    pub fn font_metrics(&self) -> FontMetrics {
        self.font
    }

    /// Swaps in new cell metrics (font or size change) and re-anchors the
    /// user view, since the pixel scale changed under it.
    pub fn set_font_metrics(&mut self, font: FontMetrics) {
        self.font = font;
        self.reset_user_scroll();
    }

    #[inline]
    fn index(&self, x: u32, row: u32) -> usize {
        (x + self.pitch * row) as usize
    }

    /// Reads the cell at visible position `(x, y)`, offset by either the
    /// live scroll or the user scroll.
    pub fn get(&self, x: u32, y: u32, use_user_scroll: bool) -> Option<ColoredCell> {
        let row = y.checked_add(if use_user_scroll {
            self.user_scroll_in_cells()
        } else {
            self.scroll_in_cells()
        })?;

        (x < self.width && row < self.height).then(|| self.data[self.index(x, row)])
    }

    /// Writes the cell at visible position `(x, y)`; marks it dirty.
    pub fn set(&mut self, x: u32, y: u32, cell: ColoredCell, use_user_scroll: bool) -> bool {
        let offset = if use_user_scroll {
            self.user_scroll_in_cells()
        } else {
            self.scroll_in_cells()
        };

        let Some(row) = y.checked_add(offset) else {
            return false;
        };

        if x < self.width && row < self.height {
            let index = self.index(x, row);
            self.data[index] = cell;
            if y < self.visible_height {
                self.dirty_mask.set((x + self.width * y) as usize);
            }
            true
        } else {
            false
        }
    }

    /// Fills `[left, min(right, width))` on visible row `y`.
    pub fn fill_line(&mut self, left: u32, right: u32, y: u32, value: ColoredCell) -> bool {
        let right = right.min(self.width);
        if left > right || y >= self.visible_height {
            return false;
        }

        let row = y + self.scroll_in_cells();
        for x in left..right {
            let index = self.index(x, row);
            self.data[index] = value;
        }
        self.dirty_mask
            .set_range((y * self.width + left) as usize, (right - left) as usize);

        true
    }

    /// Fills a rectangle, clamped to the visible area.
    pub fn fill_area(&mut self, mut area: Rect<u32>, value: ColoredCell) -> bool {
        if !area.is_valid() {
            return false;
        }

        area.clamp(Rect::new(0, 0, self.width, self.visible_height));
        if !area.is_valid() {
            return false;
        }

        let scroll = self.scroll_in_cells();
        for y in area.top..area.bottom {
            for x in area.left..area.right {
                let index = self.index(x, y + scroll);
                self.data[index] = value;
            }
            self.dirty_mask.set_range(
                (area.left + self.width * y) as usize,
                (area.right - area.left) as usize,
            );
        }

        true
    }

    /// Copies `src` onto `dest` within the visible window. `src` is forced
    /// to `dest`'s dimensions after `dest` is clamped; a residual size
    /// mismatch aborts the copy. Row order is chosen so overlapping regions
    /// copy correctly.
    pub fn copy_area(&mut self, mut src: Rect<u32>, mut dest: Rect<u32>) -> bool {
        if !src.is_valid() || !dest.is_valid() {
            return false;
        }

        let buf_rect = Rect::new(0, 0, self.width, self.visible_height);
        dest.clamp(buf_rect);
        src.copy_width_and_height(dest);
        src.clamp(buf_rect);

        if !src.is_valid()
            || !dest.is_valid()
            || src.width() != dest.width()
            || src.height() != dest.height()
        {
            return false;
        }

        let scroll = self.scroll_in_cells();
        let w = src.width() as usize;
        let h = src.height();

        for y in 0..h {
            self.dirty_mask.set_range(
                (dest.left + self.width * (dest.top + y)) as usize,
                w,
            );
        }

        if src.top > dest.top {
            for y in 0..h {
                let from = self.index(src.left, scroll + src.top + y);
                let to = self.index(dest.left, scroll + dest.top + y);
                self.data.copy_within(from..from + w, to);
            }
        } else {
            for y in (0..h).rev() {
                let from = self.index(src.left, scroll + src.top + y);
                let to = self.index(dest.left, scroll + dest.top + y);
                self.data.copy_within(from..from + w, to);
            }
        }

        true
    }

    /// Whether the user view has detached from the live window.
    pub fn user_scrolled_up(&self) -> bool {
        self.user_scroll_in_cells() != self.scroll_in_cells()
    }

    /// Moves the user view by `n` pixels (negative = toward history),
    /// clamped to the available history.
    pub fn user_scroll_by_n_pixels(&mut self, n: i32) {
        let max = self.history_size_in_cells() as i32 * self.font.cell_height_px() as i32;
        self.user_scroll_in_pixels = (self.user_scroll_in_pixels + n).clamp(0, max);
        self.dirty_mask.set_all();
    }

    /// Snaps the user view back onto the live window.
    pub fn reset_user_scroll(&mut self) {
        self.user_scroll_in_pixels =
            self.scroll_in_cells * self.font.cell_height_px() as i32;
        self.dirty_mask.set_all();
    }

    /// Snaps the live window to the bottom of the grid.
    pub fn reset_scroll(&mut self) {
        self.scroll_in_cells = self.history_size_in_cells() as i32;
    }

    /// Moves the live window by `n` rows. With `allow_buf_expansion` the
    /// grid grows to hold new history; without it, running past the history
    /// snaps the window back to the bottom. A user view that was following
    /// the tail keeps following it.
    pub fn scroll_by_n_cells(&mut self, n: i32, allow_buf_expansion: bool) {
        let new_scroll = (self.scroll_in_cells + n).max(0);

        if !allow_buf_expansion && new_scroll as u32 > self.history_size_in_cells() {
            self.reset_scroll();
            if !self.user_scrolled_up() {
                self.reset_user_scroll();
            }
            return;
        }

        let added_cells = new_scroll - self.history_size_in_cells() as i32;
        if allow_buf_expansion && added_cells > 0 {
            self.height += added_cells as u32;
            self.data
                .resize((self.pitch * self.height) as usize, ColoredCell::default());
        }

        if !self.user_scrolled_up() {
            self.user_scroll_by_n_pixels(n * self.font.cell_height_px() as i32);
        }

        self.scroll_in_cells = new_scroll;
    }

    /// Changes the grid dimensions. Returns `(delta_width,
    /// delta_visible_height)` so the caller can patch its cursor and scroll
    /// region. Content is kept anchored to the bottom of the window.
    pub fn resize(&mut self, width: u32, visible_height: u32) -> (i32, i32) {
        if width == self.width && visible_height == self.visible_height {
            return (0, 0);
        }

        assert!(
            width > 0 && visible_height > 0,
            "cell buffer cannot be resized to zero"
        );

        let delta_w = width as i32 - self.width as i32;
        let delta_vh = visible_height as i32 - self.visible_height as i32;

        // A taller window at the tail keeps all history; otherwise the
        // total just has to fit the new visible area.
        if delta_vh > 0 && !self.user_scrolled_up() {
            self.height += delta_vh as u32;
        }
        self.height = self.height.max(visible_height);
        self.visible_height = visible_height;

        if width > self.pitch {
            let mut new_pitch = self.pitch;
            while new_pitch < width {
                new_pitch *= 2;
            }

            let mut new_data =
                vec![ColoredCell::default(); (new_pitch * self.height) as usize];
            let copy_width = self.width as usize;
            for row in (0..self.height as usize).rev() {
                let from = row * self.pitch as usize;
                let to = row * new_pitch as usize;
                if from + copy_width <= self.data.len() {
                    new_data[to..to + copy_width]
                        .copy_from_slice(&self.data[from..from + copy_width]);
                }
            }

            self.data = new_data;
            self.pitch = new_pitch;
        } else {
            self.data
                .resize((self.pitch * self.height) as usize, ColoredCell::default());
        }

        self.width = width;
        self.dirty_mask = DirtyMask::new((width * visible_height) as usize);

        // Pan so the bottom of the window stays put.
        self.scroll_by_n_cells(-delta_vh, false);

        self.dirty_mask.set_all();

        (delta_w, delta_vh)
    }

    pub fn mark_all_as_dirty(&mut self) {
        self.dirty_mask.set_all();
    }

    /// Visits every dirty, non-empty visible cell in row-major order (under
    /// the user scroll), then clears the mask.
    pub fn process_updates<F: FnMut(u32, u32, &ColoredCell)>(&mut self, mut func: F) {
        let scroll = self.user_scroll_in_cells();

        let mut next = self.dirty_mask.next_set(0);
        while let Some(updated) = next {
            let x = updated as u32 % self.width;
            let y = updated as u32 / self.width;

            if y + scroll >= self.height {
                break;
            }

            let cell = self.data[self.index(x, y + scroll)];
            if cell.cell.displayed_code != 0 {
                func(x, y, &cell);
            }

            next = self.dirty_mask.next_set(updated + 1);
        }

        self.dirty_mask.clear();
    }

    /// Visits every non-empty visible cell (under the user scroll) by its
    /// visible index; the renderer uses this for full redraws.
    pub fn enumerate_non_empty_cells<F: FnMut(u32)>(&self, mut func: F) {
        let scroll = self.user_scroll_in_cells();

        for k in 0..self.visible_height * self.width {
            let x = k % self.width;
            let row = k / self.width + scroll;
            if row >= self.height {
                break;
            }
            if self.data[self.index(x, row)].cell.displayed_code != 0 {
                func(k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellFlags};
    use crate::color::Color;

    fn font() -> FontMetrics {
        FontMetrics::new(8, 16)
    }

    fn glyph(code: u8) -> ColoredCell {
        ColoredCell::new(
            Cell::new(code as u32, CellFlags::empty(), 0, 1),
            Color::new(255, 255, 255, 255),
            Color::new(255, 0, 0, 0),
        )
    }

    #[test]
    fn get_set_round_trip() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        assert!(buf.set(3, 2, glyph(b'x'), false));
        assert_eq!(buf.get(3, 2, false).unwrap().cell.displayed_code, b'x' as u32);
        assert!(buf.get(10, 0, false).is_none());
        assert!(buf.get(0, 4, false).is_none());
        assert!(!buf.set(10, 0, glyph(b'x'), false));
    }

    #[test]
    fn set_marks_dirty() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        buf.process_updates(|_, _, _| {});
        assert!(buf.set(5, 1, glyph(b'y'), false));
        assert!(buf.dirty_mask.is_set(15));

        let mut seen = Vec::new();
        buf.process_updates(|x, y, cell| seen.push((x, y, cell.cell.displayed_code)));
        assert_eq!(seen, vec![(5, 1, b'y' as u32)]);

        // The mask was drained.
        let mut count = 0;
        buf.process_updates(|_, _, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn fill_line_clamps_right_edge() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        assert!(buf.fill_line(8, 100, 0, glyph(b'-')));
        assert_eq!(buf.get(9, 0, false).unwrap().cell.displayed_code, b'-' as u32);
        assert_eq!(buf.get(7, 0, false).unwrap().cell.displayed_code, 0);
        assert!(!buf.fill_line(0, 5, 4, glyph(b'-')));
    }

    #[test]
    fn fill_area_clamps_to_visible() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        assert!(buf.fill_area(Rect::new(8, 2, 20, 20), glyph(b'#')));
        assert_eq!(buf.get(9, 3, false).unwrap().cell.displayed_code, b'#' as u32);
        assert_eq!(buf.get(7, 3, false).unwrap().cell.displayed_code, 0);
    }

    #[test]
    fn copy_area_moves_rows_up() {
        let mut buf = CellBuffer::new(4, 4, 4, font());
        buf.fill_line(0, 4, 1, glyph(b'a'));
        buf.fill_line(0, 4, 2, glyph(b'b'));

        // Shift rows 1..4 up by one, like a line feed inside a region.
        assert!(buf.copy_area(Rect::new(0, 1, 4, 4), Rect::new(0, 0, 4, 3)));
        assert_eq!(buf.get(0, 0, false).unwrap().cell.displayed_code, b'a' as u32);
        assert_eq!(buf.get(0, 1, false).unwrap().cell.displayed_code, b'b' as u32);
    }

    #[test]
    fn copy_area_moves_rows_down() {
        let mut buf = CellBuffer::new(4, 4, 4, font());
        buf.fill_line(0, 4, 0, glyph(b'a'));
        buf.fill_line(0, 4, 1, glyph(b'b'));

        assert!(buf.copy_area(Rect::new(0, 0, 4, 3), Rect::new(0, 1, 4, 4)));
        assert_eq!(buf.get(0, 1, false).unwrap().cell.displayed_code, b'a' as u32);
        assert_eq!(buf.get(0, 2, false).unwrap().cell.displayed_code, b'b' as u32);
    }

    #[test]
    fn copy_area_shifts_within_a_row() {
        let mut buf = CellBuffer::new(6, 2, 2, font());
        for (i, code) in b"abcdef".iter().enumerate() {
            buf.set(i as u32, 0, glyph(*code), false);
        }

        // Delete two characters at column 1: pull columns 3..6 left.
        assert!(buf.copy_area(Rect::new(3, 0, 6, 1), Rect::new(1, 0, 4, 1)));
        let row: Vec<u8> = (0..6)
            .map(|x| buf.get(x, 0, false).unwrap().cell.displayed_code as u8)
            .collect();
        assert_eq!(&row[..4], b"adef");
    }

    #[test]
    fn scroll_with_expansion_grows_history() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        buf.fill_line(0, 10, 0, glyph(b'h'));

        buf.scroll_by_n_cells(1, true);
        assert_eq!(buf.height(), 5);
        assert_eq!(buf.history_size_in_cells(), 1);
        assert_eq!(buf.scroll_in_cells(), 1);
        // The old top row is now history row 0; the visible window moved.
        assert_eq!(buf.get(0, 0, false).unwrap().cell.displayed_code, 0);
        // The user view followed the tail.
        assert!(!buf.user_scrolled_up());
    }

    #[test]
    fn scroll_without_expansion_resets_at_the_edge() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        buf.scroll_by_n_cells(5, false);
        assert_eq!(buf.scroll_in_cells(), 0);
        assert_eq!(buf.height(), 4);
        assert!(!buf.user_scrolled_up());
    }

    #[test]
    fn user_scroll_detaches_and_clamps() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        for _ in 0..3 {
            buf.scroll_by_n_cells(1, true);
        }
        assert_eq!(buf.history_size_in_cells(), 3);

        buf.user_scroll_by_n_pixels(-16);
        assert!(buf.user_scrolled_up());
        assert_eq!(buf.user_scroll_in_cells(), 2);

        // Clamp at the top of history.
        buf.user_scroll_by_n_pixels(-10_000);
        assert_eq!(buf.user_scroll_in_cells(), 0);

        // While detached, live scrolling leaves the user view alone.
        buf.scroll_by_n_cells(1, true);
        assert_eq!(buf.user_scroll_in_cells(), 0);
        assert!(buf.user_scrolled_up());

        buf.reset_user_scroll();
        assert!(!buf.user_scrolled_up());
    }

    #[test]
    fn reset_user_scroll_is_idempotent() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        buf.scroll_by_n_cells(2, true);
        buf.reset_user_scroll();
        assert!(!buf.user_scrolled_up());
        buf.reset_user_scroll();
        assert!(!buf.user_scrolled_up());
    }

    #[test]
    fn resize_noop_returns_zero_deltas() {
        let mut buf = CellBuffer::new(10, 4, 4, font());
        assert_eq!(buf.resize(10, 4), (0, 0));
    }

    #[test]
    fn resize_wider_preserves_content() {
        let mut buf = CellBuffer::new(4, 3, 3, font());
        buf.set(3, 2, glyph(b'z'), false);

        let (dw, dvh) = buf.resize(9, 3);
        assert_eq!((dw, dvh), (5, 0));
        assert_eq!(buf.width(), 9);
        assert_eq!(buf.get(3, 2, false).unwrap().cell.displayed_code, b'z' as u32);
        assert_eq!(buf.get(8, 2, false).unwrap().cell.displayed_code, 0);
    }

    #[test]
    fn resize_taller_at_tail_keeps_history() {
        let mut buf = CellBuffer::new(4, 3, 3, font());
        buf.fill_line(0, 4, 0, glyph(b'h'));
        buf.scroll_by_n_cells(2, true);
        assert_eq!(buf.history_size_in_cells(), 2);

        let (_, dvh) = buf.resize(4, 5);
        assert_eq!(dvh, 2);
        assert_eq!(buf.history_size_in_cells(), 2);
        // The window grew upward: history rows are visible again.
        assert_eq!(buf.scroll_in_cells(), 0);
        assert_eq!(buf.get(0, 0, false).unwrap().cell.displayed_code, b'h' as u32);
    }

    #[test]
    fn resize_shorter_keeps_bottom_rows() {
        let mut buf = CellBuffer::new(4, 4, 4, font());
        buf.fill_line(0, 4, 3, glyph(b'p'));

        let (_, dvh) = buf.resize(4, 2);
        assert_eq!(dvh, -2);
        assert_eq!(buf.visible_height(), 2);
        // The bottom row (prompt line) is still the bottom row.
        assert_eq!(buf.get(0, 1, false).unwrap().cell.displayed_code, b'p' as u32);
    }

    #[test]
    #[should_panic(expected = "resized to zero")]
    fn resize_to_zero_panics() {
        let mut buf = CellBuffer::new(4, 4, 4, font());
        buf.resize(0, 4);
    }

    #[test]
    fn enumerate_non_empty_cells_reports_visible_indices() {
        let mut buf = CellBuffer::new(5, 3, 3, font());
        buf.set(1, 0, glyph(b'a'), false);
        buf.set(4, 2, glyph(b'b'), false);

        let mut indices = Vec::new();
        buf.enumerate_non_empty_cells(|k| indices.push(k));
        assert_eq!(indices, vec![1, 14]);
    }

    #[test]
    fn process_updates_skips_empty_cells() {
        let mut buf = CellBuffer::new(5, 3, 3, font());
        buf.mark_all_as_dirty();
        buf.set(2, 1, glyph(b'q'), false);

        let mut seen = Vec::new();
        buf.process_updates(|x, y, _| seen.push((x, y)));
        assert_eq!(seen, vec![(2, 1)]);
    }
}
