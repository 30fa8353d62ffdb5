//! Terminal state and escape sequence dispatch.
//!
//! The terminal owns two cell buffers (normal with scrollback, alternate
//! for full-screen applications), the cursor and attribute state, and the
//! byte interpreter: printable text goes through the UTF-8 decoder into the
//! grid, ESC hands the stream to the escape parser, and completed rules are
//! dispatched to the matching handler. Bytes destined for the shell (mouse
//! reports, key input) accumulate in a response queue that the session
//! drains to the PTY.

use crate::cell::{Cell, CellFlags, ColoredCell};
use crate::cell_buffer::CellBuffer;
use crate::color::{Color, COLOR_TABLE_256};
use crate::config::Config;
use crate::escape::{EatResult, EscapeParseResult, EscapeParser, Token};
use crate::events::{Modifiers, MouseButton};
use crate::font::FontMetrics;
use crate::geometry::Rect;
use crate::keyboard::{self, Key};
use crate::utf8::Utf8Decoder;

/// Cursor shape requested by the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorStyle {
    #[default]
    Bar,
    Line,
}

/// What mouse activity is reported to the application. Ordered: a larger
/// mode reports a superset of events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MouseTrackingMode {
    #[default]
    NoTracking,
    OnlyButtonEvents,
    MotionEventsIfMouseDown,
    AllEvents,
}

/// How mouse reports are encoded on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MouseTrackingFormat {
    #[default]
    Normal,
    X10Compat,
    Utf8,
    Sgr,
    Urxvt,
    SgrPixels,
}

/// The terminal state machine.
pub struct Terminal {
    normal_buf: CellBuffer,
    alternate_buf: CellBuffer,
    using_alternate_buf: bool,

    font: FontMetrics,

    escape_parser: EscapeParser,
    utf8_parser: Utf8Decoder,
    parsing_escape_code: bool,
    last_escape_seq: Vec<u8>,
    esc_seq_error_counter: u32,

    cursor_x: u32,
    cursor_y: u32,
    saved_cursor: (u32, u32),
    /// Normal-buffer cursor, snapshotted while the alternate buffer is live.
    normal_cursor: (u32, u32),

    current_fg: Color,
    current_bg: Color,
    default_fg: Color,
    default_bg: Color,
    current_cell_flags: CellFlags,

    cursor_style: CursorStyle,
    is_cursor_visible: bool,
    lnm_flag: bool,
    forward_wraparound: bool,
    reverse_wraparound: bool,

    scroll_area: Rect<u32>,

    mouse_mode: MouseTrackingMode,
    mouse_tracking_format: MouseTrackingFormat,
    mouse_down: bool,
    mouse_pos_x: u32,
    mouse_pos_y: u32,
    mouse_mods: Modifiers,
    mouse_btn: u32,

    /// Bytes owed to the PTY (mouse reports, encoded keys).
    response_queue: Vec<u8>,
}

impl Terminal {
    pub fn new(width: u32, visible_height: u32, font: FontMetrics) -> Self {
        let default_fg = Color::new(255, 255, 255, 255);
        let default_bg = Color::new(255, 0, 0, 0);

        Self {
            normal_buf: CellBuffer::new(width, visible_height, visible_height, font),
            alternate_buf: CellBuffer::new(width, visible_height, visible_height, font),
            using_alternate_buf: false,
            font,
            escape_parser: EscapeParser::new(),
            utf8_parser: Utf8Decoder::new(),
            parsing_escape_code: false,
            last_escape_seq: Vec::new(),
            esc_seq_error_counter: 0,
            cursor_x: 0,
            cursor_y: 0,
            saved_cursor: (0, 0),
            normal_cursor: (0, 0),
            current_fg: default_fg,
            current_bg: default_bg,
            default_fg,
            default_bg,
            current_cell_flags: CellFlags::empty(),
            cursor_style: CursorStyle::default(),
            is_cursor_visible: true,
            lnm_flag: false,
            forward_wraparound: true,
            reverse_wraparound: true,
            scroll_area: Rect::new(0, 0, width, visible_height),
            mouse_mode: MouseTrackingMode::default(),
            mouse_tracking_format: MouseTrackingFormat::default(),
            mouse_down: false,
            mouse_pos_x: 0,
            mouse_pos_y: 0,
            mouse_mods: Modifiers::empty(),
            mouse_btn: 0,
            response_queue: Vec::new(),
        }
    }

    // ===== accessors for the renderer and session =====

    pub fn current_buffer(&self) -> &CellBuffer {
        if self.using_alternate_buf {
            &self.alternate_buf
        } else {
            &self.normal_buf
        }
    }

    pub fn current_buffer_mut(&mut self) -> &mut CellBuffer {
        if self.using_alternate_buf {
            &mut self.alternate_buf
        } else {
            &mut self.normal_buf
        }
    }

    pub fn cursor_x(&self) -> u32 {
        self.cursor_x
    }

    pub fn cursor_y(&self) -> u32 {
        self.cursor_y
    }

    pub fn is_cursor_visible(&self) -> bool {
        self.is_cursor_visible
    }

    pub fn cursor_style(&self) -> CursorStyle {
        self.cursor_style
    }

    pub fn is_lnm_set(&self) -> bool {
        self.lnm_flag
    }

    pub fn is_using_normal_buffer(&self) -> bool {
        !self.using_alternate_buf
    }

    pub fn font_metrics(&self) -> FontMetrics {
        self.font
    }

    /// Takes the bytes owed to the PTY since the last call.
    pub fn take_response(&mut self) -> Option<Vec<u8>> {
        if self.response_queue.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.response_queue))
        }
    }

    fn write_to_pty(&mut self, bytes: &[u8]) {
        self.response_queue.extend_from_slice(bytes);
    }

    /// Applies a reloaded configuration. The metrics come from the font
    /// layer since cell geometry depends on the rasterized face.
    pub fn on_config_change(&mut self, _config: &Config, font: FontMetrics) {
        log::info!("config reloaded, cell size {}x{}px", font.cell_width_px(), font.cell_height_px());
        self.font = font;
        self.normal_buf.set_font_metrics(font);
        self.alternate_buf.set_font_metrics(font);
    }

    // ===== user scrollback view =====

    pub fn try_scroll_buffer_up(&mut self, pixels: u32) -> bool {
        if self.using_alternate_buf {
            return false;
        }
        self.normal_buf.user_scroll_by_n_pixels(-(pixels as i32));
        true
    }

    pub fn try_scroll_buffer_down(&mut self, pixels: u32) -> bool {
        if self.using_alternate_buf {
            return false;
        }
        self.normal_buf.user_scroll_by_n_pixels(pixels as i32);
        true
    }

    pub fn try_reset_user_scroll(&mut self) -> bool {
        if self.using_alternate_buf {
            return false;
        }
        self.normal_buf.reset_user_scroll();
        true
    }

    pub fn is_user_scrolled_up(&self) -> bool {
        !self.using_alternate_buf && self.normal_buf.user_scrolled_up()
    }

    // ===== resizing =====

    /// Resizes both grids and patches the cursor and scroll region by the
    /// returned deltas. The session relays the same size to the PTY.
    pub fn set_window_size(&mut self, width: u32, height: u32) {
        let (delta_w, delta_vh) = if self.using_alternate_buf {
            let deltas = self.alternate_buf.resize(width, height);
            self.normal_buf.resize(width, height);
            deltas
        } else {
            let deltas = self.normal_buf.resize(width, height);
            self.alternate_buf.resize(width, height);
            deltas
        };

        self.cursor_y = self.cursor_y.min(height - 1);
        self.cursor_x = self.cursor_x.min(width - 1);
        self.scroll_area.right = self.scroll_area.right.saturating_add_signed(delta_w);
        self.scroll_area.bottom = self.scroll_area.bottom.saturating_add_signed(delta_vh);
    }

    // ===== buffer switching =====

    fn default_scroll_area(&self) -> Rect<u32> {
        Rect::new(
            0,
            0,
            self.current_buffer().width(),
            self.current_buffer().visible_height(),
        )
    }

    fn default_empty_cell(&self) -> ColoredCell {
        ColoredCell::new(
            Cell::new(b' ' as u32, CellFlags::empty(), 0, 1),
            self.default_fg,
            self.default_bg,
        )
    }

    fn switch_to_alternate_buffer(&mut self) {
        if self.using_alternate_buf {
            return;
        }
        self.using_alternate_buf = true;
        self.normal_cursor = (self.cursor_x, self.cursor_y);
        self.cursor_x = 0;
        self.cursor_y = 0;

        let area = self.default_scroll_area();
        let space = self.default_empty_cell();
        self.alternate_buf.fill_area(area, space);
    }

    fn switch_to_normal_buffer(&mut self) {
        if !self.using_alternate_buf {
            return;
        }
        self.using_alternate_buf = false;
        (self.cursor_x, self.cursor_y) = self.normal_cursor;
        self.normal_buf.mark_all_as_dirty();
    }

    // ===== attribute state =====

    fn set_cell_flags(&mut self, flags: CellFlags) {
        self.current_cell_flags |= flags;
    }

    fn reset_cell_flags(&mut self, flags: CellFlags) {
        self.current_cell_flags &= !flags;
    }

    fn set_indexed_color(&mut self, fg_or_bg: u32, color: u32) {
        let col = COLOR_TABLE_256.colors[(color % 256) as usize];
        if fg_or_bg == 48 {
            self.current_bg = col;
        } else {
            self.current_fg = col;
        }
    }

    fn set_rgb_color(&mut self, fg_or_bg: u32, r: u32, g: u32, b: u32) {
        let col = Color::new(255, r as u8, g as u8, b as u8);
        if fg_or_bg == 48 {
            self.current_bg = col;
        } else {
            self.current_fg = col;
        }
    }

    fn apply_sgr_parameter(&mut self, param: u32) {
        match param {
            0 => {
                self.current_fg = self.default_fg;
                self.current_bg = self.default_bg;
                self.reset_cell_flags(CellFlags::all());
            }
            1 => self.set_cell_flags(CellFlags::BOLD),
            3 => self.set_cell_flags(CellFlags::ITALIC),
            30..=37 => self.current_fg = COLOR_TABLE_256.colors[(param - 30) as usize],
            90..=97 => self.current_fg = COLOR_TABLE_256.colors[(param - 90 + 8) as usize],
            39 => self.current_fg = self.default_fg,
            40..=47 => self.current_bg = COLOR_TABLE_256.colors[(param - 40) as usize],
            100..=107 => self.current_bg = COLOR_TABLE_256.colors[(param - 100 + 8) as usize],
            49 => self.current_bg = self.default_bg,
            other => log::debug!("unhandled SGR parameter {other}"),
        }
    }

    // ===== rule handlers =====

    fn change_formatting(&mut self, tokens: &[Token]) {
        if tokens.len() == 2 {
            self.apply_sgr_parameter(0);
            return;
        }

        match &tokens[1] {
            Token::NumberList(params) => {
                if params.first() == Some(&38) || params.first() == Some(&48) {
                    match params.len() {
                        3 => self.set_indexed_color(params[0], params[2]),
                        5 => self.set_rgb_color(params[0], params[2], params[3], params[4]),
                        // With a colorspace slot between the 2 and the channels.
                        6 => self.set_rgb_color(params[0], params[3], params[4], params[5]),
                        _ => {}
                    }
                } else {
                    for &param in params {
                        self.apply_sgr_parameter(param);
                    }
                }
            }
            Token::Number(param) => self.apply_sgr_parameter(*param),
            _ => self.report_unhandled_sequence(),
        }
    }

    fn move_cursor_up(&mut self, tokens: &[Token]) {
        let off = cursor_offset(tokens);
        let limit = if self.cursor_y < self.scroll_area.top {
            0
        } else {
            self.scroll_area.top
        };
        self.cursor_y = self.cursor_y.saturating_sub(off).max(limit);
    }

    fn move_cursor_down(&mut self, tokens: &[Token]) {
        let off = cursor_offset(tokens);
        let limit = if self.cursor_y >= self.scroll_area.bottom {
            self.current_buffer().visible_height() - 1
        } else {
            self.scroll_area.bottom - 1
        };
        self.cursor_y = self.cursor_y.saturating_add(off).min(limit);
    }

    fn move_cursor_right(&mut self, tokens: &[Token]) {
        let off = cursor_offset(tokens);
        let limit = self.current_buffer().width() - 1;
        self.cursor_x = self.cursor_x.saturating_add(off).min(limit);
    }

    fn move_cursor_left(&mut self, tokens: &[Token]) {
        let off = cursor_offset(tokens);
        self.cursor_x = self.cursor_x.saturating_sub(off);
    }

    fn move_cursor_to_x0_n_lines_down(&mut self, tokens: &[Token]) {
        self.cursor_x = 0;
        self.move_cursor_down(tokens);
    }

    fn move_cursor_to_x0_n_lines_up(&mut self, tokens: &[Token]) {
        self.cursor_x = 0;
        self.move_cursor_up(tokens);
    }

    fn move_cursor_to_column(&mut self, tokens: &[Token]) {
        let offset = cursor_offset(tokens);
        self.cursor_x = offset - 1;
    }

    fn move_cursor_to_00(&mut self) {
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn set_private_mode(&mut self, mode: u32, flag: bool) {
        match mode {
            7 => self.forward_wraparound = flag,
            9 => {
                if flag {
                    self.mouse_mode = MouseTrackingMode::OnlyButtonEvents;
                    self.mouse_tracking_format = MouseTrackingFormat::X10Compat;
                } else {
                    self.mouse_mode = MouseTrackingMode::NoTracking;
                }
            }
            25 => self.is_cursor_visible = flag,
            45 => self.reverse_wraparound = flag,
            1000 | 1002 | 1003 => {
                if flag {
                    let requested = match mode {
                        1000 => MouseTrackingMode::OnlyButtonEvents,
                        1002 => MouseTrackingMode::MotionEventsIfMouseDown,
                        _ => MouseTrackingMode::AllEvents,
                    };
                    self.mouse_mode = self.mouse_mode.max(requested);
                } else {
                    self.mouse_mode = MouseTrackingMode::NoTracking;
                }
            }
            1005 => {
                self.mouse_tracking_format = if flag {
                    MouseTrackingFormat::Utf8
                } else {
                    MouseTrackingFormat::Normal
                }
            }
            1006 => {
                self.mouse_tracking_format = if flag {
                    MouseTrackingFormat::Sgr
                } else {
                    MouseTrackingFormat::Normal
                }
            }
            1015 => {
                self.mouse_tracking_format = if flag {
                    MouseTrackingFormat::Urxvt
                } else {
                    MouseTrackingFormat::Normal
                }
            }
            1016 => {
                self.mouse_tracking_format = if flag {
                    MouseTrackingFormat::SgrPixels
                } else {
                    MouseTrackingFormat::Normal
                }
            }
            1049 => {
                if flag {
                    self.switch_to_alternate_buffer();
                } else {
                    self.switch_to_normal_buffer();
                }
            }
            _ => self.report_unhandled_sequence(),
        }
    }

    fn set_mode(&mut self, mode: u32, flag: bool) {
        match mode {
            20 => self.lnm_flag = flag,
            _ => self.report_unhandled_sequence(),
        }
    }

    fn change_mode_settings(&mut self, tokens: &[Token], flag: bool) {
        match &tokens[2] {
            Token::NumberList(modes) => {
                for &mode in modes {
                    self.set_private_mode(mode, flag);
                }
            }
            Token::Number(mode) => self.set_private_mode(*mode, flag),
            _ => {}
        }
    }

    fn change_ansi_mode(&mut self, tokens: &[Token], flag: bool) {
        if let Token::Number(mode) = &tokens[1] {
            self.set_mode(*mode, flag);
        }
    }

    fn set_cursor_position(&mut self, tokens: &[Token]) {
        if let Token::NumberList(pos) = &tokens[1] {
            if pos.len() >= 2 && pos[0] > 0 && pos[1] > 0 {
                self.cursor_x = pos[1] - 1;
                self.cursor_y = pos[0] - 1;
            }
        }
    }

    fn clear_to_end_of_screen(&mut self) {
        let space = self.default_empty_cell();
        let (width, visible_height) = {
            let buf = self.current_buffer();
            (buf.width(), buf.visible_height())
        };
        let (x, y) = (self.cursor_x, self.cursor_y);

        self.current_buffer_mut()
            .fill_area(Rect::new(0, y + 1, width, visible_height), space);
        self.current_buffer_mut().fill_line(x, width, y, space);
    }

    fn clear_from_start_of_screen(&mut self) {
        let space = self.default_empty_cell();
        let width = self.current_buffer().width();
        let (x, y) = (self.cursor_x, self.cursor_y);

        self.current_buffer_mut()
            .fill_area(Rect::new(0, 0, width, y), space);
        self.current_buffer_mut().fill_line(0, x + 1, y, space);
    }

    fn clear_screen(&mut self, tokens: &[Token]) {
        if tokens.len() == 2 {
            self.clear_to_end_of_screen();
            return;
        }

        match &tokens[1] {
            Token::Number(0) => self.clear_to_end_of_screen(),
            Token::Number(1) => self.clear_from_start_of_screen(),
            Token::Number(2) => {
                self.clear_to_end_of_screen();
                self.clear_from_start_of_screen();
            }
            _ => self.report_unhandled_sequence(),
        }
    }

    fn clear_line(&mut self, tokens: &[Token]) {
        let space = self.default_empty_cell();
        let width = self.current_buffer().width();
        let (x, y) = (self.cursor_x, self.cursor_y);

        if tokens.len() == 2 {
            self.current_buffer_mut().fill_line(x, width, y, space);
            return;
        }

        match &tokens[1] {
            Token::Number(0) => {
                self.current_buffer_mut().fill_line(x, width, y, space);
            }
            Token::Number(1) => {
                self.current_buffer_mut().fill_line(0, x, y, space);
            }
            Token::Number(2) => {
                self.current_buffer_mut().fill_line(x, width, y, space);
                self.current_buffer_mut().fill_line(0, x, y, space);
            }
            _ => self.report_unhandled_sequence(),
        }
    }

    fn save_cursor_position(&mut self) {
        self.saved_cursor = (self.cursor_x, self.cursor_y);
    }

    fn restore_cursor_position(&mut self) {
        (self.cursor_x, self.cursor_y) = self.saved_cursor;
    }

    fn esc_then_number(&mut self, tokens: &[Token]) {
        match &tokens[0] {
            Token::Number(7) => self.save_cursor_position(),
            Token::Number(8) => self.restore_cursor_position(),
            _ => self.report_unhandled_sequence(),
        }
    }

    fn set_vertical_scrolling(&mut self, tokens: &[Token]) {
        let Token::NumberList(margins) = &tokens[1] else {
            return;
        };
        if margins.len() != 2 {
            return;
        }

        let (top, bottom) = (margins[0], margins[1]);
        log::debug!("set scrolling margins: {top};{bottom}");

        self.cursor_x = 0;
        self.cursor_y = 0;

        if top > 0 && bottom > top && bottom <= self.current_buffer().visible_height() {
            self.scroll_area.top = top - 1;
            self.scroll_area.bottom = bottom;
        }
    }

    fn insert_n_lines_at(&mut self, y: u32, n: u32) {
        let area = self.scroll_area;
        let space = self.default_empty_cell();

        self.current_buffer_mut().copy_area(
            Rect::new(area.left, y, area.right, area.bottom.saturating_sub(n)),
            Rect::new(area.left, y.saturating_add(n), area.right, area.bottom),
        );
        self.current_buffer_mut().fill_area(
            Rect::new(area.left, y, area.right, y.saturating_add(n)),
            space,
        );
    }

    fn delete_n_lines_at(&mut self, y: u32, n: u32) {
        let area = self.scroll_area;
        let space = self.default_empty_cell();

        self.current_buffer_mut().copy_area(
            Rect::new(area.left, y.saturating_add(n), area.right, area.bottom),
            Rect::new(area.left, y, area.right, area.bottom.saturating_sub(n)),
        );
        self.current_buffer_mut().fill_area(
            Rect::new(
                area.left,
                area.bottom.saturating_sub(n),
                area.right,
                area.bottom,
            ),
            space,
        );
    }

    fn insert_n_lines(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        self.insert_n_lines_at(self.cursor_y, n);
    }

    fn delete_n_lines(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        self.delete_n_lines_at(self.cursor_y, n);
    }

    fn insert_n_characters(&mut self, tokens: &[Token]) {
        let _n = cursor_offset(tokens);
        self.report_unhandled_sequence();
    }

    fn delete_n_characters(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        let space = self.default_empty_cell();

        let left = self.cursor_x.saturating_add(n);
        let right = self.scroll_area.right;
        let y = self.cursor_y;

        let cursor_x = self.cursor_x;
        if right > left {
            let middle = right.saturating_sub(n);
            self.current_buffer_mut().copy_area(
                Rect::new(left, y, right, y + 1),
                Rect::new(cursor_x, y, middle, y + 1),
            );
            self.current_buffer_mut().fill_line(middle, right, y, space);
        } else {
            self.current_buffer_mut()
                .fill_line(cursor_x, right, y, space);
        }
    }

    fn erase_n_characters(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        let space = self.default_empty_cell();
        let right = self.scroll_area.right.min(self.cursor_x.saturating_add(n));
        let (x, y) = (self.cursor_x, self.cursor_y);
        self.current_buffer_mut().fill_line(x, right, y, space);
    }

    fn pan_down(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        let area = self.scroll_area;

        if self.is_using_normal_buffer() && area == self.default_scroll_area() {
            self.current_buffer_mut().scroll_by_n_cells(n as i32, true);
        } else if n >= area.height() {
            let space = self.default_empty_cell();
            self.current_buffer_mut().fill_area(area, space);
        } else {
            let space = self.default_empty_cell();
            self.current_buffer_mut().copy_area(
                Rect::new(area.left, area.top.saturating_add(n), area.right, area.bottom),
                Rect::new(area.left, area.top, area.right, area.bottom.saturating_sub(n)),
            );
            self.current_buffer_mut().fill_area(
                Rect::new(
                    area.left,
                    area.bottom.saturating_sub(n),
                    area.right,
                    area.bottom,
                ),
                space,
            );
        }
    }

    fn pan_up(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);

        if self.is_using_normal_buffer() && self.scroll_area == self.default_scroll_area() {
            self.current_buffer_mut()
                .scroll_by_n_cells(-(n as i32), false);
        } else {
            self.insert_n_lines_at(self.scroll_area.top, n);
        }
    }

    fn vertical_line_position_absolute(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        self.cursor_y = (n - 1).min(self.current_buffer().visible_height());
    }

    fn vertical_line_position_relative(&mut self, tokens: &[Token]) {
        let n = cursor_offset(tokens);
        self.cursor_y = self
            .cursor_y
            .saturating_add(n)
            .min(self.current_buffer().visible_height());
    }

    fn report_unhandled_sequence(&mut self) {
        self.esc_seq_error_counter += 1;
        log::debug!(
            "unhandled escape sequence #{}: \\e{}",
            self.esc_seq_error_counter,
            String::from_utf8_lossy(&self.last_escape_seq)
        );
    }

    fn report_unparsed_sequence(&mut self) {
        self.esc_seq_error_counter += 1;
        log::debug!(
            "unparsed escape sequence #{}: \\e{}...",
            self.esc_seq_error_counter,
            String::from_utf8_lossy(&self.last_escape_seq)
        );
    }

    fn dispatch_escape(&mut self, result: EscapeParseResult) {
        let EscapeParseResult { rule_num, tokens } = result;

        match rule_num {
            0 => self.change_formatting(&tokens),
            1 => self.move_cursor_up(&tokens),
            2 => self.move_cursor_down(&tokens),
            3 => self.move_cursor_right(&tokens),
            4 => self.move_cursor_left(&tokens),
            5 => self.move_cursor_to_x0_n_lines_down(&tokens),
            6 => self.move_cursor_to_x0_n_lines_up(&tokens),
            7 => self.move_cursor_to_column(&tokens),
            8 => self.move_cursor_to_00(),
            9 => self.change_mode_settings(&tokens, true),
            10 => self.change_mode_settings(&tokens, false),
            // Character set designation: accepted, nothing to do.
            11 => {}
            12 => self.set_cursor_position(&tokens),
            13 => self.clear_screen(&tokens),
            14 => self.clear_line(&tokens),
            15 => self.esc_then_number(&tokens),
            16 => self.reverse_index(),
            17 => self.set_vertical_scrolling(&tokens),
            18 => self.insert_n_lines(&tokens),
            19 => self.delete_n_lines(&tokens),
            20 => self.insert_n_characters(&tokens),
            21 => self.delete_n_characters(&tokens),
            22 => self.erase_n_characters(&tokens),
            23 => self.pan_down(&tokens),
            24 => self.pan_up(&tokens),
            25 => self.vertical_line_position_absolute(&tokens),
            26 => self.vertical_line_position_relative(&tokens),
            27 => self.change_ansi_mode(&tokens, true),
            28 => self.change_ansi_mode(&tokens, false),
            // OSC, DCS terminfo queries, cursor style.
            29..=32 => self.report_unhandled_sequence(),
            other => {
                log::debug!("escape rule {other} has no handler");
            }
        }
    }

    // ===== cursor movement primitives =====

    fn go_forward_x(&mut self) {
        self.cursor_x += 1;
    }

    fn go_back_x(&mut self) {
        if self.cursor_x == self.scroll_area.left {
            if self.reverse_wraparound {
                self.cursor_x = self.scroll_area.right.saturating_sub(1);
                self.cursor_y = self.cursor_y.saturating_sub(1);
            }
        } else {
            self.cursor_x -= 1;
        }
    }

    fn carriage_return(&mut self) {
        self.cursor_x = 0;
    }

    fn line_feed(&mut self) {
        if self.lnm_flag {
            self.cursor_x = self.scroll_area.left;
        }

        if self.cursor_y == self.scroll_area.bottom.saturating_sub(1) {
            if self.is_using_normal_buffer() && self.scroll_area == self.default_scroll_area() {
                self.current_buffer_mut().scroll_by_n_cells(1, true);
            } else {
                let area = self.scroll_area;
                let space = self.default_empty_cell();
                self.current_buffer_mut().copy_area(
                    Rect::new(area.left, area.top + 1, area.right, area.bottom),
                    Rect::new(area.left, area.top, area.right, area.bottom.saturating_sub(1)),
                );
                self.current_buffer_mut().fill_line(
                    area.left,
                    area.right,
                    area.bottom.saturating_sub(1),
                    space,
                );
            }
        } else {
            self.cursor_y += 1;
        }
    }

    fn reverse_index(&mut self) {
        if self.cursor_y == self.scroll_area.top {
            if self.is_using_normal_buffer() {
                self.current_buffer_mut().scroll_by_n_cells(-1, false);
            } else {
                let area = self.scroll_area;
                let space = self.default_empty_cell();
                self.current_buffer_mut().copy_area(
                    Rect::new(area.left, area.top, area.right, area.bottom.saturating_sub(1)),
                    Rect::new(area.left, area.top + 1, area.right, area.bottom),
                );
                self.current_buffer_mut()
                    .fill_line(area.left, area.right, area.top, space);
            }
        } else {
            self.cursor_y = self.cursor_y.saturating_sub(1);
        }
    }

    fn set_cell_at(&mut self, x: u32, y: u32, mut cell: Cell) -> bool {
        cell.flags = self.current_cell_flags;
        let colored = ColoredCell::new(cell, self.current_fg, self.current_bg);
        self.current_buffer_mut().set(x, y, colored, false)
    }

    // ===== byte interpretation =====

    pub fn interpret_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.interpret_byte(byte);
        }
    }

    /// Feeds one byte from the PTY through the state machine.
    pub fn interpret_byte(&mut self, byte: u8) {
        if self.parsing_escape_code {
            let result = self.escape_parser.eat_byte(byte);

            if byte != 0 {
                self.last_escape_seq.push(byte);
            }

            match result {
                EatResult::Accept | EatResult::AcceptButLastByteIsExtra => {
                    let parsed = self.escape_parser.result();
                    self.dispatch_escape(parsed);
                    self.parsing_escape_code = false;

                    if result == EatResult::AcceptButLastByteIsExtra {
                        self.interpret_byte(byte);
                    }
                }
                EatResult::Error => {
                    self.report_unparsed_sequence();
                    self.parsing_escape_code = false;
                }
                EatResult::None => {}
            }
        } else if byte == 0x1b {
            self.parsing_escape_code = true;
            self.last_escape_seq.clear();
        } else if byte == b'\n' || byte == 0x0c || byte == 0x0b {
            self.line_feed();
        } else if byte == b'\r' {
            self.carriage_return();
        } else if byte == b'\t' {
            self.cursor_x = (self.cursor_x + 4).min(self.current_buffer().width());
        } else if byte == 0x08 {
            self.go_back_x();
        } else if byte == 0x07 {
            log::debug!("BEL not handled");
        } else if byte == 0x0f {
            // SI: single-charset terminal, nothing to shift.
        } else if let Some(codepoint) = self.utf8_parser.feed(byte) {
            self.print_codepoint(codepoint);
        }
    }

    fn print_codepoint(&mut self, codepoint: u32) {
        // A space must not stomp the continuation cells of a wide glyph.
        let mut dont_overwrite_with_space = false;
        if codepoint == b' ' as u32 {
            if let Some(prev_x) = self.cursor_x.checked_sub(1) {
                if let Some(cell) = self.current_buffer().get(prev_x, self.cursor_y, false) {
                    if cell.cell.segment_count > 1
                        && cell.cell.segment_index != cell.cell.segment_count - 1
                    {
                        dont_overwrite_with_space = true;
                    }
                }
            }
        }

        let segments = if codepoint < 256 {
            1
        } else {
            self.font.width_in_cells(codepoint)
        };

        if self.cursor_x >= self.scroll_area.right {
            if self.forward_wraparound {
                self.carriage_return();
                self.line_feed();
            } else {
                self.cursor_x = self.scroll_area.right - 1;
            }
        }

        if !dont_overwrite_with_space {
            for i in 0..segments {
                self.set_cell_at(
                    self.cursor_x + i,
                    self.cursor_y,
                    Cell::new(codepoint, CellFlags::empty(), i as u16, segments as u16),
                );
            }
        }

        self.go_forward_x();
    }

    // ===== input from the window system =====

    pub fn handle_key_input(&mut self, key: Key, pressed: bool, mods: Modifiers) {
        if !pressed {
            return;
        }
        let bytes = keyboard::encode_key(key, mods, self.lnm_flag);
        if !bytes.is_empty() {
            self.write_to_pty(&bytes);
        }
    }

    pub fn handle_char_input(&mut self, codepoint: char) {
        if self.is_user_scrolled_up() {
            self.try_reset_user_scroll();
        }
        let bytes = keyboard::encode_char(codepoint);
        self.write_to_pty(&bytes);
    }

    pub fn handle_mouse_scroll(&mut self, offset_x: f64, offset_y: f64) {
        let scroll_unit = self.font.cell_height_px() as i32 * 2;

        let scroll_px = offset_y.round() as i32;
        if scroll_px < 0 {
            self.try_scroll_buffer_down((-scroll_px * scroll_unit) as u32);
        } else {
            self.try_scroll_buffer_up((scroll_px * scroll_unit) as u32);
        }

        if self.mouse_mode >= MouseTrackingMode::OnlyButtonEvents {
            let (mods, x, y) = (self.mouse_mods, self.mouse_pos_x, self.mouse_pos_y);
            let oy = offset_y as i32;
            if oy != 0 {
                self.report_mouse_event(if oy > 0 { 5 } else { 6 }, true, false, mods, x, y);
            }
            let ox = offset_x as i32;
            if ox != 0 {
                self.report_mouse_event(if ox > 0 { 7 } else { 8 }, true, false, mods, x, y);
            }
        }
    }

    pub fn handle_mouse_pos(&mut self, x: f64, y: f64) {
        if x < 0.0 || y < 0.0 {
            return;
        }

        self.mouse_pos_x = x as u32;
        self.mouse_pos_y = y as u32;

        if (self.mouse_mode == MouseTrackingMode::MotionEventsIfMouseDown && self.mouse_down)
            || self.mouse_mode == MouseTrackingMode::AllEvents
        {
            let (btn, down, mods) = (self.mouse_btn, self.mouse_down, self.mouse_mods);
            let (px, py) = (self.mouse_pos_x, self.mouse_pos_y);
            self.report_mouse_event(btn, down, true, mods, px, py);
        }
    }

    pub fn handle_mouse_button(&mut self, button: MouseButton, pressed: bool, mods: Modifiers) {
        if self.mouse_mode < MouseTrackingMode::OnlyButtonEvents {
            return;
        }

        let btn = match button {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        };

        self.mouse_mods = mods;
        self.mouse_btn = btn;
        self.mouse_down = pressed;

        let (px, py) = (self.mouse_pos_x, self.mouse_pos_y);
        self.report_mouse_event(btn, pressed, false, mods, px, py);
    }

    /// Encodes and queues one mouse report in the active tracking format.
    pub fn report_mouse_event(
        &mut self,
        btn: u32,
        is_down: bool,
        is_motion: bool,
        mods: Modifiers,
        x_px: u32,
        y_px: u32,
    ) {
        if self.mouse_tracking_format == MouseTrackingFormat::X10Compat && btn == 0 {
            return;
        }

        let mut encoded: u8;

        if (self.mouse_tracking_format == MouseTrackingFormat::Normal
            || self.mouse_tracking_format == MouseTrackingFormat::X10Compat)
            && !is_down
        {
            encoded = 3;
        } else {
            encoded = (btn as u8).wrapping_sub(1);

            match btn {
                4..=7 => {
                    encoded = encoded.wrapping_sub(4);
                    encoded |= 1 << 6;
                }
                8..=11 => {
                    encoded = encoded.wrapping_sub(8);
                    encoded |= 1 << 7;
                }
                _ => {}
            }
        }

        if mods.contains(Modifiers::SHIFT) {
            encoded |= 1 << 2;
        }
        if mods.contains(Modifiers::SUPER) {
            encoded |= 1 << 3;
        }
        if mods.contains(Modifiers::CONTROL) {
            encoded |= 1 << 4;
        }

        match self.mouse_tracking_format {
            MouseTrackingFormat::Normal | MouseTrackingFormat::X10Compat => {
                let col = x_px / self.font.cell_width_px();
                let row = y_px / self.font.cell_height_px();

                let add_bit_5 = self.mouse_tracking_format == MouseTrackingFormat::X10Compat
                    || is_motion
                    || self.mouse_mode <= MouseTrackingMode::OnlyButtonEvents;

                let report = [
                    0x1b,
                    b'[',
                    b'M',
                    encoded.wrapping_add(32 * add_bit_5 as u8),
                    (32 + col + 1).min(255) as u8,
                    (32 + row + 1).min(255) as u8,
                ];
                self.write_to_pty(&report);
            }
            MouseTrackingFormat::Sgr | MouseTrackingFormat::SgrPixels => {
                let (mut x, mut y) = (x_px, y_px);
                if self.mouse_tracking_format == MouseTrackingFormat::Sgr {
                    x /= self.font.cell_width_px();
                    y /= self.font.cell_height_px();
                }

                if is_motion {
                    encoded = encoded.wrapping_add(32);
                }

                let report = format!(
                    "\x1b[<{};{};{};{}",
                    encoded,
                    x + 1,
                    y + 1,
                    if is_down { 'M' } else { 'm' }
                );
                self.write_to_pty(report.as_bytes());
            }
            _ => {}
        }
    }
}

/// The numeric argument of a `CSI Pn X` sequence, defaulted and clamped.
fn cursor_offset(tokens: &[Token]) -> u32 {
    match tokens {
        [_, Token::Number(n), _] => (*n).clamp(1, 9999),
        _ => 1,
    }
}
