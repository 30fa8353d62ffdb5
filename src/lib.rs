//! bitty - a terminal emulator core.
//!
//! Hosts a shell over a PTY, interprets its byte stream (UTF-8 text plus
//! ANSI/DEC/xterm control sequences), and maintains a grid of styled cells
//! with scrollback for a rendering layer to read. Rendering, font
//! rasterization, and windowing live outside this crate; they talk to the
//! core through [`cell_buffer::CellBuffer`], [`events::EventQueue`], and
//! [`font::FontMetrics`].

pub mod cell;
pub mod cell_buffer;
pub mod color;
pub mod config;
pub mod escape;
pub mod events;
pub mod font;
pub mod geometry;
pub mod keyboard;
pub mod pty;
pub mod session;
pub mod terminal;
pub mod utf8;
