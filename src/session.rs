//! Terminal session management.
//!
//! A session owns the PTY, the terminal state machine, and the reader
//! thread that pumps shell output into the event queue. The main thread
//! drains the queue and routes events back through the session, which
//! keeps the PTY and the grid in sync.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use thiserror::Error;

use crate::config::Config;
use crate::events::{Event, EventQueue};
use crate::font::FontMetrics;
use crate::pty::{Pty, PtyError};
use crate::terminal::Terminal;

/// One poll()-loop read per wakeup, into a fresh buffer of this size.
const READ_CHUNK_SIZE: usize = 16384;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
    #[error("Failed to create eventfd: {0}")]
    Eventfd(#[source] rustix::io::Errno),
}

/// A shell session: PTY, terminal state, reader thread.
pub struct Session {
    id: i32,
    pty: Arc<Pty>,
    terminal: Terminal,
    cancel_fd: Arc<OwnedFd>,
    reader: Option<JoinHandle<()>>,
    font: FontMetrics,
}

impl Session {
    /// Spawns the configured shell on a fresh PTY sized to `cols` x `rows`
    /// and starts the reader thread.
    pub fn new(
        config: &Config,
        font: FontMetrics,
        cols: u32,
        rows: u32,
        events: Arc<EventQueue>,
    ) -> Result<Self, SessionError> {
        let pty = Arc::new(Pty::spawn(&config.shell_path())?);
        pty.resize(cols as u16, rows as u16)?;

        let id = pty.master_raw_fd();

        let cancel_fd = Arc::new(
            eventfd(0, EventfdFlags::CLOEXEC).map_err(SessionError::Eventfd)?,
        );

        let reader = {
            let pty = Arc::clone(&pty);
            let cancel_fd = Arc::clone(&cancel_fd);
            std::thread::spawn(move || reader_loop(pty, cancel_fd, events, id))
        };

        log::info!("spawned shell session {id} at {cols}x{rows}");

        Ok(Self {
            id,
            pty,
            terminal: Terminal::new(cols, rows, font),
            cancel_fd,
            reader: Some(reader),
            font,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn terminal_mut(&mut self) -> &mut Terminal {
        &mut self.terminal
    }

    /// Routes one event through the terminal and flushes any bytes it owes
    /// the shell.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::DataFromTty { terminal_id, bytes } => {
                if terminal_id == self.id {
                    self.terminal.interpret_bytes(&bytes);
                }
            }
            Event::KeyInput {
                key,
                pressed,
                mods,
            } => self.terminal.handle_key_input(key, pressed, mods),
            Event::CharInput { codepoint } => self.terminal.handle_char_input(codepoint),
            Event::MouseScroll { offset_x, offset_y } => {
                self.terminal.handle_mouse_scroll(offset_x, offset_y)
            }
            Event::MousePos { x, y } => self.terminal.handle_mouse_pos(x, y),
            Event::MouseButton {
                button,
                pressed,
                mods,
            } => self.terminal.handle_mouse_button(button, pressed, mods),
            Event::WindowResized { width, height } => {
                let cols = (width / self.font.cell_width_px()).max(1);
                let rows = (height / self.font.cell_height_px()).max(1);
                self.set_window_size(cols, rows);
            }
        }

        self.flush_responses();
    }

    /// Resizes grid and PTY together.
    pub fn set_window_size(&mut self, cols: u32, rows: u32) {
        self.terminal.set_window_size(cols, rows);
        if let Err(err) = self.pty.resize(cols as u16, rows as u16) {
            log::error!("failed to resize PTY: {err}");
        }
    }

    /// Writes pending terminal responses (mouse reports, key bytes) out.
    pub fn flush_responses(&mut self) {
        if let Some(bytes) = self.terminal.take_response() {
            self.write(&bytes);
        }
    }

    /// Writes raw bytes to the shell.
    pub fn write(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match self.pty.write(bytes) {
                Ok(0) => break,
                Ok(n) => bytes = &bytes[n..],
                Err(err) => {
                    log::error!("PTY write failed: {err}");
                    break;
                }
            }
        }
    }

    /// Applies a reloaded config (and the metrics derived from it).
    pub fn on_config_change(&mut self, config: &Config, font: FontMetrics) {
        self.font = font;
        self.terminal.on_config_change(config, font);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Wake the reader through the eventfd, then join it. The PTY master
        // closes when the last Arc drops; the child exits on its own.
        let value = 1u64.to_ne_bytes();
        if let Err(err) = rustix::io::write(self.cancel_fd.as_fd(), &value) {
            log::error!("failed to signal reader thread: {err}");
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Blocks on the PTY master and the cancellation eventfd; forwards shell
/// output to the event queue until cancelled or the stream dies.
fn reader_loop(pty: Arc<Pty>, cancel_fd: Arc<OwnedFd>, events: Arc<EventQueue>, id: i32) {
    let master = pty.master_fd();

    loop {
        let mut fds = [
            PollFd::new(&master, PollFlags::IN),
            PollFd::new(&cancel_fd, PollFlags::IN),
        ];

        if let Err(err) = poll(&mut fds, -1) {
            log::error!("poll failed in PTY reader: {err}");
            break;
        }

        if fds[1].revents().contains(PollFlags::IN) {
            break;
        }

        let revents = fds[0].revents();

        if revents.contains(PollFlags::IN) {
            let mut bytes = vec![0u8; READ_CHUNK_SIZE];
            match pty.read(&mut bytes) {
                Ok(0) => {}
                Ok(count) => {
                    bytes.truncate(count);
                    events.enqueue(Event::DataFromTty {
                        terminal_id: id,
                        bytes,
                    });
                    continue;
                }
                Err(err) => {
                    log::error!("PTY read failed: {err}");
                    break;
                }
            }
        }

        // The shell exited and the slave side is gone.
        if revents.intersects(PollFlags::HUP | PollFlags::ERR) {
            log::info!("PTY closed for session {id}");
            break;
        }
    }
}
