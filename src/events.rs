//! Input fan-in: every producer (windowing callbacks, the PTY reader
//! thread) enqueues onto one queue; the main thread drains it between
//! renders.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use bitflags::bitflags;

use crate::keyboard::Key;

bitflags! {
    /// Keyboard modifier state attached to key and mouse events.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u32 {
        const SHIFT = 1;
        const CONTROL = 1 << 1;
        const ALT = 1 << 2;
        const SUPER = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

/// Everything the main loop reacts to.
#[derive(Debug)]
pub enum Event {
    MouseScroll {
        offset_x: f64,
        offset_y: f64,
    },
    MouseButton {
        button: MouseButton,
        pressed: bool,
        mods: Modifiers,
    },
    MousePos {
        x: f64,
        y: f64,
    },
    KeyInput {
        key: Key,
        pressed: bool,
        mods: Modifiers,
    },
    CharInput {
        codepoint: char,
    },
    WindowResized {
        width: u32,
        height: u32,
    },
    /// Bytes the shell wrote, delivered by the PTY reader thread.
    DataFromTty {
        terminal_id: i32,
        bytes: Vec<u8>,
    },
}

/// Multi-producer single-consumer event queue.
///
/// `enqueue` appends under the lock; `process` swaps the queue out and
/// drains it without holding the lock, so producers are never blocked by
/// event handlers.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    available: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(event);
        self.available.notify_one();
    }

    /// Blocks until at least one event is queued.
    pub fn wait(&self) {
        let mut queue = self.queue.lock().unwrap();
        while queue.is_empty() {
            queue = self.available.wait(queue).unwrap();
        }
    }

    /// Drains every queued event through `func`, in enqueue order.
    pub fn process<F: FnMut(Event)>(&self, mut func: F) {
        let mut read_queue = VecDeque::new();
        {
            let mut queue = self.queue.lock().unwrap();
            std::mem::swap(&mut read_queue, &mut queue);
        }

        for event in read_queue {
            func(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn preserves_enqueue_order() {
        let queue = EventQueue::new();
        queue.enqueue(Event::CharInput { codepoint: 'a' });
        queue.enqueue(Event::CharInput { codepoint: 'b' });
        queue.enqueue(Event::WindowResized {
            width: 640,
            height: 480,
        });

        let mut seen = Vec::new();
        queue.process(|event| {
            seen.push(match event {
                Event::CharInput { codepoint } => codepoint,
                Event::WindowResized { .. } => 'R',
                _ => '?',
            })
        });
        assert_eq!(seen, vec!['a', 'b', 'R']);

        let mut drained = 0;
        queue.process(|_| drained += 1);
        assert_eq!(drained, 0);
    }

    #[test]
    fn wakes_a_waiting_consumer() {
        let queue = Arc::new(EventQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.enqueue(Event::DataFromTty {
                    terminal_id: 1,
                    bytes: b"ok".to_vec(),
                });
            })
        };

        queue.wait();
        let mut got = None;
        queue.process(|event| {
            if let Event::DataFromTty { bytes, .. } = event {
                got = Some(bytes);
            }
        });
        assert_eq!(got.as_deref(), Some(&b"ok"[..]));
        producer.join().unwrap();
    }

    #[test]
    fn cross_thread_enqueue_keeps_per_producer_order() {
        let queue = Arc::new(EventQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..32 {
                        queue.enqueue(Event::DataFromTty {
                            terminal_id: t,
                            bytes: vec![i],
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last_seen = [None::<u8>; 4];
        let mut total = 0;
        queue.process(|event| {
            if let Event::DataFromTty { terminal_id, bytes } = event {
                let slot = &mut last_seen[terminal_id as usize];
                assert!(slot.map_or(true, |prev| prev < bytes[0]));
                *slot = Some(bytes[0]);
                total += 1;
            }
        });
        assert_eq!(total, 128);
    }
}
