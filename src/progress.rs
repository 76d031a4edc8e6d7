use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use terminal_size::{terminal_size, Width};

/// Hook polled between the units of a batch operation
pub trait Progress {
    fn start(&mut self, total: usize);
    fn increment(&mut self);
    fn was_canceled(&self) -> bool;
}

/// Never reports, never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _total: usize) {}

    fn increment(&mut self) {}

    fn was_canceled(&self) -> bool {
        false
    }
}

/// Rewrites a single status line on stdout. Cancel through the shared flag
/// from another thread or a signal handler.
#[derive(Debug, Clone)]
pub struct TerminalProgress {
    label: String,
    total: usize,
    done: usize,
    cancel: Arc<AtomicBool>,
    last_msg_len: usize,
}

impl TerminalProgress {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            total: 0,
            done: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            last_msg_len: 0,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn print_status(&mut self) {
        let output = format!("{}: {}/{}", self.label, self.done, self.total);

        let terminal_width = match terminal_size() {
            Some((Width(w), _)) => w as usize,
            None => 80,
        };

        let prev_lines = (self.last_msg_len + terminal_width - 1) / terminal_width;

        let mut stdout = io::stdout();
        if self.last_msg_len > 0 {
            for _ in 0..prev_lines {
                print!("\x1B[1A"); // Move up one line
                print!("\x1B[2K"); // Clear the line
            }
            print!("\r");
        }

        println!("{}", output);
        // A failed flush only delays the status line
        let _ = stdout.flush();

        self.last_msg_len = output.len();
    }
}

impl Progress for TerminalProgress {
    fn start(&mut self, total: usize) {
        self.total = total;
        self.done = 0;
        self.last_msg_len = 0;
        self.print_status();
    }

    fn increment(&mut self) {
        self.done += 1;
        self.print_status();
    }

    fn was_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}
