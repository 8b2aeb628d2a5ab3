//! Output handlers: transform command stdout/stderr lines into tracing
//! events and/or a bounded tail buffer. Mirrors the `Handler` trait the
//! teacher's command layer streams nix/ssh output through.

use std::collections::VecDeque;

use tracing::info;

pub trait Handler: Send {
    fn handle_line(&mut self, line: &str);
}

/// Forwards every line straight to `tracing`, at `target: "remote"` so it's
/// trivially filterable from the operator's own log lines.
pub struct PlainHandler;
impl Handler for PlainHandler {
    fn handle_line(&mut self, line: &str) {
        info!(target: "remote", "{line}");
    }
}

/// Drops everything. Used when a caller only cares about the exit code.
pub struct NoopHandler;
impl Handler for NoopHandler {
    fn handle_line(&mut self, _line: &str) {}
}

/// Fixed-capacity tail of the last `cap` bytes of combined output, retained
/// for surfacing in NixosConfiguration status / events on failure (spec
/// §4.8, §7 "Tail of applier output"). Lines beyond the cap are dropped from
/// the front, oldest first.
pub struct RingBuffer {
    cap: usize,
    buf: VecDeque<u8>,
}

impl RingBuffer {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            cap: cap_bytes,
            buf: VecDeque::with_capacity(cap_bytes.min(64 * 1024)),
        }
    }

    pub fn push_line(&mut self, line: &str) {
        for &b in line.as_bytes() {
            self.buf.push_back(b);
        }
        self.buf.push_back(b'\n');
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

/// Streams every line to an inner handler while also retaining a bounded
/// tail, so a single pass over the child's output both drives live logging
/// and produces the diagnostic tail spec §7 requires on terminal failures.
pub struct TeeHandler<'a> {
    inner: &'a mut dyn Handler,
    tail: RingBuffer,
}

impl<'a> TeeHandler<'a> {
    pub fn new(inner: &'a mut dyn Handler, tail_cap_bytes: usize) -> Self {
        Self {
            inner,
            tail: RingBuffer::new(tail_cap_bytes),
        }
    }

    pub fn into_tail(self) -> String {
        self.tail.as_string()
    }
}

impl Handler for TeeHandler<'_> {
    fn handle_line(&mut self, line: &str) {
        self.tail.push_line(line);
        self.inner.handle_line(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_bytes_past_capacity() {
        let mut rb = RingBuffer::new(10);
        rb.push_line("abcdef");
        rb.push_line("ghij");
        let s = rb.as_string();
        assert!(s.len() <= 10);
        assert!(s.ends_with("ghij\n"));
    }

    #[test]
    fn tee_handler_forwards_and_records() {
        struct Collector(Vec<String>);
        impl Handler for Collector {
            fn handle_line(&mut self, line: &str) {
                self.0.push(line.to_owned());
            }
        }
        let mut collector = Collector(Vec::new());
        {
            let mut tee = TeeHandler::new(&mut collector, 1024);
            tee.handle_line("hello");
            tee.handle_line("world");
            assert_eq!(tee.into_tail(), "hello\nworld\n");
        }
        assert_eq!(collector.0, vec!["hello".to_string(), "world".to_string()]);
    }
}
