/// Bounded stream capture
///
/// Each child stream gets its own reader thread. The reader keeps the first
/// `cap` bytes and keeps draining (and counting) past the cap, so a chatty
/// child never blocks on a full pipe.
use crate::config::types::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const READ_CHUNK: usize = 8 * 1024;

/// Appended after truncated output
pub fn truncation_marker(omitted: u64) -> String {
    format!("\n...[truncated {} bytes]", omitted)
}

/// Final view of one captured stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Captured text, with a truncation marker when anything was dropped
    pub text: String,
    /// Bytes the child wrote to the stream
    pub total_bytes: u64,
    pub truncated: bool,
    /// False when the reader had not reached EOF by the drain deadline
    pub complete: bool,
}

#[derive(Default)]
struct CaptureBuffer {
    data: Vec<u8>,
    total: u64,
}

/// A reader thread draining one stream into a bounded buffer
pub struct StreamCapture {
    name: &'static str,
    cap: usize,
    buffer: Arc<Mutex<CaptureBuffer>>,
    done_rx: Receiver<()>,
}

impl StreamCapture {
    pub fn spawn<R>(name: &'static str, mut stream: R, cap: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let (done_tx, done_rx) = bounded(1);
        let shared = Arc::clone(&buffer);

        thread::Builder::new()
            .name(format!("execbox-{}", name))
            .spawn(move || {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut buf = match shared.lock() {
                                Ok(buf) => buf,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            let room = cap.saturating_sub(buf.data.len());
                            let keep = room.min(n);
                            buf.data.extend_from_slice(&chunk[..keep]);
                            buf.total += n as u64;
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::debug!("{} reader stopped: {}", name, e);
                            break;
                        }
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| EngineError::Spawn(format!("Failed to start {} reader: {}", name, e)))?;

        Ok(Self {
            name,
            cap,
            buffer,
            done_rx,
        })
    }

    /// Wait up to `timeout` for EOF, then render whatever was captured.
    pub fn finish(self, timeout: Duration) -> CapturedOutput {
        let complete = match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} still open after {:?}; keeping partial output",
                    self.name,
                    timeout
                );
                false
            }
        };

        let buf = match self.buffer.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut output = render(&buf.data, buf.total, self.cap);
        output.complete = complete;
        if !complete && !output.truncated {
            output.truncated = true;
            output.text.push_str("\n...[output incomplete]");
        }
        output
    }
}

/// Turn captured bytes into text, adding the truncation marker when the
/// stream produced more than `cap` bytes.
///
/// Bytes that are not valid UTF-8 (including a sequence cut by the cap) are
/// written as one `?` each, so the text before the marker is never longer
/// than `cap` bytes and a truncated stream always keeps exactly `cap`.
pub fn render(data: &[u8], total: u64, cap: usize) -> CapturedOutput {
    let truncated = total > data.len() as u64 || data.len() > cap;
    let kept = if truncated {
        &data[..data.len().min(cap)]
    } else {
        data
    };

    let mut text = decode_bounded(kept);
    if truncated {
        text.push_str(&truncation_marker(total.saturating_sub(kept.len() as u64)));
    }

    CapturedOutput {
        text,
        total_bytes: total,
        truncated,
        complete: true,
    }
}

/// Decode UTF-8 without growing: each invalid byte becomes a single `?`.
fn decode_bounded(mut bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    while !bytes.is_empty() {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                text.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                // the first valid_up_to() bytes always decode
                text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(rest.len());
                text.extend(std::iter::repeat('?').take(bad));
                bytes = &rest[bad..];
            }
        }
    }
    text
}
