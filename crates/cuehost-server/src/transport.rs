//! Line transport on the controller's stdio.

use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use cuehost_isolation::stdio::write_line;

use crate::protocol::Outgoing;

/// One non-blank input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    /// Not UTF-8; answered with a `ParseError`
    Invalid(String),
}

/// Splits input on `\n`, tolerating `\r\n` and skipping blank lines.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: BufRead> LineReader<R> {
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.inner.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }

            while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                self.buf.pop();
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Some(Ok(match String::from_utf8(std::mem::take(&mut self.buf)) {
                Ok(text) => Line::Text(text),
                Err(e) => Line::Invalid(e.utf8_error().to_string()),
            }));
        }
    }
}

/// Read lines on a dedicated thread. The channel disconnects at EOF.
pub fn spawn_reader<R>(input: R) -> io::Result<Receiver<io::Result<Line>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in LineReader::new(input) {
                let stop = line.is_err();
                if tx.send(line).is_err() || stop {
                    break;
                }
            }
            tracing::debug!("Input closed");
        })?;
    Ok(rx)
}

/// Serialize outgoing messages on a dedicated thread, one flushed line
/// each. Write failures mean the controller is gone and are reported on
/// `fatal`. The thread exits once every sender is dropped.
pub fn spawn_writer<W>(
    mut output: W,
    messages: Receiver<Outgoing>,
    fatal: Sender<String>,
) -> io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("stdout-writer".to_string())
        .spawn(move || {
            for message in messages {
                if let Err(e) = write_line(&mut output, &message) {
                    tracing::error!("Failed to write to controller: {e}");
                    let _ = fatal.send(format!("output write failed: {e}"));
                    break;
                }
            }
        })
}
