//! Protocol stdout for subprocesses that host plugin code.
//!
//! Plugins print to stdout freely. Before any plugin code runs, the worker
//! and probe keep a private duplicate of stdout for protocol lines and point
//! fd 1 at stderr, so stray prints land in the host's diagnostics instead of
//! corrupting the protocol.

use std::io::{self, Write};

/// Take stdout for protocol use and redirect fd 1 to stderr.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn protocol_stdout() -> io::Result<Box<dyn Write + Send>> {
    use std::os::fd::FromRawFd;

    io::stdout().flush()?;
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        let error = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(error);
    }
    // SAFETY: `fd` is a fresh duplicate owned by nobody else.
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    Ok(Box::new(io::LineWriter::new(file)))
}

#[cfg(not(unix))]
pub fn protocol_stdout() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(io::stdout()))
}

/// Write one JSON message as a line and flush it.
pub fn write_line<T: serde::Serialize>(out: &mut dyn Write, message: &T) -> io::Result<()> {
    let json = serde_json::to_string(message).map_err(io::Error::other)?;
    writeln!(out, "{json}")?;
    out.flush()
}
