//! Syslog output for the tracing subscriber.
//!
//! With `--syslog` the daemon's log lines go to syslog(3) instead of
//! stderr, which matters once the process daemonizes and stderr points at
//! /dev/null.

use std::io;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Register the syslog identity. Call once at startup, before the first
/// log line.
pub fn open(identity: &'static std::ffi::CStr) {
    unsafe { libc::openlog(identity.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
}

/// `MakeWriter` that emits each formatted log line as one syslog record.
#[derive(Debug, Default)]
pub struct SyslogMakeWriter;

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let priority = match *meta.level() {
            Level::ERROR => libc::LOG_ERR,
            Level::WARN => libc::LOG_WARNING,
            Level::INFO => libc::LOG_INFO,
            Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
        };
        SyslogLine::new(priority)
    }
}

/// One buffered log line, shipped on flush/drop.
#[derive(Debug)]
pub struct SyslogLine {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl SyslogLine {
    fn new(priority: libc::c_int) -> SyslogLine {
        SyslogLine {
            priority,
            buf: Vec::new(),
        }
    }

    fn send(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        // Strip the trailing newline the formatter appends; syslog frames
        // records itself.
        while self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if let Ok(line) = std::ffi::CString::new(std::mem::take(&mut self.buf)) {
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), line.as_ptr()) };
        }
    }
}

impl io::Write for SyslogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send();
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        self.send();
    }
}
