//! Serial line access for the modem.
//!
//! Opens the device with raw termios (8N1, no flow control) and splits it
//! into a writer half and a line-oriented reader half. The reader blocks in
//! `poll(2)` on the serial fd *and* a wake pipe, so shutdown never leaves a
//! thread stuck in a read: [`WakeHandle::wake`] makes the next
//! [`SerialReader::next_event`] return [`SerialEvent::Wake`].
//!
//! Besides complete lines, the reader surfaces the modem's bare `> ` payload
//! prompt (which never gets a line terminator) as its own event.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;

/// Longest line accepted before it is forcibly terminated.
const MAX_LINE: usize = 4096;

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Errors from opening or configuring the serial device.
#[derive(Debug)]
pub enum SerialError {
    /// The device could not be opened.
    Open(String, Errno),
    /// termios configuration failed.
    Termios(Errno),
    /// The configured baud rate has no termios constant.
    UnsupportedBaud(u32),
    /// The wake pipe could not be created.
    WakePipe(Errno),
}

impl std::fmt::Display for SerialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialError::Open(dev, e) => write!(f, "open {dev}: {e}"),
            SerialError::Termios(e) => write!(f, "termios: {e}"),
            SerialError::UnsupportedBaud(b) => write!(f, "unsupported baud rate {b}"),
            SerialError::WakePipe(e) => write!(f, "wake pipe: {e}"),
        }
    }
}

/// Map a numeric baud rate to its termios constant.
pub fn baud_rate(baud: u32) -> Option<BaudRate> {
    match baud {
        1200 => Some(BaudRate::B1200),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115_200 => Some(BaudRate::B115200),
        230_400 => Some(BaudRate::B230400),
        _ => None,
    }
}

/// Open `device` and return the reader half, writer half, and wake handle.
pub fn open(device: &str, baud: u32) -> Result<(SerialReader, SerialWriter, WakeHandle), SerialError> {
    let rate = baud_rate(baud).ok_or(SerialError::UnsupportedBaud(baud))?;

    let fd = fcntl::open(
        device,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| SerialError::Open(device.to_string(), e))?;

    // Clear O_NONBLOCK now that we have the fd — reads block in poll(2), not
    // in read(2), so the fd itself can be blocking.
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(SerialError::Termios)?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags)).map_err(SerialError::Termios)?;

    configure_termios(fd, rate)?;

    // Flush any stale data
    // SAFETY: fd is valid — we just opened it
    unsafe {
        termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
            .map_err(SerialError::Termios)?;
    }

    let (wake_rx, wake_tx) = unistd::pipe().map_err(SerialError::WakePipe)?;

    Ok((
        SerialReader {
            fd,
            wake_rx,
            buffer: LineBuffer::new(),
        },
        SerialWriter { fd },
        WakeHandle {
            tx: Arc::new(wake_tx),
        },
    ))
}

/// Configure termios: raw mode, 8N1, no flow control, blocking reads.
fn configure_termios(fd: RawFd, rate: BaudRate) -> Result<(), SerialError> {
    // SAFETY: fd is valid — caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed).map_err(SerialError::Termios)?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, rate).map_err(SerialError::Termios)?;
    termios::cfsetospeed(&mut tio, rate).map_err(SerialError::Termios)?;

    // 8N1, CLOCAL (ignore modem control), CREAD (enable receiver)
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // VMIN=1, VTIME=0 — a read after poll(2) says readable returns data
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(SerialError::Termios)
}

/// What the reader half produced.
#[derive(Debug, PartialEq, Eq)]
pub enum SerialEvent {
    /// A complete input line, trailing whitespace stripped. May be empty
    /// (modems separate responses with blank lines).
    Line(String),
    /// The bare `>` payload prompt.
    Prompt,
    /// [`WakeHandle::wake`] was called; the caller should check its abort
    /// flag and come back.
    Wake,
}

/// Blocking line-oriented reader over the serial fd.
pub struct SerialReader {
    fd: RawFd,
    wake_rx: OwnedFd,
    buffer: LineBuffer,
}

impl SerialReader {
    /// Block until a line, a prompt, or a wake-up arrives.
    ///
    /// # Errors
    ///
    /// I/O errors from `poll(2)`/`read(2)`, or `UnexpectedEof` when the
    /// device hangs up.
    pub fn next_event(&mut self) -> std::io::Result<SerialEvent> {
        loop {
            if let Some(line) = self.buffer.take_line() {
                return Ok(SerialEvent::Line(line));
            }
            if self.buffer.take_prompt() {
                return Ok(SerialEvent::Prompt);
            }

            // SAFETY: both fds are open for the lifetime of self
            let serial = unsafe { borrow_fd(self.fd) };
            let wake = unsafe { borrow_fd(self.wake_rx.as_raw_fd()) };
            let mut fds = [
                PollFd::new(serial, PollFlags::POLLIN),
                PollFd::new(wake, PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                let mut byte = [0u8; 16];
                let _ = unistd::read(self.wake_rx.as_raw_fd(), &mut byte);
                return Ok(SerialEvent::Wake);
            }

            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                let mut chunk = [0u8; 512];
                match unistd::read(self.fd, &mut chunk) {
                    Ok(0) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "serial device closed",
                        ))
                    }
                    Ok(n) => self.buffer.push_bytes(&chunk[..n]),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// Blocking writer over the serial fd.
pub struct SerialWriter {
    fd: RawFd,
}

impl SerialWriter {
    /// Write the whole buffer, retrying short writes.
    pub fn write_all(&mut self, mut bytes: &[u8]) -> std::io::Result<()> {
        // SAFETY: fd is open for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        while !bytes.is_empty() {
            match unistd::write(bfd, bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Block until the output has been transmitted.
    pub fn flush(&mut self) -> std::io::Result<()> {
        // SAFETY: fd is open for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcdrain(bfd).map_err(std::io::Error::from)
    }
}

/// Cloneable handle that unblocks the reader.
#[derive(Clone)]
pub struct WakeHandle {
    tx: Arc<OwnedFd>,
}

impl WakeHandle {
    pub fn wake(&self) {
        // SAFETY: the pipe write end is open for the lifetime of self
        let bfd = unsafe { borrow_fd(self.tx.as_raw_fd()) };
        let _ = unistd::write(bfd, b"w");
    }
}

/// Accumulates raw serial bytes and carves out lines and prompt events.
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next `\n`-terminated line, trailing whitespace stripped.
    /// An overlong unterminated line is forced out whole.
    fn take_line(&mut self) -> Option<String> {
        let end = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.buf.len() > MAX_LINE => self.buf.len(),
            None => return None,
        };
        let line: Vec<u8> = self.buf.drain(..end).collect();
        let text = String::from_utf8_lossy(&line);
        Some(text.trim_end().to_string())
    }

    /// True when the pending (unterminated) input is exactly the modem's
    /// payload prompt; the prompt is consumed.
    fn take_prompt(&mut self) -> bool {
        let pending: &[u8] = &self.buf;
        let trimmed: Vec<u8> = pending
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        if trimmed == b">" || trimmed == b"> " {
            self.buf.clear();
            return true;
        }
        false
    }
}
