/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The interactive console: copies bytes between the user's terminal and
//! one of the zone's PTY masters, with an escape prefix for switching
//! terminals and quitting.
//!
//! Escape handling: a bare `^]` (0x1d) quits; `^a` (0x01) arms escape
//! mode, where `q` quits, `n`/`p` switch to the next/previous terminal
//! and anything else falls through with no action.

use std::io::Write;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::pty::Winsize;
use nix::sys::epoll::EpollFlags;
use nix::sys::signal::SigHandler;
use nix::sys::signal::Signal;
use nix::sys::termios::tcgetattr;
use nix::sys::termios::tcsetattr;
use nix::sys::termios::cfmakeraw;
use nix::sys::termios::SetArg;
use nix::sys::termios::Termios;
use nix::unistd::isatty;
use nix::unistd::read;
use nix::unistd::write as fd_write;
use tracing::debug;
use zoned_ipc::EventLoop;
use zoned_ipc::SignalWatch;

use crate::Error;
use crate::Result;

const IO_BUFFER_SIZE: usize = 1024;

const ESCAPE_ARM: u8 = 0x01; // ^a
const ESCAPE_QUIT: u8 = 0x1d; // ^]

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuitReason {
    User,
    Err,
    Hup,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EscapeAction {
    /// Not an escape byte; forward it to the zone.
    Forward,
    /// Swallowed by the state machine, nothing else to do.
    Consumed,
    Quit,
    NextTerminal,
    PrevTerminal,
}

/// The escape-prefix state machine, separated out so it can be tested
/// without a terminal. Only single-byte reads are candidates: pasted or
/// batched input never triggers it.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    armed: bool,
}

impl EscapeFilter {
    pub fn feed(&mut self, key: u8) -> EscapeAction {
        if self.armed {
            self.armed = false;
            return match key {
                b'q' => EscapeAction::Quit,
                b'n' => EscapeAction::NextTerminal,
                b'p' => EscapeAction::PrevTerminal,
                _ => EscapeAction::Consumed,
            };
        }
        match key {
            ESCAPE_QUIT => EscapeAction::Quit,
            ESCAPE_ARM => {
                self.armed = true;
                EscapeAction::Consumed
            }
            _ => EscapeAction::Forward,
        }
    }
}

/// Fixed-size linear buffer between two descriptors. Bytes compact to
/// the front on partial writes, like the original's memmove scheme.
#[derive(Debug)]
pub struct IoBuffer {
    buf: [u8; IO_BUFFER_SIZE],
    len: usize,
}

impl Default for IoBuffer {
    fn default() -> Self {
        Self {
            buf: [0; IO_BUFFER_SIZE],
            len: 0,
        }
    }
}

impl IoBuffer {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn space(&self) -> usize {
        IO_BUFFER_SIZE - self.len
    }

    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    fn fill_from(&mut self, fd: RawFd) -> nix::Result<usize> {
        if self.space() == 0 {
            return Ok(0);
        }
        let start = self.len;
        let n = read(fd, &mut self.buf[start..])?;
        self.len += n;
        Ok(n)
    }

    fn drain_to(&mut self, fd: BorrowedFd) -> nix::Result<usize> {
        if self.len == 0 {
            return Ok(0);
        }
        let written = fd_write(fd, &self.buf[..self.len])?;
        self.buf.copy_within(written..self.len, 0);
        self.len -= written;
        Ok(written)
    }
}

/// Restores the saved termios when dropped, so every exit path - quit,
/// error, panic - leaves the user's terminal usable.
struct TermiosGuard {
    fd: RawFd,
    saved: Termios,
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        // Safety: the fd outlives the guard; it is the caller's stdin.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = tcsetattr(fd, SetArg::TCSAFLUSH, &self.saved);
    }
}

mod ioctls {
    use nix::pty::Winsize;
    nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
}

pub struct Console<'a, F>
where
    F: FnMut(usize, Winsize),
{
    masters: Vec<BorrowedFd<'a>>,
    current: usize,
    /// Called after each local resize so the guard can propagate it to
    /// the in-zone side.
    resize_notify: F,
    to_zone: IoBuffer,
    to_user: IoBuffer,
    escape: EscapeFilter,
    quit: Option<QuitReason>,
}

impl<'a, F> Console<'a, F>
where
    F: FnMut(usize, Winsize),
{
    pub fn new(masters: Vec<BorrowedFd<'a>>, terminal: usize, resize_notify: F) -> Result<Self> {
        if terminal >= masters.len() {
            return Err(Error::NoSuchTerminal {
                requested: terminal,
                count: masters.len(),
            });
        }
        Ok(Self {
            masters,
            current: terminal,
            resize_notify,
            to_zone: IoBuffer::default(),
            to_user: IoBuffer::default(),
            escape: EscapeFilter::default(),
            quit: None,
        })
    }

    fn current_fd(&self) -> BorrowedFd<'a> {
        self.masters[self.current]
    }

    /// Run until quit, binding stdin/stdout to the current PTY master.
    pub fn run(&mut self) -> Result<QuitReason> {
        let stdin = std::io::stdin().as_raw_fd();
        let stdout = std::io::stdout().as_raw_fd();
        // Safety: stdin/stdout stay open for the process lifetime.
        let stdin_fd = unsafe { BorrowedFd::borrow_raw(stdin) };
        let stdout_fd = unsafe { BorrowedFd::borrow_raw(stdout) };

        if !isatty(stdin).unwrap_or(false) || !isatty(stdout).unwrap_or(false) {
            return Err(Error::NotATty);
        }

        println!("Connected to the zone, escape character is ^] or ^a q.");
        println!(
            "Terminal number: {}, use ^a n/p to switch between them.",
            self.current
        );

        // Trap the usual fatal signals for the duration; the terminal
        // must be restored before anything kills us.
        let mut old_handlers = Vec::new();
        for sig in [
            Signal::SIGQUIT,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGPIPE,
        ] {
            // Safety: SigIgn installs no handler code.
            let old = unsafe { nix::sys::signal::signal(sig, SigHandler::SigIgn) }
                .map_err(Error::Termios)?;
            old_handlers.push((sig, old));
        }

        let saved = tcgetattr(stdin_fd).map_err(Error::Termios)?;
        let _guard = TermiosGuard { fd: stdin, saved: saved.clone() };
        let mut raw = saved;
        cfmakeraw(&mut raw);
        tcsetattr(stdin_fd, SetArg::TCSAFLUSH, &raw).map_err(Error::Termios)?;

        let mut winch = SignalWatch::new(&[Signal::SIGWINCH])?;
        self.resize(stdin_fd)?;

        let event_loop = EventLoop::new()?;
        event_loop.add(stdin_fd, EpollFlags::EPOLLIN)?;
        event_loop.add(stdout_fd, EpollFlags::empty())?;
        event_loop.add(self.current_fd(), EpollFlags::EPOLLIN)?;
        event_loop.add(winch.as_fd(), EpollFlags::EPOLLIN)?;

        while self.quit.is_none() {
            for ready in event_loop.wait(None)? {
                if ready.fd == winch.raw_fd() {
                    if winch.read()?.is_some() {
                        self.resize(stdin_fd)?;
                    }
                } else if ready.fd == stdin {
                    self.on_stdin(&event_loop, stdin_fd, ready.events)?;
                } else if ready.fd == stdout {
                    self.on_stdout(&event_loop, stdout_fd, ready.events)?;
                } else if ready.fd == self.current_fd().as_raw_fd() {
                    self.on_pty(&event_loop, stdout_fd, ready.events)?;
                }
            }
        }

        event_loop.remove(self.current_fd())?;
        event_loop.remove(stdin_fd)?;
        event_loop.remove(stdout_fd)?;
        winch.unblock()?;
        for (sig, old) in old_handlers {
            // Safety: restoring the previously observed disposition.
            let _ = unsafe { nix::sys::signal::signal(sig, old) };
        }

        let reason = self.quit.take().expect("loop exits only with a reason");
        match reason {
            QuitReason::User => println!("\r\nUser requested quit"),
            QuitReason::Err => println!("\r\nThere has been an error on the terminal, quitting"),
            QuitReason::Hup => println!("\r\nTerminal disconnected, quitting"),
        }
        let _ = std::io::stdout().flush();
        Ok(reason)
    }

    fn resize(&mut self, user_tty: BorrowedFd) -> Result<()> {
        let mut ws = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // Safety: valid fds and a properly sized Winsize.
        unsafe {
            ioctls::tiocgwinsz(user_tty.as_raw_fd(), &mut ws).map_err(Error::Ioctl)?;
            ioctls::tiocswinsz(self.current_fd().as_raw_fd(), &ws).map_err(Error::Ioctl)?;
        }
        (self.resize_notify)(self.current, ws);
        Ok(())
    }

    fn check_for_error(&mut self, events: EpollFlags) {
        if events.contains(EpollFlags::EPOLLHUP) {
            self.quit = Some(QuitReason::Hup);
        }
        if events.contains(EpollFlags::EPOLLERR) {
            self.quit = Some(QuitReason::Err);
        }
    }

    fn on_stdin(
        &mut self,
        event_loop: &EventLoop,
        stdin: BorrowedFd,
        events: EpollFlags,
    ) -> Result<()> {
        if events.contains(EpollFlags::EPOLLIN) {
            let mut chunk = [0u8; IO_BUFFER_SIZE];
            let space = self.to_zone.space().min(chunk.len());
            if space > 0 {
                match read(stdin.as_raw_fd(), &mut chunk[..space]) {
                    Ok(1) => {
                        match self.escape.feed(chunk[0]) {
                            EscapeAction::Forward => {
                                self.to_zone.push(&chunk[..1]);
                            }
                            EscapeAction::Consumed => {}
                            EscapeAction::Quit => {
                                self.quit = Some(QuitReason::User);
                                return Ok(());
                            }
                            EscapeAction::NextTerminal => {
                                return self.switch_terminal(event_loop, stdin, 1);
                            }
                            EscapeAction::PrevTerminal => {
                                return self.switch_terminal(event_loop, stdin, -1);
                            }
                        }
                    }
                    Ok(n) => {
                        self.to_zone.push(&chunk[..n]);
                    }
                    Err(Errno::EAGAIN) => {}
                    Err(e) => return Err(Error::Termios(e)),
                }
                if !self.to_zone.is_empty() {
                    event_loop.modify(
                        self.current_fd(),
                        EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT,
                    )?;
                }
            }
        }
        self.check_for_error(events);
        Ok(())
    }

    fn on_stdout(
        &mut self,
        event_loop: &EventLoop,
        stdout: BorrowedFd,
        events: EpollFlags,
    ) -> Result<()> {
        if events.contains(EpollFlags::EPOLLOUT) && !self.to_user.is_empty() {
            match self.to_user.drain_to(stdout) {
                Ok(_) => {
                    if self.to_user.is_empty() {
                        event_loop.modify(stdout, EpollFlags::empty())?;
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => return Err(Error::Termios(e)),
            }
        }
        self.check_for_error(events);
        Ok(())
    }

    fn on_pty(
        &mut self,
        event_loop: &EventLoop,
        stdout: BorrowedFd,
        events: EpollFlags,
    ) -> Result<()> {
        if events.contains(EpollFlags::EPOLLIN) {
            match self.to_user.fill_from(self.current_fd().as_raw_fd()) {
                Ok(n) if n > 0 => {
                    event_loop.modify(stdout, EpollFlags::EPOLLOUT)?;
                }
                Ok(_) => {}
                Err(Errno::EAGAIN) => {}
                Err(e) => return Err(Error::Termios(e)),
            }
        }
        if events.contains(EpollFlags::EPOLLOUT) && !self.to_zone.is_empty() {
            match self.to_zone.drain_to(self.current_fd()) {
                Ok(_) => {
                    if self.to_zone.is_empty() {
                        event_loop.modify(self.current_fd(), EpollFlags::EPOLLIN)?;
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => return Err(Error::Termios(e)),
            }
        }
        self.check_for_error(events);
        Ok(())
    }

    fn switch_terminal(
        &mut self,
        event_loop: &EventLoop,
        stdin: BorrowedFd,
        direction: isize,
    ) -> Result<()> {
        event_loop.remove(self.current_fd())?;
        let count = self.masters.len() as isize;
        self.current = ((self.current as isize + direction + count) % count) as usize;
        debug!("switched to terminal {}", self.current);

        let mut flags = EpollFlags::EPOLLIN;
        if !self.to_zone.is_empty() {
            flags |= EpollFlags::EPOLLOUT;
        }
        event_loop.add(self.current_fd(), flags)?;
        self.resize(stdin)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ctrl_bracket_quits() {
        let mut filter = EscapeFilter::default();
        assert_eq!(filter.feed(ESCAPE_QUIT), EscapeAction::Quit);
    }

    #[test]
    fn armed_escape_selects_action() {
        let mut filter = EscapeFilter::default();
        assert_eq!(filter.feed(ESCAPE_ARM), EscapeAction::Consumed);
        assert_eq!(filter.feed(b'q'), EscapeAction::Quit);

        assert_eq!(filter.feed(ESCAPE_ARM), EscapeAction::Consumed);
        assert_eq!(filter.feed(b'n'), EscapeAction::NextTerminal);

        assert_eq!(filter.feed(ESCAPE_ARM), EscapeAction::Consumed);
        assert_eq!(filter.feed(b'p'), EscapeAction::PrevTerminal);
    }

    #[test]
    fn unknown_escape_key_is_swallowed_once() {
        let mut filter = EscapeFilter::default();
        assert_eq!(filter.feed(ESCAPE_ARM), EscapeAction::Consumed);
        assert_eq!(filter.feed(b'x'), EscapeAction::Consumed);
        // Escape mode is left; the same byte now forwards.
        assert_eq!(filter.feed(b'x'), EscapeAction::Forward);
    }

    #[test]
    fn plain_bytes_forward() {
        let mut filter = EscapeFilter::default();
        assert_eq!(filter.feed(b'l'), EscapeAction::Forward);
        assert_eq!(filter.feed(b's'), EscapeAction::Forward);
    }

    #[test]
    fn buffer_compacts_on_partial_drain() {
        use std::os::unix::net::UnixStream;

        let mut buf = IoBuffer::default();
        assert_eq!(buf.push(b"abc"), 3);
        assert!(!buf.is_empty());
        assert_eq!(buf.space(), IO_BUFFER_SIZE - 3);

        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        // Writing to a closed pipe errors; buffer keeps its bytes.
        let _ = buf.drain_to(a.as_fd());

        let (c, d) = UnixStream::pair().unwrap();
        buf.drain_to(c.as_fd()).unwrap();
        assert!(buf.is_empty());
        use std::io::Read;
        let mut got = [0u8; 3];
        (&d).read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abc");
    }

    #[test]
    fn buffer_refuses_overflow() {
        let mut buf = IoBuffer::default();
        let big = vec![0u8; IO_BUFFER_SIZE + 100];
        assert_eq!(buf.push(&big), IO_BUFFER_SIZE);
        assert_eq!(buf.space(), 0);
        assert_eq!(buf.push(b"more"), 0);
    }

    #[test]
    fn console_rejects_out_of_range_terminal() {
        let got = Console::new(Vec::new(), 0, |_, _| {});
        assert!(matches!(got, Err(Error::NoSuchTerminal { .. })));
    }
}
