// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::Cell,
    fmt, io,
    fs::OpenOptions,
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    },
    path::{Path, PathBuf},
    rc::{Rc, Weak},
};

use tracing::{debug, warn};

use crate::utils::signal::Signal;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not active")]
    Inactive,
    #[error("failed to open {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to close device")]
    Close(#[source] io::Error),
}

/// Access to privileged device nodes.
///
/// `active_changed` fires with `false` when the session is paused (VT switch)
/// and with `true` once devices may be used again.
pub trait DeviceSession {
    fn open(&self, path: &Path) -> Result<OwnedFd, SessionError>;
    fn close(&self, fd: OwnedFd) -> Result<(), SessionError>;
    fn is_active(&self) -> bool;
    fn active_changed(&self) -> &Signal<bool>;
}

/// A device file descriptor that is handed back to its session on last drop.
#[derive(Clone)]
pub struct SessionFd(Rc<DropFd>);

struct DropFd {
    fd: Option<OwnedFd>,
    session: Weak<dyn DeviceSession>,
}

impl SessionFd {
    pub fn open(session: &Rc<dyn DeviceSession>, path: &Path) -> Result<SessionFd, SessionError> {
        let fd = session.open(path)?;
        debug!(path = %path.display(), "Opened session device");
        Ok(SessionFd(Rc::new(DropFd {
            fd: Some(fd),
            session: Rc::downgrade(session),
        })))
    }
}

impl fmt::Debug for SessionFd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Session-provided File Descriptor [{}]",
            self.as_raw_fd()
        )
    }
}

impl AsFd for SessionFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.0.fd {
            Some(fd) => fd.as_fd(),
            // only taken in drop
            None => unreachable!(),
        }
    }
}

impl AsRawFd for SessionFd {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl Drop for DropFd {
    fn drop(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };
        if let Some(session) = self.session.upgrade() {
            if let Err(err) = session.close(fd) {
                warn!(?err, "Failed to close file descriptor");
            }
        }
    }
}

/// Opens device nodes directly, for users that already have access to them.
///
/// The embedder reports VT switches through [`DirectSession::set_active`].
pub struct DirectSession {
    active: Cell<bool>,
    changed: Signal<bool>,
}

impl DirectSession {
    pub fn new() -> Rc<DirectSession> {
        Rc::new(DirectSession {
            active: Cell::new(true),
            changed: Signal::new(),
        })
    }

    pub fn set_active(&self, active: bool) {
        if self.active.replace(active) != active {
            debug!(active, "Session activity changed");
            self.changed.emit(&active);
        }
    }
}

impl DeviceSession for DirectSession {
    fn open(&self, path: &Path) -> Result<OwnedFd, SessionError> {
        if !self.active.get() {
            return Err(SessionError::Inactive);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| SessionError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(OwnedFd::from(file))
    }

    fn close(&self, fd: OwnedFd) -> Result<(), SessionError> {
        drop(fd);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn active_changed(&self) -> &Signal<bool> {
        &self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn activity_changes_are_signalled_once() {
        let session = DirectSession::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            session
                .active_changed()
                .connect(move |active| seen.borrow_mut().push(*active));
        }
        session.set_active(false);
        session.set_active(false);
        session.set_active(true);
        assert_eq!(*seen.borrow(), vec![false, true]);
    }

    #[test]
    fn inactive_session_refuses_open() {
        let session = DirectSession::new();
        session.set_active(false);
        assert!(matches!(
            session.open(Path::new("/dev/null")),
            Err(SessionError::Inactive)
        ));
    }

    #[test]
    fn session_fd_opens_device() {
        let session: Rc<dyn DeviceSession> = DirectSession::new();
        let fd = SessionFd::open(&session, Path::new("/dev/null")).unwrap();
        assert!(fd.as_raw_fd() >= 0);
        let copy = fd.clone();
        drop(fd);
        assert!(copy.as_raw_fd() >= 0);
    }
}
