//! `poll(2)` 就绪等待
//!
//! 每一轮重新登记全部描述符，所以不需要增删注册。

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub(crate) const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
}

impl Readiness {
    pub(crate) fn from_revents(revents: libc::c_short) -> Self {
        let readable = revents & POLLIN != 0;
        Self {
            readable,
            writable: revents & POLLOUT != 0,
            // 对端关闭但仍有数据可读时先按可读处理
            error: revents & (POLLERR | POLLNVAL) != 0 || (revents & POLLHUP != 0 && !readable),
        }
    }
}

/// 在 `poll` 返回前一轮登记的顺序里用下标引用描述符
pub(crate) struct Poller {
    fds: Vec<pollfd>,
}

impl Poller {
    pub(crate) fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub(crate) fn clear(&mut self) {
        self.fds.clear();
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> usize {
        let mut events = 0;
        if interest.read {
            events |= POLLIN;
        }
        if interest.write {
            events |= POLLOUT;
        }
        self.fds.push(pollfd {
            fd,
            events,
            revents: 0,
        });
        self.fds.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    /// 阻塞直到至少一个描述符就绪或超时，返回就绪数量；被信号打断时返回 0
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        Ok(rc as usize)
    }

    pub(crate) fn readiness(&self, index: usize) -> Readiness {
        self.fds
            .get(index)
            .map(|fd| Readiness::from_revents(fd.revents))
            .unwrap_or_default()
    }
}
