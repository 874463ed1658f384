//! 9P error representations.
//!
//! In 9P2000, errors are represented as strings. The `.u` extension adds a numeric
//! errno alongside the string so clients don't have to pattern-match on English text.
//! All string constants below are taken from include/net/9p/error.c of the Linux
//! kernel, the same table v9fs itself ships.

use std::fmt;
use std::io;

use nix::errno::Errno;

/// A 9P error: a human-readable message plus, when `.u` is in play, an errno.
///
/// The value of [`Error::errno`] is what goes out on the wire in an `Rerror` message
/// once `.u` is negotiated; plain 9P2000 only ever sends the string.
#[derive(Debug, Clone)]
pub enum Error {
    /// A POSIX-style error number, translated to its canonical 9P2000 string.
    No(Errno),
    /// An I/O error from the underlying transport or backend.
    Io(io::ErrorKind, String),
    /// A protocol-level error carrying an explicit message and errno, for backends
    /// that want to report something not covered by `No`.
    Proto(String, u32),
}

impl Error {
    /// Construct a protocol error from a message and errno.
    pub fn proto(message: impl Into<String>, errnum: u32) -> Error {
        Error::Proto(message.into(), errnum)
    }

    /// The errno this error carries, for use in an `.u` `Rerror`.
    pub fn errno(&self) -> u32 {
        match self {
            Error::No(e) => *e as i32 as u32,
            Error::Io(kind, _) => errno_from_io_kind(*kind) as i32 as u32,
            Error::Proto(_, errnum) => *errnum,
        }
    }

    /// The 9P2000 error string for this error, used regardless of `.u`.
    pub fn ename(&self) -> String {
        match self {
            Error::No(e) => string::for_errno(*e).to_owned(),
            Error::Io(kind, msg) => {
                if msg.is_empty() {
                    string::for_errno(errno_from_io_kind(*kind)).to_owned()
                } else {
                    msg.clone()
                }
            }
            Error::Proto(msg, _) => msg.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ename())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind(), e.to_string())
    }
}

impl From<&io::Error> for Error {
    fn from(e: &io::Error) -> Self {
        Error::Io(e.kind(), e.to_string())
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}

fn errno_from_io_kind(kind: io::ErrorKind) -> Errno {
    use io::ErrorKind::*;
    match kind {
        NotFound => Errno::ENOENT,
        PermissionDenied => Errno::EPERM,
        ConnectionRefused => Errno::ECONNREFUSED,
        ConnectionReset => Errno::ECONNRESET,
        ConnectionAborted => Errno::ECONNABORTED,
        NotConnected => Errno::ENOTCONN,
        AddrInUse => Errno::EADDRINUSE,
        AddrNotAvailable => Errno::EADDRNOTAVAIL,
        BrokenPipe => Errno::EPIPE,
        AlreadyExists => Errno::EEXIST,
        WouldBlock => Errno::EAGAIN,
        InvalidInput | InvalidData => Errno::EINVAL,
        TimedOut => Errno::ETIMEDOUT,
        WriteZero => Errno::EAGAIN,
        Interrupted => Errno::EINTR,
        _ => Errno::EIO,
    }
}

/// Re-exports of the POSIX errno constants used throughout the crate, so callers can
/// write `errno::ENOENT` the way the 9P2000.L teacher crate does.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P error strings, as carried in plain 9P2000 `Rerror` messages.
///
/// # Protocol
/// 9P2000
pub mod string {
    use nix::errno::Errno;
    use nix::errno::Errno::*;

    pub const EPERM: &str = "Operation not permitted";
    pub const EPERM_WSTAT: &str = "wstat prohibited";
    pub const ENOENT: &str = "No such file or directory";
    pub const ENOENT_DIR: &str = "directory entry not found";
    pub const ENOENT_FILE: &str = "file not found";
    pub const EIO: &str = "Input/output error";
    pub const EBADF: &str = "Bad file descriptor";
    pub const EACCES: &str = "Permission denied";
    pub const EEXIST: &str = "File exists";
    pub const ENOTDIR: &str = "Not a directory";
    pub const EISDIR: &str = "Is a directory";
    pub const EINVAL: &str = "Invalid argument";
    pub const ENOTEMPTY: &str = "Directory not empty";
    pub const ENOSYS: &str = "Function not implemented";
    pub const EPROTO: &str = "Protocol error";
    pub const ENAMETOOLONG: &str = "File name too long";
    pub const EMSGSIZE: &str = "Message too long";

    /// The wire string an error number maps to, following the same table
    /// `error.c` uses to translate Linux errno to a 9P2000 string.
    pub fn for_errno(e: Errno) -> &'static str {
        match e {
            EPERM => self::EPERM,
            ENOENT => self::ENOENT,
            EIO => self::EIO,
            EBADF => self::EBADF,
            EACCES => self::EACCES,
            EEXIST => self::EEXIST,
            ENOTDIR => self::ENOTDIR,
            EISDIR => self::EISDIR,
            EINVAL => self::EINVAL,
            ENOTEMPTY => self::ENOTEMPTY,
            ENOSYS => self::ENOSYS,
            EPROTO => self::EPROTO,
            ENAMETOOLONG => self::ENAMETOOLONG,
            EMSGSIZE => self::EMSGSIZE,
            _ => self::EIO,
        }
    }

    /// "bad offset in directory read" — returned when a directory read's offset
    /// doesn't match the fid's last-served offset.
    pub const EBADOFFSET: &str = "bad offset in directory read";
    /// "authentication not required" — `Tauth` against a backend with no auth hook.
    pub const EAUTHNOTREQ: &str = "authentication not required";
    /// "fid already in use" — `Twalk`'s `newfid` collides with an existing fid.
    pub const EFIDINUSE: &str = "fid already in use";
    /// "wstat can't convert between files and directories".
    pub const EPERM_CONV: &str = "wstat can't convert between files and directories";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_roundtrips_to_string() {
        let e: Error = Errno::ENOENT.into();
        assert_eq!(e.ename(), string::ENOENT);
        assert_eq!(e.errno(), Errno::ENOENT as i32 as u32);
    }

    #[test]
    fn proto_error_carries_custom_message() {
        let e = Error::proto(string::EBADOFFSET, Errno::ESPIPE as i32 as u32);
        assert_eq!(e.ename(), "bad offset in directory read");
    }
}
