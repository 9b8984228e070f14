//! Error representations of 9P servers.
//!
//! Every failing protocol operation produces an error string that travels to
//! the client in an `Rerror` reply, paired with a numeric errno reported in
//! the `ecode` field when the connection speaks 9P2000.u.

use std::borrow::Cow;
use std::{fmt, io};

pub use nix::errno::Errno;

/// The canonical error strings of the protocol.
///
/// These are the exact texts clients match on, so they are kept verbatim.
pub mod string {
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const ENOMEM: &str = "not enough memory";
    pub const ENOAUTH: &str = "no authentication required";
    pub const ENOTIMPL: &str = "not implemented";
    pub const EINUSE: &str = "fid already exists";
    pub const EBADUSEFID: &str = "bad use of fid";
    pub const ENOTDIR: &str = "not a directory";
    pub const ETOOMANYWNAMES: &str = "too many wnames";
    pub const EPERM: &str = "permission denied";
    pub const ETOOLARGE: &str = "i/o count too large";
    pub const EBADOFFSET: &str = "bad offset in directory read";
    pub const EDIRCHANGE: &str = "cannot convert between files and directories";
    pub const ENOTFOUND: &str = "file not found";
    pub const EOPEN: &str = "file already exclusively opened";
    pub const EEXIST: &str = "file or directory already exists";
    pub const ENOTEMPTY: &str = "directory not empty";
    pub const EUNKNOWNUSER: &str = "unknown user";
    pub const EBADVERSION: &str = "unsupported 9P version";
    pub const ESMALLMSIZE: &str = "msize too small";
    pub const ENOEXTENSION: &str = "empty extension while creating special file";
    pub const EFORMAT: &str = "incorrect extension format";
    pub const ENOSOCKET: &str = "cannot create socket";
}

/// The error type passed around the crate.
///
/// `No` is a protocol-level failure answered with `Rerror` on the offending
/// request; the connection keeps running. `Io` is a transport or framing
/// failure and shuts the connection down, except when a file provider
/// returns it from a handler, in which case it is translated into an
/// `Rerror` carrying the OS error text and errno.
#[derive(Debug)]
pub enum Error {
    /// 9P error reply: error string plus the errno sent as `ecode` in .u mode
    No(Cow<'static, str>, Errno),
    /// I/O error: `io::Error`
    Io(io::Error),
}

impl Error {
    pub const EUNKNOWNFID: Error = Error::No(Cow::Borrowed(string::EUNKNOWNFID), Errno::EIO);
    pub const ENOMEM: Error = Error::No(Cow::Borrowed(string::ENOMEM), Errno::ENOMEM);
    pub const ENOAUTH: Error = Error::No(Cow::Borrowed(string::ENOAUTH), Errno::EIO);
    pub const ENOTIMPL: Error = Error::No(Cow::Borrowed(string::ENOTIMPL), Errno::ENOSYS);
    pub const EINUSE: Error = Error::No(Cow::Borrowed(string::EINUSE), Errno::EIO);
    pub const EBADUSEFID: Error = Error::No(Cow::Borrowed(string::EBADUSEFID), Errno::EIO);
    pub const ENOTDIR: Error = Error::No(Cow::Borrowed(string::ENOTDIR), Errno::ENOTDIR);
    pub const ETOOMANYWNAMES: Error = Error::No(Cow::Borrowed(string::ETOOMANYWNAMES), Errno::EIO);
    pub const EPERM: Error = Error::No(Cow::Borrowed(string::EPERM), Errno::EPERM);
    pub const ETOOLARGE: Error = Error::No(Cow::Borrowed(string::ETOOLARGE), Errno::EIO);
    pub const EBADOFFSET: Error = Error::No(Cow::Borrowed(string::EBADOFFSET), Errno::EIO);
    pub const EDIRCHANGE: Error = Error::No(Cow::Borrowed(string::EDIRCHANGE), Errno::EPERM);
    pub const ENOTFOUND: Error = Error::No(Cow::Borrowed(string::ENOTFOUND), Errno::ENOENT);
    pub const EOPEN: Error = Error::No(Cow::Borrowed(string::EOPEN), Errno::EPERM);
    pub const EEXIST: Error = Error::No(Cow::Borrowed(string::EEXIST), Errno::EEXIST);
    pub const ENOTEMPTY: Error = Error::No(Cow::Borrowed(string::ENOTEMPTY), Errno::EIO);
    pub const EUNKNOWNUSER: Error = Error::No(Cow::Borrowed(string::EUNKNOWNUSER), Errno::EIO);
    pub const EBADVERSION: Error = Error::No(Cow::Borrowed(string::EBADVERSION), Errno::EIO);
    pub const ESMALLMSIZE: Error = Error::No(Cow::Borrowed(string::ESMALLMSIZE), Errno::EIO);
    pub const ENOEXTENSION: Error = Error::No(Cow::Borrowed(string::ENOEXTENSION), Errno::EIO);
    pub const EFORMAT: Error = Error::No(Cow::Borrowed(string::EFORMAT), Errno::EIO);
    pub const ENOSOCKET: Error = Error::No(Cow::Borrowed(string::ENOSOCKET), Errno::EIO);

    /// Construct a protocol error from an arbitrary string and errno pair.
    pub fn new<S: Into<Cow<'static, str>>>(ename: S, ecode: Errno) -> Error {
        Error::No(ename.into(), ecode)
    }

    /// The errno reported as `ecode` on 9P2000.u connections.
    pub fn errno(&self) -> Errno {
        match *self {
            Error::No(_, ecode) => ecode,
            Error::Io(ref e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    /// The error string reported as `ename`.
    pub fn ename(&self) -> Cow<'_, str> {
        match *self {
            Error::No(ref ename, _) => Cow::Borrowed(ename.as_ref()),
            Error::Io(ref e) => Cow::Owned(e.to_string()),
        }
    }

    /// Whether this is the memory-exhaustion error, which the dispatcher
    /// answers from the server's preallocated reply.
    pub fn is_enomem(&self) -> bool {
        matches!(*self, Error::No(ref ename, _) if ename == string::ENOMEM)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::No(ref ename, ecode) => write!(f, "{} ({})", ename, ecode),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::No(_, _) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

// OS errors carry their strerror text to the client, the way host-backed
// providers turn a failed system call into an Rerror.
impl From<Errno> for Error {
    fn from(e: Errno) -> Error {
        Error::No(Cow::Borrowed(e.desc()), e)
    }
}

#[test]
fn taxonomy_pairs() {
    assert_eq!(Error::EUNKNOWNFID.ename(), string::EUNKNOWNFID);
    assert_eq!(Error::ENOTFOUND.errno(), Errno::ENOENT);
    assert_eq!(Error::EPERM.errno(), Errno::EPERM);
    assert!(Error::ENOMEM.is_enomem());
    assert!(!Error::EPERM.is_enomem());
}

#[test]
fn errno_of_io_error() {
    let e = Error::from(io::Error::from_raw_os_error(libc_enoent()));
    assert_eq!(e.errno(), Errno::ENOENT);

    fn libc_enoent() -> i32 {
        Errno::ENOENT as i32
    }
}

#[test]
fn errno_carries_desc() {
    let e = Error::from(Errno::EACCES);
    assert_eq!(e.errno(), Errno::EACCES);
    assert!(!e.ename().is_empty());
}
