//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000/9P2000.u

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message
/// should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` use as `n_uname` to indicate no uid is
/// specified
pub const NONUNAME: u32 = !0;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Maximum number of path elements a single `Twalk` may carry
pub const MAXWELEM: usize = 16;

/// Default maximum message size, negotiated down on `Tversion`
pub const DEFAULT_MSIZE: u32 = 8216;

/// 9P service default port
pub const NINEP_PORT: u16 = 564;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in, exclusive use
    pub const EXCL: u8 = 0x04;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 0x20;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 0x40;
    /// Or'ed in, append only
    pub const APPEND: u8 = 0x80;
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for symbolic links (9P2000.u)
    pub const SYMLINK: u32 = 0x02000000;
    /// Mode bit for hard links (9P2000.u)
    pub const LINK: u32 = 0x01000000;
    /// Mode bit for device files (9P2000.u)
    pub const DEVICE: u32 = 0x00800000;
    /// Mode bit for named pipes (9P2000.u)
    pub const NAMEDPIPE: u32 = 0x00200000;
    /// Mode bit for sockets (9P2000.u)
    pub const SOCKET: u32 = 0x00100000;
    /// Mode bit for setuid (9P2000.u)
    pub const SETUID: u32 = 0x00080000;
    /// Mode bit for setgid (9P2000.u)
    pub const SETGID: u32 = 0x00040000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;

    /// The 9P2000.u special-file bits, rejected on base connections
    pub const SPECIAL: u32 = NAMEDPIPE | SYMLINK | LINK | DEVICE | SOCKET;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// The same encoding as the top byte of the permission mode, shifted
    /// right 24.
    ///
    /// # Protocol
    /// 9P2000/9P2000.u
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Type bit for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bit for hard links (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<u32> for QIdType {
    /// Derive the qid type byte from permission mode bits
    fn from(dm: u32) -> Self {
        QIdType::from_bits_truncate((dm >> 24) as u8)
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time
    /// the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    pub fn size(&self) -> u32 {
        (size_of::<QIdType>() + size_of::<u32>() + size_of::<u64>()) as u32
    }
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// NOTE: Defined as `Dir` in libc.h of Plan 9. The four trailing fields are
/// the 9P2000.u extensions and appear on the wire only on .u connections.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
    /// Special file description (9P2000.u)
    pub extension: String,
    /// Owner numeric id (9P2000.u)
    pub n_uid: u32,
    /// Group numeric id (9P2000.u)
    pub n_gid: u32,
    /// Last modifier numeric id (9P2000.u)
    pub n_muid: u32,
}

impl Stat {
    /// Wire size of the record behind its leading size field
    pub fn size(&self, dotu: bool) -> u16 {
        let mut size = size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + self.qid.size() as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len();

        if dotu {
            size += size_of::<u16>()
                + self.extension.len()
                + (size_of::<u32>() * 3);
        }

        size as u16
    }

    /// The all-sentinel record: every field holds its "don't touch" value,
    /// as a `Twstat` uses to leave fields alone.
    pub fn blank() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::all(),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
            extension: String::new(),
            n_uid: !0,
            n_gid: !0,
            n_muid: !0,
        }
    }
}

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        //TError        = 106,  // Illegal, never used
        RError          = 107,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            RVersion
                | RAuth
                | RAttach
                | RError
                | RFlush
                | RWalk
                | ROpen
                | RCreate
                | RRead
                | RWrite
                | RClunk
                | RRemove
                | RStat
                | RWStat
        )
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::TVersion { .. } => MsgType::TVersion,
            Fcall::RVersion { .. } => MsgType::RVersion,
            Fcall::TAuth { .. } => MsgType::TAuth,
            Fcall::RAuth { .. } => MsgType::RAuth,
            Fcall::TAttach { .. } => MsgType::TAttach,
            Fcall::RAttach { .. } => MsgType::RAttach,
            Fcall::RError { .. } => MsgType::RError,
            Fcall::TFlush { .. } => MsgType::TFlush,
            Fcall::RFlush => MsgType::RFlush,
            Fcall::TWalk { .. } => MsgType::TWalk,
            Fcall::RWalk { .. } => MsgType::RWalk,
            Fcall::TOpen { .. } => MsgType::TOpen,
            Fcall::ROpen { .. } => MsgType::ROpen,
            Fcall::TCreate { .. } => MsgType::TCreate,
            Fcall::RCreate { .. } => MsgType::RCreate,
            Fcall::TRead { .. } => MsgType::TRead,
            Fcall::RRead { .. } => MsgType::RRead,
            Fcall::TWrite { .. } => MsgType::TWrite,
            Fcall::RWrite { .. } => MsgType::RWrite,
            Fcall::TClunk { .. } => MsgType::TClunk,
            Fcall::RClunk => MsgType::RClunk,
            Fcall::TRemove { .. } => MsgType::TRemove,
            Fcall::RRemove => MsgType::RRemove,
            Fcall::TStat { .. } => MsgType::TStat,
            Fcall::RStat { .. } => MsgType::RStat,
            Fcall::TWStat { .. } => MsgType::TWStat,
            Fcall::RWStat => MsgType::RWStat,
        }
    }
}

/// Data type used in `Rread` and `Twrite`
///
/// # Protocol
/// 9P2000/9P2000.u
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
        /// 9P2000.u; `NONUNAME` when the client sent none
        n_uname: u32,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        /// 9P2000.u; `NONUNAME` when the client sent none
        n_uname: u32,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
        /// 9P2000.u; zero on base connections
        ecode: u32,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        /// 9P2000.u special file description; empty on base connections
        extension: String,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}
