//! Conversions between host metadata and 9P stat records, plus the uid/gid
//! name caches consulted while building them.

use {
    nix::{
        sys::stat::{major, minor},
        unistd::{Gid, Group, Uid, User},
    },
    rspfs::{NONUNAME, QId, QIdType, Stat, dm, om},
    std::{
        collections::HashMap,
        fs::Metadata,
        os::unix::fs::{FileTypeExt, MetadataExt},
        path::Path,
        sync::{Mutex, MutexGuard},
    },
};

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Qid of a host file: the inode number identifies the file, the version
/// tracks modifications.
pub fn qid_from_host(meta: &Metadata) -> QId {
    let mut typ = QIdType::FILE;
    if meta.is_dir() {
        typ.insert(QIdType::DIR);
    }
    if meta.file_type().is_symlink() {
        typ.insert(QIdType::SYMLINK);
    }

    QId {
        typ,
        version: (meta.mtime() as u32) ^ ((meta.size() as u32) << 8),
        path: meta.ino(),
    }
}

/// Host mode bits → 9P permission mode.
pub fn npmode_from_host(meta: &Metadata, dotu: bool) -> u32 {
    let umode = meta.mode();
    let mut ret = umode & 0o777;

    if meta.is_dir() {
        ret |= dm::DIR;
    }

    if dotu {
        let ft = meta.file_type();
        if ft.is_symlink() {
            ret |= dm::SYMLINK;
        }
        if ft.is_socket() {
            ret |= dm::SOCKET;
        }
        if ft.is_fifo() {
            ret |= dm::NAMEDPIPE;
        }
        if ft.is_block_device() || ft.is_char_device() {
            ret |= dm::DEVICE;
        }
        if umode & 0o4000 != 0 {
            ret |= dm::SETUID;
        }
        if umode & 0o2000 != 0 {
            ret |= dm::SETGID;
        }
    }

    ret
}

/// 9P permission mode → host mode bits. The extension string disambiguates
/// character from block devices.
pub fn host_mode_from_np(mode: u32, extension: Option<&str>, dotu: bool) -> u32 {
    use nix::sys::stat::SFlag;

    let mut ret = mode & 0o777;
    if mode & dm::DIR != 0 {
        ret |= SFlag::S_IFDIR.bits();
    }

    if dotu {
        if mode & dm::SYMLINK != 0 {
            ret |= SFlag::S_IFLNK.bits();
        }
        if mode & dm::SOCKET != 0 {
            ret |= SFlag::S_IFSOCK.bits();
        }
        if mode & dm::NAMEDPIPE != 0 {
            ret |= SFlag::S_IFIFO.bits();
        }
        if mode & dm::DEVICE != 0 {
            if extension.is_some_and(|e| e.starts_with('c')) {
                ret |= SFlag::S_IFCHR.bits();
            } else {
                ret |= SFlag::S_IFBLK.bits();
            }
        }
    }

    if ret & SFlag::S_IFMT.bits() == 0 {
        ret |= SFlag::S_IFREG.bits();
    }

    if mode & dm::SETUID != 0 {
        ret |= 0o4000;
    }
    if mode & dm::SETGID != 0 {
        ret |= 0o2000;
    }

    ret
}

/// Host open options matching a 9P open mode.
pub fn open_options(mode: u8) -> tokio::fs::OpenOptions {
    let mut opts = tokio::fs::OpenOptions::new();

    match mode & 3 {
        om::WRITE => {
            opts.write(true);
        }
        om::RDWR => {
            opts.read(true).write(true);
        }
        // om::READ and om::EXEC
        _ => {
            opts.read(true);
        }
    }

    if mode & om::TRUNC != 0 && matches!(mode & 3, om::WRITE | om::RDWR) {
        opts.truncate(true);
    }
    if mode & om::APPEND != 0 {
        opts.append(true);
    }

    opts
}

/// Caches of uid/gid → name lookups, since directory reads stat every entry.
pub struct NameCache {
    users: Mutex<HashMap<u32, String>>,
    groups: Mutex<HashMap<u32, String>>,
}

impl NameCache {
    pub fn new() -> NameCache {
        NameCache {
            users: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn uname(&self, uid: u32) -> String {
        if let Some(name) = lock(&self.users).get(&uid) {
            return name.clone();
        }

        let name = User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| "???".to_owned());
        lock(&self.users).insert(uid, name.clone());
        name
    }

    pub fn gname(&self, gid: u32) -> String {
        if let Some(name) = lock(&self.groups).get(&gid) {
            return name.clone();
        }

        let name = Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| "???".to_owned());
        lock(&self.groups).insert(gid, name.clone());
        name
    }
}

impl Default for NameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Stat record of a host file as the protocol wants it.
pub fn stat_from_host(path: &Path, meta: &Metadata, dotu: bool, names: &NameCache) -> Stat {
    let mode = npmode_from_host(meta, dotu);

    let extension = if !dotu {
        String::new()
    } else if mode & dm::SYMLINK != 0 {
        std::fs::read_link(path)
            .map(|t| t.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else if mode & dm::DEVICE != 0 {
        let rdev = meta.rdev();
        format!(
            "{} {} {}",
            if meta.file_type().is_char_device() {
                'c'
            } else {
                'b'
            },
            major(rdev),
            minor(rdev)
        )
    } else {
        String::new()
    };

    Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_host(meta),
        mode,
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        length: if meta.is_dir() { 0 } else { meta.size() },
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_owned()),
        uid: names.uname(meta.uid()),
        gid: names.gname(meta.gid()),
        muid: String::new(),
        extension,
        n_uid: if dotu { meta.uid() } else { NONUNAME },
        n_gid: if dotu { meta.gid() } else { NONUNAME },
        n_muid: if dotu { 0 } else { NONUNAME },
    }
}
