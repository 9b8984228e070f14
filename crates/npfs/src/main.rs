//! npfs: export the host filesystem over 9P2000.u.
//!
//! Each fid tracks a host path; opens hold a real file handle, directory
//! reads stream per-entry stat records with a continuation cursor, and .u
//! create requests can make symlinks, named pipes, device nodes, and hard
//! links (the extension string names the link target fid). The server runs
//! as the invoking user on a single-threaded runtime.

use {
    async_trait::async_trait,
    clap::Parser,
    log::warn,
    nix::{
        sys::stat::{Mode, SFlag, makedev, mknod},
        unistd::{self, Gid, Uid, mkfifo},
    },
    rspfs::{
        Data, Fcall, NINEP_PORT, NONUNAME, QId, QIdType, Stat,
        dm,
        error::Error,
        srv::{Fid, Filesystem, Srv, User},
    },
    std::{
        collections::HashMap,
        io::SeekFrom,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::{Arc, Mutex as StdMutex},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

mod utils;
use crate::utils::*;

type Result<T> = rspfs::Result<T>;

/// Paths of the connection's live fids, for hard-link creation by fid
/// number. Keyed by (connection, fid) since fids are per-connection.
type Registry = Arc<StdMutex<HashMap<(u64, u32), PathBuf>>>;

struct RegGuard {
    registry: Registry,
    key: (u64, u32),
}

impl RegGuard {
    fn new(registry: Registry, fid: &Fid<NpfsFid>, path: PathBuf) -> RegGuard {
        let key = (fid.conn_id(), fid.fid());
        lock(&registry).insert(key, path);
        RegGuard { registry, key }
    }

    fn update(&self, path: PathBuf) {
        lock(&self.registry).insert(self.key, path);
    }
}

impl Drop for RegGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

/// Directory enumeration in progress: the host entry stream plus the entry
/// that did not fit into the previous reply.
struct DirState {
    rd: ReadDirStream,
    pending: Option<PathBuf>,
}

#[derive(Default)]
struct NpfsFid {
    path: RwLock<PathBuf>,
    file: Mutex<Option<fs::File>>,
    dir: Mutex<Option<DirState>>,
    reg: StdMutex<Option<RegGuard>>,
}

struct Npfs {
    registry: Registry,
    names: Arc<NameCache>,
}

impl Npfs {
    fn new() -> Npfs {
        Npfs {
            registry: Arc::new(StdMutex::new(HashMap::new())),
            names: Arc::new(NameCache::new()),
        }
    }

    async fn fid_path(fid: &Fid<NpfsFid>) -> PathBuf {
        fid.aux.path.read().await.clone()
    }

    async fn set_fid_path(&self, fid: &Fid<NpfsFid>, path: PathBuf) {
        *fid.aux.path.write().await = path.clone();

        let mut reg = lock(&fid.aux.reg);
        match reg.as_ref() {
            Some(guard) => guard.update(path),
            None => *reg = Some(RegGuard::new(self.registry.clone(), fid, path)),
        }
    }

    async fn create_special(
        &self,
        fid: &Fid<NpfsFid>,
        path: &Path,
        perm: u32,
        ext: &str,
    ) -> Result<()> {
        if perm & dm::NAMEDPIPE == 0 && ext.is_empty() {
            return Err(Error::ENOEXTENSION);
        }

        if perm & dm::SYMLINK != 0 {
            fs::symlink(ext, path).await?;
        } else if perm & dm::LINK != 0 {
            // the extension is the decimal fid of the link target
            let ofid: u32 = ext.trim().parse().map_err(|_| Error::EFORMAT)?;
            let target = lock(&self.registry)
                .get(&(fid.conn_id(), ofid))
                .cloned()
                .ok_or(Error::EUNKNOWNFID)?;
            fs::hard_link(&target, path).await?;
        } else if perm & dm::DEVICE != 0 {
            let mut it = ext.split_whitespace();
            let kind = match it.next() {
                Some("c") => SFlag::S_IFCHR,
                Some("b") => SFlag::S_IFBLK,
                _ => return Err(Error::EFORMAT),
            };
            let (major, minor) = match (
                it.next().and_then(|s| s.parse().ok()),
                it.next().and_then(|s| s.parse().ok()),
            ) {
                (Some(major), Some(minor)) => (major, minor),
                _ => return Err(Error::EFORMAT),
            };

            mknod(
                path,
                kind,
                Mode::from_bits_truncate(perm & 0o777),
                makedev(major, minor),
            )?;
        } else if perm & dm::NAMEDPIPE != 0 {
            mkfifo(path, Mode::from_bits_truncate(perm & 0o777))?;
        } else {
            return Err(Error::ENOSOCKET);
        }

        Ok(())
    }

    async fn read_dir(&self, fid: &Fid<NpfsFid>, offset: u64, count: u32) -> Result<Fcall> {
        let path = Self::fid_path(fid).await;
        let dotu = fid.dotu();

        let mut guard = fid.aux.dir.lock().await;
        if offset == 0 || guard.is_none() {
            *guard = Some(DirState {
                rd: ReadDirStream::new(fs::read_dir(&path).await?),
                pending: None,
            });
        }
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Err(Error::EBADOFFSET),
        };

        let mut buf = Vec::with_capacity(count as usize);
        loop {
            let entry = match state.pending.take() {
                Some(pending) => pending,
                None => match state.rd.next().await.transpose()? {
                    Some(entry) => entry.path(),
                    None => break,
                },
            };

            let meta = fs::symlink_metadata(&entry).await?;
            let stat = stat_from_host(&entry, &meta, dotu, &self.names);
            if buf.len() + stat.size(dotu) as usize + 2 > count as usize {
                state.pending = Some(entry);
                break;
            }
            stat.encode(&mut buf, dotu)?;
        }

        Ok(Fcall::RRead { data: Data(buf) })
    }
}

#[async_trait]
impl Filesystem for Npfs {
    type Fid = NpfsFid;

    async fn lookup_user(&self, uname: &str, n_uname: u32) -> Option<User> {
        let pw = if n_uname != NONUNAME {
            unistd::User::from_uid(Uid::from_raw(n_uname)).ok().flatten()?
        } else {
            unistd::User::from_name(uname).ok().flatten()?
        };

        Some(User {
            uname: pw.name,
            uid: pw.uid.as_raw(),
            gid: pw.gid.as_raw(),
            groups: vec![pw.gid.as_raw()],
        })
    }

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        aname: &str,
        _n_uname: u32,
    ) -> Result<Fcall> {
        if afid.is_some() {
            return Err(Error::ENOAUTH);
        }

        let path = if aname.starts_with('/') {
            PathBuf::from(aname)
        } else {
            PathBuf::from("/")
        };

        let meta = fs::symlink_metadata(&path).await?;
        if !meta.is_dir() {
            return Err(Error::ENOTDIR);
        }

        self.set_fid_path(fid, path).await;
        Ok(Fcall::RAttach {
            qid: qid_from_host(&meta),
        })
    }

    async fn clone_fid(&self, fid: &Fid<Self::Fid>, newfid: &Fid<Self::Fid>) -> Result<()> {
        let path = Self::fid_path(fid).await;
        self.set_fid_path(newfid, path).await;
        Ok(())
    }

    async fn walk_one(&self, fid: &Fid<Self::Fid>, wname: &str) -> Result<QId> {
        let path = Self::fid_path(fid).await.join(wname);
        let meta = fs::symlink_metadata(&path).await?;

        let qid = qid_from_host(&meta);
        self.set_fid_path(fid, path).await;
        Ok(qid)
    }

    async fn ropen(&self, fid: &Fid<Self::Fid>, mode: u8) -> Result<Fcall> {
        let path = Self::fid_path(fid).await;
        let meta = fs::symlink_metadata(&path).await?;

        if !meta.is_dir() {
            let file = open_options(mode).open(&path).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        Ok(Fcall::ROpen {
            qid: qid_from_host(&meta),
            iounit: 0,
        })
    }

    async fn rcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        perm: u32,
        mode: u8,
        extension: Option<&str>,
    ) -> Result<Fcall> {
        let path = Self::fid_path(fid).await.join(name);
        if fs::symlink_metadata(&path).await.is_ok() {
            return Err(Error::EEXIST);
        }

        if perm & dm::DIR != 0 {
            fs::create_dir(&path).await?;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(perm & 0o777)).await?;
        } else if perm & dm::SPECIAL != 0 {
            self.create_special(fid, &path, perm, extension.unwrap_or(""))
                .await?;
        } else {
            let mut opts = open_options(mode);
            opts.create_new(true).write(true).mode(perm & 0o777);
            let file = opts.open(&path).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        let meta = fs::symlink_metadata(&path).await?;
        self.set_fid_path(fid, path).await;
        Ok(Fcall::RCreate {
            qid: qid_from_host(&meta),
            iounit: 0,
        })
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        if fid.qid_type().contains(QIdType::DIR) {
            return self.read_dir(fid, offset, count).await;
        }

        let mut file = fid.aux.file.lock().await;
        let file = file.as_mut().ok_or(Error::EBADUSEFID)?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0; count as usize];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);

        Ok(Fcall::RRead { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Fcall> {
        let count = {
            let mut file = fid.aux.file.lock().await;
            let file = file.as_mut().ok_or(Error::EBADUSEFID)?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write(&data.0).await? as u32
        };

        Ok(Fcall::RWrite { count })
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let path = Self::fid_path(fid).await;

        match fs::symlink_metadata(&path).await? {
            ref meta if meta.is_dir() => fs::remove_dir(&path).await?,
            _ => fs::remove_file(&path).await?,
        };

        Ok(Fcall::RRemove)
    }

    async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let path = Self::fid_path(fid).await;
        let meta = fs::symlink_metadata(&path).await?;

        Ok(Fcall::RStat {
            stat: stat_from_host(&path, &meta, fid.dotu(), &self.names),
        })
    }

    async fn rwstat(&self, fid: &Fid<Self::Fid>, stat: &Stat) -> Result<Fcall> {
        let mut path = Self::fid_path(fid).await;
        let dotu = fid.dotu();

        let mut uid = if dotu { stat.n_uid } else { NONUNAME };
        let mut gid = if dotu { stat.n_gid } else { NONUNAME };
        if uid == NONUNAME && !stat.uid.is_empty() {
            uid = unistd::User::from_name(&stat.uid)
                .ok()
                .flatten()
                .ok_or(Error::EUNKNOWNUSER)?
                .uid
                .as_raw();
        }
        if gid == NONUNAME && !stat.gid.is_empty() {
            gid = unistd::Group::from_name(&stat.gid)
                .ok()
                .flatten()
                .ok_or(Error::EUNKNOWNUSER)?
                .gid
                .as_raw();
        }

        if stat.mode != !0u32 {
            let mode = host_mode_from_np(stat.mode, Some(&stat.extension), dotu);
            fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        }

        if stat.mtime != !0u32 {
            let meta = fs::metadata(&path).await?;
            let atime = filetime::FileTime::from_last_access_time(&meta);
            let mtime = filetime::FileTime::from_unix_time(stat.mtime as i64, 0);
            let target = path.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(target, atime, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        }

        if uid != NONUNAME || gid != NONUNAME {
            let uid = (uid != NONUNAME).then(|| Uid::from_raw(uid));
            let gid = (gid != NONUNAME).then(|| Gid::from_raw(gid));
            unistd::chown(&path, uid, gid)?;
        }

        if !stat.name.is_empty() {
            let newpath = path
                .parent()
                .unwrap_or_else(|| Path::new("/"))
                .join(&stat.name);
            if newpath != path {
                fs::rename(&path, &newpath).await?;
                self.set_fid_path(fid, newpath.clone()).await;
                path = newpath;
            }
        }

        if stat.length != !0u64 {
            fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?
                .set_len(stat.length)
                .await?;
        }

        Ok(Fcall::RWStat)
    }
}

#[derive(Debug, clap::Parser)]
#[command(name = "npfs", about = "Export the host filesystem over 9P2000.u")]
struct Cli {
    /// Raise debug verbosity; repeat for more
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// TCP port to listen on
    #[arg(short = 'p', default_value_t = NINEP_PORT)]
    port: u16,

    /// Worker threads; accepted for compatibility, the server is
    /// single-threaded
    #[arg(short = 'w', default_value_t = 1)]
    nwthreads: usize,

    /// Serve with the invoking user's credentials (always the case; kept
    /// for compatibility with servers that switch per-user)
    #[arg(short = 's')]
    sameuser: bool,

    /// Listen on a unix socket path instead of TCP
    #[arg(short = 'u', long = "unix")]
    unix: Option<PathBuf>,
}

async fn npfs_main(cli: Cli) -> Result<i32> {
    if !cli.sameuser && unistd::geteuid().is_root() {
        warn!("per-user credential switching is not supported; serving as root");
    }

    let addr = match &cli.unix {
        Some(path) => format!("unix!{}", path.display()),
        None => format!("tcp!0.0.0.0!{}", cli.port),
    };

    println!("[*] Ready to accept clients: {}", addr);
    Srv::new(Npfs::new()).listen(&addr).await.and(Ok(0))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(match cli.debug {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .parse_default_env()
        .init();

    let exit_code = npfs_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
