//! In-memory file trees served over 9P.
//!
//! A tree is a hierarchy of [`Node`]s, directories and files, each carrying
//! its own operations table ([`DirOps`]/[`FileOps`]). [`TreeFs`] adapts such
//! a tree behind the [`Filesystem`] trait: it resolves walks, enforces the
//! Plan 9 permission model against the attached user, serializes directory
//! reads into stat records, and delegates file I/O to the per-node ops.
//!
//! Synthetic filesystems (control files, status trees) build their hierarchy
//! once with [`Node::new_dir`]/[`Node::new_file`] and hand the root to
//! `TreeFs`; [`RamDir`]/[`RamFile`] provide a fully writable tree.

use {
    crate::{
        error::Error,
        fcall::*,
        srv::{Fid, Filesystem, User},
        utils::Result,
    },
    async_trait::async_trait,
    std::sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    std::time::{SystemTime, UNIX_EPOCH},
};

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owning user or group of a node: a name paired with its numeric id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub name: String,
    pub id: u32,
}

impl Owner {
    pub fn new<S: Into<String>>(name: S, id: u32) -> Owner {
        Owner {
            name: name.into(),
            id,
        }
    }
}

/// Mutable metadata of a node.
#[derive(Clone, Debug)]
pub struct Meta {
    pub name: String,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    /// Qid version, bumped on every modification
    pub version: u32,
    pub uid: Owner,
    pub gid: Owner,
    pub muid: Owner,
    /// Special file description reported in .u stat records
    pub extension: String,
    /// Whether an exclusive-use open is in force
    pub excl: bool,
}

enum Kind {
    Dir {
        children: Mutex<Vec<Arc<Node>>>,
        ops: Arc<dyn DirOps>,
    },
    File {
        ops: Arc<dyn FileOps>,
    },
}

/// One file or directory of an in-memory tree.
pub struct Node {
    qid_path: u64,
    parent: Mutex<Weak<Node>>,
    meta: Mutex<Meta>,
    kind: Kind,
}

/// Operations of file nodes. `read` is the one required method; the rest
/// default to "permission denied", which suits read-only synthetic files.
#[async_trait]
pub trait FileOps: Send + Sync {
    async fn read(&self, node: &Arc<Node>, offset: u64, count: u32) -> Result<Vec<u8>>;

    async fn write(&self, _node: &Arc<Node>, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(Error::EPERM)
    }

    async fn truncate(&self, _node: &Arc<Node>, _length: u64) -> Result<()> {
        Err(Error::EPERM)
    }
}

/// Operations of directory nodes. The defaults refuse creation and removal,
/// which is what a static control tree wants.
#[async_trait]
pub trait DirOps: Send + Sync {
    /// Produce a new, unlinked child node; the adapter links it into the
    /// directory and stamps the modification.
    async fn create(
        &self,
        _dir: &Arc<Node>,
        _name: &str,
        _perm: u32,
        _user: &User,
        _extension: &str,
    ) -> Result<Arc<Node>> {
        Err(Error::EPERM)
    }

    /// Approve removal of `child`; the adapter unlinks it afterwards.
    async fn remove(&self, _dir: &Arc<Node>, _child: &Arc<Node>) -> Result<()> {
        Err(Error::EPERM)
    }
}

/// Directory ops of an immutable directory.
pub struct StaticDir;

#[async_trait]
impl DirOps for StaticDir {}

/// File ops serving a fixed byte string.
pub struct StaticFile(pub Vec<u8>);

#[async_trait]
impl FileOps for StaticFile {
    async fn read(&self, _node: &Arc<Node>, offset: u64, count: u32) -> Result<Vec<u8>> {
        Ok(read_window(&self.0, offset, count))
    }
}

fn read_window(data: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let off = (offset.min(data.len() as u64)) as usize;
    let end = (off + count as usize).min(data.len());
    data[off..end].to_vec()
}

/// File ops backed by a growable in-memory buffer.
pub struct RamFile(Mutex<Vec<u8>>);

impl RamFile {
    pub fn new() -> RamFile {
        RamFile(Mutex::new(Vec::new()))
    }
}

impl Default for RamFile {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileOps for RamFile {
    async fn read(&self, _node: &Arc<Node>, offset: u64, count: u32) -> Result<Vec<u8>> {
        Ok(read_window(&lock(&self.0), offset, count))
    }

    async fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<u32> {
        let mut buf = lock(&self.0);
        let off = offset as usize;
        if off + data.len() > buf.len() {
            buf.resize(off + data.len(), 0);
        }
        buf[off..off + data.len()].copy_from_slice(data);
        node.meta().length = buf.len() as u64;
        Ok(data.len() as u32)
    }

    async fn truncate(&self, node: &Arc<Node>, length: u64) -> Result<()> {
        let mut buf = lock(&self.0);
        buf.resize(length as usize, 0);
        node.meta().length = length;
        Ok(())
    }
}

/// Directory ops of a writable in-memory tree. Regular files become
/// [`RamFile`]s, subdirectories inherit these ops, and .u special files are
/// recorded with their extension string.
#[derive(Clone)]
pub struct RamDir {
    qpaths: Arc<AtomicU64>,
}

impl RamDir {
    pub fn new() -> RamDir {
        // low qid paths are taken by statically built nodes
        RamDir {
            qpaths: Arc::new(AtomicU64::new(1 << 32)),
        }
    }

    fn next_qpath(&self) -> u64 {
        self.qpaths.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RamDir {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirOps for RamDir {
    async fn create(
        &self,
        dir: &Arc<Node>,
        name: &str,
        perm: u32,
        user: &User,
        extension: &str,
    ) -> Result<Arc<Node>> {
        let owner = Owner::new(user.uname.clone(), user.uid);
        let group = dir.meta().gid.clone();
        let qpath = self.next_qpath();

        let node = if perm & dm::DIR != 0 {
            Node::new_dir(name, perm, qpath, owner, group, Arc::new(self.clone()))
        } else {
            Node::new_file(name, perm, qpath, owner, group, Arc::new(RamFile::new()))
        };

        if !extension.is_empty() {
            node.meta().extension = extension.to_owned();
        }

        Ok(node)
    }

    async fn remove(&self, _dir: &Arc<Node>, _child: &Arc<Node>) -> Result<()> {
        Ok(())
    }
}

impl Node {
    fn new(name: &str, mode: u32, qpath: u64, owner: Owner, group: Owner, kind: Kind) -> Arc<Node> {
        let now = unix_now();
        Arc::new(Node {
            qid_path: qpath,
            parent: Mutex::new(Weak::new()),
            meta: Mutex::new(Meta {
                name: name.to_owned(),
                mode,
                atime: now,
                mtime: now,
                length: 0,
                version: 0,
                muid: owner.clone(),
                uid: owner,
                gid: group,
                extension: String::new(),
                excl: false,
            }),
            kind,
        })
    }

    /// Allocate a directory node; the DIR bits of mode and qid type are
    /// implied.
    pub fn new_dir(
        name: &str,
        mode: u32,
        qpath: u64,
        owner: Owner,
        group: Owner,
        ops: Arc<dyn DirOps>,
    ) -> Arc<Node> {
        Node::new(
            name,
            mode | dm::DIR,
            qpath,
            owner,
            group,
            Kind::Dir {
                children: Mutex::new(Vec::new()),
                ops,
            },
        )
    }

    /// Allocate a file node.
    pub fn new_file(
        name: &str,
        mode: u32,
        qpath: u64,
        owner: Owner,
        group: Owner,
        ops: Arc<dyn FileOps>,
    ) -> Arc<Node> {
        Node::new(name, mode, qpath, owner, group, Kind::File { ops })
    }

    /// Locked access to the node's metadata.
    pub fn meta(&self) -> MutexGuard<'_, Meta> {
        lock(&self.meta)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Dir { .. })
    }

    pub fn qid(&self) -> QId {
        let meta = self.meta();
        QId {
            typ: QIdType::from(meta.mode),
            version: meta.version,
            path: self.qid_path,
        }
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        lock(&self.parent).upgrade()
    }

    /// Link `child` under this directory.
    pub fn add_child(self: &Arc<Node>, child: Arc<Node>) {
        if let Kind::Dir { children, .. } = &self.kind {
            *lock(&child.parent) = Arc::downgrade(self);
            lock(children).push(child);
        }
    }

    fn unlink_child(&self, child: &Arc<Node>) {
        if let Kind::Dir { children, .. } = &self.kind {
            lock(children).retain(|c| !Arc::ptr_eq(c, child));
        }
    }

    fn children_snapshot(&self) -> Vec<Arc<Node>> {
        match &self.kind {
            Kind::Dir { children, .. } => lock(children).clone(),
            Kind::File { .. } => Vec::new(),
        }
    }

    /// Look a name up among the children; `..` resolves to the parent.
    pub fn find(&self, name: &str) -> Option<Arc<Node>> {
        if name == ".." {
            return self.parent();
        }

        self.children_snapshot()
            .into_iter()
            .find(|c| c.meta().name == name)
    }

    fn file_ops(&self) -> Result<Arc<dyn FileOps>> {
        match &self.kind {
            Kind::File { ops } => Ok(ops.clone()),
            Kind::Dir { .. } => Err(Error::EPERM),
        }
    }

    fn dir_ops(&self) -> Result<Arc<dyn DirOps>> {
        match &self.kind {
            Kind::Dir { ops, .. } => Ok(ops.clone()),
            Kind::File { .. } => Err(Error::EPERM),
        }
    }

    /// Verify that `user` may access the node with rwx bits `perm`.
    pub fn checkperm(&self, user: Option<&User>, perm: u32) -> Result<()> {
        let meta = self.meta();
        check_perm(meta.mode, meta.uid.id, meta.gid.id, user, perm)
    }

    fn modified(&self, user: Option<&User>) {
        let mut meta = self.meta();
        if let Some(user) = user {
            meta.muid = Owner::new(user.uname.clone(), user.uid);
        }
        meta.mtime = unix_now();
        meta.atime = meta.mtime;
        meta.version = meta.version.wrapping_add(1);
    }

    fn touch_atime(&self) {
        self.meta().atime = unix_now();
    }

    /// The node's stat record as it would appear on the wire.
    pub fn stat(&self, dotu: bool) -> Stat {
        let meta = self.meta();
        Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::from(meta.mode),
                version: meta.version,
                path: self.qid_path,
            },
            mode: meta.mode,
            atime: meta.atime,
            mtime: meta.mtime,
            length: if self.is_dir() { 0 } else { meta.length },
            name: meta.name.clone(),
            uid: meta.uid.name.clone(),
            gid: meta.gid.name.clone(),
            muid: meta.muid.name.clone(),
            extension: if dotu {
                meta.extension.clone()
            } else {
                String::new()
            },
            n_uid: if dotu { meta.uid.id } else { NONUNAME },
            n_gid: if dotu { meta.gid.id } else { NONUNAME },
            n_muid: if dotu { meta.muid.id } else { NONUNAME },
        }
    }
}

fn check_perm(fperm: u32, fuid: u32, fgid: u32, user: Option<&User>, perm: u32) -> Result<()> {
    let user = user.ok_or(Error::EPERM)?;

    let perm = perm & 7;
    if perm == 0 {
        return Ok(());
    }
    if fperm & 7 & perm != 0 {
        return Ok(());
    }
    if fuid == user.uid && (fperm >> 6) & 7 & perm != 0 {
        return Ok(());
    }
    if (fperm >> 3) & 7 & perm != 0 && (user.gid == fgid || user.groups.contains(&fgid)) {
        return Ok(());
    }

    Err(Error::EPERM)
}

/// The rwx bits an open mode asks for.
fn mode2perm(mode: u8) -> u32 {
    let mut m = match mode & 3 {
        om::READ => 4,
        om::WRITE => 2,
        om::RDWR => 6,
        _ => 1, // om::EXEC
    };

    if mode & om::TRUNC != 0 {
        m |= 2;
    }

    m
}

/// Per-fid state of [`TreeFs`]: the node the fid points at and the cursor
/// of an in-progress directory enumeration.
#[derive(Default)]
pub struct TreeFid {
    node: Mutex<Option<Arc<Node>>>,
    dirpos: Mutex<usize>,
    holds_excl: AtomicBool,
}

impl Drop for TreeFid {
    fn drop(&mut self) {
        // a dying fid releases its exclusive-use claim
        if self.holds_excl.load(Ordering::Relaxed) {
            if let Some(node) = lock(&self.node).as_ref() {
                node.meta().excl = false;
            }
        }
    }
}

/// Serve a user-supplied logical tree.
pub struct TreeFs {
    root: Arc<Node>,
}

impl TreeFs {
    pub fn new(root: Arc<Node>) -> TreeFs {
        TreeFs { root }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    fn node_of(fid: &Fid<TreeFid>) -> Result<Arc<Node>> {
        lock(&fid.aux.node).clone().ok_or(Error::EBADUSEFID)
    }
}

#[async_trait]
impl Filesystem for TreeFs {
    type Fid = TreeFid;

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Fcall> {
        self.root.checkperm(fid.user(), 4)?;

        *lock(&fid.aux.node) = Some(self.root.clone());
        Ok(Fcall::RAttach {
            qid: self.root.qid(),
        })
    }

    async fn clone_fid(&self, fid: &Fid<Self::Fid>, newfid: &Fid<Self::Fid>) -> Result<()> {
        *lock(&newfid.aux.node) = lock(&fid.aux.node).clone();
        Ok(())
    }

    async fn walk_one(&self, fid: &Fid<Self::Fid>, wname: &str) -> Result<QId> {
        let dir = Self::node_of(fid)?;
        if !dir.is_dir() {
            return Err(Error::ENOTDIR);
        }
        dir.checkperm(fid.user(), 1)?;

        let next = match dir.find(wname) {
            Some(node) => node,
            // walking .. out of the root stays at the root
            None if wname == ".." => dir.clone(),
            None => return Err(Error::ENOTFOUND),
        };

        let qid = next.qid();
        *lock(&fid.aux.node) = Some(next);
        Ok(qid)
    }

    async fn ropen(&self, fid: &Fid<Self::Fid>, mode: u8) -> Result<Fcall> {
        let node = Self::node_of(fid)?;
        node.checkperm(fid.user(), mode2perm(mode))?;

        {
            // exclusive-use files admit one open fid at a time
            let mut meta = node.meta();
            if meta.excl {
                return Err(Error::EOPEN);
            }
            if mode & om::EXCL != 0 || meta.mode & dm::EXCL != 0 {
                meta.excl = true;
                fid.aux.holds_excl.store(true, Ordering::Relaxed);
            }
        }

        if !node.is_dir() && mode & om::TRUNC != 0 {
            if let Err(e) = node.file_ops()?.truncate(&node, 0).await {
                if fid.aux.holds_excl.swap(false, Ordering::Relaxed) {
                    node.meta().excl = false;
                }
                return Err(e);
            }
            node.modified(fid.user());
        }

        Ok(Fcall::ROpen {
            qid: node.qid(),
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
        let dir = Self::node_of(fid)?;
        let user = fid.user().cloned().ok_or(Error::EPERM)?;

        if dir.find(name).is_some() {
            return Err(Error::EEXIST);
        }
        dir.checkperm(Some(&user), 2)?;

        // permission bits are masked against the parent's
        let mut perm = perm;
        if perm & dm::SYMLINK != 0 {
            perm |= 0o777;
        }
        let dirmode = dir.meta().mode;
        if perm & dm::DIR != 0 {
            perm &= !0o777 | (dirmode & 0o777);
        } else {
            perm &= !0o666 | (dirmode & 0o666);
        }

        let gid = dir.meta().gid.clone();
        check_perm(perm, user.uid, gid.id, Some(&user), mode2perm(mode))?;

        let child = dir
            .dir_ops()?
            .create(&dir, name, perm, &user, extension.unwrap_or(""))
            .await?;
        dir.add_child(child.clone());
        dir.modified(Some(&user));

        if mode & om::EXCL != 0 {
            child.meta().excl = true;
            fid.aux.holds_excl.store(true, Ordering::Relaxed);
        }

        let qid = child.qid();
        *lock(&fid.aux.node) = Some(child);
        *lock(&fid.aux.dirpos) = 0;

        Ok(Fcall::RCreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        let node = Self::node_of(fid)?;

        if node.is_dir() {
            let mut pos = lock(&fid.aux.dirpos);
            if offset == 0 {
                *pos = 0;
            }

            let children = node.children_snapshot();
            let mut buf = Vec::with_capacity(count as usize);
            while *pos < children.len() {
                let stat = children[*pos].stat(fid.dotu());
                let need = stat.size(fid.dotu()) as usize + 2;
                if buf.len() + need > count as usize {
                    break;
                }
                stat.encode(&mut buf, fid.dotu())?;
                *pos += 1;
            }

            node.touch_atime();
            return Ok(Fcall::RRead { data: Data(buf) });
        }

        let data = node.file_ops()?.read(&node, offset, count).await?;
        node.touch_atime();
        Ok(Fcall::RRead { data: Data(data) })
    }

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Fcall> {
        let node = Self::node_of(fid)?;

        let offset = if fid.omode().unwrap_or(0) & om::APPEND != 0 {
            node.meta().length
        } else {
            offset
        };

        let count = node.file_ops()?.write(&node, offset, &data.0).await?;
        node.modified(fid.user());
        Ok(Fcall::RWrite { count })
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let node = Self::node_of(fid)?;

        if node.is_dir() && !node.children_snapshot().is_empty() {
            return Err(Error::ENOTEMPTY);
        }

        let parent = node.parent().ok_or(Error::EPERM)?;
        parent.checkperm(fid.user(), 2)?;

        parent.dir_ops()?.remove(&parent, &node).await?;
        parent.unlink_child(&node);
        parent.modified(fid.user());

        Ok(Fcall::RRemove)
    }

    async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let node = Self::node_of(fid)?;
        Ok(Fcall::RStat {
            stat: node.stat(fid.dotu()),
        })
    }

    async fn rwstat(&self, fid: &Fid<Self::Fid>, stat: &Stat) -> Result<Fcall> {
        let node = Self::node_of(fid)?;
        let user = fid.user();

        if !stat.name.is_empty() {
            let parent = node.parent().ok_or(Error::EPERM)?;
            parent.checkperm(user, 2)?;
            if parent.find(&stat.name).is_some() {
                return Err(Error::EEXIST);
            }
        }
        if stat.length != !0u64 {
            if node.is_dir() && stat.length != 0 {
                return Err(Error::EPERM);
            }
            node.checkperm(user, 2)?;
        }
        if stat.mode != !0u32 {
            let owner = node.meta().uid.id;
            if user.map(|u| u.uid) != Some(owner) {
                return Err(Error::EPERM);
            }
        }
        if stat.mtime != !0u32 {
            node.checkperm(user, 2)?;
        }

        if stat.length != !0u64 && !node.is_dir() {
            node.file_ops()?.truncate(&node, stat.length).await?;
            node.meta().length = stat.length;
        }

        {
            let mut meta = node.meta();
            if !stat.name.is_empty() {
                meta.name = stat.name.clone();
            }
            if stat.mode != !0u32 {
                meta.mode = stat.mode;
            }
            if stat.mtime != !0u32 {
                meta.mtime = stat.mtime;
            }
            meta.version = meta.version.wrapping_add(1);
        }

        Ok(Fcall::RWStat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User {
            uname: "alice".to_owned(),
            uid: 1000,
            gid: 100,
            groups: vec![100],
        }
    }

    fn sample_tree() -> TreeFs {
        let owner = Owner::new("alice", 1000);
        let group = Owner::new("users", 100);

        let root = Node::new_dir("/", 0o755, 1, owner.clone(), group.clone(), Arc::new(RamDir::new()));
        let readme = Node::new_file(
            "README",
            0o644,
            2,
            owner.clone(),
            group.clone(),
            Arc::new(StaticFile(b"hello, tree".to_vec())),
        );
        readme.meta().length = 11;
        let sub = Node::new_dir("sub", 0o755, 3, owner, group, Arc::new(StaticDir));
        root.add_child(readme);
        root.add_child(sub);

        TreeFs::new(root)
    }

    fn attached_fid(fs: &TreeFs) -> Fid<TreeFid> {
        let fid = Fid::new(0, 1, true, TreeFid::default());
        fid.set_user(alice());
        *lock(&fid.aux.node) = Some(fs.root().clone());
        fid.set_qid_type(QIdType::DIR);
        fid
    }

    #[test]
    fn perm_bits() {
        let user = alice();

        // other bits
        assert!(check_perm(0o004, 0, 0, Some(&user), 4).is_ok());
        // owner bits apply to the owner only
        assert!(check_perm(0o600, 1000, 0, Some(&user), 4).is_ok());
        assert!(check_perm(0o600, 1001, 0, Some(&user), 4).is_err());
        // group bits require membership
        assert!(check_perm(0o040, 0, 100, Some(&user), 4).is_ok());
        assert!(check_perm(0o040, 0, 101, Some(&user), 4).is_err());
        // zero request always passes
        assert!(check_perm(0, 0, 0, Some(&user), 0).is_ok());
        assert!(check_perm(0o777, 0, 0, None, 4).is_err());
    }

    #[test]
    fn open_mode_perm_mapping() {
        assert_eq!(mode2perm(om::READ), 4);
        assert_eq!(mode2perm(om::WRITE), 2);
        assert_eq!(mode2perm(om::RDWR), 6);
        assert_eq!(mode2perm(om::EXEC), 1);
        assert_eq!(mode2perm(om::READ | om::TRUNC), 6);
    }

    #[tokio::test]
    async fn walk_and_stat() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        let qid = fs.walk_one(&fid, "README").await.unwrap();
        assert!(!qid.typ.contains(QIdType::DIR));

        match fs.rstat(&fid).await.unwrap() {
            Fcall::RStat { stat } => {
                assert_eq!(stat.name, "README");
                assert_eq!(stat.length, 11);
                assert_eq!(stat.n_uid, 1000);
            }
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn walk_missing_name() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        match fs.walk_one(&fid, "nope").await {
            Err(Error::No(ename, _)) => assert_eq!(ename, crate::error::string::ENOTFOUND),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn dotdot_at_root_stays() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        let qid = fs.walk_one(&fid, "..").await.unwrap();
        assert_eq!(qid.path, fs.root().qid().path);
    }

    #[tokio::test]
    async fn dir_read_serializes_stats() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        let data = match fs.rread(&fid, 0, 8192).await.unwrap() {
            Fcall::RRead { data } => data.0,
            rc => panic!("unexpected reply {:?}", rc),
        };
        assert!(!data.is_empty());

        // the buffer must parse back into exactly the two children
        let mut cursor = std::io::Cursor::new(&data[..]);
        let first = Stat::decode(&mut cursor, true).unwrap();
        let second = Stat::decode(&mut cursor, true).unwrap();
        assert_eq!(first.name, "README");
        assert_eq!(second.name, "sub");
        assert_eq!(cursor.position() as usize, data.len());

        // a count too small for one record yields an empty read
        let data = match fs.rread(&fid, 0, 8).await.unwrap() {
            Fcall::RRead { data } => data.0,
            rc => panic!("unexpected reply {:?}", rc),
        };
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn create_write_read_remove() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        let rc = fs
            .rcreate(&fid, "notes", 0o666, om::RDWR, None)
            .await
            .unwrap();
        match rc {
            Fcall::RCreate { qid, .. } => assert!(!qid.typ.contains(QIdType::DIR)),
            rc => panic!("unexpected reply {:?}", rc),
        }
        fid.set_omode(Some(om::RDWR));

        let count = match fs
            .rwrite(&fid, 0, &Data(b"jot".to_vec()))
            .await
            .unwrap()
        {
            Fcall::RWrite { count } => count,
            rc => panic!("unexpected reply {:?}", rc),
        };
        assert_eq!(count, 3);

        match fs.rread(&fid, 0, 100).await.unwrap() {
            Fcall::RRead { data } => assert_eq!(data.0, b"jot"),
            rc => panic!("unexpected reply {:?}", rc),
        }

        assert!(fs.root().find("notes").is_some());
        fs.rremove(&fid).await.unwrap();
        assert!(fs.root().find("notes").is_none());
    }

    #[tokio::test]
    async fn create_existing_name_fails() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        match fs.rcreate(&fid, "README", 0o644, om::READ, None).await {
            Err(Error::No(ename, _)) => assert_eq!(ename, crate::error::string::EEXIST),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn symlink_perm_masking() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        fs.rcreate(
            &fid,
            "link",
            dm::SYMLINK | 0o200,
            om::READ,
            Some("README"),
        )
        .await
        .unwrap();

        let node = lock(&fid.aux.node).clone().unwrap();
        let meta = node.meta();
        assert_eq!(meta.mode & 0o777, 0o755, "symlink bits pass the parent mask");
        assert_eq!(meta.extension, "README");
    }

    #[tokio::test]
    async fn remove_nonempty_dir_fails() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);

        match fs.rremove(&fid).await {
            // root has children and no parent; children trip first
            Err(Error::No(ename, _)) => assert_eq!(ename, crate::error::string::ENOTEMPTY),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn exclusive_open_released_on_fid_drop() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);
        fs.walk_one(&fid, "README").await.unwrap();

        fs.ropen(&fid, om::READ | om::EXCL).await.unwrap();

        let other = Fid::new(1, 1, true, TreeFid::default());
        other.set_user(alice());
        *lock(&other.aux.node) = fs.root().find("README");
        match fs.ropen(&other, om::READ).await {
            Err(Error::No(ename, _)) => assert_eq!(ename, crate::error::string::EOPEN),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }

        drop(fid);
        fs.ropen(&other, om::READ).await.unwrap();
    }

    #[tokio::test]
    async fn wstat_rename_and_mode() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);
        fs.walk_one(&fid, "README").await.unwrap();

        let mut wstat = Stat::blank();
        wstat.name = "MANUAL".to_owned();
        wstat.mode = 0o600;
        fs.rwstat(&fid, &wstat).await.unwrap();

        let node = fs.root().find("MANUAL").expect("renamed node");
        assert_eq!(node.meta().mode & 0o777, 0o600);
        assert!(fs.root().find("README").is_none());
    }

    #[tokio::test]
    async fn wstat_mode_requires_owner() {
        let fs = sample_tree();
        let fid = attached_fid(&fs);
        fs.walk_one(&fid, "README").await.unwrap();

        let mallory = User {
            uname: "mallory".to_owned(),
            uid: 666,
            gid: 666,
            groups: vec![],
        };
        let foreign = Fid::new(2, 1, true, TreeFid::default());
        foreign.set_user(mallory);
        *lock(&foreign.aux.node) = fs.root().find("README");

        let mut wstat = Stat::blank();
        wstat.mode = 0o777;
        assert!(fs.rwstat(&foreign, &wstat).await.is_err());
    }
}
