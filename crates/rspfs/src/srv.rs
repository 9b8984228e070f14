//! Asynchronous server side of the 9P2000/9P2000.u protocol.
//!
//! The session engine lives here: the per-connection fid table, message-size
//! negotiation, request dispatch with flush chains, and the connection reset
//! triggered by a renewed `Tversion`. File providers implement [`Filesystem`]
//! and receive requests only after the protocol-level checks (fid lifecycle,
//! open modes, directory offsets, size limits) have passed.
//!
//! Each decoded request runs as its own task, so responses are written in
//! handler-completion order; a provider whose handlers complete synchronously
//! therefore preserves arrival order. Exactly one response frame (or the
//! chained `Rflush` frames riding on it) is written at a time.

use {
    crate::{
        error::{Errno, Error, string},
        fcall::*,
        io_err, res, serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::{BufMut, Bytes, BytesMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::{HashMap, VecDeque},
        path::{Path, PathBuf},
        sync::{
            Arc, OnceLock,
            atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::Mutex,
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// The open-mode value of a fid that is not open
const NOMODE: u16 = !0;

/// User identity a fid operates under, as produced by the name resolver
/// consulted during attach (see [`Filesystem::lookup_user`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    /// User name
    pub uname: String,
    /// Numeric user id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
    /// Group memberships consulted by permission checks
    pub groups: Vec<u32>,
}

/// Represents a fid of clients holding associated `Filesystem::Fid`.
///
/// A fid names a position in the file tree within one connection. It is born
/// on attach/auth/walk, and dies on clunk, remove, or connection reset. The
/// session tracks the qid type of the referenced node, the open mode, and
/// the directory read offset; the provider hangs its own state off `aux`.
/// Provider cleanup belongs in `Drop` of the aux type, which runs when the
/// fid leaves the table and its last borrower lets go.
#[derive(Debug)]
pub struct Fid<T> {
    fid: u32,
    conn_id: u64,
    dotu: bool,
    qtype: AtomicU8,
    omode: AtomicU16,
    diroffset: AtomicU64,
    user: OnceLock<User>,

    /// `Filesystem::Fid` associated with this fid.
    pub aux: T,
}

impl<T> Fid<T> {
    pub(crate) fn new(fid: u32, conn_id: u64, dotu: bool, aux: T) -> Fid<T> {
        Fid {
            fid,
            conn_id,
            dotu,
            qtype: AtomicU8::new(0),
            omode: AtomicU16::new(NOMODE),
            diroffset: AtomicU64::new(0),
            user: OnceLock::new(),
            aux,
        }
    }

    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Identity of the connection the fid belongs to. Fid values are only
    /// unique within one connection; pair them with this for global keys.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Whether the owning connection speaks 9P2000.u.
    pub fn dotu(&self) -> bool {
        self.dotu
    }

    /// Qid type of the node the fid currently references.
    pub fn qid_type(&self) -> QIdType {
        QIdType::from_bits_truncate(self.qtype.load(Ordering::Relaxed))
    }

    pub(crate) fn set_qid_type(&self, typ: QIdType) {
        self.qtype.store(typ.bits(), Ordering::Relaxed);
    }

    /// The mode the fid was opened with, or `None` while not open.
    pub fn omode(&self) -> Option<u8> {
        match self.omode.load(Ordering::Relaxed) {
            NOMODE => None,
            m => Some(m as u8),
        }
    }

    pub(crate) fn set_omode(&self, omode: Option<u8>) {
        let m = omode.map(u16::from).unwrap_or(NOMODE);
        self.omode.store(m, Ordering::Relaxed);
    }

    /// Accumulated directory read offset; successive directory reads must
    /// resume exactly here (or at zero to restart).
    pub fn diroffset(&self) -> u64 {
        self.diroffset.load(Ordering::Relaxed)
    }

    pub(crate) fn set_diroffset(&self, offset: u64) {
        self.diroffset.store(offset, Ordering::Relaxed);
    }

    /// The user attached to this fid at attach/auth time.
    pub fn user(&self) -> Option<&User> {
        self.user.get()
    }

    pub(crate) fn set_user(&self, user: User) {
        let _ = self.user.set(user);
    }
}

/// Authentication provider plugged into a [`Srv`].
///
/// When present, `Tauth` creates an auth-typed fid and the provider drives
/// the authentication conversation over reads and writes on that fid;
/// `Tattach` hands the afid back for verification. Without a provider,
/// `Tauth` fails with "no authentication required".
#[async_trait]
pub trait AuthOps<T>: Send + Sync {
    /// Begin authentication on a freshly created afid. The returned qid must
    /// carry [`QIdType::AUTH`].
    async fn startauth(&self, afid: &Fid<T>, aname: &str) -> Result<QId>;

    /// Verify the afid presented by `Tattach`.
    async fn checkauth(&self, fid: &Fid<T>, afid: Option<&Fid<T>>, aname: &str) -> Result<()>;

    /// Read from the auth file.
    async fn read(&self, afid: &Fid<T>, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Write to the auth file.
    async fn write(&self, afid: &Fid<T>, offset: u64, data: &[u8]) -> Result<u32>;

    /// Release the afid.
    async fn clunk(&self, afid: &Fid<T>) -> Result<()>;
}

/// File provider trait for implementing 9P2000/9P2000.u servers.
///
/// The session engine performs the protocol-shape checks; implementors only
/// see requests on valid fids and answer with the appropriate `Fcall` reply.
/// Every method except `rattach` has a default returning "not implemented".
///
/// # Error Handling
/// Return `Err(Error::...)` to send an `Rerror` to the client; the taxonomy
/// constants on [`Error`] carry the canonical string/errno pairs, and
/// `Error::from(Errno)` converts a failed system call. `Err(Error::Io(..))`
/// from a handler is likewise reported to the client, not treated as fatal.
///
/// # Example
/// ```no_run
/// use rspfs::{srv::{Filesystem, Fid}, Fcall, QId, QIdType, Result};
/// use async_trait::async_trait;
///
/// struct Hellofs;
///
/// #[async_trait]
/// impl Filesystem for Hellofs {
///     type Fid = ();
///
///     async fn rattach(
///         &self,
///         _fid: &Fid<Self::Fid>,
///         _afid: Option<&Fid<Self::Fid>>,
///         _uname: &str,
///         _aname: &str,
///         _n_uname: u32,
///     ) -> Result<Fcall> {
///         Ok(Fcall::RAttach {
///             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// Stores per-fid state such as the current path or an open file handle.
    /// Cleanup belongs in its `Drop` implementation, which runs when the fid
    /// is clunked, removed, or destroyed by a connection reset.
    type Fid: Send + Sync + Default;

    /// Resolve the user named in `Tattach`/`Tauth` to a [`User`] record.
    ///
    /// `n_uname` is the numeric uid from 9P2000.u clients, `NONUNAME` when
    /// absent. Returning `None` fails the request with "unknown user". The
    /// default accepts any name verbatim.
    async fn lookup_user(&self, uname: &str, n_uname: u32) -> Option<User> {
        Some(User {
            uname: uname.to_owned(),
            uid: n_uname,
            gid: n_uname,
            groups: Vec::new(),
        })
    }

    /// Attach the fid to the root of the served tree and reply `Rattach`
    /// with the root's qid. The one operation every provider must implement.
    async fn rattach(
        &self,
        _fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Populate `newfid` as a second handle on `fid`'s current position.
    /// Invoked by walk when the client names a fresh destination fid.
    async fn clone_fid(&self, _fid: &Fid<Self::Fid>, _newfid: &Fid<Self::Fid>) -> Result<()> {
        Err(Error::ENOTIMPL)
    }

    /// Move `fid` one path element forward and return the qid of the node
    /// it lands on. Errors stop the walk; the session decides whether the
    /// partial prefix still constitutes a successful `Rwalk`.
    async fn walk_one(&self, _fid: &Fid<Self::Fid>, _wname: &str) -> Result<QId> {
        Err(Error::ENOTIMPL)
    }

    /// Open the fid's file. Permission checks against the fid's user happen
    /// here; the session records the open mode only on success.
    async fn ropen(&self, _fid: &Fid<Self::Fid>, _mode: u8) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Create `name` in the directory the fid references and leave the fid
    /// pointing at the new file. `extension` carries the 9P2000.u special
    /// file description (symlink target, "c|b major minor" device spec, or
    /// a decimal fid for a hard link); it is `None` on base connections.
    async fn rcreate(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _extension: Option<&str>,
    ) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Read from the fid; may return fewer bytes than requested. Directory
    /// reads return whole stat records and must honor offset zero as a
    /// restart, the only offsets the session lets through.
    async fn rread(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Write to the fid and reply with the byte count actually written.
    async fn rwrite(&self, _fid: &Fid<Self::Fid>, _offset: u64, _data: &Data) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Release the fid. The session consumes the fid regardless of the
    /// outcome; per-fid state is reclaimed through `Drop` of the aux.
    async fn rclunk(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Ok(Fcall::RClunk)
    }

    /// Remove the fid's file. The fid itself is consumed either way.
    async fn rremove(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Produce the stat record of the fid's file.
    async fn rstat(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Apply the non-sentinel fields of `stat` to the fid's file. The
    /// session has already rejected changes to type, dev, and qid, and
    /// directory/file conversions.
    async fn rwstat(&self, _fid: &Fid<Self::Fid>, _stat: &Stat) -> Result<Fcall> {
        Err(Error::ENOTIMPL)
    }

    /// Best-effort cancellation of the in-flight request with tag `oldtag`.
    ///
    /// Return `true` if the request was cancelled and the flush may be
    /// answered immediately; `false` (the default) chains the flush behind
    /// the target's eventual response.
    async fn rflush(&self, _oldtag: u16) -> bool {
        false
    }
}

/// A 9P server: the file provider plus process-wide dispatch state.
pub struct Srv<Fs: Filesystem> {
    fs: Arc<Fs>,
    auth: Option<Arc<dyn AuthOps<Fs::Fid>>>,
    msize: u32,
    dotu: bool,
    // preallocated memory-exhaustion replies, one per protocol mode
    rcenomem: Bytes,
    rcenomemu: Bytes,
}

impl<Fs: 'static + Filesystem> Srv<Fs> {
    pub fn new(fs: Fs) -> Srv<Fs> {
        Srv {
            fs: Arc::new(fs),
            auth: None,
            msize: DEFAULT_MSIZE,
            dotu: true,
            rcenomem: premade_rerror(false),
            rcenomemu: premade_rerror(true),
        }
    }

    /// Set the maximum message size offered during version negotiation.
    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    /// Enable or disable the 9P2000.u extension (enabled by default).
    pub fn dotu(mut self, dotu: bool) -> Self {
        self.dotu = dotu;
        self
    }

    /// Plug in an authentication provider.
    pub fn auth(mut self, auth: Arc<dyn AuthOps<Fs::Fid>>) -> Self {
        self.auth = Some(auth);
        self
    }

    fn enomem_frame(&self, dotu: bool, tag: u16) -> Bytes {
        let template = if dotu { &self.rcenomemu } else { &self.rcenomem };
        let mut frame = BytesMut::from(&template[..]);
        // type[1] precedes the tag; the size prefix is the framing layer's
        frame[1] = tag as u8;
        frame[2] = (tag >> 8) as u8;
        frame.freeze()
    }

    /// Serve one already-connected byte stream.
    ///
    /// Transport accept loops hand their streams here; the function returns
    /// when the peer disconnects or commits a protocol-shape violation.
    pub async fn dispatch<Reader, Writer>(
        self: Arc<Self>,
        reader: Reader,
        writer: Writer,
    ) -> Result<()>
    where
        Reader: 'static + AsyncRead + Send + Unpin,
        Writer: 'static + AsyncWrite + Send + Unpin,
    {
        static CONN_IDS: AtomicU64 = AtomicU64::new(1);

        let conn = Arc::new(ConnState {
            conn_id: CONN_IDS.fetch_add(1, Ordering::Relaxed),
            msize: AtomicU32::new(self.msize),
            dotu: AtomicBool::new(self.dotu),
            fids: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            srv: self,
        });

        let mut framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_read(reader);
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer);
        let framedwrite = Arc::new(Mutex::new(framedwrite));

        let mut tasks = JoinSet::new();
        let result = conn_loop(&conn, &mut framedread, &framedwrite, &mut tasks).await;

        // connection shutdown: drop in-flight work, then every fid
        tasks.shutdown().await;
        conn.fids.lock().await.clear();

        result
    }
}

fn premade_rerror(dotu: bool) -> Bytes {
    let msg = Msg {
        tag: NOTAG,
        body: Fcall::RError {
            ename: string::ENOMEM.to_owned(),
            ecode: Errno::ENOMEM as i32 as u32,
        },
    };

    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    let _ = serialize::write_msg(&mut buf, &msg, dotu);
    Bytes::from(buf)
}

struct ConnState<Fs: Filesystem> {
    srv: Arc<Srv<Fs>>,
    conn_id: u64,
    msize: AtomicU32,
    dotu: AtomicBool,
    fids: Mutex<HashMap<u32, Arc<Fid<Fs::Fid>>>>,
    // tag of every in-flight request, with the flush tags chained behind it
    inflight: Mutex<HashMap<u16, Vec<u16>>>,
}

async fn conn_loop<Fs, Reader, Writer>(
    conn: &Arc<ConnState<Fs>>,
    framedread: &mut FramedRead<Reader, LengthDelimitedCodec>,
    framedwrite: &Arc<Mutex<FramedWrite<Writer, LengthDelimitedCodec>>>,
    tasks: &mut JoinSet<()>,
) -> Result<()>
where
    Fs: 'static + Filesystem,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        if bytes.len() + 4 > conn.msize() as usize {
            return res!(io_err!(InvalidData, "Message exceeds negotiated msize"));
        }

        let msg = serialize::read_msg(&bytes, conn.dotu())?;
        info!("\t← {:?}", msg);

        match msg.body {
            // version and flush manipulate session state and are answered
            // from the read task itself
            Fcall::TVersion { msize, version } => {
                let res = conn.op_version(tasks, msize, &version).await;
                respond(conn, framedwrite, msg.tag, res).await;
            }
            Fcall::TFlush { oldtag } => {
                if let Some(res) = conn.op_flush(msg.tag, oldtag).await {
                    respond(conn, framedwrite, msg.tag, res).await;
                }
            }
            body => {
                while tasks.try_join_next().is_some() {}

                conn.inflight.lock().await.insert(msg.tag, Vec::new());

                let conn = conn.clone();
                let framedwrite = framedwrite.clone();
                let tag = msg.tag;
                tasks.spawn(async move {
                    let res = conn.process(body).await;
                    respond(&conn, &framedwrite, tag, res).await;
                });
            }
        }
    }

    Ok(())
}

fn encode_frame(msg: &Msg, dotu: bool) -> ::std::io::Result<Bytes> {
    let mut writer = BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut writer, msg, dotu)?;
    Ok(writer.into_inner().freeze())
}

/// Write the response for `tag`, followed by every `Rflush` chained behind
/// it, in posting order, as one uninterrupted sequence.
async fn respond<Fs, Writer>(
    conn: &ConnState<Fs>,
    framedwrite: &Mutex<FramedWrite<Writer, LengthDelimitedCodec>>,
    tag: u16,
    res: Result<Fcall>,
) where
    Fs: 'static + Filesystem,
    Writer: AsyncWrite + Unpin,
{
    let dotu = conn.dotu();

    // Detach this tag and, transitively, any flushes riding on it. Holding
    // the in-flight table across the writes keeps a late Tflush from
    // slipping between a response and its chained Rflushes.
    let mut inflight = conn.inflight.lock().await;
    let mut flushes = Vec::new();
    let mut queue: VecDeque<u16> = inflight.remove(&tag).unwrap_or_default().into();
    while let Some(ftag) = queue.pop_front() {
        flushes.push(ftag);
        if let Some(chain) = inflight.remove(&ftag) {
            queue.extend(chain);
        }
    }

    let (msg, premade) = match res {
        Ok(body) => (Msg { tag, body }, None),
        Err(e) => {
            let premade = e.is_enomem().then(|| conn.srv.enomem_frame(dotu, tag));
            let body = Fcall::RError {
                ename: e.ename().into_owned(),
                ecode: if dotu { e.errno() as i32 as u32 } else { 0 },
            };
            (Msg { tag, body }, premade)
        }
    };

    debug_assert!(MsgType::from(&msg.body).is_r());
    let frame = match premade {
        Some(frame) => Ok(frame),
        None => encode_frame(&msg, dotu),
    };

    let mut writer = framedwrite.lock().await;
    match frame {
        Ok(frame) => {
            if let Err(e) = writer.send(frame).await {
                error!("Failed to send response for tag {}: {:?}", tag, e);
                return;
            }
            info!("\t→ {:?}", msg);
        }
        Err(e) => {
            error!("Failed to serialize response for tag {}: {:?}", tag, e);
            return;
        }
    }

    for ftag in flushes {
        let flush = Msg {
            tag: ftag,
            body: Fcall::RFlush,
        };
        match encode_frame(&flush, dotu) {
            Ok(frame) => {
                if let Err(e) = writer.send(frame).await {
                    error!("Failed to send Rflush for tag {}: {:?}", ftag, e);
                    return;
                }
                info!("\t→ {:?}", flush);
            }
            Err(e) => {
                error!("Failed to serialize Rflush for tag {}: {:?}", ftag, e);
                return;
            }
        }
    }
}

impl<Fs: 'static + Filesystem> ConnState<Fs> {
    fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    fn dotu(&self) -> bool {
        self.dotu.load(Ordering::Relaxed)
    }

    async fn fid_find(&self, fid: u32) -> Option<Arc<Fid<Fs::Fid>>> {
        self.fids.lock().await.get(&fid).cloned()
    }

    async fn fid_create(&self, fid: u32) -> Result<Arc<Fid<Fs::Fid>>> {
        let mut fids = self.fids.lock().await;
        if fids.contains_key(&fid) {
            return Err(Error::EINUSE);
        }

        let f = Arc::new(Fid::new(fid, self.conn_id, self.dotu(), Fs::Fid::default()));
        fids.insert(fid, f.clone());
        Ok(f)
    }

    async fn fid_remove(&self, fid: u32) {
        self.fids.lock().await.remove(&fid);
    }

    /// Negotiate version and msize, then reset the connection: beg
    /// cancellation of every in-flight request, wait for them to drain, and
    /// discard the fid table. The reply goes out only after the drain, so
    /// the client observes it past every pre-reset response.
    async fn op_version(
        &self,
        tasks: &mut JoinSet<()>,
        client_msize: u32,
        version: &str,
    ) -> Result<Fcall> {
        if client_msize < IOHDRSZ + 1 {
            return Err(Error::ESMALLMSIZE);
        }

        let dotu = if version == P92000U && self.srv.dotu {
            true
        } else if version.starts_with(P92000) {
            false
        } else {
            return Err(Error::EBADVERSION);
        };

        let msize = client_msize.min(self.srv.msize);

        // In-flight requests must finish before the old state goes away; the
        // provider's rflush is its cue to cut long work short.
        let pending: Vec<u16> = self.inflight.lock().await.keys().copied().collect();
        for oldtag in pending {
            self.srv.fs.rflush(oldtag).await;
        }
        while tasks.join_next().await.is_some() {}

        self.fids.lock().await.clear();
        self.inflight.lock().await.clear();
        self.msize.store(msize, Ordering::Relaxed);
        self.dotu.store(dotu, Ordering::Relaxed);

        Ok(Fcall::RVersion {
            msize,
            version: if dotu { P92000U } else { P92000 }.to_owned(),
        })
    }

    /// Chain the flush behind its target, or answer it immediately when the
    /// target is gone (or the provider reports a successful cancel).
    /// `None` means the reply is deferred until the target responds.
    async fn op_flush(&self, tag: u16, oldtag: u16) -> Option<Result<Fcall>> {
        let first_flush = match self.inflight.lock().await.get(&oldtag) {
            Some(chain) => chain.is_empty(),
            None => return Some(Ok(Fcall::RFlush)),
        };

        if first_flush && self.srv.fs.rflush(oldtag).await {
            return Some(Ok(Fcall::RFlush));
        }

        let mut inflight = self.inflight.lock().await;
        match inflight.get_mut(&oldtag) {
            Some(chain) => {
                chain.push(tag);
                // the flush itself becomes flushable
                inflight.insert(tag, Vec::new());
                None
            }
            // the target answered while the provider was consulted
            None => Some(Ok(Fcall::RFlush)),
        }
    }

    async fn process(&self, body: Fcall) -> Result<Fcall> {
        match body {
            Fcall::TAuth {
                afid,
                uname,
                aname,
                n_uname,
            } => self.op_auth(afid, &uname, &aname, n_uname).await,
            Fcall::TAttach {
                fid,
                afid,
                uname,
                aname,
                n_uname,
            } => self.op_attach(fid, afid, &uname, &aname, n_uname).await,
            Fcall::TWalk {
                fid,
                newfid,
                wnames,
            } => self.op_walk(fid, newfid, &wnames).await,
            Fcall::TOpen { fid, mode } => self.op_open(fid, mode).await,
            Fcall::TCreate {
                fid,
                name,
                perm,
                mode,
                extension,
            } => self.op_create(fid, &name, perm, mode, &extension).await,
            Fcall::TRead { fid, offset, count } => self.op_read(fid, offset, count).await,
            Fcall::TWrite { fid, offset, data } => self.op_write(fid, offset, &data).await,
            Fcall::TClunk { fid } => self.op_clunk(fid).await,
            Fcall::TRemove { fid } => self.op_remove(fid).await,
            Fcall::TStat { fid } => self.op_stat(fid).await,
            Fcall::TWStat { fid, stat } => self.op_wstat(fid, &stat).await,
            _ => Err(Error::new("unsupported message", Errno::ENOSYS)),
        }
    }

    async fn op_auth(&self, afid_h: u32, uname: &str, aname: &str, n_uname: u32) -> Result<Fcall> {
        let afid = self.fid_create(afid_h).await?;

        let res = async {
            let user = self
                .srv
                .fs
                .lookup_user(uname, n_uname)
                .await
                .ok_or(Error::EUNKNOWNUSER)?;
            afid.set_user(user);
            afid.set_qid_type(QIdType::AUTH);

            let auth = self.srv.auth.as_ref().ok_or(Error::ENOAUTH)?;
            let aqid = auth.startauth(&afid, aname).await?;
            debug_assert!(aqid.typ.contains(QIdType::AUTH));

            Ok(Fcall::RAuth { aqid })
        }
        .await;

        if res.is_err() {
            self.fid_remove(afid_h).await;
        }
        res
    }

    async fn op_attach(
        &self,
        fid_h: u32,
        afid_h: u32,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<Fcall> {
        let fid = self.fid_create(fid_h).await?;

        let res = async {
            let afid = if afid_h != NOFID {
                let afid = self.fid_find(afid_h).await.ok_or(Error::EUNKNOWNFID)?;
                if !afid.qid_type().contains(QIdType::AUTH) {
                    return Err(Error::EBADUSEFID);
                }
                Some(afid)
            } else {
                None
            };

            let user = self
                .srv
                .fs
                .lookup_user(uname, n_uname)
                .await
                .ok_or(Error::EUNKNOWNUSER)?;
            fid.set_user(user);

            if let Some(auth) = &self.srv.auth {
                auth.checkauth(&fid, afid.as_deref(), aname).await?;
            }

            let rc = self
                .srv
                .fs
                .rattach(&fid, afid.as_deref(), uname, aname, n_uname)
                .await?;
            if let Fcall::RAttach { qid } = &rc {
                fid.set_qid_type(qid.typ);
            }
            Ok(rc)
        }
        .await;

        if res.is_err() {
            self.fid_remove(fid_h).await;
        }
        res
    }

    async fn op_walk(&self, fid_h: u32, newfid_h: u32, wnames: &[String]) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if !fid.qid_type().contains(QIdType::DIR) {
            return Err(Error::ENOTDIR);
        }
        if fid.omode().is_some() {
            return Err(Error::EBADUSEFID);
        }
        if wnames.len() > MAXWELEM {
            return Err(Error::ETOOMANYWNAMES);
        }

        let split = fid_h != newfid_h;
        let walkfid = if split {
            let newfid = self.fid_create(newfid_h).await?;
            if let Err(e) = self.srv.fs.clone_fid(&fid, &newfid).await {
                self.fid_remove(newfid_h).await;
                return Err(e);
            }
            if let Some(user) = fid.user() {
                newfid.set_user(user.clone());
            }
            newfid.set_qid_type(fid.qid_type());
            newfid
        } else {
            fid
        };

        let mut wqids = Vec::with_capacity(wnames.len());
        for (i, wname) in wnames.iter().enumerate() {
            match self.srv.fs.walk_one(&walkfid, wname).await {
                Ok(wqid) => {
                    walkfid.set_qid_type(wqid.typ);
                    wqids.push(wqid);

                    if !wqid.typ.contains(QIdType::DIR) && i + 1 < wnames.len() {
                        break;
                    }
                }
                Err(e) => {
                    if wqids.is_empty() {
                        // nothing walked: the newfid must not come to exist
                        if split {
                            self.fid_remove(newfid_h).await;
                        }
                        return Err(e);
                    }
                    break;
                }
            }
        }

        Ok(Fcall::RWalk { wqids })
    }

    async fn op_open(&self, fid_h: u32, mode: u8) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if fid.omode().is_some() {
            return Err(Error::EBADUSEFID);
        }
        if fid.qid_type().contains(QIdType::DIR) && mode != om::READ {
            return Err(Error::EPERM);
        }

        let rc = self.srv.fs.ropen(&fid, mode).await?;
        fid.set_omode(Some(mode));
        fid.set_diroffset(0);
        Ok(rc)
    }

    async fn op_create(
        &self,
        fid_h: u32,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if fid.omode().is_some() {
            return Err(Error::EBADUSEFID);
        }
        if !fid.qid_type().contains(QIdType::DIR) {
            return Err(Error::ENOTDIR);
        }
        if name == "." || name == ".." {
            return Err(Error::EEXIST);
        }
        if perm & dm::DIR != 0 && mode != om::READ {
            return Err(Error::EPERM);
        }
        if perm & dm::SPECIAL != 0 && !self.dotu() {
            return Err(Error::EPERM);
        }

        let ext = if self.dotu() { Some(extension) } else { None };
        let rc = self.srv.fs.rcreate(&fid, name, perm, mode, ext).await?;
        if let Fcall::RCreate { qid, .. } = &rc {
            fid.set_omode(Some(mode));
            fid.set_qid_type(qid.typ);
            fid.set_diroffset(0);
        }
        Ok(rc)
    }

    async fn op_read(&self, fid_h: u32, offset: u64, count: u32) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if count.saturating_add(IOHDRSZ) > self.msize() {
            return Err(Error::ETOOLARGE);
        }

        if fid.qid_type().contains(QIdType::AUTH) {
            let auth = self.srv.auth.as_ref().ok_or(Error::EBADUSEFID)?;
            let data = auth.read(&fid, offset, count).await?;
            return Ok(Fcall::RRead { data: Data(data) });
        }

        match fid.omode() {
            None => return Err(Error::EBADUSEFID),
            Some(m) if m & 3 == om::WRITE => return Err(Error::EBADUSEFID),
            Some(_) => {}
        }

        let isdir = fid.qid_type().contains(QIdType::DIR);
        if isdir {
            if offset != 0 && offset != fid.diroffset() {
                return Err(Error::EBADOFFSET);
            }
            if offset == 0 {
                fid.set_diroffset(0);
            }
        }

        let rc = self.srv.fs.rread(&fid, offset, count).await?;
        if isdir {
            if let Fcall::RRead { data } = &rc {
                fid.set_diroffset(offset + data.0.len() as u64);
            }
        }
        Ok(rc)
    }

    async fn op_write(&self, fid_h: u32, offset: u64, data: &Data) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if fid.qid_type().contains(QIdType::AUTH) {
            let auth = self.srv.auth.as_ref().ok_or(Error::EBADUSEFID)?;
            let count = auth.write(&fid, offset, &data.0).await?;
            return Ok(Fcall::RWrite { count });
        }

        match fid.omode() {
            None => return Err(Error::EBADUSEFID),
            Some(_) if fid.qid_type().contains(QIdType::DIR) => return Err(Error::EBADUSEFID),
            Some(m) if m & 3 == om::READ => return Err(Error::EBADUSEFID),
            Some(_) => {}
        }

        if (data.0.len() as u32).saturating_add(IOHDRSZ) > self.msize() {
            return Err(Error::ETOOLARGE);
        }

        self.srv.fs.rwrite(&fid, offset, data).await
    }

    async fn op_clunk(&self, fid_h: u32) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if fid.qid_type().contains(QIdType::AUTH) {
            // without an auth provider the fid survives, as a bad use
            let auth = self.srv.auth.as_ref().ok_or(Error::EBADUSEFID)?;
            let res = auth.clunk(&fid).await;
            self.fid_remove(fid_h).await;
            return res.map(|()| Fcall::RClunk);
        }

        let res = match fid.omode() {
            Some(m) if m & om::RCLOSE != 0 => {
                // remove-on-close: Rclunk only if the remove went through
                self.srv.fs.rremove(&fid).await.map(|_| Fcall::RClunk)
            }
            _ => self.srv.fs.rclunk(&fid).await,
        };

        // the fid is consumed no matter how the provider fared
        self.fid_remove(fid_h).await;
        res
    }

    async fn op_remove(&self, fid_h: u32) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        let res = self.srv.fs.rremove(&fid).await;
        self.fid_remove(fid_h).await;
        res
    }

    async fn op_stat(&self, fid_h: u32) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;
        self.srv.fs.rstat(&fid).await
    }

    async fn op_wstat(&self, fid_h: u32, stat: &Stat) -> Result<Fcall> {
        let fid = self.fid_find(fid_h).await.ok_or(Error::EUNKNOWNFID)?;

        if stat.typ != !0u16
            || stat.dev != !0u32
            || stat.qid.version != !0u32
            || stat.qid.path != !0u64
        {
            return Err(Error::EPERM);
        }

        if stat.mode != !0u32 {
            let isdir = fid.qid_type().contains(QIdType::DIR);
            if isdir != (stat.mode & dm::DIR != 0) {
                return Err(Error::EDIRCHANGE);
            }
        }

        self.srv.fs.rwstat(&fid, stat).await
    }
}

async fn srv_async_tcp<Fs>(srv: Arc<Srv<Fs>>, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = srv.dispatch(readhalf, writehalf).await {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

async fn srv_async_unix<Fs>(srv: Arc<Srv<Fs>>, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let srv = srv.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    if let Err(e) = srv.dispatch(readhalf, writehalf).await {
                        error!("Error: {:?}", e);
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
        }
    }
}

impl<Fs: 'static + Filesystem> Srv<Fs> {
    /// Start serving on `addr` (`tcp!host!port` or `unix!path`).
    pub async fn listen(self, addr: &str) -> Result<()> {
        let srv = Arc::new(self);
        let (proto, listen_addr) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

        match proto {
            "tcp" => srv_async_tcp(srv, &listen_addr).await,
            "unix" => srv_async_unix(srv, &listen_addr).await,
            _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
        }
    }
}

/// Serve `filesystem` with default settings (9P2000.u enabled) on `addr`.
///
/// The address format is `proto!address!port`, e.g. `tcp!0.0.0.0!564` or
/// `unix!/tmp/rspfs-socket`.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    Srv::new(filesystem).listen(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct TestAux {
        path: std::sync::Mutex<String>,
    }

    impl TestAux {
        fn get(&self) -> String {
            self.path.lock().unwrap().clone()
        }

        fn set(&self, path: &str) {
            *self.path.lock().unwrap() = path.to_owned();
        }
    }

    /// A tiny two-level tree: `/` holds directory `a` and files `f`, `slow`
    /// (gated on a Notify), and `oom` (whose stat fails with Enomem).
    struct TestFs {
        slow_gate: Arc<Notify>,
        removed: Arc<AtomicBool>,
    }

    fn qid(typ: QIdType, path: u64) -> QId {
        QId {
            typ,
            version: 0,
            path,
        }
    }

    #[async_trait]
    impl Filesystem for TestFs {
        type Fid = TestAux;

        async fn rattach(
            &self,
            fid: &Fid<Self::Fid>,
            _afid: Option<&Fid<Self::Fid>>,
            _uname: &str,
            _aname: &str,
            _n_uname: u32,
        ) -> Result<Fcall> {
            fid.aux.set("");
            Ok(Fcall::RAttach {
                qid: qid(QIdType::DIR, 1),
            })
        }

        async fn clone_fid(&self, fid: &Fid<Self::Fid>, newfid: &Fid<Self::Fid>) -> Result<()> {
            newfid.aux.set(&fid.aux.get());
            Ok(())
        }

        async fn walk_one(&self, fid: &Fid<Self::Fid>, wname: &str) -> Result<QId> {
            let (wqid, path) = match (fid.aux.get().as_str(), wname) {
                (_, "..") => (qid(QIdType::DIR, 1), ""),
                ("", "a") => (qid(QIdType::DIR, 2), "a"),
                ("", "f") => (qid(QIdType::FILE, 3), "f"),
                ("", "slow") => (qid(QIdType::FILE, 4), "slow"),
                ("", "oom") => (qid(QIdType::FILE, 5), "oom"),
                _ => return Err(Error::ENOTFOUND),
            };

            fid.aux.set(path);
            Ok(wqid)
        }

        async fn ropen(&self, fid: &Fid<Self::Fid>, _mode: u8) -> Result<Fcall> {
            Ok(Fcall::ROpen {
                qid: qid(fid.qid_type(), 0),
                iounit: 0,
            })
        }

        async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, _count: u32) -> Result<Fcall> {
            if fid.qid_type().contains(QIdType::DIR) {
                let data = if offset == 0 { vec![0; 64] } else { Vec::new() };
                return Ok(Fcall::RRead { data: Data(data) });
            }

            if fid.aux.get() == "slow" {
                self.slow_gate.notified().await;
            }
            Ok(Fcall::RRead {
                data: Data(b"hello".to_vec()),
            })
        }

        async fn rwrite(&self, _fid: &Fid<Self::Fid>, _offset: u64, data: &Data) -> Result<Fcall> {
            Ok(Fcall::RWrite {
                count: data.0.len() as u32,
            })
        }

        async fn rremove(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
            self.removed.store(true, Ordering::Relaxed);
            Ok(Fcall::RRemove)
        }

        async fn rstat(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
            if fid.aux.get() == "oom" {
                return Err(Error::ENOMEM);
            }

            Ok(Fcall::RStat {
                stat: Stat {
                    qid: qid(fid.qid_type(), 1),
                    name: fid.aux.get(),
                    ..Stat::blank()
                },
            })
        }

        async fn rwstat(&self, _fid: &Fid<Self::Fid>, _stat: &Stat) -> Result<Fcall> {
            Ok(Fcall::RWStat)
        }
    }

    struct TestAuth;

    #[async_trait]
    impl AuthOps<TestAux> for TestAuth {
        async fn startauth(&self, _afid: &Fid<TestAux>, _aname: &str) -> Result<QId> {
            Ok(qid(QIdType::AUTH, 99))
        }

        async fn checkauth(
            &self,
            _fid: &Fid<TestAux>,
            afid: Option<&Fid<TestAux>>,
            _aname: &str,
        ) -> Result<()> {
            match afid {
                Some(_) => Ok(()),
                None => Err(Error::EPERM),
            }
        }

        async fn read(&self, _afid: &Fid<TestAux>, _offset: u64, _count: u32) -> Result<Vec<u8>> {
            Ok(b"token".to_vec())
        }

        async fn write(&self, _afid: &Fid<TestAux>, _offset: u64, data: &[u8]) -> Result<u32> {
            Ok(data.len() as u32)
        }

        async fn clunk(&self, _afid: &Fid<TestAux>) -> Result<()> {
            Ok(())
        }
    }

    struct Client {
        stream: DuplexStream,
        dotu: bool,
    }

    impl Client {
        async fn send(&mut self, tag: u16, body: Fcall) {
            let mut payload = Vec::new();
            Msg { tag, body }.encode(&mut payload, self.dotu).unwrap();

            let mut frame = ((payload.len() + 4) as u32).to_le_bytes().to_vec();
            frame.extend_from_slice(&payload);
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn try_recv(&mut self) -> ::std::io::Result<Msg> {
            let mut szbuf = [0; 4];
            self.stream.read_exact(&mut szbuf).await?;
            let size = u32::from_le_bytes(szbuf) as usize;

            let mut payload = vec![0; size - 4];
            self.stream.read_exact(&mut payload).await?;
            serialize::read_msg(&payload, self.dotu)
        }

        async fn recv(&mut self) -> Msg {
            self.try_recv().await.unwrap()
        }

        async fn rpc(&mut self, tag: u16, body: Fcall) -> Fcall {
            self.send(tag, body).await;
            let reply = self.recv().await;
            assert_eq!(reply.tag, tag);
            reply.body
        }

        async fn version(&mut self) {
            let rc = self
                .rpc(
                    NOTAG,
                    Fcall::TVersion {
                        msize: 8192,
                        version: P92000U.to_owned(),
                    },
                )
                .await;
            assert_eq!(
                rc,
                Fcall::RVersion {
                    msize: 8192,
                    version: P92000U.to_owned(),
                }
            );
        }

        async fn attach(&mut self, fid: u32) {
            match self
                .rpc(
                    1,
                    Fcall::TAttach {
                        fid,
                        afid: NOFID,
                        uname: "alice".to_owned(),
                        aname: "/".to_owned(),
                        n_uname: 1000,
                    },
                )
                .await
            {
                Fcall::RAttach { qid } => assert!(qid.typ.contains(QIdType::DIR)),
                rc => panic!("unexpected reply {:?}", rc),
            }
        }

        async fn walk(&mut self, fid: u32, newfid: u32, wnames: &[&str]) -> Fcall {
            self.rpc(
                2,
                Fcall::TWalk {
                    fid,
                    newfid,
                    wnames: wnames.iter().map(|s| s.to_string()).collect(),
                },
            )
            .await
        }
    }

    fn ename_of(rc: Fcall) -> String {
        match rc {
            Fcall::RError { ename, .. } => ename,
            rc => panic!("expected Rerror, got {:?}", rc),
        }
    }

    fn test_fs() -> (TestFs, Arc<Notify>, Arc<AtomicBool>) {
        let gate = Arc::new(Notify::new());
        let removed = Arc::new(AtomicBool::new(false));
        (
            TestFs {
                slow_gate: gate.clone(),
                removed: removed.clone(),
            },
            gate,
            removed,
        )
    }

    fn serve(srv: Srv<TestFs>) -> Client {
        let (client_end, server_end) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(server_end);

        tokio::spawn(async move {
            let _ = Arc::new(srv).dispatch(reader, writer).await;
        });

        Client {
            stream: client_end,
            dotu: true,
        }
    }

    fn serve_default() -> Client {
        serve(Srv::new(test_fs().0))
    }

    #[tokio::test]
    async fn version_negotiation() {
        let mut client = serve_default();
        client.version().await;

        // a huge client msize clamps to the server's default
        match client
            .rpc(
                NOTAG,
                Fcall::TVersion {
                    msize: 1 << 20,
                    version: P92000U.to_owned(),
                },
            )
            .await
        {
            Fcall::RVersion { msize, version } => {
                assert_eq!(msize, DEFAULT_MSIZE);
                assert_eq!(version, P92000U);
            }
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn version_msize_floor() {
        let mut client = serve_default();
        let rc = client
            .rpc(
                NOTAG,
                Fcall::TVersion {
                    msize: IOHDRSZ,
                    version: P92000U.to_owned(),
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::ESMALLMSIZE);
    }

    #[tokio::test]
    async fn version_unknown_rejected() {
        let mut client = serve_default();
        let rc = client
            .rpc(
                NOTAG,
                Fcall::TVersion {
                    msize: 8192,
                    version: "9P1871".to_owned(),
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::EBADVERSION);
    }

    #[tokio::test]
    async fn version_prefix_reduces_to_base() {
        let mut client = serve_default();
        match client
            .rpc(
                NOTAG,
                Fcall::TVersion {
                    msize: 8192,
                    version: "9P2000.L".to_owned(),
                },
            )
            .await
        {
            Fcall::RVersion { version, .. } => assert_eq!(version, P92000),
            rc => panic!("unexpected reply {:?}", rc),
        }
        client.dotu = false;

        client.attach(0).await;
        // base-mode errors carry no ecode; decoding in base mode must fit
        let rc = client.walk(0, 1, &["nope"]).await;
        assert_eq!(ename_of(rc), string::ENOTFOUND);
    }

    #[tokio::test]
    async fn attach_duplicate_fid() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        let rc = client
            .rpc(
                3,
                Fcall::TAttach {
                    fid: 0,
                    afid: NOFID,
                    uname: "alice".to_owned(),
                    aname: "/".to_owned(),
                    n_uname: 1000,
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::EINUSE);
    }

    #[tokio::test]
    async fn walk_partial_keeps_prefix_fid() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        match client.walk(0, 1, &["a", "zz"]).await {
            Fcall::RWalk { wqids } => {
                assert_eq!(wqids.len(), 1);
                assert!(wqids[0].typ.contains(QIdType::DIR));
            }
            rc => panic!("unexpected reply {:?}", rc),
        }

        // one name succeeded, so fid 1 exists and points at the prefix
        match client.rpc(4, Fcall::TStat { fid: 1 }).await {
            Fcall::RStat { stat } => assert_eq!(stat.name, "a"),
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn walk_total_failure_removes_newfid() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        let rc = client.walk(0, 2, &["zz"]).await;
        assert_eq!(ename_of(rc), string::ENOTFOUND);

        let rc = client.rpc(4, Fcall::TStat { fid: 2 }).await;
        assert_eq!(ename_of(rc), string::EUNKNOWNFID);
    }

    #[tokio::test]
    async fn walk_zero_names_dups_fid() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        match client.walk(0, 3, &[]).await {
            Fcall::RWalk { wqids } => assert!(wqids.is_empty()),
            rc => panic!("unexpected reply {:?}", rc),
        }

        match client.rpc(4, Fcall::TStat { fid: 3 }).await {
            Fcall::RStat { .. } => {}
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn walk_element_limit() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        let sixteen = vec!["a"; MAXWELEM];
        match client.walk(0, 5, &sixteen).await {
            // the first element walks, the second fails: partial reply
            Fcall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
            rc => panic!("unexpected reply {:?}", rc),
        }

        let seventeen = vec!["a"; MAXWELEM + 1];
        let rc = client.walk(0, 6, &seventeen).await;
        assert_eq!(ename_of(rc), string::ETOOMANYWNAMES);
    }

    #[tokio::test]
    async fn walk_from_open_fid_fails() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        client.walk(0, 1, &[]).await;
        match client
            .rpc(5, Fcall::TOpen { fid: 1, mode: om::READ })
            .await
        {
            Fcall::ROpen { .. } => {}
            rc => panic!("unexpected reply {:?}", rc),
        }

        let rc = client.walk(1, 2, &["a"]).await;
        assert_eq!(ename_of(rc), string::EBADUSEFID);
    }

    #[tokio::test]
    async fn open_dir_write_rejected() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        let rc = client
            .rpc(5, Fcall::TOpen { fid: 0, mode: om::WRITE })
            .await;
        assert_eq!(ename_of(rc), string::EPERM);
    }

    #[tokio::test]
    async fn read_file() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;
        client
            .rpc(5, Fcall::TOpen { fid: 1, mode: om::READ })
            .await;

        match client
            .rpc(
                6,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 100,
                },
            )
            .await
        {
            Fcall::RRead { data } => assert_eq!(data.0, b"hello"),
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn read_unopened_fid_fails() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;

        let rc = client
            .rpc(
                6,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 100,
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::EBADUSEFID);
    }

    #[tokio::test]
    async fn read_count_limit() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;
        client
            .rpc(5, Fcall::TOpen { fid: 1, mode: om::READ })
            .await;

        let rc = client
            .rpc(
                6,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 9000,
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::ETOOLARGE);
    }

    #[tokio::test]
    async fn directory_offset_rule() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["a"]).await;
        client
            .rpc(5, Fcall::TOpen { fid: 1, mode: om::READ })
            .await;

        let first = client
            .rpc(
                6,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 1000,
                },
            )
            .await;
        let returned = match first {
            Fcall::RRead { data } => data.0.len() as u64,
            rc => panic!("unexpected reply {:?}", rc),
        };
        assert_eq!(returned, 64);

        // an offset that is neither zero nor the cursor fails
        let rc = client
            .rpc(
                7,
                Fcall::TRead {
                    fid: 1,
                    offset: 500,
                    count: 100,
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::EBADOFFSET);

        // resuming at the cursor drains the directory
        match client
            .rpc(
                8,
                Fcall::TRead {
                    fid: 1,
                    offset: returned,
                    count: 100,
                },
            )
            .await
        {
            Fcall::RRead { data } => assert!(data.0.is_empty()),
            rc => panic!("unexpected reply {:?}", rc),
        }

        // offset zero restarts the enumeration
        match client
            .rpc(
                9,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 1000,
                },
            )
            .await
        {
            Fcall::RRead { data } => assert_eq!(data.0.len(), 64),
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn flush_chain_order() {
        let (fs, gate, _) = test_fs();
        let mut client = serve(Srv::new(fs));
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["slow"]).await;
        client
            .rpc(5, Fcall::TOpen { fid: 1, mode: om::READ })
            .await;

        client
            .send(
                50,
                Fcall::TRead {
                    fid: 1,
                    offset: 0,
                    count: 100,
                },
            )
            .await;
        client.send(51, Fcall::TFlush { oldtag: 50 }).await;
        client.send(52, Fcall::TFlush { oldtag: 50 }).await;

        // let the flushes chain before releasing the read
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();

        let first = client.recv().await;
        assert_eq!(first.tag, 50);
        assert!(matches!(first.body, Fcall::RRead { .. }));

        let second = client.recv().await;
        assert_eq!(second.tag, 51);
        assert_eq!(second.body, Fcall::RFlush);

        let third = client.recv().await;
        assert_eq!(third.tag, 52);
        assert_eq!(third.body, Fcall::RFlush);
    }

    #[tokio::test]
    async fn flush_unknown_tag_immediate() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        let rc = client.rpc(60, Fcall::TFlush { oldtag: 999 }).await;
        assert_eq!(rc, Fcall::RFlush);
    }

    #[tokio::test]
    async fn clunk_consumes_fid() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;

        assert_eq!(client.rpc(6, Fcall::TClunk { fid: 1 }).await, Fcall::RClunk);
        let rc = client.rpc(7, Fcall::TStat { fid: 1 }).await;
        assert_eq!(ename_of(rc), string::EUNKNOWNFID);
    }

    #[tokio::test]
    async fn remove_consumes_fid() {
        let (fs, _, removed) = test_fs();
        let mut client = serve(Srv::new(fs));
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;

        assert_eq!(
            client.rpc(6, Fcall::TRemove { fid: 1 }).await,
            Fcall::RRemove
        );
        assert!(removed.load(Ordering::Relaxed));

        let rc = client.rpc(7, Fcall::TStat { fid: 1 }).await;
        assert_eq!(ename_of(rc), string::EUNKNOWNFID);
    }

    #[tokio::test]
    async fn remove_on_close() {
        let (fs, _, removed) = test_fs();
        let mut client = serve(Srv::new(fs));
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["f"]).await;
        client
            .rpc(
                5,
                Fcall::TOpen {
                    fid: 1,
                    mode: om::READ | om::RCLOSE,
                },
            )
            .await;

        assert_eq!(client.rpc(6, Fcall::TClunk { fid: 1 }).await, Fcall::RClunk);
        assert!(removed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn wstat_sentinel_checks() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        assert_eq!(
            client
                .rpc(
                    5,
                    Fcall::TWStat {
                        fid: 0,
                        stat: Stat::blank(),
                    },
                )
                .await,
            Fcall::RWStat
        );

        let mut stat = Stat::blank();
        stat.typ = 1;
        let rc = client.rpc(6, Fcall::TWStat { fid: 0, stat }).await;
        assert_eq!(ename_of(rc), string::EPERM);

        // dropping the directory bit from a directory is a conversion
        let mut stat = Stat::blank();
        stat.mode = 0o644;
        let rc = client.rpc(7, Fcall::TWStat { fid: 0, stat }).await;
        assert_eq!(ename_of(rc), string::EDIRCHANGE);
    }

    #[tokio::test]
    async fn version_resets_fid_table() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        client.version().await;
        let rc = client.rpc(4, Fcall::TStat { fid: 0 }).await;
        assert_eq!(ename_of(rc), string::EUNKNOWNFID);
    }

    #[tokio::test]
    async fn enomem_uses_preallocated_reply() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;
        client.walk(0, 1, &["oom"]).await;

        match client.rpc(5, Fcall::TStat { fid: 1 }).await {
            Fcall::RError { ename, ecode } => {
                assert_eq!(ename, string::ENOMEM);
                assert_eq!(ecode, Errno::ENOMEM as i32 as u32);
            }
            rc => panic!("unexpected reply {:?}", rc),
        }

        // the connection keeps running afterwards
        match client.rpc(6, Fcall::TStat { fid: 0 }).await {
            Fcall::RStat { .. } => {}
            rc => panic!("unexpected reply {:?}", rc),
        }
    }

    #[tokio::test]
    async fn oversize_frame_kills_connection() {
        let mut client = serve_default();
        client.version().await;
        client.attach(0).await;

        client
            .send(
                5,
                Fcall::TWrite {
                    fid: 0,
                    offset: 0,
                    data: Data(vec![0; 9000]),
                },
            )
            .await;
        assert!(client.try_recv().await.is_err());
    }

    #[tokio::test]
    async fn auth_not_required_without_provider() {
        let mut client = serve_default();
        client.version().await;

        let rc = client
            .rpc(
                2,
                Fcall::TAuth {
                    afid: 5,
                    uname: "alice".to_owned(),
                    aname: "/".to_owned(),
                    n_uname: 1000,
                },
            )
            .await;
        assert_eq!(ename_of(rc), string::ENOAUTH);
    }

    #[tokio::test]
    async fn auth_flow() {
        let (fs, _, _) = test_fs();
        let mut client = serve(Srv::new(fs).auth(Arc::new(TestAuth)));
        client.version().await;

        match client
            .rpc(
                2,
                Fcall::TAuth {
                    afid: 5,
                    uname: "alice".to_owned(),
                    aname: "/".to_owned(),
                    n_uname: 1000,
                },
            )
            .await
        {
            Fcall::RAuth { aqid } => assert!(aqid.typ.contains(QIdType::AUTH)),
            rc => panic!("unexpected reply {:?}", rc),
        }

        // reads on the afid bypass the open-mode checks
        match client
            .rpc(
                3,
                Fcall::TRead {
                    fid: 5,
                    offset: 0,
                    count: 100,
                },
            )
            .await
        {
            Fcall::RRead { data } => assert_eq!(data.0, b"token"),
            rc => panic!("unexpected reply {:?}", rc),
        }

        match client
            .rpc(
                4,
                Fcall::TAttach {
                    fid: 0,
                    afid: 5,
                    uname: "alice".to_owned(),
                    aname: "/".to_owned(),
                    n_uname: 1000,
                },
            )
            .await
        {
            Fcall::RAttach { .. } => {}
            rc => panic!("unexpected reply {:?}", rc),
        }

        assert_eq!(client.rpc(5, Fcall::TClunk { fid: 5 }).await, Fcall::RClunk);
    }
}
