//! Serialize/deserialize 9P messages into/from binary.
//!
//! The wire format is little-endian. A complete message is
//! `size[4] type[1] tag[2] body`; the leading size field includes itself and
//! is applied by the connection's length-delimited framing, so the routines
//! here produce and consume the `type tag body` portion.
//!
//! 9P2000.u widens a handful of messages (`Rerror`, `Tcreate`,
//! `Tauth`/`Tattach`, stat records), so encoding and decoding take the
//! connection's `dotu` mode.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, ErrorKind, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// A stat record tied to the connection mode it is being serialized for
struct WireStat<'a>(&'a Stat, bool);

impl Encodable for WireStat<'_> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.encode(w, self.1)
    }
}

impl Stat {
    /// Encode the record, leading size field included
    pub fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        let buf = Encoder::new(w)
            << &self.size(dotu)
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid;

        let buf = if dotu {
            buf << &self.extension << &self.n_uid << &self.n_gid << &self.n_muid
        } else {
            buf
        };

        match buf {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }

    /// Decode a record, leading size field included
    pub fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
        let _size: u16 = decode!(*r);

        let mut stat = Stat {
            typ: decode!(*r),
            dev: decode!(*r),
            qid: decode!(*r),
            mode: decode!(*r),
            atime: decode!(*r),
            mtime: decode!(*r),
            length: decode!(*r),
            name: decode!(*r),
            uid: decode!(*r),
            gid: decode!(*r),
            muid: decode!(*r),
            ..Stat::blank()
        };

        if dotu {
            stat.extension = decode!(*r);
            stat.n_uid = decode!(*r);
            stat.n_gid = decode!(*r);
            stat.n_muid = decode!(*r);
        } else {
            stat.extension = String::new();
            stat.n_uid = NONUNAME;
            stat.n_gid = NONUNAME;
            stat.n_muid = NONUNAME;
        }

        Ok(stat)
    }
}

impl Msg {
    /// Encode the message as `type[1] tag[2] body`
    pub fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << fid << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAttach { ref qid } => buf << qid,
            RError {
                ref ename,
                ref ecode,
            } => {
                let buf = buf << ename;
                if dotu { buf << ecode } else { buf }
            }
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
                ref extension,
            } => {
                let buf = buf << fid << name << perm << mode;
                if dotu { buf << extension } else { buf }
            }
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => {
                // stat[n]: the record is size-prefixed twice
                buf << &(stat.size(dotu) + 2) << &WireStat(stat, dotu)
            }
            TWStat { ref fid, ref stat } => {
                buf << fid << &(stat.size(dotu) + 2) << &WireStat(stat, dotu)
            }
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }

    /// Decode a message from `type[1] tag[2] body`
    pub fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => Fcall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => Fcall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => Fcall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
                n_uname: decode_nuname(&mut buf, dotu)?,
            },
            Some(RAuth) => Fcall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => Fcall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
                n_uname: decode_nuname(&mut buf, dotu)?,
            },
            Some(RAttach) => Fcall::RAttach { qid: decode!(buf) },
            Some(RError) => Fcall::RError {
                ename: decode!(buf),
                ecode: if dotu { decode!(buf) } else { 0 },
            },
            Some(TFlush) => Fcall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => Fcall::RFlush,
            Some(TWalk) => Fcall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => Fcall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => Fcall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => Fcall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => Fcall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
                extension: if dotu { decode!(buf) } else { String::new() },
            },
            Some(RCreate) => Fcall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => Fcall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => Fcall::RRead { data: decode!(buf) },
            Some(TWrite) => Fcall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => Fcall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => Fcall::TClunk { fid: decode!(buf) },
            Some(RClunk) => Fcall::RClunk,
            Some(TRemove) => Fcall::TRemove { fid: decode!(buf) },
            Some(RRemove) => Fcall::RRemove,
            Some(TStat) => Fcall::TStat { fid: decode!(buf) },
            Some(RStat) => {
                let _outer: u16 = decode!(buf);
                Fcall::RStat {
                    stat: Stat::decode(&mut buf, dotu)?,
                }
            }
            Some(TWStat) => {
                let fid = decode!(buf);
                let _outer: u16 = decode!(buf);
                Fcall::TWStat {
                    fid,
                    stat: Stat::decode(&mut buf, dotu)?,
                }
            }
            Some(RWStat) => Fcall::RWStat,
            None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_truncate(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// The trailing `n_uname[4]` of Tauth/Tattach is optional even on .u
/// connections; absence decodes as `NONUNAME`.
fn decode_nuname<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<u32> {
    if !dotu {
        return Ok(NONUNAME);
    }

    match Decodable::decode(r) {
        Ok(n) => Ok(n),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(NONUNAME),
        Err(e) => Err(e),
    }
}

/// Decode one complete size-stripped frame into a message.
///
/// Fails when decoding leaves unconsumed bytes behind; a frame that does not
/// exactly contain one message is malformed and the caller is expected to
/// drop the connection.
pub fn read_msg(frame: &[u8], dotu: bool) -> Result<Msg> {
    let mut cursor = Cursor::new(frame);
    let msg = Msg::decode(&mut cursor, dotu)?;

    if cursor.position() as usize != frame.len() {
        return res!(io_err!(InvalidData, "Trailing bytes after message"));
    }

    Ok(msg)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    msg.encode(w, dotu)
}

#[cfg(test)]
fn roundtrip(msg: &Msg, dotu: bool) -> Msg {
    let mut buf = Vec::new();
    msg.encode(&mut buf, dotu).unwrap();
    read_msg(&buf[..], dotu).unwrap()
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = Decodable::decode(&mut decoder) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[test]
fn msg_encode_decode1() {
    let expected = Msg {
        tag: 0xdead,
        body: Fcall::RVersion {
            msize: 40,
            version: P92000U.to_owned(),
        },
    };

    assert_eq!(expected, roundtrip(&expected, true));
}

#[test]
fn rerror_ecode_only_in_dotu() {
    let msg = Msg {
        tag: 1,
        body: Fcall::RError {
            ename: "unknown fid".to_owned(),
            ecode: 5,
        },
    };

    let mut base = Vec::new();
    let mut dotu = Vec::new();
    msg.encode(&mut base, false).unwrap();
    msg.encode(&mut dotu, true).unwrap();
    assert_eq!(dotu.len(), base.len() + 4);

    let decoded = read_msg(&base[..], false).unwrap();
    match decoded.body {
        Fcall::RError { ename, ecode } => {
            assert_eq!(ename, "unknown fid");
            assert_eq!(ecode, 0);
        }
        _ => panic!("wrong message type"),
    }

    assert_eq!(msg, roundtrip(&msg, true));
}

#[test]
fn tattach_optional_nuname() {
    let msg = Msg {
        tag: 2,
        body: Fcall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "alice".to_owned(),
            aname: "/".to_owned(),
            n_uname: 1000,
        },
    };

    // base mode drops the numeric uid entirely
    let mut base = Vec::new();
    msg.encode(&mut base, false).unwrap();
    match read_msg(&base[..], false).unwrap().body {
        Fcall::TAttach { n_uname, .. } => assert_eq!(n_uname, NONUNAME),
        _ => panic!("wrong message type"),
    }

    // a .u peer that omits the trailing field still decodes, yielding NONUNAME
    match read_msg(&base[..], true).unwrap().body {
        Fcall::TAttach { n_uname, .. } => assert_eq!(n_uname, NONUNAME),
        _ => panic!("wrong message type"),
    }

    assert_eq!(msg, roundtrip(&msg, true));
}

#[test]
fn twalk_roundtrip() {
    let msg = Msg {
        tag: 3,
        body: Fcall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
    };

    assert_eq!(msg, roundtrip(&msg, false));
    assert_eq!(msg, roundtrip(&msg, true));
}

#[test]
fn tcreate_extension_only_in_dotu() {
    let msg = Msg {
        tag: 4,
        body: Fcall::TCreate {
            fid: 7,
            name: "dev0".to_owned(),
            perm: dm::DEVICE | 0o644,
            mode: om::READ,
            extension: "b 1 7".to_owned(),
        },
    };

    assert_eq!(msg, roundtrip(&msg, true));

    let mut base = Vec::new();
    msg.encode(&mut base, false).unwrap();
    match read_msg(&base[..], false).unwrap().body {
        Fcall::TCreate { extension, .. } => assert!(extension.is_empty()),
        _ => panic!("wrong message type"),
    }
}

#[cfg(test)]
fn sample_stat() -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid: QId {
            typ: QIdType::FILE,
            version: 13,
            path: 0x1234,
        },
        mode: 0o644,
        atime: 1000,
        mtime: 2000,
        length: 42,
        name: "README".to_owned(),
        uid: "alice".to_owned(),
        gid: "users".to_owned(),
        muid: "bob".to_owned(),
        extension: String::new(),
        n_uid: 1000,
        n_gid: 100,
        n_muid: 1001,
    }
}

#[test]
fn stat_roundtrip_law() {
    let stat = sample_stat();

    for dotu in [false, true] {
        let mut buf = Vec::new();
        let n = stat.encode(&mut buf, dotu).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(buf.len(), stat.size(dotu) as usize + 2);

        let decoded = Stat::decode(&mut Cursor::new(&buf[..]), dotu).unwrap();
        if dotu {
            assert_eq!(decoded, stat);
        } else {
            // base mode cannot carry the .u tail
            assert_eq!(decoded.n_uid, NONUNAME);
            assert_eq!(decoded.name, stat.name);
            assert_eq!(decoded.length, stat.length);
        }
    }
}

#[test]
fn rstat_twstat_roundtrip() {
    let rstat = Msg {
        tag: 5,
        body: Fcall::RStat {
            stat: sample_stat(),
        },
    };
    let twstat = Msg {
        tag: 6,
        body: Fcall::TWStat {
            fid: 3,
            stat: sample_stat(),
        },
    };

    assert_eq!(rstat, roundtrip(&rstat, true));
    assert_eq!(twstat, roundtrip(&twstat, true));
}

#[test]
fn rread_roundtrip() {
    let msg = Msg {
        tag: 7,
        body: Fcall::RRead {
            data: Data(vec![0xde, 0xad, 0xbe, 0xef]),
        },
    };

    assert_eq!(msg, roundtrip(&msg, false));
}

#[test]
fn truncated_string_fails() {
    let msg = Msg {
        tag: 8,
        body: Fcall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };

    let mut buf = Vec::new();
    msg.encode(&mut buf, false).unwrap();
    buf.truncate(buf.len() - 2);
    assert!(read_msg(&buf[..], false).is_err());
}

#[test]
fn trailing_bytes_fail() {
    let msg = Msg {
        tag: 9,
        body: Fcall::TClunk { fid: 1 },
    };

    let mut buf = Vec::new();
    msg.encode(&mut buf, false).unwrap();
    buf.push(0);
    assert!(read_msg(&buf[..], false).is_err());
}

#[test]
fn illegal_message_type_fails() {
    // Terror = 106 must never appear on the wire
    let buf = [106u8, 0, 0];
    assert!(read_msg(&buf[..], false).is_err());
}
