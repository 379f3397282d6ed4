// NFS v2 Protocol Types (RFC 1094)
//
// Argument structures decode straight from the wire; result structures only
// need to encode. Every reply starts with an `NfsStat`, followed by the body
// only when the status is OK.

use bytes::BytesMut;
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use xdr_codec::{
    Pack, Unpack, pack_opaque_array, pack_opaque_flex, unpack_opaque_array, unpack_opaque_flex,
};

use crate::protocol::{ProtocolError, decode, encode};

/// NFS program number
pub const NFS_PROGRAM: u32 = 100003;

/// NFS version 2
pub const NFS_V2: u32 = 2;

/// Size of a file handle in bytes
pub const FHSIZE: usize = 32;

/// Largest READ/WRITE payload
pub const MAXDATA: u32 = 8192;

/// Longest path accepted or returned
pub const MAXPATHLEN: usize = 1024;

/// Longest single path component
pub const MAXNAMLEN: usize = 255;

/// Size of a READDIR cookie in bytes
pub const COOKIESIZE: usize = 4;

/// "Leave unchanged" marker for SATTR fields
pub const SATTR_IGNORE: u32 = u32::MAX;

/// NFS v2 status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfsStat {
    Ok = 0,
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    NxIo = 6,
    Acces = 13,
    Exist = 17,
    NoDev = 19,
    NotDir = 20,
    IsDir = 21,
    Inval = 22,
    FBig = 27,
    NoSpc = 28,
    RoFs = 30,
    NameTooLong = 63,
    NotEmpty = 66,
    DQuot = 69,
    Stale = 70,
}

impl<Out: Write> Pack<Out> for NfsStat {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        (*self as u32).pack(out)
    }
}

/// File type as reported in FATTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FType {
    Non = 0,
    Reg = 1,
    Dir = 2,
    Blk = 3,
    Chr = 4,
    Lnk = 5,
    Sock = 6,
    Bad = 7,
    Fifo = 8,
}

impl<Out: Write> Pack<Out> for FType {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        (*self as u32).pack(out)
    }
}

/// Empty body of NULL, ROOT and WRITECACHE and of status-only results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Void;

impl<Out: Write> Pack<Out> for Void {
    fn pack(&self, _out: &mut Out) -> xdr_codec::Result<usize> {
        Ok(0)
    }
}

impl<In: Read> Unpack<In> for Void {
    fn unpack(_input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        Ok((Void, 0))
    }
}

/// Opaque file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FHandle(pub [u8; FHSIZE]);

impl<Out: Write> Pack<Out> for FHandle {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_array(&self.0, FHSIZE, out)
    }
}

impl<In: Read> Unpack<In> for FHandle {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let mut raw = [0u8; FHSIZE];
        let sz = unpack_opaque_array(input, &mut raw, FHSIZE)?;
        Ok((FHandle(raw), sz))
    }
}

/// Seconds and microseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub seconds: u32,
    pub useconds: u32,
}

xdr_pack!(TimeVal { seconds, useconds });
xdr_unpack!(TimeVal { seconds: u32, useconds: u32 });

impl TimeVal {
    pub const IGNORE: TimeVal = TimeVal {
        seconds: SATTR_IGNORE,
        useconds: SATTR_IGNORE,
    };

    pub fn is_set(&self) -> bool {
        self.seconds != SATTR_IGNORE
    }
}

/// Single path component, kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filename(pub OsString);

impl Filename {
    pub fn new(name: impl Into<OsString>) -> Self {
        Filename(name.into())
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }
}

impl<Out: Write> Pack<Out> for Filename {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_flex(self.0.as_bytes(), Some(MAXNAMLEN), out)
    }
}

impl<In: Read> Unpack<In> for Filename {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let (raw, sz) = unpack_opaque_flex(input, Some(MAXNAMLEN))?;
        Ok((Filename(OsString::from_vec(raw)), sz))
    }
}

/// Path string, e.g. a symlink target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsPath(pub OsString);

impl<Out: Write> Pack<Out> for NfsPath {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_flex(self.0.as_bytes(), Some(MAXPATHLEN), out)
    }
}

impl<In: Read> Unpack<In> for NfsPath {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let (raw, sz) = unpack_opaque_flex(input, Some(MAXPATHLEN))?;
        Ok((NfsPath(OsString::from_vec(raw)), sz))
    }
}

/// READ/WRITE payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfsData(pub Vec<u8>);

impl<Out: Write> Pack<Out> for NfsData {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_flex(&self.0, Some(MAXDATA as usize), out)
    }
}

impl<In: Read> Unpack<In> for NfsData {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        // Oversized writes are rejected by the handler with an I/O status,
        // so no limit is enforced while decoding.
        let (raw, sz) = unpack_opaque_flex(input, None)?;
        Ok((NfsData(raw), sz))
    }
}

/// READDIR resume position, 4 opaque bytes on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cookie(pub u32);

impl<Out: Write> Pack<Out> for Cookie {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_array(&self.0.to_be_bytes(), COOKIESIZE, out)
    }
}

impl<In: Read> Unpack<In> for Cookie {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let mut raw = [0u8; COOKIESIZE];
        let sz = unpack_opaque_array(input, &mut raw, COOKIESIZE)?;
        Ok((Cookie(u32::from_be_bytes(raw)), sz))
    }
}

/// File attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FAttr {
    pub ftype: FType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    pub atime: TimeVal,
    pub mtime: TimeVal,
    pub ctime: TimeVal,
}

xdr_pack!(FAttr {
    ftype, mode, nlink, uid, gid, size, blocksize, rdev, blocks, fsid, fileid, atime, mtime, ctime
});

/// Settable attributes; any field may hold the ignore marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub atime: TimeVal,
    pub mtime: TimeVal,
}

xdr_pack!(SAttr { mode, uid, gid, size, atime, mtime });
xdr_unpack!(SAttr {
    mode: u32,
    uid: u32,
    gid: u32,
    size: u32,
    atime: TimeVal,
    mtime: TimeVal,
});

impl Default for SAttr {
    fn default() -> Self {
        SAttr {
            mode: SATTR_IGNORE,
            uid: SATTR_IGNORE,
            gid: SATTR_IGNORE,
            size: SATTR_IGNORE,
            atime: TimeVal::IGNORE,
            mtime: TimeVal::IGNORE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirOpArgs {
    pub dir: FHandle,
    pub name: Filename,
}

xdr_pack!(DirOpArgs { dir, name });
xdr_unpack!(DirOpArgs { dir: FHandle, name: Filename });

#[derive(Debug, Clone)]
pub struct SAttrArgs {
    pub file: FHandle,
    pub attributes: SAttr,
}

xdr_pack!(SAttrArgs { file, attributes });
xdr_unpack!(SAttrArgs { file: FHandle, attributes: SAttr });

#[derive(Debug, Clone)]
pub struct ReadArgs {
    pub file: FHandle,
    pub offset: u32,
    pub count: u32,
    pub totalcount: u32,
}

xdr_pack!(ReadArgs { file, offset, count, totalcount });
xdr_unpack!(ReadArgs {
    file: FHandle,
    offset: u32,
    count: u32,
    totalcount: u32,
});

#[derive(Debug, Clone)]
pub struct WriteArgs {
    pub file: FHandle,
    pub beginoffset: u32,
    pub offset: u32,
    pub totalcount: u32,
    pub data: NfsData,
}

xdr_pack!(WriteArgs { file, beginoffset, offset, totalcount, data });
xdr_unpack!(WriteArgs {
    file: FHandle,
    beginoffset: u32,
    offset: u32,
    totalcount: u32,
    data: NfsData,
});

#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub where_: DirOpArgs,
    pub attributes: SAttr,
}

xdr_pack!(CreateArgs { where_, attributes });
xdr_unpack!(CreateArgs { where_: DirOpArgs, attributes: SAttr });

#[derive(Debug, Clone)]
pub struct RenameArgs {
    pub from: DirOpArgs,
    pub to: DirOpArgs,
}

xdr_pack!(RenameArgs { from, to });
xdr_unpack!(RenameArgs { from: DirOpArgs, to: DirOpArgs });

#[derive(Debug, Clone)]
pub struct LinkArgs {
    pub from: FHandle,
    pub to: DirOpArgs,
}

xdr_pack!(LinkArgs { from, to });
xdr_unpack!(LinkArgs { from: FHandle, to: DirOpArgs });

#[derive(Debug, Clone)]
pub struct SymlinkArgs {
    pub from: DirOpArgs,
    pub to: NfsPath,
    pub attributes: SAttr,
}

xdr_pack!(SymlinkArgs { from, to, attributes });
xdr_unpack!(SymlinkArgs {
    from: DirOpArgs,
    to: NfsPath,
    attributes: SAttr,
});

#[derive(Debug, Clone)]
pub struct ReaddirArgs {
    pub dir: FHandle,
    pub cookie: Cookie,
    pub count: u32,
}

xdr_pack!(ReaddirArgs { dir, cookie, count });
xdr_unpack!(ReaddirArgs {
    dir: FHandle,
    cookie: Cookie,
    count: u32,
});

/// Successful LOOKUP/CREATE/MKDIR body
#[derive(Debug, Clone)]
pub struct DirOpOk {
    pub file: FHandle,
    pub attributes: FAttr,
}

xdr_pack!(DirOpOk { file, attributes });

#[derive(Debug, Clone)]
pub struct ReadOk {
    pub attributes: FAttr,
    pub data: NfsData,
}

xdr_pack!(ReadOk { attributes, data });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub fileid: u32,
    pub name: Filename,
    pub cookie: Cookie,
}

xdr_pack!(Entry { fileid, name, cookie });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirOk {
    pub entries: Vec<Entry>,
    pub eof: bool,
}

impl<Out: Write> Pack<Out> for ReaddirOk {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        // Linked list encoding: each entry is preceded by TRUE, the list
        // ends with FALSE.
        let mut sz = 0;
        for entry in &self.entries {
            sz += true.pack(out)?;
            sz += entry.pack(out)?;
        }
        sz += false.pack(out)?;
        sz += self.eof.pack(out)?;
        Ok(sz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatfsOk {
    pub tsize: u32,
    pub bsize: u32,
    pub blocks: u32,
    pub bfree: u32,
    pub bavail: u32,
}

xdr_pack!(StatfsOk { tsize, bsize, blocks, bfree, bavail });

/// Wrapper for NFS messages providing serialization helpers
pub struct NfsMessage;

impl NfsMessage {
    /// Deserialize any NFS argument structure
    pub fn deserialize<'a, T>(data: &'a [u8]) -> Result<T, ProtocolError>
    where
        T: Unpack<std::io::Cursor<&'a [u8]>>,
    {
        decode(data)
    }

    /// Serialize a reply union: status, then the body if the status is OK
    pub fn serialize_result<T>(res: &Result<T, NfsStat>) -> Result<BytesMut, ProtocolError>
    where
        T: Pack<Vec<u8>>,
    {
        match res {
            Ok(body) => {
                let mut buf = encode(&NfsStat::Ok)?;
                buf.extend_from_slice(&encode(body)?);
                Ok(buf)
            }
            Err(status) => encode(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args_decode() {
        let args = CreateArgs {
            where_: DirOpArgs {
                dir: FHandle([7; FHSIZE]),
                name: Filename::new("file.txt"),
            },
            attributes: SAttr {
                mode: 0o100644,
                ..SAttr::default()
            },
        };
        let buf = encode(&args).unwrap();
        // fhandle + (len + 8 bytes name) + 8 words of sattr
        assert_eq!(buf.len(), 32 + 4 + 8 + 32);

        let decoded: CreateArgs = NfsMessage::deserialize(&buf).unwrap();
        assert_eq!(decoded.where_, args.where_);
        assert_eq!(decoded.attributes.mode, 0o100644);
        assert_eq!(decoded.attributes.size, SATTR_IGNORE);
        assert!(!decoded.attributes.atime.is_set());
    }

    #[test]
    fn test_error_result_has_no_body() {
        let res: Result<StatfsOk, NfsStat> = Err(NfsStat::Stale);
        let buf = NfsMessage::serialize_result(&res).unwrap();
        assert_eq!(&buf[..], &70u32.to_be_bytes());
    }

    #[test]
    fn test_readdir_encoding() {
        let res = ReaddirOk {
            entries: vec![Entry {
                fileid: 2,
                name: Filename::new("a"),
                cookie: Cookie(1),
            }],
            eof: true,
        };
        let buf = encode(&res).unwrap();
        let words: Vec<u32> = buf
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        // TRUE, fileid, len, "a" padded, cookie, FALSE, eof
        assert_eq!(words, vec![1, 2, 1, 0x6100_0000, 1, 0, 1]);
    }

    #[test]
    fn test_name_too_long_rejected() {
        let long = "x".repeat(MAXNAMLEN + 1);
        let mut buf = Vec::new();
        xdr_codec::pack_string(&long, None, &mut buf).unwrap();
        assert!(decode::<Filename>(&buf).is_err());
    }
}
