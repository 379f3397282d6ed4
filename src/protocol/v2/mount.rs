// MOUNT v1 Protocol Types
//
// MNT returns an fhstatus (errno-style status plus handle), DUMP and EXPORT
// return XDR linked lists.

use bytes::BytesMut;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use xdr_codec::{Pack, Unpack, pack_opaque_flex, pack_string, unpack_opaque_flex};

use super::nfs::{FHandle, NfsStat};
use crate::protocol::{ProtocolError, decode, encode};

/// Longest path accepted by MNT/UMNT
pub const MNTPATHLEN: usize = 1024;

/// Longest host name in DUMP results
pub const MNTNAMLEN: usize = 255;

/// Path argument of MNT/UMNT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPath(pub OsString);

impl<Out: Write> Pack<Out> for DirPath {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        pack_opaque_flex(self.0.as_bytes(), Some(MNTPATHLEN), out)
    }
}

impl<In: Read> Unpack<In> for DirPath {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let (raw, sz) = unpack_opaque_flex(input, Some(MNTPATHLEN))?;
        Ok((DirPath(OsString::from_vec(raw)), sz))
    }
}

/// MNT result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FhStatus {
    Ok(FHandle),
    Err(NfsStat),
}

impl<Out: Write> Pack<Out> for FhStatus {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        match self {
            FhStatus::Ok(fh) => Ok(0u32.pack(out)? + fh.pack(out)?),
            FhStatus::Err(status) => status.pack(out),
        }
    }
}

/// One DUMP entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBody {
    pub hostname: String,
    pub directory: String,
}

/// One EXPORT entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportNode {
    pub directory: String,
    pub groups: Vec<String>,
}

/// Wrapper for MOUNT messages providing serialization helpers
pub struct MountMessage;

impl MountMessage {
    /// Deserialize the path argument of MNT and UMNT
    pub fn deserialize_dirpath(data: &[u8]) -> Result<DirPath, ProtocolError> {
        decode(data)
    }

    /// Serialize an fhstatus
    pub fn serialize_fhstatus(res: &FhStatus) -> Result<BytesMut, ProtocolError> {
        encode(res)
    }

    /// Serialize the mount list returned by DUMP
    pub fn serialize_mountlist(entries: &[MountBody]) -> Result<BytesMut, ProtocolError> {
        let mut buf = Vec::new();
        let pack = |buf: &mut Vec<u8>| -> xdr_codec::Result<usize> {
            let mut sz = 0;
            for entry in entries {
                sz += true.pack(buf)?;
                sz += pack_string(&entry.hostname, Some(MNTNAMLEN), buf)?;
                sz += pack_string(&entry.directory, Some(MNTPATHLEN), buf)?;
            }
            sz += false.pack(buf)?;
            Ok(sz)
        };
        pack(&mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(BytesMut::from(&buf[..]))
    }

    /// Serialize the export list returned by EXPORT and EXPORTALL
    pub fn serialize_exports(exports: &[ExportNode]) -> Result<BytesMut, ProtocolError> {
        let mut buf = Vec::new();
        let pack = |buf: &mut Vec<u8>| -> xdr_codec::Result<usize> {
            let mut sz = 0;
            for export in exports {
                sz += true.pack(buf)?;
                sz += pack_string(&export.directory, Some(MNTPATHLEN), buf)?;
                for group in &export.groups {
                    sz += true.pack(buf)?;
                    sz += pack_string(group, Some(MNTNAMLEN), buf)?;
                }
                sz += false.pack(buf)?;
            }
            sz += false.pack(buf)?;
            Ok(sz)
        };
        pack(&mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(BytesMut::from(&buf[..]))
    }
}
