// ONC RPC message layer (RFC 5531)
//
// Call headers and credentials are decoded here; replies are built from an
// accept status plus the already-encoded procedure result.

use bytes::BytesMut;
use std::io::{Read, Write};
use xdr_codec::{Pack, Unpack, pack_opaque_flex, unpack_flex, unpack_opaque_flex, unpack_string};

use super::{ProtocolError, decode_prefix, encode};

/// RPC protocol version spoken by this server
pub const RPC_VERSION: u32 = 2;

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const RPC_MISMATCH: u32 = 0;

pub const AUTH_NULL: u32 = 0;
pub const AUTH_UNIX: u32 = 1;

const MAX_AUTH_BYTES: usize = 400;
const MAX_MACHINE_NAME: usize = 255;
const MAX_AUX_GIDS: usize = 16;

/// Accept status of a reply that passed RPC version and authentication checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

/// Credential or verifier as carried on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl<In: Read> Unpack<In> for OpaqueAuth {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let (flavor, a) = u32::unpack(input)?;
        let (body, b) = unpack_opaque_flex(input, Some(MAX_AUTH_BYTES))?;
        Ok((OpaqueAuth { flavor, body }, a + b))
    }
}

impl<Out: Write> Pack<Out> for OpaqueAuth {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        Ok(self.flavor.pack(out)? + pack_opaque_flex(&self.body, Some(MAX_AUTH_BYTES), out)?)
    }
}

/// Fixed part of an RPC call message
#[derive(Debug, Clone)]
pub struct CallHeader {
    pub xid: u32,
    pub mtype: u32,
    pub rpcvers: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc_: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl<In: Read> Unpack<In> for CallHeader {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let mut sz = 0;
        let (xid, n) = u32::unpack(input)?;
        sz += n;
        let (mtype, n) = u32::unpack(input)?;
        sz += n;
        let (rpcvers, n) = u32::unpack(input)?;
        sz += n;
        let (prog, n) = u32::unpack(input)?;
        sz += n;
        let (vers, n) = u32::unpack(input)?;
        sz += n;
        let (proc_, n) = u32::unpack(input)?;
        sz += n;
        let (cred, n) = OpaqueAuth::unpack(input)?;
        sz += n;
        let (verf, n) = OpaqueAuth::unpack(input)?;
        sz += n;

        Ok((
            CallHeader {
                xid,
                mtype,
                rpcvers,
                prog,
                vers,
                proc_,
                cred,
                verf,
            },
            sz,
        ))
    }
}

/// AUTH_UNIX credential body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthUnix {
    pub stamp: u32,
    pub machine: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl<In: Read> Unpack<In> for AuthUnix {
    fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
        let (stamp, a) = u32::unpack(input)?;
        let (machine, b) = unpack_string(input, Some(MAX_MACHINE_NAME))?;
        let (uid, c) = u32::unpack(input)?;
        let (gid, d) = u32::unpack(input)?;
        let (gids, e) = unpack_flex(input, Some(MAX_AUX_GIDS))?;
        Ok((
            AuthUnix {
                stamp,
                machine,
                uid,
                gid,
                gids,
            },
            a + b + c + d + e,
        ))
    }
}

impl<Out: Write> Pack<Out> for AuthUnix {
    fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
        let mut sz = self.stamp.pack(out)?;
        sz += xdr_codec::pack_string(&self.machine, Some(MAX_MACHINE_NAME), out)?;
        sz += self.uid.pack(out)?;
        sz += self.gid.pack(out)?;
        sz += xdr_codec::pack_flex(&self.gids, Some(MAX_AUX_GIDS), out)?;
        Ok(sz)
    }
}

impl CallHeader {
    /// Decode the AUTH_UNIX credential, if that is what the caller sent
    pub fn auth_unix(&self) -> Option<AuthUnix> {
        if self.cred.flavor != AUTH_UNIX {
            return None;
        }
        super::decode(&self.cred.body).ok()
    }
}

/// Wrapper for RPC messages providing serialization helpers
pub struct RpcMessage;

impl RpcMessage {
    /// Deserialize an RPC call
    ///
    /// Returns the header and the offset at which procedure arguments start.
    pub fn deserialize_call(data: &[u8]) -> Result<(CallHeader, usize), ProtocolError> {
        let (call, offset) = decode_prefix::<CallHeader>(data)?;
        if call.mtype != MSG_CALL {
            return Err(ProtocolError::MessageType(call.mtype));
        }
        Ok((call, offset))
    }

    fn accepted_header(xid: u32, stat: AcceptStat) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        let pack = |buf: &mut Vec<u8>| -> xdr_codec::Result<usize> {
            let mut sz = xid.pack(buf)?;
            sz += MSG_REPLY.pack(buf)?;
            sz += MSG_ACCEPTED.pack(buf)?;
            sz += OpaqueAuth::default().pack(buf)?;
            sz += (stat as u32).pack(buf)?;
            Ok(sz)
        };
        pack(&mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Create a SUCCESS reply carrying an encoded procedure result
    pub fn create_success_reply_with_data(xid: u32, data: &[u8]) -> Result<BytesMut, ProtocolError> {
        let header = Self::accepted_header(xid, AcceptStat::Success)?;
        let mut reply = BytesMut::with_capacity(header.len() + data.len());
        reply.extend_from_slice(&header);
        reply.extend_from_slice(data);
        Ok(reply)
    }

    /// Create an accepted reply with a non-success status and no body
    pub fn create_error_reply(xid: u32, stat: AcceptStat) -> Result<BytesMut, ProtocolError> {
        let header = Self::accepted_header(xid, stat)?;
        Ok(BytesMut::from(&header[..]))
    }

    /// Create a PROG_MISMATCH reply advertising the supported version range
    pub fn create_prog_mismatch_reply(xid: u32, low: u32, high: u32) -> Result<BytesMut, ProtocolError> {
        let mut reply = Self::create_error_reply(xid, AcceptStat::ProgMismatch)?;
        reply.extend_from_slice(&encode(&low)?);
        reply.extend_from_slice(&encode(&high)?);
        Ok(reply)
    }

    /// Create a MSG_DENIED reply for callers speaking another RPC version
    pub fn create_rpc_mismatch_reply(xid: u32) -> Result<BytesMut, ProtocolError> {
        let mut reply = BytesMut::new();
        for word in [xid, MSG_REPLY, MSG_DENIED, RPC_MISMATCH, RPC_VERSION, RPC_VERSION] {
            reply.extend_from_slice(&word.to_be_bytes());
        }
        Ok(reply)
    }

    /// Build an outgoing call message with AUTH_NULL credentials
    pub fn create_call(xid: u32, prog: u32, vers: u32, proc_: u32, args: &[u8]) -> BytesMut {
        let mut call = BytesMut::with_capacity(40 + args.len());
        for word in [xid, MSG_CALL, RPC_VERSION, prog, vers, proc_, AUTH_NULL, 0, AUTH_NULL, 0] {
            call.extend_from_slice(&word.to_be_bytes());
        }
        call.extend_from_slice(args);
        call
    }

    /// Parse a reply to one of our own calls
    ///
    /// Returns the xid and the offset of the result body on success.
    pub fn deserialize_reply(data: &[u8]) -> Result<(u32, usize), ProtocolError> {
        let (xid, mut offset) = decode_prefix::<u32>(data)?;
        let (mtype, n) = decode_prefix::<u32>(&data[offset..])?;
        offset += n;
        if mtype != MSG_REPLY {
            return Err(ProtocolError::MessageType(mtype));
        }
        let (reply_stat, n) = decode_prefix::<u32>(&data[offset..])?;
        offset += n;
        if reply_stat != MSG_ACCEPTED {
            return Err(ProtocolError::Rejected);
        }
        let (_verf, n) = decode_prefix::<OpaqueAuth>(&data[offset..])?;
        offset += n;
        let (accept_stat, n) = decode_prefix::<u32>(&data[offset..])?;
        offset += n;
        if accept_stat != AcceptStat::Success as u32 {
            return Err(ProtocolError::NotAccepted(accept_stat));
        }
        Ok((xid, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_bytes(cred: &OpaqueAuth) -> Vec<u8> {
        let mut buf = Vec::new();
        for word in [7u32, MSG_CALL, RPC_VERSION, 100003, 2, 1] {
            word.pack(&mut buf).unwrap();
        }
        cred.pack(&mut buf).unwrap();
        OpaqueAuth::default().pack(&mut buf).unwrap();
        buf.extend_from_slice(&[0xAA; 4]);
        buf
    }

    #[test]
    fn test_deserialize_call_with_auth_unix() {
        let unix = AuthUnix {
            stamp: 1,
            machine: "client".to_string(),
            uid: 1000,
            gid: 100,
            gids: vec![100, 10],
        };
        let mut body = Vec::new();
        unix.pack(&mut body).unwrap();
        let data = call_bytes(&OpaqueAuth {
            flavor: AUTH_UNIX,
            body,
        });

        let (call, offset) = RpcMessage::deserialize_call(&data).unwrap();
        assert_eq!(call.xid, 7);
        assert_eq!(call.prog, 100003);
        assert_eq!(call.proc_, 1);
        assert_eq!(&data[offset..], &[0xAA; 4]);
        assert_eq!(call.auth_unix(), Some(unix));
    }

    #[test]
    fn test_reply_parses_back() {
        let reply = RpcMessage::create_success_reply_with_data(99, &[0, 0, 0, 5]).unwrap();
        let (xid, offset) = RpcMessage::deserialize_reply(&reply).unwrap();
        assert_eq!(xid, 99);
        assert_eq!(&reply[offset..], &[0, 0, 0, 5]);

        let garbage = RpcMessage::create_error_reply(99, AcceptStat::GarbageArgs).unwrap();
        assert!(matches!(
            RpcMessage::deserialize_reply(&garbage),
            Err(ProtocolError::NotAccepted(4))
        ));
    }

    #[test]
    fn test_reply_is_not_a_call() {
        let reply = RpcMessage::create_error_reply(3, AcceptStat::ProcUnavail).unwrap();
        assert!(matches!(
            RpcMessage::deserialize_call(&reply),
            Err(ProtocolError::MessageType(_)) | Err(ProtocolError::Decode(_))
        ));
    }
}
