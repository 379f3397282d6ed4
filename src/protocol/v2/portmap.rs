// Portmapper Protocol Types (RFC 1833, version 2)

use bytes::BytesMut;
use xdr_codec::Pack;

use crate::protocol::{ProtocolError, decode, encode};

/// IP protocol number for TCP registrations
pub const IPPROTO_TCP: u32 = 6;

/// IP protocol number for UDP registrations
pub const IPPROTO_UDP: u32 = 17;

/// Portmapper registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    pub prog: u32,
    pub vers: u32,
    pub prot: u32,
    pub port: u32,
}

xdr_pack!(Mapping { prog, vers, prot, port });
xdr_unpack!(Mapping {
    prog: u32,
    vers: u32,
    prot: u32,
    port: u32,
});

/// Wrapper for Portmapper messages providing serialization helpers
pub struct PortmapMessage;

impl PortmapMessage {
    /// Deserialize mapping argument
    pub fn deserialize_mapping(data: &[u8]) -> Result<Mapping, ProtocolError> {
        decode(data)
    }

    /// Serialize boolean result
    pub fn serialize_bool(result: bool) -> Result<BytesMut, ProtocolError> {
        encode(&result)
    }

    /// Serialize port result
    pub fn serialize_port(port: u32) -> Result<BytesMut, ProtocolError> {
        encode(&port)
    }

    /// Serialize the DUMP list
    pub fn serialize_mappings(maps: &[Mapping]) -> Result<BytesMut, ProtocolError> {
        let mut buf = Vec::new();
        let pack = |buf: &mut Vec<u8>| -> xdr_codec::Result<usize> {
            let mut sz = 0;
            for map in maps {
                sz += true.pack(buf)?;
                sz += map.pack(buf)?;
            }
            sz += false.pack(buf)?;
            Ok(sz)
        };
        pack(&mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(BytesMut::from(&buf[..]))
    }
}
