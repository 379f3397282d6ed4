// Protocol middleware layer
//
// XDR message types for ONC RPC, PORTMAP v2, MOUNT v1 and NFS v2, plus the
// serialization helpers shared by every procedure handler.

/// Implement `Pack` for a struct by packing its fields in declaration order
macro_rules! xdr_pack {
    ($name:ident { $($field:ident),* $(,)? }) => {
        impl<Out: std::io::Write> xdr_codec::Pack<Out> for $name {
            fn pack(&self, out: &mut Out) -> xdr_codec::Result<usize> {
                let mut sz = 0;
                $(sz += xdr_codec::Pack::<Out>::pack(&self.$field, out)?;)*
                Ok(sz)
            }
        }
    };
}

/// Implement `Unpack` for a struct by decoding its fields in declaration order
macro_rules! xdr_unpack {
    ($name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        impl<In: std::io::Read> xdr_codec::Unpack<In> for $name {
            fn unpack(input: &mut In) -> xdr_codec::Result<(Self, usize)> {
                let mut sz = 0;
                $(
                    let ($field, n) = <$ty as xdr_codec::Unpack<In>>::unpack(input)?;
                    sz += n;
                )*
                Ok(($name { $($field),* }, sz))
            }
        }
    };
}

pub mod rpc;
pub mod v2;

use bytes::BytesMut;
use std::io::Cursor;
use thiserror::Error;
use xdr_codec::{Pack, Unpack};

// Re-export commonly used types
pub use rpc::RpcMessage;
pub use v2::{MountMessage, NfsMessage, PortmapMessage};

/// Errors raised while encoding or decoding XDR data
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("XDR decode failed: {0}")]
    Decode(String),

    #[error("XDR encode failed: {0}")]
    Encode(String),

    #[error("unexpected RPC message type {0}")]
    MessageType(u32),

    #[error("RPC call rejected by peer")]
    Rejected,

    #[error("RPC call not accepted by peer (status {0})")]
    NotAccepted(u32),
}

/// Decode a value from the front of `data`
///
/// Returns the value together with the number of bytes consumed.
pub fn decode_prefix<'a, T>(data: &'a [u8]) -> Result<(T, usize), ProtocolError>
where
    T: Unpack<Cursor<&'a [u8]>>,
{
    let mut cursor = Cursor::new(data);
    T::unpack(&mut cursor).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Decode a complete argument structure
pub fn decode<'a, T>(data: &'a [u8]) -> Result<T, ProtocolError>
where
    T: Unpack<Cursor<&'a [u8]>>,
{
    decode_prefix(data).map(|(value, _)| value)
}

/// Encode a value into a fresh buffer
pub fn encode<T>(value: &T) -> Result<BytesMut, ProtocolError>
where
    T: Pack<Vec<u8>>,
{
    let mut buf = Vec::new();
    value
        .pack(&mut buf)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(BytesMut::from(&buf[..]))
}
