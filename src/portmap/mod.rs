// Portmapper Protocol Handlers
//
// Program: 100000 (PORTMAP)
// Version: 2
//
// The portmapper is a service discovery mechanism for RPC services.
// Services register themselves (SET) and clients query for service ports (GETPORT).
// This server answers on the same port as MOUNT and NFS.

pub mod dump;
pub mod getport;
pub mod null;
pub mod registry;
pub mod set;
pub mod unset;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::protocol::ProtocolError;
use crate::protocol::rpc::{AcceptStat, CallHeader, RpcMessage};
use crate::protocol::v2::portmap::PortmapMessage;
pub use registry::Registry;

/// Portmapper program number (RFC 1833)
pub const PORTMAP_PROGRAM: u32 = 100000;

/// Portmapper version 2
pub const PORTMAP_V2: u32 = 2;

/// Portmapper procedure numbers
pub mod procedures {
    pub const NULL: u32 = 0;
    pub const SET: u32 = 1;
    pub const UNSET: u32 = 2;
    pub const GETPORT: u32 = 3;
    pub const DUMP: u32 = 4;
    pub const CALLIT: u32 = 5;
}

/// Name of a portmapper procedure for logging
pub fn procedure_name(procedure: u32) -> &'static str {
    match procedure {
        procedures::NULL => "NULL",
        procedures::SET => "SET",
        procedures::UNSET => "UNSET",
        procedures::GETPORT => "GETPORT",
        procedures::DUMP => "DUMP",
        procedures::CALLIT => "CALLIT",
        _ => "UNKNOWN",
    }
}

/// Dispatch Portmapper procedure call to appropriate handler
pub fn handle_portmap_call(
    call: &CallHeader,
    args_data: &[u8],
    registry: &Registry,
) -> Result<BytesMut, ProtocolError> {
    let xid = call.xid;

    if call.vers != PORTMAP_V2 {
        warn!("Expected PORTMAP version {}, got {}", PORTMAP_V2, call.vers);
        return RpcMessage::create_prog_mismatch_reply(xid, PORTMAP_V2, PORTMAP_V2);
    }

    match call.proc_ {
        procedures::NULL => null::handle(xid),
        procedures::DUMP => dump::handle(xid, registry),
        procedures::SET | procedures::UNSET | procedures::GETPORT => {
            let map = match PortmapMessage::deserialize_mapping(args_data) {
                Ok(map) => map,
                Err(e) => {
                    debug!("Failed to decode PORTMAP mapping (xid={}): {}", xid, e);
                    return RpcMessage::create_error_reply(xid, AcceptStat::GarbageArgs);
                }
            };
            match call.proc_ {
                procedures::SET => set::handle(xid, &map, registry),
                procedures::UNSET => unset::handle(xid, &map, registry),
                _ => getport::handle(xid, &map, registry),
            }
        }
        procedure => {
            // CALLIT would let anyone bounce calls off this host
            warn!("Unsupported PORTMAP procedure: {}", procedure);
            RpcMessage::create_error_reply(xid, AcceptStat::ProcUnavail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rpc::{MSG_CALL, OpaqueAuth, RPC_VERSION};
    use crate::protocol::v2::portmap::{IPPROTO_TCP, Mapping};
    use crate::protocol::{decode_prefix, encode};

    fn header(proc_: u32) -> CallHeader {
        CallHeader {
            xid: 1,
            mtype: MSG_CALL,
            rpcvers: RPC_VERSION,
            prog: PORTMAP_PROGRAM,
            vers: PORTMAP_V2,
            proc_,
            cred: OpaqueAuth::default(),
            verf: OpaqueAuth::default(),
        }
    }

    fn body(reply: &[u8]) -> &[u8] {
        let (_, offset) = RpcMessage::deserialize_reply(reply).unwrap();
        &reply[offset..]
    }

    #[test]
    fn test_set_then_getport_and_dump() {
        let registry = Registry::new();
        let map = Mapping {
            prog: 100005,
            vers: 1,
            prot: IPPROTO_TCP,
            port: 2049,
        };
        let args = encode(&map).unwrap();

        let reply = handle_portmap_call(&header(procedures::SET), &args, &registry).unwrap();
        assert!(decode_prefix::<bool>(body(&reply)).unwrap().0);

        let reply = handle_portmap_call(&header(procedures::GETPORT), &args, &registry).unwrap();
        assert_eq!(decode_prefix::<u32>(body(&reply)).unwrap().0, 2049);

        let reply = handle_portmap_call(&header(procedures::DUMP), &[], &registry).unwrap();
        // TRUE, four words, FALSE
        assert_eq!(body(&reply).len(), 4 + 16 + 4);
    }

    #[test]
    fn test_callit_unsupported() {
        let registry = Registry::new();
        let reply = handle_portmap_call(&header(procedures::CALLIT), &[], &registry).unwrap();
        assert!(matches!(
            RpcMessage::deserialize_reply(&reply),
            Err(ProtocolError::NotAccepted(3))
        ));
    }

    #[test]
    fn test_garbage_mapping() {
        let registry = Registry::new();
        let reply = handle_portmap_call(&header(procedures::GETPORT), &[0; 5], &registry).unwrap();
        assert!(matches!(
            RpcMessage::deserialize_reply(&reply),
            Err(ProtocolError::NotAccepted(4))
        ));
    }
}
