// Portmapper GETPORT Procedure Handler
//
// Procedure: 3 (PMAPPROC_GETPORT)
// Purpose: Query the port for a service

use bytes::BytesMut;
use tracing::debug;

use crate::portmap::registry::Registry;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;
use crate::protocol::v2::portmap::{Mapping, PortmapMessage};

/// Handle Portmapper GETPORT procedure
///
/// Arguments: mapping (only prog, vers, prot are used; port is ignored)
/// Returns: unsigned int (port number, 0 if not found)
pub fn handle(xid: u32, map: &Mapping, registry: &Registry) -> Result<BytesMut, ProtocolError> {
    let port = registry.getport(map);
    debug!("PORTMAP GETPORT: result port={}", port);
    let result_data = PortmapMessage::serialize_port(port)?;
    RpcMessage::create_success_reply_with_data(xid, &result_data)
}
