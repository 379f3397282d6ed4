// Portmapper UNSET Procedure Handler
//
// Procedure: 2 (PMAPPROC_UNSET)
// Purpose: Unregister a service

use bytes::BytesMut;
use tracing::info;

use crate::portmap::registry::Registry;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;
use crate::protocol::v2::portmap::{Mapping, PortmapMessage};

/// Handle Portmapper UNSET procedure
///
/// Arguments: mapping (port and protocol are ignored)
/// Returns: bool (true if anything was unregistered)
pub fn handle(xid: u32, map: &Mapping, registry: &Registry) -> Result<BytesMut, ProtocolError> {
    info!("PORTMAP UNSET: unregistering prog={}, vers={}", map.prog, map.vers);
    let success = registry.unset(map);
    let result_data = PortmapMessage::serialize_bool(success)?;
    RpcMessage::create_success_reply_with_data(xid, &result_data)
}
