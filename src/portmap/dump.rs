// Portmapper DUMP Procedure Handler
//
// Procedure: 4 (PMAPPROC_DUMP)
// Purpose: List every registration

use bytes::BytesMut;
use tracing::debug;

use crate::portmap::registry::Registry;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;
use crate::protocol::v2::portmap::PortmapMessage;

/// Handle Portmapper DUMP procedure
pub fn handle(xid: u32, registry: &Registry) -> Result<BytesMut, ProtocolError> {
    let maps = registry.dump();
    debug!("PORTMAP DUMP: {} mappings", maps.len());
    let result_data = PortmapMessage::serialize_mappings(&maps)?;
    RpcMessage::create_success_reply_with_data(xid, &result_data)
}
