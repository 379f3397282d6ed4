// Portmapper SET Procedure Handler
//
// Procedure: 1 (PMAPPROC_SET)
// Purpose: Register a service

use bytes::BytesMut;
use tracing::info;

use crate::portmap::registry::Registry;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;
use crate::protocol::v2::portmap::{Mapping, PortmapMessage};

/// Handle Portmapper SET procedure
///
/// Arguments: mapping
/// Returns: bool (true if successfully registered)
pub fn handle(xid: u32, map: &Mapping, registry: &Registry) -> Result<BytesMut, ProtocolError> {
    info!(
        "PORTMAP SET: registering prog={}, vers={}, prot={}, port={}",
        map.prog, map.vers, map.prot, map.port
    );
    let success = registry.set(map);
    let result_data = PortmapMessage::serialize_bool(success)?;
    RpcMessage::create_success_reply_with_data(xid, &result_data)
}
