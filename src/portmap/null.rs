// Portmapper NULL Procedure Handler
//
// Procedure: 0 (NULL)
// Purpose: Test connectivity

use bytes::BytesMut;
use tracing::debug;

use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;

/// Handle Portmapper NULL procedure
pub fn handle(xid: u32) -> Result<BytesMut, ProtocolError> {
    debug!("PORTMAP NULL: xid={}", xid);
    RpcMessage::create_success_reply_with_data(xid, &[])
}
