// NFS NULL, ROOT and WRITECACHE Procedures (0, 3, 7)
//
// None of these do any work. ROOT and WRITECACHE are obsolete in NFSv2 and
// answer with an empty body exactly like NULL.

use bytes::BytesMut;
use tracing::debug;

use crate::protocol::ProtocolError;
use crate::protocol::rpc::RpcMessage;

/// Reply with an empty result
pub fn handle_void(xid: u32) -> Result<BytesMut, ProtocolError> {
    debug!("NFS void procedure (xid={})", xid);
    RpcMessage::create_success_reply_with_data(xid, &[])
}
