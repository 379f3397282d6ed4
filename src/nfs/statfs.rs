// NFS STATFS Procedure (Procedure 17)
//
// Reports filesystem usage for the filesystem holding a file

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::local::{self, USAGE_BLOCK_SIZE};
use crate::protocol::v2::nfs::{FHandle, MAXDATA, StatfsOk};

/// Handle NFS STATFS
///
/// Block counts are in 512-byte units and clamp at the 32-bit maximum.
pub fn handle_statfs(req: &mut NfsRequest<'_>, fh: FHandle) -> NfsResult<StatfsOk> {
    let decision = req.gate.authorize(req.ctx, &fh, AccessMode::ReadData)?;
    let usage = with_identity(decision.identity, || local::fs_usage(&decision.path))?;
    debug!("STATFS {:?}: {:?}", decision.path, usage);

    let clamp = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
    Ok(StatfsOk {
        tsize: MAXDATA,
        bsize: USAGE_BLOCK_SIZE as u32,
        blocks: clamp(usage.blocks),
        bfree: clamp(usage.bfree),
        bavail: clamp(usage.bavail),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;

    #[test]
    fn test_statfs() {
        let mut fx = Fixture::new();
        let root = fx.handle("");
        let res = handle_statfs(&mut fx.request(), root).unwrap();
        assert_eq!(res.tsize, 8192);
        assert_eq!(res.bsize, 512);
        assert!(res.blocks >= res.bfree);
    }
}
