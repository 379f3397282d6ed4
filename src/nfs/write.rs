// NFS WRITE Procedure (Procedure 8)
//
// Writes data to a file

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::{NfsError, NfsResult};
use crate::fsal::OpenMode;
use crate::fsal::local;
use crate::protocol::v2::nfs::{FAttr, MAXDATA, WriteArgs};

/// Handle NFS WRITE
///
/// Writes are synchronous; the reply carries the attributes after the
/// write.
pub fn handle_write(req: &mut NfsRequest<'_>, args: WriteArgs) -> NfsResult<FAttr> {
    let decision = req.gate.authorize(req.ctx, &args.file, AccessMode::Write)?;
    let data = &args.data.0;
    debug!(
        "WRITE {:?}: offset={}, len={}",
        decision.path,
        args.offset,
        data.len()
    );
    if data.len() > MAXDATA as usize {
        return Err(NfsError::from_errno(libc::EIO));
    }

    let handles = req.gate.handles();
    let meta = with_identity(decision.identity, || -> NfsResult<_> {
        let file = handles.open_fd(&args.file, OpenMode::Write, decision.identity)?;
        local::write(file, args.offset, data)?;
        Ok(file.metadata()?)
    })?;

    if args.offset == 0 {
        req.log_transfer(&decision.path, ">");
    }
    Ok(req.attributes(&decision, &meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::{FHandle, NfsData, NfsStat};
    use std::fs;

    fn write(file: FHandle, offset: u32, data: Vec<u8>) -> WriteArgs {
        WriteArgs {
            file,
            beginoffset: 0,
            offset,
            totalcount: 0,
            data: NfsData(data),
        }
    }

    #[test]
    fn test_write() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"hello").unwrap();
        let fh = fx.handle("f");

        let attrs = handle_write(&mut fx.request(), write(fh, 5, b" world".to_vec())).unwrap();
        assert_eq!(attrs.size, 11);
        assert_eq!(fs::read(fx.root.join("f")).unwrap(), b"hello world");
    }

    #[test]
    fn test_write_too_large() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"").unwrap();
        let fh = fx.handle("f");
        let err = handle_write(
            &mut fx.request(),
            write(fh, 0, vec![0; MAXDATA as usize + 1]),
        )
        .unwrap_err();
        assert_eq!(err.status(), NfsStat::Io);
    }

    #[test]
    fn test_write_read_only() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("ro/f"), b"").unwrap();
        let fh = fx.handle("ro/f");
        let err = handle_write(&mut fx.request(), write(fh, 0, b"x".to_vec())).unwrap_err();
        assert_eq!(err.status(), NfsStat::RoFs);
    }
}
