// NFS READ Procedure (Procedure 6)
//
// Reads data from a file

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::OpenMode;
use crate::fsal::local;
use crate::protocol::v2::nfs::{NfsData, ReadArgs, ReadOk};

/// Handle NFS READ
///
/// At most MAXDATA bytes are returned. The file is opened without
/// following a final symlink.
pub fn handle_read(req: &mut NfsRequest<'_>, args: ReadArgs) -> NfsResult<ReadOk> {
    let decision = req.gate.authorize(req.ctx, &args.file, AccessMode::ReadData)?;
    debug!(
        "READ {:?}: offset={}, count={}",
        decision.path, args.offset, args.count
    );

    let handles = req.gate.handles();
    let (data, meta) = with_identity(decision.identity, || -> NfsResult<_> {
        let file = handles.open_fd(&args.file, OpenMode::Read, decision.identity)?;
        let data = local::read(file, args.offset, args.count)?;
        Ok((data, file.metadata()?))
    })?;

    if args.offset == 0 {
        req.log_transfer(&decision.path, "<");
    }
    Ok(ReadOk {
        attributes: req.attributes(&decision, &meta),
        data: NfsData(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NfsError;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::MAXDATA;
    use std::fs;

    fn read(fx: &mut Fixture, rel: &str, offset: u32, count: u32) -> NfsResult<ReadOk> {
        let file = fx.handle(rel);
        handle_read(
            &mut fx.request(),
            ReadArgs {
                file,
                offset,
                count,
                totalcount: 0,
            },
        )
    }

    #[test]
    fn test_read() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"hello world").unwrap();

        let res = read(&mut fx, "f", 6, 100).unwrap();
        assert_eq!(res.data.0, b"world");
        assert_eq!(res.attributes.size, 11);
    }

    #[test]
    fn test_read_capped() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("big"), vec![1u8; 3 * MAXDATA as usize]).unwrap();
        let res = read(&mut fx, "big", 0, 4 * MAXDATA).unwrap();
        assert_eq!(res.data.0.len(), MAXDATA as usize);
    }

    #[test]
    fn test_read_symlink_refused() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"secret").unwrap();
        std::os::unix::fs::symlink(fx.root.join("f"), fx.root.join("l")).unwrap();
        assert!(matches!(read(&mut fx, "l", 0, 10), Err(NfsError::Io(_))));
    }
}
