// NFS SETATTR Procedure (Procedure 2)
//
// Changes size, times, mode and owner of a file and returns the new
// attributes.

use std::fs;
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::local::{self, AttrMask};
use crate::protocol::v2::nfs::{FAttr, SAttrArgs};

/// Handle NFS SETATTR
///
/// A failing step leaves the steps before it applied.
pub fn handle_setattr(req: &mut NfsRequest<'_>, args: SAttrArgs) -> NfsResult<FAttr> {
    let decision = req.gate.authorize(req.ctx, &args.file, AccessMode::Write)?;
    let attrs = req.new_attrs(&decision, &args.attributes);
    debug!("SETATTR {:?}: {:?}", decision.path, attrs);

    let meta = with_identity(decision.identity, || {
        local::set_attributes(&decision.path, decision.meta.as_ref(), &attrs, AttrMask::ALL)?;
        fs::symlink_metadata(&decision.path)
    })?;
    Ok(req.attributes(&decision, &meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NfsError;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::{SAttr, TimeVal};

    #[test]
    fn test_setattr_truncate_and_mode() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"hello world").unwrap();
        let fh = fx.handle("f");

        let args = SAttrArgs {
            file: fh,
            attributes: SAttr {
                mode: 0o600,
                size: 3,
                mtime: TimeVal {
                    seconds: 1_500_000_000,
                    useconds: 0,
                },
                ..SAttr::default()
            },
        };
        let attrs = handle_setattr(&mut fx.request(), args.clone()).unwrap();
        assert_eq!(attrs.size, 3);
        assert_eq!(attrs.mode & 0o7777, 0o600);
        assert_eq!(attrs.mtime.seconds, 1_500_000_000);

        // Same request again changes nothing
        let again = handle_setattr(&mut fx.request(), args).unwrap();
        assert_eq!(again.size, attrs.size);
        assert_eq!(again.mode, attrs.mode);
        assert_eq!(again.mtime, attrs.mtime);
    }

    #[test]
    fn test_setattr_read_only_export() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("ro/f"), b"x").unwrap();
        let fh = fx.handle("ro/f");
        let args = SAttrArgs {
            file: fh,
            attributes: SAttr {
                size: 0,
                ..SAttr::default()
            },
        };
        assert!(matches!(
            handle_setattr(&mut fx.request(), args),
            Err(NfsError::ReadOnly)
        ));
        assert_eq!(fs::read(fx.root.join("ro/f")).unwrap(), b"x");
    }
}
