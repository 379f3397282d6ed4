// NFS SYMLINK Procedure (Procedure 13)
//
// Creates a symbolic link

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::local::{self, AttrMask, NewAttrs};
use crate::protocol::v2::nfs::SymlinkArgs;

/// Handle NFS SYMLINK
///
/// Only owner and times of the requested attributes are applied, and the
/// requested group is ignored.
pub fn handle_symlink(req: &mut NfsRequest<'_>, args: SymlinkArgs) -> NfsResult<()> {
    let decision = req
        .gate
        .build_path(req.ctx, &args.from.dir, args.from.name.as_os_str(), AccessMode::Write)?;
    debug!("SYMLINK {:?} -> {:?}", decision.path, args.to.0);

    let attrs = NewAttrs {
        gid: None,
        ..req.new_attrs(&decision, &args.attributes)
    };
    with_identity(decision.identity, || {
        std::os::unix::fs::symlink(&args.to.0, &decision.path)?;
        local::set_attributes(&decision.path, None, &attrs, AttrMask::CHOWN | AttrMask::UTIMES)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::{DirOpArgs, Filename, NfsPath, NfsStat, SAttr};
    use std::ffi::OsString;
    use std::fs;

    fn symlink(fx: &mut Fixture, name: &str, target: &str) -> NfsResult<()> {
        let dir = fx.handle("");
        handle_symlink(
            &mut fx.request(),
            SymlinkArgs {
                from: DirOpArgs {
                    dir,
                    name: Filename::new(name),
                },
                to: NfsPath(OsString::from(target)),
                attributes: SAttr {
                    mode: 0o777,
                    ..SAttr::default()
                },
            },
        )
    }

    #[test]
    fn test_symlink() {
        let mut fx = Fixture::new();
        symlink(&mut fx, "l", "some/where").unwrap();
        assert_eq!(
            fs::read_link(fx.root.join("l")).unwrap(),
            std::path::PathBuf::from("some/where")
        );
    }

    #[test]
    fn test_symlink_exists() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("l"), b"").unwrap();
        let err = symlink(&mut fx, "l", "x").unwrap_err();
        assert_eq!(err.status(), NfsStat::Exist);
    }
}
