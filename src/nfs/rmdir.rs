// NFS RMDIR Procedure (Procedure 15)
//
// Removes an empty directory

use std::fs;
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::protocol::v2::nfs::DirOpArgs;

/// Handle NFS RMDIR
pub fn handle_rmdir(req: &mut NfsRequest<'_>, args: DirOpArgs) -> NfsResult<()> {
    let decision = req
        .gate
        .build_path(req.ctx, &args.dir, args.name.as_os_str(), AccessMode::Write)?;
    debug!("RMDIR {:?}", decision.path);

    req.gate.handles().invalidate(&decision.path);
    with_identity(decision.identity, || fs::remove_dir(&decision.path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::{Filename, NfsStat};

    fn rmdir(fx: &mut Fixture, name: &str) -> NfsResult<()> {
        let dir = fx.handle("");
        handle_rmdir(
            &mut fx.request(),
            DirOpArgs {
                dir,
                name: Filename::new(name),
            },
        )
    }

    #[test]
    fn test_rmdir() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.root.join("d")).unwrap();
        rmdir(&mut fx, "d").unwrap();
        assert!(!fx.root.join("d").exists());
    }

    #[test]
    fn test_rmdir_not_empty() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.root.join("d")).unwrap();
        fs::write(fx.root.join("d/f"), b"").unwrap();
        let err = rmdir(&mut fx, "d").unwrap_err();
        assert_eq!(err.status(), NfsStat::NotEmpty);
    }
}
