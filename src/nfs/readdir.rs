// NFS READDIR Procedure (Procedure 16)
//
// Lists directory entries. The cookie is the directory stream position
// right after an entry, so a listing resumes in the right place even when
// entries were removed in between. Positions too large for the 4-byte
// cookie are swapped for tokens remembered by the worker.

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::is_nfs_mounted;
use crate::fsal::local::{self, DirView};
use crate::protocol::v2::nfs::{Cookie, Entry, Filename, ReaddirArgs, ReaddirOk};

/// Handle NFS READDIR
///
/// No-access exports and directories on NFS mounts (unless re-exporting)
/// only list `.` and `..`. At a top-level export root `..` reports the
/// directory's own file id.
pub fn handle_readdir(req: &mut NfsRequest<'_>, args: ReaddirArgs) -> NfsResult<ReaddirOk> {
    let decision = req.gate.authorize(req.ctx, &args.dir, AccessMode::Read)?;
    let mount = req.gate.mount(&decision);
    let view = DirView {
        dots_only: mount.options.no_access || (!req.config.re_export && is_nfs_mounted(&decision.path)),
        export_root: mount.parent.is_none() && decision.path == mount.path,
    };

    let cookies = req.gate.handles().dir_cookies();
    let page = with_identity(decision.identity, || {
        local::read_dir_page(&decision.path, args.cookie.0, args.count, view, cookies)
    })?;
    debug!(
        "READDIR {:?}: cookie={}, count={} -> {} entries, eof={}",
        decision.path,
        args.cookie.0,
        args.count,
        page.entries.len(),
        page.eof
    );

    Ok(ReaddirOk {
        entries: page
            .entries
            .into_iter()
            .map(|e| Entry {
                fileid: e.fileid,
                name: Filename(e.name),
                cookie: Cookie(e.cursor),
            })
            .collect(),
        eof: page.eof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ExportTable;
    use crate::auth::MountOptions;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::FHandle;
    use std::fs;

    fn readdir(fx: &mut Fixture, dir: FHandle, cookie: u32, count: u32) -> ReaddirOk {
        handle_readdir(
            &mut fx.request(),
            ReaddirArgs {
                dir,
                cookie: Cookie(cookie),
                count,
            },
        )
        .unwrap()
    }

    fn names(res: &ReaddirOk) -> Vec<String> {
        res.entries
            .iter()
            .map(|e| e.name.0.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_one_entry_per_call() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.root.join("second/d")).unwrap();
        fs::write(fx.root.join("second/d/only"), b"").unwrap();
        let dir = fx.handle("second/d");

        let first = readdir(&mut fx, dir, 0, 1);
        assert_eq!(names(&first), vec!["."]);
        assert!(!first.eof);

        let second = readdir(&mut fx, dir, first.entries[0].cookie.0, 1);
        assert_eq!(names(&second), vec![".."]);
        assert!(!second.eof);

        let third = readdir(&mut fx, dir, second.entries[0].cookie.0, 1);
        assert_eq!(names(&third), vec!["only"]);
        assert!(third.eof);
    }

    #[test]
    fn test_resume_reproduces_listing() {
        let mut fx = Fixture::new();
        for i in 0..25 {
            fs::write(fx.root.join(format!("second/entry-{}", i)), b"").unwrap();
        }
        let dir = fx.handle("second");
        let whole = readdir(&mut fx, dir, 0, 1 << 20);
        assert!(whole.eof);

        let mut pieces = Vec::new();
        let mut cookie = 0;
        loop {
            let res = readdir(&mut fx, dir, cookie, 150);
            cookie = res.entries.last().unwrap().cookie.0;
            pieces.extend(res.entries.iter().map(|e| (e.name.clone(), e.fileid)));
            if res.eof {
                break;
            }
        }
        let expected: Vec<_> = whole.entries.iter().map(|e| (e.name.clone(), e.fileid)).collect();
        assert_eq!(pieces, expected);
    }

    #[test]
    fn test_export_root_dotdot() {
        let mut fx = Fixture::new();
        let root = fx.handle("");
        let res = readdir(&mut fx, root, 0, 1 << 20);
        assert_eq!(res.entries[0].fileid, res.entries[1].fileid);

        // A nested export has a parent, so its `..` is the real one
        let nested = fx.handle("second");
        let res = readdir(&mut fx, nested, 0, 1 << 20);
        assert_ne!(res.entries[0].fileid, res.entries[1].fileid);
    }

    #[test]
    fn test_noaccess_lists_dots_only() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("second/secret"), b"").unwrap();

        let mut table = ExportTable::new(std::sync::Arc::new(crate::auth::NoNetgroups));
        let client = table.get_or_add_client(
            "client",
            crate::auth::ClientKind::Exact,
            vec![std::net::Ipv4Addr::from(crate::nfs::testkit::CLIENT)],
        );
        let mut hidden = MountOptions::new(true);
        hidden.no_access = true;
        hidden.squash = crate::auth::Squash::None;
        table.add_mount(client, &fx.root.join("second"), hidden);
        fx.gate.replace_table(table);

        let dir = fx.handle("second");
        let res = readdir(&mut fx, dir, 0, 1 << 20);
        assert_eq!(names(&res), vec![".", ".."]);
        assert!(res.eof);
    }

    #[test]
    fn test_readdir_on_file_is_notdir() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"").unwrap();
        let file = fx.handle("f");
        let err = handle_readdir(
            &mut fx.request(),
            ReaddirArgs {
                dir: file,
                cookie: Cookie(0),
                count: 1024,
            },
        )
        .unwrap_err();
        assert_eq!(err.status(), crate::protocol::v2::nfs::NfsStat::NotDir);
    }
}
