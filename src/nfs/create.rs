// NFS CREATE Procedure (Procedure 9)
//
// Creates a regular file, or a special file when the mode carries the
// corresponding type bits.

use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use tracing::debug;

use super::NfsRequest;
use crate::auth::creds::with_identity;
use crate::auth::{AccessMode, Decision};
use crate::error::{NfsError, NfsResult};
use crate::fsal::local::{self, AttrMask, NewAttrs, SpecialKind};
use crate::protocol::v2::nfs::{CreateArgs, DirOpOk, SAttr};

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;

/// Default permissions of a new file created without a mode
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Character device number some clients use to ask for a FIFO
const LEGACY_FIFO_DEV: u64 = 0xFFFF;

/// What the client asked to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Regular,
    Special(SpecialKind),
    /// Directories and symlinks have their own procedures
    Other,
}

/// Handle NFS CREATE
///
/// Without type bits in the mode the type of an existing node of the same
/// name is assumed. On a read-only export this lets an existing special
/// file be "created" again, which is what `echo > /dev/null` on some
/// clients amounts to.
pub fn handle_create(req: &mut NfsRequest<'_>, args: CreateArgs) -> NfsResult<DirOpOk> {
    let sattr = args.attributes;
    let name = args.where_.name.as_os_str();
    let untyped = match NewAttrs::mode_from_wire(sattr.mode) {
        None => true,
        Some(mode) => mode & S_IFMT == 0,
    };

    let decision = match req.gate.build_path(req.ctx, &args.where_.dir, name, AccessMode::Write) {
        Ok(decision) => decision,
        Err(NfsError::ReadOnly) if untyped => {
            let decision = req.gate.build_path(req.ctx, &args.where_.dir, name, AccessMode::Read)?;
            let existing = with_identity(decision.identity, || fs::symlink_metadata(&decision.path)).ok();
            match existing.map(|meta| target_of(&meta)) {
                Some(Target::Special(_)) => {
                    debug!("CREATE {:?}: existing special file on read-only export", decision.path);
                    return req.dir_op_result(&decision, None);
                }
                _ => return Err(NfsError::ReadOnly),
            }
        }
        Err(e) => return Err(e),
    };

    let existing = with_identity(decision.identity, || fs::symlink_metadata(&decision.path)).ok();
    let target = match (&existing, untyped) {
        (Some(meta), true) => target_of(meta),
        (None, true) => Target::Regular,
        (_, false) => requested_target(&sattr)?,
    };
    debug!("CREATE {:?}: {:?}, exists={}", decision.path, target, existing.is_some());

    let open = match target {
        Target::Regular => Some(create_regular(req, &decision, existing.as_ref(), &sattr)?),
        Target::Special(kind) => {
            create_special(req, &decision, existing.as_ref(), kind, &sattr)?;
            None
        }
        Target::Other => return Err(NfsError::Exists),
    };

    req.dir_op_result(&decision, open)
}

/// Type of an existing node, for requests without type bits
fn target_of(meta: &Metadata) -> Target {
    let kind = match meta.mode() & S_IFMT {
        S_IFREG => return Target::Regular,
        m if m == libc::S_IFIFO as u32 => SpecialKind::Fifo,
        m if m == libc::S_IFSOCK as u32 => SpecialKind::Socket,
        m if m == libc::S_IFCHR as u32 => SpecialKind::Char(meta.rdev()),
        m if m == libc::S_IFBLK as u32 => SpecialKind::Block(meta.rdev()),
        _ => return Target::Other,
    };
    Target::Special(kind)
}

/// Target named by the type bits of the requested mode
///
/// Device numbers travel in the size field.
fn requested_target(sattr: &SAttr) -> NfsResult<Target> {
    let dev = u64::from(sattr.size);
    let target = match sattr.mode & S_IFMT {
        S_IFREG => Target::Regular,
        m if m == libc::S_IFIFO as u32 => Target::Special(SpecialKind::Fifo),
        m if m == libc::S_IFSOCK as u32 => Target::Special(SpecialKind::Socket),
        m if m == libc::S_IFCHR as u32 && dev == LEGACY_FIFO_DEV => Target::Special(SpecialKind::Fifo),
        m if m == libc::S_IFCHR as u32 => Target::Special(SpecialKind::Char(device_number(dev)?)),
        m if m == libc::S_IFBLK as u32 => Target::Special(SpecialKind::Block(device_number(dev)?)),
        _ => Target::Other,
    };
    Ok(target)
}

/// The client's device number must fit the local representation unchanged
fn device_number(dev: u64) -> NfsResult<u64> {
    let local = libc::dev_t::try_from(dev).map_err(|_| NfsError::Invalid)?;
    if u64::from(local) != dev {
        return Err(NfsError::Invalid);
    }
    Ok(dev)
}

fn create_regular(
    req: &mut NfsRequest<'_>,
    decision: &Decision,
    existing: Option<&Metadata>,
    sattr: &SAttr,
) -> NfsResult<File> {
    if existing.is_some_and(|meta| !meta.is_file()) {
        return Err(NfsError::Exists);
    }
    let attrs = req.new_attrs(decision, sattr);
    let fresh = existing.is_none();
    let truncate = sattr.size == 0;
    let mode = attrs.mode.unwrap_or(DEFAULT_FILE_MODE);

    let file = with_identity(decision.identity, || -> NfsResult<File> {
        let file = local::open_for_create(&decision.path, fresh, truncate, mode)?;
        let meta = file.metadata()?;
        if fresh {
            // A new file is empty already, and may have been created 0444
            let attrs = NewAttrs { gid: None, ..attrs };
            local::set_attributes(&decision.path, Some(&meta), &attrs, AttrMask::ALL.without(AttrMask::SIZE))?;
        } else {
            local::set_attributes(&decision.path, Some(&meta), &attrs, AttrMask::SIZE)?;
        }
        Ok(file)
    })?;
    Ok(file)
}

fn create_special(
    req: &mut NfsRequest<'_>,
    decision: &Decision,
    existing: Option<&Metadata>,
    kind: SpecialKind,
    sattr: &SAttr,
) -> NfsResult<()> {
    if let Some(meta) = existing {
        // Re-creating is fine as long as it is the very same node
        if !kind.matches(meta) {
            return Err(NfsError::Exists);
        }
        return Ok(());
    }

    let attrs = NewAttrs {
        gid: None,
        ..req.new_attrs(decision, sattr)
    };
    let mode = attrs.mode.unwrap_or(DEFAULT_FILE_MODE);
    with_identity(decision.identity, || -> NfsResult<()> {
        local::make_special(&decision.path, kind, mode)?;
        local::set_attributes(&decision.path, None, &attrs, AttrMask::ALL.without(AttrMask::SIZE))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::v2::nfs::{DirOpArgs, FType, Filename, NfsStat};

    fn create(fx: &mut Fixture, dir: &str, name: &str, mode: u32, size: u32) -> NfsResult<DirOpOk> {
        let dir = fx.handle(dir);
        handle_create(
            &mut fx.request(),
            CreateArgs {
                where_: DirOpArgs {
                    dir,
                    name: Filename::new(name),
                },
                attributes: SAttr {
                    mode,
                    size,
                    ..SAttr::default()
                },
            },
        )
    }

    #[test]
    fn test_create_regular() {
        let mut fx = Fixture::new();
        let res = create(&mut fx, "", "f", S_IFREG | 0o640, u32::MAX).unwrap();
        assert_eq!(res.attributes.ftype, FType::Reg);
        assert_eq!(res.attributes.mode & 0o7777, 0o640);
        assert_eq!(res.attributes.size, 0);
    }

    #[test]
    fn test_create_existing_truncates_only_on_zero_size() {
        let mut fx = Fixture::new();
        fs::write(fx.root.join("f"), b"content").unwrap();

        let res = create(&mut fx, "", "f", S_IFREG | 0o644, u32::MAX).unwrap();
        assert_eq!(res.attributes.size, 7);

        let res = create(&mut fx, "", "f", S_IFREG | 0o644, 0).unwrap();
        assert_eq!(res.attributes.size, 0);
    }

    #[test]
    fn test_create_over_directory_is_exist() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.root.join("d")).unwrap();

        let err = create(&mut fx, "", "d", S_IFREG | 0o644, 0).unwrap_err();
        assert_eq!(err.status(), NfsStat::Exist);
        let err = create(&mut fx, "", "d", 0o644, 0).unwrap_err();
        assert_eq!(err.status(), NfsStat::Exist);
        assert!(fx.root.join("d").is_dir());
    }

    #[test]
    fn test_create_fifo_and_legacy_encoding() {
        let mut fx = Fixture::new();
        let res = create(&mut fx, "", "p", libc::S_IFIFO as u32 | 0o600, 0).unwrap();
        assert_eq!(res.attributes.ftype, FType::Fifo);

        let res = create(&mut fx, "", "q", libc::S_IFCHR as u32 | 0o600, 0xFFFF).unwrap();
        assert_eq!(res.attributes.ftype, FType::Fifo);

        // Same type again is accepted, a different one is not
        assert!(create(&mut fx, "", "p", libc::S_IFIFO as u32 | 0o600, 0).is_ok());
        let err = create(&mut fx, "", "p", libc::S_IFSOCK as u32 | 0o600, 0).unwrap_err();
        assert_eq!(err.status(), NfsStat::Exist);
        let err = create(&mut fx, "", "p", S_IFREG | 0o600, 0).unwrap_err();
        assert_eq!(err.status(), NfsStat::Exist);
    }

    #[test]
    fn test_create_socket() {
        let mut fx = Fixture::new();
        let res = create(&mut fx, "", "s", libc::S_IFSOCK as u32 | 0o600, 0).unwrap();
        assert_eq!(res.attributes.ftype, FType::Sock);
    }

    #[test]
    fn test_create_on_read_only_export() {
        let mut fx = Fixture::new();
        local::make_special(&fx.root.join("ro/null"), SpecialKind::Fifo, 0o666).unwrap();

        // Untyped create of an existing special file succeeds
        let res = create(&mut fx, "ro", "null", 0o666, u32::MAX).unwrap();
        assert_eq!(res.attributes.ftype, FType::Fifo);

        let err = create(&mut fx, "ro", "new", 0o666, u32::MAX).unwrap_err();
        assert_eq!(err.status(), NfsStat::RoFs);
        let err = create(&mut fx, "ro", "null", libc::S_IFIFO as u32 | 0o666, 0).unwrap_err();
        assert_eq!(err.status(), NfsStat::RoFs);
    }

    #[test]
    fn test_create_with_legacy_ignored_mode() {
        let mut fx = Fixture::new();

        // 0xFFFF means "no mode", so the type comes from what exists
        let res = create(&mut fx, "", "f", 0xFFFF, u32::MAX).unwrap();
        assert_eq!(res.attributes.ftype, FType::Reg);
        assert!(fx.root.join("f").is_file());

        local::make_special(&fx.root.join("p"), SpecialKind::Fifo, 0o600).unwrap();
        let res = create(&mut fx, "", "p", 0xFFFF, u32::MAX).unwrap();
        assert_eq!(res.attributes.ftype, FType::Fifo);
    }

    #[test]
    fn test_new_file_is_readable_through_its_handle() {
        let mut fx = Fixture::new();
        let res = create(&mut fx, "", "f", S_IFREG | 0o644, u32::MAX).unwrap();
        fs::write(fx.root.join("f"), b"hello").unwrap();

        // The descriptor kept from CREATE is write-only
        let read = crate::nfs::read::handle_read(
            &mut fx.request(),
            crate::protocol::v2::nfs::ReadArgs {
                file: res.file,
                offset: 0,
                count: 16,
                totalcount: 0,
            },
        )
        .unwrap();
        assert_eq!(read.data.0, b"hello".to_vec());
    }
}
