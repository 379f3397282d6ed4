// Mount Matching
//
// A client's mounts are kept longest path first, so the first mount whose
// path is a component-wise prefix of the request path is the most specific
// export. Paths on a different device than the export root are only visible
// when the export allows crossing mount points; a sub-export is then
// synthesized at the mount point so later lookups see the device boundary.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ClientId, ExportTable, Mount, MountId};

/// Reports the device a path lives on
pub trait DeviceProbe {
    fn device_of(&self, path: &Path) -> Option<u64>;
}

/// Device lookup backed by lstat
///
/// Paths that do not exist yet (e.g. the target of a CREATE) are attributed
/// to the closest existing ancestor.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl DeviceProbe for FsProbe {
    fn device_of(&self, path: &Path) -> Option<u64> {
        path.ancestors()
            .find_map(|p| std::fs::symlink_metadata(p).ok())
            .map(|meta| meta.dev())
    }
}

impl ExportTable {
    /// Select the export of `client` that governs `path`
    ///
    /// `path` must be absolute and normalized.
    pub fn match_mount(&mut self, client: ClientId, path: &Path, probe: &dyn DeviceProbe) -> Option<MountId> {
        let (id, mount) = self.mounts_of(client).find(|(_, m)| path.starts_with(&m.path))?;

        if path == mount.path {
            return Some(id);
        }

        let root_dev = probe.device_of(&mount.path);
        let path_dev = probe.device_of(path);
        if root_dev == path_dev {
            return Some(id);
        }

        if !mount.options.cross_mounts {
            debug!(
                "{} is on another device than export {}, not visible",
                path.display(),
                mount.path.display()
            );
            return None;
        }

        let boundary = mount_point(&mount.path, path, path_dev, probe);
        Some(self.add_submount(id, boundary))
    }

    /// Add an export at `path` below `parent`, inheriting its policy
    fn add_submount(&mut self, parent: MountId, path: PathBuf) -> MountId {
        let source = self.mount(parent).clone();
        let client = source.client;
        debug!(
            "Adding sub-export {} below {} for client {}",
            path.display(),
            source.path.display(),
            self.client(client).name
        );
        let id = self.push_mount(Mount {
            path,
            parent: Some(parent),
            ..source
        });
        self.sort_mounts(client);
        id
    }
}

/// Topmost directory between `root` (exclusive) and `path` that lives on `dev`
fn mount_point(root: &Path, path: &Path, dev: Option<u64>, probe: &dyn DeviceProbe) -> PathBuf {
    let mut boundary = path;
    for ancestor in path.ancestors().skip(1) {
        if ancestor == root || !ancestor.starts_with(root) {
            break;
        }
        if probe.device_of(ancestor) != dev {
            break;
        }
        boundary = ancestor;
    }
    boundary.to_path_buf()
}
