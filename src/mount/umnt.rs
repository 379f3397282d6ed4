// MOUNT UMNT and UMNTALL Procedure Handlers
//
// Procedures: 3 (UMNT), 4 (UMNTALL)
// Purpose: Drop activity log entries of the calling host

use std::path::Path;
use tracing::{info, warn};

use super::MountRequest;
use crate::protocol::v2::mount::DirPath;

/// Handle MOUNT UMNT procedure
///
/// Unmounting is advisory and always succeeds; only the activity log
/// changes.
pub fn handle(req: &mut MountRequest<'_>, dirpath: DirPath) {
    let host = req.host();
    let path = Path::new(&dirpath.0);
    info!("MOUNT UMNT request from {} for {}", host, path.display());

    if let Err(e) = req.rmtab.remove_mount(&host, &path.to_string_lossy()) {
        warn!("Failed to remove mount of {} by {}: {:#}", path.display(), host, e);
    }
}

/// Handle MOUNT UMNTALL procedure
pub fn handle_all(req: &mut MountRequest<'_>) {
    let host = req.host();
    info!("MOUNT UMNTALL request from {}", host);

    if let Err(e) = req.rmtab.remove_all_mounts(&host) {
        warn!("Failed to remove mounts of {}: {:#}", host, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::testkit::MountFixture;
    use std::ffi::OsString;

    #[test]
    fn test_umnt_only_touches_caller() {
        let mut mf = MountFixture::new();
        mf.rmtab.record_mount("10.0.0.5", "/a").unwrap();
        mf.rmtab.record_mount("10.0.0.5", "/b").unwrap();
        mf.rmtab.record_mount("10.0.0.6", "/a").unwrap();

        handle(&mut mf.request(), DirPath(OsString::from("/a")));
        let left: Vec<_> = mf
            .rmtab
            .list_mounts()
            .unwrap()
            .into_iter()
            .map(|m| format!("{}:{}", m.hostname, m.directory))
            .collect();
        assert_eq!(left, vec!["10.0.0.5:/b", "10.0.0.6:/a"]);

        handle_all(&mut mf.request());
        let left = mf.rmtab.list_mounts().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].hostname, "10.0.0.6");
    }
}
