// NFSv2 Protocol Types and Middleware
//
// Hand-written XDR codecs for the three programs served over the single
// listening port:
// - PORTMAP v2 (100000)
// - MOUNT v1 (100005)
// - NFS v2 (100003)

pub mod mount;
pub mod nfs;
pub mod portmap;

// Re-export for convenience
pub use mount::MountMessage;
pub use nfs::NfsMessage;
pub use portmap::PortmapMessage;
