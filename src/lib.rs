// unfsd - user-space NFS server
//
// This library provides the core components of an NFSv2 server: export
// table and authorization, the NFS and MOUNT procedure engines, and the
// RPC transport with its worker pool.

pub mod auth;
pub mod config;
pub mod error;
pub mod fsal;
pub mod mount;
pub mod nfs;
pub mod portmap;
pub mod protocol;
pub mod rpc;

// Re-export commonly used types
pub use auth::ExportTable;
pub use config::ServerConfig;
pub use error::{NfsError, NfsResult};
pub use fsal::HandleCache;
