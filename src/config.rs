// Server Configuration
//
// Command-line options with environment fallbacks. Parsed once at startup
// and shared read-only by every worker.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Kinds of debug output that can be switched on individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugKind {
    General,
    Call,
    Fhcache,
    Auth,
    Ugid,
    Rmtab,
    All,
}

impl DebugKind {
    /// Log targets enabled at debug level for this kind
    pub fn targets(&self) -> &'static [&'static str] {
        match self {
            DebugKind::General => &["unfsd"],
            DebugKind::Call => &["unfsd::nfs", "unfsd::mount", "unfsd::rpc"],
            DebugKind::Fhcache => &["unfsd::fsal::handle"],
            DebugKind::Auth => &["unfsd::auth"],
            DebugKind::Ugid => &["unfsd::auth::ugid", "unfsd::auth::identity"],
            DebugKind::Rmtab => &["unfsd::mount::rmtab"],
            DebugKind::All => &["unfsd"],
        }
    }
}

/// User-space NFS server
#[derive(Debug, Clone, Parser)]
#[command(name = "unfsd")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Exports file
    #[arg(
        short = 'f',
        long,
        env = "UNFSD_EXPORTS",
        value_name = "FILE",
        default_value = "/etc/exports"
    )]
    pub exports_file: PathBuf,

    /// TCP port for PORTMAP, MOUNT and NFS
    #[arg(short, long, env = "UNFSD_PORT", default_value = "2049")]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "UNFSD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Number of worker threads serving calls
    #[arg(short = 'n', long, env = "UNFSD_WORKERS", default_value = "4")]
    pub workers: usize,

    /// Serve unknown hosts with a read-only, root-squashed view of all exports
    #[arg(short = 'P', long, env = "UNFSD_PROMISCUOUS")]
    pub promiscuous: bool,

    /// Allow exporting directories that are themselves NFS mounts
    #[arg(short = 'r', long, env = "UNFSD_RE_EXPORT")]
    pub re_export: bool,

    /// Refuse every modifying call
    #[arg(short = 'R', long, env = "UNFSD_READ_ONLY")]
    pub read_only: bool,

    /// Do not follow local mount points beneath an export by default
    #[arg(short = 'x', long, env = "UNFSD_NO_CROSS_MOUNTS")]
    pub no_cross_mounts: bool,

    /// Keep running when not started as root
    #[arg(long, env = "UNFSD_ALLOW_NON_ROOT")]
    pub allow_non_root: bool,

    /// Local uid treated as the superuser
    #[arg(long, env = "UNFSD_ROOT_UID", default_value = "0")]
    pub root_uid: u32,

    /// Log file transfers (READ and WRITE at offset zero)
    #[arg(short = 'l', long, env = "UNFSD_LOG_TRANSFERS")]
    pub log_transfers: bool,

    /// Mount activity log
    #[arg(
        long,
        env = "UNFSD_RMTAB",
        value_name = "FILE",
        default_value = "/var/lib/nfs/rmtab"
    )]
    pub rmtab: PathBuf,

    /// Netgroup database used for @group exports
    #[arg(
        long,
        env = "UNFSD_NETGROUP_FILE",
        value_name = "FILE",
        default_value = "/etc/netgroup"
    )]
    pub netgroup_file: PathBuf,

    /// Identity service used by map_nis exports (host[:port])
    #[arg(long, env = "UNFSD_DIRECTORY_SERVICE", value_name = "HOST")]
    pub directory_service: Option<String>,

    /// Seconds between handle cache maintenance passes
    #[arg(long, env = "UNFSD_FLUSH_INTERVAL", default_value = "30")]
    pub flush_interval: u64,

    /// Debug output to enable
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub debug: Vec<DebugKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "UNFSD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Settings consulted by the core while serving calls
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub exports_file: PathBuf,
    pub listen: SocketAddr,
    pub workers: usize,
    pub promiscuous: bool,
    pub re_export: bool,
    pub read_only: bool,
    pub cross_mounts: bool,
    pub allow_non_root: bool,
    pub root_uid: u32,
    pub log_transfers: bool,
    pub rmtab: PathBuf,
    pub netgroup_file: PathBuf,
    pub directory_service: Option<String>,
    pub flush_interval: Duration,
}

impl Args {
    /// Build the runtime configuration
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let listen: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {}: {}", self.bind, e))?;

        Ok(ServerConfig {
            exports_file: self.exports_file.clone(),
            listen,
            workers: self.workers.max(1),
            promiscuous: self.promiscuous,
            re_export: self.re_export,
            read_only: self.read_only,
            cross_mounts: !self.no_cross_mounts,
            allow_non_root: self.allow_non_root,
            root_uid: self.root_uid,
            log_transfers: self.log_transfers,
            rmtab: self.rmtab.clone(),
            netgroup_file: self.netgroup_file.clone(),
            directory_service: self.directory_service.clone(),
            flush_interval: Duration::from_secs(self.flush_interval.max(1)),
        })
    }

    /// Filter directive for the tracing subscriber
    pub fn log_filter(&self) -> String {
        let mut directives = vec![self.log_level.clone()];
        for kind in &self.debug {
            for target in kind.targets() {
                directives.push(format!("{}=debug", target));
            }
        }
        directives.join(",")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            exports_file: PathBuf::from("/etc/exports"),
            listen: SocketAddr::from(([0, 0, 0, 0], 2049)),
            workers: 1,
            promiscuous: false,
            re_export: false,
            read_only: false,
            cross_mounts: true,
            allow_non_root: false,
            root_uid: 0,
            log_transfers: false,
            rmtab: PathBuf::from("/var/lib/nfs/rmtab"),
            netgroup_file: PathBuf::from("/etc/netgroup"),
            directory_service: None,
            flush_interval: Duration::from_secs(30),
        }
    }
}
