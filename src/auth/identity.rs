// Identity Services
//
// Name <-> id lookups used by the remote and directory uid map modes. Every
// failure (unknown name, unreachable peer, timeout, garbled reply) is
// reported as `None`; callers fall back to the nobody identity.

use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;
use xdr_codec::pack_string;

use crate::protocol::v2::portmap::{IPPROTO_TCP, Mapping};
use crate::protocol::rpc::RpcMessage;
use crate::protocol::{decode_prefix, encode};

/// ugidd program number
pub const UGID_PROGRAM: u32 = 545580417;

/// ugidd version
pub const UGID_V1: u32 = 1;

/// ugidd procedure numbers
pub mod procedures {
    pub const NULL: u32 = 0;
    pub const AUTHENTICATE: u32 = 1;
    pub const NAME_UID: u32 = 2;
    pub const GROUP_GID: u32 = 3;
    pub const UID_NAME: u32 = 4;
    pub const GID_GROUP: u32 = 5;
}

/// Id the service returns for unknown names
const REMOTE_NOBODY: u32 = (-2i32) as u32;

const MAX_UGNAME: usize = 64;
const PORTMAP_PORT: u16 = 111;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Name <-> id lookups in one user database
pub trait IdentityService {
    fn name_for_uid(&self, uid: u32) -> Option<String>;
    fn uid_for_name(&self, name: &str) -> Option<u32>;
    fn name_for_gid(&self, gid: u32) -> Option<String>;
    fn gid_for_name(&self, name: &str) -> Option<u32>;
}

/// The local passwd and group databases
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

const LOOKUP_BUF: usize = 4096;

impl IdentityService for SystemAccounts {
    fn name_for_uid(&self, uid: u32) -> Option<String> {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; LOOKUP_BUF];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        Some(name.to_string_lossy().into_owned())
    }

    fn uid_for_name(&self, name: &str) -> Option<u32> {
        let cname = CString::new(name).ok()?;
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; LOOKUP_BUF];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        Some(pwd.pw_uid)
    }

    fn name_for_gid(&self, gid: u32) -> Option<String> {
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; LOOKUP_BUF];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        Some(name.to_string_lossy().into_owned())
    }

    fn gid_for_name(&self, name: &str) -> Option<u32> {
        let cname = CString::new(name).ok()?;
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; LOOKUP_BUF];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        Some(grp.gr_gid)
    }
}

/// Client for a ugidd service
///
/// The service port is discovered through the host's portmapper on first
/// use unless given explicitly.
#[derive(Debug)]
pub struct RemoteIdentityClient {
    host: IpAddr,
    port: Cell<Option<u16>>,
    timeout: Duration,
    next_xid: Cell<u32>,
}

impl RemoteIdentityClient {
    /// Client for the ugidd running on `host`
    pub fn new(host: IpAddr) -> Self {
        RemoteIdentityClient {
            host,
            port: Cell::new(None),
            timeout: DEFAULT_TIMEOUT,
            next_xid: Cell::new(1),
        }
    }

    /// Client for an endpoint given as `host[:port]`
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()),
            None => (endpoint, None),
        };
        let addr = (host, 0).to_socket_addrs().ok()?.next()?;
        let client = Self::new(addr.ip());
        client.port.set(port);
        Some(client)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn xid(&self) -> u32 {
        let xid = self.next_xid.get();
        self.next_xid.set(xid.wrapping_add(1));
        xid
    }

    fn service_port(&self) -> Option<u16> {
        if let Some(port) = self.port.get() {
            return Some(port);
        }
        let query = Mapping {
            prog: UGID_PROGRAM,
            vers: UGID_V1,
            prot: IPPROTO_TCP,
            port: 0,
        };
        let args = encode(&query).ok()?;
        let reply = self.call(PORTMAP_PORT, 100000, 2, 3, &args)?;
        let (port, _) = decode_prefix::<u32>(&reply).ok()?;
        let port = u16::try_from(port).ok().filter(|p| *p != 0)?;
        self.port.set(Some(port));
        Some(port)
    }

    fn call(&self, port: u16, prog: u32, vers: u32, proc_: u32, args: &[u8]) -> Option<Vec<u8>> {
        let addr = SocketAddr::new(self.host, port);
        let xid = self.xid();
        let call = RpcMessage::create_call(xid, prog, vers, proc_, args);

        let exchange = || -> std::io::Result<Vec<u8>> {
            let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
            stream.set_read_timeout(Some(self.timeout))?;
            stream.set_write_timeout(Some(self.timeout))?;

            let mut record = Vec::with_capacity(4 + call.len());
            record.extend_from_slice(&(call.len() as u32 | 0x8000_0000).to_be_bytes());
            record.extend_from_slice(&call);
            stream.write_all(&record)?;

            let mut reply = Vec::new();
            loop {
                let mut header = [0u8; 4];
                stream.read_exact(&mut header)?;
                let header = u32::from_be_bytes(header);
                let mut fragment = vec![0u8; (header & 0x7FFF_FFFF) as usize];
                stream.read_exact(&mut fragment)?;
                reply.extend_from_slice(&fragment);
                if header & 0x8000_0000 != 0 {
                    return Ok(reply);
                }
            }
        };

        let reply = match exchange() {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Identity lookup at {} failed: {}", addr, e);
                return None;
            }
        };
        match RpcMessage::deserialize_reply(&reply) {
            Ok((reply_xid, offset)) if reply_xid == xid => Some(reply[offset..].to_vec()),
            Ok(_) => None,
            Err(e) => {
                debug!("Identity lookup at {} rejected: {}", addr, e);
                None
            }
        }
    }

    fn lookup_id(&self, proc_: u32, name: &str) -> Option<u32> {
        let port = self.service_port()?;
        let mut args = Vec::new();
        pack_string(name, Some(MAX_UGNAME), &mut args).ok()?;
        let reply = self.call(port, UGID_PROGRAM, UGID_V1, proc_, &args)?;
        let (id, _) = decode_prefix::<u32>(&reply).ok()?;
        if id == REMOTE_NOBODY || id == u32::MAX {
            return None;
        }
        Some(id)
    }

    fn lookup_name(&self, proc_: u32, id: u32) -> Option<String> {
        let port = self.service_port()?;
        let args = encode(&id).ok()?;
        let reply = self.call(port, UGID_PROGRAM, UGID_V1, proc_, &args)?;
        let mut cursor = std::io::Cursor::new(&reply[..]);
        let (name, _) = xdr_codec::unpack_string(&mut cursor, Some(MAX_UGNAME)).ok()?;
        if name.is_empty() { None } else { Some(name) }
    }
}

impl IdentityService for RemoteIdentityClient {
    fn name_for_uid(&self, uid: u32) -> Option<String> {
        self.lookup_name(procedures::UID_NAME, uid)
    }

    fn uid_for_name(&self, name: &str) -> Option<u32> {
        self.lookup_id(procedures::NAME_UID, name)
    }

    fn name_for_gid(&self, gid: u32) -> Option<String> {
        self.lookup_name(procedures::GID_GROUP, gid)
    }

    fn gid_for_name(&self, name: &str) -> Option<u32> {
        self.lookup_id(procedures::GROUP_GID, name)
    }
}
