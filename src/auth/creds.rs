// Scoped Filesystem Credentials
//
// Filesystem calls made on behalf of a client run under the client's
// translated uid/gid. On Linux the filesystem uid and gid are per-thread,
// so switching them in one worker never affects another worker. The
// previous ids are restored when the guard drops, on every exit path.

use tracing::trace;

/// Local identity a filesystem call runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Identity { uid, gid }
    }
}

/// Holds a temporary filesystem identity until dropped
#[derive(Debug)]
pub struct CredentialGuard {
    previous: Option<Identity>,
}

impl CredentialGuard {
    /// Switch the calling thread's filesystem identity
    ///
    /// Without root privileges the switch is impossible; the guard is then
    /// inert and calls run as the server's own identity.
    pub fn assume(identity: Identity) -> Self {
        if !can_switch() {
            return CredentialGuard { previous: None };
        }
        let previous = switch(identity);
        trace!("fs identity {:?} -> {:?}", previous, identity);
        CredentialGuard {
            previous: Some(previous),
        }
    }

    pub fn is_active(&self) -> bool {
        self.previous.is_some()
    }
}

impl Drop for CredentialGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            switch(previous);
        }
    }
}

/// Run `f` with the filesystem identity set to `identity`
pub fn with_identity<T>(identity: Identity, f: impl FnOnce() -> T) -> T {
    let _guard = CredentialGuard::assume(identity);
    f()
}

fn can_switch() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(target_os = "linux")]
fn switch(identity: Identity) -> Identity {
    // gid first: changing it needs the privileged fsuid still in place
    let gid = unsafe { libc::setfsgid(identity.gid) } as u32;
    let uid = unsafe { libc::setfsuid(identity.uid) } as u32;
    Identity { uid, gid }
}

#[cfg(not(target_os = "linux"))]
fn switch(identity: Identity) -> Identity {
    let previous = Identity {
        uid: unsafe { libc::geteuid() },
        gid: unsafe { libc::getegid() },
    };
    unsafe {
        libc::setegid(identity.gid);
        libc::seteuid(identity.uid);
    }
    previous
}
