// Portmapper Service Registry
//
// Maintains the mapping of (program, version, protocol) -> port

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::protocol::v2::portmap::Mapping;

/// Key for service lookups: (program, version, protocol)
type ServiceKey = (u32, u32, u32);

/// Portmapper service registry
///
/// Shared by every connection; the server registers its own programs here
/// at startup and remote callers may add more with SET.
#[derive(Clone, Default)]
pub struct Registry {
    mappings: Arc<RwLock<BTreeMap<ServiceKey, u32>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service (PMAPPROC_SET)
    ///
    /// An existing registration on a different port is not replaced.
    pub fn set(&self, map: &Mapping) -> bool {
        let key = (map.prog, map.vers, map.prot);
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);

        match mappings.get(&key) {
            Some(port) if *port != map.port => {
                debug!(
                    "Refusing to register prog={}, vers={}, prot={} on {}: already on {}",
                    map.prog, map.vers, map.prot, map.port, port
                );
                false
            }
            _ => {
                mappings.insert(key, map.port);
                info!(
                    "Registered service: prog={}, vers={}, prot={}, port={}",
                    map.prog, map.vers, map.prot, map.port
                );
                true
            }
        }
    }

    /// Unregister a service (PMAPPROC_UNSET)
    ///
    /// The protocol field is ignored: every transport of the program
    /// version goes. Returns true if anything was removed.
    pub fn unset(&self, map: &Mapping) -> bool {
        let mut mappings = self.mappings.write().unwrap_or_else(PoisonError::into_inner);
        let before = mappings.len();
        mappings.retain(|(prog, vers, _), _| !(*prog == map.prog && *vers == map.vers));
        let existed = mappings.len() != before;

        if existed {
            info!("Unregistered service: prog={}, vers={}", map.prog, map.vers);
        }
        existed
    }

    /// Query the port for a service (PMAPPROC_GETPORT)
    ///
    /// Returns 0 if the service is not registered.
    pub fn getport(&self, map: &Mapping) -> u32 {
        let key = (map.prog, map.vers, map.prot);
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        let port = mappings.get(&key).copied().unwrap_or(0);

        debug!(
            "Query service: prog={}, vers={}, prot={} -> port={}",
            map.prog, map.vers, map.prot, port
        );
        port
    }

    /// All registered mappings in key order (PMAPPROC_DUMP)
    pub fn dump(&self) -> Vec<Mapping> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        mappings
            .iter()
            .map(|((prog, vers, prot), port)| Mapping {
                prog: *prog,
                vers: *vers,
                prot: *prot,
                port: *port,
            })
            .collect()
    }
}
