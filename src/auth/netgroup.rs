// Netgroup Membership
//
// Netgroup file format, one group per line:
//
//     trusted (alpha,,) (beta,-,) staff
//     staff   (gamma,,example)
//
// A member is either a (host,user,domain) triple or the name of another
// group. Only the host field matters for export matching; an empty host
// field matches every host, `-` matches none.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::path::Path;
use tracing::{debug, warn};

/// Answers "is this address a member of that netgroup"
pub trait NetgroupResolver: Send + Sync {
    fn contains(&self, group: &str, addr: Ipv4Addr) -> bool;
}

/// Resolver for hosts without netgroup support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetgroups;

impl NetgroupResolver for NoNetgroups {
    fn contains(&self, _group: &str, _addr: Ipv4Addr) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
enum Member {
    AnyHost,
    Hosts(Vec<Ipv4Addr>),
    Group(String),
}

/// Netgroups read from a file, with member hosts resolved at load time
#[derive(Debug, Default)]
pub struct FileNetgroups {
    groups: HashMap<String, Vec<Member>>,
}

impl FileNetgroups {
    /// Load a netgroup file; a missing file yields an empty database
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No netgroup file at {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read netgroup file {}", path.display()))?;
        Ok(Self::parse(&text, resolve_host))
    }

    /// Parse netgroup text, resolving host names with `resolve`
    pub fn parse(text: &str, resolve: impl Fn(&str) -> Vec<Ipv4Addr>) -> Self {
        let mut groups = HashMap::new();

        for line in join_continuations(text) {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((name, rest)) = line.split_once(char::is_whitespace) else {
                continue;
            };

            let mut members = Vec::new();
            let mut rest = rest.trim();
            while !rest.is_empty() {
                if let Some(body) = rest.strip_prefix('(') {
                    let Some(end) = body.find(')') else {
                        warn!("Unterminated netgroup triple in group {}", name);
                        break;
                    };
                    let host = body[..end].split(',').next().unwrap_or("").trim();
                    members.push(match host {
                        "" => Member::AnyHost,
                        "-" => Member::Hosts(Vec::new()),
                        host => Member::Hosts(resolve(host)),
                    });
                    rest = body[end + 1..].trim_start();
                } else {
                    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                    members.push(Member::Group(rest[..end].to_string()));
                    rest = rest[end..].trim_start();
                }
            }
            groups.insert(name.to_string(), members);
        }

        FileNetgroups { groups }
    }

    fn contains_inner<'a>(&'a self, group: &'a str, addr: Ipv4Addr, seen: &mut HashSet<&'a str>) -> bool {
        if !seen.insert(group) {
            return false;
        }
        let Some(members) = self.groups.get(group) else {
            return false;
        };
        members.iter().any(|member| match member {
            Member::AnyHost => true,
            Member::Hosts(addrs) => addrs.contains(&addr),
            Member::Group(nested) => self.contains_inner(nested, addr, seen),
        })
    }
}

impl NetgroupResolver for FileNetgroups {
    fn contains(&self, group: &str, addr: Ipv4Addr) -> bool {
        self.contains_inner(group, addr, &mut HashSet::new())
    }
}

fn join_continuations(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(line);
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Forward-resolve a host name or dotted address to its IPv4 addresses
pub fn resolve_host(host: &str) -> Vec<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return vec![addr];
    }
    match (host, 0).to_socket_addrs() {
        Ok(addrs) => {
            let mut v4: Vec<Ipv4Addr> = addrs
                .filter_map(|a| match a.ip() {
                    std::net::IpAddr::V4(ip) => Some(ip),
                    std::net::IpAddr::V6(_) => None,
                })
                .collect();
            v4.dedup();
            v4
        }
        Err(e) => {
            warn!("Cannot resolve host {}: {}", host, e);
            Vec::new()
        }
    }
}
