// Exports File
//
// One export per line:
//
//     /srv/data   alpha(rw,no_root_squash) 10.1.0.0/16(ro) @trusted *(ro,all_squash)
//
// `#` starts a comment and a trailing `\` joins the next line. A path with
// no host, or an option list with no host in front of it, is exported to
// the world.

use anyhow::{Context, Result, anyhow, bail};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::netgroup::resolve_host;
use super::ugid::{StaticMap, parse_range};
use super::{ClientKind, ExportTable, MountOptions, NetgroupResolver, Squash, UidMapMode};

/// Server-wide settings that shape the table
#[derive(Debug, Clone, Copy)]
pub struct ExportDefaults {
    pub cross_mounts: bool,
    pub promiscuous: bool,
}

impl Default for ExportDefaults {
    fn default() -> Self {
        ExportDefaults {
            cross_mounts: true,
            promiscuous: false,
        }
    }
}

/// Read the exports file and build a fresh table
pub fn load_exports(
    path: &Path,
    defaults: ExportDefaults,
    netgroups: Arc<dyn NetgroupResolver>,
) -> Result<ExportTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read exports file {}", path.display()))?;
    let table = parse_exports(&text, defaults, netgroups, resolve_host)
        .with_context(|| format!("Invalid exports file {}", path.display()))?;
    info!(
        "Loaded {} exports from {}",
        table.exports().len(),
        path.display()
    );
    Ok(table)
}

/// Build a table from exports text, resolving host names with `resolve`
pub fn parse_exports(
    text: &str,
    defaults: ExportDefaults,
    netgroups: Arc<dyn NetgroupResolver>,
    resolve: impl Fn(&str) -> Vec<Ipv4Addr>,
) -> Result<ExportTable> {
    let mut table = ExportTable::new(netgroups);

    for (lineno, line) in logical_lines(text) {
        parse_line(&mut table, &line, defaults, &resolve).with_context(|| format!("line {}", lineno))?;
    }

    if defaults.promiscuous {
        add_default_client(&mut table, defaults);
    }
    table.link_parents();
    Ok(table)
}

/// Join continuations and strip comments; yields (first line number, text)
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending = String::new();
    let mut start = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("");
        if pending.is_empty() {
            start = idx + 1;
        }
        match line.trim_end().strip_suffix('\\') {
            Some(head) => {
                pending.push_str(head);
                pending.push(' ');
            }
            None => {
                pending.push_str(line);
                if !pending.trim().is_empty() {
                    out.push((start, pending.trim().to_string()));
                }
                pending.clear();
            }
        }
    }
    if !pending.trim().is_empty() {
        out.push((start, pending.trim().to_string()));
    }
    out
}

fn parse_line(
    table: &mut ExportTable,
    line: &str,
    defaults: ExportDefaults,
    resolve: &impl Fn(&str) -> Vec<Ipv4Addr>,
) -> Result<()> {
    let mut tokens = line.split_whitespace();
    let Some(raw_path) = tokens.next() else {
        return Ok(());
    };
    let path = normalize_export_path(raw_path)?;

    let specs: Vec<&str> = tokens.collect();
    if specs.is_empty() {
        add_export(table, &path, "*", MountOptions::new(defaults.cross_mounts), resolve)?;
        return Ok(());
    }

    for spec in specs {
        let (host, opts) = split_host_spec(spec)?;
        let mut options = MountOptions::new(defaults.cross_mounts);
        if let Some(opts) = opts {
            apply_options(&mut options, opts)?;
        }
        let host = if host.is_empty() { "*" } else { host };
        add_export(table, &path, host, options, resolve)?;
    }
    Ok(())
}

/// Split `host(opts)` into its parts
fn split_host_spec(spec: &str) -> Result<(&str, Option<&str>)> {
    match spec.find('(') {
        None => Ok((spec, None)),
        Some(open) => {
            let rest = &spec[open + 1..];
            let opts = rest
                .strip_suffix(')')
                .ok_or_else(|| anyhow!("unterminated option list in {}", spec))?;
            Ok((&spec[..open], Some(opts)))
        }
    }
}

fn normalize_export_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        bail!("export path {} is not absolute", raw);
    }
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::ParentDir => bail!("export path {} contains '..'", raw),
            _ => {}
        }
    }
    Ok(out)
}

fn add_export(
    table: &mut ExportTable,
    path: &Path,
    host: &str,
    options: MountOptions,
    resolve: &impl Fn(&str) -> Vec<Ipv4Addr>,
) -> Result<()> {
    let client = if host == "*" {
        table.record_export(path, None);
        table.get_or_add_client("*", ClientKind::Anonymous, Vec::new())
    } else if let Some(group) = host.strip_prefix('@') {
        table.record_export(path, Some(host));
        table.get_or_add_client(
            host,
            ClientKind::Netgroup {
                group: group.to_string(),
            },
            Vec::new(),
        )
    } else if let Some((addr, mask)) = host.split_once('/') {
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow!("bad network address {}", host))?;
        let mask = parse_mask(mask).ok_or_else(|| anyhow!("bad netmask in {}", host))?;
        let network = Ipv4Addr::from(u32::from(addr) & u32::from(mask));
        table.record_export(path, Some(host));
        table.get_or_add_client(host, ClientKind::Subnet { mask }, vec![network])
    } else {
        let addrs = match host.parse::<Ipv4Addr>() {
            Ok(addr) => vec![addr],
            Err(_) => resolve(host),
        };
        if addrs.is_empty() {
            warn!("Unknown host {} in export of {}, skipped", host, path.display());
            return Ok(());
        }
        table.record_export(path, Some(host));
        table.get_or_add_client(host, ClientKind::Exact, addrs)
    };

    debug!("Exporting {} to {}", path.display(), host);
    table.add_mount(client, path, options);
    Ok(())
}

/// Netmask given as dotted quad or prefix length
fn parse_mask(text: &str) -> Option<Ipv4Addr> {
    if let Ok(mask) = text.parse::<Ipv4Addr>() {
        return Some(mask);
    }
    let bits: u32 = text.parse().ok()?;
    match bits {
        0 => Some(Ipv4Addr::UNSPECIFIED),
        1..=32 => Some(Ipv4Addr::from(u32::MAX << (32 - bits))),
        _ => None,
    }
}

/// Split on commas, keeping `squash_uids=0-15,20-25` together
fn split_options(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let continues = token.starts_with(|c: char| c.is_ascii_digit())
            && out
                .last()
                .is_some_and(|prev| prev.starts_with("squash_uids=") || prev.starts_with("squash_gids="));
        match out.last_mut() {
            Some(prev) if continues => {
                prev.push(',');
                prev.push_str(token);
            }
            _ => out.push(token.to_string()),
        }
    }
    out
}

fn apply_options(options: &mut MountOptions, text: &str) -> Result<()> {
    let mut squash_uids: Vec<(u32, u32)> = Vec::new();
    let mut squash_gids: Vec<(u32, u32)> = Vec::new();
    let mut map_file: Option<PathBuf> = None;

    for opt in split_options(text) {
        let (key, value) = match opt.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (opt.as_str(), None),
        };
        match (key, value) {
            ("ro", None) => options.read_only = true,
            ("rw", None) => options.read_only = false,
            ("secure", None) => options.secure_port = true,
            ("insecure", None) => options.secure_port = false,
            ("root_squash", None) => options.squash = Squash::Root,
            ("no_root_squash", None) => {
                if options.squash == Squash::Root {
                    options.squash = Squash::None;
                }
            }
            ("all_squash", None) => options.squash = Squash::All,
            ("no_all_squash", None) => {
                if options.squash == Squash::All {
                    options.squash = Squash::Root;
                }
            }
            ("squash_uids", Some(v)) => squash_uids.extend(parse_ranges(v)?),
            ("squash_gids", Some(v)) => squash_gids.extend(parse_ranges(v)?),
            ("anonuid", Some(v)) => {
                options.nobody_uid = v.parse().map_err(|_| anyhow!("bad anonuid {}", v))?
            }
            ("anongid", Some(v)) => {
                options.nobody_gid = v.parse().map_err(|_| anyhow!("bad anongid {}", v))?
            }
            ("map_identity", None) => options.uid_map = UidMapMode::Identity,
            ("map_daemon", None) => options.uid_map = UidMapMode::Remote,
            ("map_static", Some(v)) => {
                options.uid_map = UidMapMode::Static;
                map_file = Some(PathBuf::from(v));
            }
            ("map_nis", Some(v)) => {
                options.uid_map = UidMapMode::Directory {
                    domain: v.to_string(),
                }
            }
            ("link_relative", None) => options.link_relative = true,
            ("link_absolute", None) => options.link_relative = false,
            ("noaccess", None) => options.no_access = true,
            ("crossmnt", None) => options.cross_mounts = true,
            ("nocrossmnt", None) => options.cross_mounts = false,
            _ => warn!("Unknown export option {}, ignored", opt),
        }
    }

    if map_file.is_none() && squash_uids.is_empty() && squash_gids.is_empty() {
        return Ok(());
    }

    let mut map = match &map_file {
        Some(path) => StaticMap::load(path)?,
        None => StaticMap::default(),
    };
    for (lo, hi) in squash_uids {
        map.squash_uids(lo, hi);
    }
    for (lo, hi) in squash_gids {
        map.squash_gids(lo, hi);
    }
    if options.uid_map == UidMapMode::Identity {
        options.uid_map = UidMapMode::Static;
    }
    options.static_map = Some(Arc::new(map));
    Ok(())
}

fn parse_ranges(text: &str) -> Result<Vec<(u32, u32)>> {
    text.split(',').map(parse_range).collect()
}

/// Catch-all client exporting every configured path read-only
fn add_default_client(table: &mut ExportTable, defaults: ExportDefaults) {
    let paths: Vec<PathBuf> = table.exports().iter().map(|e| e.path.clone()).collect();
    let client = table.get_or_add_client("<default>", ClientKind::Default, Vec::new());
    for path in paths {
        let mut options = MountOptions::new(defaults.cross_mounts);
        options.read_only = true;
        options.squash = Squash::Root;
        table.add_mount(client, &path, options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoNetgroups;
    use crate::auth::ugid::{IdKind, Mapped};
    use std::io::Write;
    use std::net::IpAddr;

    fn resolve(host: &str) -> Vec<Ipv4Addr> {
        match host {
            "alpha" => vec![Ipv4Addr::new(10, 0, 0, 5)],
            _ => Vec::new(),
        }
    }

    fn parse(text: &str) -> ExportTable {
        parse_exports(text, ExportDefaults::default(), Arc::new(NoNetgroups), resolve).unwrap()
    }

    fn peer(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_host_forms() {
        let mut t = parse(
            "# comment\n\
             /srv/a alpha(rw,no_root_squash) 10.1.0.0/16(ro) 10.2.0.0/255.255.0.0 @trusted\n\
             /srv/b *(ro,all_squash)\n",
        );

        let c = t.match_client(peer(10, 0, 0, 5)).unwrap();
        assert_eq!(t.client(c).kind, ClientKind::Exact);
        let (_, m) = t.mounts_of(c).next().unwrap();
        assert_eq!(m.options.squash, Squash::None);
        assert!(!m.options.read_only);

        let c = t.match_client(peer(10, 1, 200, 3)).unwrap();
        let (_, m) = t.mounts_of(c).find(|(_, m)| m.path == Path::new("/srv/a")).unwrap();
        assert!(m.options.read_only);

        assert!(t.match_client(peer(10, 2, 1, 1)).is_some());

        let c = t.match_client(peer(192, 168, 1, 1)).unwrap();
        let paths: Vec<_> = t.mounts_of(c).map(|(_, m)| m.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/srv/b")]);
    }

    #[test]
    fn test_defaults() {
        let mut t = parse("/srv\n");
        let c = t.match_client(peer(1, 2, 3, 4)).unwrap();
        let (_, m) = t.mounts_of(c).next().unwrap();
        assert!(!m.options.read_only);
        assert!(m.options.secure_port);
        assert_eq!(m.options.squash, Squash::Root);
        assert_eq!(m.options.uid_map, UidMapMode::Identity);
        assert_eq!(m.options.nobody_uid, 65534);
        assert!(!m.options.link_relative);
        assert!(m.options.cross_mounts);
    }

    #[test]
    fn test_continuation_and_options() {
        let mut t = parse(
            "/srv/x \\\n   alpha(insecure,link_relative,anonuid=99,anongid=98,nocrossmnt,noaccess,bogus)\n",
        );
        let c = t.match_client(peer(10, 0, 0, 5)).unwrap();
        let (_, m) = t.mounts_of(c).next().unwrap();
        assert!(!m.options.secure_port);
        assert!(m.options.link_relative);
        assert!(m.options.no_access);
        assert!(!m.options.cross_mounts);
        assert_eq!((m.options.nobody_uid, m.options.nobody_gid), (99, 98));
    }

    #[test]
    fn test_squash_ranges_imply_static_map() {
        let mut t = parse("/srv alpha(squash_uids=0-15,20-25,squash_gids=0,ro)\n");
        let c = t.match_client(peer(10, 0, 0, 5)).unwrap();
        let (_, m) = t.mounts_of(c).next().unwrap();
        assert!(m.options.read_only);
        assert_eq!(m.options.uid_map, UidMapMode::Static);
        let map = m.options.static_map.as_ref().unwrap();
        assert_eq!(map.forward(IdKind::User, 22), Some(Mapped::Squash));
        assert_eq!(map.forward(IdKind::User, 17), None);
        assert_eq!(map.forward(IdKind::Group, 0), Some(Mapped::Squash));
    }

    #[test]
    fn test_map_static_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "uid 1000-1999 5000").unwrap();
        let text = format!("/srv alpha(map_static={})\n", file.path().display());
        let mut t = parse(&text);
        let c = t.match_client(peer(10, 0, 0, 5)).unwrap();
        let (_, m) = t.mounts_of(c).next().unwrap();
        let map = m.options.static_map.as_ref().unwrap();
        assert_eq!(map.forward(IdKind::User, 1001), Some(Mapped::To(5001)));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_exports(
            "/srv *\n/srv/b 10.0.0.0/99\n",
            ExportDefaults::default(),
            Arc::new(NoNetgroups),
            resolve,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));

        assert!(
            parse_exports("relative *\n", ExportDefaults::default(), Arc::new(NoNetgroups), resolve)
                .is_err()
        );
        assert!(
            parse_exports("/srv *(ro\n", ExportDefaults::default(), Arc::new(NoNetgroups), resolve)
                .is_err()
        );
    }

    #[test]
    fn test_unknown_host_skipped() {
        let mut t = parse("/srv nosuchhost(rw)\n");
        assert!(t.match_client(peer(10, 0, 0, 5)).is_none());
    }

    #[test]
    fn test_promiscuous_default_client() {
        let defaults = ExportDefaults {
            cross_mounts: true,
            promiscuous: true,
        };
        let mut t = parse_exports("/srv/a alpha(rw)\n/srv/b alpha(rw)\n", defaults, Arc::new(NoNetgroups), resolve)
            .unwrap();
        let c = t.match_client(peer(172, 16, 0, 1)).unwrap();
        let mounts: Vec<_> = t.mounts_of(c).map(|(_, m)| m.clone()).collect();
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().all(|m| m.options.read_only && m.options.squash == Squash::Root));
    }

    #[test]
    fn test_export_listing() {
        let t = parse("/srv/a alpha 10.0.0.0/8\n/srv/b *\n/srv/a @g\n");
        let exports = t.exports();
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].groups, vec!["alpha", "10.0.0.0/8", "@g"]);
        assert!(exports[1].world);
        assert!(exports[1].groups.is_empty());
    }

    #[test]
    fn test_nested_exports_linked() {
        let t = parse("/srv alpha\n/srv/inner alpha(ro)\n");
        let (c, _) = t.clients().next().unwrap();
        let (inner, m) = t.mounts_of(c).next().unwrap();
        assert_eq!(m.path, PathBuf::from("/srv/inner"));
        let parent = t.mount(inner).parent.unwrap();
        assert_eq!(t.mount(parent).path, PathBuf::from("/srv"));
    }
}
