//! The configuration tree
//!
//! See the crate docs for the model. Paths are dot-separated (`a.b.c`);
//! link targets are slash-separated relative paths (`../../a/b`) so that
//! `..` hops stay unambiguous.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use wirelink_core::value;

use crate::error::{Error, Result};

/// Maximum number of link hops a single operation may follow before it is
/// reported as a link cycle.
pub const LINK_DEPTH_LIMIT: usize = 16;

type ValueCallback = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone, Default)]
enum Value {
    #[default]
    Empty,
    Str(String),
    Callback(ValueCallback),
    Link(Link),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
    up: usize,
    down: Vec<String>,
}

#[derive(Default)]
struct Inner {
    value: Value,
    kids: BTreeMap<String, Arc<Node>>,
    parent: Weak<Node>,
}

#[derive(Default)]
struct Node {
    inner: RwLock<Inner>,
}

impl Node {
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to a configuration subtree.
#[derive(Clone)]
pub struct Config {
    node: Arc<Node>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.browse_values("**").unwrap_or_default();
        f.debug_map().entries(values).finish()
    }
}

/// Absolute path of a node, dot-separated, empty string for a root.
fn path_of(node: &Arc<Node>) -> String {
    let mut segments = Vec::new();
    let mut cur = node.clone();
    loop {
        let parent = match cur.read().parent.upgrade() {
            Some(p) => p,
            None => break,
        };
        let guard = parent.read();
        if let Some((k, _)) = guard
            .kids
            .iter()
            .find(|(_, v)| Arc::ptr_eq(v, &cur))
        {
            segments.push(k.clone());
        }
        drop(guard);
        cur = parent;
    }
    segments.reverse();
    segments.join(".")
}

/// Follow links until a non-link node is reached.
///
/// Returns `Ok(None)` when the link points outside the tree (dangling);
/// errors when `hops` exceeds [`LINK_DEPTH_LIMIT`].
fn resolve(node: &Arc<Node>, hops: &mut usize) -> Result<Option<Arc<Node>>> {
    let mut cur = node.clone();
    loop {
        let link = match &cur.read().value {
            Value::Link(l) => Some(l.clone()),
            _ => None,
        };
        let link = match link {
            Some(l) => l,
            None => return Ok(Some(cur)),
        };
        *hops += 1;
        if *hops > LINK_DEPTH_LIMIT {
            return Err(Error::LinkCycle(path_of(node)));
        }
        let mut target = cur.clone();
        for _ in 0..link.up {
            let parent = target.read().parent.upgrade();
            match parent {
                Some(p) => target = p,
                None => return Ok(None),
            }
        }
        match walk(&target, link.down.iter().map(|s| s.as_str()), hops)? {
            Some(n) => cur = n,
            None => return Ok(None),
        }
    }
}

/// Walk `segments` down from `node`, resolving links at every step.
fn walk<'a>(
    node: &Arc<Node>,
    segments: impl Iterator<Item = &'a str>,
    hops: &mut usize,
) -> Result<Option<Arc<Node>>> {
    let mut cur = node.clone();
    for seg in segments {
        let resolved = match resolve(&cur, hops)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let kid = resolved.read().kids.get(seg).cloned();
        match kid {
            Some(k) => cur = k,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Walk down from `node`, creating empty intermediate nodes as needed.
fn find_create(node: &Arc<Node>, path: &str, hops: &mut usize) -> Result<Arc<Node>> {
    let mut cur = node.clone();
    for seg in split_path(path) {
        let resolved = match resolve(&cur, hops)? {
            Some(n) => n,
            None => return Err(Error::InvalidLink(path_of(&cur), "dangling link in path")),
        };
        let existing = resolved.read().kids.get(seg).cloned();
        cur = match existing {
            Some(k) => k,
            None => {
                let kid = Arc::new(Node::default());
                kid.write().parent = Arc::downgrade(&resolved);
                resolved.write().kids.insert(seg.to_string(), kid.clone());
                kid
            }
        };
    }
    Ok(cur)
}

fn deep_copy(src: &Arc<Node>, depth: usize) -> Result<Arc<Node>> {
    let mut value = src.read().value.clone();
    let mut kids_src = src.clone();
    let escapes = matches!(&value, Value::Link(l) if l.up > depth);
    if escapes {
        // The link escapes the copied subtree: snapshot what it resolves
        // to in the original tree.
        let mut hops = 0;
        match resolve(src, &mut hops)? {
            Some(t) => {
                value = t.read().value.clone();
                kids_src = t;
            }
            None => value = Value::Empty,
        }
    }
    let node = Arc::new(Node::default());
    node.write().value = value;
    let kids: Vec<(String, Arc<Node>)> = kids_src
        .read()
        .kids
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, kid) in kids {
        let copy = deep_copy(&kid, depth + 1)?;
        copy.write().parent = Arc::downgrade(&node);
        node.write().kids.insert(k, copy);
    }
    Ok(node)
}

fn merge_node(dst: &Arc<Node>, src: &Arc<Node>, overwrite: bool) -> Result<()> {
    let src_value = src.read().value.clone();
    if !matches!(src_value, Value::Empty) && overwrite {
        dst.write().value = src_value;
    }
    let src_kids: Vec<(String, Arc<Node>)> = src
        .read()
        .kids
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, src_kid) in src_kids {
        let existing = dst.read().kids.get(&k).cloned();
        match existing {
            Some(dst_kid) => merge_node(&dst_kid, &src_kid, overwrite)?,
            None => {
                let copy = deep_copy(&src_kid, 0)?;
                copy.write().parent = Arc::downgrade(dst);
                dst.write().kids.insert(k, copy);
            }
        }
    }
    Ok(())
}

impl Config {
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node::default()),
        }
    }

    /// Build a tree from a flat `k=v;k=v` properties string.
    pub fn from_props(props: &str) -> Result<Self> {
        let cfg = Self::new();
        cfg.load_props(props)?;
        Ok(cfg)
    }

    /// Import a flat `k=v;k=v` properties string into this tree.
    pub fn load_props(&self, props: &str) -> Result<()> {
        for tok in props.split(';').filter(|s| !s.is_empty()) {
            let (k, v) = tok
                .split_once('=')
                .ok_or(Error::InvalidProps(props.to_string(), "expected key=value"))?;
            self.set(k, v)?;
        }
        Ok(())
    }

    /// Value of this node itself (resolving a link-valued node).
    pub fn value(&self) -> Result<Option<String>> {
        let mut hops = 0;
        let node = match resolve(&self.node, &mut hops)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let guard = node.read();
        Ok(match &guard.value {
            Value::Empty | Value::Link(_) => None,
            Value::Str(s) => Some(s.clone()),
            Value::Callback(f) => {
                let f = f.clone();
                drop(guard);
                Some(f())
            }
        })
    }

    /// Read a value by dot-separated path; links are followed on the way.
    pub fn get(&self, path: &str) -> Result<Option<String>> {
        let mut hops = 0;
        match walk(&self.node, split_path(path), &mut hops)? {
            Some(n) => Config { node: n }.value(),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, path: &str, default: bool) -> Result<bool> {
        match self.get(path)? {
            Some(s) => Ok(value::parse_bool(&s)?),
            None => Ok(default),
        }
    }

    pub fn get_size(&self, path: &str, default: u64) -> Result<u64> {
        match self.get(path)? {
            Some(s) => Ok(value::parse_size(&s)?),
            None => Ok(default),
        }
    }

    pub fn get_i64(&self, path: &str, default: i64) -> Result<i64> {
        match self.get(path)? {
            Some(s) => s
                .parse()
                .map_err(|_| wirelink_core::Error::invalid_value("integer", s).into()),
            None => Ok(default),
        }
    }

    pub fn get_duration(&self, path: &str, default: Duration) -> Result<Duration> {
        match self.get(path)? {
            Some(s) => Ok(value::parse_duration(&s)?),
            None => Ok(default),
        }
    }

    /// Set a string value, creating missing intermediate nodes.
    pub fn set(&self, path: &str, value: &str) -> Result<()> {
        let mut hops = 0;
        let node = find_create(&self.node, path, &mut hops)?;
        node.write().value = Value::Str(value.to_string());
        Ok(())
    }

    /// Set a callback value recomputed on every read.
    pub fn set_callback(
        &self,
        path: &str,
        f: impl Fn() -> String + Send + Sync + 'static,
    ) -> Result<()> {
        let mut hops = 0;
        let node = find_create(&self.node, path, &mut hops)?;
        node.write().value = Value::Callback(Arc::new(f));
        Ok(())
    }

    /// Set a symbolic link. Targets are slash-separated; relative targets
    /// must ascend first (`../peer`), absolute targets (`/a/b`) are
    /// normalized to relative form against the link node's own position.
    pub fn set_link(&self, path: &str, target: &str) -> Result<()> {
        let mut hops = 0;
        let node = find_create(&self.node, path, &mut hops)?;
        let link = if let Some(abs) = target.strip_prefix('/') {
            let depth = {
                let own = path_of(&node);
                if own.is_empty() {
                    return Err(Error::InvalidLink(target.to_string(), "link on root node"));
                }
                own.split('.').count()
            };
            let down: Vec<String> = abs
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
            if down.is_empty() {
                return Err(Error::InvalidLink(target.to_string(), "empty link"));
            }
            if down.iter().any(|s| s == "..") {
                return Err(Error::InvalidLink(target.to_string(), "'..' in absolute link"));
            }
            Link { up: depth, down }
        } else {
            let mut up = 0;
            let mut down = Vec::new();
            for seg in target.split('/').filter(|s| !s.is_empty()) {
                if seg == ".." {
                    if !down.is_empty() {
                        return Err(Error::InvalidLink(
                            target.to_string(),
                            "'..' after named segment",
                        ));
                    }
                    up += 1;
                } else {
                    down.push(seg.to_string());
                }
            }
            if up == 0 {
                return Err(Error::InvalidLink(
                    target.to_string(),
                    "link must ascend (start with '..')",
                ));
            }
            Link { up, down }
        };
        node.write().value = Value::Link(link);
        Ok(())
    }

    /// Publish a subtree at `path`. Fails if the key already exists.
    pub fn set_config(&self, path: &str, cfg: &Config) -> Result<()> {
        let (dir, base) = match path.rsplit_once('.') {
            Some((d, b)) => (d, b),
            None => ("", path),
        };
        if base.is_empty() {
            return Err(Error::InvalidProps(path.to_string(), "empty key"));
        }
        let mut hops = 0;
        let parent = find_create(&self.node, dir, &mut hops)?;
        {
            let guard = parent.read();
            if guard.kids.contains_key(base) {
                return Err(Error::KeyExists(path.to_string()));
            }
        }
        cfg.node.write().parent = Arc::downgrade(&parent);
        parent.write().kids.insert(base.to_string(), cfg.node.clone());
        Ok(())
    }

    /// Detach and return the subtree at `path`.
    pub fn remove(&self, path: &str) -> Option<Config> {
        let (dir, base) = match path.rsplit_once('.') {
            Some((d, b)) => (d, b),
            None => ("", path),
        };
        let mut hops = 0;
        let parent = walk(&self.node, split_path(dir), &mut hops).ok()??;
        let node = parent.write().kids.remove(base)?;
        node.write().parent = Weak::new();
        Some(Config { node })
    }

    /// Subtree at `path`, creating empty nodes as needed.
    pub fn sub_create(&self, path: &str) -> Result<Config> {
        let mut hops = 0;
        Ok(Config {
            node: find_create(&self.node, path, &mut hops)?,
        })
    }

    /// Subtree at `path`, or None when absent.
    pub fn sub(&self, path: &str) -> Option<Config> {
        let mut hops = 0;
        walk(&self.node, split_path(path), &mut hops)
            .ok()
            .flatten()
            .map(|node| Config { node })
    }

    /// Deep copy. Links escaping the copied subtree are snapshotted to the
    /// value they currently resolve to.
    pub fn copy(&self) -> Result<Config> {
        Ok(Config {
            node: deep_copy(&self.node, 0)?,
        })
    }

    /// Recursive merge; `other` values win iff `overwrite`.
    pub fn merge(&self, other: &Config, overwrite: bool) -> Result<()> {
        merge_node(&self.node, &other.node, overwrite)
    }

    /// Direct children, in key order.
    pub fn list(&self) -> Vec<(String, Config)> {
        self.node
            .read()
            .kids
            .iter()
            .map(|(k, v)| (k.clone(), Config { node: v.clone() }))
            .collect()
    }

    /// Browse nodes matched by a dot-separated glob mask.
    ///
    /// `*` matches one segment, `**` any number (at most one per mask).
    /// Links are followed during traversal. Delivery is pre-order and
    /// stable (lexicographic). The callback returns `false` to stop.
    pub fn browse(
        &self,
        mask: &str,
        mut cb: impl FnMut(&str, &Config) -> bool,
    ) -> Result<()> {
        let mv: Vec<&str> = split_path(mask).collect();
        if mv.iter().filter(|s| **s == "**").count() > 1 {
            return Err(Error::InvalidMask(mask.to_string()));
        }
        // Walk the leading literal segments directly.
        let mut node = self.node.clone();
        let mut prefix = String::new();
        let mut start = 0;
        for (i, seg) in mv.iter().enumerate() {
            if *seg == "*" || *seg == "**" {
                start = i;
                break;
            }
            let mut hops = 0;
            let resolved = match resolve(&node, &mut hops)? {
                Some(n) => n,
                None => return Ok(()),
            };
            let kid = resolved.read().kids.get(*seg).cloned();
            match kid {
                Some(k) => {
                    prefix.push_str(seg);
                    prefix.push('.');
                    node = k;
                }
                None => return Ok(()),
            }
            start = i + 1;
        }
        if start >= mv.len() {
            if !mv.is_empty() {
                let path = prefix.trim_end_matches('.').to_string();
                cb(&path, &Config { node });
            }
            return Ok(());
        }
        let mut hops = 0;
        let node = match resolve(&node, &mut hops)? {
            Some(n) => n,
            None => return Ok(()),
        };
        browse_rec(&node, &mv, start, &prefix, &mut cb)?;
        Ok(())
    }

    /// Collect every non-empty value matched by `mask`, in browse order.
    pub fn browse_values(&self, mask: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut err = None;
        self.browse(mask, |path, cfg| {
            match cfg.value() {
                Ok(Some(v)) => out.push((path.to_string(), v)),
                Ok(None) => {}
                Err(e) => {
                    err = Some(e);
                    return false;
                }
            }
            true
        })?;
        match err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    pub fn ptr_eq(&self, other: &Config) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

fn browse_rec(
    node: &Arc<Node>,
    mask: &[&str],
    mi: usize,
    prefix: &str,
    cb: &mut impl FnMut(&str, &Config) -> bool,
) -> Result<bool> {
    if mi >= mask.len() {
        return Ok(true);
    }
    let m = mask[mi];
    if m == "*" || m == "**" {
        let filler = m == "**";
        let kids: Vec<(String, Arc<Node>)> = node
            .read()
            .kids
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, kid) in kids {
            let mut hops = 0;
            let kid = match resolve(&kid, &mut hops)? {
                Some(n) => n,
                None => continue,
            };
            let path = format!("{}{}", prefix, k);
            if mi + 1 == mask.len() {
                if !cb(&path, &Config { node: kid.clone() }) {
                    return Ok(false);
                }
            }
            let deeper = format!("{}.", path);
            if !browse_rec(&kid, mask, mi + 1, &deeper, cb)? {
                return Ok(false);
            }
            if filler && !browse_rec(&kid, mask, mi, &deeper, cb)? {
                return Ok(false);
            }
        }
    } else {
        let kid = node.read().kids.get(m).cloned();
        let kid = match kid {
            Some(k) => k,
            None => return Ok(true),
        };
        let path = format!("{}{}", prefix, m);
        if mi + 1 == mask.len() {
            return Ok(cb(&path, &Config { node: kid }));
        }
        let mut hops = 0;
        let kid = match resolve(&kid, &mut hops)? {
            Some(n) => n,
            None => return Ok(true),
        };
        return browse_rec(&kid, mask, mi + 1, &format!("{}.", path), cb);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let cfg = Config::new();
        cfg.set("a.b.c", "value").unwrap();
        assert_eq!(cfg.get("a.b.c").unwrap().as_deref(), Some("value"));
        assert_eq!(cfg.get("a.b").unwrap(), None);
        assert_eq!(cfg.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let cfg = Config::new();
        cfg.set("k", "1").unwrap();
        cfg.set("k", "2").unwrap();
        assert_eq!(cfg.get("k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_callback_recomputed_each_read() {
        use std::sync::atomic::{AtomicI64, Ordering};
        let cfg = Config::new();
        let seq = Arc::new(AtomicI64::new(-1));
        let seq2 = seq.clone();
        cfg.set_callback("info.seq", move || seq2.load(Ordering::Relaxed).to_string())
            .unwrap();
        assert_eq!(cfg.get("info.seq").unwrap().as_deref(), Some("-1"));
        seq.store(42, Ordering::Relaxed);
        assert_eq!(cfg.get("info.seq").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_link_followed_on_get() {
        let cfg = Config::new();
        cfg.set("real.value", "here").unwrap();
        cfg.set_link("alias", "../real").unwrap();
        assert_eq!(cfg.get("alias.value").unwrap().as_deref(), Some("here"));
    }

    #[test]
    fn test_absolute_link_normalized() {
        let cfg = Config::new();
        cfg.set("a.b", "deep").unwrap();
        cfg.set_link("x.y.z", "/a").unwrap();
        assert_eq!(cfg.get("x.y.z.b").unwrap().as_deref(), Some("deep"));
    }

    #[test]
    fn test_link_must_ascend() {
        let cfg = Config::new();
        cfg.set("a.b", "v").unwrap();
        assert!(cfg.set_link("l", "a/b").is_err());
        assert!(cfg.set_link("l", "").is_err());
        assert!(cfg.set_link("l", "../a/../b").is_err());
    }

    #[test]
    fn test_link_cycle_detected() {
        let cfg = Config::new();
        cfg.set_link("a", "../b").unwrap();
        cfg.set_link("b", "../a").unwrap();
        match cfg.get("a") {
            Err(Error::LinkCycle(_)) => {}
            other => panic!("expected link cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_link_chain_within_limit() {
        let cfg = Config::new();
        cfg.set("end", "v").unwrap();
        cfg.set_link("l0", "../end").unwrap();
        for i in 1..10 {
            cfg.set_link(&format!("l{}", i), &format!("../l{}", i - 1))
                .unwrap();
        }
        assert_eq!(cfg.get("l9").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_dangling_link_reads_as_absent() {
        let cfg = Config::new();
        cfg.set_link("l", "../no/such/node").unwrap();
        assert_eq!(cfg.get("l").unwrap(), None);
    }

    #[test]
    fn test_browse_double_star_visits_all_values() {
        let cfg = Config::new();
        cfg.set("a.b", "1").unwrap();
        cfg.set("a.c", "2").unwrap();
        cfg.set("x.y.z", "3").unwrap();
        let values = cfg.browse_values("**").unwrap();
        assert_eq!(
            values,
            vec![
                ("a.b".to_string(), "1".to_string()),
                ("a.c".to_string(), "2".to_string()),
                ("x.y.z".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_browse_single_star_is_one_segment() {
        let cfg = Config::new();
        cfg.set("a.b", "1").unwrap();
        cfg.set("a.c.d", "2").unwrap();
        let values = cfg.browse_values("a.*").unwrap();
        assert_eq!(values, vec![("a.b".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_browse_literal_prefix() {
        let cfg = Config::new();
        cfg.set("a.b.c", "1").unwrap();
        cfg.set("z.b.c", "2").unwrap();
        let values = cfg.browse_values("a.**").unwrap();
        assert_eq!(values, vec![("a.b.c".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_browse_rejects_two_double_stars() {
        let cfg = Config::new();
        assert!(matches!(
            cfg.browse("**.x.**", |_, _| true),
            Err(Error::InvalidMask(_))
        ));
    }

    #[test]
    fn test_browse_callback_stops_traversal() {
        let cfg = Config::new();
        cfg.set("a", "1").unwrap();
        cfg.set("b", "2").unwrap();
        cfg.set("c", "3").unwrap();
        let mut seen = Vec::new();
        cfg.browse("**", |path, _| {
            seen.push(path.to_string());
            seen.len() < 2
        })
        .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_browse_follows_links() {
        let cfg = Config::new();
        cfg.set("real.k", "v").unwrap();
        cfg.set_link("alias", "../real").unwrap();
        let values = cfg.browse_values("alias.*").unwrap();
        assert_eq!(values, vec![("alias.k".to_string(), "v".to_string())]);
    }

    #[test]
    fn test_merge_without_overwrite() {
        let dst = Config::new();
        dst.set("a", "old").unwrap();
        let src = Config::new();
        src.set("a", "new").unwrap();
        src.set("b", "added").unwrap();
        dst.merge(&src, false).unwrap();
        assert_eq!(dst.get("a").unwrap().as_deref(), Some("old"));
        assert_eq!(dst.get("b").unwrap().as_deref(), Some("added"));
    }

    #[test]
    fn test_merge_with_overwrite() {
        let dst = Config::new();
        dst.set("a", "old").unwrap();
        let src = Config::new();
        src.set("a", "new").unwrap();
        dst.merge(&src, true).unwrap();
        assert_eq!(dst.get("a").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_merge_recurses() {
        let dst = Config::new();
        dst.set("sub.keep", "1").unwrap();
        let src = Config::new();
        src.set("sub.add", "2").unwrap();
        dst.merge(&src, false).unwrap();
        assert_eq!(dst.get("sub.keep").unwrap().as_deref(), Some("1"));
        assert_eq!(dst.get("sub.add").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_set_config_publishes_shared_subtree() {
        let root = Config::new();
        let sub = Config::new();
        sub.set("k", "v").unwrap();
        root.set_config("child", &sub).unwrap();
        assert_eq!(root.get("child.k").unwrap().as_deref(), Some("v"));
        // Shared: writes through the subtree handle are visible.
        sub.set("k2", "v2").unwrap();
        assert_eq!(root.get("child.k2").unwrap().as_deref(), Some("v2"));
        // Second publish at the same key is rejected.
        assert!(matches!(
            root.set_config("child", &Config::new()),
            Err(Error::KeyExists(_))
        ));
    }

    #[test]
    fn test_remove_detaches() {
        let cfg = Config::new();
        cfg.set("a.b", "v").unwrap();
        let removed = cfg.remove("a").unwrap();
        assert_eq!(cfg.get("a.b").unwrap(), None);
        assert_eq!(removed.get("b").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_copy_is_independent() {
        let cfg = Config::new();
        cfg.set("a.b", "1").unwrap();
        let copy = cfg.copy().unwrap();
        cfg.set("a.b", "2").unwrap();
        assert_eq!(copy.get("a.b").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_copy_snapshots_escaping_links() {
        let root = Config::new();
        root.set("target", "outside").unwrap();
        root.set_link("sub.l", "../../target").unwrap();
        let copy = root.sub("sub").unwrap().copy().unwrap();
        assert_eq!(copy.get("l").unwrap().as_deref(), Some("outside"));
    }

    #[test]
    fn test_load_props() {
        let cfg = Config::from_props("a=1;b.c=2;d=x=y").unwrap();
        assert_eq!(cfg.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(cfg.get("b.c").unwrap().as_deref(), Some("2"));
        assert_eq!(cfg.get("d").unwrap().as_deref(), Some("x=y"));
        assert!(Config::from_props("novalue").is_err());
    }

    #[test]
    fn test_typed_getters() {
        let cfg = Config::from_props("flag=yes;size=1kb;num=-5").unwrap();
        assert!(cfg.get_bool("flag", false).unwrap());
        assert!(!cfg.get_bool("missing", false).unwrap());
        assert_eq!(cfg.get_size("size", 0).unwrap(), 1024);
        assert_eq!(cfg.get_i64("num", 0).unwrap(), -5);
        assert_eq!(cfg.get_i64("missing", 7).unwrap(), 7);
        assert!(cfg.get_bool("size", false).is_err());
    }
}
