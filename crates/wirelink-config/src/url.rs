//! Channel URLs
//!
//! `<proto>[+<proto>]*://host[;k=v]*[?k=v[;k=v]*]` - the wiring language of
//! the library. The protocol part may chain prefixes (`busywait+tcp`), the
//! host part is transport specific (address, filename, or empty), and the
//! parameters populate the channel's init config.
//!
//! A [`Url`] is a view over a [`Config`]: the protocol and host live at the
//! reserved keys `wirelink.proto` / `wirelink.host`, everything else is a
//! plain parameter, so sub-URLs (`storage=file:///tmp/log`) are ordinary
//! string params parsed on demand.

use std::fmt;

use crate::error::{Error, Result};
use crate::tree::Config;

pub const KEY_PROTO: &str = "wirelink.proto";
pub const KEY_HOST: &str = "wirelink.host";
pub const KEY_USER: &str = "wirelink.user";
/// Marks channels created by a composite for its own use.
pub const KEY_INTERNAL: &str = "wirelink.internal";

#[derive(Clone, Debug, Default)]
pub struct Url {
    cfg: Config,
}

impl Url {
    pub fn parse(s: &str) -> Result<Url> {
        let (proto, rest) = s
            .split_once("://")
            .ok_or(Error::InvalidUrl(s.to_string(), "missing '://'"))?;
        if proto.is_empty() {
            return Err(Error::InvalidUrl(s.to_string(), "empty protocol"));
        }
        let cfg = Config::new();
        cfg.set(KEY_PROTO, proto)?;
        // Host runs to the first parameter separator; '?' and ';' both
        // introduce parameters.
        let (host, params) = match rest.find([';', '?']) {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        // An authority may carry a user part (`user@host`); path-shaped
        // hosts keep their '@'s.
        let host = match host.split_once('@') {
            Some((user, h)) if !user.contains('/') && !user.is_empty() => {
                cfg.set(KEY_USER, user)?;
                h
            }
            _ => host,
        };
        cfg.set(KEY_HOST, host)?;
        for tok in params.split([';', '?']).filter(|t| !t.is_empty()) {
            let (k, v) = tok
                .split_once('=')
                .ok_or(Error::InvalidUrl(s.to_string(), "parameter without '='"))?;
            if k == KEY_PROTO || k == KEY_HOST {
                return Err(Error::InvalidUrl(s.to_string(), "reserved parameter key"));
            }
            cfg.set(k, v)?;
        }
        Ok(Url { cfg })
    }

    pub fn from_config(cfg: Config) -> Url {
        Url { cfg }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Full protocol chain, e.g. `busywait+tcp`.
    pub fn proto(&self) -> String {
        self.cfg.get(KEY_PROTO).ok().flatten().unwrap_or_default()
    }

    pub fn host(&self) -> String {
        self.cfg.get(KEY_HOST).ok().flatten().unwrap_or_default()
    }

    pub fn user(&self) -> Option<String> {
        self.cfg.get(KEY_USER).ok().flatten()
    }

    pub fn set_proto(&self, proto: &str) -> Result<()> {
        self.cfg.set(KEY_PROTO, proto)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cfg.get(key).ok().flatten()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cfg.set(key, value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Split a `prefix+` head off the protocol chain: for
    /// `busywait+tcp://...` returns the prefix name (`busywait`) and a copy
    /// of this URL whose protocol is the remainder (`tcp`).
    pub fn split_prefix(&self) -> Result<Option<(String, Url)>> {
        let proto = self.proto();
        let (head, rest) = match proto.split_once('+') {
            Some(p) => p,
            None => return Ok(None),
        };
        if rest.is_empty() {
            return Err(Error::InvalidUrl(proto.clone(), "empty inner protocol"));
        }
        let inner = Url {
            cfg: self.cfg.copy()?,
        };
        inner.cfg.set(KEY_PROTO, rest)?;
        Ok(Some((head.to_string(), inner)))
    }

    /// Parse a string parameter as a nested URL (`storage=file:///path`).
    pub fn sub_url(&self, key: &str) -> Result<Option<Url>> {
        match self.get(key) {
            Some(s) => Ok(Some(Url::parse(&s)?)),
            None => Ok(None),
        }
    }

    pub fn copy(&self) -> Result<Url> {
        Ok(Url {
            cfg: self.cfg.copy()?,
        })
    }
}

impl fmt::Display for Url {
    /// Reassemble deterministically: parameters in key order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user() {
            Some(user) => write!(f, "{}://{}@{}", self.proto(), user, self.host())?,
            None => write!(f, "{}://{}", self.proto(), self.host())?,
        }
        let params = self.cfg.browse_values("**").unwrap_or_default();
        for (k, v) in params {
            if k == KEY_PROTO || k == KEY_HOST || k == KEY_USER {
                continue;
            }
            write!(f, ";{}={}", k, v)?;
        }
        Ok(())
    }
}
