//! `blocks://path` - named block index
//!
//! A small persistent channel mapping symbolic block names to sequence
//! numbers, kept alongside a stream server's storage. The writer mirrors
//! the data stream: every Data post advances its idea of the last seq
//! (nothing touches disk), and a `Block{name}` control message durably
//! records "a block named *name* begins at the next message". The durable
//! state is only the block entries, which is why a restarted server
//! replays the storage tail through the writer to bring its counter back
//! in line (see the stream server's open sequence).
//!
//! A reader instance is a name resolver: opened with `block=<name>` it
//! looks up the most recent entry with that name, publishes
//! `info.seq = begin - 1` and closes itself.
//!
//! Entries are JSON lines: `{"seq":73,"name":"day:2024-01-02"}`.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wirelink_channel::error::{Error, Result};
use wirelink_channel::{Base, Channel, ChannelImpl};
use wirelink_config::{Config, Url};
use wirelink_core::{Msg, MsgType, State};

use crate::scheme;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    seq: i64,
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Read,
    Write,
}

pub struct Blocks {
    filename: PathBuf,
    dir: Dir,
    file: Option<fs::File>,
    entries: Vec<Entry>,
    seq: Arc<AtomicI64>,
}

impl Default for Blocks {
    fn default() -> Self {
        Self {
            filename: PathBuf::new(),
            dir: Dir::Read,
            file: None,
            entries: Vec::new(),
            seq: Arc::new(AtomicI64::new(-1)),
        }
    }
}

impl Blocks {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::<Blocks>::default()
    }

    fn load(&mut self) -> Result<()> {
        self.entries.clear();
        let file = match fs::File::open(&self.filename) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: Entry = serde_json::from_str(&line)
                .map_err(|e| Error::corrupt(format!("bad block entry '{}': {}", line, e)))?;
            self.entries.push(entry);
        }
        Ok(())
    }
}

impl ChannelImpl for Blocks {
    fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&Channel>) -> Result<()> {
        let host = url.host();
        if host.is_empty() {
            return Err(Error::failed("blocks channel needs a filename"));
        }
        self.filename = PathBuf::from(host);
        self.dir = match url.get("dir").as_deref() {
            None | Some("r") => Dir::Read,
            Some("w") => Dir::Write,
            Some(other) => {
                return Err(Error::failed(format!("invalid dir '{}', expected r or w", other)))
            }
        };
        let seq = self.seq.clone();
        base.config_info()
            .set_callback("seq", move || seq.load(Ordering::Relaxed).to_string())?;
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        self.load()?;
        match self.dir {
            Dir::Write => {
                // Durable knowledge ends one message before the newest
                // block boundary; the owner replays the tail to catch up.
                let last = self.entries.last().map(|e| e.seq - 1).unwrap_or(-1);
                self.seq.store(last, Ordering::Relaxed);
                self.file = Some(
                    fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&self.filename)?,
                );
                tracing::info!(
                    channel = %base.name(),
                    file = %self.filename.display(),
                    entries = self.entries.len(),
                    seq = last,
                    "block index opened"
                );
            }
            Dir::Read => {
                let name = params
                    .get("block")?
                    .ok_or_else(|| Error::failed("reader needs a 'block' parameter"))?;
                let entry = self
                    .entries
                    .iter()
                    .rev()
                    .find(|e| e.name == name)
                    .ok_or_else(|| Error::failed(format!("unknown block: '{}'", name)))?;
                self.seq.store(entry.seq - 1, Ordering::Relaxed);
                tracing::debug!(
                    channel = %base.name(),
                    block = %name,
                    seq = entry.seq,
                    "block resolved"
                );
                // Resolution is the whole job: report the seq and close.
                base.set_state(State::Active)?;
                base.set_state(State::Closing)?;
                base.set_state(State::Closed)?;
            }
        }
        Ok(())
    }

    fn close(&mut self, _base: &mut Base, _force: bool) -> Result<()> {
        if let Some(f) = &self.file {
            let _ = f.sync_data();
        }
        self.file = None;
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if self.dir != Dir::Write {
            return Err(Error::failed("post on read-only blocks channel"));
        }
        match msg.msg_type {
            MsgType::Data => {
                self.seq.store(msg.seq, Ordering::Relaxed);
                Ok(())
            }
            MsgType::Control if msg.msgid == scheme::BLOCK => {
                let block = scheme::Block::decode(&msg.data)?;
                let entry = Entry {
                    seq: self.seq.load(Ordering::Relaxed) + 1,
                    name: block.name,
                };
                let file = self
                    .file
                    .as_mut()
                    .ok_or_else(|| Error::failed("blocks file is not open"))?;
                let line = serde_json::to_string(&entry)
                    .map_err(|e| Error::failed(format!("failed to encode block entry: {}", e)))?;
                writeln!(file, "{}", line)?;
                file.sync_data()?;
                tracing::info!(
                    channel = %base.name(),
                    name = %entry.name,
                    seq = entry.seq,
                    "block created"
                );
                self.entries.push(entry);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;
    use wirelink_channel::Context;

    use super::*;

    fn ctx() -> Context {
        let ctx = Context::new();
        crate::register(&ctx);
        ctx
    }

    #[test]
    fn test_writer_tracks_seq_and_records_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.idx").display().to_string();
        let ctx = ctx();
        let w = ctx
            .channel(&format!("blocks://{};name=bw;dir=w", path))
            .unwrap();
        w.open(&Config::new()).unwrap();
        assert_eq!(w.config().get("info.seq").unwrap().as_deref(), Some("-1"));

        for seq in 1..=72 {
            w.post(&Msg::data(0, seq, Bytes::new())).unwrap();
        }
        let block = scheme::Block {
            name: "day:2024-01-02".into(),
        };
        w.post(
            &Msg::control(scheme::BLOCK).with_data(block.encode()),
        )
        .unwrap();
        w.post(&Msg::data(0, 73, Bytes::new())).unwrap();
        assert_eq!(w.config().get("info.seq").unwrap().as_deref(), Some("73"));
        w.close(false);

        // Reopen: durable knowledge is the entry boundary minus one.
        let w2 = ctx
            .channel(&format!("blocks://{};name=bw2;dir=w", path))
            .unwrap();
        w2.open(&Config::new()).unwrap();
        assert_eq!(w2.config().get("info.seq").unwrap().as_deref(), Some("72"));
    }

    #[test]
    fn test_reader_resolves_block_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.idx").display().to_string();
        let ctx = ctx();
        let w = ctx
            .channel(&format!("blocks://{};name=bw3;dir=w", path))
            .unwrap();
        w.open(&Config::new()).unwrap();
        for seq in 1..=72 {
            w.post(&Msg::data(0, seq, Bytes::new())).unwrap();
        }
        let block = scheme::Block {
            name: "day:2024-01-02".into(),
        };
        w.post(&Msg::control(scheme::BLOCK).with_data(block.encode()))
            .unwrap();
        w.close(false);

        let r = ctx
            .channel(&format!("blocks://{};name=br;dir=r", path))
            .unwrap();
        r.open_props("block=day:2024-01-02").unwrap();
        // Translation only: the reader reports and closes.
        assert_eq!(r.config().get("info.seq").unwrap().as_deref(), Some("72"));
        assert_eq!(r.state(), State::Closed);
    }

    #[test]
    fn test_reader_unknown_block_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.idx").display().to_string();
        let ctx = ctx();
        let w = ctx
            .channel(&format!("blocks://{};name=bw4;dir=w", path))
            .unwrap();
        w.open(&Config::new()).unwrap();
        w.close(false);

        let r = ctx
            .channel(&format!("blocks://{};name=br2;dir=r", path))
            .unwrap();
        assert!(r.open_props("block=nope").is_err());
        assert_eq!(r.state(), State::Error);
    }

    #[test]
    fn test_same_name_resolves_to_latest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.idx").display().to_string();
        let ctx = ctx();
        let w = ctx
            .channel(&format!("blocks://{};name=bw5;dir=w", path))
            .unwrap();
        w.open(&Config::new()).unwrap();
        let block = scheme::Block { name: "latest".into() };
        w.post(&Msg::data(0, 10, Bytes::new())).unwrap();
        w.post(&Msg::control(scheme::BLOCK).with_data(block.encode()))
            .unwrap();
        w.post(&Msg::data(0, 20, Bytes::new())).unwrap();
        w.post(&Msg::control(scheme::BLOCK).with_data(block.encode()))
            .unwrap();
        w.close(false);

        let r = ctx
            .channel(&format!("blocks://{};name=br3;dir=r", path))
            .unwrap();
        r.open_props("block=latest").unwrap();
        assert_eq!(r.config().get("info.seq").unwrap().as_deref(), Some("20"));
    }
}
