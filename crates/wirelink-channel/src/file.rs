//! `file://path` - append-only block-indexed message log
//!
//! The storage backend of the stream server, and a standalone persistent
//! channel: a writer appends framed messages, a reader tails them back,
//! optionally starting from an arbitrary sequence number or block.
//!
//! ## On-disk layout
//!
//! The file is a sequence of fixed-size blocks (`block` parameter, default
//! 1mb, recorded in the file and authoritative from then on). Every record
//! is a frame:
//!
//! ```text
//! [ i32 frame_size ][ i32 msgid ][ i64 seq ][ payload ][ u8 0x80 ]
//! ```
//!
//! `frame_size` counts everything including itself and the tail byte. A
//! frame size of 0 marks the end of written data; a negative size tells
//! the reader to skip to the next block boundary.
//!
//! Block 0 starts with a Meta frame (msgid `1635018061`) describing the
//! file: block size, format version, compression (declared, `None` only),
//! an optional embedded scheme and free-form attributes. Every other block
//! starts with a Block marker frame (msgid `1801677890`) whose `seq` field
//! is the sequence number of the first data frame in that block - so a
//! reader can learn `block_seq[k]` with a single read at the block offset,
//! which is what makes seek-by-seq a binary search.
//!
//! ## Invariants
//!
//! - `seq` strictly increases across data frames.
//! - Writes only append; the file is truncated only when an open detects a
//!   torn tail (an interrupted write).
//! - Frames never span a block boundary: a frame that would cross is
//!   placed in the next block, after an end marker and a block marker.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use wirelink_config::{Config, Url};
use wirelink_core::{value, DCaps, Msg, MsgType, State};

use crate::chan::{Base, ChannelImpl, ProcessPolicy};
use crate::error::{Error, Result};

pub const META_MSGID: i32 = 1635018061;
pub const BLOCK_MSGID: i32 = 1801677890;

const FRAME_SIZE_LEN: usize = 4;
/// msgid + seq
const FRAME_HEADER_LEN: usize = 12;
const FRAME_TAIL: u8 = 0x80;
const FRAME_OVERHEAD: usize = FRAME_SIZE_LEN + FRAME_HEADER_LEN + 1;

const DEFAULT_BLOCK: u64 = 1024 * 1024;
const META_VERSION: u8 = 1;

fn frame_bytes(msgid: i32, seq: i64, payload: &[u8]) -> BytesMut {
    let size = (FRAME_OVERHEAD + payload.len()) as i32;
    let mut buf = BytesMut::with_capacity(size as usize);
    buf.put_i32_le(size);
    buf.put_i32_le(msgid);
    buf.put_i64_le(seq);
    buf.put_slice(payload);
    buf.put_u8(FRAME_TAIL);
    buf
}

/// File metadata, stored as the payload of the first frame.
///
/// Layout: u16 meta_size (= payload length), u8 version, u8 compression,
/// u32 block_size, u64 flags, then the scheme string and the attribute
/// list, both length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub version: u8,
    pub compression: Compression,
    pub block_size: u32,
    pub flags: u64,
    pub scheme: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
}

impl Meta {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0); // meta_size, fixed up below
        buf.put_u8(self.version);
        buf.put_u8(self.compression as u8);
        buf.put_u32_le(self.block_size);
        buf.put_u64_le(self.flags);
        buf.put_u32_le(self.scheme.len() as u32);
        buf.put_slice(self.scheme.as_bytes());
        buf.put_u32_le(self.attributes.len() as u32);
        for (k, v) in &self.attributes {
            buf.put_u16_le(k.len() as u16);
            buf.put_slice(k.as_bytes());
            buf.put_u16_le(v.len() as u16);
            buf.put_slice(v.as_bytes());
        }
        let size = buf.len() as u16;
        buf[0..2].copy_from_slice(&size.to_le_bytes());
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Meta> {
        if data.len() < 16 {
            return Err(Error::corrupt("meta payload too short"));
        }
        let meta_size = data.get_u16_le() as usize;
        if meta_size > data.remaining() + 2 {
            return Err(Error::corrupt("meta size exceeds payload"));
        }
        let version = data.get_u8();
        if version != META_VERSION {
            return Err(Error::failed(format!("unsupported file version: {}", version)));
        }
        let compression = data.get_u8();
        if compression != Compression::None as u8 {
            return Err(Error::failed(format!(
                "unsupported compression: {}",
                compression
            )));
        }
        let block_size = data.get_u32_le();
        let flags = data.get_u64_le();
        let take_string = |data: &mut &[u8], len: usize| -> Result<String> {
            if data.remaining() < len {
                return Err(Error::corrupt("truncated string in meta"));
            }
            let s = String::from_utf8(data[..len].to_vec())
                .map_err(|_| Error::corrupt("invalid utf-8 in meta"))?;
            data.advance(len);
            Ok(s)
        };
        if data.remaining() < 4 {
            return Err(Error::corrupt("truncated meta"));
        }
        let scheme_len = data.get_u32_le() as usize;
        let scheme = take_string(&mut data, scheme_len)?;
        if data.remaining() < 4 {
            return Err(Error::corrupt("truncated meta"));
        }
        let count = data.get_u32_le() as usize;
        let mut attributes = Vec::with_capacity(count);
        for _ in 0..count {
            if data.remaining() < 2 {
                return Err(Error::corrupt("truncated attribute"));
            }
            let klen = data.get_u16_le() as usize;
            let k = take_string(&mut data, klen)?;
            if data.remaining() < 2 {
                return Err(Error::corrupt("truncated attribute"));
            }
            let vlen = data.get_u16_le() as usize;
            let v = take_string(&mut data, vlen)?;
            attributes.push((k, v));
        }
        Ok(Meta {
            version,
            compression: Compression::None,
            block_size,
            flags,
            scheme,
            attributes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Read,
    Write,
}

pub struct File {
    filename: PathBuf,
    dir: Dir,
    block_size: u64,
    autoclose: bool,
    autoseq: bool,
    scheme: String,
    file: Option<fs::File>,
    /// Next read offset (reader) or next write offset (writer).
    offset: u64,
    /// End of the meta frame; data scanning in block 0 starts here.
    data_start: u64,
    /// Last written (writer) / delivered (reader) seq; -1 before any.
    seq: Arc<AtomicI64>,
    has_seq: bool,
}

impl Default for File {
    fn default() -> Self {
        Self {
            filename: PathBuf::new(),
            dir: Dir::Read,
            block_size: DEFAULT_BLOCK,
            autoclose: true,
            autoseq: false,
            scheme: String::new(),
            file: None,
            offset: 0,
            data_start: 0,
            seq: Arc::new(AtomicI64::new(-1)),
            has_seq: false,
        }
    }
}

impl File {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::new(File::default())
    }

    fn file(&self) -> Result<&fs::File> {
        self.file.as_ref().ok_or_else(|| Error::failed("file is not open"))
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn block_end(&self, offset: u64) -> u64 {
        offset - offset % self.block_size + self.block_size
    }

    /// Offset where data frames of block `k` start.
    fn block_data_start(&self, block: u64) -> u64 {
        if block == 0 {
            self.data_start
        } else {
            block * self.block_size
        }
    }

    fn read_frame_size(&self, offset: u64) -> Result<Option<i32>> {
        let mut buf = [0u8; FRAME_SIZE_LEN];
        match self.file()?.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(Some(i32::from_le_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the complete frame at `offset`. Returns (msgid, seq, payload).
    fn read_frame(&self, offset: u64, size: usize) -> Result<(i32, i64, Bytes)> {
        let mut buf = vec![0u8; size - FRAME_SIZE_LEN];
        self.file()?
            .read_exact_at(&mut buf, offset + FRAME_SIZE_LEN as u64)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::corrupt("truncated frame"),
                _ => Error::Io(e),
            })?;
        let mut head = &buf[..];
        let msgid = head.get_i32_le();
        let seq = head.get_i64_le();
        if buf[buf.len() - 1] != FRAME_TAIL {
            return Err(Error::corrupt(format!(
                "bad frame tail at offset {}",
                offset
            )));
        }
        let payload = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..buf.len() - 1]);
        Ok((msgid, seq, payload))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        Ok(self.file()?.write_all_at(data, offset)?)
    }

    fn read_meta(&mut self, base: &Base) -> Result<Meta> {
        let size = self
            .read_frame_size(0)?
            .ok_or_else(|| Error::corrupt("file too short for meta"))?;
        if size < FRAME_OVERHEAD as i32 {
            return Err(Error::corrupt("invalid meta frame size"));
        }
        let (msgid, _seq, payload) = self.read_frame(0, size as usize)?;
        if msgid != META_MSGID {
            return Err(Error::corrupt("first frame is not a meta frame"));
        }
        let meta = Meta::decode(&payload)?;
        if meta.block_size == 0 {
            return Err(Error::corrupt("meta declares zero block size"));
        }
        self.block_size = meta.block_size as u64;
        self.data_start = size as u64;
        let _ = base.config().set("block", &value::format_size(self.block_size));
        if !meta.scheme.is_empty() {
            let _ = base.config().set("scheme", &meta.scheme);
        }
        Ok(meta)
    }

    fn write_meta(&mut self, base: &Base) -> Result<()> {
        let meta = Meta {
            version: META_VERSION,
            compression: Compression::None,
            block_size: self.block_size as u32,
            flags: 0,
            scheme: self.scheme.clone(),
            attributes: Vec::new(),
        };
        let frame = frame_bytes(META_MSGID, 0, &meta.encode());
        if frame.len() as u64 > self.block_size {
            return Err(Error::failed("meta does not fit into one block"));
        }
        self.write_at(0, &frame)?;
        self.data_start = frame.len() as u64;
        self.offset = self.data_start;
        let _ = base.config().set("block", &value::format_size(self.block_size));
        Ok(())
    }

    /// Scan one block for its frames. Returns the offset just past the
    /// last complete frame and the seq of the last data frame, if any.
    fn scan_block(&self, block: u64, len: u64) -> Result<(u64, Option<i64>)> {
        let mut offset = self.block_data_start(block);
        let boundary = (block + 1) * self.block_size;
        let mut last_seq = None;
        while offset + FRAME_SIZE_LEN as u64 <= len && offset < boundary {
            let Some(size) = self.read_frame_size(offset)? else {
                break;
            };
            if size <= 0 {
                break;
            }
            let size = size as usize;
            if size < FRAME_OVERHEAD || size as u64 > self.block_size {
                break; // torn or garbage tail
            }
            if offset + size as u64 > len {
                break; // incomplete frame at tail
            }
            match self.read_frame(offset, size) {
                Ok((msgid, seq, _)) => {
                    if msgid != META_MSGID && msgid != BLOCK_MSGID {
                        last_seq = Some(seq);
                    }
                    offset += size as u64;
                }
                Err(_) => break,
            }
        }
        Ok((offset, last_seq))
    }

    /// Writer open on an existing file: find the end of data and the last
    /// sequence number; truncate a torn tail.
    fn open_writer_existing(&mut self, base: &mut Base, len: u64) -> Result<()> {
        self.read_meta(base)?;
        let last_block = (len - 1) / self.block_size;
        let (end, mut last_seq) = self.scan_block(last_block, len)?;
        let mut block = last_block;
        while last_seq.is_none() && block > 0 {
            block -= 1;
            let (_, seq) = self.scan_block(block, len)?;
            last_seq = seq;
        }
        if len > end {
            tracing::warn!(
                channel = %base.name(),
                file = %self.filename.display(),
                from = len,
                to = end,
                "truncating torn tail"
            );
            self.file()?.set_len(end)?;
        }
        self.offset = end;
        if let Some(seq) = last_seq {
            self.seq.store(seq, Ordering::Relaxed);
            self.has_seq = true;
        }
        Ok(())
    }

    /// Position the reader at the first data frame with seq >= `target`.
    fn seek(&mut self, target: i64) -> Result<()> {
        let len = self.file_len()?;
        if len <= self.data_start {
            return Ok(());
        }
        let last_block = (len - 1) / self.block_size;
        let mut lo = 0u64;
        let mut hi = last_block;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            match self.block_seq(mid, len)? {
                Some(seq) if seq <= target => lo = mid,
                _ => hi = mid - 1,
            }
        }
        let mut offset = self.block_data_start(lo);
        loop {
            if offset + FRAME_SIZE_LEN as u64 > len {
                break;
            }
            let Some(size) = self.read_frame_size(offset)? else {
                break;
            };
            if size == 0 {
                let next = self.block_end(offset);
                if next + FRAME_SIZE_LEN as u64 > len {
                    break;
                }
                offset = next;
                continue;
            }
            if size < 0 {
                offset = self.block_end(offset);
                continue;
            }
            let size = size as usize;
            if size < FRAME_OVERHEAD || size as u64 > self.block_size {
                return Err(Error::corrupt("invalid frame size during seek"));
            }
            let (msgid, seq, _) = self.read_frame(offset, size)?;
            if msgid != META_MSGID && msgid != BLOCK_MSGID && seq >= target {
                break;
            }
            offset += size as u64;
        }
        self.offset = offset;
        Ok(())
    }

    /// First data seq of block `k`: one read of the block marker, except
    /// for block 0 which is scanned from the meta frame.
    fn block_seq(&self, block: u64, len: u64) -> Result<Option<i64>> {
        if block == 0 {
            let mut offset = self.data_start;
            while offset + FRAME_SIZE_LEN as u64 <= len {
                let Some(size) = self.read_frame_size(offset)? else {
                    return Ok(None);
                };
                if size <= 0 {
                    return Ok(None);
                }
                let size = size as usize;
                if size < FRAME_OVERHEAD || offset + size as u64 > len {
                    return Ok(None);
                }
                let (msgid, seq, _) = self.read_frame(offset, size)?;
                if msgid != META_MSGID && msgid != BLOCK_MSGID {
                    return Ok(Some(seq));
                }
                offset += size as u64;
            }
            return Ok(None);
        }
        let offset = block * self.block_size;
        let Some(size) = self.read_frame_size(offset)? else {
            return Ok(None);
        };
        if size < FRAME_OVERHEAD as i32 || offset + size as u64 > len {
            return Ok(None);
        }
        let (msgid, seq, _) = self.read_frame(offset, size as usize)?;
        if msgid != BLOCK_MSGID {
            return Err(Error::corrupt(format!(
                "no block marker at offset {}",
                offset
            )));
        }
        Ok(Some(seq))
    }

    fn close_now(&mut self, base: &mut Base) {
        if self.dir == Dir::Write {
            if let Some(f) = &self.file {
                let _ = f.sync_data();
            }
        }
        self.file = None;
        if base.state().can_transition(State::Closing) {
            let _ = base.set_state(State::Closing);
            let _ = base.set_state(State::Closed);
        }
    }
}

impl ChannelImpl for File {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Custom
    }

    fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&crate::chan::Channel>) -> Result<()> {
        let host = url.host();
        if host.is_empty() {
            return Err(Error::failed("file channel needs a filename"));
        }
        self.filename = PathBuf::from(host);
        self.dir = match url.get("dir").as_deref() {
            None | Some("r") => Dir::Read,
            Some("w") => Dir::Write,
            Some(other) => {
                return Err(Error::failed(format!("invalid dir '{}', expected r or w", other)))
            }
        };
        let cfg = url.config();
        self.block_size = cfg.get_size("block", DEFAULT_BLOCK)?;
        if self.block_size < (FRAME_OVERHEAD * 2 + FRAME_SIZE_LEN) as u64 {
            return Err(Error::failed(format!("block size too small: {}", self.block_size)));
        }
        self.autoclose = cfg.get_bool("autoclose", true)?;
        self.autoseq = cfg.get_bool("autoseq", false)?;
        self.scheme = url.get("scheme").unwrap_or_default();
        let seq = self.seq.clone();
        base.config_info()
            .set_callback("seq", move || seq.load(Ordering::Relaxed).to_string())?;
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        self.seq.store(-1, Ordering::Relaxed);
        self.has_seq = false;
        match self.dir {
            Dir::Write => {
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&self.filename)?;
                let len = file.metadata()?.len();
                self.file = Some(file);
                if len == 0 {
                    self.write_meta(base)?;
                } else {
                    self.open_writer_existing(base, len)?;
                }
                tracing::info!(
                    channel = %base.name(),
                    file = %self.filename.display(),
                    seq = self.seq.load(Ordering::Relaxed),
                    offset = self.offset,
                    "file opened for writing"
                );
            }
            Dir::Read => {
                self.file = Some(fs::File::open(&self.filename)?);
                self.read_meta(base)?;
                self.offset = self.data_start;
                if let Some(block) = params.get("block")? {
                    let block: u64 = block
                        .parse()
                        .map_err(|_| Error::failed(format!("invalid block '{}'", block)))?;
                    if block > 0 {
                        let offset = block * self.block_size;
                        if offset >= self.file_len()? {
                            return Err(Error::failed(format!("block {} out of range", block)));
                        }
                        self.offset = offset;
                    }
                } else if let Some(seq) = params.get("seq")? {
                    let seq: i64 = seq
                        .parse()
                        .map_err(|_| Error::failed(format!("invalid seq '{}'", seq)))?;
                    self.seek(seq)?;
                }
                base.update_dcaps(DCaps::PROCESS | DCaps::PENDING, DCaps::empty());
            }
        }
        Ok(())
    }

    fn close(&mut self, base: &mut Base, _force: bool) -> Result<()> {
        if self.dir == Dir::Write {
            if let Some(f) = &self.file {
                let _ = f.sync_data();
            }
        }
        self.file = None;
        base.update_dcaps(DCaps::empty(), DCaps::PROCESS | DCaps::PENDING);
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if self.dir != Dir::Write {
            return Err(Error::failed("post on read-only file channel"));
        }
        if msg.msg_type != MsgType::Data {
            return Ok(());
        }
        let last = self.seq.load(Ordering::Relaxed);
        let seq = if self.autoseq { last + 1 } else { msg.seq };
        if seq <= last {
            return Err(Error::failed(format!(
                "non-monotonic seq: {} <= last {}",
                seq, last
            )));
        }
        // A frame must fit in one block together with a block marker and
        // an end marker.
        let max_payload =
            self.block_size as usize - 2 * FRAME_OVERHEAD - FRAME_SIZE_LEN;
        if msg.data.len() > max_payload {
            return Err(Error::failed(format!(
                "message size {} exceeds block capacity {}",
                msg.data.len(),
                max_payload
            )));
        }
        let frame = frame_bytes(msg.msgid, seq, &msg.data);
        let block_end = self.block_end(self.offset);
        if self.offset + (frame.len() + FRAME_SIZE_LEN) as u64 > block_end {
            // Would cross: seal this block and start the next one with a
            // marker carrying the seq of its first data frame.
            self.write_at(self.offset, &0i32.to_le_bytes())?;
            let marker = frame_bytes(BLOCK_MSGID, seq, &[]);
            self.write_at(block_end, &marker)?;
            self.offset = block_end + marker.len() as u64;
        }
        self.write_at(self.offset, &frame)?;
        self.offset += frame.len() as u64;
        self.seq.store(seq, Ordering::Relaxed);
        self.has_seq = true;
        let _ = base;
        Ok(())
    }

    fn process(&mut self, base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        if self.dir != Dir::Read || self.file.is_none() {
            return Ok(false);
        }
        let len = self.file_len()?;
        loop {
            // A missing or zero size field both mean "nothing written
            // here": end of data, unless the writer sealed this block and
            // continued in the next one.
            let size = self.read_frame_size(self.offset)?.unwrap_or(0);
            if size == 0 {
                let next = self.block_end(self.offset);
                if next + FRAME_SIZE_LEN as u64 <= len {
                    self.offset = next;
                    continue;
                }
                if self.autoclose {
                    tracing::debug!(channel = %base.name(), "end of data, closing");
                    self.close_now(base);
                } else {
                    base.dcaps_pending(false);
                }
                return Ok(false);
            }
            if size < 0 {
                self.offset = self.block_end(self.offset);
                continue;
            }
            let size = size as usize;
            if size < FRAME_OVERHEAD || size as u64 > self.block_size {
                return Err(Error::corrupt(format!(
                    "invalid frame size {} at offset {}",
                    size, self.offset
                )));
            }
            let (msgid, seq, payload) = self.read_frame(self.offset, size)?;
            if msgid == META_MSGID || msgid == BLOCK_MSGID {
                self.offset += size as u64;
                continue;
            }
            let last = self.seq.load(Ordering::Relaxed);
            if self.has_seq && seq <= last {
                return Err(Error::corrupt(format!(
                    "seq regression: {} after {}",
                    seq, last
                )));
            }
            self.offset += size as u64;
            self.seq.store(seq, Ordering::Relaxed);
            self.has_seq = true;
            base.dcaps_pending(true);
            base.callback_data(Msg::data(msgid, seq, payload));
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tempfile::TempDir;
    use wirelink_core::MsgMask;

    use super::*;
    use crate::chan::Channel;
    use crate::context::Context;

    fn accum(c: &Channel) -> Rc<RefCell<Vec<(i32, i64, Bytes)>>> {
        let got: Rc<RefCell<Vec<(i32, i64, Bytes)>>> = Rc::default();
        let sink = got.clone();
        c.callback_add(
            move |m| sink.borrow_mut().push((m.msgid, m.seq, m.data.clone())),
            MsgMask::DATA,
        );
        got
    }

    fn drain(c: &Channel) -> usize {
        let mut n = 0;
        while c.process().unwrap() {
            n += 1;
        }
        n
    }

    struct Fixture {
        _dir: TempDir,
        ctx: Context,
        path: String,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("file.dat").display().to_string();
            Fixture {
                _dir: dir,
                ctx: Context::new(),
                path,
            }
        }

        fn writer(&self, block: &str) -> Channel {
            let c = self
                .ctx
                .channel(&format!("file://{};name=writer;dir=w;block={}", self.path, block))
                .unwrap();
            c.open(&Config::new()).unwrap();
            c
        }

        fn reader(&self, params: &str) -> Channel {
            let c = self
                .ctx
                .channel(&format!(
                    "file://{};name=reader;dir=r;autoclose=no",
                    self.path
                ))
                .unwrap();
            c.open_props(params).unwrap();
            c
        }
    }

    #[test]
    fn test_meta_encode_decode() {
        let meta = Meta {
            version: 1,
            compression: Compression::None,
            block_size: 4096,
            flags: 0,
            scheme: "yamls://...".into(),
            attributes: vec![("k".into(), "v".into())],
        };
        let decoded = Meta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        assert_eq!(w.dcaps(), DCaps::empty());
        w.post(&Msg::data(1, 10, &b"a"[..])).unwrap();
        w.post(&Msg::data(1, 11, &b"bb"[..])).unwrap();
        w.post(&Msg::data(2, 12, &b"ccc"[..])).unwrap();

        let r = f.reader("");
        assert!(r.dcaps().contains(DCaps::PROCESS | DCaps::PENDING));
        let got = accum(&r);
        drain(&r);
        assert_eq!(
            *got.borrow(),
            vec![
                (1, 10, Bytes::from_static(b"a")),
                (1, 11, Bytes::from_static(b"bb")),
                (2, 12, Bytes::from_static(b"ccc")),
            ]
        );
        assert!(!r.dcaps().contains(DCaps::PENDING));
    }

    #[test]
    fn test_reader_tails_new_writes() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(0, 0, &b"first"[..])).unwrap();

        let r = f.reader("");
        let got = accum(&r);
        drain(&r);
        assert_eq!(got.borrow().len(), 1);
        assert!(!r.process().unwrap());

        w.post(&Msg::data(0, 1, &b"second"[..])).unwrap();
        assert!(r.process().unwrap());
        assert_eq!(got.borrow().len(), 2);
        assert_eq!(got.borrow()[1].1, 1);
    }

    #[test]
    fn test_block_boundary_placement() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        // Frame = 512 + 17 bytes; two of them cannot share a 1kb block.
        w.post(&Msg::data(0, 0, vec![b'a'; 512])).unwrap();
        w.post(&Msg::data(10, 1, vec![b'b'; 512])).unwrap();

        // Second frame starts exactly at the second block, after the
        // marker.
        let raw = std::fs::read(&f.path).unwrap();
        assert_eq!(
            i32::from_le_bytes(raw[1024..1028].try_into().unwrap()),
            (FRAME_OVERHEAD) as i32
        );
        let marker_msgid = i32::from_le_bytes(raw[1028..1032].try_into().unwrap());
        assert_eq!(marker_msgid, BLOCK_MSGID);
        let marker_seq = i64::from_le_bytes(raw[1032..1040].try_into().unwrap());
        assert_eq!(marker_seq, 1);

        let r = f.reader("");
        let got = accum(&r);
        drain(&r);
        assert_eq!(got.borrow().len(), 2);
        assert_eq!(got.borrow()[1].0, 10);
        assert_eq!(got.borrow()[1].2.len(), 512);
    }

    #[test]
    fn test_reader_from_block_param() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(0, 0, vec![b'a'; 512])).unwrap();
        w.post(&Msg::data(0, 1, vec![b'b'; 512])).unwrap();

        let r = f.reader("block=1");
        let got = accum(&r);
        drain(&r);
        assert_eq!(got.borrow().len(), 1);
        assert_eq!(got.borrow()[0].1, 1);
    }

    #[test]
    fn test_post_too_large_rejected() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        assert!(w.post(&Msg::data(0, 0, vec![b'x'; 1024 * 1024])).is_err());
        assert!(w.post(&Msg::data(0, 0, vec![b'x'; 1024 - 15])).is_err());
        // Still usable afterwards.
        w.post(&Msg::data(0, 0, &b"small"[..])).unwrap();
    }

    #[test]
    fn test_post_seq_must_increase() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(0, 10, &b"a"[..])).unwrap();
        assert!(w.post(&Msg::data(0, 10, &b"b"[..])).is_err());
        assert!(w.post(&Msg::data(0, 9, &b"b"[..])).is_err());
        w.post(&Msg::data(0, 11, &b"b"[..])).unwrap();
    }

    #[test]
    fn test_autoseq_assigns_sequence() {
        let f = Fixture::new();
        let c = f
            .ctx
            .channel(&format!(
                "file://{};name=w;dir=w;block=1kb;autoseq=yes",
                f.path
            ))
            .unwrap();
        c.open(&Config::new()).unwrap();
        c.post(&Msg::data(0, 0, &b"a"[..])).unwrap();
        c.post(&Msg::data(0, 0, &b"b"[..])).unwrap();
        assert_eq!(c.config().get("info.seq").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_open_seq_seeks_to_first_at_or_above() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        for i in 0..100i64 {
            w.post(&Msg::data(i as i32, 10 * (i + 1), vec![b'x'; (3 * i) as usize]))
                .unwrap();
        }
        for (open_seq, expect) in [(0, 10), (5, 10), (100, 100), (105, 110)] {
            let r = f.reader(&format!("seq={}", open_seq));
            let got = accum(&r);
            assert!(r.process().unwrap());
            assert_eq!(got.borrow()[0].1, expect, "open seq {}", open_seq);
            r.close(false);
        }
    }

    #[test]
    fn test_open_seq_past_end_delivers_nothing() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(0, 5, &b"a"[..])).unwrap();
        let r = f.reader("seq=100");
        let got = accum(&r);
        drain(&r);
        assert!(got.borrow().is_empty());
    }

    #[test]
    fn test_writer_reopen_resumes_seq() {
        let f = Fixture::new();
        {
            let w = f.writer("1kb");
            w.post(&Msg::data(0, 7, &b"a"[..])).unwrap();
            w.close(false);
        }
        let w = f.writer("1kb");
        assert_eq!(w.config().get("info.seq").unwrap().as_deref(), Some("7"));
        assert!(w.post(&Msg::data(0, 7, &b"dup"[..])).is_err());
        w.post(&Msg::data(0, 8, &b"next"[..])).unwrap();

        let r = f.reader("");
        let got = accum(&r);
        drain(&r);
        assert_eq!(
            got.borrow().iter().map(|m| m.1).collect::<Vec<_>>(),
            vec![7, 8]
        );
    }

    #[test]
    fn test_writer_reopen_truncates_torn_tail() {
        let f = Fixture::new();
        {
            let w = f.writer("1kb");
            w.post(&Msg::data(0, 1, &b"whole"[..])).unwrap();
            w.close(false);
        }
        // Simulate a torn write: append half a frame.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&f.path)
                .unwrap();
            file.write_all(&100i32.to_le_bytes()).unwrap();
            file.write_all(&[0u8; 6]).unwrap();
        }
        let w = f.writer("1kb");
        assert_eq!(w.config().get("info.seq").unwrap().as_deref(), Some("1"));
        w.post(&Msg::data(0, 2, &b"after"[..])).unwrap();

        let r = f.reader("");
        let got = accum(&r);
        drain(&r);
        assert_eq!(
            got.borrow().iter().map(|m| m.1).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_autoclose_reader_closes_at_end() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        for i in 0..10i64 {
            w.post(&Msg::data(i as i32, 10 * (i + 1), vec![b'x'; 3])).unwrap();
        }
        let r = f
            .ctx
            .channel(&format!(
                "file://{};name=ac-reader;dir=r;autoclose=yes",
                f.path
            ))
            .unwrap();
        r.open_props("seq=50").unwrap();
        let got = accum(&r);
        for _ in 0..20 {
            let _ = r.process();
        }
        assert_eq!(
            got.borrow().iter().map(|m| m.1).collect::<Vec<_>>(),
            vec![50, 60, 70, 80, 90, 100]
        );
        assert_eq!(r.state(), State::Closed);
    }

    #[test]
    fn test_reader_reports_seq_regression() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(0, 5, &b"a"[..])).unwrap();
        // Corrupt the file: rewrite the frame seq to go backwards by
        // appending a frame with a smaller seq directly.
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&f.path)
                .unwrap();
            file.seek(SeekFrom::End(0)).unwrap();
            let frame = super::frame_bytes(0, 3, b"bad");
            file.write_all(&frame).unwrap();
        }
        let r = f.reader("");
        let got = accum(&r);
        assert!(r.process().unwrap());
        assert!(r.process().is_err());
        assert_eq!(r.state(), State::Error);
        assert_eq!(got.borrow().len(), 1);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let f = Fixture::new();
        let r = f
            .ctx
            .channel(&format!("file://{};name=r;dir=r", f.path))
            .unwrap();
        assert!(r.open(&Config::new()).is_err());
        assert_eq!(r.state(), State::Error);
    }

    #[test]
    fn test_unknown_msgid_is_delivered() {
        let f = Fixture::new();
        let w = f.writer("1kb");
        w.post(&Msg::data(424242, 1, &b"odd"[..])).unwrap();
        let r = f.reader("");
        let got = accum(&r);
        drain(&r);
        assert_eq!(got.borrow()[0].0, 424242);
    }
}
