//! `stream+<child>://` - durable, resumable stream server
//!
//! The server publishes a live stream through its wrapped `child`
//! transport while persisting every message, and lets clients join late:
//! a client asks the `request` channel for catch-up from a sequence
//! number (or a named block), receives the stored history from its own
//! storage reader, and continues live on `child` - with no gap, because
//! live posts reach storage before they reach `child`.
//!
//! ## Sub-channels
//!
//! Built from URL sub-sections at init:
//!
//! - `child` - the live publication transport (the `+`-stripped URL).
//! - `request=<url>` - the reverse channel carrying client requests,
//!   acks and per-client backpressure controls.
//! - `storage=<url>` - the durable log, opened in write mode; every
//!   client replay is a read-mode instance of the same URL.
//! - `blocks=<url>` - optional named block index mirroring storage.
//!
//! ## Open sequence
//!
//! Storage opens first (synchronously) and its `info.seq` seeds the
//! server's `_seq`. A lagging block index is caught up by replaying the
//! storage tail through it (a temporary autoclose reader); only then do
//! `request` and `child` open. The server turns Active when child,
//! request and storage all are.
//!
//! ## Contract
//!
//! Posting is single-writer. `post` succeeds only after the message is in
//! blocks (when configured), in storage, and handed to `child`; a failure
//! in the middle leaves storage authoritative, so a retry may duplicate
//! on the wire - callers serialize writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use wirelink_channel::error::{Error, Result};
use wirelink_channel::{tcp, Base, Channel, ChannelImpl, ClosePolicy, OpenPolicy};
use wirelink_config::{Config, Url};
use wirelink_core::{Msg, MsgType, State};

use crate::scheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Active,
    Error,
    Closed,
}

struct Session {
    name: String,
    addr: u64,
    seq: i64,
    state: SessionState,
    storage: Channel,
    storage_next: Option<Channel>,
}

pub struct StreamServer {
    autoseq: bool,
    seq: Arc<AtomicI64>,
    child: Option<Channel>,
    request: Option<Channel>,
    storage: Option<Channel>,
    blocks: Option<Channel>,
    storage_url: Option<Url>,
    blocks_url: Option<Url>,
    storage_load: Option<Channel>,
    open_params: Config,
    clients: HashMap<u64, Session>,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self {
            autoseq: false,
            seq: Arc::new(AtomicI64::new(-1)),
            child: None,
            request: None,
            storage: None,
            blocks: None,
            storage_url: None,
            blocks_url: None,
            storage_load: None,
            open_params: Config::new(),
            clients: HashMap::new(),
        }
    }
}

impl StreamServer {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::<StreamServer>::default()
    }

    fn child(&self) -> &Channel {
        self.child.as_ref().expect("created in init")
    }

    fn request(&self) -> &Channel {
        self.request.as_ref().expect("created in init")
    }

    fn storage(&self) -> &Channel {
        self.storage.as_ref().expect("created in init")
    }

    /// Fill in the conventions for a sub-channel URL.
    fn child_url_fill(url: &Url, base: &Base, tag: &str) -> Result<()> {
        url.set("name", &format!("{}/{}", base.name(), tag))?;
        url.set(wirelink_config::url::KEY_INTERNAL, "yes")?;
        Ok(())
    }

    /// When every monitored sub-channel reached `state`, follow it.
    fn check_state(&mut self, base: &mut Base, state: State) -> Result<()> {
        for c in [self.request(), self.storage(), self.child()] {
            if c.state() != state {
                return Ok(());
            }
        }
        match state {
            State::Active if base.state() == State::Opening => {
                tracing::info!(channel = %base.name(), "all sub channels are active");
                base.set_state(State::Active)?;
            }
            State::Closed if base.state() == State::Closing => {
                tracing::info!(channel = %base.name(), "all sub channels are closed");
                base.set_state(State::Closed)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_request_state(&mut self, base: &mut Base, state: State) -> Result<()> {
        match state {
            State::Active => self.check_state(base, State::Active),
            State::Error => {
                base.state_fail("request channel failed");
                Ok(())
            }
            State::Closing => {
                if base.state() != State::Closing {
                    tracing::info!(channel = %base.name(), "request channel is closing");
                    self.close_all(base, false)?;
                }
                Ok(())
            }
            State::Closed => self.check_state(base, State::Closed),
            _ => Ok(()),
        }
    }

    fn on_request_control(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        let Some(session) = self.clients.get_mut(&msg.addr) else {
            return Ok(());
        };
        match msg.msgid {
            tcp::scheme::DISCONNECT => {
                tracing::info!(client = %session.name, addr = msg.addr, "client disconnected");
                session.state = SessionState::Closed;
                let storage = session.storage.clone();
                self.clients.remove(&msg.addr);
                let _ = base.child_del(&storage);
                storage.close(true);
            }
            tcp::scheme::WRITE_FULL => {
                tracing::debug!(client = %session.name, "suspend storage reader");
                session.storage.suspend();
            }
            tcp::scheme::WRITE_READY => {
                tracing::debug!(client = %session.name, "resume storage reader");
                session.storage.resume();
            }
            _ => {}
        }
        Ok(())
    }

    /// Set up a client session from a Request message. On failure the
    /// client gets an Error reply and a Disconnect.
    fn on_request_data(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        match self.session_init(base, msg) {
            Ok(session) => {
                let storage = session.storage.clone();
                let addr = session.addr;
                self.clients.insert(addr, session);
                base.child_add(&storage, &format!("client/{}", addr))?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(addr = msg.addr, "failed to init client: {}", e);
                let reply = Msg::data(scheme::ERROR, 0, scheme::encode_error(&e.to_string()))
                    .with_addr(msg.addr);
                if let Err(e) = self.request().post(&reply) {
                    tracing::error!("failed to post error reply: {}", e);
                }
                let disconnect = Msg::control(tcp::scheme::DISCONNECT).with_addr(msg.addr);
                if let Err(e) = self.request().post(&disconnect) {
                    tracing::error!("failed to post disconnect: {}", e);
                }
                self.clients.remove(&msg.addr);
                Ok(())
            }
        }
    }

    fn session_init(&mut self, base: &mut Base, msg: &Msg) -> Result<Session> {
        if msg.msgid != scheme::REQUEST {
            return Err(Error::protocol(format!("invalid message id: {}", msg.msgid)));
        }
        let request = scheme::Request::decode(&msg.data)?;
        tracing::info!(
            client = %request.client,
            addr = msg.addr,
            seq = request.seq,
            block = %request.block,
            "client request"
        );
        if request.seq < 0 {
            return Err(Error::protocol(format!("Negative seq: {}", request.seq)));
        }

        let mut seq = request.seq;
        let mut storage_next = None;
        if !request.block.is_empty() {
            let blocks_url = self
                .blocks_url
                .as_ref()
                .ok_or_else(|| Error::failed("Requested block, but no block storage configured"))?;
            let blocks = base.context().channel_url(blocks_url, None)?;
            let params = Config::new();
            params.set("block", &request.block)?;
            blocks
                .open(&params)
                .map_err(|e| Error::failed(format!("failed to open blocks channel: {}", e)))?;
            let bseq = blocks.config().get_i64("info.seq", -1)?;
            seq = bseq + 1;
            if blocks.state() != State::Closed {
                // The index keeps streaming: it becomes the first reader,
                // storage takes over when it drains.
                storage_next = Some(blocks);
            }
            tracing::info!(
                client = %request.client,
                block = %request.block,
                seq,
                "translated block to seq"
            );
        }

        let storage_url = self
            .storage_url
            .as_ref()
            .ok_or_else(|| Error::failed("no storage url"))?
            .copy()?;
        storage_url.set("name", &format!("{}/storage/client.{}", base.name(), msg.addr))?;
        let storage = base.context().channel_url(&storage_url, None)?;
        let params = Config::new();
        params.set("seq", &seq.to_string())?;
        storage
            .open(&params)
            .map_err(|e| Error::failed(format!("failed to open storage from seq {}: {}", seq, e)))?;

        let (storage, storage_next) = match storage_next {
            Some(next) => (next, Some(storage)),
            None => (storage, None),
        };
        let mut session = Session {
            name: request.client,
            addr: msg.addr,
            seq,
            state: SessionState::Opening,
            storage,
            storage_next,
        };

        let reply = scheme::Reply {
            last_seq: self.seq.load(Ordering::Relaxed),
            requested_seq: seq,
        };
        let reply = Msg::data(scheme::REPLY, 0, reply.encode()).with_addr(msg.addr);
        self.request()
            .post(&reply)
            .map_err(|e| Error::failed(format!("failed to post reply: {}", e)))?;
        session.state = SessionState::Active;
        Ok(session)
    }

    fn on_storage_load(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Data => {
                if let Some(blocks) = &self.blocks {
                    if let Err(e) = blocks.post(msg) {
                        base.state_fail(format!(
                            "failed to forward seq {} to blocks channel: {}",
                            msg.seq, e
                        ));
                    }
                }
                Ok(())
            }
            MsgType::State => match msg.as_state() {
                Some(State::Closed) => {
                    // Catch-up finished: proceed with the normal open.
                    if let Some(load) = self.storage_load.take() {
                        let _ = base.child_del(&load);
                    }
                    self.request().open(&Config::new())?;
                    self.child().open(&self.open_params)?;
                    Ok(())
                }
                Some(State::Error) => {
                    base.state_fail("storage load channel failed");
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn on_client_storage(&mut self, base: &mut Base, addr: u64, msg: &Msg) -> Result<()> {
        // Taken before the session borrow; it stays live across the post.
        let request = self.request.as_ref().expect("created in init").clone();
        let Some(session) = self.clients.get_mut(&addr) else {
            return Ok(());
        };
        match msg.msg_type {
            MsgType::Data => {
                let mut m = msg.clone();
                m.addr = session.addr;
                if let Err(e) = request.post(&m) {
                    tracing::error!(
                        client = %session.name,
                        seq = m.seq,
                        "failed to post replay data: {}",
                        e
                    );
                    session.state = SessionState::Error;
                    session.storage.close(false);
                }
                Ok(())
            }
            MsgType::State => {
                if session.state != SessionState::Active {
                    return Ok(());
                }
                match msg.as_state() {
                    Some(State::Error) => session.state = SessionState::Error,
                    Some(State::Closed) => {
                        let next_active = session
                            .storage_next
                            .as_ref()
                            .map(|c| c.state() == State::Active)
                            .unwrap_or(false);
                        if next_active {
                            // Swap outside the closing reader's callback:
                            // its event already dispatched, so detaching
                            // it here is safe.
                            let old = session.storage.clone();
                            let next = session.storage_next.take().expect("checked above");
                            session.storage = next.clone();
                            let _ = base.child_del(&old);
                            base.child_add(&next, &format!("client/{}", addr))?;
                        } else {
                            // Fully caught up; the client is live on the
                            // child transport now.
                            tracing::info!(
                                client = %session.name,
                                from = session.seq,
                                "replay finished"
                            );
                            session.state = SessionState::Closed;
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn close_all(&mut self, base: &mut Base, force: bool) -> Result<()> {
        if base.state() != State::Closing && base.state().can_transition(State::Closing) {
            base.set_state(State::Closing)?;
        }
        if let Some(load) = self.storage_load.take() {
            let _ = base.child_del(&load);
            load.close(true);
        }
        for (_, session) in self.clients.drain() {
            let _ = base.child_del(&session.storage);
            session.storage.close(true);
            if let Some(next) = session.storage_next {
                next.close(true);
            }
        }
        // Freeze the last sequence into the config as a plain value.
        let _ = base
            .config_info()
            .set("seq", &self.seq.load(Ordering::Relaxed).to_string());
        if self.request().state() != State::Closed {
            self.request().close(force);
        }
        if let Some(blocks) = &self.blocks {
            if blocks.state() != State::Closed {
                blocks.close(force);
            }
        }
        if self.storage().state() != State::Closed {
            self.storage().close(force);
        }
        if self.child().state() != State::Closed {
            self.child().close(force);
        }
        Ok(())
    }
}

impl ChannelImpl for StreamServer {
    fn init(&mut self, base: &mut Base, url: &Url, master: Option<&Channel>) -> Result<()> {
        base.open_policy = OpenPolicy::Manual;
        base.close_policy = ClosePolicy::Long;

        match url.get("mode").as_deref() {
            None | Some("server") => {}
            Some("client") => {
                return Err(Error::failed(
                    "stream client mode is handled by the peer implementation",
                ))
            }
            Some(other) => return Err(Error::failed(format!("invalid mode '{}'", other))),
        }
        self.autoseq = url.config().get_bool("autoseq", false)?;

        let (_, child_url) = url
            .split_prefix()?
            .ok_or_else(|| Error::failed("stream needs a child transport: stream+<proto>://"))?;
        child_url.set("name", &format!("{}/child", base.name()))?;
        let child = base.context().channel_url(&child_url, master)?;
        base.child_add(&child, "child")?;
        self.child = Some(child);

        let request_url = url
            .sub_url("request")?
            .ok_or_else(|| Error::failed("failed to get request url: missing 'request'"))?;
        Self::child_url_fill(&request_url, base, "request")?;
        if !request_url.has("mode") {
            request_url.set("mode", "server")?;
        }
        let request = base.context().channel_url(&request_url, None)?;
        base.child_add(&request, "request")?;
        self.request = Some(request);

        let storage_url = url
            .sub_url("storage")?
            .ok_or_else(|| Error::failed("failed to get storage url: missing 'storage'"))?;
        Self::child_url_fill(&storage_url, base, "storage")?;
        storage_url.set("dir", "w")?;
        self.storage = Some(base.context().channel_url(&storage_url, None)?);
        let read_url = storage_url.copy()?;
        read_url.set("dir", "r")?;
        read_url.set("name", &format!("{}/storage/client", base.name()))?;
        self.storage_url = Some(read_url);

        if let Some(blocks_url) = url.sub_url("blocks")? {
            Self::child_url_fill(&blocks_url, base, "blocks")?;
            blocks_url.set("dir", "w")?;
            self.blocks = Some(base.context().channel_url(&blocks_url, None)?);
            let read_url = blocks_url.copy()?;
            read_url.set("dir", "r")?;
            read_url.set("name", &format!("{}/blocks/client", base.name()))?;
            self.blocks_url = Some(read_url);
        }

        let seq = self.seq.clone();
        base.config_info()
            .set_callback("seq", move || seq.load(Ordering::Relaxed).to_string())?;
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        self.seq.store(-1, Ordering::Relaxed);
        self.open_params = params.copy()?;
        // A previous close froze info.seq to a plain value; expose the
        // live counter again.
        let seq = self.seq.clone();
        base.config_info()
            .set_callback("seq", move || seq.load(Ordering::Relaxed).to_string())?;

        let sopen = params.sub("storage").unwrap_or_default();
        self.storage()
            .open(&sopen)
            .map_err(|e| Error::failed(format!("failed to open storage channel: {}", e)))?;
        if self.storage().state() != State::Active {
            return Err(Error::failed("long opening storage is not supported"));
        }
        let last = self.storage().config().get_i64("info.seq", -1)?;
        self.seq.store(last, Ordering::Relaxed);
        tracing::info!(channel = %base.name(), seq = last, "last seq in storage");

        if let Some(blocks) = self.blocks.clone() {
            blocks
                .open(&Config::new())
                .map_err(|e| Error::failed(format!("failed to open blocks channel: {}", e)))?;
            if blocks.state() != State::Active {
                return Err(Error::failed("long opening blocks is not supported"));
            }
            let bseq = blocks.config().get_i64("info.seq", -1)?;
            if bseq != last {
                tracing::info!(
                    channel = %base.name(),
                    blocks_seq = bseq,
                    storage_seq = last,
                    "block index lags storage, replaying tail"
                );
                let load_url = self
                    .storage_url
                    .as_ref()
                    .expect("set in init")
                    .copy()?;
                load_url.set("autoclose", "yes")?;
                load_url.set("name", &format!("{}/storage/load", base.name()))?;
                let load = base.context().channel_url(&load_url, None)?;
                let params = Config::new();
                params.set("seq", &(bseq + 1).to_string())?;
                load.open(&params)
                    .map_err(|e| Error::failed(format!("failed to open storage for reading: {}", e)))?;
                base.child_add(&load, "load")?;
                self.storage_load = Some(load);
                // Stay in Opening; the load channel completion continues
                // the open sequence.
                return Ok(());
            }
        }

        self.request().open(&Config::new())?;
        self.child().open(params)?;
        Ok(())
    }

    fn close(&mut self, base: &mut Base, force: bool) -> Result<()> {
        self.close_all(base, force)
    }

    fn post(&mut self, _base: &mut Base, msg: &Msg) -> Result<()> {
        if msg.msg_type == MsgType::Control {
            if msg.msgid == 0 {
                return Ok(());
            }
            if msg.msgid == scheme::BLOCK {
                let blocks = self
                    .blocks
                    .as_ref()
                    .ok_or_else(|| Error::failed("no block storage configured"))?;
                return blocks
                    .post(msg)
                    .map_err(|e| Error::failed(format!("failed to create block: {}", e)));
            }
            return self.child().post(msg);
        }

        let last = self.seq.load(Ordering::Relaxed);
        let seq = if self.autoseq { last + 1 } else { msg.seq };
        if seq <= last {
            return Err(Error::failed(format!(
                "non-monotonic seq: {} <= last posted {}",
                seq, last
            )));
        }
        let mut m = msg.clone();
        m.seq = seq;
        if let Some(blocks) = &self.blocks {
            blocks
                .post(&m)
                .map_err(|e| Error::failed(format!("failed to mirror seq {} to blocks: {}", seq, e)))?;
        }
        self.storage()
            .post(&m)
            .map_err(|e| Error::failed(format!("failed to store message {}: {}", seq, e)))?;
        self.seq.store(seq, Ordering::Relaxed);
        self.child().post(&m)
    }

    fn on_child(&mut self, base: &mut Base, tag: &str, _child: &Channel, msg: &Msg) -> Result<()> {
        if let Some(addr) = tag.strip_prefix("client/") {
            let addr: u64 = addr.parse().unwrap_or(0);
            return self.on_client_storage(base, addr, msg);
        }
        match tag {
            "request" => match msg.msg_type {
                MsgType::State => match msg.as_state() {
                    Some(state) => self.on_request_state(base, state),
                    None => Ok(()),
                },
                MsgType::Control => self.on_request_control(base, msg),
                MsgType::Data => self.on_request_data(base, msg),
                _ => Ok(()),
            },
            "load" => self.on_storage_load(base, msg),
            "child" => match msg.msg_type {
                MsgType::State => match msg.as_state() {
                    Some(State::Active) => self.check_state(base, State::Active),
                    Some(State::Closed) => self.check_state(base, State::Closed),
                    Some(State::Error) => {
                        base.state_fail("child channel failed");
                        Ok(())
                    }
                    _ => Ok(()),
                },
                MsgType::Data => {
                    base.callback_data(msg.clone());
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}
