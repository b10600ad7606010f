//! `tcp://host:port` - non-blocking stream sockets
//!
//! One codebase, three flavors:
//!
//! - **client** (`mode=client`, the default): a single connection with
//!   asynchronous connect; Opening until the socket is writable.
//! - **server** (`mode=server`): listener children (one per resolved
//!   address) accept connections; every connection becomes a socket child
//!   addressed by `addr = seq << 32 | fd`, and posts are demultiplexed
//!   back by that address. A stale `seq` after fd reuse is rejected.
//! - the per-connection **socket**, shared by both.
//!
//! All sockets are non-blocking. Reads deliver raw Data chunks carrying
//! the connection address (and a receive timestamp when `timestamping` is
//! set). Writes go straight to the socket; a short write parks the rest in
//! a pending buffer, raises the `POLLOUT` dcap and emits a `WriteFull`
//! control so upstreams can pause; the buffer drains in `process()` and a
//! `WriteReady` control announces writability again. Connection teardown
//! surfaces as a `Disconnect` control, and destroying a dead connection
//! child is deferred to the next server event so it never happens inside
//! the child's own callback.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, SockAddr, Socket, Type};
use wirelink_config::{Config, Url};
use wirelink_core::{DCaps, Msg, MsgType, State};

use crate::chan::{Base, Channel, ChannelImpl, OpenPolicy};
use crate::error::{Error, Result};

/// Control scheme shared by the tcp flavors (and reused by composites
/// that ride on a tcp request channel).
pub mod scheme {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use std::net::{IpAddr, SocketAddr};

    use crate::error::{Error, Result};

    pub const CONNECT: i32 = 10;
    pub const DISCONNECT: i32 = 20;
    pub const WRITE_FULL: i32 = 30;
    pub const WRITE_READY: i32 = 40;

    /// Peer endpoint carried by a Connect control message.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ConnectHost {
        Ipv4(u32),
        Ipv6([u8; 16]),
        Unix,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Connect {
        pub host: ConnectHost,
        pub port: u16,
    }

    impl Connect {
        pub fn from_addr(addr: Option<SocketAddr>) -> Connect {
            match addr {
                Some(SocketAddr::V4(a)) => Connect {
                    host: ConnectHost::Ipv4(u32::from(*a.ip())),
                    port: a.port(),
                },
                Some(SocketAddr::V6(a)) => Connect {
                    host: ConnectHost::Ipv6(a.ip().octets()),
                    port: a.port(),
                },
                None => Connect {
                    host: ConnectHost::Unix,
                    port: 0,
                },
            }
        }

        pub fn ip(&self) -> Option<IpAddr> {
            match self.host {
                ConnectHost::Ipv4(v) => Some(IpAddr::from(std::net::Ipv4Addr::from(v))),
                ConnectHost::Ipv6(v) => Some(IpAddr::from(std::net::Ipv6Addr::from(v))),
                ConnectHost::Unix => None,
            }
        }

        pub fn encode(&self) -> Bytes {
            let mut buf = BytesMut::with_capacity(19);
            match &self.host {
                ConnectHost::Ipv4(v) => {
                    buf.put_u8(0);
                    buf.put_u32_le(*v);
                }
                ConnectHost::Ipv6(v) => {
                    buf.put_u8(1);
                    buf.put_slice(v);
                }
                ConnectHost::Unix => buf.put_u8(2),
            }
            buf.put_u16_le(self.port);
            buf.freeze()
        }

        pub fn decode(mut data: &[u8]) -> Result<Connect> {
            if data.is_empty() {
                return Err(Error::corrupt("empty Connect message"));
            }
            let host = match data.get_u8() {
                0 => {
                    if data.remaining() < 4 {
                        return Err(Error::corrupt("short ipv4 Connect"));
                    }
                    ConnectHost::Ipv4(data.get_u32_le())
                }
                1 => {
                    if data.remaining() < 16 {
                        return Err(Error::corrupt("short ipv6 Connect"));
                    }
                    let mut v = [0u8; 16];
                    data.copy_to_slice(&mut v);
                    ConnectHost::Ipv6(v)
                }
                2 => ConnectHost::Unix,
                t => return Err(Error::corrupt(format!("unknown address family tag {}", t))),
            };
            if data.remaining() < 2 {
                return Err(Error::corrupt("short Connect message"));
            }
            Ok(Connect {
                host,
                port: data.get_u16_le(),
            })
        }
    }
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: i32 = libc::MSG_DONTWAIT;

const DEFAULT_READ_WINDOW: u64 = 128 * 1024;
const DEFAULT_BUFFER: u64 = 64 * 1024;
const LISTEN_BACKLOG: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

impl AddressFamily {
    fn parse(s: &str) -> Result<AddressFamily> {
        match s {
            "unspec" | "any" => Ok(AddressFamily::Unspec),
            "inet" | "ipv4" => Ok(AddressFamily::Inet),
            "inet6" | "ipv6" => Ok(AddressFamily::Inet6),
            "unix" => Ok(AddressFamily::Unix),
            _ => Err(Error::failed(format!("invalid address family: {}", s))),
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    af: AddressFamily,
    read_window: usize,
    buffer_size: usize,
    keepalive: bool,
    sndbuf: usize,
    rcvbuf: usize,
    timestamping: bool,
}

impl Settings {
    fn from_url(url: &Url) -> Result<Settings> {
        let cfg = url.config();
        let af = match url.get("af") {
            Some(s) => AddressFamily::parse(&s)?,
            None => AddressFamily::Unspec,
        };
        Ok(Settings {
            af,
            read_window: cfg.get_size("size", DEFAULT_READ_WINDOW)? as usize,
            buffer_size: cfg.get_size("buffer-size", DEFAULT_BUFFER)? as usize,
            keepalive: cfg.get_bool("keepalive", true)?,
            sndbuf: cfg.get_size("sndbuf", 0)? as usize,
            rcvbuf: cfg.get_size("rcvbuf", 0)? as usize,
            timestamping: cfg.get_bool("timestamping", false)?,
        })
    }

    fn apply(&self, sock: &Socket) -> Result<()> {
        sock.set_nonblocking(true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        sock.set_nosigpipe(true)?;
        if self.keepalive {
            sock.set_keepalive(true)?;
        }
        if self.sndbuf > 0 {
            sock.set_send_buffer_size(self.sndbuf)?;
        }
        if self.rcvbuf > 0 {
            sock.set_recv_buffer_size(self.rcvbuf)?;
        }
        Ok(())
    }
}

/// Endpoint parsed from the URL host (or open parameters).
#[derive(Debug, Clone)]
enum Endpoint {
    Net { host: String, port: u16 },
    Unix(PathBuf),
}

fn parse_endpoint(host: &str, af: AddressFamily) -> Result<Endpoint> {
    if af == AddressFamily::Unix || (af == AddressFamily::Unspec && host.contains('/')) {
        return Ok(Endpoint::Unix(PathBuf::from(host)));
    }
    let (h, p) = host
        .rsplit_once(':')
        .ok_or_else(|| Error::failed(format!("no port in address '{}'", host)))?;
    let port: u16 = p
        .parse()
        .map_err(|_| Error::failed(format!("invalid port in address '{}'", host)))?;
    Ok(Endpoint::Net {
        host: h.to_string(),
        port,
    })
}

fn resolve(ep: &Endpoint, af: AddressFamily) -> Result<Vec<SockAddr>> {
    match ep {
        Endpoint::Unix(path) => Ok(vec![SockAddr::unix(path)?]),
        Endpoint::Net { host, port } => {
            use std::net::ToSocketAddrs;
            let addrs: Vec<SocketAddr> = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|e| Error::failed(format!("failed to resolve '{}': {}", host, e)))?
                .filter(|a| match af {
                    AddressFamily::Inet => a.is_ipv4(),
                    AddressFamily::Inet6 => a.is_ipv6(),
                    _ => true,
                })
                .collect();
            if addrs.is_empty() {
                return Err(Error::failed(format!("no usable address for '{}'", host)));
            }
            Ok(addrs.into_iter().map(SockAddr::from).collect())
        }
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The read/write engine shared by connection sockets and the client.
struct SocketCore {
    sock: Option<Socket>,
    addr: u64,
    read_window: usize,
    buffer_size: usize,
    timestamping: bool,
    /// Client flavor announces remote close itself; server-side sockets
    /// leave that to the server.
    emit_disconnect: bool,
    pending: BytesMut,
}

impl SocketCore {
    fn new(read_window: usize, buffer_size: usize, timestamping: bool) -> SocketCore {
        SocketCore {
            sock: None,
            addr: 0,
            read_window,
            buffer_size,
            timestamping,
            emit_disconnect: false,
            pending: BytesMut::new(),
        }
    }

    fn sock(&self) -> Result<&Socket> {
        self.sock.as_ref().ok_or_else(|| Error::failed("socket is not open"))
    }

    fn post_data(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(&msg.data);
            return Ok(());
        }
        let n = match self.sock()?.send_with_flags(&msg.data, SEND_FLAGS) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        if n < msg.data.len() {
            if self.pending.capacity() == 0 {
                self.pending.reserve(self.buffer_size);
            }
            self.pending.extend_from_slice(&msg.data[n..]);
            base.update_dcaps(DCaps::POLLOUT, DCaps::empty());
            base.callback(Msg::control(scheme::WRITE_FULL).with_addr(self.addr));
            tracing::debug!(
                channel = %base.name(),
                stored = self.pending.len(),
                "short write, output pending"
            );
        }
        Ok(())
    }

    /// Try to drain pending output. Ok(true) when progress was made.
    fn flush(&mut self, base: &mut Base) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let n = match self.sock()?.send_with_flags(&self.pending, SEND_FLAGS) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let _ = self.pending.split_to(n);
        if self.pending.is_empty() {
            base.update_dcaps(DCaps::empty(), DCaps::POLLOUT);
            base.callback(Msg::control(scheme::WRITE_READY).with_addr(self.addr));
        }
        Ok(n > 0)
    }

    /// Read once. Delivers a Data chunk, or handles remote close.
    fn read(&mut self, base: &mut Base) -> Result<bool> {
        let mut buf = vec![0u8; self.read_window];
        let sock = self
            .sock
            .as_mut()
            .ok_or_else(|| Error::failed("socket is not open"))?;
        let n = match sock.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            tracing::debug!(channel = %base.name(), "connection closed by peer");
            if self.emit_disconnect {
                base.callback(Msg::control(scheme::DISCONNECT).with_addr(self.addr));
            }
            self.close(base);
            return Ok(true);
        }
        buf.truncate(n);
        let mut msg = Msg::data(0, 0, Bytes::from(buf)).with_addr(self.addr);
        if self.timestamping {
            msg.time = Some(now_ns());
        }
        base.callback_data(msg);
        Ok(true)
    }

    fn close(&mut self, base: &mut Base) {
        if let Some(sock) = self.sock.take() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        self.pending.clear();
        base.set_fd(None);
        if base.state().can_transition(State::Closing) {
            let _ = base.set_state(State::Closing);
        }
        if base.state() == State::Closing {
            let _ = base.set_state(State::Closed);
        }
    }

    fn handle_control(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if msg.msgid == scheme::DISCONNECT {
            tracing::info!(channel = %base.name(), "disconnect on user request");
            self.close(base);
        }
        Ok(())
    }

    fn process(&mut self, base: &mut Base) -> Result<bool> {
        let flushed = self.flush(base)?;
        if self.sock.is_none() {
            return Ok(flushed);
        }
        let read = self.read(base)?;
        Ok(flushed || read)
    }
}

/// A connection child spawned by the server for an accepted socket.
struct TcpSocket {
    core: SocketCore,
}

impl ChannelImpl for TcpSocket {
    fn open(&mut self, base: &mut Base, _params: &Config) -> Result<()> {
        if let Some(sock) = &self.core.sock {
            base.set_fd(Some(sock.as_raw_fd()));
        }
        base.update_dcaps(DCaps::POLLIN, DCaps::empty());
        Ok(())
    }

    fn close(&mut self, base: &mut Base, _force: bool) -> Result<()> {
        if let Some(sock) = self.core.sock.take() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        self.core.pending.clear();
        base.set_fd(None);
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Data => self.core.post_data(base, msg),
            MsgType::Control => self.core.handle_control(base, msg),
            _ => Ok(()),
        }
    }

    fn process(&mut self, base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        self.core.process(base)
    }
}

type AcceptQueue = Rc<RefCell<VecDeque<(Socket, SockAddr)>>>;

/// Listener child: accepts non-blocking and hands sockets to the server
/// through a shared queue (the Data message is just the doorbell).
struct TcpListener {
    sock: Option<Socket>,
    accepted: AcceptQueue,
}

impl ChannelImpl for TcpListener {
    fn open(&mut self, base: &mut Base, _params: &Config) -> Result<()> {
        if let Some(sock) = &self.sock {
            base.set_fd(Some(sock.as_raw_fd()));
        }
        base.update_dcaps(DCaps::POLLIN, DCaps::empty());
        Ok(())
    }

    fn close(&mut self, base: &mut Base, _force: bool) -> Result<()> {
        self.sock = None;
        base.set_fd(None);
        Ok(())
    }

    fn process(&mut self, base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        let sock = self
            .sock
            .as_ref()
            .ok_or_else(|| Error::failed("listener is not open"))?;
        let (conn, peer) = match sock.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            channel = %base.name(),
            peer = ?peer.as_socket(),
            "incoming connection"
        );
        self.accepted.borrow_mut().push_back((conn, peer));
        base.callback_data(Msg::data(0, 0, Bytes::new()));
        Ok(true)
    }
}

/// The listening server.
struct TcpServer {
    settings: Settings,
    endpoint: Option<Endpoint>,
    addr_seq: u32,
    cleanup_flag: bool,
    clients: HashMap<i32, (u32, Channel)>,
    accepted: AcceptQueue,
}

impl TcpServer {
    fn new() -> TcpServer {
        TcpServer {
            settings: Settings {
                af: AddressFamily::Unspec,
                read_window: DEFAULT_READ_WINDOW as usize,
                buffer_size: DEFAULT_BUFFER as usize,
                keepalive: true,
                sndbuf: 0,
                rcvbuf: 0,
                timestamping: false,
            },
            endpoint: None,
            addr_seq: 0,
            cleanup_flag: false,
            clients: HashMap::new(),
            accepted: Rc::default(),
        }
    }

    fn bind(&mut self, base: &mut Base, addr: &SockAddr, index: usize) -> Result<()> {
        let domain = addr.domain();
        let sock = Socket::new(domain, Type::STREAM, None)?;
        sock.set_nonblocking(true)?;
        if domain != Domain::UNIX {
            sock.set_reuse_address(true)?;
            if self.settings.keepalive {
                sock.set_keepalive(true)?;
            }
        }
        sock.bind(addr)?;
        sock.listen(LISTEN_BACKLOG)?;
        tracing::info!(channel = %base.name(), addr = ?addr.as_socket(), "listening");
        if index == 0 {
            // With an ephemeral bind the caller needs the real port.
            if let Some(local) = sock.local_addr()?.as_socket() {
                let _ = base.config_info().set("port", &local.port().to_string());
            }
        }
        let listener = TcpListener {
            sock: Some(sock),
            accepted: self.accepted.clone(),
        };
        let name = format!("{}/listen/{}", base.name(), index);
        let child = base.context().spawn(&name, Box::new(listener));
        base.child_add(&child, &format!("listen/{}", index))?;
        child.open(&Config::new())?;
        Ok(())
    }

    fn cleanup(&mut self, base: &mut Base) {
        if !self.cleanup_flag {
            return;
        }
        let dead: Vec<i32> = self
            .clients
            .iter()
            .filter(|(_, (_, c))| matches!(c.state(), State::Error | State::Closed))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in dead {
            if let Some((_, channel)) = self.clients.remove(&fd) {
                tracing::debug!(channel = %base.name(), fd, "cleanup client");
                let _ = base.child_del(&channel);
            }
        }
        self.cleanup_flag = false;
    }

    fn on_accept(&mut self, base: &mut Base) -> Result<()> {
        let Some((sock, peer)) = self.accepted.borrow_mut().pop_front() else {
            return Ok(());
        };
        if base.state() != State::Active {
            tracing::debug!(
                channel = %base.name(),
                state = %base.state(),
                "dropping incoming connection, server is not active"
            );
            drop(sock);
            return Ok(());
        }
        self.settings.apply(&sock)?;
        let fd = sock.as_raw_fd();
        self.addr_seq += 1;
        let addr = ((self.addr_seq as u64) << 32) | fd as u32 as u64;
        let mut core = SocketCore::new(
            self.settings.read_window,
            self.settings.buffer_size,
            self.settings.timestamping,
        );
        core.sock = Some(sock);
        core.addr = addr;
        let name = format!("{}/{}", base.name(), fd);
        let child = base.context().spawn(&name, Box::new(TcpSocket { core }));
        // An earlier connection may have used this fd; its channel is
        // already dead and waiting for cleanup.
        if let Some((_, old)) = self.clients.remove(&fd) {
            let _ = base.child_del(&old);
        }
        base.child_add(&child, &format!("client/{}", fd))?;
        self.clients.insert(fd, (self.addr_seq, child.clone()));
        child.open(&Config::new())?;

        let connect = scheme::Connect::from_addr(peer.as_socket());
        base.callback(
            Msg::control(scheme::CONNECT)
                .with_addr(addr)
                .with_data(connect.encode()),
        );
        Ok(())
    }

    fn lookup(&self, addr: u64) -> Result<&Channel> {
        let fd = (addr & 0xffff_ffff) as i32;
        let seq = (addr >> 32) as u32;
        let (have_seq, channel) = self
            .clients
            .get(&fd)
            .ok_or_else(|| Error::protocol(format!("address not found: {}/{}", fd, seq)))?;
        if *have_seq != seq {
            return Err(Error::protocol(format!(
                "stale address: seq {} != {}",
                seq, have_seq
            )));
        }
        Ok(channel)
    }
}

impl ChannelImpl for TcpServer {
    fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&Channel>) -> Result<()> {
        self.settings = Settings::from_url(url)?;
        let host = url.host();
        if host.is_empty() {
            return Err(Error::failed("tcp server needs an address"));
        }
        self.endpoint = Some(parse_endpoint(&host, self.settings.af)?);
        let _ = base;
        Ok(())
    }

    fn open(&mut self, base: &mut Base, _params: &Config) -> Result<()> {
        self.cleanup_flag = false;
        self.addr_seq = 0;
        let ep = self
            .endpoint
            .clone()
            .ok_or_else(|| Error::failed("no endpoint"))?;
        if let Endpoint::Unix(path) = &ep {
            // A previous instance may have left its socket file behind.
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
        let addrs = resolve(&ep, self.settings.af)?;
        for (i, addr) in addrs.iter().enumerate() {
            self.bind(base, addr, i)?;
        }
        Ok(())
    }

    fn close(&mut self, base: &mut Base, force: bool) -> Result<()> {
        let _ = force;
        for (_, (_, channel)) in self.clients.drain() {
            let _ = base.child_del(&channel);
            channel.close(true);
        }
        // Only the listeners are left as children; they do not survive a
        // close, fresh ones are bound on the next open.
        for listener in base.children() {
            let _ = base.child_del(&listener);
            listener.close(true);
        }
        if let Some(Endpoint::Unix(path)) = &self.endpoint {
            tracing::info!(channel = %base.name(), path = %path.display(), "unlink unix socket");
            let _ = std::fs::remove_file(path);
        }
        self.accepted.borrow_mut().clear();
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        let _ = base;
        let channel = self.lookup(msg.addr)?;
        channel.post(msg)
    }

    fn on_child(&mut self, base: &mut Base, tag: &str, child: &Channel, msg: &Msg) -> Result<()> {
        self.cleanup(base);
        if tag.starts_with("listen") {
            match msg.msg_type {
                MsgType::Data => return self.on_accept(base),
                MsgType::State => {
                    if msg.as_state() == Some(State::Error) {
                        base.state_fail("listening socket failed");
                    }
                }
                _ => {}
            }
            return Ok(());
        }
        // Connection children.
        match msg.msg_type {
            MsgType::Data => base.callback_data(msg.clone()),
            MsgType::Control => base.callback(msg.clone()),
            MsgType::State => match msg.as_state() {
                Some(State::Closing) | Some(State::Error) => {
                    self.cleanup_flag = true;
                    let addr = self
                        .clients
                        .iter()
                        .find(|(_, (_, c))| c.ptr_eq(child))
                        .map(|(fd, (seq, _))| ((*seq as u64) << 32) | *fd as u32 as u64);
                    if let Some(addr) = addr {
                        if msg.as_state() == Some(State::Closing) {
                            base.callback(Msg::control(scheme::DISCONNECT).with_addr(addr));
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }
}

/// Connecting client.
struct TcpClient {
    settings: Settings,
    endpoint: Option<Endpoint>,
    core: SocketCore,
    peer: Option<SockAddr>,
}

impl TcpClient {
    fn new() -> TcpClient {
        TcpClient {
            settings: Settings {
                af: AddressFamily::Unspec,
                read_window: DEFAULT_READ_WINDOW as usize,
                buffer_size: DEFAULT_BUFFER as usize,
                keepalive: true,
                sndbuf: 0,
                rcvbuf: 0,
                timestamping: false,
            },
            endpoint: None,
            core: SocketCore::new(
                DEFAULT_READ_WINDOW as usize,
                DEFAULT_BUFFER as usize,
                false,
            ),
            peer: None,
        }
    }

    fn on_connect(&mut self, base: &mut Base) -> Result<()> {
        tracing::info!(channel = %base.name(), "connected");
        base.update_dcaps(DCaps::POLLIN, DCaps::POLLOUT);
        base.set_state(State::Active)?;
        let connect =
            scheme::Connect::from_addr(self.peer.as_ref().and_then(|p| p.as_socket()));
        base.callback(Msg::control(scheme::CONNECT).with_data(connect.encode()));
        Ok(())
    }

    fn process_connect(&mut self, base: &mut Base) -> Result<bool> {
        let sock = self.core.sock()?;
        if let Some(err) = sock.take_error()? {
            return Err(Error::failed(format!("connect failed: {}", err)));
        }
        match sock.peer_addr() {
            Ok(_) => {
                self.on_connect(base)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl ChannelImpl for TcpClient {
    fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&Channel>) -> Result<()> {
        self.settings = Settings::from_url(url)?;
        self.core = SocketCore::new(
            self.settings.read_window,
            self.settings.buffer_size,
            self.settings.timestamping,
        );
        self.core.emit_disconnect = true;
        base.open_policy = OpenPolicy::Manual;
        let host = url.host();
        if !host.is_empty() {
            self.endpoint = Some(parse_endpoint(&host, self.settings.af)?);
        } else {
            tracing::debug!(channel = %base.name(), "connection address expected in open parameters");
        }
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        let ep = match params.get("host")? {
            Some(host) => parse_endpoint(&host, self.settings.af)?,
            None => self
                .endpoint
                .clone()
                .ok_or_else(|| Error::failed("no remote address: need 'host' open parameter"))?,
        };
        let addrs = resolve(&ep, self.settings.af)?;
        let addr = &addrs[0];
        let sock = Socket::new(addr.domain(), Type::STREAM, None)?;
        self.settings.apply(&sock)?;
        base.set_fd(Some(sock.as_raw_fd()));
        tracing::info!(channel = %base.name(), addr = ?addr.as_socket(), "connecting");
        let pending = match sock.connect(addr) {
            Ok(()) => false,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(e) => return Err(e.into()),
        };
        self.core.sock = Some(sock);
        self.peer = Some(addr.clone());
        if pending {
            base.update_dcaps(DCaps::POLLOUT, DCaps::empty());
            return Ok(());
        }
        self.on_connect(base)
    }

    fn close(&mut self, base: &mut Base, _force: bool) -> Result<()> {
        if let Some(sock) = self.core.sock.take() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        self.core.pending.clear();
        base.set_fd(None);
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Data => self.core.post_data(base, msg),
            MsgType::Control => self.core.handle_control(base, msg),
            _ => Ok(()),
        }
    }

    fn process(&mut self, base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        if base.state() == State::Opening {
            return self.process_connect(base);
        }
        self.core.process(base)
    }
}

/// URL-level dispatcher: `mode=server` listens, everything else connects.
pub struct Tcp {
    inner: Option<Box<dyn ChannelImpl>>,
}

impl Tcp {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::new(Tcp { inner: None })
    }

    fn inner(&mut self) -> Result<&mut Box<dyn ChannelImpl>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::failed("tcp channel is not initialized"))
    }
}

impl ChannelImpl for Tcp {
    fn init(&mut self, base: &mut Base, url: &Url, master: Option<&Channel>) -> Result<()> {
        let mut inner: Box<dyn ChannelImpl> = match url.get("mode").as_deref() {
            Some("server") => Box::new(TcpServer::new()),
            None | Some("client") => Box::new(TcpClient::new()),
            Some(other) => return Err(Error::failed(format!("invalid mode '{}'", other))),
        };
        inner.init(base, url, master)?;
        self.inner = Some(inner);
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        self.inner()?.open(base, params)
    }

    fn close(&mut self, base: &mut Base, force: bool) -> Result<()> {
        self.inner()?.close(base, force)
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        self.inner()?.post(base, msg)
    }

    fn process(&mut self, base: &mut Base, timeout: Duration, flags: u32) -> Result<bool> {
        self.inner()?.process(base, timeout, flags)
    }

    fn on_child(&mut self, base: &mut Base, tag: &str, child: &Channel, msg: &Msg) -> Result<()> {
        self.inner()?.on_child(base, tag, child, msg)
    }
}
