//! The per-tunnel state machine: one control socket, one dispatch loop, one sub-connection
//! table. See `tunnel/mod.rs` for the opcode catalogue this dispatches.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{watch, Mutex, Notify},
};

use crate::tunnel::{
    allocator::{self, AllocatorError},
    notifier,
    protocol::{self, Opcode, ProtocolError},
    registry::Registry,
    subconn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Create,
    Init,
    Mapping,
}

/// The client's target service, also used as the server-side registry key material.
#[derive(Debug, Clone)]
pub struct Identity {
    pub sn: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Identity {
    pub fn key(&self) -> String {
        format!("<{}:{}:{}>", self.sn, self.ip, self.port)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("tunnel identity already registered by another tunnel")]
    DuplicateIdentity,
    #[error("init payload too short")]
    InitPayloadTooShort,
    #[error("init payload carries an empty serial number")]
    InitMissingSn,
    #[error("unexpected init frame on a client tunnel")]
    UnexpectedInit,
    #[error("framing: {0}")]
    Protocol(#[from] ProtocolError),
}

struct ConnSlot {
    write: OwnedWriteHalf,
    cancel: Arc<Notify>,
}

struct MappingState {
    status: Status,
    mport: u16,
    listener: Option<Arc<TcpListener>>,
    accept_task: Option<tokio::task::AbortHandle>,
    reaper_task: Option<tokio::task::AbortHandle>,
}

pub struct Tunnel {
    side: Side,
    tid: AtomicU32,
    identity: OnceLock<Identity>,
    key: OnceLock<String>,
    registry: Option<Arc<Registry>>,
    notifier_addr: Option<SocketAddr>,
    id_gen: Arc<AtomicU32>,
    writer: Mutex<OwnedWriteHalf>,
    state: Mutex<MappingState>,
    conns: Mutex<HashMap<u32, ConnSlot>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl Tunnel {
    pub fn new(
        side: Side,
        socket: TcpStream,
        registry: Option<Arc<Registry>>,
        notifier_addr: Option<SocketAddr>,
        id_gen: Arc<AtomicU32>,
    ) -> (Arc<Self>, OwnedReadHalf) {
        let tid = match side {
            Side::Server => id_gen.fetch_add(1, Ordering::Relaxed),
            Side::Client => 0,
        };
        let (read, write) = socket.into_split();

        let tunnel = Arc::new(Self {
            side,
            tid: AtomicU32::new(tid),
            identity: OnceLock::new(),
            key: OnceLock::new(),
            registry,
            notifier_addr,
            id_gen,
            writer: Mutex::new(write),
            state: Mutex::new(MappingState {
                status: Status::Create,
                mport: 0,
                listener: None,
                accept_task: None,
                reaper_task: None,
            }),
            conns: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });

        (tunnel, read)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn tid(&self) -> u32 {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn key(&self) -> Option<&str> {
        self.key.get().map(String::as_str)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// The client side knows its identity (the local target) from config before it ever talks
    /// to the server; set it once, before sending `Init`.
    pub fn set_client_identity(&self, identity: Identity) {
        let key = identity.key();
        let _ = self.identity.set(identity);
        let _ = self.key.set(key);
    }

    pub fn next_id(&self) -> u32 {
        self.id_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn status(&self) -> Status {
        self.state.lock().await.status
    }

    pub async fn mport(&self) -> u16 {
        self.state.lock().await.mport
    }

    pub async fn conn_count(&self) -> usize {
        self.conns.lock().await.len()
    }

    pub async fn send_frame(&self, op: Opcode, id: u32, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut w = self.writer.lock().await;
        protocol::write_frame(&mut *w, op, id, payload).await
    }

    pub(crate) async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Drive the reader loop until the control socket errors, the read deadline expires, or
    /// `shutdown` fires. Always tears the tunnel down on exit.
    pub async fn run(self: Arc<Self>, mut read: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        let breath = {
            let tunnel = self.clone();
            tokio::spawn(async move { tunnel.breath().await })
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = tokio::time::timeout(Duration::from_secs(30), protocol::read_frame(&mut read)) => {
                    match res {
                        Err(_elapsed) => {
                            tracing::warn!(tid = self.tid(), "tunnel: read deadline expired");
                            break;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(tid = self.tid(), err = %err, "tunnel: framing error");
                            break;
                        }
                        Ok(Ok((op, id, payload))) => {
                            if let Err(err) = self.dispatch(op, id, payload).await {
                                tracing::warn!(tid = self.tid(), err = %err, "tunnel: fatal dispatch error");
                                break;
                            }
                        }
                    }
                }
            }
        }

        breath.abort();
        self.close().await;
    }

    async fn breath(self: Arc<Self>) {
        loop {
            if self.send_frame(Opcode::Keep, 0, &[]).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, op: Opcode, id: u32, payload: Bytes) -> Result<(), DispatchError> {
        match op {
            Opcode::Init => self.handle_init(payload).await,
            Opcode::Open => {
                self.handle_open(id).await;
                Ok(())
            }
            Opcode::Data => {
                self.handle_data(id, &payload).await;
                Ok(())
            }
            Opcode::Close => {
                self.handle_close(id).await;
                Ok(())
            }
            Opcode::Getid => {
                self.handle_getid(id).await;
                Ok(())
            }
            Opcode::Start => {
                self.handle_start(id).await;
                Ok(())
            }
            Opcode::Stop => {
                self.handle_stop().await;
                Ok(())
            }
            Opcode::Keep => Ok(()),
        }
    }

    async fn handle_init(self: &Arc<Self>, payload: Bytes) -> Result<(), DispatchError> {
        if self.side == Side::Client {
            return Err(DispatchError::UnexpectedInit);
        }
        if payload.len() < 6 {
            return Err(DispatchError::InitPayloadTooShort);
        }
        let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
        let port = u16::from_be_bytes([payload[4], payload[5]]);
        let sn_bytes = &payload[6..];
        if sn_bytes.is_empty() {
            return Err(DispatchError::InitMissingSn);
        }
        let identity = Identity {
            sn: String::from_utf8_lossy(sn_bytes).into_owned(),
            ip,
            port,
        };
        let key = identity.key();

        if let Some(registry) = self.registry.clone() {
            registry
                .insert(key.clone(), self.clone())
                .await
                .map_err(|_| DispatchError::DuplicateIdentity)?;
        }

        // Only claim the identity once this tunnel actually holds the registry slot, so a
        // rejected duplicate never owns a `key` that `close()` could use to evict the incumbent.
        let _ = self.identity.set(identity);
        let _ = self.key.set(key.clone());
        self.state.lock().await.status = Status::Init;

        tracing::info!(key = %key, "tunnel: registered");
        Ok(())
    }

    async fn handle_open(self: &Arc<Self>, id: u32) {
        if self.side != Side::Client {
            return;
        }
        let Some(identity) = self.identity.get() else {
            return;
        };
        let addr = SocketAddr::V4(SocketAddrV4::new(identity.ip, identity.port));

        match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                self.register_conn(id, stream).await;
            }
            _ => {
                tracing::debug!(id, %addr, "tunnel: target dial failed");
                let _ = self.send_frame(Opcode::Close, id, &[]).await;
            }
        }
    }

    async fn handle_data(self: &Arc<Self>, id: u32, payload: &[u8]) {
        self.touch_activity().await;

        let mut conns = self.conns.lock().await;
        let write_failed = match conns.get_mut(&id) {
            Some(slot) => slot.write.write_all(payload).await.is_err(),
            None => return,
        };
        if write_failed {
            if let Some(slot) = conns.remove(&id) {
                drop(conns);
                slot.cancel.notify_one();
                let _ = self.send_frame(Opcode::Close, id, &[]).await;
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, id: u32) {
        let mut conns = self.conns.lock().await;
        if let Some(slot) = conns.remove(&id) {
            drop(conns);
            slot.cancel.notify_one();
        }
    }

    async fn handle_getid(self: &Arc<Self>, id: u32) {
        match self.side {
            Side::Server => {
                let tid = self.tid();
                let _ = self.send_frame(Opcode::Getid, tid, &[]).await;
            }
            Side::Client => {
                self.tid.store(id, Ordering::Relaxed);
            }
        }
    }

    async fn handle_start(self: &Arc<Self>, id: u32) {
        match self.side {
            Side::Server => {
                if let Err(err) = self.start_mapping().await {
                    tracing::warn!(tid = self.tid(), err = %err, "tunnel: mapping start failed");
                }
            }
            Side::Client => {
                self.state.lock().await.mport = id as u16;
                if let Some(identity) = self.identity.get() {
                    tracing::info!(mport = id, target = %format!("{}:{}", identity.ip, identity.port), "tunnel: mapping up");
                }
            }
        }
    }

    /// Server: tear down the mapping and notify. Client: the server owns the listener, so just
    /// clear the locally recorded port and log.
    async fn handle_stop(self: &Arc<Self>) {
        match self.side {
            Side::Server => self.stop_mapping().await,
            Side::Client => {
                let mport = {
                    let mut st = self.state.lock().await;
                    let mport = st.mport;
                    st.mport = 0;
                    mport
                };
                tracing::info!(mport, "tunnel: mapping stopped");
            }
        }
    }

    /// Register a freshly dialed/accepted socket under `id` and spawn its pump worker.
    ///
    /// The caller must insert into `conns` (done here) before the peer can possibly see any
    /// frame referencing `id` besides the one the caller is about to send, so that an incoming
    /// `Data`/`Close` for `id` always finds a live entry.
    pub(crate) async fn register_conn(self: &Arc<Self>, id: u32, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let cancel = Arc::new(Notify::new());
        self.conns.lock().await.insert(
            id,
            ConnSlot {
                write,
                cancel: cancel.clone(),
            },
        );

        let tunnel = self.clone();
        tokio::spawn(async move { subconn::run(tunnel, id, read, cancel).await });
    }

    /// Called by a sub-connection worker on local EOF/error. Removes the entry only if it is
    /// still present (a concurrent incoming `Close` may have already removed it) and, only then,
    /// tells the peer.
    pub(crate) async fn finish_conn(&self, id: u32) {
        let removed = self.conns.lock().await.remove(&id).is_some();
        if removed {
            let _ = self.send_frame(Opcode::Close, id, &[]).await;
        }
    }

    pub(crate) async fn send_open(&self, id: u32) -> Result<(), ProtocolError> {
        self.send_frame(Opcode::Open, id, &[]).await
    }

    /// Invoke the port allocator. Idempotent: if already mapped, returns the existing port.
    pub async fn start_mapping(self: &Arc<Self>) -> Result<u16, AllocatorError> {
        {
            let st = self.state.lock().await;
            if st.status == Status::Mapping {
                return Ok(st.mport);
            }
        }

        let (listener, port) = allocator::bind_random_port().await?;
        let listener = Arc::new(listener);

        {
            let mut st = self.state.lock().await;
            st.status = Status::Mapping;
            st.mport = port;
            st.listener = Some(listener.clone());
        }
        *self.last_activity.lock().await = Instant::now();

        let _ = self.send_frame(Opcode::Start, port as u32, &[]).await;

        let accept_task = {
            let tunnel = self.clone();
            let listener = listener.clone();
            tokio::spawn(async move { tunnel.accept_loop(listener).await })
        };
        let reaper_task = {
            let tunnel = self.clone();
            tokio::spawn(async move { tunnel.idle_reaper().await })
        };

        {
            let mut st = self.state.lock().await;
            st.accept_task = Some(accept_task.abort_handle());
            st.reaper_task = Some(reaper_task.abort_handle());
        }

        tracing::info!(mport = port, "tunnel: mapping started");
        Ok(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<TcpListener>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_id();
                    tracing::debug!(id, %peer, "tunnel: visitor accepted");
                    if self.send_open(id).await.is_err() {
                        return;
                    }
                    self.register_conn(id, stream).await;
                }
                Err(err) => {
                    tracing::warn!(err = %err, "tunnel: mapped listener accept failed");
                    return;
                }
            }
        }
    }

    async fn idle_reaper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let idle = self.last_activity.lock().await.elapsed() >= Duration::from_secs(60);
            let empty = self.conns.lock().await.is_empty();
            if idle && empty {
                self.stop_mapping().await;
                return;
            }
        }
    }

    /// Tear down the current mapping, if any: stop accepting, drop the listener, notify the
    /// peer and the bra-server, and return to `Init`. Safe to call when not mapped.
    pub async fn stop_mapping(self: &Arc<Self>) {
        let mport = {
            let mut st = self.state.lock().await;
            if st.status != Status::Mapping {
                return;
            }
            let mport = st.mport;
            st.status = Status::Init;
            st.mport = 0;
            st.listener = None;
            if let Some(h) = st.accept_task.take() {
                h.abort();
            }
            if let Some(h) = st.reaper_task.take() {
                h.abort();
            }
            mport
        };

        let _ = self.send_frame(Opcode::Stop, 0, &[]).await;
        tracing::info!(mport, "tunnel: mapping stopped");

        if let (Some(addr), Some(identity)) = (self.notifier_addr, self.identity.get()) {
            notifier::notify(addr, &identity.sn).await;
        }
    }

    /// Idempotent teardown: closes every sub-connection, deregisters from the registry, and
    /// shuts down the write half of the control socket. Safe to call more than once.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_mapping().await;

        if let Some(registry) = &self.registry {
            if let Some(key) = self.key.get() {
                registry.remove_if(key, self).await;
            }
        }

        let mut conns = self.conns.lock().await;
        for (_, slot) in conns.drain() {
            slot.cancel.notify_one();
        }
        drop(conns);

        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}
