//! One side of an RPC link.
//!
//! An endpoint owns the registry of groups it serves, the callback and
//! listener tables, the state of calls it has outstanding, and a worker
//! thread. The transport upcalls [`Receiver::on_receive`] from its own
//! context, which only routes:
//!
//! | Frame              | Goes to                                          |
//! |--------------------|--------------------------------------------------|
//! | Response / Error   | pending call (slot + wake, or async completion)  |
//! | Command            | blocked caller if a sync call is pending, else worker |
//! | Event              | worker                                           |
//!
//! Handlers, completions and listeners never run while a table or link
//! lock is held. At most one thread dispatches for the link at a time: the
//! worker and the blocked caller hand dispatch back and forth through the
//! link state, and only the thread holding it may nest.
//!
//! Once stopped, an endpoint releases whatever still arrives and answers
//! commands that expect a reply with an `Error` frame.

use core::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures_lite::future;
use log::{debug, info, warn};

use super::callback::{CALLBACK_SLOTS, CallbackHandle, CallbackTable, INVOKE_CALLBACK, callback_group};
use super::channels::{Conversation, DispatchGate, Inbound, WorkItem, WorkQueue};
use super::codec::{CodecError, Decoder, Encoder};
use super::dispatch::{self, STATUS_CAPACITY};
use super::frame::{Header, NO_CORRELATION, PacketType};
use super::invoke::{self, Completion, LinkState, Reply, Routed};
use super::notify::{ListenerId, ListenerStats, ListenerTable};
use super::registry::{CALLBACK_GROUP, Group, Registry, RegistryBuilder};
use super::transport::{Receiver, RxBuffer, Transport, TxBuffer};
use crate::config::{ConfigError, EndpointConfig};
use crate::error::{
    Error, ErrorReport, ErrorSource, ProtocolError, RegistryError, ResourceError, Status, TransportError,
};

/// Observer for failures that have no caller to return to.
pub type ErrorHook = Box<dyn Fn(&ErrorReport) + Send + Sync>;

// ── Builder ───────────────────────────────────────────────────

pub struct EndpointBuilder {
    name: &'static str,
    transport: Arc<dyn Transport>,
    config: EndpointConfig,
    registry: RegistryBuilder,
    on_error: Option<ErrorHook>,
}

impl EndpointBuilder {
    /// Name used in log lines.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn config(mut self, config: EndpointConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn group(mut self, group: Group) -> Result<Self, RegistryError> {
        self.registry.register(group)?;
        Ok(self)
    }

    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Freeze the registry, bind the transport, start the worker and run
    /// every group's init hook.
    pub fn start(mut self) -> Result<Endpoint, Error> {
        self.registry.register_builtin(callback_group())?;
        let registry = self.registry.build();
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            name: self.name,
            config: self.config,
            transport: self.transport,
            registry,
            callbacks: CallbackTable::new(),
            listeners: ListenerTable::new(),
            link: BlockingMutex::new(RefCell::new(LinkState::new())),
            conversation: Conversation::new(),
            gate: DispatchGate::new(),
            work: Arc::new(WorkQueue::new()),
            on_error: self.on_error,
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
        });

        let receiver: Weak<dyn Receiver> = Arc::downgrade(&inner) as Weak<dyn Receiver>;
        inner.transport.bind(receiver);

        let weak = Arc::downgrade(&inner);
        let work = Arc::clone(&inner.work);
        let name = inner.name;
        let handle = std::thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || worker(name, &work, &weak))
            .map_err(|e| {
                warn!("RPC[{}]: worker failed to start: {}", name, e);
                Error::NotRunning
            })?;
        if let Ok(mut slot) = inner.worker.lock() {
            *slot = Some(handle);
        }

        let endpoint = Endpoint { inner };
        for group in endpoint.inner.registry.groups() {
            if let Some(hook) = group.init_hook() {
                debug!("RPC[{}]: init group {} ({})", name, group.id(), group.name());
                hook(&endpoint);
            }
        }
        info!(
            "RPC[{}]: started with {} group(s)",
            name,
            endpoint.inner.registry.len()
        );
        Ok(endpoint)
    }
}

// ── Endpoint ──────────────────────────────────────────────────

/// Handle to a running endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    me: Weak<Inner>,
    name: &'static str,
    config: EndpointConfig,
    transport: Arc<dyn Transport>,
    registry: Registry,
    callbacks: CallbackTable<CALLBACK_SLOTS>,
    listeners: ListenerTable,
    link: BlockingMutex<CriticalSectionRawMutex, RefCell<LinkState>>,
    conversation: Conversation,
    gate: DispatchGate,
    work: Arc<WorkQueue>,
    on_error: Option<ErrorHook>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn builder(transport: Arc<dyn Transport>) -> EndpointBuilder {
        EndpointBuilder {
            name: "rpc",
            transport,
            config: EndpointConfig::default(),
            registry: RegistryBuilder::new(),
            on_error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn callbacks(&self) -> &CallbackTable<CALLBACK_SLOTS> {
        &self.inner.callbacks
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.inner.listeners
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// A call is outstanding on the link.
    pub fn is_call_pending(&self) -> bool {
        self.inner.link.lock(|l| l.borrow().is_pending())
    }

    /// Current depth of nested synchronous calls.
    pub fn nesting_depth(&self) -> usize {
        self.inner.link.lock(|l| l.borrow().depth())
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.is_running() { Ok(()) } else { Err(Error::NotRunning) }
    }

    // ── Client role ──────────────────────────────────────────

    /// Synchronous call. Blocks until the correlated response arrives or
    /// `response_timeout_ms` passes. While blocked, commands the peer sends
    /// on this link are dispatched on the calling thread.
    pub fn call<F>(&self, group: u8, command: u8, estimate: usize, encode: F) -> Result<Reply, Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        let (correlation, deadline) = self.start_call(group, command, estimate, encode)?;
        self.finish_call(correlation, deadline)
    }

    /// Encode, register and send a synchronous call. Transport failures
    /// here have already been reported.
    fn start_call<F>(&self, group: u8, command: u8, estimate: usize, encode: F) -> Result<(u16, Instant), Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        self.ensure_running()?;
        self.inner.expire_async();

        let mut tx = self.alloc_tx(Header::new(PacketType::Command, group, command, NO_CORRELATION), estimate)?;
        tx.write_payload(encode)?;

        let me = std::thread::current().id();
        let max_nesting = usize::from(self.inner.config.max_nesting);
        let correlation = self
            .inner
            .link
            .lock(|l| l.borrow_mut().begin_sync(me, max_nesting, group, command))?;
        tx.set_header(Header::new(PacketType::Command, group, command, correlation));
        let deadline = Instant::now() + Duration::from_millis(u64::from(self.inner.config.response_timeout_ms));

        if let Err(e) = self.send(tx, group, command, PacketType::Command) {
            self.inner.link.lock(|l| l.borrow_mut().abandon(correlation));
            self.inner.finish_sync();
            return Err(e);
        }
        debug!("RPC[{}]: call {}/{} corr={}", self.name(), group, command, correlation);
        Ok((correlation, deadline))
    }

    fn finish_call(&self, correlation: u16, deadline: Instant) -> Result<Reply, Error> {
        let outcome = self.wait(correlation, deadline);
        self.inner.finish_sync();
        let (header, frame) = outcome?;
        Reply::from_frame(header, frame)
    }

    /// Synchronous call whose results are decoded by `decode`. The status
    /// is passed along; results are only present when it is `OK`.
    pub fn call_with<T, F, D>(
        &self,
        group: u8,
        command: u8,
        estimate: usize,
        encode: F,
        decode: D,
    ) -> Result<T, Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
        D: FnOnce(Status, &mut Decoder<'_>) -> Result<T, CodecError>,
    {
        let reply = self.call(group, command, estimate, encode)?;
        invoke::decode_reply(reply, decode)
    }

    /// [`call_with`](Self::call_with) for callers with nowhere to return an
    /// error, such as a proxied callback. Failures go to the error hook
    /// instead; the caller only learns whether results came back.
    pub fn call_no_err<T, F, D>(&self, group: u8, command: u8, estimate: usize, encode: F, decode: D) -> Option<T>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
        D: FnOnce(Status, &mut Decoder<'_>) -> Result<T, CodecError>,
    {
        let (correlation, deadline) = match self.start_call(group, command, estimate, encode) {
            Ok(started) => started,
            Err(e) => {
                if !matches!(e, Error::Transport(_)) {
                    self.report(ErrorSource::Send, group, command, Some(PacketType::Command), e);
                }
                return None;
            }
        };
        let outcome = self
            .finish_call(correlation, deadline)
            .and_then(|reply| invoke::decode_reply(reply, decode));
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(ErrorSource::Receive, group, command, Some(PacketType::Response), e);
                None
            }
        }
    }

    /// Asynchronous call. `completion` runs on the receive path with the
    /// reply, or with `Timeout` once `async_timeout_ms` has passed and the
    /// link sees further activity.
    pub fn call_async<F, C>(
        &self,
        group: u8,
        command: u8,
        estimate: usize,
        encode: F,
        completion: C,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
        C: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        self.ensure_running()?;
        self.inner.expire_async();

        let mut tx = self.alloc_tx(Header::new(PacketType::Command, group, command, NO_CORRELATION), estimate)?;
        tx.write_payload(encode)?;

        let deadline = Instant::now() + Duration::from_millis(u64::from(self.inner.config.async_timeout_ms));
        let completion: Completion = Box::new(completion);
        let correlation = self
            .inner
            .link
            .lock(|l| l.borrow_mut().begin_async(group, command, completion, deadline))
            .map_err(|(e, _)| e)?;
        tx.set_header(Header::new(PacketType::Command, group, command, correlation));

        if let Err(e) = self.send(tx, group, command, PacketType::Command) {
            // Never sent: the caller learns it here, not from the completion.
            self.inner.link.lock(|l| l.borrow_mut().abandon(correlation));
            return Err(e);
        }
        debug!("RPC[{}]: async call {}/{} corr={}", self.name(), group, command, correlation);
        Ok(())
    }

    /// Fire-and-forget command. Not subject to the one-call rule.
    pub fn call_one_way<F>(&self, group: u8, command: u8, estimate: usize, encode: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        self.ensure_running()?;
        let mut tx = self.alloc_tx(Header::new(PacketType::Command, group, command, NO_CORRELATION), estimate)?;
        tx.write_payload(encode)?;
        self.send(tx, group, command, PacketType::Command)
    }

    /// Emit an event for listeners of `(group, version)` on the peer.
    pub fn emit<F>(&self, group: u8, version: u8, estimate: usize, encode: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        self.ensure_running()?;
        let mut tx = self.alloc_tx(Header::new(PacketType::Event, group, version, NO_CORRELATION), estimate)?;
        tx.write_payload(encode)?;
        self.send(tx, group, version, PacketType::Event)
    }

    /// Run a callback the peer registered, by the handle it gave us.
    pub fn invoke_callback<F>(&self, handle: CallbackHandle, estimate: usize, encode: F) -> Result<Reply, Error>
    where
        F: FnOnce(&mut Encoder<'_>) -> Result<(), CodecError>,
    {
        self.call(CALLBACK_GROUP, INVOKE_CALLBACK, STATUS_CAPACITY + estimate, |enc| {
            enc.encode_u32(handle.0)?;
            encode(enc)
        })
    }

    /// Block until the reply for `correlation` is in its slot, dispatching
    /// commands that arrive in the meantime.
    fn wait(&self, correlation: u16, deadline: Instant) -> Result<(Header, RxBuffer), Error> {
        loop {
            if let Some(reply) = self.inner.link.lock(|l| l.borrow_mut().take_reply(correlation)) {
                return reply;
            }
            let now = Instant::now();
            if now >= deadline {
                let outcome = self.inner.link.lock(|l| l.borrow_mut().time_out(correlation));
                if matches!(outcome, Err(Error::Timeout)) {
                    warn!("RPC[{}]: call corr={} timed out", self.name(), correlation);
                }
                return outcome;
            }
            let remaining = deadline - now;
            let next = future::block_on(future::or(
                async { Some(self.inner.conversation.receive().await) },
                async {
                    Timer::after(remaining).await;
                    None
                },
            ));
            match next {
                Some(Inbound::Command(frame)) => self.inner.dispatch_parked(self, frame),
                Some(Inbound::Wake) | None => {}
            }
        }
    }

    // ── Callbacks and listeners ──────────────────────────────

    pub fn listen<T, D, H>(&self, group: u8, version: u8, decode: D, handler: H) -> Result<ListenerId, Error>
    where
        D: Fn(&mut Decoder<'_>) -> Result<T, CodecError> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.register(
            group,
            version,
            Arc::new(move |dec: &mut Decoder<'_>| {
                handler(decode(dec)?);
                Ok(())
            }),
        )?;
        debug!("EVT[{}]: listening on group {} v{}", self.name(), group, version);
        Ok(id)
    }

    pub fn unlisten(&self, id: ListenerId) -> Result<(), Error> {
        Ok(self.inner.listeners.deregister(id)?)
    }

    pub fn pause_listener(&self, id: ListenerId) -> Result<(), Error> {
        Ok(self.inner.listeners.pause(id)?)
    }

    pub fn resume_listener(&self, id: ListenerId) -> Result<(), Error> {
        Ok(self.inner.listeners.resume(id)?)
    }

    pub fn listener_stats(&self, id: ListenerId) -> Option<ListenerStats> {
        self.inner.listeners.stats(id)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Run deinit hooks, fail outstanding calls and stop the worker.
    /// Further calls return `NotRunning`. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for group in self.inner.registry.groups() {
            if let Some(hook) = group.deinit_hook() {
                debug!("RPC[{}]: deinit group {} ({})", self.name(), group.id(), group.name());
                hook(self);
            }
        }
        self.inner.fail_pending(Error::NotRunning);
        let handle = self.inner.worker.lock().ok().and_then(|mut h| h.take());
        // A full queue keeps the worker busy; it sees `running` on its next frame.
        let _ = self.inner.work.try_send(WorkItem::Shutdown);
        // From a handler on the worker there is nothing to join; the
        // worker drains its queue on exit.
        if let Some(handle) = handle.filter(|h| h.thread().id() != std::thread::current().id()) {
            if handle.join().is_err() {
                warn!("RPC[{}]: worker panicked", self.name());
            }
            self.inner.drain();
        }
        info!("RPC[{}]: stopped", self.name());
    }

    // ── Frame plumbing (crate-internal) ──────────────────────

    /// Allocate a frame with `header` and room for `payload` bytes.
    pub(crate) fn alloc_tx(&self, header: Header, payload: usize) -> Result<TxBuffer, Error> {
        match self.inner.transport.alloc_tx(payload) {
            Ok(mut tx) => {
                tx.set_header(header);
                Ok(tx)
            }
            Err(e) => {
                self.report(ErrorSource::Send, header.group, header.id, Some(header.packet), e.into());
                Err(e.into())
            }
        }
    }

    pub(crate) fn send(&self, tx: TxBuffer, group: u8, id: u8, packet: PacketType) -> Result<(), Error> {
        self.inner.transport.send(tx).map_err(|e| {
            self.report(ErrorSource::Send, group, id, Some(packet), e.into());
            Error::Transport(e)
        })
    }

    /// Status-only response to `request`.
    pub(crate) fn send_status(&self, request: Header, status: Status) {
        let header = request.reply(PacketType::Response);
        if let Ok(mut tx) = self.alloc_tx(header, STATUS_CAPACITY) {
            if tx.write_payload(|e| e.encode_i32(status.0)).is_ok() {
                let _ = self.send(tx, header.group, header.id, PacketType::Response);
            }
        }
    }

    /// `Error` frame answering `request`.
    pub(crate) fn send_error(&self, request: Header, error: ProtocolError) {
        let header = request.reply(PacketType::Error);
        if let Ok(mut tx) = self.alloc_tx(header, 1) {
            if tx.write_payload(|e| e.encode_u8(error.code())).is_ok() {
                let _ = self.send(tx, header.group, header.id, PacketType::Error);
            }
        }
    }

    pub(crate) fn report(&self, source: ErrorSource, group: u8, id: u8, packet: Option<PacketType>, error: Error) {
        self.inner.report(&ErrorReport { source, group, id, packet, error });
    }

    pub(crate) fn report_malformed(&self, frame: &RxBuffer, error: ProtocolError) {
        let raw = frame.frame();
        let group = raw.get(1).copied().unwrap_or(0);
        let id = raw.get(2).copied().unwrap_or(0);
        self.report(ErrorSource::Receive, group, id, None, error.into());
    }

    pub(crate) fn route_reply(&self, header: Header, frame: RxBuffer) {
        self.inner.route_reply(header, frame);
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ── Receive path ──────────────────────────────────────────────

impl Inner {
    fn endpoint(&self) -> Option<Endpoint> {
        self.me.upgrade().map(|inner| Endpoint { inner })
    }

    fn report(&self, report: &ErrorReport) {
        warn!("RPC[{}]: {}", self.name, report);
        if let Some(hook) = &self.on_error {
            hook(report);
        }
    }

    fn report_error(&self, source: ErrorSource, header: Header, error: Error) {
        self.report(&ErrorReport {
            source,
            group: header.group,
            id: header.id,
            packet: Some(header.packet),
            error,
        });
    }

    /// Complete overdue asynchronous calls with `Timeout`.
    fn expire_async(&self) {
        let expired = self.link.lock(|l| l.borrow_mut().expire(Instant::now()));
        for call in expired {
            warn!(
                "RPC[{}]: async call {}/{} corr={} timed out",
                self.name, call.group, call.command, call.correlation
            );
            (call.completion)(Err(Error::Timeout));
        }
    }

    fn route_reply(&self, header: Header, frame: RxBuffer) {
        match self.link.lock(|l| l.borrow_mut().route(header, frame)) {
            Routed::Stored => {
                // The waiter checks its slot on every pass, so any item it
                // is yet to take is enough; a full conversation drops the wake.
                let _ = self.conversation.try_send(Inbound::Wake);
            }
            Routed::Complete(completion, header, frame) => {
                debug!("RPC[{}]: async reply corr={}", self.name, header.correlation);
                completion(Reply::from_frame(header, frame));
            }
            Routed::Unmatched { late: true, frame } => {
                debug!("RPC[{}]: late reply corr={} discarded", self.name, header.correlation);
                frame.release();
            }
            Routed::Unmatched { late: false, frame } => {
                frame.release();
                self.report_error(ErrorSource::Receive, header, ProtocolError::Uncorrelated.into());
            }
        }
    }

    /// Queue a frame for the worker. Call under the link lock.
    fn enqueue(&self, link: &mut LinkState, frame: RxBuffer) -> Result<(), ()> {
        self.work.try_send(WorkItem::Frame(frame)).map_err(|_| ())?;
        link.enqueue();
        Ok(())
    }

    /// Hand a command to the blocked caller if it may run it now, else to
    /// the worker. Decided and queued under the link lock so the caller
    /// can't finish in between and strand the frame.
    fn route_command(&self, header: Header, frame: RxBuffer) {
        let queued = self.link.lock(|l| {
            let mut l = l.borrow_mut();
            if l.runs_inline() {
                self.conversation.try_send(Inbound::Command(frame)).map_err(|_| ())?;
                l.park();
                Ok(())
            } else {
                self.enqueue(&mut l, frame)
            }
        });
        if queued.is_err() {
            self.reject_command(header);
        }
    }

    fn reject_command(&self, header: Header) {
        self.report_error(ErrorSource::Receive, header, ResourceError::QueueFull.into());
        if header.expects_reply() {
            if let Some(ep) = self.endpoint() {
                ep.send_error(header, ProtocolError::NoResources);
            }
        }
    }

    /// Run a command parked for the thread blocked in `wait`.
    fn dispatch_parked(&self, endpoint: &Endpoint, frame: RxBuffer) {
        let me = std::thread::current().id();
        if self.link.lock(|l| l.borrow_mut().enter_dispatch(me, true)) {
            dispatch::dispatch(endpoint, frame);
            self.leave_dispatch(false);
            return;
        }
        // Dispatch moved to the worker meanwhile; queue behind it.
        let header = frame.header();
        if self.link.lock(|l| self.enqueue(&mut l.borrow_mut(), frame)).is_err() {
            if let Ok(header) = header {
                self.reject_command(header);
            }
        }
    }

    /// Block the worker until it holds dispatch.
    fn enter_from_queue(&self) {
        let me = std::thread::current().id();
        while !self.link.lock(|l| l.borrow_mut().enter_dispatch(me, false)) {
            future::block_on(self.gate.receive());
        }
    }

    fn leave_dispatch(&self, queued: bool) {
        if self.link.lock(|l| l.borrow_mut().leave_dispatch(queued)) {
            let _ = self.gate.try_send(());
        }
    }

    /// After a synchronous call returns: once no synchronous caller is left,
    /// commands still parked in the conversation go to the worker.
    fn finish_sync(&self) {
        let running = self.running.load(Ordering::Acquire);
        let stranded = self.link.lock(|l| {
            let mut l = l.borrow_mut();
            if l.has_sync_waiter() {
                return 0;
            }
            let mut dropped = 0u32;
            while let Ok(item) = self.conversation.try_receive() {
                if let Inbound::Command(frame) = item {
                    if !running || self.enqueue(&mut l, frame).is_err() {
                        dropped += 1;
                    }
                }
            }
            l.unpark_all();
            dropped
        });
        let _ = self.gate.try_send(());
        if stranded > 0 {
            warn!("RPC[{}]: {} parked command(s) dropped", self.name, stranded);
        }
    }

    /// Release every frame still queued. Only once the worker is gone.
    fn drain(&self) {
        let mut dropped = 0u32;
        self.link.lock(|l| {
            let mut l = l.borrow_mut();
            while let Ok(item) = self.work.try_receive() {
                if matches!(item, WorkItem::Frame(_)) {
                    l.dequeue();
                    dropped += 1;
                }
            }
            while let Ok(item) = self.conversation.try_receive() {
                if matches!(item, Inbound::Command(_)) {
                    dropped += 1;
                }
            }
            l.unpark_all();
        });
        if dropped > 0 {
            debug!("RPC[{}]: {} frame(s) released at shutdown", self.name, dropped);
        }
    }

    /// Frames arriving after shutdown: release them, and tell a peer
    /// waiting on a command not to.
    fn refuse(&self, frame: RxBuffer) {
        let Ok(header) = frame.header() else {
            return;
        };
        frame.release();
        debug!(
            "RPC[{}]: stopped, {:?} {}/{} refused",
            self.name, header.packet, header.group, header.id
        );
        if header.packet == PacketType::Command && header.expects_reply() {
            if let Some(ep) = self.endpoint() {
                ep.send_error(header, ProtocolError::Stopped);
            }
        }
    }

    /// Fail everything outstanding with `error`.
    fn fail_pending(&self, error: Error) {
        let completions = self.link.lock(|l| l.borrow_mut().fail_all(error));
        let _ = self.conversation.try_send(Inbound::Wake);
        for completion in completions {
            completion(Err(error));
        }
    }
}

impl Receiver for Inner {
    fn on_receive(&self, frame: RxBuffer) {
        if !self.running.load(Ordering::Acquire) {
            self.refuse(frame);
            return;
        }
        self.expire_async();
        let header = match frame.header() {
            Ok(h) => h,
            Err(e) => {
                if let Some(ep) = self.endpoint() {
                    ep.report_malformed(&frame, e);
                }
                return;
            }
        };
        match header.packet {
            PacketType::Response | PacketType::Error => self.route_reply(header, frame),
            PacketType::Command => self.route_command(header, frame),
            PacketType::Event => {
                if self.link.lock(|l| self.enqueue(&mut l.borrow_mut(), frame)).is_err() {
                    self.report_error(ErrorSource::Receive, header, ResourceError::QueueFull.into());
                }
            }
        }
    }

    fn on_dropped(&self, head: &[u8], error: TransportError) {
        let packet = head.first().and_then(|&b| PacketType::from_u8(b));
        let group = head.get(1).copied().unwrap_or(0);
        let id = head.get(2).copied().unwrap_or(0);
        self.report(&ErrorReport { source: ErrorSource::Transport, group, id, packet, error: error.into() });
    }

    fn on_link_down(&self) {
        warn!("RPC[{}]: link down", self.name);
        self.fail_pending(Error::Transport(TransportError::LinkDown));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The worker holds only a weak handle; this lets it exit.
        let _ = self.work.try_send(WorkItem::Shutdown);
    }
}

fn worker(name: &'static str, work: &WorkQueue, endpoint: &Weak<Inner>) {
    debug!("RPC[{}]: worker running", name);
    loop {
        let WorkItem::Frame(frame) = future::block_on(work.receive()) else {
            break;
        };
        let Some(inner) = endpoint.upgrade() else { break };
        if !inner.running.load(Ordering::Acquire) {
            inner.link.lock(|l| l.borrow_mut().dequeue());
            break;
        }
        inner.enter_from_queue();
        let endpoint = Endpoint { inner };
        dispatch::dispatch(&endpoint, frame);
        endpoint.inner.leave_dispatch(true);
    }
    // Whatever is left belongs to a stopped endpoint.
    let mut dropped = 0u32;
    while let Ok(item) = work.try_receive() {
        if matches!(item, WorkItem::Frame(_)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!("RPC[{}]: worker released {} frame(s)", name, dropped);
    }
    debug!("RPC[{}]: worker stopped", name);
}
