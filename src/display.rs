//! Display server core
//!
//! [`Display`] owns the event loop and all server state: the object
//! registry, client sessions, surfaces, globals, the buffer backend and the
//! compositor. Client sockets are driven by the loop; each readable batch
//! is decoded and dispatched in arrival order, and a repaint is scheduled
//! once per batch that changed something visible.

use std::collections::HashMap;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::time::Duration;

use strata_shm::{Backend, BackendError};
use strata_wire::codec;
use strata_wire::protocol::{
    surface, BACKEND_ADVERTISEMENT_ID, BACKEND_ADVERTISEMENT_INTERFACE, CLIENT_ID_RANGE, DISPLAY_ID,
    DISPLAY_INTERFACE, SURFACE_INTERFACE,
};
use strata_wire::{
    Arg, ArgCursor, ConnectionError, DispatchTable, EncodeError, EventLoop, Global, Handler,
    LoopError, MessageHeader, Object, ObjectRegistry, Readiness, RegistryError, RequestError,
    RingError, ShutdownToken,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::advertisement;
use crate::compositor::{Compositor, CopyRegion};
use crate::config::ServerConfig;
use crate::session::{ClientId, ClientSession, SessionState};
use crate::surface::{Rect, Surface};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("object id space exhausted, cannot accept more clients")]
    IdSpaceExhausted,

    #[error("object {0} is not a global")]
    NotAGlobal(u32),
}

/// Everything the event loop's callbacks operate on.
pub struct DisplayState {
    registry: ObjectRegistry,
    sessions: HashMap<ClientId, ClientSession>,
    /// In creation order
    surfaces: Vec<Surface>,
    globals: Vec<Global>,
    backend: Box<dyn Backend>,
    compositor: Box<dyn Compositor>,
    table: DispatchTable<DisplayState, ClientId>,
    next_client: u64,
    next_base: Option<u32>,
    /// Sessions whose transport failed while handling someone's request
    doomed: Vec<ClientId>,
    needs_repaint: bool,
    repaint_scheduled: bool,
}

pub struct Display {
    event_loop: EventLoop<DisplayState>,
    state: DisplayState,
}

impl Display {
    pub fn new(
        config: &ServerConfig,
        backend: Box<dyn Backend>,
        compositor: Box<dyn Compositor>,
    ) -> Result<Self, DisplayError> {
        let mut registry = ObjectRegistry::new();
        registry.insert(Object::new(DISPLAY_ID, &DISPLAY_INTERFACE))?;
        registry.insert(Object::new(BACKEND_ADVERTISEMENT_ID, &BACKEND_ADVERTISEMENT_INTERFACE))?;

        let globals = vec![
            Global::new(DISPLAY_ID, DISPLAY_INTERFACE.name),
            Global::new(BACKEND_ADVERTISEMENT_ID, BACKEND_ADVERTISEMENT_INTERFACE.name),
        ];

        let mut table = DispatchTable::new();
        table.register(&DISPLAY_INTERFACE, display_handlers())?;
        table.register(&SURFACE_INTERFACE, surface_handlers())?;
        table.register(&BACKEND_ADVERTISEMENT_INTERFACE, advertisement::handlers())?;

        info!(
            "display created: backend {} '{}', client ids from {}",
            backend.name(),
            backend.args(),
            config.first_client_id
        );

        Ok(Self {
            event_loop: EventLoop::new()?,
            state: DisplayState {
                registry,
                sessions: HashMap::new(),
                surfaces: Vec::new(),
                globals,
                backend,
                compositor,
                table,
                next_client: 0,
                next_base: Some(config.first_client_id),
                doomed: Vec::new(),
                needs_repaint: false,
                repaint_scheduled: false,
            },
        })
    }

    /// Listen on abstract socket `name` and accept clients from the loop.
    pub fn add_socket(&mut self, name: &str) -> Result<(), DisplayError> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();

        self.event_loop.add_source(fd, Readiness::READABLE, move |state: &mut DisplayState, event_loop, _| {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(e) = state.add_client(event_loop, stream) {
                            warn!("Failed to set up client: {}", e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        info!("listening on @{}", name);
        Ok(())
    }

    /// Adopt an already connected socket as a client.
    pub fn add_client(&mut self, stream: UnixStream) -> Result<ClientId, DisplayError> {
        self.state.add_client(&mut self.event_loop, stream)
    }

    /// Wait for and process one batch of events. Returns the number of
    /// callbacks run.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize, DisplayError> {
        Ok(self.event_loop.wait(&mut self.state, timeout)?)
    }

    /// Dispatch until the shutdown token is cancelled.
    pub fn run(&mut self) -> Result<(), DisplayError> {
        info!("display running");
        self.event_loop.run(&mut self.state)?;
        info!("display stopped, {} clients still connected", self.state.sessions.len());
        Ok(())
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.event_loop.shutdown_token()
    }

    /// Send an event from a global to every client.
    pub fn broadcast(&mut self, object: u32, opcode: u16, args: &[Arg]) -> Result<usize, DisplayError> {
        let sent = self.state.broadcast(object, opcode, args)?;
        self.state.settle(&mut self.event_loop);
        Ok(sent)
    }

    /// Tear down a client as if its connection had failed.
    pub fn disconnect(&mut self, client: ClientId) {
        self.state.disconnect(&mut self.event_loop, client);
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.state.backend.as_mut()
    }
}

impl DisplayState {
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surface(&self, id: u32) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id() == id)
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, client: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&client)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn compositor(&self) -> &dyn Compositor {
        self.compositor.as_ref()
    }

    fn add_client(
        &mut self,
        event_loop: &mut EventLoop<DisplayState>,
        stream: UnixStream,
    ) -> Result<ClientId, DisplayError> {
        let base = self.next_base.ok_or(DisplayError::IdSpaceExhausted)?;
        let id = ClientId::new(self.next_client);

        let mut session = ClientSession::new(id, stream, base)?;
        session.send_handshake(&self.globals)?;

        self.next_client += 1;
        self.next_base = base.checked_add(CLIENT_ID_RANGE);

        // Register with the interest the handshake left behind.
        let _ = session.conn.take_interest_change();
        let fd = session.conn.as_raw_fd();
        let source = event_loop.add_source(fd, session.conn.interest(), move |state: &mut DisplayState, event_loop, mask| {
            state.client_ready(event_loop, id, mask);
        });
        session.source = Some(source);
        self.sessions.insert(id, session);

        info!("{} connected, ids {}..{}", id, base, base as u64 + CLIENT_ID_RANGE as u64);
        Ok(id)
    }

    fn client_ready(&mut self, event_loop: &mut EventLoop<DisplayState>, client: ClientId, mask: Readiness) {
        if let Err(e) = self.service_client(client, mask) {
            match e {
                ConnectionError::Closed => info!("{} closed the connection", client),
                e => warn!("{} connection failed: {}", client, e),
            }
            self.disconnect(event_loop, client);
        }
        self.settle(event_loop);
    }

    /// Move bytes for one client and run every complete request it sent.
    fn service_client(&mut self, client: ClientId, mask: Readiness) -> Result<(), ConnectionError> {
        let Some(session) = self.sessions.get_mut(&client) else {
            return Ok(());
        };
        session.conn.service(mask)?;
        if session.state == SessionState::Connected && session.conn.available() > 0 {
            session.state = SessionState::Active;
        }

        loop {
            if self.doomed.contains(&client) {
                break;
            }
            let Some(session) = self.sessions.get_mut(&client) else {
                return Ok(());
            };
            let Some(header) = codec::peek_header(&session.conn)? else {
                break;
            };
            if session.conn.available() < header.size as usize {
                break;
            }
            self.dispatch_message(client, header)?;
        }

        if let Some(session) = self.sessions.get_mut(&client) {
            session.conn.flush()?;
        }
        Ok(())
    }

    fn dispatch_message(&mut self, client: ClientId, header: MessageHeader) -> Result<(), ConnectionError> {
        let resolved = self.table.resolve(&self.registry, &header);
        let Some(session) = self.sessions.get_mut(&client) else {
            return Ok(());
        };

        let result = match resolved {
            Ok(resolved) => {
                match codec::demarshal(&mut session.conn, &header, resolved.request.signature, Some(&self.registry)) {
                    Ok(args) => {
                        trace!("{} -> {}@{}.{}", client, resolved.object.interface.name, header.object, resolved.request.name);
                        (resolved.handler)(self, client, resolved.object, &mut ArgCursor::new(&args))
                    }
                    Err(e) => Err(RequestError::Decode(e)),
                }
            }
            Err(violation) => {
                session.conn.consume(header.size as usize)?;
                Err(violation)
            }
        };

        if let Err(e) = result {
            warn!("{}: request on object {} failed: {}", client, header.object, e);
            self.post_error(client, &e);
        }
        Ok(())
    }

    /// Queue an event for one client. A client whose outbound ring cannot
    /// take it is disconnected once the current request is done.
    pub(crate) fn post_event(&mut self, client: ClientId, object: u32, opcode: u16, args: &[Arg]) {
        let Some(signature) = self
            .registry
            .lookup(object)
            .and_then(|o| o.interface.event(opcode))
            .map(|e| e.signature)
        else {
            error!("no event {} on object {}", opcode, object);
            return;
        };
        let Some(session) = self.sessions.get_mut(&client) else {
            return;
        };
        if let Err(e) = session.send_event(object, opcode, signature, args) {
            self.encode_failed(client, e);
        }
    }

    fn post_error(&mut self, client: ClientId, request_error: &RequestError) {
        let Some(session) = self.sessions.get_mut(&client) else {
            return;
        };
        if let Err(e) = session.send_error(request_error) {
            self.encode_failed(client, e);
        }
    }

    fn encode_failed(&mut self, client: ClientId, e: EncodeError) {
        match e {
            EncodeError::Ring(RingError::Overflow { .. }) => {
                warn!("{} is not reading its events, disconnecting", client);
                if !self.doomed.contains(&client) {
                    self.doomed.push(client);
                }
            }
            e => error!("failed to encode event for {}: {}", client, e),
        }
    }

    fn broadcast(&mut self, object: u32, opcode: u16, args: &[Arg]) -> Result<usize, DisplayError> {
        if !self.globals.iter().any(|g| g.id == object) {
            return Err(DisplayError::NotAGlobal(object));
        }
        let signature = self
            .registry
            .lookup(object)
            .and_then(|o| o.interface.event(opcode))
            .map(|e| e.signature)
            .ok_or(EncodeError::UnknownObject(object))?;
        // Fail before touching any session if the event itself is malformed.
        codec::encode(object, opcode, signature, args)?;

        let clients: Vec<ClientId> = self.sessions.keys().copied().collect();
        for &client in &clients {
            self.post_event(client, object, opcode, args);
        }
        debug!("broadcast event {} from {} to {} clients", opcode, object, clients.len());
        Ok(clients.len())
    }

    /// Housekeeping after a batch: reap failed clients, follow interest
    /// changes and schedule a repaint if anything visible changed.
    fn settle(&mut self, event_loop: &mut EventLoop<DisplayState>) {
        for client in std::mem::take(&mut self.doomed) {
            self.disconnect(event_loop, client);
        }

        for session in self.sessions.values_mut() {
            if let (Some(interest), Some(source)) = (session.conn.take_interest_change(), session.source) {
                event_loop.update_source(source, interest);
            }
        }

        if self.needs_repaint && !self.repaint_scheduled {
            self.repaint_scheduled = true;
            event_loop.add_idle(|state: &mut DisplayState, _| state.repaint());
        }
    }

    fn repaint(&mut self) {
        self.repaint_scheduled = false;
        self.needs_repaint = false;
        self.compositor.repaint(&self.surfaces, self.backend.as_ref());
        for surface in &mut self.surfaces {
            surface.take_damage();
        }
    }

    fn disconnect(&mut self, event_loop: &mut EventLoop<DisplayState>, client: ClientId) {
        let Some(mut session) = self.sessions.remove(&client) else {
            return;
        };
        session.state = SessionState::Disconnected;

        let objects = std::mem::take(&mut session.objects);
        for &id in &objects {
            self.destroy_surface(id);
        }
        if let Some(source) = session.source.take() {
            event_loop.remove_source(source);
        }
        self.doomed.retain(|&c| c != client);
        info!("{} disconnected, {} objects destroyed", client, objects.len());
        // Dropping the session closes the socket.
    }

    fn destroy_surface(&mut self, id: u32) {
        let Some(index) = self.surfaces.iter().position(|s| s.id() == id) else {
            return;
        };
        let mut surface = self.surfaces.remove(index);
        self.compositor.surface_destroyed(&mut surface);
        if let Some(buffer) = surface.take_buffer() {
            if let Err(e) = self.backend.destroy(buffer) {
                warn!("failed to release buffer {} of surface {}: {}", buffer.handle, id, e);
            }
        }
        if surface.geometry().is_some() {
            self.needs_repaint = true;
        }
        if let Err(e) = self.registry.remove(id) {
            warn!("surface {} was not registered: {}", id, e);
        }
        debug!("destroyed surface {}", id);
    }

    /// The surface `object` names, if `client` owns it.
    fn owned_surface(&mut self, client: ClientId, object: Object) -> Result<&mut Surface, RequestError> {
        self.surfaces
            .iter_mut()
            .find(|s| s.id() == object.id && s.owner() == client)
            .ok_or(RequestError::InvalidObject(object.id))
    }
}

/// Read an `x, y, width, height` rectangle whose far edges fit in `i32`.
fn read_rect(args: &mut ArgCursor<'_>, object: Object, opcode: u16) -> Result<Rect, RequestError> {
    let rect = Rect::new(args.int()?, args.int()?, args.int()?, args.int()?);
    if !rect.is_valid() {
        return Err(RequestError::InvalidMethod { object: object.id, opcode });
    }
    Ok(rect)
}

fn backend_violation(name: u32, e: BackendError) -> RequestError {
    if e.is_exhaustion() {
        RequestError::NoMemory
    } else {
        debug!("buffer {} rejected: {}", name, e);
        RequestError::InvalidObject(name)
    }
}

// ============================================================================
// display requests
// ============================================================================

fn display_handlers() -> Vec<Handler<DisplayState, ClientId>> {
    vec![create_surface]
}

fn create_surface(
    state: &mut DisplayState,
    client: ClientId,
    _object: Object,
    args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let id = args.new_id()?;
    let session = state
        .sessions
        .get(&client)
        .ok_or(RequestError::InvalidObject(id))?;
    if !session.owns_id(id) {
        return Err(RequestError::InvalidObject(id));
    }

    state
        .registry
        .insert(Object::new(id, &SURFACE_INTERFACE))
        .map_err(|_| RequestError::InvalidObject(id))?;
    let mut surface = Surface::new(id, client);
    if let Err(e) = state.compositor.surface_created(&mut surface) {
        let _ = state.registry.remove(id);
        return Err(e);
    }

    state.surfaces.push(surface);
    if let Some(session) = state.sessions.get_mut(&client) {
        session.objects.push(id);
    }
    debug!("{} created surface {}", client, id);
    Ok(())
}

// ============================================================================
// surface requests
// ============================================================================

fn surface_handlers() -> Vec<Handler<DisplayState, ClientId>> {
    vec![surface_destroy, surface_attach, surface_map, surface_copy, surface_damage]
}

fn surface_destroy(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    _args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    state.owned_surface(client, object)?;
    state.destroy_surface(object.id);
    if let Some(session) = state.sessions.get_mut(&client) {
        session.objects.retain(|&id| id != object.id);
    }
    Ok(())
}

fn surface_attach(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let name = args.uint()?;
    let width = args.uint()?;
    let height = args.uint()?;
    let stride = args.uint()?;

    state.owned_surface(client, object)?;
    // Take the new reference before dropping the old one, so re-attaching
    // the current buffer never frees it.
    let buffer = state
        .backend
        .open(name, width, height, stride)
        .map_err(|e| backend_violation(name, e))?;

    let DisplayState { surfaces, backend, compositor, needs_repaint, .. } = state;
    let surface = surfaces
        .iter_mut()
        .find(|s| s.id() == object.id)
        .ok_or(RequestError::InvalidObject(object.id))?;

    if let Some(old) = surface.replace_buffer(buffer) {
        if let Err(e) = backend.destroy(old) {
            warn!("failed to release buffer {}: {}", old.handle, e);
        }
    }
    if let Err(e) = compositor.surface_attached(surface, backend.as_mut()) {
        warn!("compositor could not use buffer {}: {}", name, e);
    }
    if surface.geometry().is_some() {
        *needs_repaint = true;
    }
    trace!("surface {} attached buffer {} ({}x{})", object.id, name, width, height);
    Ok(())
}

fn surface_map(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let rect = read_rect(args, object, surface::MAP)?;

    let surface = state.owned_surface(client, object)?;
    surface.set_geometry(rect);
    surface.add_damage(Rect::new(0, 0, rect.width, rect.height));
    state.compositor_mapped(object.id);
    state.needs_repaint = true;
    Ok(())
}

fn surface_copy(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let dst_x = args.int()?;
    let dst_y = args.int()?;
    let name = args.uint()?;
    let stride = args.uint()?;
    let src = read_rect(args, object, surface::COPY)?;
    let copy = CopyRegion { dst_x, dst_y, name, stride, src };
    if !copy.dst().is_valid() {
        return Err(RequestError::InvalidMethod { object: object.id, opcode: surface::COPY });
    }

    state.owned_surface(client, object)?;
    let DisplayState { surfaces, backend, compositor, needs_repaint, .. } = state;
    let surface = surfaces
        .iter_mut()
        .find(|s| s.id() == object.id)
        .ok_or(RequestError::InvalidObject(object.id))?;

    compositor
        .surface_copied(surface, backend.as_mut(), &copy)
        .map_err(|e| backend_violation(name, e))?;
    surface.add_damage(copy.dst());
    *needs_repaint = true;
    Ok(())
}

fn surface_damage(
    state: &mut DisplayState,
    client: ClientId,
    object: Object,
    args: &mut ArgCursor<'_>,
) -> Result<(), RequestError> {
    let rect = read_rect(args, object, surface::DAMAGE)?;

    state.owned_surface(client, object)?;
    let DisplayState { surfaces, compositor, needs_repaint, .. } = state;
    if let Some(surface) = surfaces.iter_mut().find(|s| s.id() == object.id) {
        surface.add_damage(rect);
        compositor.surface_damaged(surface, rect);
    }
    *needs_repaint = true;
    Ok(())
}

impl DisplayState {
    fn compositor_mapped(&mut self, id: u32) {
        let DisplayState { surfaces, compositor, .. } = self;
        if let Some(surface) = surfaces.iter_mut().find(|s| s.id() == id) {
            compositor.surface_mapped(surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{ErrorKind, Read, Write};
    use std::rc::Rc;
    use crate::compositor::HeadlessCompositor;
    use strata_shm::{Buffer, HeapSegment, ShmBackend, ShmConfig};
    use strata_wire::codec::{encode, HEADER_SIZE};
    use strata_wire::protocol::{backend_advertisement, display, surface};
    use strata_wire::Handshake;

    const TIMEOUT: Option<Duration> = Some(Duration::from_millis(200));

    /// Compositor that records what it was told.
    #[derive(Default)]
    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
        refuse_create: bool,
    }

    impl Compositor for Recorder {
        fn surface_created(&mut self, surface: &mut Surface) -> Result<(), RequestError> {
            if self.refuse_create {
                return Err(RequestError::NoMemory);
            }
            self.log.borrow_mut().push(format!("created {}", surface.id()));
            Ok(())
        }

        fn surface_destroyed(&mut self, surface: &mut Surface) {
            self.log.borrow_mut().push(format!("destroyed {}", surface.id()));
        }

        fn surface_attached(&mut self, surface: &mut Surface, _backend: &mut dyn Backend) -> Result<(), BackendError> {
            let handle = surface.buffer().map(|b| b.handle);
            self.log.borrow_mut().push(format!("attached {} {:?}", surface.id(), handle));
            Ok(())
        }

        fn surface_mapped(&mut self, surface: &mut Surface) {
            self.log.borrow_mut().push(format!("mapped {} {:?}", surface.id(), surface.geometry()));
        }

        fn repaint(&mut self, surfaces: &[Surface], _backend: &dyn Backend) {
            self.log.borrow_mut().push(format!("repaint {}", surfaces.len()));
        }
    }

    struct Harness {
        display: Display,
        log: Rc<RefCell<Vec<String>>>,
        buffers: Vec<Buffer>,
    }

    fn harness_with(refuse_create: bool) -> Harness {
        let log = Rc::new(RefCell::new(Vec::new()));
        let compositor = Recorder { log: log.clone(), refuse_create };
        build_harness(Box::new(compositor), log)
    }

    fn build_harness(compositor: Box<dyn Compositor>, log: Rc<RefCell<Vec<String>>>) -> Harness {
        let backend: ShmBackend<HeapSegment> =
            ShmBackend::anonymous(ShmConfig { slots: 16, data_size: 256 * 1024 }).unwrap();
        let config = ServerConfig {
            socket_name: "unused".into(),
            first_client_id: 8,
        };
        let mut display = Display::new(&config, Box::new(backend), compositor).unwrap();

        // Buffers 0..=3, as if a client had uploaded them.
        let buffers = (0..4)
            .map(|_| display.backend_mut().allocate(64, 64, 256).unwrap())
            .collect();
        Harness { display, log, buffers }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    impl Harness {
        fn connect(&mut self) -> (ClientId, UnixStream) {
            let (server, mut client) = UnixStream::pair().unwrap();
            let id = self.display.add_client(server).unwrap();

            let mut bytes = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = client.read(&mut chunk).unwrap();
                bytes.extend_from_slice(&chunk[..n]);
                if let Some((handshake, used)) = Handshake::parse(&bytes).unwrap() {
                    assert_eq!(used, bytes.len());
                    assert_eq!(handshake.globals, self.display.state().globals());
                    break;
                }
            }
            client.set_nonblocking(true).unwrap();
            (id, client)
        }

        fn send(&mut self, client: &mut UnixStream, object: u32, opcode: u16, signature: &str, args: &[Arg]) {
            client.write_all(&encode(object, opcode, signature, args).unwrap()).unwrap();
        }

        fn pump(&mut self) {
            self.display.dispatch(TIMEOUT).unwrap();
        }

        fn logged(&self, entry: &str) -> bool {
            self.log.borrow().iter().any(|e| e == entry)
        }
    }

    /// Every complete message waiting on the client socket, as (object, opcode, payload).
    fn events(client: &mut UnixStream) -> Vec<(u32, u16, Vec<u8>)> {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }

        let mut out = Vec::new();
        let mut rest = &bytes[..];
        while rest.len() >= HEADER_SIZE {
            let header = MessageHeader::from_bytes(rest[..HEADER_SIZE].try_into().unwrap());
            let size = header.size as usize;
            out.push((header.object, header.opcode, rest[HEADER_SIZE..size].to_vec()));
            rest = &rest[size..];
        }
        out
    }

    fn create(h: &mut Harness, client: &mut UnixStream, id: u32) {
        h.send(client, DISPLAY_ID, display::CREATE_SURFACE, "n", &[Arg::NewId(id)]);
    }

    fn attach(h: &mut Harness, client: &mut UnixStream, id: u32, name: u32) {
        h.send(
            client,
            id,
            surface::ATTACH,
            "uuuu",
            &[Arg::Uint(name), Arg::Uint(64), Arg::Uint(64), Arg::Uint(256)],
        );
    }

    fn map(h: &mut Harness, client: &mut UnixStream, id: u32) {
        h.send(
            client,
            id,
            surface::MAP,
            "iiii",
            &[Arg::Int(0), Arg::Int(0), Arg::Int(64), Arg::Int(64)],
        );
    }

    #[test]
    fn test_create_attach_map() {
        let mut h = harness();
        let (id, mut client) = h.connect();
        assert_eq!(h.display.state().session(id).unwrap().base(), 8);

        create(&mut h, &mut client, 10);
        attach(&mut h, &mut client, 10, 3);
        map(&mut h, &mut client, 10);
        h.pump();

        let state = h.display.state();
        assert_eq!(state.registry().lookup(10).unwrap().interface, &SURFACE_INTERFACE);
        let surface = state.surface(10).unwrap();
        assert_eq!(surface.owner(), id);
        assert_eq!(surface.buffer().map(|b| b.handle), Some(3));
        assert_eq!(surface.geometry(), Some(Rect::new(0, 0, 64, 64)));
        assert_eq!(state.session(id).unwrap().state(), SessionState::Active);

        assert!(h.logged("created 10"));
        assert!(h.logged("attached 10 Some(3)"));
        // The repaint ran as an idle in the same dispatch, after the requests.
        assert_eq!(h.log.borrow().last().map(String::as_str), Some("repaint 1"));
        assert!(events(&mut client).is_empty());
    }

    #[test]
    fn test_invalid_opcode_reports_and_continues() {
        let mut h = harness();
        let (_, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        h.send(&mut client, 10, 99, "", &[]);
        map(&mut h, &mut client, 10);
        h.pump();

        assert_eq!(events(&mut client), vec![(DISPLAY_ID, display::INVALID_METHOD, vec![])]);
        // The request after the bad one was still processed.
        assert!(h.display.state().surface(10).unwrap().geometry().is_some());
    }

    #[test]
    fn test_disconnect_destroys_owned_surfaces() {
        let mut h = harness();
        let (id, mut client) = h.connect();

        for (surface, name) in [(10, 0), (11, 1), (12, 2)] {
            create(&mut h, &mut client, surface);
            attach(&mut h, &mut client, surface, name);
        }
        h.pump();
        assert_eq!(h.display.state().surfaces().len(), 3);

        drop(client);
        h.pump();

        let state = h.display.state();
        assert!(state.surfaces().is_empty());
        assert_eq!(state.client_count(), 0);
        assert!(state.session(id).is_none());
        for surface in [10, 11, 12] {
            assert!(!state.registry().contains(surface));
            assert!(h.logged(&format!("destroyed {surface}")));
        }

        // Each surface's reference was dropped: one destroy now frees the buffer.
        let buffers = h.buffers.clone();
        for buffer in &buffers[..3] {
            h.display.backend_mut().destroy(*buffer).unwrap();
            assert!(h.display.backend_mut().open(buffer.handle, 64, 64, 256).is_err());
        }
    }

    #[test]
    fn test_unknown_object_and_bad_ids() {
        let mut h = harness();
        let (_, mut client) = h.connect();

        // Unknown target, new id outside the client's range, duplicate id
        h.send(&mut client, 42, 0, "", &[]);
        create(&mut h, &mut client, 300);
        create(&mut h, &mut client, 10);
        create(&mut h, &mut client, 10);
        h.pump();

        let opcodes: Vec<u16> = events(&mut client).into_iter().map(|e| e.1).collect();
        assert_eq!(opcodes, vec![display::INVALID_OBJECT; 3]);
        assert!(h.display.state().surface(300).is_none());
        assert_eq!(h.display.state().surfaces().len(), 1);
        // The compositor only heard about the creation that stuck.
        let created = h.log.borrow().iter().filter(|e| e.starts_with("created")).count();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_extreme_coordinates_are_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut h = build_harness(Box::new(HeadlessCompositor::new(16, 16)), log);
        let (id, mut client) = h.connect();
        let far = i32::MAX - 1;

        create(&mut h, &mut client, 10);
        attach(&mut h, &mut client, 10, 0);
        for opcode in [surface::MAP, surface::DAMAGE] {
            h.send(&mut client, 10, opcode, "iiii", &[Arg::Int(far), Arg::Int(0), Arg::Int(4), Arg::Int(4)]);
        }
        // Source rectangle and destination rectangle running off the end
        for (dst_x, src_x) in [(0, far), (far, 0)] {
            h.send(
                &mut client,
                10,
                surface::COPY,
                "iiuuiiii",
                &[
                    Arg::Int(dst_x),
                    Arg::Int(0),
                    Arg::Uint(1),
                    Arg::Uint(256),
                    Arg::Int(src_x),
                    Arg::Int(0),
                    Arg::Int(4),
                    Arg::Int(4),
                ],
            );
        }
        h.pump();

        assert_eq!(events(&mut client), vec![(DISPLAY_ID, display::INVALID_METHOD, vec![]); 4]);
        assert!(h.display.state().surface(10).unwrap().geometry().is_none());

        // Far but representable: mapped, damaged and repainted without trouble.
        let edge = i32::MAX - 4;
        h.send(&mut client, 10, surface::MAP, "iiii", &[Arg::Int(edge), Arg::Int(edge), Arg::Int(4), Arg::Int(4)]);
        for x in [i32::MIN, edge] {
            h.send(&mut client, 10, surface::DAMAGE, "iiii", &[Arg::Int(x), Arg::Int(0), Arg::Int(4), Arg::Int(4)]);
        }
        h.pump();

        assert!(events(&mut client).is_empty());
        assert!(h.display.state().session(id).is_some());
        let surface = h.display.state().surface(10).unwrap();
        assert_eq!(surface.geometry(), Some(Rect::new(edge, edge, 4, 4)));
        // Cleared by the repaint that ran after the batch
        assert_eq!(surface.damage(), None);
    }

    #[test]
    fn test_attach_unknown_buffer_keeps_old_one() {
        let mut h = harness();
        let (_, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        attach(&mut h, &mut client, 10, 1);
        attach(&mut h, &mut client, 10, 7);
        h.pump();

        assert_eq!(events(&mut client), vec![(DISPLAY_ID, display::INVALID_OBJECT, vec![])]);
        assert_eq!(h.display.state().surface(10).unwrap().buffer().map(|b| b.handle), Some(1));
    }

    #[test]
    fn test_reattach_releases_previous_buffer() {
        let mut h = harness();
        let (_, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        attach(&mut h, &mut client, 10, 0);
        attach(&mut h, &mut client, 10, 1);
        h.pump();

        // Buffer 0 is back to the single reference taken by the test.
        let first = h.buffers[0];
        h.display.backend_mut().destroy(first).unwrap();
        assert!(h.display.backend_mut().open(first.handle, 64, 64, 256).is_err());
    }

    #[test]
    fn test_foreign_surface_is_invalid() {
        let mut h = harness();
        let (_, mut owner) = h.connect();
        let (_, mut other) = h.connect();
        assert_eq!(h.display.state().client_count(), 2);

        create(&mut h, &mut owner, 10);
        h.pump();
        map(&mut h, &mut other, 10);
        h.pump();

        assert_eq!(events(&mut other), vec![(DISPLAY_ID, display::INVALID_OBJECT, vec![])]);
        assert!(h.display.state().surface(10).unwrap().geometry().is_none());
    }

    #[test]
    fn test_request_info_replies_to_requester_only() {
        let mut h = harness();
        let (_, mut asker) = h.connect();
        let (_, mut bystander) = h.connect();

        h.send(
            &mut asker,
            BACKEND_ADVERTISEMENT_ID,
            backend_advertisement::REQUEST_INFO,
            "",
            &[],
        );
        h.pump();

        let replies = events(&mut asker);
        assert_eq!(replies.len(), 1);
        let (object, opcode, payload) = &replies[0];
        assert_eq!((*object, *opcode), (BACKEND_ADVERTISEMENT_ID, backend_advertisement::REPLY_INFO));
        let args = codec::decode_args(payload, "ss", None).unwrap();
        assert_eq!(args, vec![Arg::Str("shm".into()), Arg::Str(String::new())]);

        assert!(events(&mut bystander).is_empty());
    }

    #[test]
    fn test_no_memory_leaves_no_object() {
        let mut h = harness_with(true);
        let (id, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        h.pump();

        assert_eq!(events(&mut client), vec![(DISPLAY_ID, display::NO_MEMORY, vec![])]);
        assert!(!h.display.state().registry().contains(10));
        assert!(h.display.state().session(id).unwrap().objects().is_empty());
    }

    #[test]
    fn test_framing_error_disconnects() {
        let mut h = harness();
        let (id, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        // Header declaring a 4-byte message
        let mut bogus = MessageHeader { object: DISPLAY_ID, opcode: 0, size: 4 }.to_bytes().to_vec();
        bogus.extend_from_slice(&[0; 4]);
        client.write_all(&bogus).unwrap();
        h.pump();

        assert!(h.display.state().session(id).is_none());
        assert!(h.display.state().surfaces().is_empty());
        assert!(h.logged("destroyed 10"));
    }

    #[test]
    fn test_oversized_message_disconnects() {
        let mut h = harness();
        let (id, mut client) = h.connect();
        let (other, _other_client) = h.connect();

        create(&mut h, &mut client, 10);
        // One word past the largest message the server will buffer
        let size = (strata_wire::MAX_MESSAGE_SIZE + 4) as u16;
        let mut bogus = MessageHeader { object: DISPLAY_ID, opcode: 0, size }.to_bytes().to_vec();
        bogus.resize(size as usize, 0);
        client.write_all(&bogus).unwrap();
        h.pump();

        assert!(h.display.state().session(id).is_none());
        assert!(!h.display.state().registry().contains(10));
        assert!(h.logged("destroyed 10"));
        assert!(h.display.state().session(other).is_some());
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let mut h = harness();
        let (_, mut a) = h.connect();
        let (_, mut b) = h.connect();

        let args = [Arg::Str("shm".into()), Arg::Str("/other".into())];
        let sent = h
            .display
            .broadcast(BACKEND_ADVERTISEMENT_ID, backend_advertisement::REPLY_INFO, &args)
            .unwrap();
        assert_eq!(sent, 2);
        // Queued output goes out when the sockets turn writable.
        h.pump();

        for client in [&mut a, &mut b] {
            let received = events(client);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].0, BACKEND_ADVERTISEMENT_ID);
        }

        assert!(matches!(h.display.broadcast(10, 0, &[]), Err(DisplayError::NotAGlobal(10))));
    }

    #[test]
    fn test_repaints_are_coalesced() {
        let mut h = harness();
        let (_, mut client) = h.connect();

        create(&mut h, &mut client, 10);
        map(&mut h, &mut client, 10);
        h.send(
            &mut client,
            10,
            surface::DAMAGE,
            "iiii",
            &[Arg::Int(0), Arg::Int(0), Arg::Int(8), Arg::Int(8)],
        );
        map(&mut h, &mut client, 10);
        h.pump();

        let repaints = h.log.borrow().iter().filter(|e| e.starts_with("repaint")).count();
        assert_eq!(repaints, 1);
        // Damage is cleared by the repaint.
        assert_eq!(h.display.state().surface(10).unwrap().damage(), None);
    }

    #[test]
    fn test_explicit_disconnect() {
        let mut h = harness();
        let (id, mut client) = h.connect();
        create(&mut h, &mut client, 10);
        h.pump();

        h.display.disconnect(id);
        assert_eq!(h.display.state().client_count(), 0);
        assert!(h.display.state().surfaces().is_empty());

        // The server closed its end.
        client.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
