//! Client connection to a display server
//!
//! Connecting reads the handshake, registers the advertised globals and
//! asks the backend advertisement which buffer backend the server uses.
//! After that the socket is non-blocking and the owner drives it with
//! [`DisplayHandle::iterate`] whenever [`DisplayHandle::fd`] is ready.

use std::collections::VecDeque;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{SocketAddr, UnixStream};

use strata_shm::{open_backend, Backend, BackendError, Buffer, Role};
use strata_wire::codec::{self, Arg};
use strata_wire::protocol::{
    backend_advertisement, display, interface_by_name, BACKEND_ADVERTISEMENT_ID, CLIENT_ID_RANGE,
    DISPLAY_ID, SURFACE_INTERFACE,
};
use strata_wire::{Global, Handshake, Object, ObjectRegistry, Readiness, RingConnection};
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::proxy::{Proxy, SurfaceProxy};

/// An event received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub object: u32,
    pub interface: &'static str,
    pub opcode: u16,
    pub name: &'static str,
    pub args: Vec<Arg>,
}

type EventHandler = Box<dyn FnMut(&Event)>;

pub struct DisplayHandle {
    conn: RingConnection,
    registry: ObjectRegistry,
    base: u32,
    /// Widened so the last id range cannot overflow
    next_id: u64,
    free_ids: Vec<u32>,
    globals: Vec<Global>,
    backend: Box<dyn Backend>,
    handler: Option<EventHandler>,
    pending: VecDeque<Event>,
}

impl DisplayHandle {
    /// Connect to the server listening on abstract socket `name`.
    pub fn connect(name: &str) -> Result<Self, ClientError> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = UnixStream::connect_addr(&addr)?;
        info!("connected to display '{}'", name);
        Self::from_stream(stream, |name, args| open_backend(name, args, Role::Client))
    }

    /// Set up a connection over an already connected socket.
    ///
    /// `open_backend` receives the advertised backend name and arguments.
    pub fn from_stream<F>(stream: UnixStream, open_backend: F) -> Result<Self, ClientError>
    where
        F: FnOnce(&str, &str) -> Result<Box<dyn Backend>, BackendError>,
    {
        // Blocking until setup is done
        stream.set_nonblocking(false)?;
        let mut conn = RingConnection::new(stream);

        let handshake = read_handshake(&mut conn)?;
        debug!(
            "handshake: id base {}, {} globals",
            handshake.base,
            handshake.globals.len()
        );

        let mut registry = ObjectRegistry::new();
        for global in &handshake.globals {
            match interface_by_name(&global.name) {
                Some(interface) => {
                    registry
                        .insert(Object::new(global.id, interface))
                        .map_err(|_| ClientError::Handshake(strata_wire::DecodeError::DuplicateId(global.id)))?;
                }
                None => debug!("ignoring unknown global '{}' ({})", global.name, global.id),
            }
        }

        let mut pending = VecDeque::new();
        let (name, args) = discover_backend(&mut conn, &registry, &mut pending)?;
        info!("server backend: {} '{}'", name, args);
        let backend = open_backend(&name, &args)?;

        conn.stream().set_nonblocking(true)?;
        // The ring's initial interest report is stale by now.
        let _ = conn.take_interest_change();

        Ok(Self {
            conn,
            registry,
            base: handshake.base,
            next_id: handshake.base as u64,
            free_ids: Vec::new(),
            globals: handshake.globals,
            backend,
            handler: None,
            pending,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }

    /// Readiness to wait for before calling [`iterate`](Self::iterate).
    pub fn interest(&self) -> Readiness {
        self.conn.interest()
    }

    /// First object id this client may mint.
    pub fn id_base(&self) -> u32 {
        self.base
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn global(&self, name: &str) -> Option<Proxy> {
        let global = self.globals.iter().find(|g| g.name == name)?;
        self.registry.lookup(global.id).copied().map(Proxy::new)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn set_event_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&Event) + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Service the socket for `mask` and deliver every complete event.
    ///
    /// Returns the number of events delivered.
    pub fn iterate(&mut self, mask: Readiness) -> Result<usize, ClientError> {
        self.conn.service(mask)?;

        while let Some(event) = read_event(&mut self.conn, &self.registry)? {
            self.pending.push_back(event);
        }
        Ok(self.dispatch_pending())
    }

    /// Deliver events already decoded but not yet handed to the handler.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.pending.pop_front() {
            if event.object == DISPLAY_ID {
                warn!("server reported {} (object {})", event.name, event.object);
            }
            if let Some(handler) = self.handler.as_mut() {
                handler(&event);
            }
            delivered += 1;
        }
        delivered
    }

    /// Send queued requests as far as the socket allows.
    pub fn flush(&mut self) -> Result<(), ClientError> {
        self.conn.flush()?;
        Ok(())
    }

    /// Requests still waiting for the socket
    pub fn pending_output(&self) -> usize {
        self.conn.pending_output()
    }

    pub fn create_surface(&mut self) -> Result<SurfaceProxy, ClientError> {
        let id = self.mint_id()?;
        let sent = self.marshal(DISPLAY_ID, display::CREATE_SURFACE, "n", &[Arg::NewId(id)]);
        if let Err(e) = sent {
            self.free_ids.push(id);
            return Err(e);
        }

        let object = Object::new(id, &SURFACE_INTERFACE);
        self.registry
            .insert(object)
            .map_err(|_| ClientError::Encode(strata_wire::EncodeError::DuplicateId(id)))?;
        trace!("created surface {}", id);
        Ok(SurfaceProxy::new(Proxy::new(object)))
    }

    pub fn create_buffer(&mut self, width: u32, height: u32, stride: u32) -> Result<Buffer, ClientError> {
        Ok(self.backend.allocate(width, height, stride)?)
    }

    pub fn create_buffer_from_data(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        data: &[u8],
    ) -> Result<Buffer, ClientError> {
        Ok(self.backend.create_buffer_from_data(width, height, stride, data)?)
    }

    pub fn destroy_buffer(&mut self, buffer: Buffer) -> Result<(), ClientError> {
        Ok(self.backend.destroy(buffer)?)
    }

    pub(crate) fn marshal(
        &mut self,
        object: u32,
        opcode: u16,
        signature: &str,
        args: &[Arg],
    ) -> Result<(), ClientError> {
        codec::marshal(&mut self.conn, Some(&self.registry), object, opcode, signature, args)?;
        Ok(())
    }

    pub(crate) fn release_id(&mut self, id: u32) {
        if self.registry.remove(id).is_ok() {
            self.free_ids.push(id);
        }
    }

    fn mint_id(&mut self) -> Result<u32, ClientError> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        if self.next_id >= self.base as u64 + CLIENT_ID_RANGE as u64 {
            return Err(ClientError::IdsExhausted);
        }
        let id = u32::try_from(self.next_id).map_err(|_| ClientError::IdsExhausted)?;
        self.next_id += 1;
        Ok(id)
    }
}

impl AsRawFd for DisplayHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

fn read_handshake(conn: &mut RingConnection) -> Result<Handshake, ClientError> {
    loop {
        let mut bytes = vec![0u8; conn.available()];
        conn.copy(&mut bytes)?;
        if let Some((handshake, used)) = Handshake::parse(&bytes).map_err(ClientError::Handshake)? {
            conn.consume(used)?;
            return Ok(handshake);
        }
        conn.service(Readiness::READABLE)?;
    }
}

/// Ask the advertisement global for the backend, queueing any other
/// events that arrive first.
fn discover_backend(
    conn: &mut RingConnection,
    registry: &ObjectRegistry,
    pending: &mut VecDeque<Event>,
) -> Result<(String, String), ClientError> {
    if !registry.contains(BACKEND_ADVERTISEMENT_ID) {
        return Err(ClientError::NoBackend);
    }

    codec::marshal(
        conn,
        Some(registry),
        BACKEND_ADVERTISEMENT_ID,
        backend_advertisement::REQUEST_INFO,
        "",
        &[],
    )?;
    while conn.pending_output() > 0 {
        conn.flush()?;
    }

    loop {
        while let Some(event) = read_event(conn, registry)? {
            if event.object == BACKEND_ADVERTISEMENT_ID && event.opcode == backend_advertisement::REPLY_INFO {
                let mut args = event.args.into_iter();
                if let (Some(Arg::Str(name)), Some(Arg::Str(args))) = (args.next(), args.next()) {
                    return Ok((name, args));
                }
                return Err(ClientError::NoBackend);
            }
            pending.push_back(event);
        }
        conn.service(Readiness::READABLE)?;
    }
}

/// Decode the next buffered event, if a whole one is buffered.
///
/// Events for unknown objects or opcodes are skipped.
fn read_event(conn: &mut RingConnection, registry: &ObjectRegistry) -> Result<Option<Event>, ClientError> {
    loop {
        let Some(header) = codec::peek_header(conn)? else {
            return Ok(None);
        };
        if conn.available() < header.size as usize {
            return Ok(None);
        }

        let Some(object) = registry.lookup(header.object).copied() else {
            warn!("event for unknown object {}", header.object);
            conn.consume(header.size as usize)?;
            continue;
        };
        let Some(desc) = object.interface.event(header.opcode) else {
            warn!("unknown event {} on {}", header.opcode, object.interface.name);
            conn.consume(header.size as usize)?;
            continue;
        };

        let args = codec::demarshal(conn, &header, desc.signature, Some(registry))?;
        return Ok(Some(Event {
            object: object.id,
            interface: object.interface.name,
            opcode: header.opcode,
            name: desc.name,
            args,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::rc::Rc;
    use strata_shm::{ShmBackend, ShmConfig};
    use strata_wire::codec::{encode, HEADER_SIZE};
    use strata_wire::protocol::surface;
    use strata_wire::MessageHeader;

    fn server_greeting(base: u32) -> Vec<u8> {
        let mut bytes = Handshake {
            base,
            globals: vec![
                Global::new(DISPLAY_ID, "display"),
                Global::new(BACKEND_ADVERTISEMENT_ID, "backend_advertisement"),
            ],
        }
        .encode();
        bytes.extend(
            encode(
                BACKEND_ADVERTISEMENT_ID,
                backend_advertisement::REPLY_INFO,
                "ss",
                &[Arg::Str("shm".into()), Arg::Str("/strata-test".into())],
            )
            .unwrap(),
        );
        bytes
    }

    fn anonymous(name: &str, args: &str) -> Result<Box<dyn Backend>, BackendError> {
        assert_eq!((name, args), ("shm", "/strata-test"));
        let backend = ShmBackend::anonymous(ShmConfig { slots: 4, data_size: 4096 })?;
        Ok(Box::new(backend))
    }

    fn read_message(stream: &mut UnixStream) -> (MessageHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let header = MessageHeader::from_bytes(header);
        let mut payload = vec![0u8; header.size as usize - HEADER_SIZE];
        stream.read_exact(&mut payload).unwrap();
        (header, payload)
    }

    fn connected() -> (DisplayHandle, UnixStream) {
        connected_at(256)
    }

    fn connected_at(base: u32) -> (DisplayHandle, UnixStream) {
        let (client, mut server) = UnixStream::pair().unwrap();
        server.write_all(&server_greeting(base)).unwrap();
        let display = DisplayHandle::from_stream(client, anonymous).unwrap();

        let (header, _) = read_message(&mut server);
        assert_eq!(header.object, BACKEND_ADVERTISEMENT_ID);
        assert_eq!(header.opcode, backend_advertisement::REQUEST_INFO);
        (display, server)
    }

    #[test]
    fn test_handshake_and_backend_discovery() {
        let (display, _server) = connected();
        assert_eq!(display.id_base(), 256);
        assert_eq!(display.globals().len(), 2);
        assert_eq!(display.global("display").unwrap().id(), DISPLAY_ID);
        assert_eq!(display.backend().name(), "shm");
        assert!(display.global("seat").is_none());
    }

    #[test]
    fn test_events_before_reply_are_queued() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let greeting = server_greeting(8);
        let handshake_len = Handshake::parse(&greeting).unwrap().unwrap().1;
        server.write_all(&greeting[..handshake_len]).unwrap();
        server
            .write_all(&encode(DISPLAY_ID, display::NO_MEMORY, "", &[]).unwrap())
            .unwrap();
        server.write_all(&greeting[handshake_len..]).unwrap();

        let mut display = DisplayHandle::from_stream(client, anonymous).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        display.set_event_handler(move |event| sink.borrow_mut().push(event.name));

        assert_eq!(display.dispatch_pending(), 1);
        assert_eq!(*seen.borrow(), vec!["no_memory"]);
    }

    #[test]
    fn test_create_surface_requests() {
        let (mut display, mut server) = connected();
        let surface_proxy = display.create_surface().unwrap();
        assert_eq!(surface_proxy.id(), 256);

        let buffer = display.create_buffer(2, 2, 8).unwrap();
        surface_proxy.attach_buffer(&mut display, &buffer).unwrap();
        surface_proxy.map(&mut display, 0, 0, 2, 2).unwrap();
        display.flush().unwrap();

        let (header, payload) = read_message(&mut server);
        assert_eq!((header.object, header.opcode), (DISPLAY_ID, display::CREATE_SURFACE));
        assert_eq!(payload, 256u32.to_ne_bytes());

        let (header, payload) = read_message(&mut server);
        assert_eq!((header.object, header.opcode), (256, surface::ATTACH));
        assert_eq!(&payload[..4], &buffer.handle.to_ne_bytes());

        let (header, _) = read_message(&mut server);
        assert_eq!((header.object, header.opcode), (256, surface::MAP));
        assert_eq!(display.pending_output(), 0);
    }

    #[test]
    fn test_surface_ids_exhaust_and_recycle() {
        let (mut display, _server) = connected();
        let mut surfaces = Vec::new();
        for _ in 0..CLIENT_ID_RANGE {
            surfaces.push(display.create_surface().unwrap());
            // Keep the outbound ring from filling up.
            display.flush().unwrap();
        }
        assert!(matches!(display.create_surface(), Err(ClientError::IdsExhausted)));

        let last = surfaces.pop().unwrap();
        let id = last.id();
        last.destroy(&mut display).unwrap();
        assert_eq!(display.create_surface().unwrap().id(), id);
    }

    #[test]
    fn test_last_id_range_exhausts_cleanly() {
        let (mut display, _server) = connected_at(u32::MAX - (CLIENT_ID_RANGE - 1));
        let mut last = 0;
        for _ in 0..CLIENT_ID_RANGE {
            last = display.create_surface().unwrap().id();
            display.flush().unwrap();
        }
        assert_eq!(last, u32::MAX);
        assert!(matches!(display.create_surface(), Err(ClientError::IdsExhausted)));
    }

    #[test]
    fn test_iterate_delivers_events() {
        let (mut display, mut server) = connected();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        display.set_event_handler(move |event| sink.borrow_mut().push((event.object, event.name)));

        server
            .write_all(&encode(DISPLAY_ID, display::INVALID_OBJECT, "", &[]).unwrap())
            .unwrap();
        // Unknown object: skipped without breaking framing
        server.write_all(&encode(77, 0, "", &[]).unwrap()).unwrap();
        server
            .write_all(&encode(DISPLAY_ID, display::INVALID_METHOD, "", &[]).unwrap())
            .unwrap();

        assert_eq!(display.iterate(Readiness::READABLE).unwrap(), 2);
        assert_eq!(
            *seen.borrow(),
            vec![(DISPLAY_ID, "invalid_object"), (DISPLAY_ID, "invalid_method")]
        );
    }

    #[test]
    fn test_missing_advertisement() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let handshake = Handshake {
            base: 256,
            globals: vec![Global::new(DISPLAY_ID, "display")],
        };
        server.write_all(&handshake.encode()).unwrap();
        assert!(matches!(
            DisplayHandle::from_stream(client, anonymous),
            Err(ClientError::NoBackend)
        ));
    }
}
