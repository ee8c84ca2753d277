//! Request dispatch
//!
//! Each side keeps a table of strongly-typed handlers per interface, indexed
//! by opcode. A handler receives the fixed prefix (state, client, object)
//! and pulls its arguments, already decoded against the request signature,
//! from an [`ArgCursor`].

use std::collections::HashMap;

use crate::codec::{ArgCursor, MessageHeader};
use crate::error::{RegistryError, RequestError};
use crate::interface::{Interface, MessageDesc};
use crate::registry::{Object, ObjectRegistry};

/// Request handler: `(state, client, target object, arguments)`.
pub type Handler<S, C> = fn(&mut S, C, Object, &mut ArgCursor<'_>) -> Result<(), RequestError>;

/// A message resolved to its target and handler, ready to decode and invoke.
pub struct Resolved<S, C> {
    pub object: Object,
    pub request: &'static MessageDesc,
    pub handler: Handler<S, C>,
}

impl<S, C> std::fmt::Debug for Resolved<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("object", &self.object)
            .field("request", &self.request.name)
            .finish()
    }
}

pub struct DispatchTable<S, C> {
    handlers: HashMap<&'static str, Vec<Handler<S, C>>>,
}

impl<S, C> Default for DispatchTable<S, C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S, C> DispatchTable<S, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind handlers to an interface, one per request, in opcode order.
    pub fn register(
        &mut self,
        interface: &'static Interface,
        handlers: Vec<Handler<S, C>>,
    ) -> Result<(), RegistryError> {
        if handlers.len() != interface.request_count() {
            return Err(RegistryError::HandlerCount {
                interface: interface.name,
                expected: interface.request_count(),
                found: handlers.len(),
            });
        }
        self.handlers.insert(interface.name, handlers);
        Ok(())
    }

    /// Resolve the target object and handler for a message.
    ///
    /// An unknown object is `InvalidObject`; an opcode past the interface's
    /// request count (or an interface with no handlers here) is `InvalidMethod`.
    pub fn resolve(
        &self,
        registry: &ObjectRegistry,
        header: &MessageHeader,
    ) -> Result<Resolved<S, C>, RequestError> {
        let object = *registry
            .lookup(header.object)
            .ok_or(RequestError::InvalidObject(header.object))?;

        let invalid_method = RequestError::InvalidMethod {
            object: header.object,
            opcode: header.opcode,
        };
        let request = object
            .interface
            .request(header.opcode)
            .ok_or_else(|| invalid_method.clone())?;
        let handler = self
            .handlers
            .get(object.interface.name)
            .and_then(|handlers| handlers.get(header.opcode as usize))
            .copied()
            .ok_or(invalid_method)?;

        Ok(Resolved {
            object,
            request,
            handler,
        })
    }
}
