//! Proxies for remote objects, backed by their introspection data.

use dbus_introspect::{InterfaceData, Introspect, MethodData};
use tracing::debug;

use crate::connection::Connection;
use crate::wire::{is_valid_object_path, signature_of, Message, Value};
use crate::{Error, Result};

pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// A remote object and the interfaces it reported when it was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    destination: String,
    path: String,
    introspection: Introspect,
}

impl Object {
    pub fn new(destination: &str, path: &str, introspection: Introspect) -> Self {
        Object {
            destination: destination.into(),
            path: path.into(),
            introspection,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn introspection(&self) -> &Introspect {
        &self.introspection
    }

    /// True if the object reported no interfaces.
    pub fn is_empty(&self) -> bool {
        self.introspection.is_empty()
    }

    pub fn interface(&self, name: &str) -> Option<Interface<'_>> {
        self.introspection
            .interface(name)
            .map(|data| Interface { object: self, data })
    }
}

/// A named interface of an [`Object`].
#[derive(Debug, Clone, Copy)]
pub struct Interface<'a> {
    object: &'a Object,
    data: &'a InterfaceData,
}

impl<'a> Interface<'a> {
    pub fn name(&self) -> &'a str {
        &self.data.name
    }

    pub fn object(&self) -> &'a Object {
        self.object
    }

    pub fn data(&self) -> &'a InterfaceData {
        self.data
    }

    pub fn method(&self, name: &str) -> Option<&'a MethodData> {
        self.data.method(name)
    }
}

impl Connection {
    /// Fetch and parse the introspection data of `path` at `destination`.
    pub fn introspect(&self, destination: &str, path: &str) -> Result<Introspect> {
        if !is_valid_object_path(path) {
            return Err(Error::Protocol(format!("invalid object path '{}'", path)));
        }
        let reply = self.call(Message::method_call(
            destination,
            path,
            INTROSPECTABLE_INTERFACE,
            "Introspect",
        ))?;
        let xml = reply.first_str().ok_or_else(|| {
            Error::Protocol(format!(
                "Introspect reply has signature '{}'",
                reply.signature
            ))
        })?;
        Introspect::try_from(xml)
            .map_err(|e| Error::Protocol(format!("invalid introspection data: {}", e)))
    }

    /// An [`Object`] for `path` at `destination`.
    ///
    /// Never fails: if the peer cannot be introspected the object simply has
    /// no interfaces.
    pub fn get_object(&self, destination: &str, path: &str) -> Object {
        let introspection = match self.introspect(destination, path) {
            Ok(i) => i,
            Err(e) => {
                debug!("Introspection of {} {} failed: {}", destination, path, e);
                Introspect::default()
            }
        };
        Object::new(destination, path, introspection)
    }

    /// The interface `name` of `object`, if it has one.
    pub fn interface<'a>(&self, object: &'a Object, name: &str) -> Option<Interface<'a>> {
        object.interface(name)
    }

    /// Call the method `name` of `interface` with `args`.
    ///
    /// The arguments must match the input signature the method declared in
    /// its introspection data. Blocks until the reply arrives and hands it to
    /// `on_reply`.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidMethod`] if the interface has no such method
    /// * [`Error::InvalidArgs`] if `args` do not match the input signature
    /// * any error of [`Connection::send_with_reply`]
    pub fn call_method<F>(
        &self,
        interface: &Interface<'_>,
        name: &str,
        args: &[Value],
        on_reply: F,
    ) -> Result<()>
    where
        F: FnOnce(Message),
    {
        let method = interface
            .method(name)
            .ok_or_else(|| Error::InvalidMethod(format!("{}.{}", interface.name(), name)))?;

        let expected = method.in_signature();
        let actual = signature_of(args);
        if expected != actual {
            return Err(Error::InvalidArgs { expected, actual });
        }

        let object = interface.object();
        let msg = Message::method_call(object.destination(), object.path(), interface.name(), name)
            .with_body(args.to_vec());
        self.send_with_reply(msg, on_reply)
    }

    /// Resolve `interface` on `object`, then call `method` on it.
    pub fn call_object_method<F>(
        &self,
        object: &Object,
        interface: &str,
        method: &str,
        args: &[Value],
        on_reply: F,
    ) -> Result<()>
    where
        F: FnOnce(Message),
    {
        let iface = self
            .interface(object, interface)
            .ok_or_else(|| Error::InvalidMethod(format!("{}.{}", interface, method)))?;
        self.call_method(&iface, method, args, on_reply)
    }
}
