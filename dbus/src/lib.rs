//!Blocking client for the [D-Bus](https://dbus.freedesktop.org) message bus.
//!
//!A [`Connection`] opens a unix socket to the bus, authenticates with the
//!`EXTERNAL` mechanism and starts a background dispatcher thread that reads
//!every message the bus sends. Calls block the calling thread until the
//!dispatcher routes the matching reply back, so any number of threads can
//!share one connection.
//!
//!```rust,no_run
//!use dbus::{Connection, Value};
//!
//!let conn = Connection::session()?;
//!conn.initialize()?;
//!
//!let object = conn.get_object("com.example.Echo", "/com/example/Echo");
//!let echo = conn
//!    .interface(&object, "com.example.Echo")
//!    .expect("no com.example.Echo interface");
//!
//!conn.call_method(&echo, "Ping", &[Value::from("hi")], |reply| {
//!    println!("{:?}", reply.body);
//!})?;
//!# Ok::<(), dbus::Error>(())
//!```
//!
//!Failures that happen on the dispatcher thread, such as error replies or a
//!malformed message from the bus, are reported through
//![`Connection::take_error_events`].

pub use crate::address::{BusAddress, Transport};
pub use crate::auth::{authenticate, Handshake};
pub use crate::connection::{Connection, ConnectionConfig};
pub use crate::error::{AuthError, Error, Result};
pub use crate::frame::FrameBuffer;
pub use crate::object::{Interface, Object};
pub use crate::stream::Stream;
pub use crate::wire::{Message, MessageFlags, MessageType, ParseResult, Type, Value};

pub use dbus_introspect::{InterfaceData, Introspect, MethodData};

pub mod address;
pub mod auth;
pub mod connection;
mod error;
pub mod frame;
pub mod object;
mod registry;
mod stream;
pub mod wire;

#[cfg(test)]
mod test;
