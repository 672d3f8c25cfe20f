use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use static_assertions::assert_impl_all;

use crate::object::INTROSPECTABLE_INTERFACE;
use crate::wire::{marshal, Type};
use crate::*;

const GUID: &str = "3f2a1b0c9d8e7f6a5b4c3d2e1f0a9b8c";
const UNIQUE_NAME: &str = ":1.42";
/// Sent instead of a reply to `Garbage`.
const GARBAGE: &[u8] = b"Xgarbage-garbage-garbage";

const ECHO_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="com.example.Echo">
    <method name="Ping">
      <arg name="text" type="s" direction="in"/>
      <arg type="s" direction="out"/>
    </method>
    <method name="Slow"/>
    <method name="Hangup"/>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg type="s" direction="out"/>
    </method>
  </interface>
</node>"#;

/// Decides the answer to one incoming message; `None` falls back to the
/// default behaviour of the fixture.
type Handler = Box<dyn FnMut(&Message) -> Option<Vec<Message>> + Send>;

fn echo(call: &Message) -> Message {
    Message::method_return(call).with_body(call.body.clone())
}

/// Default answers. `None` makes the fixture hang up.
fn default_reply(msg: &Message) -> Option<Vec<Message>> {
    if !msg.expects_reply() {
        return Some(vec![]);
    }
    let reply = match (msg.interface.as_deref(), msg.member.as_deref()) {
        (Some("org.freedesktop.DBus"), Some("Hello")) => {
            Message::method_return(msg).with_body(vec![UNIQUE_NAME.into()])
        }
        (Some("org.freedesktop.DBus"), Some("ListNames")) => Message::method_return(msg)
            .with_body(vec![Value::Array(
                Type::String,
                vec![
                    "org.freedesktop.DBus".into(),
                    UNIQUE_NAME.into(),
                    "com.example.Echo".into(),
                ],
            )]),
        (Some(INTROSPECTABLE_INTERFACE), Some("Introspect")) => match msg.path.as_deref() {
            Some("/com/example/Echo") => {
                Message::method_return(msg).with_body(vec![ECHO_XML.into()])
            }
            Some("/empty") => Message::method_return(msg).with_body(vec!["<node/>".into()]),
            _ => Message::error(
                msg,
                "org.freedesktop.DBus.Error.UnknownObject",
                "No such object",
            ),
        },
        (Some("com.example.Echo"), Some("Ping")) => echo(msg),
        (Some("com.example.Echo"), Some("Slow")) => return Some(vec![]),
        (Some("com.example.Echo"), Some("Hangup")) => return None,
        _ => Message::error(
            msg,
            "org.freedesktop.DBus.Error.UnknownMethod",
            &format!("Unknown method {}", msg.qualified_member()),
        ),
    };
    Some(vec![reply])
}

fn read_line(stream: &mut UnixStream) -> String {
    let mut line = Vec::new();
    let mut b = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        if stream.read(&mut b).unwrap() == 0 {
            break;
        }
        line.push(b[0]);
    }
    String::from_utf8(line).unwrap()
}

fn serve(listener: UnixListener, mut handler: Handler) -> Vec<Message> {
    let (mut stream, _) = listener.accept().unwrap();

    let auth = read_line(&mut stream);
    assert!(auth.starts_with("\0AUTH EXTERNAL "), "{:?}", auth);
    stream
        .write_all(format!("OK {}\r\n", GUID).as_bytes())
        .unwrap();
    assert_eq!(read_line(&mut stream), "BEGIN\r\n");

    let mut received = Vec::new();
    let mut frames = FrameBuffer::new();
    let mut serial = 1;
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(msg) = frames.try_pop().unwrap() {
            received.push(msg.clone());
            if msg.member.as_deref() == Some("Garbage") {
                stream.write_all(GARBAGE).unwrap();
                continue;
            }
            let replies = match handler(&msg).or_else(|| default_reply(&msg)) {
                Some(replies) => replies,
                None => return received,
            };
            for mut reply in replies {
                reply.serial = serial;
                reply.sender = Some("org.freedesktop.DBus".into());
                serial += 1;
                stream.write_all(&marshal(&reply).unwrap()).unwrap();
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return received,
            Ok(n) => frames.append(&chunk[..n]).unwrap(),
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    address: String,
    thread: thread::JoinHandle<Vec<Message>>,
}

impl Fixture {
    fn start() -> Self {
        Self::with_handler(Box::new(|_: &Message| None))
    }

    fn with_handler(handler: Handler) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        let listener = UnixListener::bind(&path).unwrap();
        let thread = thread::spawn(move || serve(listener, handler));
        Fixture {
            address: format!("unix:path={},guid={}", path.display(), GUID),
            _dir: dir,
            thread,
        }
    }

    fn connect(&self) -> Connection {
        self.connect_with(ConnectionConfig::default())
    }

    fn connect_with(&self, config: ConnectionConfig) -> Connection {
        let address = BusAddress::parse(&self.address).unwrap();
        let conn = Connection::open(&address, config).unwrap();
        conn.initialize().unwrap();
        conn
    }

    /// Wait for the client to go away and return everything it sent.
    fn received(self) -> Vec<Message> {
        self.thread.join().unwrap()
    }
}

fn echo_call(member: &str) -> Message {
    Message::method_call(
        "com.example.Echo",
        "/com/example/Echo",
        "com.example.Echo",
        member,
    )
}

fn pings(received: &[Message]) -> Vec<&Message> {
    received
        .iter()
        .filter(|m| m.member.as_deref() == Some("Ping"))
        .collect()
}

#[test]
fn test_hello() {
    let fixture = Fixture::start();
    let conn = fixture.connect();
    assert!(conn.unique_name().unwrap().starts_with(':'));
    assert_eq!(conn.unique_name(), Some(UNIQUE_NAME));
    assert_eq!(conn.guid(), Some(GUID));
    assert!(conn
        .list_names()
        .unwrap()
        .contains(&"com.example.Echo".to_string()));
    drop(conn);

    let received = fixture.received();
    assert_eq!(received[0].member.as_deref(), Some("Hello"));
    assert_eq!(received[0].destination.as_deref(), Some("org.freedesktop.DBus"));
    assert_eq!(received[0].path.as_deref(), Some("/org/freedesktop/DBus"));
}

#[test]
fn test_ping() {
    let fixture = Fixture::start();
    let conn = fixture.connect();

    let object = conn.get_object("com.example.Echo", "/com/example/Echo");
    let echo = conn.interface(&object, "com.example.Echo").unwrap();
    assert_eq!(echo.method("Ping").unwrap().in_signature(), "s");
    assert_eq!(echo.method("Ping").unwrap().out_signature(), "s");

    let mut replies = Vec::new();
    conn.call_method(&echo, "Ping", &[Value::from("hi")], |reply| {
        replies.push(reply)
    })
    .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, vec![Value::from("hi")]);
    let reply_serial = replies[0].reply_serial;
    drop(conn);

    let received = fixture.received();
    let sent = pings(&received);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].signature, "s");
    assert_eq!(sent[0].body, vec![Value::from("hi")]);
    assert_eq!(sent[0].interface.as_deref(), Some("com.example.Echo"));
    assert_eq!(sent[0].path.as_deref(), Some("/com/example/Echo"));
    assert_eq!(Some(sent[0].serial), reply_serial);
}

#[test]
fn test_replies_in_reverse_order() {
    let held: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
    let fixture = Fixture::with_handler(Box::new(move |msg: &Message| {
        if msg.member.as_deref() != Some("Ping") {
            return None;
        }
        let mut held = held.lock().unwrap();
        match held.take() {
            None => {
                *held = Some(msg.clone());
                Some(vec![])
            }
            Some(first) => Some(vec![echo(msg), echo(&first)]),
        }
    }));
    let conn = Arc::new(fixture.connect());
    let object = conn.get_object("com.example.Echo", "/com/example/Echo");

    let callers: Vec<_> = ["a", "b"]
        .iter()
        .map(|text| {
            let conn = conn.clone();
            let object = object.clone();
            let text = text.to_string();
            thread::spawn(move || {
                let mut replies = Vec::new();
                conn.call_object_method(
                    &object,
                    "com.example.Echo",
                    "Ping",
                    &[Value::from(text.as_str())],
                    |reply| replies.push(reply),
                )
                .unwrap();
                (text, replies)
            })
        })
        .collect();

    let mut reply_serials = Vec::new();
    for caller in callers {
        let (text, replies) = caller.join().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, vec![Value::from(text.as_str())]);
        reply_serials.push(replies[0].reply_serial.unwrap());
    }
    assert_ne!(reply_serials[0], reply_serials[1]);
    drop(conn);

    let received = fixture.received();
    let sent = pings(&received);
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].serial, sent[1].serial);
}

#[test]
fn test_duplicate_reply_is_dropped() {
    let fixture = Fixture::with_handler(Box::new(|msg: &Message| {
        if msg.member.as_deref() == Some("Ping") {
            Some(vec![echo(msg), echo(msg)])
        } else {
            None
        }
    }));
    let conn = fixture.connect();
    let object = conn.get_object("com.example.Echo", "/com/example/Echo");

    let fired = AtomicUsize::new(0);
    for text in ["one", "two", "three"] {
        conn.call_object_method(
            &object,
            "com.example.Echo",
            "Ping",
            &[text.into()],
            |reply| {
                assert_eq!(reply.body, vec![Value::from(text)]);
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert!(!conn.is_closed());
}

#[test]
fn test_empty_introspection() {
    let fixture = Fixture::start();
    let conn = fixture.connect();

    for path in ["/empty", "/missing"] {
        let object = conn.get_object("com.example.Echo", path);
        assert!(object.is_empty());
        assert!(conn.interface(&object, "com.example.Echo").is_none());
        let e = conn
            .call_object_method(&object, "com.example.Echo", "Ping", &["hi".into()], |_| {
                panic!("no reply expected")
            })
            .unwrap_err();
        assert!(matches!(e, Error::InvalidMethod(_)), "{:?}", e);
    }

    let object = conn.get_object("com.example.Echo", "/com/example/Echo");
    let echo = conn.interface(&object, "com.example.Echo").unwrap();
    let e = conn
        .call_method(&echo, "Pong", &[], |_| panic!("no reply expected"))
        .unwrap_err();
    assert!(matches!(e, Error::InvalidMethod(ref m) if m == "com.example.Echo.Pong"));
}

#[test]
fn test_invalid_args() {
    let fixture = Fixture::start();
    let conn = fixture.connect();
    let object = conn.get_object("com.example.Echo", "/com/example/Echo");
    let echo = conn.interface(&object, "com.example.Echo").unwrap();

    match conn.call_method(&echo, "Ping", &[Value::UInt32(1)], |_| {}) {
        Err(Error::InvalidArgs { expected, actual }) => {
            assert_eq!(expected, "s");
            assert_eq!(actual, "u");
        }
        other => panic!("Expected InvalidArgs, got {:?}", other),
    }
    assert!(matches!(
        conn.call_method(&echo, "Ping", &[], |_| {}),
        Err(Error::InvalidArgs { .. })
    ));
    drop(conn);

    assert!(pings(&fixture.received()).is_empty());
}

#[test]
fn test_error_reply() {
    let fixture = Fixture::start();
    let conn = fixture.connect();
    let errors = conn.take_error_events().unwrap();
    assert!(conn.take_error_events().is_none());

    let mut fired = false;
    match conn.send_with_reply(echo_call("Nope"), |_| fired = true) {
        Err(Error::MethodError { name, message }) => {
            assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod");
            assert_eq!(message, "Unknown method com.example.Echo.Nope");
        }
        other => panic!("Expected MethodError, got {:?}", other),
    }
    assert!(!fired);

    match errors.recv_timeout(Duration::from_secs(5)).unwrap() {
        Error::MethodError { name, .. } => {
            assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod")
        }
        other => panic!("Expected MethodError, got {:?}", other),
    }
}

#[test]
fn test_timeout_and_late_reply() {
    let held: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
    let fixture = Fixture::with_handler(Box::new(move |msg: &Message| {
        match msg.member.as_deref() {
            Some("Slow") => {
                *held.lock().unwrap() = Some(msg.clone());
                Some(vec![])
            }
            // answer the timed out call first, then the ping
            Some("Ping") => {
                let mut replies: Vec<Message> = held
                    .lock()
                    .unwrap()
                    .take()
                    .map(|slow| Message::method_return(&slow))
                    .into_iter()
                    .collect();
                replies.push(echo(msg));
                Some(replies)
            }
            _ => None,
        }
    }));
    let conn = fixture.connect_with(
        ConnectionConfig::default().call_timeout(Some(Duration::from_millis(200))),
    );

    assert!(matches!(conn.call(echo_call("Slow")), Err(Error::Timeout(_))));

    let ping = echo_call("Ping").with_body(vec!["after".into()]);
    let reply = conn.call_timeout(ping, None).unwrap();
    assert_eq!(reply.body, vec![Value::from("after")]);
    assert!(!conn.is_closed());
}

#[test]
fn test_close_fails_pending_calls() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let fixture = Fixture::with_handler(Box::new(move |msg: &Message| {
        if msg.member.as_deref() == Some("Slow") {
            seen_tx.send(()).unwrap();
        }
        None
    }));
    let conn = Arc::new(fixture.connect_with(ConnectionConfig::default().call_timeout(None)));

    let caller = {
        let conn = conn.clone();
        thread::spawn(move || {
            conn.call(echo_call("Slow"))
        })
    };
    seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    conn.close();

    assert!(matches!(caller.join().unwrap(), Err(Error::ConnectionClosed)));
    assert!(conn.is_closed());
    assert!(matches!(conn.hello(), Err(Error::ConnectionClosed)));
    conn.close();

    let received = fixture.received();
    assert_eq!(received.last().unwrap().member.as_deref(), Some("Slow"));
}

#[test]
fn test_bus_hangup() {
    let fixture = Fixture::start();
    let conn = fixture.connect_with(ConnectionConfig::default().call_timeout(None));
    let errors = conn.take_error_events().unwrap();

    assert!(matches!(
        conn.call(echo_call("Hangup")),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        errors.recv_timeout(Duration::from_secs(5)).unwrap(),
        Error::ConnectionClosed
    ));
    assert!(conn.is_closed());
    fixture.received();
}

#[test]
fn test_malformed_frame_closes_connection() {
    let fixture = Fixture::start();
    let conn = Arc::new(fixture.connect_with(ConnectionConfig::default().call_timeout(None)));
    let errors = conn.take_error_events().unwrap();

    let slow = {
        let conn = conn.clone();
        thread::spawn(move || conn.call(echo_call("Slow")))
    };
    assert!(matches!(
        conn.call(echo_call("Garbage")),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(slow.join().unwrap(), Err(Error::ConnectionClosed)));

    match errors.recv_timeout(Duration::from_secs(5)).unwrap() {
        Error::Protocol(e) => assert!(e.contains("endianness"), "{}", e),
        other => panic!("Expected Protocol, got {:?}", other),
    }
    assert!(conn.is_closed());
    assert!(matches!(conn.list_names(), Err(Error::ConnectionClosed)));
}

#[test]
fn test_oversized_frame_closes_connection() {
    let fixture = Fixture::start();
    let conn = fixture.connect_with(
        ConnectionConfig::default()
            .call_timeout(None)
            .max_frame_size(1024),
    );
    let errors = conn.take_error_events().unwrap();

    let ping = echo_call("Ping").with_body(vec!["x".repeat(4096).into()]);
    assert!(matches!(conn.call(ping), Err(Error::ConnectionClosed)));

    match errors.recv_timeout(Duration::from_secs(5)).unwrap() {
        Error::OversizedFrame { size, max } => {
            assert_eq!(max, 1024);
            assert!(size > 4096);
        }
        other => panic!("Expected OversizedFrame, got {:?}", other),
    }
    assert!(conn.is_closed());
}

#[test]
fn test_error_channel_capacity() {
    let fixture = Fixture::start();
    let conn = fixture.connect_with(ConnectionConfig::default().error_capacity(1));
    let errors = conn.take_error_events().unwrap();

    for _ in 0..3 {
        assert!(matches!(
            conn.call(echo_call("Nope")),
            Err(Error::MethodError { .. })
        ));
    }
    assert!(matches!(errors.try_recv(), Ok(Error::MethodError { .. })));
    assert!(errors.try_recv().is_err());
    assert!(!conn.is_closed());
}

#[test]
fn test_send_no_reply() {
    let fixture = Fixture::start();
    let conn = fixture.connect();
    let ping = echo_call("Ping").with_body(vec!["quiet".into()]);
    let serial = conn.send_no_reply(ping).unwrap();
    assert_ne!(serial, 0);
    // a reply-expecting call afterwards still gets its own answer
    assert_eq!(conn.list_names().unwrap().len(), 3);
    drop(conn);

    let received = fixture.received();
    let sent = pings(&received);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].serial, serial);
    assert!(sent[0].flags.contains(MessageFlags::NO_REPLY_EXPECTED));
}

#[test]
fn connection_is_sync_send() {
    assert_impl_all!(Connection: Send, Sync);
    assert_impl_all!(Error: Send, Sync);
    assert_impl_all!(Object: Send, Sync);
}
