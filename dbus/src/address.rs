//! Bus address resolution.
//!
//! A bus address is a `;` separated list of `transport:key=value,...`
//! entries. The first entry with a supported transport wins.

use std::env;
use std::fmt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use tracing::debug;

use crate::{Error, Result};

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Linux abstract namespace socket
    Abstract(String),
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub transport: Transport,
    /// Server guid the address promises, checked during authentication
    pub guid: Option<String>,
}

impl BusAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let mut unsupported = None;
        for entry in address.split(';').filter(|e| !e.is_empty()) {
            let (transport, params) = entry
                .split_once(':')
                .ok_or_else(|| Error::invalid_address(address, "missing transport"))?;

            let mut pairs = Vec::new();
            for pair in params.split(',').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::invalid_address(address, format!("'{}' is not key=value", pair))
                })?;
                let value = unescape(value).map_err(|e| Error::invalid_address(address, e))?;
                pairs.push((key, value));
            }

            if transport != "unix" {
                unsupported = Some(format!("unsupported transport '{}'", transport));
                continue;
            }

            let mut guid = None;
            let mut socket = None;
            for (key, value) in pairs {
                let t = match key {
                    "guid" => {
                        guid = Some(value);
                        continue;
                    }
                    "abstract" => Transport::Abstract(value),
                    "path" => Transport::Path(PathBuf::from(value)),
                    _ => continue,
                };
                if socket.replace(t).is_some() {
                    return Err(Error::invalid_address(
                        address,
                        "more than one of 'path' and 'abstract'",
                    ));
                }
            }
            match socket {
                Some(transport) => return Ok(BusAddress { transport, guid }),
                None => unsupported = Some("unix entry without 'path' or 'abstract'".into()),
            }
        }
        Err(Error::invalid_address(
            address,
            unsupported.unwrap_or_else(|| "empty address".into()),
        ))
    }

    /// The session bus address from `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session() -> Result<Self> {
        match env::var(SESSION_BUS_ENV) {
            Ok(address) => Self::parse(&address),
            Err(_) => Err(Error::MissingAddress(SESSION_BUS_ENV)),
        }
    }

    /// The system bus address from `DBUS_SYSTEM_BUS_ADDRESS`, or the well-known
    /// socket path.
    pub fn system() -> Result<Self> {
        match env::var(SYSTEM_BUS_ENV) {
            Ok(address) => Self::parse(&address),
            Err(_) => Self::parse(DEFAULT_SYSTEM_BUS_ADDRESS),
        }
    }

    pub fn connect(&self) -> Result<UnixStream> {
        debug!("Connecting to {}", self);
        let stream = match &self.transport {
            Transport::Abstract(name) => connect_abstract(name),
            Transport::Path(path) => UnixStream::connect(path),
        };
        stream.map_err(|source| Error::Connect {
            address: self.to_string(),
            source,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> std::io::Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_name: &str) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract sockets are only available on Linux",
    ))
}

fn unescape(value: &str) -> std::result::Result<String, String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| format!("bad escape in '{}'", value))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| format!("'{}' is not valid UTF-8", value))
}

fn escape(value: &str, out: &mut fmt::Formatter) -> fmt::Result {
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b) {
            write!(out, "{}", b as char)?;
        } else {
            write!(out, "%{:02x}", b)?;
        }
    }
    Ok(())
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.transport {
            Transport::Abstract(name) => {
                f.write_str("unix:abstract=")?;
                escape(name, f)?;
            }
            Transport::Path(path) => {
                f.write_str("unix:path=")?;
                escape(&path.to_string_lossy(), f)?;
            }
        }
        if let Some(guid) = &self.guid {
            write!(f, ",guid={}", guid)?;
        }
        Ok(())
    }
}
