/*!
 dbus_introspect crate for parsing [D-Bus](https://dbus.freedesktop.org) introspection data,
 as returned by `org.freedesktop.DBus.Introspectable.Introspect`.

 # Examples

 ```rust
 use std::convert::TryFrom;
 use dbus_introspect::Introspect;

 let intro = Introspect::try_from(r#"
 <node>
   <interface name="com.example.Echo">
     <method name="Ping">
       <arg name="msg" type="s" direction="in"/>
       <arg name="reply" type="s" direction="out"/>
     </method>
   </interface>
   <node name="child"/>
 </node>
 "#).unwrap();

 let ping = intro.interface("com.example.Echo").unwrap().method("Ping").unwrap();
 assert_eq!(ping.in_signature(), "s");
 assert_eq!(ping.out_signature(), "s");
 assert_eq!(intro.children, vec!["child".to_string()]);
 ```
!*/

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_derive::Serialize;
use thiserror::Error;

#[cfg(test)]
mod test;

/// Errors produced while parsing introspection XML.
#[derive(Debug, Error)]
pub enum Error {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("<{element}> is missing the '{attribute}' attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("Invalid value '{value}' for attribute '{attribute}'")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
    #[error("Unexpected <{0}> element")]
    UnexpectedElement(String),
    #[error("Multiple definitions of {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("Document has no <node> element")]
    NoRootNode,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        })
    }
}

/// A single `<arg>` of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Arg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub signature: String,
    pub direction: Direction,
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "{}: {}", name, self.signature),
            None => f.write_str(&self.signature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodData {
    pub name: String,
    pub args: Vec<Arg>,
}

impl MethodData {
    pub fn inputs(&self) -> impl Iterator<Item = &Arg> {
        self.args.iter().filter(|a| a.direction == Direction::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Arg> {
        self.args.iter().filter(|a| a.direction == Direction::Out)
    }

    /// The concatenated signature of all `in` arguments.
    pub fn in_signature(&self) -> String {
        self.inputs().map(|a| a.signature.as_str()).collect()
    }

    /// The concatenated signature of all `out` arguments.
    pub fn out_signature(&self) -> String {
        self.outputs().map(|a| a.signature.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalData {
    pub name: String,
    pub args: Vec<Arg>,
}

impl SignalData {
    pub fn signature(&self) -> String {
        self.args.iter().map(|a| a.signature.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyData {
    pub name: String,
    #[serde(rename = "type")]
    pub signature: String,
    pub access: Access,
}

/// One `<interface>` of an introspected object.
///
/// Members are kept in maps for lookup; the `*_keys` vectors keep the
/// document order for display.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InterfaceData {
    pub name: String,
    pub methods: BTreeMap<String, MethodData>,
    #[serde(skip)]
    pub method_keys: Vec<String>,
    pub signals: BTreeMap<String, SignalData>,
    #[serde(skip)]
    pub signal_keys: Vec<String>,
    pub properties: BTreeMap<String, PropertyData>,
    #[serde(skip)]
    pub property_keys: Vec<String>,
}

impl InterfaceData {
    fn new(name: String) -> Self {
        InterfaceData {
            name,
            ..Default::default()
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodData> {
        self.methods.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalData> {
        self.signals.get(name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyData> {
        self.properties.get(name)
    }

    fn add_method(&mut self, m: MethodData) -> Result<()> {
        if self.methods.contains_key(&m.name) {
            return Err(Error::Duplicate {
                kind: "method",
                name: format!("{}.{}", self.name, m.name),
            });
        }
        self.method_keys.push(m.name.clone());
        self.methods.insert(m.name.clone(), m);
        Ok(())
    }

    fn add_signal(&mut self, s: SignalData) -> Result<()> {
        if self.signals.contains_key(&s.name) {
            return Err(Error::Duplicate {
                kind: "signal",
                name: format!("{}.{}", self.name, s.name),
            });
        }
        self.signal_keys.push(s.name.clone());
        self.signals.insert(s.name.clone(), s);
        Ok(())
    }

    fn add_property(&mut self, p: PropertyData) -> Result<()> {
        if self.properties.contains_key(&p.name) {
            return Err(Error::Duplicate {
                kind: "property",
                name: format!("{}.{}", self.name, p.name),
            });
        }
        self.property_keys.push(p.name.clone());
        self.properties.insert(p.name.clone(), p);
        Ok(())
    }
}

fn join_args<'a>(args: impl Iterator<Item = &'a Arg>) -> String {
    args.map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for InterfaceData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "interface {}", self.name)?;
        for m in self.method_keys.iter().map(|k| &self.methods[k]) {
            writeln!(
                f,
                "  method {}({}) -> ({})",
                m.name,
                join_args(m.inputs()),
                join_args(m.outputs())
            )?;
        }
        for s in self.signal_keys.iter().map(|k| &self.signals[k]) {
            writeln!(f, "  signal {}({})", s.name, join_args(s.args.iter()))?;
        }
        for p in self.property_keys.iter().map(|k| &self.properties[k]) {
            writeln!(f, "  property {} {}: {}", p.access, p.name, p.signature)?;
        }
        Ok(())
    }
}

/// The parsed introspection document of one object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Introspect {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub interfaces: BTreeMap<String, InterfaceData>,
    #[serde(skip)]
    pub interface_keys: Vec<String>,
    pub children: Vec<String>,
}

impl Introspect {
    pub fn interface(&self, name: &str) -> Option<&InterfaceData> {
        self.interfaces.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    fn add_interface(&mut self, i: InterfaceData) -> Result<()> {
        if self.interfaces.contains_key(&i.name) {
            return Err(Error::Duplicate {
                kind: "interface",
                name: i.name,
            });
        }
        self.interface_keys.push(i.name.clone());
        self.interfaces.insert(i.name.clone(), i);
        Ok(())
    }
}

impl fmt::Display for Introspect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for i in self.interface_keys.iter().map(|k| &self.interfaces[k]) {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", i)?;
        }
        for c in &self.children {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "node {}", c)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Introspect {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Parser::default().parse(s)
    }
}

impl std::str::FromStr for Introspect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Introspect::try_from(s)
    }
}

enum Member {
    Method(MethodData),
    Signal(SignalData),
}

#[derive(Default)]
struct Parser {
    result: Introspect,
    seen_root: bool,
    node_depth: usize,
    interface: Option<InterfaceData>,
    member: Option<Member>,
}

fn attribute(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

fn required(e: &BytesStart, element: &'static str, key: &'static str) -> Result<String> {
    attribute(e, key.as_bytes()).ok_or(Error::MissingAttribute {
        element,
        attribute: key,
    })
}

impl Parser {
    fn parse(mut self, s: &str) -> Result<Introspect> {
        let mut reader = Reader::from_str(s);
        reader.trim_text(true);

        loop {
            match reader.read_event()? {
                Event::Start(e) => self.open(&e, false)?,
                Event::Empty(e) => self.open(&e, true)?,
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.close(&name)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !self.seen_root {
            return Err(Error::NoRootNode);
        }
        Ok(self.result)
    }

    fn open(&mut self, e: &BytesStart, empty: bool) -> Result<()> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();

        if name == "node" {
            if self.node_depth == 0 {
                self.seen_root = true;
                self.result.name = attribute(e, b"name");
            } else if self.node_depth == 1 {
                if let Some(child) = attribute(e, b"name") {
                    self.result.children.push(child);
                }
            }
            if !empty {
                self.node_depth += 1;
            }
            return Ok(());
        }

        // Contents of nested nodes are described by their own introspection.
        if self.node_depth != 1 {
            if self.node_depth == 0 {
                return Err(Error::UnexpectedElement(name));
            }
            return Ok(());
        }

        match name.as_str() {
            "interface" => {
                if self.interface.is_some() {
                    return Err(Error::UnexpectedElement(name));
                }
                let iface = InterfaceData::new(required(e, "interface", "name")?);
                if empty {
                    self.result.add_interface(iface)?;
                } else {
                    self.interface = Some(iface);
                }
            }
            "method" | "signal" => {
                let iface = match (self.interface.as_mut(), &self.member) {
                    (Some(iface), None) => iface,
                    _ => return Err(Error::UnexpectedElement(name)),
                };
                let member = if name == "method" {
                    Member::Method(MethodData {
                        name: required(e, "method", "name")?,
                        args: Vec::new(),
                    })
                } else {
                    Member::Signal(SignalData {
                        name: required(e, "signal", "name")?,
                        args: Vec::new(),
                    })
                };
                if empty {
                    match member {
                        Member::Method(m) => iface.add_method(m)?,
                        Member::Signal(s) => iface.add_signal(s)?,
                    }
                } else {
                    self.member = Some(member);
                }
            }
            "arg" => {
                let signature = required(e, "arg", "type")?;
                let arg_name = attribute(e, b"name");
                let direction = match attribute(e, b"direction").as_deref() {
                    None => None,
                    Some("in") => Some(Direction::In),
                    Some("out") => Some(Direction::Out),
                    Some(v) => {
                        return Err(Error::InvalidAttribute {
                            attribute: "direction",
                            value: v.into(),
                        })
                    }
                };
                match self.member.as_mut() {
                    Some(Member::Method(m)) => m.args.push(Arg {
                        name: arg_name,
                        signature,
                        direction: direction.unwrap_or(Direction::In),
                    }),
                    Some(Member::Signal(s)) => s.args.push(Arg {
                        name: arg_name,
                        signature,
                        direction: Direction::Out,
                    }),
                    None => return Err(Error::UnexpectedElement(name)),
                }
            }
            "property" => {
                let iface = match (self.interface.as_mut(), &self.member) {
                    (Some(iface), None) => iface,
                    _ => return Err(Error::UnexpectedElement(name)),
                };
                let access = match required(e, "property", "access")?.as_str() {
                    "read" => Access::Read,
                    "write" => Access::Write,
                    "readwrite" => Access::ReadWrite,
                    v => {
                        return Err(Error::InvalidAttribute {
                            attribute: "access",
                            value: v.into(),
                        })
                    }
                };
                iface.add_property(PropertyData {
                    name: required(e, "property", "name")?,
                    signature: required(e, "property", "type")?,
                    access,
                })?;
            }
            "annotation" => {}
            _ => return Err(Error::UnexpectedElement(name)),
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match name {
            "node" => {
                self.node_depth = self.node_depth.saturating_sub(1);
            }
            "interface" if self.node_depth == 1 => {
                if let Some(iface) = self.interface.take() {
                    self.result.add_interface(iface)?;
                }
            }
            "method" | "signal" if self.node_depth == 1 => {
                if let (Some(member), Some(iface)) = (self.member.take(), self.interface.as_mut())
                {
                    match member {
                        Member::Method(m) => iface.add_method(m)?,
                        Member::Signal(s) => iface.add_signal(s)?,
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
