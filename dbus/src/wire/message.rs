use bitflags::bitflags;

use super::types::{signature_of, Value};

/// The four message types of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

/// A decoded or to-be-encoded message.
///
/// `serial` is assigned by the connection when the message is sent; a value
/// of zero means "not yet assigned".
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: String,
    pub body: Vec<Value>,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Message {
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Message {
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::new(MessageType::MethodCall)
        }
    }

    /// A successful reply to `call`, addressed back to its sender.
    pub fn method_return(call: &Message) -> Self {
        Message {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::new(MessageType::MethodReturn)
        }
    }

    /// An error reply to `call` carrying a human readable `text`.
    pub fn error(call: &Message, name: &str, text: &str) -> Self {
        Message {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.into()),
            ..Self::new(MessageType::Error)
        }
        .with_body(vec![Value::from(text)])
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Message {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::new(MessageType::Signal)
        }
    }

    /// Replace the body and derive the signature from it.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.signature = signature_of(&body);
        self.body = body;
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// The first string of the body, the convention for error descriptions.
    pub fn first_str(&self) -> Option<&str> {
        self.body.first().and_then(Value::as_str)
    }

    /// `interface.member`, or whatever part of it is present.
    pub fn qualified_member(&self) -> String {
        match (&self.interface, &self.member) {
            (Some(i), Some(m)) => format!("{}.{}", i, m),
            (None, Some(m)) => m.clone(),
            (Some(i), None) => i.clone(),
            (None, None) => String::new(),
        }
    }
}
