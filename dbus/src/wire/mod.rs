//! Binary wire codec.
//!
//! Pure encoding and decoding of messages, independent of any I/O. The
//! connection feeds received bytes to [`unmarshal`] through the
//! [`FrameBuffer`](crate::FrameBuffer) and writes the output of [`marshal`]
//! to the socket.

mod marshal;
pub mod message;
pub mod protocol;
pub mod types;

pub(crate) use self::marshal::is_valid_object_path;
pub use self::marshal::MAX_ARRAY_LEN;
pub use self::message::{Message, MessageFlags, MessageType};
pub use self::protocol::{marshal, message_length, unmarshal, MAX_MESSAGE_SIZE};
pub use self::types::{signature_of, ParseResult, Type, Value};
