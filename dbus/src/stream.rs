use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use crate::Result;

/// A connected, bidirectional byte stream to the bus.
pub trait Stream: Read + Write + Send + Sync {
    /// Independent read and write halves over the same socket.
    fn split(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
    /// Shut down both directions, waking any blocked reader.
    fn shutdown(&mut self) -> Result<()>;
}

impl Stream for UnixStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        Ok((
            Box::new(UnixStream::try_clone(self)?),
            Box::new(UnixStream::try_clone(self)?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }
}
