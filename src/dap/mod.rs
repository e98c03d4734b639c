pub mod channel;
pub mod handler;

#[cfg(test)]
mod tests;

pub use channel::{stdio_channel, tcp_channel, FramedReader, FramedWriter, MessageReader, MessageWriter};
pub use handler::{DapHandler, DapSession};
