//! Framed message transport for the Debug Adapter Protocol.
//!
//! Messages travel as `Content-Length: N\r\n\r\n` followed by N bytes of
//! JSON, over stdio or TCP. The reader also tolerates a bare JSON object
//! with no framing, which simple test clients send.

use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;

pub trait MessageReader: Send {
    /// Block until a full message payload is available. `None` on EOF or
    /// connection close.
    fn read_message(&mut self) -> io::Result<Option<String>>;
}

pub trait MessageWriter: Send {
    fn write_message(&mut self, payload: &str) -> io::Result<()>;
}

pub struct FramedReader<R> {
    inner: R,
}

impl<R: Read + Send> FramedReader<R> {
    pub fn new(inner: R) -> FramedReader<R> {
        FramedReader { inner }
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Raw-JSON fallback: the opening brace was already consumed; read until
    /// the braces balance, skipping over string literals.
    fn read_raw_json(&mut self) -> io::Result<Option<String>> {
        let mut payload = String::from("{");
        let mut depth = 1usize;
        let mut in_string = false;
        let mut escaped = false;
        while depth > 0 {
            let Some(byte) = self.read_byte()? else {
                return Ok(None);
            };
            let ch = byte as char;
            payload.push(ch);
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        Ok(Some(payload))
    }
}

impl<R: Read + Send> MessageReader for FramedReader<R> {
    fn read_message(&mut self) -> io::Result<Option<String>> {
        // Skip inter-message whitespace, then decide between a framed
        // header block and a raw JSON object.
        let first = loop {
            match self.read_byte()? {
                None => return Ok(None),
                Some(byte) if byte.is_ascii_whitespace() => continue,
                Some(byte) => break byte,
            }
        };
        if first == b'{' {
            return self.read_raw_json();
        }

        let mut header = vec![first];
        while !header.ends_with(b"\r\n\r\n") {
            let Some(byte) = self.read_byte()? else {
                return Ok(None);
            };
            header.push(byte);
        }
        let header = String::from_utf8_lossy(&header);
        let length = header
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length:"))
            .and_then(|rest| rest.trim().parse::<usize>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header")
            })?;

        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload)?;
        String::from_utf8(payload)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

pub struct FramedWriter<W> {
    inner: W,
}

impl<W: Write + Send> FramedWriter<W> {
    pub fn new(inner: W) -> FramedWriter<W> {
        FramedWriter { inner }
    }
}

impl<W: Write + Send> MessageWriter for FramedWriter<W> {
    fn write_message(&mut self, payload: &str) -> io::Result<()> {
        write!(
            self.inner,
            "Content-Length: {}\r\n\r\n{}",
            payload.len(),
            payload
        )?;
        self.inner.flush()
    }
}

/// Reader/writer pair over this process's stdio.
pub fn stdio_channel() -> (FramedReader<io::Stdin>, FramedWriter<io::Stdout>) {
    (
        FramedReader::new(io::stdin()),
        FramedWriter::new(io::stdout()),
    )
}

/// Reader/writer pair over one TCP connection.
pub fn tcp_channel(
    stream: TcpStream,
) -> io::Result<(FramedReader<BufReader<TcpStream>>, FramedWriter<TcpStream>)> {
    let writer = stream.try_clone()?;
    Ok((
        FramedReader::new(BufReader::new(stream)),
        FramedWriter::new(writer),
    ))
}
