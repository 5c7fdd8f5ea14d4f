//! Async packet transports (abridged and intermediate framing).

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A packet-oriented wire to one datacenter.
pub trait Wire: Send {
    fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next packet.
    ///
    /// Must be cancel-safe: the connection driver races this against queue
    /// wakeups in a `select!`, so a dropped call must not lose bytes already
    /// pulled off the stream.
    fn recv(&mut self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// HTTP-like wires need explicit long-poll requests to receive pushes.
    fn is_http(&self) -> bool {
        false
    }
}

// ─── Abridged ─────────────────────────────────────────────────────────────────

/// Abridged framing: 1-byte (or 0x7f + 3-byte) length in 4-byte words.
pub struct Abridged<S> {
    stream: S,
    /// Whether the 0xef init byte has been sent.
    init_sent: bool,
    /// Bytes read but not yet assembled into a frame. Partial frames live
    /// here, which is what makes `recv` safe to drop mid-read.
    rx: Vec<u8>,
}

impl Abridged<TcpStream> {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> Abridged<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, init_sent: false, rx: Vec::new() }
    }

    /// Cut one complete frame off the front of the receive buffer.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let (header, words) = match *self.rx.first()? {
            first if first < 0x7f => (1, first as usize),
            _ => {
                if self.rx.len() < 4 {
                    return None;
                }
                (4, self.rx[1] as usize | (self.rx[2] as usize) << 8 | (self.rx[3] as usize) << 16)
            }
        };
        let total = header + words * 4;
        if self.rx.len() < total {
            return None;
        }
        let frame = self.rx[header..total].to_vec();
        self.rx.drain(..total);
        Some(frame)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Wire for Abridged<S> {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.init_sent {
            self.stream.write_all(&[0xef]).await?;
            self.init_sent = true;
        }
        let words = data.len() / 4;
        if words < 0x7f {
            self.stream.write_all(&[words as u8]).await?;
        } else {
            let header = [
                0x7f,
                (words & 0xff) as u8,
                ((words >> 8) & 0xff) as u8,
                ((words >> 16) & 0xff) as u8,
            ];
            self.stream.write_all(&header).await?;
        }
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            // `read` is cancel-safe; everything it returns lands in the
            // buffer before the next await point.
            let mut chunk = [0u8; 8 * 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}

// ─── Intermediate ─────────────────────────────────────────────────────────────

/// Intermediate framing: plain 4-byte little-endian length prefix.
pub struct Intermediate<S> {
    stream: S,
    init_sent: bool,
    rx: Vec<u8>,
}

impl Intermediate<TcpStream> {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> Intermediate<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, init_sent: false, rx: Vec::new() }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.rx.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]) as usize;
        if self.rx.len() < 4 + len {
            return None;
        }
        let frame = self.rx[4..4 + len].to_vec();
        self.rx.drain(..4 + len);
        Some(frame)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Wire for Intermediate<S> {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.init_sent {
            self.stream.write_all(&[0xee, 0xee, 0xee, 0xee]).await?;
            self.init_sent = true;
        }
        self.stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }
            let mut chunk = [0u8; 8 * 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abridged_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = Abridged::new(a);
        let mut rx = Abridged::new(b);

        tx.send(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        // Peer must skip the init byte first.
        let mut init = [0u8; 1];
        {
            use tokio::io::AsyncReadExt;
            rx.stream.read_exact(&mut init).await.unwrap();
        }
        assert_eq!(init[0], 0xef);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn abridged_large_packet_uses_extended_header() {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let mut tx = Abridged::new(a);
        let mut rx = Abridged::new(b);
        let data = vec![0xAB; 0x7f * 4 + 16];

        tx.send(&data).await.unwrap();
        let mut init = [0u8; 1];
        {
            use tokio::io::AsyncReadExt;
            rx.stream.read_exact(&mut init).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), data);
    }

    #[tokio::test]
    async fn recv_survives_being_dropped_mid_frame() {
        use std::time::Duration;
        use tokio::time::timeout;

        let (mut raw, b) = tokio::io::duplex(1024);
        let mut rx = Abridged::new(b);

        // Only the length header arrives before the read future is dropped.
        raw.write_all(&[2u8]).await.unwrap();
        assert!(timeout(Duration::from_millis(20), rx.recv()).await.is_err());

        raw.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        raw.write_all(&[1u8, 9, 9, 9, 9]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(rx.recv().await.unwrap(), vec![9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn intermediate_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = Intermediate::new(a);
        let mut rx = Intermediate::new(b);

        tx.send(&[9; 10]).await.unwrap();
        let mut init = [0u8; 4];
        {
            use tokio::io::AsyncReadExt;
            rx.stream.read_exact(&mut init).await.unwrap();
        }
        assert_eq!(init, [0xee; 4]);
        assert_eq!(rx.recv().await.unwrap(), vec![9; 10]);
    }
}
