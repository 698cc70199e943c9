//! Binary data channel.
//!
//! The server pushes bulk frame data over a separate TCP connection that it
//! opens back to the client. The client listens on an ephemeral port,
//! advertises it with `port N`, and then accepts one connection per transfer.

use crate::error::{XhError, XhResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket};

/// Listening socket for server-initiated data transfers.
#[derive(Debug)]
pub struct DataChannel {
    listener: TcpListener,
    port: u16,
}

impl DataChannel {
    /// Bind `0.0.0.0:0` with a backlog of one connection.
    pub fn open() -> XhResult<Self> {
        let bind = || -> std::io::Result<TcpListener> {
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
            socket.listen(1)
        };
        let listener = bind().map_err(|e| XhError::Connection(format!("data channel bind: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| XhError::Connection(format!("data channel address: {}", e)))?
            .port();
        tracing::debug!(port, "data channel listening");
        Ok(Self { listener, port })
    }

    /// Port advertised to the server.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one transfer and read exactly `buf.len()` bytes from it.
    ///
    /// The accepted connection is closed before returning.
    pub async fn receive(&self, buf: &mut [u8]) -> XhResult<()> {
        let (mut stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| XhError::Connection(format!("data channel accept: {}", e)))?;
        tracing::trace!(%peer, bytes = buf.len(), "data transfer accepted");

        stream.read_exact(buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn receives_exact_payload() -> XhResult<()> {
        let channel = DataChannel::open()?;
        let port = channel.port();

        let sender = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
            // Split writes to exercise short reads
            stream.write_all(&[1, 2, 3]).await?;
            stream.write_all(&[4, 5]).await?;
            stream.shutdown().await
        });

        let mut buf = [0u8; 5];
        channel.receive(&mut buf).await?;
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        sender.await.map_err(|e| XhError::Connection(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn short_transfer_is_io_error() -> XhResult<()> {
        let channel = DataChannel::open()?;
        let port = channel.port();

        tokio::spawn(async move {
            if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
                let _ = stream.write_all(&[1, 2]).await;
            }
        });

        let mut buf = [0u8; 8];
        let err = channel.receive(&mut buf).await.unwrap_err();
        assert!(matches!(err, XhError::Io(_)));
        Ok(())
    }
}
