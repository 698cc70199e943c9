//! Line protocol client for the Xh control server.
//!
//! Protocol Overview:
//! - Transport: TCP, one control connection plus a server-initiated data connection
//! - Commands: free-form text, newline terminated
//! - Responses: sentinel-prefixed lines, see [`crate::response`]
//!
//! Each exchange follows the same shape:
//!
//! ```text
//! client                         server
//!   │  (resync: read until "> ")   │
//!   │ ───── "xstrip open 'xh0'" ──▶ │
//!   │ ◀──── "# opening..." ──────── │  debug, kept in the debug log
//!   │ ◀──── "! warning" ─────────── │  error text, kept as last error
//!   │ ◀──── "* 3" ───────────────── │  terminal return value
//!   │ ◀──── "> " ────────────────── │  prompt, consumed by the next exchange
//! ```
//!
//! A bare prompt in place of a return value means "no value". It is counted
//! as a saved prompt so the next exchange does not wait for another one.
//!
//! Connection-level and protocol-level failures drop the control stream; every
//! later command fails with [`XhError::NotConnected`] until [`XhClient::connect`]
//! is called again.

use crate::data_channel::DataChannel;
use crate::error::{XhError, XhResult};
use crate::response::{ReturnValue, ServerLine};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

/// Read chunk requested from the socket when the buffer runs dry
const READ_CHUNK: usize = 4096;

/// Byte stream usable as the control connection.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// Client side of the Xh line protocol.
pub struct XhClient {
    stream: Option<Box<dyn ControlStream>>,
    remote: Option<String>,
    data: Option<DataChannel>,
    /// Prompts already read but not yet consumed by a command
    saved_prompts: u32,
    read_buf: BytesMut,
    last_error: String,
    debug_messages: Vec<String>,
}

impl Default for XhClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for XhClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XhClient")
            .field("remote", &self.remote)
            .field("connected", &self.stream.is_some())
            .field("data_port", &self.data_port())
            .field("saved_prompts", &self.saved_prompts)
            .finish()
    }
}

impl XhClient {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            stream: None,
            remote: None,
            data: None,
            saved_prompts: 0,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            last_error: String::new(),
            debug_messages: Vec::new(),
        }
    }

    /// Create a client over an already established control stream.
    pub fn with_stream(stream: impl ControlStream + 'static) -> Self {
        let mut client = Self::new();
        client.stream = Some(Box::new(stream));
        client
    }

    /// Open the control connection.
    #[instrument(skip(self), err)]
    pub async fn connect(&mut self, host: &str, port: u16) -> XhResult<()> {
        if self.stream.is_some() {
            return Err(XhError::Connection(format!(
                "already connected to {}",
                self.remote.as_deref().unwrap_or("server")
            )));
        }

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| XhError::Connection(format!("cannot connect to {}:{}: {}", host, port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| XhError::Connection(format!("TCP_NODELAY: {}", e)))?;

        self.reset_state();
        self.stream = Some(Box::new(stream));
        self.remote = Some(format!("{}:{}", host, port));
        tracing::info!("connected to Xh server at {}:{}", host, port);
        Ok(())
    }

    /// Close the control connection and the data channel.
    ///
    /// A `quit` command is sent on a best-effort basis.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(b"quit\n").await;
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
            tracing::info!(
                "disconnected from Xh server {}",
                self.remote.as_deref().unwrap_or("")
            );
        }
        self.data = None;
        self.reset_state();
    }

    /// Whether the control stream is live.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Port of the open data channel, if any.
    pub fn data_port(&self) -> Option<u16> {
        self.data.as_ref().map(DataChannel::port)
    }

    /// Text of the last `!` line received.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Debug lines received during the last wait.
    pub fn debug_messages(&self) -> &[String] {
        &self.debug_messages
    }

    /// Bind the data channel and advertise its port to the server.
    #[instrument(skip(self), err)]
    pub async fn open_data_channel(&mut self) -> XhResult<u16> {
        let channel = DataChannel::open()?;
        let port = channel.port();
        let ack = self.send_wait_int(&format!("port {}", port)).await?;
        if ack < 0 {
            return Err(self.device_error(&format!("server refused data port {}", port)));
        }
        self.data = Some(channel);
        tracing::info!(port, "data channel registered with server");
        Ok(port)
    }

    /// Receive exactly `buf.len()` bytes through the data channel.
    pub async fn receive_data(&mut self, buf: &mut [u8]) -> XhResult<()> {
        let channel = self
            .data
            .as_ref()
            .ok_or_else(|| XhError::Connection("data channel is not open".into()))?;
        let result = channel.receive(buf).await;
        self.poison_on_failure(result)
    }

    /// Send a command and wait for completion, ignoring any return value.
    #[instrument(skip(self), err)]
    pub async fn send_wait(&mut self, command: &str) -> XhResult<()> {
        self.send_no_wait(command).await?;
        self.wait_for_none().await
    }

    /// Send a command and wait for an integer return.
    #[instrument(skip(self), err)]
    pub async fn send_wait_int(&mut self, command: &str) -> XhResult<i64> {
        self.send_no_wait(command).await?;
        self.wait_for_int().await
    }

    /// Send a command and wait for a floating return.
    #[instrument(skip(self), err)]
    pub async fn send_wait_double(&mut self, command: &str) -> XhResult<f64> {
        self.send_no_wait(command).await?;
        self.wait_for_double().await
    }

    /// Send a command and wait for a string return.
    #[instrument(skip(self), err)]
    pub async fn send_wait_string(&mut self, command: &str) -> XhResult<String> {
        self.send_no_wait(command).await?;
        self.wait_for_string().await
    }

    /// Resynchronize to a prompt and send a command without waiting.
    pub async fn send_no_wait(&mut self, command: &str) -> XhResult<()> {
        let result = self.prompt_then_send(command).await;
        self.poison_on_failure(result)
    }

    /// Wait for the pending command to finish; any return value is accepted.
    pub async fn wait_for_none(&mut self) -> XhResult<()> {
        match self.wait_for_return().await? {
            None => Ok(()),
            Some(value) => {
                tracing::trace!(value = %value.describe(), "return value ignored");
                Ok(())
            }
        }
    }

    /// Wait for an integer return of the pending command.
    pub async fn wait_for_int(&mut self) -> XhResult<i64> {
        let value = self.expect_value("integer").await?;
        match value.as_int() {
            Some(v) => Ok(v),
            None => self.mismatch("integer", &value),
        }
    }

    /// Wait for a floating return of the pending command.
    pub async fn wait_for_double(&mut self) -> XhResult<f64> {
        let value = self.expect_value("double").await?;
        match value.as_double() {
            Some(v) => Ok(v),
            None => self.mismatch("double", &value),
        }
    }

    /// Wait for a string return of the pending command.
    ///
    /// `(null)` is reported as a device error with the last error text.
    pub async fn wait_for_string(&mut self) -> XhResult<String> {
        match self.expect_value("string").await? {
            ReturnValue::Text(text) => Ok(text),
            ReturnValue::Null => Err(self.device_error("string command failed")),
            other => self.mismatch("string", &other),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn prompt_then_send(&mut self, command: &str) -> XhResult<()> {
        self.wait_for_prompt().await?;

        let stream = self.stream.as_mut().ok_or(XhError::NotConnected)?;
        tracing::debug!(command, "xh >>");
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn wait_for_prompt(&mut self) -> XhResult<()> {
        if self.stream.is_none() {
            return Err(XhError::NotConnected);
        }
        if self.saved_prompts > 0 {
            self.saved_prompts -= 1;
            return Ok(());
        }
        loop {
            match self.next_line().await? {
                ServerLine::Prompt => return Ok(()),
                ServerLine::Error(msg) => self.record_error(msg),
                ServerLine::Debug(msg) => self.record_debug(msg),
                other => tracing::trace!(?other, "discarded while waiting for prompt"),
            }
        }
    }

    async fn expect_value(&mut self, expected: &str) -> XhResult<ReturnValue> {
        match self.wait_for_return().await? {
            Some(value) => Ok(value),
            None => Err(self.device_error(&format!("no {} returned by the server", expected))),
        }
    }

    async fn wait_for_return(&mut self) -> XhResult<Option<ReturnValue>> {
        let result = self.read_until_terminal().await;
        self.poison_on_failure(result)
    }

    async fn read_until_terminal(&mut self) -> XhResult<Option<ReturnValue>> {
        self.debug_messages.clear();
        loop {
            match self.next_line().await? {
                ServerLine::Prompt => {
                    self.saved_prompts += 1;
                    return Ok(None);
                }
                ServerLine::Error(msg) => self.record_error(msg),
                ServerLine::Debug(msg) => self.record_debug(msg),
                ServerLine::Progress {
                    done,
                    total,
                    message,
                } => tracing::trace!(done, total, %message, "progress"),
                ServerLine::Return(value) => return Ok(Some(value)),
                ServerLine::Unknown(line) => {
                    return Err(XhError::Protocol(format!(
                        "unknown line from server: '{}'",
                        line
                    )))
                }
            }
        }
    }

    /// Read the next line, refilling the buffer as needed.
    async fn next_line(&mut self) -> XhResult<ServerLine> {
        loop {
            // Terminators collapse; the space after a prompt is dropped here too
            let skip = self
                .read_buf
                .iter()
                .take_while(|&&b| matches!(b, b'\r' | b'\n' | b' '))
                .count();
            self.read_buf.advance(skip);

            match self.read_buf.first() {
                None => {}
                Some(&b'>') => {
                    self.read_buf.advance(1);
                    return Ok(ServerLine::Prompt);
                }
                Some(_) => {
                    if let Some(end) = self
                        .read_buf
                        .iter()
                        .position(|&b| b == b'\r' || b == b'\n')
                    {
                        let raw = self.read_buf.split_to(end);
                        let text = String::from_utf8_lossy(&raw);
                        return Ok(ServerLine::parse(&text));
                    }
                }
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> XhResult<()> {
        let stream = self.stream.as_mut().ok_or(XhError::NotConnected)?;
        self.read_buf.reserve(READ_CHUNK);
        match stream.read_buf(&mut self.read_buf).await {
            Ok(0) => Err(XhError::Disconnected),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "control read failed");
                Err(XhError::Disconnected)
            }
        }
    }

    fn record_error(&mut self, msg: String) {
        tracing::warn!(message = %msg, "xh server error");
        self.last_error = msg;
    }

    fn record_debug(&mut self, msg: String) {
        tracing::debug!(message = %msg, "xh server debug");
        self.debug_messages.push(msg);
    }

    fn mismatch<T>(&mut self, expected: &str, got: &ReturnValue) -> XhResult<T> {
        let err = XhError::Protocol(format!(
            "expected {} return, server responded with {}",
            expected,
            got.describe()
        ));
        self.poison_on_failure(Err(err))
    }

    /// Device error carrying the server's last diagnostic, if any.
    pub(crate) fn device_error(&self, context: &str) -> XhError {
        if self.last_error.is_empty() {
            XhError::Device(context.to_string())
        } else {
            XhError::Device(format!("{} [{}]", context, self.last_error))
        }
    }

    fn poison_on_failure<T>(&mut self, result: XhResult<T>) -> XhResult<T> {
        if let Err(err) = &result {
            if err.forces_disconnect() && self.stream.is_some() {
                tracing::warn!(error = %err, "dropping Xh control connection");
                self.stream = None;
                self.data = None;
                self.reset_state();
            }
        }
        result
    }

    fn reset_state(&mut self) {
        self.saved_prompts = 0;
        self.read_buf.clear();
        self.debug_messages.clear();
    }
}
