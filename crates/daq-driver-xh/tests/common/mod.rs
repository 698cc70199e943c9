//! Scripted stand-in for the Xh server.
//!
//! The fake listens on `127.0.0.1:0`, accepts one control connection and
//! answers each command from a small rule set:
//! - `port N` records the data port
//! - `xstrip open`, `unif-get-nx`, `%xstrip_num_tf` return configured values
//! - `setup-group` echoes the frame count
//! - `read-status` replays a status script, repeating the last entry
//! - `read ... from H raw|long` pushes frames over the data port
//!
//! Tests can override any command prefix with a canned reply.

#![allow(dead_code)] // Not every test file uses every helper

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber once; `RUST_LOG=daq_driver_xh=trace` shows traffic.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Idle status line with every counter at zero.
pub const IDLE: &str = "Idle: group=0, frame=0, scan=0, cycle=0, completed frames=0";

/// Status line for a running generator.
pub fn running(completed: u32) -> String {
    format!("Running: group=0, frame={completed}, scan=0, cycle=0, completed frames={completed}")
}

/// Status line for an idle generator after `completed` frames.
pub fn idle_after(completed: u32) -> String {
    format!("Idle: group=0, frame=0, scan=0, cycle=0, completed frames={completed}")
}

/// Sample value the fake sends for `pixel` of `frame`.
pub fn sample(frame: u64, pixel: u32) -> u32 {
    (frame as u32) * 1000 + pixel
}

struct ServerState {
    commands: Vec<String>,
    handle: i64,
    npixels: u32,
    total_frames: i64,
    statuses: VecDeque<String>,
    last_status: String,
    overrides: Vec<(String, String)>,
    data_port: Option<u16>,
}

/// Handle on a running fake server.
pub struct FakeXhServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl FakeXhServer {
    /// Start a fake detector with `npixels` pixels per frame.
    pub async fn start(npixels: u32) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            commands: Vec::new(),
            handle: 3,
            npixels,
            total_frames: 0,
            statuses: VecDeque::new(),
            last_status: IDLE.to_string(),
            overrides: Vec::new(),
            data_port: None,
        }));

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve(stream, task_state).await;
            }
        });
        Self { addr, state, task }
    }

    /// Control port to connect to.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TOML driver config pointing at this server.
    pub fn config(&self) -> toml::Value {
        let mut table = toml::Table::new();
        table.insert("host".into(), toml::Value::String("127.0.0.1".into()));
        table.insert("port".into(), toml::Value::Integer(i64::from(self.port())));
        toml::Value::Table(table)
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Commands received that start with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Queue status lines returned by `read-status`.
    pub fn script_status<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        state.statuses.extend(lines.into_iter().map(Into::into));
    }

    /// Value returned by `%xstrip_num_tf`.
    pub fn set_total_frames(&self, total: i64) {
        self.state.lock().total_frames = total;
    }

    /// Reply verbatim (before the prompt) to commands starting with `prefix`.
    pub fn reply_to(&self, prefix: &str, reply: &str) {
        self.state
            .lock()
            .overrides
            .push((prefix.to_string(), reply.to_string()));
    }

    /// Data port the client advertised.
    pub fn data_port(&self) -> Option<u16> {
        self.state.lock().data_port
    }
}

impl Drop for FakeXhServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    if write_half.write_all(b"> ").await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }
        if command == "quit" {
            break;
        }
        state.lock().commands.push(command.clone());

        let reply = respond(&command, &state).await;
        let mut out = reply;
        out.push_str("> ");
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn respond(command: &str, state: &Arc<Mutex<ServerState>>) -> String {
    let canned = state
        .lock()
        .overrides
        .iter()
        .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        .map(|(_, reply)| reply.clone());
    if let Some(reply) = canned {
        return reply;
    }

    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["port", port] => {
            state.lock().data_port = port.parse().ok();
            "* 0\n".to_string()
        }
        ["xstrip", "open", ..] => format!("* {}\n", state.lock().handle),
        ["unif-get-nx", ..] => format!("* {}\n", state.lock().npixels),
        ["%xstrip_num_tf"] => format!("* {}\n", state.lock().total_frames),
        ["%xstrip_timing_file"] => "* \"timing.xh\"\n".to_string(),
        ["xstrip", "timing", "setup-group", _sys, _group, frames, ..] => format!("* {}\n", frames),
        ["xstrip", "timing", "read-status", ..] => {
            let mut state = state.lock();
            if let Some(next) = state.statuses.pop_front() {
                state.last_status = next;
            }
            format!("* \"{}\"\n", state.last_status)
        }
        ["read", "0", "0", first, _width, _heads, count, "from", _handle, kind] => {
            let first: u64 = first.parse().unwrap_or(0);
            let count: u64 = count.parse().unwrap_or(0);
            let (npixels, port) = {
                let state = state.lock();
                (state.npixels, state.data_port)
            };
            let wide = *kind == "long";
            let mut payload = Vec::new();
            for frame in first..first + count {
                for pixel in 0..npixels {
                    let value = sample(frame, pixel);
                    if wide {
                        payload.extend_from_slice(&value.to_be_bytes());
                    } else {
                        payload.extend_from_slice(&(value as u16).to_be_bytes());
                    }
                }
            }
            match port {
                Some(port) => match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(mut data) => {
                        let _ = data.write_all(&payload).await;
                        let _ = data.shutdown().await;
                        "* 0\n".to_string()
                    }
                    Err(_) => "! data connection refused\n* -1\n".to_string(),
                },
                None => "! no data port\n* -1\n".to_string(),
            }
        }
        ["xstrip", "hv", "get-adc", ..] | ["xstrip", "tc", "get", ..] => "* 21.5\n".to_string(),
        ["xstrip", "head", "list-caps", ..] => "* \"0 1 2 4 8\"\n".to_string(),
        _ => String::new(),
    }
}
