//! In-memory discovery network and a scripted engine node

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use rexec_core::config::RemoteExecutionConfig;
use rexec_core::{DiscoveryError, EventKind, SessionEvent};
use rexec_protocol::{
    codec, CommandData, CommandOutput, CommandResultData, JsonFrameCodec, Message, MessageType,
    NodeId, OpenConnectionData, OutputType,
};
use rexec_session::{DiscoveryTransport, Session, TransportFactory};

/// Config with short timings and an ephemeral command port
pub fn test_config() -> RemoteExecutionConfig {
    RemoteExecutionConfig {
        command_endpoint: "127.0.0.1:0".parse().unwrap(),
        node_ping_interval: Duration::from_millis(50),
        node_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Datagram hub standing in for the multicast group
pub struct MemoryNetwork {
    to_engines: broadcast::Sender<Vec<u8>>,
    to_session: mpsc::UnboundedSender<Vec<u8>>,
    session_inbox: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        let (to_engines, _) = broadcast::channel(1024);
        let (to_session, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            to_engines,
            to_session,
            session_inbox: Arc::new(tokio::sync::Mutex::new(inbox)),
        })
    }

    /// Session wired to this network
    pub fn session(self: &Arc<Self>, config: RemoteExecutionConfig) -> Session {
        Session::with_transport_factory(config, Arc::new(MemoryTransportFactory(self.clone())))
    }
}

struct MemoryTransportFactory(Arc<MemoryNetwork>);

impl TransportFactory for MemoryTransportFactory {
    fn open(
        &self,
        _config: &RemoteExecutionConfig,
    ) -> Result<Arc<dyn DiscoveryTransport>, DiscoveryError> {
        Ok(Arc::new(MemoryTransport {
            network: self.0.clone(),
        }))
    }
}

struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn send_to_group(&self, datagram: &[u8]) -> io::Result<()> {
        // No engine listening is not an error on a real group either
        let _ = self.network.to_engines.send(datagram.to_vec());
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.network.session_inbox.lock().await;
        match inbox.recv().await {
            Some(datagram) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, "127.0.0.1:6766".parse().unwrap()))
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// Counters and switches shared with the engine tasks
#[derive(Default)]
struct EngineState {
    answering: AtomicBool,
    dialing: AtomicBool,
    dial_delay_ms: AtomicU64,
    last_endpoint: Mutex<Option<OpenConnectionData>>,
    open_requests: AtomicUsize,
    close_requests: AtomicUsize,
    commands: Mutex<Vec<CommandData>>,
    hangup: Notify,
}

/// Engine node that answers pings, dials in on `open_connection` and
/// evaluates a handful of fixed commands
pub struct FakeEngine {
    pub node_id: NodeId,
    state: Arc<EngineState>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    pub fn spawn(network: &Arc<MemoryNetwork>, id: &str, metadata: Value) -> Self {
        let node_id = NodeId::new(id);
        let state = Arc::new(EngineState::default());
        state.answering.store(true, Ordering::SeqCst);
        state.dialing.store(true, Ordering::SeqCst);

        let task = tokio::spawn(run_engine(
            node_id.clone(),
            metadata,
            network.to_engines.subscribe(),
            network.to_session.clone(),
            state.clone(),
        ));

        Self {
            node_id,
            state,
            task,
        }
    }

    /// Stop answering pings
    pub fn silence(&self) {
        self.state.answering.store(false, Ordering::SeqCst);
    }

    /// Ignore `open_connection` requests
    pub fn refuse_connections(&self) {
        self.state.dialing.store(false, Ordering::SeqCst);
    }

    /// Wait before dialing in on `open_connection`
    pub fn delay_dialing(&self, delay: Duration) {
        self.state
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Endpoint advertised by the most recent `open_connection`
    pub fn last_endpoint(&self) -> Option<OpenConnectionData> {
        self.state.last_endpoint.lock().unwrap().clone()
    }

    /// Drop the command connection from the engine side
    pub fn hang_up(&self) {
        self.state.hangup.notify_one();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn open_requests(&self) -> usize {
        self.state.open_requests.load(Ordering::SeqCst)
    }

    pub fn close_requests(&self) -> usize {
        self.state.close_requests.load(Ordering::SeqCst)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_engine(
    node_id: NodeId,
    metadata: Value,
    mut inbox: broadcast::Receiver<Vec<u8>>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<EngineState>,
) {
    loop {
        let datagram = match inbox.recv().await {
            Ok(datagram) => datagram,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Ok(message) = codec::decode(&datagram) else {
            continue;
        };
        if !message.passes_receive_filter(&node_id) {
            continue;
        }

        match message.message_type {
            MessageType::Ping => {
                if state.answering.load(Ordering::SeqCst) {
                    let pong = Message::pong(node_id.clone(), message.source, metadata.clone());
                    let _ = outbox.send(codec::encode(&pong).unwrap());
                }
            }
            MessageType::OpenConnection => {
                let endpoint: OpenConnectionData = message.data_as().unwrap();
                *state.last_endpoint.lock().unwrap() = Some(endpoint.clone());
                state.open_requests.fetch_add(1, Ordering::SeqCst);
                if !state.dialing.load(Ordering::SeqCst) {
                    continue;
                }

                let delay = Duration::from_millis(state.dial_delay_ms.load(Ordering::SeqCst));
                let (node_id, state) = (node_id.clone(), state.clone());
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let addr = format!("{}:{}", endpoint.command_ip, endpoint.command_port);
                    if let Ok(stream) = TcpStream::connect(addr).await {
                        serve_commands(node_id, stream, state).await;
                    }
                });
            }
            MessageType::CloseConnection => {
                state.close_requests.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

async fn serve_commands(node_id: NodeId, stream: TcpStream, state: Arc<EngineState>) {
    let mut framed = Framed::new(stream, JsonFrameCodec::new());

    loop {
        let frame = tokio::select! {
            _ = state.hangup.notified() => break,
            frame = framed.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            break;
        };

        let message = codec::decode(&frame).unwrap();
        let data: CommandData = message.data_as().unwrap();
        state.commands.lock().unwrap().push(data.clone());

        // Give queued commands a chance to pile up behind this one
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = evaluate(&data.command);
        let reply = Message::command_result(node_id.clone(), Some(message.source), &result);
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}

fn evaluate(command: &str) -> CommandResultData {
    if let Some((a, b)) = command.split_once('+') {
        if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
            return CommandResultData {
                success: true,
                result: (a + b).to_string(),
                output: vec![],
            };
        }
    }

    if let Some(text) = command
        .strip_prefix("print('")
        .and_then(|rest| rest.strip_suffix("')"))
    {
        return CommandResultData {
            success: true,
            result: "None".to_string(),
            output: vec![CommandOutput {
                output_type: OutputType::Info,
                output: format!("{}\n", text),
            }],
        };
    }

    if let Some(error) = command.strip_prefix("raise ") {
        let text = format!("Traceback (most recent call last):\n{}", error);
        return CommandResultData {
            success: false,
            result: text.clone(),
            output: vec![CommandOutput {
                output_type: OutputType::Error,
                output: text,
            }],
        };
    }

    CommandResultData {
        success: true,
        result: "None".to_string(),
        output: vec![],
    }
}

/// Forward events of `kind` into a channel
pub fn record(session: &Session, kind: EventKind) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.subscribe(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Next recorded event, failing the test after two seconds
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}
