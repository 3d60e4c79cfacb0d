//! Command connection task
//!
//! A single task owns the framed stream. Commands are queued FIFO and only
//! one is in flight: the task writes it, then reads frames until a matching
//! `command_result` arrives, and only then takes the next command. Frames
//! that do not decode, or that are not a result for this session, are logged
//! and dropped without affecting the connection.
//!
//! When the stream ends or fails, the in-flight command and everything still
//! queued fail with [`SessionError::CommandChannel`], and the close callback
//! runs exactly once.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rexec_core::{CloseReason, RemoteNode, SessionError};
use rexec_protocol::{codec, JsonFrameCodec, Message, MessageType, NodeId};

struct PendingCommand {
    message: Message,
    reply: oneshot::Sender<Result<Message, SessionError>>,
}

/// Handle to an open command connection
pub struct CommandChannel {
    node: RemoteNode,
    queue: mpsc::UnboundedSender<PendingCommand>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl CommandChannel {
    /// Take ownership of a connected stream and start serving commands.
    ///
    /// `on_closed` runs once on the connection task after the stream is
    /// gone and every outstanding command has been failed.
    pub fn spawn<S, F>(stream: S, node: RemoteNode, local_id: NodeId, on_closed: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let (queue, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let connection = Connection {
            framed: Framed::new(stream, JsonFrameCodec::new()),
            local_id,
            node_id: node.node_id.clone(),
            queue: receiver,
        };
        tokio::spawn(connection.run(cancel.clone(), finished.clone(), on_closed));

        Self {
            node,
            queue,
            cancel,
            finished,
        }
    }

    /// Node on the other end
    pub fn node(&self) -> &RemoteNode {
        &self.node
    }

    /// Whether the connection task has ended
    pub fn is_closed(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Queue a command and wait for its `command_result` message
    pub async fn send(&self, message: Message) -> Result<Message, SessionError> {
        let (reply, response) = oneshot::channel();
        self.queue
            .send(PendingCommand { message, reply })
            .map_err(|_| SessionError::CommandChannel("Command connection is closed".into()))?;

        response.await.map_err(|_| {
            SessionError::CommandChannel("Command connection closed before replying".into())
        })?
    }

    /// Close the connection and wait for the connection task to finish
    pub async fn close(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Connection<S> {
    framed: Framed<S, JsonFrameCodec>,
    local_id: NodeId,
    node_id: NodeId,
    queue: mpsc::UnboundedReceiver<PendingCommand>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run<F>(mut self, cancel: CancellationToken, finished: CancellationToken, on_closed: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let reason = self.serve(&cancel).await;

        self.queue.close();
        let mut abandoned = 0;
        while let Ok(pending) = self.queue.try_recv() {
            let _ = pending.reply.send(Err(closed_error(&reason)));
            abandoned += 1;
        }

        match &reason {
            CloseReason::Requested => {
                tracing::debug!("Command connection to {} closed", self.node_id)
            }
            CloseReason::RemoteClosed => {
                tracing::info!("Node {} closed the command connection", self.node_id)
            }
            CloseReason::Error(e) => {
                tracing::warn!("Command connection to {} failed: {}", self.node_id, e)
            }
        }
        if abandoned > 0 {
            tracing::debug!("Failed {} queued commands", abandoned);
        }

        drop(self);
        on_closed(reason);
        finished.cancel();
    }

    /// Serve commands until the connection ends
    async fn serve(&mut self, cancel: &CancellationToken) -> CloseReason {
        loop {
            // Idle: wait for work while watching the socket for a hangup
            let pending = tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Requested,
                pending = self.queue.recv() => match pending {
                    Some(pending) => pending,
                    None => return CloseReason::Requested,
                },
                frame = self.framed.next() => match frame {
                    None => return CloseReason::RemoteClosed,
                    Some(Err(e)) => return CloseReason::Error(e.to_string()),
                    Some(Ok(_)) => {
                        tracing::debug!("Dropping unsolicited frame from {}", self.node_id);
                        continue;
                    }
                },
            };

            tracing::trace!("Sending command to {}", self.node_id);
            if let Err(e) = self.framed.send(pending.message).await {
                let reason = CloseReason::Error(e.to_string());
                let _ = pending.reply.send(Err(closed_error(&reason)));
                return reason;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(CloseReason::Requested),
                outcome = self.next_result() => outcome,
            };

            match outcome {
                Ok(result) => {
                    // The caller may have given up waiting; the slot is free either way
                    let _ = pending.reply.send(Ok(result));
                }
                Err(reason) => {
                    let _ = pending.reply.send(Err(closed_error(&reason)));
                    return reason;
                }
            }
        }
    }

    /// Read frames until a `command_result` for this session arrives
    async fn next_result(&mut self) -> Result<Message, CloseReason> {
        loop {
            let frame = match self.framed.next().await {
                None => return Err(CloseReason::RemoteClosed),
                Some(Err(e)) => return Err(CloseReason::Error(e.to_string())),
                Some(Ok(frame)) => frame,
            };

            match codec::decode(&frame) {
                Ok(message)
                    if message.message_type == MessageType::CommandResult
                        && message.passes_receive_filter(&self.local_id) =>
                {
                    return Ok(message);
                }
                Ok(message) => {
                    tracing::debug!(
                        "Ignoring {} from {} while waiting for a result",
                        message.message_type,
                        message.source
                    );
                }
                Err(e) if e.is_foreign() => {
                    tracing::debug!("Dropping undecodable frame from {}: {}", self.node_id, e);
                }
                Err(e) => {
                    tracing::warn!("Dropping frame from {}: {}", self.node_id, e);
                }
            }
        }
    }
}

fn closed_error(reason: &CloseReason) -> SessionError {
    match reason {
        CloseReason::Error(e) => {
            SessionError::CommandChannel(format!("Command connection failed: {}", e))
        }
        other => SessionError::CommandChannel(format!("Command connection {}", other)),
    }
}
