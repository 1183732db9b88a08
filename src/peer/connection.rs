use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::queue::RequestQueue;
use super::transport::{exchange_handshakes, MessageReader, MessageWriter};
use crate::info_hash::InfoHash;
use crate::picker::{BlockRequest, PiecePicker};

/// Timeouts governing a peer connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Deadline for each direction of the handshake.
    pub handshake_timeout: Duration,
    /// How long a transmitted request may stay unanswered.
    pub request_timeout: Duration,
    /// How long the peer may keep us choked while we have queued work.
    pub unchoke_timeout: Duration,
    /// Idle interval after which a keep-alive is sent.
    pub keepalive_interval: Duration,
    /// Socket-level read stall limit.
    pub read_timeout: Duration,
    /// Socket-level write stall limit.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            unchoke_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// What a connection reports to its consumer.
#[derive(Debug)]
pub enum PeerEvent {
    /// A requested block arrived.
    Downloaded { request: BlockRequest, data: Bytes },
    /// The connection is gone; terminal.
    Disconnected { reason: PeerError },
}

/// Everything the connection's state machine reacts to. Commands are
/// processed strictly in arrival order by a single task.
#[derive(Debug)]
enum Command {
    /// A wire message from the reader task.
    PeerMessage(Message),
    /// Enqueue a block download.
    Download(BlockRequest),
    /// Declare interest ahead of any download.
    Interested,
    /// Keep-alive timer tick.
    SendKeepAlive,
    /// Liveness check for a transmitted request.
    CheckRequest(BlockRequest),
    /// Liveness check for the choke state.
    CheckUnchoke,
    /// Terminal transport error from the reader task.
    Fatal(PeerError),
}

/// An established connection to one remote peer.
///
/// Two tasks run behind the handle: a reader pumping wire messages into
/// the command queue, and a processor owning all connection state. The
/// handle enqueues commands; results come back on the event stream.
/// Dropping the handle (or calling [`close`](Self::close)) shuts the
/// connection down, returning unfinished requests to the picker.
pub struct PeerConnection {
    addr: SocketAddr,
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: Option<mpsc::Receiver<PeerEvent>>,
    task: JoinHandle<()>,
}

impl PeerConnection {
    /// Dials `addr` and performs the handshake with default timeouts.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: InfoHash,
        our_id: PeerId,
        picker: Arc<dyn PiecePicker>,
    ) -> Result<Self, PeerError> {
        Self::connect_with(addr, info_hash, our_id, picker, ConnectionConfig::default()).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        info_hash: InfoHash,
        our_id: PeerId,
        picker: Arc<dyn PiecePicker>,
        config: ConnectionConfig,
    ) -> Result<Self, PeerError> {
        let mut stream = TcpStream::connect(addr).await?;

        let ours = Handshake::new(info_hash, our_id);
        let theirs =
            exchange_handshakes(&mut stream, &ours, config.handshake_timeout).await?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::HandshakeFailed);
        }
        debug!(%addr, peer = ?theirs.peer_id, "peer handshake complete");

        let (read_half, write_half) = stream.into_split();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);

        // The reader and the timers hold only weak senders: the handle's
        // sender is the one keeping the connection alive, so dropping the
        // handle closes the command queue and tears everything down.
        let reader = tokio::spawn(read_loop(
            MessageReader::new(read_half, config.read_timeout),
            commands_tx.downgrade(),
        ));

        let processor = Processor {
            addr,
            writer: MessageWriter::new(write_half, config.write_timeout),
            commands: commands_tx.downgrade(),
            events: events_tx,
            picker,
            config,
            reader,
            last_message_at: Instant::now(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
            queue: RequestQueue::new(),
            pending: RequestQueue::new(),
            unchoke_check_armed: false,
        };
        processor.schedule(Command::SendKeepAlive, config.keepalive_interval);
        let task = tokio::spawn(processor.run(commands_rx));

        Ok(Self {
            addr,
            peer_id: theirs.peer_id,
            commands: commands_tx,
            events: Some(events_rx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The id the remote sent in its handshake.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Takes the event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events.take()
    }

    /// Enqueues a block download. Duplicates of a queued or in-flight
    /// request are dropped silently.
    pub async fn download(&self, request: BlockRequest) -> Result<(), PeerError> {
        self.send(Command::Download(request)).await
    }

    /// Tells the peer we are interested ahead of any download.
    pub async fn interested(&self) -> Result<(), PeerError> {
        self.send(Command::Interested).await
    }

    /// Shuts the connection down and waits for the state task to finish
    /// relinquishing requests.
    pub async fn close(self) {
        drop(self.commands);
        drop(self.events);
        let _ = self.task.await;
    }

    async fn send(&self, command: Command) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PeerError::ConnectionClosed)
    }
}

async fn read_loop(mut reader: MessageReader, commands: mpsc::WeakSender<Command>) {
    loop {
        let result = reader.next_message().await;
        let Some(commands) = commands.upgrade() else {
            return;
        };
        match result {
            Ok(message) => {
                if commands.send(Command::PeerMessage(message)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = commands.send(Command::Fatal(err)).await;
                return;
            }
        }
    }
}

struct Processor {
    addr: SocketAddr,
    writer: MessageWriter,
    commands: mpsc::WeakSender<Command>,
    events: mpsc::Sender<PeerEvent>,
    picker: Arc<dyn PiecePicker>,
    config: ConnectionConfig,
    reader: JoinHandle<()>,
    last_message_at: Instant,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    peer_bitfield: Option<Bitfield>,
    queue: RequestQueue,
    pending: RequestQueue,
    unchoke_check_armed: bool,
}

impl Processor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let reason = loop {
            match commands.recv().await {
                None => break PeerError::ConnectionClosed,
                Some(command) => {
                    if let Err(err) = self.handle(command).await {
                        break err;
                    }
                }
            }
        };
        self.shutdown(reason).await;
    }

    async fn handle(&mut self, command: Command) -> Result<(), PeerError> {
        match command {
            Command::PeerMessage(message) => {
                self.last_message_at = Instant::now();
                self.on_message(message).await
            }
            Command::Download(request) => self.on_download(request).await,
            Command::Interested => {
                if !self.am_interested {
                    self.transmit(&Message::Interested).await?;
                    self.am_interested = true;
                    self.arm_unchoke_check();
                }
                Ok(())
            }
            Command::SendKeepAlive => {
                if self.last_message_at.elapsed() > self.config.keepalive_interval {
                    self.transmit(&Message::KeepAlive).await?;
                }
                self.schedule(Command::SendKeepAlive, self.config.keepalive_interval);
                Ok(())
            }
            Command::CheckRequest(request) => {
                if self.queue.contains(&request) || self.pending.contains(&request) {
                    return Err(PeerError::PeerDoesNotRespond);
                }
                Ok(())
            }
            Command::CheckUnchoke => {
                self.unchoke_check_armed = false;
                if self.peer_choking {
                    if !self.queue.is_empty() {
                        return Err(PeerError::UnchokeTimeout);
                    }
                    self.arm_unchoke_check();
                }
                Ok(())
            }
            Command::Fatal(err) => Err(err),
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.peer_choking = true;
                if self.am_interested {
                    self.arm_unchoke_check();
                }
                Ok(())
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.promote().await
            }
            Message::Interested | Message::NotInterested => {
                self.peer_interested = matches!(message, Message::Interested);
                trace!(
                    addr = %self.addr,
                    peer_interested = self.peer_interested,
                    am_choking = self.am_choking,
                    "peer interest changed"
                );
                Ok(())
            }
            Message::Bitfield(bits) => {
                self.peer_bitfield = Some(Bitfield::from_bytes(bits));
                Ok(())
            }
            Message::Have { index } => {
                self.peer_bitfield.get_or_insert_with(Bitfield::new).set(index);
                Ok(())
            }
            Message::Piece { index, begin, data } => {
                let request = BlockRequest::new(index, begin, data.len() as u32);
                if !self.pending.remove(&request) {
                    return Err(PeerError::UnexpectedPiece {
                        index,
                        begin,
                        length: data.len() as u32,
                    });
                }
                let _ = self
                    .events
                    .send(PeerEvent::Downloaded { request, data })
                    .await;
                self.promote().await
            }
            // We never unchoke, so requests and cancels have nothing to
            // act on; port and unknown ids are skipped too.
            Message::Request { .. }
            | Message::Cancel { .. }
            | Message::Port(_)
            | Message::Unknown { .. } => {
                trace!(addr = %self.addr, ?message, "ignoring message");
                Ok(())
            }
        }
    }

    async fn on_download(&mut self, request: BlockRequest) -> Result<(), PeerError> {
        if self.queue.contains(&request) || self.pending.contains(&request) {
            return Ok(());
        }
        self.queue.push_back(request);
        self.promote().await
    }

    /// Moves at most one request from the queue onto the wire, declaring
    /// interest first if we have not yet.
    async fn promote(&mut self) -> Result<(), PeerError> {
        if !self.am_interested {
            self.transmit(&Message::Interested).await?;
            self.am_interested = true;
            self.arm_unchoke_check();
        }
        if self.peer_choking {
            return Ok(());
        }
        if let Some(request) = self.queue.pop_front() {
            self.pending.push_back(request);
            self.transmit(&Message::Request {
                index: request.index,
                begin: request.begin,
                length: request.length,
            })
            .await?;
            self.schedule(Command::CheckRequest(request), self.config.request_timeout);
        }
        Ok(())
    }

    async fn transmit(&mut self, message: &Message) -> Result<(), PeerError> {
        self.writer.send(message).await?;
        self.last_message_at = Instant::now();
        Ok(())
    }

    fn arm_unchoke_check(&mut self) {
        if !self.unchoke_check_armed {
            self.unchoke_check_armed = true;
            self.schedule(Command::CheckUnchoke, self.config.unchoke_timeout);
        }
    }

    /// Enqueues `command` after `delay`. Ticks that outlive the
    /// connection find the queue gone and vanish.
    fn schedule(&self, command: Command, delay: Duration) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command).await;
            }
        });
    }

    async fn shutdown(mut self, reason: PeerError) {
        debug!(addr = %self.addr, %reason, "peer connection closing");
        self.reader.abort();
        for request in self.queue.drain() {
            self.picker.unpick(request);
        }
        for request in self.pending.drain() {
            self.picker.unpick(request);
        }
        let _ = self.events.send(PeerEvent::Disconnected { reason }).await;
    }
}
