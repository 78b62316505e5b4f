use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, ensure, Context};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{Encoder, Framed},
    sync::CancellationToken,
};
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    protocol::peer::{HandShake, MessageFramer, PeerId, PeerMessage},
    scheduler::Scheduler,
    store::{Block, PieceStore},
};

const OUT_CHANNEL_CAPACITY: usize = 256;
/// Sessions that stay completely silent for this long are closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum SessionCommand {
    Interested,
    /// Buffered until the next flush so request batches coalesce
    Request(Block),
    Cancel(Block),
    Flush,
    Close,
}

#[derive(Debug)]
struct SessionShared {
    total_pieces: usize,
    /// Remote piece set, grows monotonically. Doubles as this session's
    /// availability contribution.
    have: Mutex<BitField>,
    /// In flight requests waiting for a PIECE frame, keyed by (piece, offset)
    waiters: Mutex<HashMap<(u32, u32), oneshot::Sender<Bytes>>>,
}

/// Cheap handle onto a live peer session. The I/O task owns the socket;
/// everything here goes through the command channel or shared state.
#[derive(Debug, Clone)]
pub struct Session {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    cmd_tx: mpsc::Sender<SessionCommand>,
    choked_rx: watch::Receiver<bool>,
    shared: Arc<SessionShared>,
}

impl Session {
    /// Dial the peer and exchange handshakes. The caller wraps this in its
    /// connect deadline and spawns the returned [`SessionIo`].
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: PeerId,
        total_pieces: usize,
    ) -> anyhow::Result<(Session, SessionIo)> {
        let mut socket = TcpStream::connect(addr).await.context("connect")?;
        let my_handshake = HandShake::new(info_hash, peer_id).as_bytes();
        socket
            .write_all(&my_handshake)
            .await
            .context("send handshake")?;
        let mut response = [0_u8; HandShake::SIZE];
        socket
            .read_exact(&mut response)
            .await
            .context("receive handshake")?;
        let his_handshake = HandShake::from_bytes(&response)?;
        ensure!(
            his_handshake.info_hash == info_hash,
            "handshake info hash mismatch"
        );
        tracing::debug!(%addr, remote_id = %his_handshake.peer_id, "Peer handshake complete");

        let (cmd_tx, cmd_rx) = mpsc::channel(OUT_CHANNEL_CAPACITY);
        let (choked_tx, choked_rx) = watch::channel(true);
        let shared = Arc::new(SessionShared {
            total_pieces,
            have: Mutex::new(BitField::empty(total_pieces)),
            waiters: Mutex::new(HashMap::new()),
        });
        let uuid = Uuid::new_v4();
        let session = Session {
            uuid,
            addr,
            cmd_tx,
            choked_rx,
            shared: Arc::clone(&shared),
        };
        let io = SessionIo {
            uuid,
            addr,
            stream: Framed::new(socket, MessageFramer),
            cmd_rx,
            choked_tx,
            shared,
            out_buf: BytesMut::new(),
        };
        Ok((session, io))
    }

    pub async fn interested(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Interested).await
    }

    pub async fn request(&self, block: Block) -> anyhow::Result<()> {
        self.send(SessionCommand::Request(block)).await
    }

    pub async fn cancel(&self, block: Block) -> anyhow::Result<()> {
        self.send(SessionCommand::Cancel(block)).await
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        self.send(SessionCommand::Flush).await
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }

    async fn send(&self, command: SessionCommand) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| anyhow!("session {} is closed", self.addr))
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn is_choked(&self) -> bool {
        *self.choked_rx.borrow()
    }

    /// Resolves once the peer unchokes us; errors when the session ends
    pub async fn wait_unchoked(&self) -> anyhow::Result<()> {
        let mut choked_rx = self.choked_rx.clone();
        choked_rx
            .wait_for(|choked| !choked)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("session {} is closed", self.addr))
    }

    /// Snapshot of the remote piece set
    pub fn have_snapshot(&self) -> BitField {
        self.shared.have.lock().unwrap().clone()
    }

    /// Register interest in an inbound PIECE frame for `(piece, offset)`
    pub fn register_waiter(&self, piece: u32, offset: u32) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().unwrap().insert((piece, offset), tx);
        rx
    }

    /// Forget a waiter after a timeout. Late frames for it are absorbed by
    /// the store instead.
    pub fn remove_waiter(&self, piece: u32, offset: u32) {
        self.shared.waiters.lock().unwrap().remove(&(piece, offset));
    }
}

/// Owns the socket. Demultiplexes inbound frames into waiter completions
/// and state updates, serializes outbound writes.
#[derive(Debug)]
pub struct SessionIo {
    uuid: Uuid,
    addr: SocketAddr,
    stream: Framed<TcpStream, MessageFramer>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    choked_tx: watch::Sender<bool>,
    shared: Arc<SessionShared>,
    out_buf: BytesMut,
}

impl SessionIo {
    pub async fn run(
        mut self,
        store: Arc<PieceStore>,
        scheduler: Arc<Scheduler>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let result = self.event_loop(&store, &scheduler, &token).await;
        if let Err(e) = &result {
            tracing::debug!(addr = %self.addr, "Session ended with error: {e:#}");
        }
        self.fail_waiters(&store);
        let _ = self.stream.get_mut().shutdown().await;
        result
    }

    async fn event_loop(
        &mut self,
        store: &PieceStore,
        scheduler: &Scheduler,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut idle_check = tokio::time::interval(IDLE_TIMEOUT / 4);
        let mut last_frame = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                command = self.cmd_rx.recv() => match command {
                    None | Some(SessionCommand::Close) => return Ok(()),
                    Some(command) => self.handle_command(command).await?,
                },
                frame = self.stream.next() => match frame {
                    None => bail!("peer closed the connection"),
                    Some(Err(e)) => return Err(e.context("frame peer stream")),
                    Some(Ok(message)) => {
                        last_frame = Instant::now();
                        self.handle_frame(message, store, scheduler)?;
                    }
                },
                _ = idle_check.tick() => {
                    if last_frame.elapsed() > IDLE_TIMEOUT {
                        bail!("peer sent nothing for {IDLE_TIMEOUT:?}");
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> anyhow::Result<()> {
        match command {
            SessionCommand::Interested => {
                self.buffer(PeerMessage::Interested)?;
                self.flush().await?;
            }
            SessionCommand::Request(block) => self.buffer(PeerMessage::request(block))?,
            SessionCommand::Cancel(block) => self.buffer(PeerMessage::cancel(block))?,
            SessionCommand::Flush => self.flush().await?,
            SessionCommand::Close => unreachable!("close is handled by the event loop"),
        }
        Ok(())
    }

    fn buffer(&mut self, message: PeerMessage) -> anyhow::Result<()> {
        MessageFramer.encode(message, &mut self.out_buf)
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        let buf = self.out_buf.split();
        self.stream
            .get_mut()
            .write_all(&buf)
            .await
            .context("write to peer")
    }

    fn handle_frame(
        &mut self,
        message: PeerMessage,
        store: &PieceStore,
        scheduler: &Scheduler,
    ) -> anyhow::Result<()> {
        tracing::trace!(%self.uuid, "Peer sent {message}");
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.choked_tx.send_replace(true);
                self.fail_waiters(store);
            }
            PeerMessage::Unchoke => {
                self.choked_tx.send_replace(false);
            }
            // We never serve data, remote interest changes nothing
            PeerMessage::Interested | PeerMessage::NotInterested => {}
            PeerMessage::Have { index } => {
                self.add_pieces(scheduler, std::iter::once(index as usize));
            }
            PeerMessage::Bitfield { payload } => {
                self.add_pieces(scheduler, payload.pieces());
            }
            PeerMessage::Request { index, .. } => {
                tracing::trace!(addr = %self.addr, "Ignoring request for piece {index}");
            }
            PeerMessage::Piece { index, begin, block } => {
                self.route_block(index, begin, block, store)?;
            }
            PeerMessage::Cancel { .. } => {}
            PeerMessage::Extended { .. } => {
                tracing::trace!(addr = %self.addr, "Ignoring extended message");
            }
        }
        Ok(())
    }

    /// Grow the remote set and push availability deltas for pieces that are
    /// new since the last push. Spare bits past the piece count are ignored.
    fn add_pieces(&self, scheduler: &Scheduler, pieces: impl Iterator<Item = usize>) {
        let mut newly = Vec::new();
        {
            let mut have = self.shared.have.lock().unwrap();
            for piece in pieces {
                if piece < self.shared.total_pieces && !have.has(piece) {
                    have.add(piece).unwrap();
                    newly.push(piece as u32);
                }
            }
        }
        if !newly.is_empty() {
            scheduler.add_pieces(newly);
        }
    }

    fn route_block(
        &mut self,
        index: u32,
        begin: u32,
        block: Bytes,
        store: &PieceStore,
    ) -> anyhow::Result<()> {
        let waiter = self.shared.waiters.lock().unwrap().remove(&(index, begin));
        match waiter {
            Some(tx) => {
                if let Err(data) = tx.send(block) {
                    // The pump gave up on this block, absorb it anyway
                    self.absorb(index, begin, data, store)?;
                }
            }
            None => self.absorb(index, begin, block, store)?,
        }
        Ok(())
    }

    fn absorb(&self, index: u32, begin: u32, data: Bytes, store: &PieceStore) -> anyhow::Result<()> {
        store
            .submit_block(index, begin, data)
            .map(|_| ())
            .map_err(|e| anyhow!("peer sent invalid block for piece {index} offset {begin}: {e}"))
    }

    /// Drop every waiter (receivers observe the cancellation) and give their
    /// blocks back to the store.
    fn fail_waiters(&self, store: &PieceStore) {
        let waiters: Vec<(u32, u32)> = {
            let mut map = self.shared.waiters.lock().unwrap();
            map.drain().map(|(key, _)| key).collect()
        };
        for (piece, offset) in waiters {
            store.clear_requested(piece, offset);
        }
    }
}
