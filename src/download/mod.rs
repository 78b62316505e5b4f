use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    task::JoinSet,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    peers::Session,
    progress::{DownloadProgress, ProgressConsumer, Telemetry},
    protocol::{peer::PeerId, Info},
    scheduler::Scheduler,
    storage::FileMapper,
    store::{Lease, PieceError, PieceStore, ReleaseOutcome},
    tracker::{Discovery, DownloadStat},
    Config,
};

/// Keep it not super low to prevent event loop congestion
const DEFAULT_TICK_DURATION: Duration = Duration::from_millis(500);
/// How long a pump naps when its peer has nothing schedulable
const PUMP_IDLE_RETRY: Duration = Duration::from_millis(200);
/// Consecutive empty request batches before a lease is abandoned
const MAX_BATCH_TIMEOUTS: u32 = 3;

#[derive(Debug)]
enum DriverError {
    /// Session-local failure, the address cools off
    Peer(anyhow::Error),
    /// Output storage failure, aborts the whole download
    Storage(anyhow::Error),
}

/// Everything a peer driver needs, shared across all of them
#[derive(Debug, Clone)]
struct PeerCtx {
    fingerprint: [u8; 20],
    peer_id: PeerId,
    store: Arc<PieceStore>,
    scheduler: Arc<Scheduler>,
    mapper: Arc<FileMapper>,
    telemetry: Arc<Telemetry>,
    config: Config,
    token: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct DownloadHandle {
    cancellation_token: CancellationToken,
}

impl DownloadHandle {
    /// Abort the download and unwind every session
    pub fn abort(&self) {
        self.cancellation_token.cancel();
    }
}

/// Glue between discovery, the peer pool, per peer sessions and the piece
/// store. One instance per torrent.
#[derive(Debug)]
pub struct Download<D> {
    fingerprint: [u8; 20],
    peer_id: PeerId,
    output_root: PathBuf,
    store: Arc<PieceStore>,
    scheduler: Arc<Scheduler>,
    mapper: Arc<FileMapper>,
    telemetry: Arc<Telemetry>,
    pool: crate::peer_pool::PeerPool,
    discovery: Option<D>,
    config: Config,
    token: CancellationToken,
    tick: Duration,
}

impl<D: Discovery> Download<D> {
    pub fn new(
        info: &Info,
        output_dir: impl Into<PathBuf>,
        peer_id: PeerId,
        discovery: D,
        config: Config,
    ) -> Self {
        let output_root = output_dir.into();
        let store = Arc::new(PieceStore::new(info));
        let scheduler = Arc::new(Scheduler::new(info.pieces.len()));
        let mapper = Arc::new(FileMapper::new(info, &output_root));
        let pool = crate::peer_pool::PeerPool::new(config.max_peers, config.backoff);
        Self {
            fingerprint: info.hash(),
            peer_id,
            output_root,
            store,
            scheduler,
            mapper,
            telemetry: Arc::new(Telemetry::new()),
            pool,
            discovery: Some(discovery),
            config,
            token: CancellationToken::new(),
            tick: DEFAULT_TICK_DURATION,
        }
    }

    pub fn handle(&self) -> DownloadHandle {
        DownloadHandle {
            cancellation_token: self.token.clone(),
        }
    }

    /// Drive the download until every piece is committed, the handle aborts
    /// it, or the output storage fails.
    pub async fn run(mut self, mut progress: impl ProgressConsumer) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.output_root)
            .await
            .with_context(|| format!("create output root {}", self.output_root.display()))?;

        let ctx = PeerCtx {
            fingerprint: self.fingerprint,
            peer_id: self.peer_id,
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            mapper: Arc::clone(&self.mapper),
            telemetry: Arc::clone(&self.telemetry),
            config: self.config.clone(),
            token: self.token.clone(),
        };

        let mut drivers: JoinSet<(SocketAddr, Result<(), DriverError>)> = JoinSet::new();
        let mut discovery_task: Option<tokio::task::JoinHandle<(D, crate::tracker::DiscoveryOutcome)>> =
            None;
        let mut discovery_interval = self.config.tracker_interval;
        let mut last_discovery: Option<Instant> = None;
        let mut tick = tokio::time::interval(self.tick);
        let mut tick_num = 0;
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            while let Some(joined) = drivers.try_join_next() {
                match joined {
                    Ok((addr, result)) => {
                        let failed = result.is_err();
                        match result {
                            Ok(()) => tracing::debug!(%addr, "Peer session closed"),
                            Err(DriverError::Peer(e)) => {
                                tracing::debug!(%addr, "Peer session failed: {e:#}")
                            }
                            Err(DriverError::Storage(e)) => {
                                tracing::error!("Output storage failed: {e:#}");
                                fatal = Some(e);
                            }
                        }
                        self.pool.release(addr, failed, std::time::Instant::now());
                    }
                    Err(e) => tracing::error!("Peer driver panicked: {e}"),
                }
            }

            if fatal.is_some() || self.store.progress().is_complete() {
                break;
            }

            // collect finished discovery before possibly starting a new one
            if discovery_task.as_ref().is_some_and(|task| task.is_finished()) {
                match discovery_task.take().unwrap().await {
                    Ok((discovery, outcome)) => {
                        self.discovery = Some(discovery);
                        if let Some(interval) = outcome.interval {
                            discovery_interval = interval;
                        }
                        let added = self.pool.add_addresses(outcome.peers);
                        if added > 0 {
                            tracing::info!(added, known = self.pool.known_count(), "Discovered peers");
                        }
                    }
                    Err(e) => tracing::error!("Discovery task panicked: {e}"),
                }
            }
            let discovery_due = last_discovery
                .is_none_or(|at| at.elapsed() >= discovery_interval);
            if discovery_due {
                if let Some(mut discovery) = self.discovery.take() {
                    let stat = DownloadStat::from_progress(
                        self.store.progress(),
                        self.store.total_length(),
                    );
                    last_discovery = Some(Instant::now());
                    discovery_task = Some(tokio::spawn(async move {
                        let outcome = discovery.discover(stat).await;
                        (discovery, outcome)
                    }));
                }
            }

            for addr in self.pool.admit(std::time::Instant::now()) {
                tracing::debug!(%addr, "Dialing peer");
                let ctx = ctx.clone();
                drivers.spawn(async move {
                    let result = drive_peer(&ctx, addr).await;
                    (addr, result)
                });
            }

            progress.consume_progress(self.snapshot(tick_num));
            tick_num += 1;

            tokio::select! {
                _ = tick.tick() => {}
                _ = self.token.cancelled() => break,
            }
        }

        tracing::info!("Shutting down download");
        self.token.cancel();
        if let Some(task) = discovery_task {
            task.abort();
        }
        while drivers.join_next().await.is_some() {}
        self.mapper.close_all();
        progress.consume_progress(self.snapshot(tick_num));

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn snapshot(&self, tick_num: usize) -> DownloadProgress {
        let progress = self.store.progress();
        let (pieces_per_second, blocks_per_second) = self.telemetry.rates();
        DownloadProgress {
            completed_pieces: progress.completed_pieces,
            total_pieces: progress.total_pieces,
            completed_bytes: progress.completed_bytes,
            connected_peers: self.pool.active_count(),
            known_peers: self.pool.known_count(),
            pieces_per_second,
            blocks_per_second,
            tick_num,
        }
    }
}

/// Session lifecycle for one address: connect, advertise interest, run the
/// block pumps, retract the availability contribution at the end.
async fn drive_peer(ctx: &PeerCtx, addr: SocketAddr) -> Result<(), DriverError> {
    let connect = Session::connect(addr, ctx.fingerprint, ctx.peer_id, ctx.store.total_pieces());
    let (session, io) = match timeout(ctx.config.connect_timeout, connect).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(DriverError::Peer(e)),
        Err(_) => return Err(DriverError::Peer(anyhow::anyhow!("handshake timed out"))),
    };
    tracing::info!(%addr, session = %session.uuid, "Peer connected");
    let token = ctx.token.child_token();
    let io_task = tokio::spawn(io.run(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.scheduler),
        token.clone(),
    ));

    let pump_result = run_pumps(ctx, &session).await;
    session.close().await;
    let io_result = io_task.await;
    ctx.scheduler.retract(&session.have_snapshot());

    pump_result?;
    match io_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DriverError::Peer(e)),
        Err(e) => Err(DriverError::Peer(anyhow::anyhow!("session task panicked: {e}"))),
    }
}

async fn run_pumps(ctx: &PeerCtx, session: &Session) -> Result<(), DriverError> {
    session
        .interested()
        .await
        .map_err(DriverError::Peer)?;

    let mut pumps = JoinSet::new();
    for _ in 0..ctx.config.pieces_per_peer {
        pumps.spawn(block_pump(session.clone(), ctx.clone()));
    }
    let mut fatal = None;
    while let Some(joined) = pumps.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                fatal = Some(e);
                pumps.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!("Block pump panicked: {e}"),
        }
    }
    match fatal {
        Some(e) => Err(DriverError::Storage(e)),
        None => Ok(()),
    }
}

/// One of `pieces_per_peer` pumps: lease a piece, pipeline its blocks,
/// verify and commit, repeat. Errors returned here are storage-fatal.
async fn block_pump(session: Session, ctx: PeerCtx) -> anyhow::Result<()> {
    loop {
        if ctx.store.progress().is_complete() {
            return Ok(());
        }
        if session.wait_unchoked().await.is_err() {
            // session is gone
            return Ok(());
        }
        let have = session.have_snapshot();
        let Some(lease) = ctx.scheduler.next_piece(&ctx.store, &have) else {
            if session.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(PUMP_IDLE_RETRY).await;
            continue;
        };
        let index = lease.index;
        tracing::trace!(piece = index, addr = %session.addr, "Leased piece");
        match download_piece(&session, &ctx, index).await {
            PieceOutcome::Full => finish_piece(&session, &ctx, lease).await?,
            PieceOutcome::Choked => {
                tracing::debug!(piece = index, addr = %session.addr, "Choked mid piece");
                ctx.store.release_piece(lease, ReleaseOutcome::Reset);
            }
            PieceOutcome::Stalled => {
                tracing::debug!(piece = index, addr = %session.addr, "Abandoning stalled lease");
                ctx.store.release_piece(lease, ReleaseOutcome::Reset);
            }
            PieceOutcome::SessionClosed => {
                ctx.store.release_piece(lease, ReleaseOutcome::Reset);
                return Ok(());
            }
        }
    }
}

async fn finish_piece(session: &Session, ctx: &PeerCtx, lease: Lease) -> anyhow::Result<()> {
    let index = lease.index;
    match ctx.store.assemble_and_verify(index) {
        Ok(bytes) => match ctx.mapper.commit_piece(index, bytes).await {
            Ok(()) => {
                ctx.store.release_piece(lease, ReleaseOutcome::Keep);
                ctx.telemetry.record_piece();
                tracing::debug!(piece = index, addr = %session.addr, "Piece verified and committed");
                Ok(())
            }
            Err(e) => {
                ctx.store.release_piece(lease, ReleaseOutcome::Reset);
                Err(e)
            }
        },
        Err(PieceError::HashMismatch) => {
            // scheduler will retry it, possibly through another peer
            ctx.store.release_piece(lease, ReleaseOutcome::Reset);
            Ok(())
        }
        Err(PieceError::Incomplete) => {
            // a waiter raced the reset, retry the piece
            ctx.store.release_piece(lease, ReleaseOutcome::Reset);
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceOutcome {
    Full,
    Choked,
    Stalled,
    SessionClosed,
}

/// Pipeline request batches for one leased piece until it is full or the
/// peer stops cooperating.
async fn download_piece(session: &Session, ctx: &PeerCtx, index: u32) -> PieceOutcome {
    let mut consecutive_timeouts = 0;
    loop {
        if ctx.store.is_piece_full(index) {
            return PieceOutcome::Full;
        }
        if session.is_choked() {
            return PieceOutcome::Choked;
        }

        let mut batch = Vec::with_capacity(ctx.config.blocks_per_piece);
        while batch.len() < ctx.config.blocks_per_piece {
            let Some(block) = ctx.store.next_missing_block(index) else {
                break;
            };
            let waiter = session.register_waiter(index, block.offset);
            ctx.store.mark_requested(index, block.offset);
            if session.request(block).await.is_err() {
                session.remove_waiter(index, block.offset);
                ctx.store.clear_requested(index, block.offset);
                return PieceOutcome::SessionClosed;
            }
            batch.push((block, waiter));
        }
        if batch.is_empty() {
            // everything in flight was filled by late arrivals, re-check
            tokio::time::sleep(Duration::from_millis(50)).await;
            if session.is_closed() {
                return PieceOutcome::SessionClosed;
            }
            continue;
        }
        if session.flush().await.is_err() {
            for (block, _) in &batch {
                session.remove_waiter(index, block.offset);
                ctx.store.clear_requested(index, block.offset);
            }
            return PieceOutcome::SessionClosed;
        }

        let deadline = Instant::now() + ctx.config.block_timeout;
        let mut received = 0_usize;
        let mut cancelled = false;
        for (block, waiter) in batch {
            match timeout_at(deadline, waiter).await {
                Ok(Ok(data)) => match ctx.store.submit_block(index, block.offset, data) {
                    Ok(_) => {
                        received += 1;
                        ctx.telemetry.record_block();
                    }
                    Err(e) => {
                        tracing::warn!(addr = %session.addr, "Dropping invalid block {block}: {e}");
                        session.close().await;
                        return PieceOutcome::SessionClosed;
                    }
                },
                // waiter failed: the session choked or closed
                Ok(Err(_)) => {
                    ctx.store.clear_requested(index, block.offset);
                    cancelled = true;
                }
                // batch deadline passed, give the block back
                Err(_) => {
                    session.remove_waiter(index, block.offset);
                    ctx.store.clear_requested(index, block.offset);
                    let _ = session.cancel(block).await;
                }
            }
        }
        let _ = session.flush().await;

        if cancelled {
            return if session.is_closed() {
                PieceOutcome::SessionClosed
            } else {
                PieceOutcome::Choked
            };
        }
        if received == 0 {
            consecutive_timeouts += 1;
            tracing::debug!(
                piece = index,
                consecutive_timeouts,
                "Request batch timed out"
            );
            if consecutive_timeouts >= MAX_BATCH_TIMEOUTS {
                return PieceOutcome::Stalled;
            }
        } else {
            consecutive_timeouts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

    use bytes::{Bytes, BytesMut};
    use sha1::{Digest, Sha1};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Encoder, Framed};

    use crate::{
        bitfield::BitField,
        protocol::peer::{HandShake, MessageFramer, PeerId, PeerMessage},
        protocol::{File, Hashes, Info, SizeDescriptor},
        store::PieceStatus,
        tracker::StaticPeers,
        Config,
    };

    use super::Download;

    fn test_config() -> Config {
        Config {
            max_peers: 8,
            pieces_per_peer: 4,
            blocks_per_piece: 16,
            block_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(200),
            tracker_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(2),
            port: 6881,
        }
    }

    fn info_from_pieces(
        name: &str,
        piece_length: u32,
        pieces: &[Vec<u8>],
        files: Option<Vec<(u64, &str)>>,
    ) -> Info {
        let total: u64 = pieces.iter().map(|piece| piece.len() as u64).sum();
        let hashes: Vec<[u8; 20]> = pieces
            .iter()
            .map(|piece| {
                let mut hasher = Sha1::new();
                hasher.update(piece);
                hasher.finalize().into()
            })
            .collect();
        let file_descriptor = match files {
            None => SizeDescriptor::Length(total),
            Some(list) => SizeDescriptor::Files(
                list.into_iter()
                    .map(|(length, name)| File {
                        length,
                        path: vec![name.to_string()],
                    })
                    .collect(),
            ),
        };
        Info {
            raw: Bytes::new(),
            file_descriptor,
            name: name.to_string(),
            piece_length,
            pieces: Hashes(hashes.into()),
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("leech-download-{}", uuid::Uuid::new_v4()))
    }

    fn pattern(len: usize, seed: usize) -> Vec<u8> {
        (0..len).map(|i| ((seed * 31 + i) % 251) as u8).collect()
    }

    #[derive(Debug, Clone, Default)]
    struct MockBehavior {
        /// Serve this many zeroed blocks of piece 0 before real data
        corrupt_blocks: u32,
        /// Choke after serving this many blocks, unchoke shortly after
        choke_after: Option<u32>,
        /// Never answer requests
        silent: bool,
    }

    /// In-process peer speaking the real wire protocol
    struct MockPeer {
        info_hash: [u8; 20],
        content: Arc<Vec<Vec<u8>>>,
        have: Vec<usize>,
        behavior: MockBehavior,
    }

    impl MockPeer {
        async fn spawn(self) -> SocketAddr {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let _ = self.serve(socket).await;
                }
            });
            addr
        }

        async fn send(
            stream: &mut Framed<TcpStream, MessageFramer>,
            message: PeerMessage,
        ) -> anyhow::Result<()> {
            let mut buf = BytesMut::new();
            MessageFramer.encode(message, &mut buf)?;
            stream.get_mut().write_all(&buf).await?;
            Ok(())
        }

        async fn serve(&self, mut socket: TcpStream) -> anyhow::Result<()> {
            let mut handshake = [0_u8; HandShake::SIZE];
            socket.read_exact(&mut handshake).await?;
            let theirs = HandShake::from_bytes(&handshake)?;
            anyhow::ensure!(theirs.info_hash == self.info_hash);
            socket
                .write_all(&HandShake::new(self.info_hash, PeerId::generate()).as_bytes())
                .await?;

            let mut bitfield = BitField::empty(self.content.len());
            for piece in &self.have {
                bitfield.add(*piece).unwrap();
            }
            let mut stream = Framed::new(socket, MessageFramer);
            Self::send(&mut stream, PeerMessage::Bitfield { payload: bitfield }).await?;
            Self::send(&mut stream, PeerMessage::Unchoke).await?;

            let mut served = 0_u32;
            let mut corrupt_remaining = self.behavior.corrupt_blocks;
            while let Some(frame) = stream.next().await {
                let Ok(message) = frame else { break };
                if let PeerMessage::Request { index, begin, length } = message {
                    if self.behavior.silent {
                        continue;
                    }
                    let piece = &self.content[index as usize];
                    let mut data = piece[begin as usize..(begin + length) as usize].to_vec();
                    if index == 0 && corrupt_remaining > 0 {
                        corrupt_remaining -= 1;
                        data.fill(0);
                    }
                    Self::send(
                        &mut stream,
                        PeerMessage::Piece { index, begin, block: data.into() },
                    )
                    .await?;
                    served += 1;
                    if self.behavior.choke_after == Some(served) {
                        Self::send(&mut stream, PeerMessage::Choke).await?;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Self::send(&mut stream, PeerMessage::Unchoke).await?;
                    }
                }
            }
            Ok(())
        }
    }

    async fn run_to_completion(mut download: Download<StaticPeers>, deadline: Duration) {
        download.tick = Duration::from_millis(100);
        tokio::time::timeout(deadline, download.run(()))
            .await
            .expect("download should finish in time")
            .expect("download should succeed");
    }

    #[tokio::test]
    async fn single_piece_end_to_end() {
        let content = vec![vec![b'A'; 16384]];
        let info = info_from_pieces("test.bin", 16384, &content, None);
        let addr = MockPeer {
            info_hash: info.hash(),
            content: Arc::new(content.clone()),
            have: vec![0],
            behavior: MockBehavior::default(),
        }
        .spawn()
        .await;

        let dir = scratch_dir();
        let download = Download::new(
            &info,
            dir.clone(),
            PeerId::generate(),
            StaticPeers { peers: vec![addr] },
            test_config(),
        );
        let store = Arc::clone(&download.store);
        run_to_completion(download, Duration::from_secs(10)).await;

        let progress = store.progress();
        assert_eq!(progress.completed_pieces, 1);
        assert_eq!(progress.total_pieces, 1);
        assert_eq!(progress.completed_bytes, 16384);

        let written = std::fs::read(dir.join("test.bin")).unwrap();
        assert_eq!(written, content[0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn two_peers_split_across_two_files() {
        let pieces = vec![pattern(16384, 0), pattern(16384, 1)];
        let info = info_from_pieces(
            "pair",
            16384,
            &pieces,
            Some(vec![(10000, "a"), (22768, "b")]),
        );
        let content = Arc::new(pieces.clone());
        let peer_a = MockPeer {
            info_hash: info.hash(),
            content: Arc::clone(&content),
            have: vec![0],
            behavior: MockBehavior::default(),
        }
        .spawn()
        .await;
        let peer_b = MockPeer {
            info_hash: info.hash(),
            content: Arc::clone(&content),
            have: vec![1],
            behavior: MockBehavior::default(),
        }
        .spawn()
        .await;

        let dir = scratch_dir();
        let download = Download::new(
            &info,
            dir.clone(),
            PeerId::generate(),
            StaticPeers { peers: vec![peer_a, peer_b] },
            test_config(),
        );
        run_to_completion(download, Duration::from_secs(15)).await;

        let a = std::fs::read(dir.join("pair/a")).unwrap();
        let b = std::fs::read(dir.join("pair/b")).unwrap();
        assert_eq!(a, &pieces[0][..10000]);
        assert_eq!(&b[..6384], &pieces[0][10000..]);
        assert_eq!(&b[6384..], &pieces[1][..]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn hash_mismatch_is_retried_until_the_piece_verifies() {
        let content = vec![pattern(16384, 7)];
        let info = info_from_pieces("retry.bin", 16384, &content, None);
        let addr = MockPeer {
            info_hash: info.hash(),
            content: Arc::new(content.clone()),
            have: vec![0],
            // the whole first round of piece 0 arrives zeroed
            behavior: MockBehavior { corrupt_blocks: 1, ..Default::default() },
        }
        .spawn()
        .await;

        let dir = scratch_dir();
        let download = Download::new(
            &info,
            dir.clone(),
            PeerId::generate(),
            StaticPeers { peers: vec![addr] },
            test_config(),
        );
        let store = Arc::clone(&download.store);
        run_to_completion(download, Duration::from_secs(15)).await;

        assert_eq!(store.piece_status(0), PieceStatus::Complete);
        let written = std::fs::read(dir.join("retry.bin")).unwrap();
        assert_eq!(written, content[0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn choke_mid_piece_recovers_after_unchoke() {
        // one piece of four blocks, peer chokes after serving three
        let content = vec![pattern(4 * 16384, 3)];
        let info = info_from_pieces("choke.bin", 4 * 16384, &content, None);
        let addr = MockPeer {
            info_hash: info.hash(),
            content: Arc::new(content.clone()),
            have: vec![0],
            behavior: MockBehavior { choke_after: Some(3), ..Default::default() },
        }
        .spawn()
        .await;

        let dir = scratch_dir();
        let download = Download::new(
            &info,
            dir.clone(),
            PeerId::generate(),
            StaticPeers { peers: vec![addr] },
            test_config(),
        );
        let store = Arc::clone(&download.store);
        run_to_completion(download, Duration::from_secs(15)).await;

        let progress = store.progress();
        assert_eq!(progress.completed_pieces, 1);
        assert_eq!(progress.completed_bytes, 4 * 16384);
        let written = std::fs::read(dir.join("choke.bin")).unwrap();
        assert_eq!(written, content[0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_the_piece_returns_to_missing() {
        let content = vec![vec![b'B'; 16384]];
        let info = info_from_pieces("silent.bin", 16384, &content, None);
        let addr = MockPeer {
            info_hash: info.hash(),
            content: Arc::new(content.clone()),
            have: vec![0],
            behavior: MockBehavior { silent: true, ..Default::default() },
        }
        .spawn()
        .await;

        let dir = scratch_dir();
        let mut config = test_config();
        config.block_timeout = Duration::from_millis(100);
        let mut download = Download::new(
            &info,
            dir.clone(),
            PeerId::generate(),
            StaticPeers { peers: vec![addr] },
            config,
        );
        download.tick = Duration::from_millis(100);
        let store = Arc::clone(&download.store);
        let handle = download.handle();
        let run = tokio::spawn(download.run(()));

        // three batch timeouts fit comfortably in this window
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!store.progress().is_complete());

        handle.abort();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(store.piece_status(0), PieceStatus::Missing);
        assert_eq!(store.progress().completed_pieces, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
