use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Snapshot handed to the progress consumer once per engine tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadProgress {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub completed_bytes: u64,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub pieces_per_second: f64,
    pub blocks_per_second: f64,
    pub tick_num: usize,
}

impl DownloadProgress {
    pub fn percent(&self) -> f32 {
        if self.total_pieces == 0 {
            return 100.;
        }
        self.completed_pieces as f32 / self.total_pieces as f32 * 100.
    }

    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }
}

pub trait ProgressConsumer: Send + 'static {
    fn consume_progress(&mut self, progress: DownloadProgress);
}

impl<F> ProgressConsumer for F
where
    F: FnMut(DownloadProgress) + Send + 'static,
{
    fn consume_progress(&mut self, progress: DownloadProgress) {
        self(progress);
    }
}

impl ProgressConsumer for std::sync::mpsc::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.send(progress);
    }
}

impl ProgressConsumer for tokio::sync::mpsc::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.try_send(progress);
    }
}

impl ProgressConsumer for tokio::sync::watch::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.send(progress);
    }
}

impl ProgressConsumer for () {
    fn consume_progress(&mut self, _progress: DownloadProgress) {}
}

/// Completions per second over a short recency window. Display data only.
#[derive(Debug)]
struct RateWindow {
    samples: VecDeque<Instant>,
    window: Duration,
}

impl RateWindow {
    const MAX_SAMPLES: usize = 512;

    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(Self::MAX_SAMPLES),
            window,
        }
    }

    fn record(&mut self, now: Instant) {
        if self.samples.len() == Self::MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(now);
    }

    fn per_second(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        let recent: Vec<&Instant> = self.samples.iter().filter(|at| **at >= cutoff).collect();
        if recent.len() < 2 {
            return 0.;
        }
        let span = recent[recent.len() - 1].duration_since(*recent[0]).as_secs_f64();
        if span <= 0. {
            return 0.;
        }
        (recent.len() - 1) as f64 / span
    }
}

/// Piece and block completion counters shared between the pump tasks and
/// the engine tick.
#[derive(Debug)]
pub struct Telemetry {
    pieces: Mutex<RateWindow>,
    blocks: Mutex<RateWindow>,
}

impl Telemetry {
    const WINDOW: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self {
            pieces: Mutex::new(RateWindow::new(Self::WINDOW)),
            blocks: Mutex::new(RateWindow::new(Self::WINDOW)),
        }
    }

    pub fn record_piece(&self) {
        self.pieces.lock().unwrap().record(Instant::now());
    }

    pub fn record_block(&self) {
        self.blocks.lock().unwrap().record(Instant::now());
    }

    /// `(pieces_per_second, blocks_per_second)`
    pub fn rates(&self) -> (f64, f64) {
        let now = Instant::now();
        (
            self.pieces.lock().unwrap().per_second(now),
            self.blocks.lock().unwrap().per_second(now),
        )
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
