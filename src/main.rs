use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use leech::{Config, Download, DownloadProgress, PeerId, TorrentFile, TrackerSet};

#[derive(Parser)]
#[command(version, about = "Download-only BitTorrent client", long_about = None)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the payload is written into
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Log scheduling decisions and peer chatter
    #[arg(short, long)]
    verbose: bool,
}

fn print_progress() -> impl FnMut(DownloadProgress) + Send + 'static {
    move |progress: DownloadProgress| {
        // the engine ticks twice a second, print every other second
        if progress.tick_num % 4 != 0 && !progress.is_complete() {
            return;
        }
        println!(
            "{:6.2}% | {}/{} pieces | {:.1} MiB | {} peers | {:.2} pieces/s | {:.0} blocks/s",
            progress.percent(),
            progress.completed_pieces,
            progress.total_pieces,
            progress.completed_bytes as f64 / 1024. / 1024.,
            progress.connected_peers,
            progress.pieces_per_second,
            progress.blocks_per_second,
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose { "leech=debug" } else { "leech=info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let torrent = TorrentFile::from_path(&args.torrent)
        .with_context(|| format!("read torrent file {}", args.torrent.display()))?;
    print!("{}", torrent.info);

    let config = Config::default();
    let peer_id = PeerId::generate();
    let trackers = TrackerSet::new(
        torrent.all_trackers(),
        torrent.info.hash(),
        peer_id,
        config.port,
    );
    anyhow::ensure!(!trackers.is_empty(), "torrent has no usable trackers");

    let download = Download::new(&torrent.info, args.output.clone(), peer_id, trackers, config);
    let handle = download.handle();
    let mut run = tokio::spawn(download.run(print_progress()));

    tokio::select! {
        result = &mut run => result??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            handle.abort();
            run.await??;
        }
    }
    println!("Done");
    Ok(())
}
