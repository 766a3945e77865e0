//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default swarmlet client id.
pub const SWARMLET_CLIENT_ID: &PeerId = b"swl-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default swarmlet client id, [`SWARMLET_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *SWARMLET_CLIENT_ID,
                listen_port: 6881,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port reported to the tracker. Inbound connections are not accepted
    /// yet, so nothing actually listens on it.
    pub listen_port: u16,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The number of peer connections a torrent keeps open while there are
    /// pieces left to download.
    pub desired_peer_count: usize,

    /// The interval of the coordinator's bookkeeping timer. All session
    /// timeouts are expressed in ticks of this interval.
    pub tick_interval: Duration,

    /// The number of ticks after which a peer that was shown interest but
    /// never unchoked us has its reserved piece freed up.
    pub interest_timeout_ticks: u64,

    /// The number of ticks after which an unanswered block request is either
    /// resent or given up on.
    pub request_timeout_ticks: u64,

    /// How many times a timed out block request is resent before the piece is
    /// suspended and the peer dropped.
    pub max_request_retries: u32,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // Opening more connections than this tends to just spread the
            // same pieces thinner without uploading in return.
            desired_peer_count: 20,
            tick_interval: Duration::from_secs(10),
            interest_timeout_ticks: 4,
            request_timeout_ticks: 5,
            max_request_retries: 2,
        }
    }
}
