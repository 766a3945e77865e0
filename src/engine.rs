//! The top level entity of the library, which all torrents of the
//! application run under.
//!
//! The engine's surface is small: [`Engine::add`] starts serving a torrent,
//! [`Engine::status`] reports how far along a download is, and
//! [`Engine::shutdown`] stops everything. Each torrent runs as its own task;
//! the engine only keeps the handles to command and join them.

use std::{collections::HashMap, net::SocketAddr};

use tokio::{sync::oneshot, task};
use url::Url;

use crate::{
    conf::Conf,
    disk::FileMapper,
    error::*,
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::{self, Torrent},
    tracker::{Announce, PeerSource, Tracker},
    Sha1Hash, TorrentId,
};

pub struct Engine {
    conf: Conf,
    /// The torrents the engine is serving, keyed by their info hash.
    torrents: HashMap<Sha1Hash, TorrentHandle>,
}

/// The engine's handle on a running torrent task.
struct TorrentHandle {
    id: TorrentId,
    cmd_chan: torrent::Sender,
    join_handle: task::JoinHandle<()>,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self {
            conf,
            torrents: HashMap::new(),
        }
    }

    /// Starts downloading the torrent described by the metainfo and returns
    /// its info hash, with which the torrent can be queried later.
    ///
    /// The metainfo's tracker is announced to for the initial batch of peer
    /// addresses. If the tracker cannot be reached, or the torrent's files
    /// cannot be created, nothing of the torrent is retained.
    pub async fn add(&mut self, metainfo: Metainfo) -> Result<Sha1Hash> {
        // the metainfo may have been constructed rather than parsed, so
        // reject a malformed one before building anything on top of it
        metainfo.validate()?;
        let info_hash = metainfo.create_info_hash()?;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::AlreadyAdded);
        }

        let url = Url::parse(&metainfo.announce).map_err(|e| {
            Error::Tracker(format!("invalid announce url: {}", e))
        })?;
        let tracker = Tracker::new(url);
        let peers = tracker
            .announce(Announce {
                info_hash,
                peer_id: self.conf.engine.client_id,
                port: self.conf.engine.listen_port,
                downloaded: 0,
                uploaded: 0,
                left: metainfo.total_length(),
                peer_count: Some(self.conf.torrent.desired_peer_count),
            })
            .await?;
        log::info!(
            "Tracker returned {} peer(s) for {}",
            peers.len(),
            metainfo.info.name
        );

        self.start_torrent(metainfo, info_hash, PeerSource::new(peers))
    }

    /// Like [`Engine::add`], but skips the tracker and connects to the given
    /// peer addresses directly. Useful for trackerless swarms whose seeds
    /// are known up front.
    pub async fn add_with_peers(
        &mut self,
        metainfo: Metainfo,
        peers: Vec<SocketAddr>,
    ) -> Result<Sha1Hash> {
        metainfo.validate()?;
        let info_hash = metainfo.create_info_hash()?;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::AlreadyAdded);
        }
        self.start_torrent(metainfo, info_hash, PeerSource::new(peers))
    }

    fn start_torrent(
        &mut self,
        metainfo: Metainfo,
        info_hash: Sha1Hash,
        peer_source: PeerSource,
    ) -> Result<Sha1Hash> {
        let storage = StorageInfo::new(
            &metainfo,
            self.conf.torrent.download_dir.clone(),
        )?;
        // this creates the torrent's directories and files, so a failure
        // here fails the add and nothing is retained
        let disk = FileMapper::new(&storage)?;

        let id = rand::random();
        let (mut torrent, cmd_chan) = Torrent::new(
            id,
            self.conf.torrent.clone(),
            self.conf.engine.client_id,
            metainfo,
            info_hash,
            storage,
            disk,
            peer_source,
        );
        let join_handle = tokio::spawn(async move {
            // the torrent logs its errors; nothing to do with them here
            let _ = torrent.start().await;
        });

        self.torrents.insert(
            info_hash,
            TorrentHandle {
                id,
                cmd_chan,
                join_handle,
            },
        );
        log::info!("Added torrent {} ({})", id, hex::encode(&info_hash));
        Ok(info_hash)
    }

    /// Returns the fraction of the torrent that has been downloaded and
    /// verified, in `[0, 1]`.
    pub async fn status(&self, info_hash: &Sha1Hash) -> Result<f64> {
        let handle = self
            .torrents
            .get(info_hash)
            .ok_or(Error::InvalidTorrentId)?;
        let (chan, port) = oneshot::channel();
        handle.cmd_chan.send(torrent::Command::Status { chan })?;
        port.await.map_err(|_| Error::Channel)
    }

    /// Shuts down all torrents, disconnecting all their peer sessions, and
    /// waits for them to finish.
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.torrents.drain() {
            let _ = handle.cmd_chan.send(torrent::Command::Shutdown);
            if let Err(e) = handle.join_handle.await {
                log::warn!("Torrent {} task panicked: {}", handle.id, e);
            }
        }
    }
}
