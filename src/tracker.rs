//! Communicates with the torrent's tracker and buffers the peer addresses it
//! returns.
//!
//! Only the initial announce is implemented: it fills the torrent's address
//! pool once and the torrent draws replacement connections from that pool
//! until it runs dry. Periodic re-announces don't exist yet.

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde_bytes::ByteBuf;

use crate::{error::*, PeerId, Sha1Hash};

/// Parameters of an announce to the tracker.
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which our client accepts connections, reported to the
    /// tracker so other peers can find us.
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    /// The number of bytes still missing from the download.
    pub left: u64,
    /// The number of peers we'd like to receive. The tracker uses its own
    /// default if not set.
    pub peer_count: Option<usize>,
}

/// The HTTP client of a torrent's tracker.
pub(crate) struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Announces our download to the tracker and returns the peer addresses
    /// it responded with.
    pub async fn announce(&self, params: Announce) -> Result<Vec<SocketAddr>> {
        // The info hash and peer id are raw bytes, which reqwest's query
        // serializer would mangle as utf-8, so they are percent encoded into
        // the url by hand.
        let url = format!(
            "{url}?info_hash={info_hash}&peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encode(&params.info_hash, NON_ALPHANUMERIC),
            peer_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        );
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            // request the compact response format
            ("compact", "1".to_string()),
            ("event", "started".to_string()),
        ];
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }

        log::debug!("Announcing to tracker {}", self.url);
        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let resp: Response = serde_bencode::from_bytes(&body)
            .map_err(|e| Error::Tracker(format!("invalid response: {}", e)))?;
        if let Some(reason) = resp.failure_reason {
            return Err(Error::Tracker(reason));
        }
        if let Some(warning) = resp.warning_message {
            log::warn!("Tracker {} warning: {}", self.url, warning);
        }
        log::debug!(
            "Tracker {} announce interval: {:?}s, seeders: {:?}, leechers: {:?}",
            self.url,
            resp.interval,
            resp.complete,
            resp.incomplete
        );

        let peers = resp
            .peers
            .ok_or_else(|| {
                Error::Tracker("response has no peers".to_string())
            })?
            .chunks(6)
            .filter(|chunk| chunk.len() == 6)
            .map(|chunk| {
                let ip = IpAddr::V4(Ipv4Addr::new(
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ));
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(ip, port)
            })
            .collect();
        Ok(peers)
    }
}

/// The announce response. The peer list is expected in the compact format,
/// a concatenation of 6 byte entries of an IPv4 address and a port, both big
/// endian, as that is what we announce with `compact=1`.
#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    /// The number of seconds to wait between announces.
    interval: Option<u32>,
    /// The number of seeders in the swarm.
    complete: Option<u32>,
    /// The number of leechers in the swarm.
    incomplete: Option<u32>,
    peers: Option<ByteBuf>,
}

/// A torrent's supply of peer addresses.
///
/// The pool is seeded from the initial announce. Addresses are handed out to
/// the torrent as it asks for them and are not returned; once the pool runs
/// dry, requests simply yield fewer addresses (or none) without blocking.
pub(crate) struct PeerSource {
    pool: VecDeque<SocketAddr>,
}

impl PeerSource {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { pool: peers.into() }
    }

    /// Takes up to `count` addresses out of the pool.
    pub fn request_peers(&mut self, count: usize) -> Vec<SocketAddr> {
        let count = count.min(self.pool.len());
        self.pool.drain(..count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_announce_params() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"swl-0000000000000000",
            port: 6881,
            downloaded: 0,
            uploaded: 0,
            left: 1234,
            peer_count: Some(20),
        }
    }

    fn tracker_for_mock() -> Tracker {
        let url = Url::parse(&mockito::server_url())
            .unwrap()
            .join("/announce")
            .unwrap();
        Tracker::new(url)
    }

    #[tokio::test]
    async fn test_announce_parses_compact_peers() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        // 127.0.0.1:6881 and 10.0.0.2:51413
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0xc8, 0xd5]);
        body.extend_from_slice(b"e");

        let _mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_body(body)
            .create();

        let peers = tracker_for_mock()
            .announce(test_announce_params())
            .await
            .unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:51413".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let _mock = mockito::mock("GET", mockito::Matcher::Any)
            .with_body(&b"d14:failure reason12:unregisterede"[..])
            .create();

        match tracker_for_mock().announce(test_announce_params()).await {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected tracker failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announce_unreachable_tracker() {
        // nothing listens on port 1
        let tracker =
            Tracker::new(Url::parse("http://127.0.0.1:1/announce").unwrap());
        assert!(matches!(
            tracker.announce(test_announce_params()).await,
            Err(Error::Tracker(_))
        ));
    }

    #[test]
    fn test_peer_source_hands_out_at_most_pool_size() {
        let peers: Vec<SocketAddr> = vec![
            "10.0.0.1:6881".parse().unwrap(),
            "10.0.0.2:6881".parse().unwrap(),
        ];
        let mut source = PeerSource::new(peers.clone());

        assert_eq!(source.request_peers(1), &peers[..1]);
        // the pool is short, so we get fewer than asked for, immediately
        assert_eq!(source.request_peers(5), &peers[1..]);
        assert!(source.request_peers(5).is_empty());
    }
}
