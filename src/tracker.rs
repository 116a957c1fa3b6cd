use crate::error::ApplicationError;
use crate::peer::Peer;
use crate::torrent::TorrentInfo;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Bound on the whole announce round trip.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Handles communication with a BitTorrent tracker
pub struct Tracker;

/// Represents the response returned by a tracker announce request
#[derive(Debug, Deserialize)]
pub struct AnnounceResponse {
    #[serde(rename = "peers")]
    pub peers_data: Option<Value>,
    pub interval:   Option<i64>,
    #[serde(rename = "failure reason")]
    pub failure:    Option<String>,
}

impl AnnounceResponse {
    pub fn peers(&self) -> Vec<Peer> {
        let mut result = Vec::new();

        match self.peers_data.as_ref() {
            // compact form: 4 bytes of IPv4 address and 2 bytes of big-endian port per peer
            Some(Value::Bytes(data)) => {
                for chunk in data.chunks_exact(6) {
                    let ip   = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    result.push(Peer {
                        ip:   IpAddr::V4(ip),
                        port,
                    });
                }
            }
            // dictionary form: a list of {ip, port}
            Some(Value::List(list)) => {
                for item in list {
                    if let Value::Dict(dict) = item {
                        let ip = dict.get(&b"ip".to_vec())
                            .and_then(|v| match v {
                                Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                                _               => None,
                            })
                            .and_then(|s| s.parse::<IpAddr>().ok());

                        let port = dict.get(&b"port".to_vec())
                            .and_then(|v| match v {
                                Value::Int(n) => u16::try_from(*n).ok(),
                                _             => None,
                            });

                        if let (Some(ip), Some(port)) = (ip, port) {
                            result.push(Peer { ip, port });
                        }
                    }
                }
            }
            _ => {}
        }
        result
    }
}

impl Tracker {
    fn encode(bytes: &[u8; 20]) -> String {
        percent_encode(bytes, NON_ALPHANUMERIC).to_string()
    }

    /// Builds the announce URL. Binary fields are percent-encoded by hand
    /// because `Url`'s query serializer only accepts UTF-8.
    pub fn announce_url(torrent: &TorrentInfo, port: u16) -> Result<String, ApplicationError> {
        let base_url = Url::parse(&torrent.announce)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let params = [
            ("info_hash",  Tracker::encode(&torrent.info_hash)),
            ("peer_id",    Tracker::encode(&torrent.peer_id)),
            ("port",       port.to_string()),
            ("uploaded",   "0".to_string()),
            ("downloaded", "0".to_string()),
            ("compact",    "1".to_string()),
            ("left",       "0".to_string()),
        ];

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let sep = if base_url.query().is_some() { '&' } else { '?' };
        Ok(format!("{}{}{}", base_url, sep, query))
    }

    /// Sends an announce request to the tracker and returns the list of peers
    pub async fn announce(&self, torrent: &TorrentInfo, port: u16) -> Result<Vec<Peer>, ApplicationError> {
        let url = Self::announce_url(torrent, port)?;
        debug!(%url, "announcing");

        let client = Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let raw = client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?
            .bytes()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let peers = Self::parse_response(&raw)?;
        info!(count = peers.len(), "tracker returned peers");
        Ok(peers)
    }

    pub fn parse_response(raw: &[u8]) -> Result<Vec<Peer>, ApplicationError> {
        let resp: AnnounceResponse = de::from_bytes(raw)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;
        if let Some(reason) = resp.failure {
            return Err(ApplicationError::TrackerError(reason));
        }
        Ok(resp.peers())
    }
}
