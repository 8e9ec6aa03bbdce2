//! Endpoint configuration.

use quiver_quic::TransportParams;
use serde::{Deserialize, Serialize};

/// Tunables for an endpoint. Defaults are in code; deployments deserialize
/// overrides from whatever carrier they like.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Datagram buffers pre-allocated at init.
    pub num_bufs: usize,
    /// Size of each buffer; must exceed the largest acceptable datagram.
    pub buf_len: usize,
    /// ALPN identifiers: offers for a client, the closed supported set for
    /// a server.
    pub alpn: Vec<String>,
    /// Idle timeout advertised to peers, in milliseconds. Zero disables.
    pub idle_timeout_ms: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Length of locally issued connection IDs; zero requests zero-length
    /// scids (the peer then routes to us by address).
    pub cid_len: usize,
    /// Server: answer every token-less Initial with a Retry.
    pub force_retry: bool,
    /// Proactive key updates every this many milliseconds; zero disables.
    pub key_update_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_bufs: 10_000,
            buf_len: 2048,
            alpn: vec!["hq-29".to_owned()],
            idle_timeout_ms: 10_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 17,
            initial_max_streams_bidi: 64,
            initial_max_streams_uni: 16,
            cid_len: 8,
            force_retry: false,
            key_update_interval_ms: 0,
        }
    }
}

impl Config {
    /// The transport parameters this configuration advertises.
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            idle_to: self.idle_timeout_ms,
            max_data: self.initial_max_data,
            max_strm_data_bidi_local: self.initial_max_stream_data,
            max_strm_data_bidi_remote: self.initial_max_stream_data,
            max_strm_data_uni: self.initial_max_stream_data,
            max_strms_bidi: self.initial_max_streams_bidi,
            max_strms_uni: self.initial_max_streams_uni,
            ..TransportParams::default()
        }
    }

    pub fn alpn_bytes(&self) -> Vec<Vec<u8>> {
        self.alpn.iter().map(|proto| proto.as_bytes().to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_to_transport_params() {
        let cfg = Config::default();
        let tp = cfg.transport_params();
        assert_eq!(tp.idle_to, 10_000);
        assert_eq!(tp.max_data, 1 << 20);
        assert_eq!(tp.max_strms_bidi, 64);
    }

    #[test]
    fn overrides_deserialize_over_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"num_bufs": 64, "force_retry": true}"#)
            .unwrap();
        assert_eq!(cfg.num_bufs, 64);
        assert!(cfg.force_retry);
        assert_eq!(cfg.cid_len, 8);
    }
}
