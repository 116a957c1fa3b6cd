use std::time::Duration;

/// Largest block requested from a peer in one `request` message.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Number of block requests kept in flight per piece.
pub const MAX_BACKLOG: usize = 5;

/// Port announced to the tracker.
pub const PORT: u16 = 6881;

/// Tunables shared by the connections, the scheduler and the keep-alive timer.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub port:               u16,
    pub block_size:         u32,
    pub max_backlog:        usize,
    pub connect_timeout:    Duration,
    pub handshake_timeout:  Duration,
    /// How long to wait for the optional initial `bitfield`.
    pub bitfield_timeout:   Duration,
    pub unchoke_timeout:    Duration,
    /// Silence tolerated while blocks are outstanding.
    pub read_timeout:       Duration,
    pub keep_alive:         Duration,
    /// Upper bound on a worker's sleep while other workers hold all claimable work.
    pub claim_retry:        Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port:              PORT,
            block_size:        BLOCK_SIZE,
            max_backlog:       MAX_BACKLOG,
            connect_timeout:   Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            bitfield_timeout:  Duration::from_secs(5),
            unchoke_timeout:   Duration::from_secs(30),
            read_timeout:      Duration::from_secs(30),
            keep_alive:        Duration::from_secs(30),
            claim_retry:       Duration::from_millis(500),
        }
    }
}
