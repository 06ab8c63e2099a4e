/// Time windows around the channel expiry, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Grace period after `expire_time` before a stored client channel
    /// falls back to broadcasting the funding and refund transactions.
    pub client_rebroadcast_delay: u64,
    /// How long before `expire_time` a stored server channel claims its
    /// best payment, ahead of the refund maturing.
    pub server_close_deadline: u64,
    /// Largest shortfall the server tolerates between a proposed refund's
    /// locktime and the agreed expiry.
    pub server_min_locktime_margin: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_rebroadcast_delay: 5 * 60,
            server_close_deadline: 2 * 60 * 60,
            server_min_locktime_margin: 2 * 60 * 60,
        }
    }
}

impl Config {
    /// Tight windows so tests can cross every deadline quickly.
    pub fn regtest() -> Self {
        Self {
            client_rebroadcast_delay: 5,
            server_close_deadline: 60,
            server_min_locktime_margin: 60,
        }
    }
}
