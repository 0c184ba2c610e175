use std::time::Duration;

use bon::Builder;

/// Configuration for a [`ProxyService`](crate::ProxyService).
///
/// ```ignore
/// let config = ProxyConfig::builder()
///     .resolve_timeout(Duration::from_secs(2))
///     .max_decoding_message_size(16 * 1024 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone, Builder)]
pub struct ProxyConfig {
    /// Append the caller's IP to `x-forwarded-for` when the inbound metadata
    /// is propagated to the backend.
    #[builder(default = true)]
    pub forward_peer_address: bool,

    /// Upper bound on a single director call. A director that takes longer
    /// fails the call with `DeadlineExceeded` before anything is relayed.
    pub resolve_timeout: Option<Duration>,

    /// Largest frame accepted on either leg. tonic's default (4 MiB) applies
    /// when unset.
    pub max_decoding_message_size: Option<usize>,

    /// Largest frame sent on either leg. Unlimited when unset.
    pub max_encoding_message_size: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
