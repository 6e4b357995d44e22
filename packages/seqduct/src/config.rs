//! Configuration for fan-ins and socket endpoints.

use std::time::Duration;


/// Default upper bound on the payload length of a single element frame (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 << 20;

/// What a fan-in does when one of its sources fails while being pulled
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SourceErrorPolicy {
    /// Log the failure and treat it like exhaustion of that one source
    #[default]
    EndSource,
    /// Deliver the failure to the consumer, which sees it as the cursor's terminal error
    Propagate,
}

/// Configuration for [`CachedFanIn`](crate::CachedFanIn) and
/// [`UncachedFanIn`](crate::UncachedFanIn)
#[derive(Debug, Clone)]
pub struct FanInConfig {
    /// How long a consumer waits for a single element from the sources. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Source failure handling
    pub on_source_error: SourceErrorPolicy,
    /// Name prefix for source worker threads
    pub thread_name: String,
}

impl Default for FanInConfig {
    fn default() -> Self {
        FanInConfig {
            request_timeout: None,
            on_source_error: SourceErrorPolicy::EndSource,
            thread_name: "seqduct-source".into(),
        }
    }
}

impl FanInConfig {
    /// Ownership-chaining setter for [`request_timeout`](Self::request_timeout)
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Ownership-chaining setter for [`on_source_error`](Self::on_source_error)
    pub fn with_source_error_policy(mut self, policy: SourceErrorPolicy) -> Self {
        self.on_source_error = policy;
        self
    }

    /// Ownership-chaining setter for [`thread_name`](Self::thread_name)
    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Configuration for the socket side: [`send`](crate::socket::send),
/// [`receive`](crate::socket::receive), relays and [`PushEndpoint`](crate::PushEndpoint)
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for any single socket read (a credit byte or a frame). `None` blocks forever.
    pub read_timeout: Option<Duration>,
    /// Deadline for any single socket write. `None` blocks forever.
    pub write_timeout: Option<Duration>,
    /// Largest element payload accepted from the peer
    pub max_frame_len: usize,
    /// Whether to disable Nagle's algorithm on the connection
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            read_timeout: None,
            write_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Ownership-chaining setter for [`read_timeout`](Self::read_timeout)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Ownership-chaining setter for [`write_timeout`](Self::write_timeout)
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Ownership-chaining setter for [`max_frame_len`](Self::max_frame_len)
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Ownership-chaining setter for [`nodelay`](Self::nodelay)
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    // apply socket-level options to a freshly opened or accepted connection.
    pub(crate) fn apply(&self, stream: &std::net::TcpStream) -> std::io::Result<()> {
        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.write_timeout)?;
        stream.set_nodelay(self.nodelay)?;
        Ok(())
    }
}
