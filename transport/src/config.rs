use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::message_header::MessageHeader;
use crate::packet_header::PacketHeader;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// The address the acceptor listens on. Port 0 binds an ephemeral port.
    pub local_address: SocketAddr,

    /// The address announced to peers in the connection handshake. The passive side of a
    ///  connection identifies the channel by this address, so it must be the address peers
    ///  use to reach this node. Defaults to the acceptor's bound address.
    pub public_address: Option<SocketAddr>,

    /// Delay after the first failed reconnect attempt. Each following delay is multiplied by
    ///  `conn_retry_backoff_multiplier`, i.e. the delay after attempt `i` (starting at 0) is
    ///  `conn_retry_initial_delay * conn_retry_backoff_multiplier^i`.
    pub conn_retry_initial_delay: Duration,
    pub conn_retry_backoff_multiplier: f64,
    /// Number of connection attempts the initiator makes after losing a connection before it
    ///  declares the channel lost. 0 means the channel is lost right away.
    pub conn_retry_attempts: u32,

    /// How long a passive find-or-create waits for the peer to connect. `Duration::ZERO` waits
    ///  indefinitely.
    pub passive_connect_duration: Duration,
    /// How long the accepting side of a lost connection waits for the peer to reconnect.
    ///  `Duration::ZERO` declares the channel lost right away.
    pub passive_reconnect_duration: Duration,
    /// Maximum time sending may stay queued or suspended before the connection is declared
    ///  lost. `None` waits indefinitely.
    pub max_output_pause_period: Option<Duration>,

    pub connect_timeout: Duration,
    /// Upper bound for reading the handshake record after accepting a connection
    pub handshake_timeout: Duration,

    pub socket: SocketTuning,

    /// A packet is written as soon as it holds this many messages
    pub max_samples_per_packet: usize,
    /// A packet is written as soon as adding another message would take it beyond this size
    pub optimum_packet_size: usize,
    /// Hard upper bound for a packet's size, including its header. The receiver treats bigger
    ///  packets as a protocol violation.
    pub max_packet_size: usize,
    /// Payloads bigger than this are fragmented into several messages
    pub max_message_size: usize,

    /// Number of bytes read from the socket in a single read call
    pub receive_chunk_size: usize,
}

#[derive(Clone, Debug)]
pub struct SocketTuning {
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    /// NB: Nagle's algorithm is on by default for TCP, disabling it sets `TCP_NODELAY`
    pub enable_nagle_algorithm: bool,
}

impl Default for SocketTuning {
    fn default() -> Self {
        SocketTuning {
            send_buffer_size: None,
            receive_buffer_size: None,
            enable_nagle_algorithm: false,
        }
    }
}

impl TransportConfig {
    pub fn new(local_address: SocketAddr) -> TransportConfig {
        TransportConfig {
            local_address,
            public_address: None,
            conn_retry_initial_delay: Duration::from_millis(500),
            conn_retry_backoff_multiplier: 2.0,
            conn_retry_attempts: 3,
            passive_connect_duration: Duration::from_secs(10),
            passive_reconnect_duration: Duration::from_secs(2),
            max_output_pause_period: None,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            socket: SocketTuning::default(),
            max_samples_per_packet: 10,
            optimum_packet_size: 4096,
            max_packet_size: 1024*1024,
            max_message_size: 64*1024,
            receive_chunk_size: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.conn_retry_backoff_multiplier >= 1.0) || !self.conn_retry_backoff_multiplier.is_finite() {
            bail!("backoff multiplier must be a finite number >= 1.0, was {}", self.conn_retry_backoff_multiplier);
        }
        if self.max_samples_per_packet == 0 || self.max_samples_per_packet > u16::MAX as usize {
            bail!("max samples per packet must be between 1 and {}", u16::MAX);
        }
        if self.max_message_size == 0 {
            bail!("max message size must not be 0");
        }
        if self.max_packet_size > u32::MAX as usize {
            bail!("max packet size must fit into the packet header's u32 length field");
        }
        if self.max_packet_size < PacketHeader::SERIALIZED_LEN + MessageHeader::SERIALIZED_LEN + self.max_message_size {
            bail!("max packet size ({}) is too small for a message of max message size ({})", self.max_packet_size, self.max_message_size);
        }
        if self.optimum_packet_size > self.max_packet_size {
            bail!("optimum packet size ({}) is bigger than max packet size ({})", self.optimum_packet_size, self.max_packet_size);
        }
        if self.receive_chunk_size == 0 {
            bail!("receive chunk size must not be 0");
        }

        Ok(())
    }

    /// `None` stands for 'wait indefinitely'
    pub fn passive_connect_timeout(&self) -> Option<Duration> {
        if self.passive_connect_duration.is_zero() {
            None
        }
        else {
            Some(self.passive_connect_duration)
        }
    }

    pub fn is_passive_reconnect_enabled(&self) -> bool {
        !self.passive_reconnect_duration.is_zero()
    }
}
