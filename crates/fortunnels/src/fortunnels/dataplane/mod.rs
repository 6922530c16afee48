use std::time::Duration;

pub mod bridge;
pub mod crypto;
pub mod datagram;
pub mod dtls;
pub mod preface;
pub mod quic;
pub mod session;
pub mod strategy;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod wsstream;

pub const TCP_ECHO_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIC_ECHO_TIMEOUT: Duration = Duration::from_secs(3);
pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const ECHO_BUFFER_SIZE: usize = 1024;
