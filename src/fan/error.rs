use thiserror::Error;

/// Failures reported by a device client.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("device is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("DP query failed: {0}")]
    Query(String),

    #[error("DP write failed: {0}")]
    Set(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
