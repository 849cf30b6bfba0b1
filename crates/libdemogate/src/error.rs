use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("queue is full ({cap} waiting)")]
    QueueFull { cap: usize },

    #[error("already in queue")]
    AlreadyQueued,

    #[error("a session is already active")]
    SlotBusy,

    #[error("client not connected: {0}")]
    ClientGone(String),

    #[error("spawn error: {0}")]
    Spawn(String),
}
