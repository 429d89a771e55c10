use roster_core::dispatch::Queue;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("HTTP client error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("invalid registry base URL: {0:?}")]
  InvalidBaseUrl(String),

  #[error("the {0} queue is closed")]
  QueueClosed(Queue),
}
