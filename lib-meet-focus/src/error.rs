use thiserror::Error;

use crate::{source::MediaType, validation::ValidationError};

/// Why a conference-level action was rejected. Existing conference state is
/// intact when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConferenceError {
  #[error("{0} sender count exceeded")]
  SenderCountExceeded(MediaType),
  #[error("no bridge available")]
  NoBridgeAvailable,
  #[error("conference ended")]
  ConferenceEnded,
  #[error("focus is shutting down")]
  GracefulShutdown,
  #[error(transparent)]
  Validation(#[from] ValidationError),
}
