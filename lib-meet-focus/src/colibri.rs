use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
  connection::{RequestError, SignalingConnection},
  messages::{
    ColibriAllocateRequest, ColibriExpireRequest, ColibriUpdateRequest, ContentInfo,
    SignalingMessage, TransportDescription,
  },
  source::ConferenceSourceMap,
  util::generate_id,
};

/// Why a bridge operation failed. Allocation failures are never retried;
/// the caller decides what happens to the participant and the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ColibriError {
  #[error("bridge request timed out")]
  Timeout,
  #[error("bridge rejected the request: {0}")]
  Rejected(String),
  #[error("bridge is going away")]
  BridgeGoingAway,
  #[error("colibri session manager is disposed")]
  Disposed,
}

/// A media-forwarding slot a bridge granted for one participant.
#[derive(Debug, Clone)]
pub struct ColibriAllocation {
  pub bridge: String,
  pub endpoint_id: String,
  pub session_id: String,
  pub transport: TransportDescription,
  pub sources_from_bridge: ConferenceSourceMap,
  pub region: Option<String>,
  pub relay_id: Option<String>,
}

#[derive(Debug, Clone)]
enum CreationState {
  Pending,
  Ready,
  Failed(ColibriError),
}

#[derive(Default)]
struct ColibriInner {
  /// One creation token per bridge carrying this conference. The sender's
  /// latest value is the token state; followers subscribe and wait.
  creations: HashMap<String, watch::Sender<CreationState>>,
  allocations: HashMap<String, ColibriAllocation>,
  disposed: bool,
}

/// Owns every media-forwarding slot of one conference, one per
/// participant. The first allocation on a bridge creates the remote
/// conference object; concurrent callers for the same bridge wait on the
/// creation token and share its outcome.
pub struct ColibriSessionManager {
  connection: Arc<dyn SignalingConnection>,
  conference_id: String,
  room: String,
  request_timeout: Duration,
  inner: Mutex<ColibriInner>,
}

impl ColibriSessionManager {
  pub fn new(
    connection: Arc<dyn SignalingConnection>,
    room: impl Into<String>,
    request_timeout: Duration,
  ) -> Self {
    Self {
      connection,
      conference_id: generate_id(),
      room: room.into(),
      request_timeout,
      inner: Mutex::new(ColibriInner::default()),
    }
  }

  pub fn conference_id(&self) -> &str {
    &self.conference_id
  }

  /// Allocates a slot for `endpoint_id` on `bridge`.
  #[tracing::instrument(level = "debug", skip(self, contents, initial_sources), err)]
  pub async fn allocate(
    &self,
    bridge: &str,
    endpoint_id: &str,
    contents: Vec<ContentInfo>,
    initial_sources: ConferenceSourceMap,
  ) -> Result<ColibriAllocation, ColibriError> {
    enum Role {
      Creator,
      Follower(watch::Receiver<CreationState>),
    }

    let role = {
      let mut inner = self.inner.lock().await;
      if inner.disposed {
        return Err(ColibriError::Disposed);
      }
      match inner.creations.get(bridge) {
        Some(token) => Role::Follower(token.subscribe()),
        None => {
          let (token, _) = watch::channel(CreationState::Pending);
          inner.creations.insert(bridge.to_owned(), token);
          Role::Creator
        },
      }
    };

    let create = match role {
      Role::Creator => true,
      Role::Follower(mut token) => {
        loop {
          let state = token.borrow().clone();
          match state {
            CreationState::Pending => {
              if token.changed().await.is_err() {
                return Err(ColibriError::Rejected(
                  "conference creation abandoned".to_owned(),
                ));
              }
            },
            CreationState::Ready => break,
            CreationState::Failed(e) => return Err(e),
          }
        }
        false
      },
    };

    let request = ColibriAllocateRequest {
      conference_id: self.conference_id.clone(),
      room: self.room.clone(),
      create,
      endpoint_id: endpoint_id.to_owned(),
      contents,
      initial_sources,
    };
    let result = self.request_allocation(bridge, request).await;

    let mut inner = self.inner.lock().await;
    if create {
      match &result {
        Ok(_) => {
          if let Some(token) = inner.creations.get(bridge) {
            token.send_replace(CreationState::Ready);
          }
          info!(bridge, "created remote conference");
        },
        Err(e) => {
          // Broadcast the terminal failure, then retire the token so a
          // later attempt may create afresh.
          if let Some(token) = inner.creations.remove(bridge) {
            token.send_replace(CreationState::Failed(e.clone()));
          }
        },
      }
    }
    let allocation = result?;
    if inner.disposed {
      // Disposed while the request was in flight; unwind the slot.
      drop(inner);
      self.send_expire(bridge, Some(endpoint_id.to_owned())).await;
      return Err(ColibriError::Disposed);
    }
    inner
      .allocations
      .insert(endpoint_id.to_owned(), allocation.clone());
    Ok(allocation)
  }

  /// Pushes source changes for an endpoint to its bridge. Idempotent on
  /// the bridge side, so a timed-out request is retried once.
  pub async fn update_sources(
    &self,
    endpoint_id: &str,
    sources_to_add: ConferenceSourceMap,
    sources_to_remove: ConferenceSourceMap,
  ) -> Result<(), ColibriError> {
    let target = match self.allocation_target(endpoint_id).await {
      Some(target) => target,
      None => return Ok(()),
    };
    let request = SignalingMessage::ColibriUpdate(ColibriUpdateRequest {
      conference_id: self.conference_id.clone(),
      endpoint_id: endpoint_id.to_owned(),
      sources_to_add,
      sources_to_remove,
      transport: None,
    });
    self.request_with_retry(&target, request).await
  }

  /// Pushes updated ICE/DTLS details for an endpoint to its bridge.
  pub async fn update_transport(
    &self,
    endpoint_id: &str,
    transport: TransportDescription,
  ) -> Result<(), ColibriError> {
    let target = match self.allocation_target(endpoint_id).await {
      Some(target) => target,
      None => return Ok(()),
    };
    let request = SignalingMessage::ColibriUpdate(ColibriUpdateRequest {
      conference_id: self.conference_id.clone(),
      endpoint_id: endpoint_id.to_owned(),
      sources_to_add: ConferenceSourceMap::new(),
      sources_to_remove: ConferenceSourceMap::new(),
      transport: Some(transport),
    });
    self.request_with_retry(&target, request).await
  }

  /// Releases one participant's slot. Best-effort: failures are logged and
  /// swallowed, the slot is forgotten either way.
  pub async fn expire(&self, endpoint_id: &str) {
    let removed = {
      let mut inner = self.inner.lock().await;
      inner.allocations.remove(endpoint_id)
    };
    if let Some(allocation) = removed {
      self
        .send_expire(&allocation.bridge, Some(endpoint_id.to_owned()))
        .await;
    }
  }

  /// Releases everything and disposes the manager; all later operations
  /// are no-ops.
  pub async fn expire_conference(&self) {
    let bridges: Vec<String> = {
      let mut inner = self.inner.lock().await;
      if inner.disposed {
        return;
      }
      inner.disposed = true;
      inner.allocations.clear();
      inner.creations.drain().map(|(bridge, _)| bridge).collect()
    };
    for bridge in bridges {
      self.send_expire(&bridge, None).await;
    }
  }

  pub async fn has_allocation(&self, endpoint_id: &str) -> bool {
    self.inner.lock().await.allocations.contains_key(endpoint_id)
  }

  pub async fn allocation_count(&self) -> usize {
    self.inner.lock().await.allocations.len()
  }

  async fn allocation_target(&self, endpoint_id: &str) -> Option<String> {
    let inner = self.inner.lock().await;
    if inner.disposed {
      return None;
    }
    match inner.allocations.get(endpoint_id) {
      Some(allocation) => Some(allocation.bridge.clone()),
      None => {
        debug!(endpoint_id, "no allocation for endpoint, skipping bridge update");
        None
      },
    }
  }

  async fn request_allocation(
    &self,
    bridge: &str,
    request: ColibriAllocateRequest,
  ) -> Result<ColibriAllocation, ColibriError> {
    let endpoint_id = request.endpoint_id.clone();
    let response = self
      .connection
      .request(
        bridge,
        SignalingMessage::ColibriAllocate(request),
        self.request_timeout,
      )
      .await;
    match response {
      Ok(SignalingMessage::ColibriAllocateResponse(response)) => Ok(ColibriAllocation {
        bridge: bridge.to_owned(),
        endpoint_id,
        session_id: response.session_id,
        transport: response.transport,
        sources_from_bridge: response.sources,
        region: response.region,
        relay_id: response.relay_id,
      }),
      Ok(SignalingMessage::Error { condition }) if condition == "gone" => {
        Err(ColibriError::BridgeGoingAway)
      },
      Ok(SignalingMessage::Error { condition }) => Err(ColibriError::Rejected(condition)),
      Ok(other) => Err(ColibriError::Rejected(format!(
        "unexpected reply: {}",
        other.kind()
      ))),
      Err(RequestError::Timeout) => Err(ColibriError::Timeout),
      Err(e) => Err(ColibriError::Rejected(e.to_string())),
    }
  }

  async fn request_with_retry(
    &self,
    bridge: &str,
    request: SignalingMessage,
  ) -> Result<(), ColibriError> {
    let mut attempts = 0;
    loop {
      attempts += 1;
      match self
        .connection
        .request(bridge, request.clone(), self.request_timeout)
        .await
      {
        Ok(SignalingMessage::Ack) => return Ok(()),
        Ok(SignalingMessage::Error { condition }) if condition == "gone" => {
          return Err(ColibriError::BridgeGoingAway);
        },
        Ok(SignalingMessage::Error { condition }) => {
          return Err(ColibriError::Rejected(condition));
        },
        Ok(other) => {
          return Err(ColibriError::Rejected(format!(
            "unexpected reply: {}",
            other.kind()
          )));
        },
        Err(RequestError::Timeout) if attempts < 2 => {
          debug!(bridge, "bridge update timed out, retrying once");
        },
        Err(RequestError::Timeout) => return Err(ColibriError::Timeout),
        Err(e) => return Err(ColibriError::Rejected(e.to_string())),
      }
    }
  }

  async fn send_expire(&self, bridge: &str, endpoint_id: Option<String>) {
    let request = SignalingMessage::ColibriExpire(ColibriExpireRequest {
      conference_id: self.conference_id.clone(),
      endpoint_id,
    });
    if let Err(e) = self.request_with_retry(bridge, request).await {
      warn!(bridge, error = %e, "failed to expire colibri state");
    }
  }
}
