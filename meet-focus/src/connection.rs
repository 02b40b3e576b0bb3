use std::{collections::HashMap, convert::TryFrom, fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{
  sink::{Sink, SinkExt},
  stream::{Stream, StreamExt, TryStreamExt},
};
use lib_meet_focus::{InboundMessage, RequestError, SignalingConnection, SignalingMessage};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{
  http::{Request, Uri},
  Message,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
  bind::{BindQuery, BindResponse},
  iq::{Iq, IqType},
  sasl::{Auth, Mechanism, Success},
  stanza_error::{DefinedCondition, ErrorType, StanzaError},
  websocket::Open,
  BareJid, Element, FullJid, Jid,
};

use crate::wire::{self, Stanza};

#[derive(Debug, Clone, Copy)]
enum ConnectionState {
  OpeningPreAuthentication,
  ReceivingFeaturesPreAuthentication,
  Authenticating,
  OpeningPostAuthentication,
  ReceivingFeaturesPostAuthentication,
  Binding,
  Idle,
}

#[derive(Debug, Clone)]
pub(crate) enum Authentication {
  Anonymous,
  Plain { username: String, password: String },
}

struct ConnectionInner {
  state: ConnectionState,
  jid: Option<FullJid>,
  xmpp_domain: BareJid,
  authentication: Authentication,
  connected_tx: Option<oneshot::Sender<Result<()>>>,
  /// Pending request/response correlation by IQ id.
  pending: HashMap<String, oneshot::Sender<Result<SignalingMessage, RequestError>>>,
  /// Presence routed to joined rooms, keyed by bare room jid.
  presence_routes: HashMap<String, mpsc::Sender<Element>>,
  /// The bridge brewery room, whose presence carries bridge stats.
  brewery: Option<String>,
}

impl fmt::Debug for ConnectionInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionInner")
      .field("state", &self.state)
      .field("jid", &self.jid)
      .finish()
  }
}

/// XMPP-over-WebSocket substrate: authenticates, binds, then converts
/// between stanzas and the focus's typed messages.
#[derive(Clone)]
pub(crate) struct Connection {
  pub(crate) tx: mpsc::Sender<Element>,
  inner: Arc<Mutex<ConnectionInner>>,
  local_jid: Arc<OnceCell<String>>,
  inbound_tx: mpsc::Sender<InboundMessage>,
  inbound_rx: Arc<Mutex<Option<mpsc::Receiver<InboundMessage>>>>,
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection").finish()
  }
}

impl Connection {
  pub(crate) async fn new(
    websocket_url: &str,
    xmpp_domain: &str,
    authentication: Authentication,
  ) -> Result<(Self, impl Future<Output = ()>)> {
    let websocket_url: Uri = websocket_url.parse().context("invalid WebSocket URL")?;
    let xmpp_domain: BareJid = xmpp_domain.parse().context("invalid XMPP domain")?;

    info!("Connecting XMPP WebSocket to {}", websocket_url);
    let request = Request::get(&websocket_url)
      .header("sec-websocket-protocol", "xmpp")
      .body(())
      .context("failed to build WebSocket request")?;
    let (websocket, _response) = tokio_tungstenite::connect_async(request)
      .await
      .context("failed to connect XMPP WebSocket")?;
    let (sink, stream) = websocket.split();
    let (tx, rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let inner = Arc::new(Mutex::new(ConnectionInner {
      state: ConnectionState::OpeningPreAuthentication,
      jid: None,
      xmpp_domain,
      authentication,
      connected_tx: None,
      pending: HashMap::new(),
      presence_routes: HashMap::new(),
      brewery: None,
    }));

    let connection = Self {
      tx: tx.clone(),
      inner: inner.clone(),
      local_jid: Arc::new(OnceCell::new()),
      inbound_tx,
      inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
    };

    let writer = Connection::write_loop(rx, sink);
    let reader = connection.clone().read_loop(tx, stream);

    let background = async move {
      tokio::select! {
        res = reader => if let Err(e) = res { error!("fatal (in read loop): {:?}", e) },
        res = writer => if let Err(e) = res { error!("fatal (in write loop): {:?}", e) },
      }
    };

    Ok((connection, background))
  }

  pub(crate) async fn connect(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    {
      let mut inner = self.inner.lock().await;
      inner.connected_tx = Some(tx);
      let open = Open::new(inner.xmpp_domain.clone());
      self.tx.send(open.into()).await?;
    }
    rx.await?
  }

  pub(crate) async fn jid(&self) -> Option<FullJid> {
    self.inner.lock().await.jid.clone()
  }

  /// Join the bridge brewery room; its occupants' presence feeds the
  /// bridge registry.
  pub(crate) async fn join_brewery(&self, brewery: &str) -> Result<()> {
    let room: BareJid = brewery.parse().context("invalid brewery jid")?;
    {
      let mut inner = self.inner.lock().await;
      inner.brewery = Some(room.to_string());
    }
    let presence =
      xmpp_parsers::presence::Presence::new(xmpp_parsers::presence::Type::None)
        .with_to(Jid::Full(room.with_resource("focus")))
        .with_payloads(vec![Element::builder("x", "http://jabber.org/protocol/muc").build()]);
    self.tx.send(presence.into()).await?;
    Ok(())
  }

  pub(crate) async fn add_presence_route(&self, room: &str, route: mpsc::Sender<Element>) {
    self
      .inner
      .lock()
      .await
      .presence_routes
      .insert(room.to_owned(), route);
  }

  pub(crate) async fn remove_presence_route(&self, room: &str) {
    self.inner.lock().await.presence_routes.remove(room);
  }

  /// Drains the outbound element queue into the websocket, one text frame
  /// per stanza. Returning ends the connection.
  async fn write_loop<S>(mut rx: mpsc::Receiver<Element>, mut sink: S) -> Result<()>
  where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
  {
    while let Some(element) = rx.recv().await {
      let mut buffer = Vec::new();
      element.write_to(&mut buffer)?;
      let frame = String::from_utf8(buffer)?;
      debug!(stanza = %frame, "sending");
      sink.send(Message::Text(frame)).await?;
    }
    Ok(())
  }

  async fn read_loop<S>(self, tx: mpsc::Sender<Element>, mut stream: S) -> Result<()>
  where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
  {
    loop {
      let message = stream
        .try_next()
        .await?
        .ok_or_else(|| anyhow!("unexpected EOF"))?;
      let element: Element = match message {
        Message::Text(xml) => {
          debug!(stanza = %xml, "received");
          xml.parse()?
        },
        _ => {
          warn!("unexpected non-text message on XMPP WebSocket stream");
          continue;
        },
      };

      let mut inner = self.inner.lock().await;
      use ConnectionState::*;
      match inner.state {
        OpeningPreAuthentication => {
          Open::try_from(element)?;
          info!("Connected XMPP WebSocket");
          inner.state = ReceivingFeaturesPreAuthentication;
        },
        ReceivingFeaturesPreAuthentication => {
          let auth = match &inner.authentication {
            Authentication::Anonymous => Auth {
              mechanism: Mechanism::Anonymous,
              data: vec![],
            },
            Authentication::Plain { username, password } => {
              let mut data = Vec::with_capacity(username.len() + password.len() + 2);
              data.push(0u8);
              data.extend_from_slice(username.as_bytes());
              data.push(0u8);
              data.extend_from_slice(password.as_bytes());
              Auth {
                mechanism: Mechanism::Plain,
                data,
              }
            },
          };
          tx.send(auth.into()).await?;
          inner.state = Authenticating;
        },
        Authenticating => {
          Success::try_from(element)?;
          let open = Open::new(inner.xmpp_domain.clone());
          tx.send(open.into()).await?;
          inner.state = OpeningPostAuthentication;
        },
        OpeningPostAuthentication => {
          Open::try_from(element)?;
          info!("Authenticated");
          inner.state = ReceivingFeaturesPostAuthentication;
        },
        ReceivingFeaturesPostAuthentication => {
          let iq = Iq::from_set(crate::generate_id(), BindQuery::new(Some("focus".to_owned())));
          tx.send(iq.into()).await?;
          inner.state = Binding;
        },
        Binding => match Iq::try_from(element) {
          Ok(iq) => {
            let jid = if let IqType::Result(Some(element)) = iq.payload {
              let bind = BindResponse::try_from(element)?;
              FullJid::try_from(bind)?
            }
            else {
              bail!("bind failed");
            };
            info!("My JID: {}", jid);
            let _ = self.local_jid.set(jid.to_string());
            inner.jid = Some(jid);
            if let Some(connected_tx) = inner.connected_tx.take() {
              connected_tx
                .send(Ok(()))
                .map_err(|_| anyhow!("channel closed"))?;
            }
            inner.state = Idle;
          },
          Err(e) => debug!("unexpected element while waiting for bind response: {}", e),
        },
        Idle => {
          drop(inner);
          if let Err(e) = self.handle_stanza(element).await {
            debug!("failed to handle stanza: {:?}", e);
          }
        },
      }
    }
  }

  async fn handle_stanza(&self, element: Element) -> Result<()> {
    if element.is("iq", "jabber:client") {
      let iq = Iq::try_from(element)?;
      return self.handle_iq(iq).await;
    }
    if element.is("presence", "jabber:client") {
      return self.handle_presence(element).await;
    }
    Ok(())
  }

  async fn handle_iq(&self, iq: Iq) -> Result<()> {
    let from = iq.from.clone().context("iq missing from")?;
    match iq.payload {
      IqType::Get(ref element) if element.is("ping", "urn:xmpp:ping") => {
        let pong = Iq::empty_result(from, iq.id.clone())
          .with_from(Jid::Full(self.jid().await.context("not bound")?));
        self.tx.send(pong.into()).await?;
      },
      IqType::Get(ref element) | IqType::Set(ref element) => {
        match wire::parse_payload(element) {
          Ok(message) => self.deliver(from, iq.id, message).await?,
          Err(e) => {
            debug!("unhandled iq payload: {:?}", e);
            let error = StanzaError::new(
              ErrorType::Cancel,
              DefinedCondition::ServiceUnavailable,
              "en",
              "unsupported payload",
            );
            let error_iq = Iq::from_error(iq.id, error).with_to(from);
            self.tx.send(error_iq.into()).await?;
          },
        }
      },
      IqType::Result(payload) => {
        let response = match payload {
          Some(element) => wire::parse_payload(&element)
            .map_err(|_| RequestError::MalformedReply),
          None => Ok(SignalingMessage::Ack),
        };
        self.complete_pending(&iq.id, response).await;
      },
      IqType::Error(error) => {
        let condition = format!("{:?}", error.defined_condition);
        self
          .complete_pending(&iq.id, Ok(SignalingMessage::Error { condition }))
          .await;
      },
    }
    Ok(())
  }

  async fn complete_pending(
    &self,
    id: &str,
    response: Result<SignalingMessage, RequestError>,
  ) {
    let pending = self.inner.lock().await.pending.remove(id);
    match pending {
      Some(tx) => {
        let _ = tx.send(response);
      },
      None => debug!(id, "response for unknown request id"),
    }
  }

  /// Hand an inbound request to the focus and reply with whatever it
  /// decides.
  async fn deliver(&self, from: Jid, id: String, message: SignalingMessage) -> Result<()> {
    let (responder_tx, responder_rx) = oneshot::channel();
    self
      .inbound_tx
      .send(InboundMessage {
        from: from.to_string(),
        message,
        responder: Some(responder_tx),
      })
      .await
      .map_err(|_| anyhow!("focus stopped consuming inbound messages"))?;

    let connection = self.clone();
    tokio::spawn(async move {
      let reply = match responder_rx.await {
        Ok(reply) => reply,
        Err(_) => SignalingMessage::Error {
          condition: "internal-server-error".to_owned(),
        },
      };
      let iq = match reply {
        SignalingMessage::Ack => Iq::empty_result(from, id),
        SignalingMessage::Error { condition } => {
          let error = StanzaError::new(
            ErrorType::Cancel,
            DefinedCondition::NotAcceptable,
            "en",
            condition,
          );
          Iq::from_error(id, error).with_to(from)
        },
        message => match wire::build_payload(&message) {
          Ok(payload) => Iq::from_result(id, Some(Stanza(payload))).with_to(from),
          Err(e) => {
            warn!("failed to build reply payload: {:?}", e);
            return;
          },
        },
      };
      if let Err(e) = connection.tx.send(iq.into()).await {
        warn!("failed to send reply: {:?}", e);
      }
    });
    Ok(())
  }

  async fn handle_presence(&self, element: Element) -> Result<()> {
    let from = element
      .attr("from")
      .context("presence missing from")?
      .to_owned();
    let bare = from
      .parse::<FullJid>()
      .map(|full| BareJid::from(full).to_string())
      .unwrap_or_else(|_| from.clone());

    let (brewery, route) = {
      let inner = self.inner.lock().await;
      (
        inner.brewery.clone(),
        inner.presence_routes.get(&bare).cloned(),
      )
    };

    if brewery.as_deref() == Some(bare.as_str()) {
      if let Some(report) = wire::parse_bridge_stats(&from, &element) {
        let _ = self
          .inbound_tx
          .send(InboundMessage {
            from,
            message: SignalingMessage::BridgeStatusReport(report),
            responder: None,
          })
          .await;
      }
      return Ok(());
    }

    if let Some(route) = route {
      let _ = route.send(element).await;
    }
    Ok(())
  }
}

#[async_trait]
impl SignalingConnection for Connection {
  fn local_jid(&self) -> &str {
    self.local_jid.get().map(String::as_str).unwrap_or("")
  }

  async fn send(&self, to: &str, message: SignalingMessage) -> Result<()> {
    let to: Jid = to.parse().context("invalid recipient jid")?;
    let payload = wire::build_payload(&message)?;
    let iq = Iq::from_set(crate::generate_id(), Stanza(payload)).with_to(to);
    self.tx.send(iq.into()).await?;
    Ok(())
  }

  async fn request(
    &self,
    to: &str,
    message: SignalingMessage,
    timeout: Duration,
  ) -> Result<SignalingMessage, RequestError> {
    let to: Jid = to.parse().map_err(|_| RequestError::Unreachable)?;
    let payload = wire::build_payload(&message).map_err(|_| RequestError::MalformedReply)?;
    let id = crate::generate_id();
    let (response_tx, response_rx) = oneshot::channel();
    self
      .inner
      .lock()
      .await
      .pending
      .insert(id.clone(), response_tx);

    let iq = Iq::from_set(id.clone(), Stanza(payload)).with_to(to);
    if self.tx.send(iq.into()).await.is_err() {
      self.inner.lock().await.pending.remove(&id);
      return Err(RequestError::Unreachable);
    }

    match tokio::time::timeout(timeout, response_rx).await {
      Ok(Ok(response)) => response,
      Ok(Err(_)) => Err(RequestError::Unreachable),
      Err(_) => {
        self.inner.lock().await.pending.remove(&id);
        Err(RequestError::Timeout)
      },
    }
  }

  async fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
    self
      .inbound_rx
      .lock()
      .await
      .take()
      .unwrap_or_else(|| mpsc::channel(1).1)
  }
}
