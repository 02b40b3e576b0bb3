use std::{
  collections::{HashMap, HashSet},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
  },
  time::Duration,
};

use async_trait::async_trait;
use lib_meet_focus::{
  ChatRoom, ChatRoomEvent, ChatRoomMember, ChatRoomProvider, ColibriAllocateResponse,
  ConferenceSourceMap, EndpointSourceSet, FocusConfig, FocusManager, InboundMessage, MediaType,
  MemberRole, RequestError, SignalingConnection, SignalingMessage, Source, TransportDescription,
};
use tokio::sync::{mpsc, oneshot};

/// In-memory substrate standing in for the XMPP connection: outbound
/// traffic is recorded, bridge requests are answered like a well-behaved
/// bridge would.
pub struct MockConnection {
  jid: String,
  sent: StdMutex<Vec<(String, SignalingMessage)>>,
  requests: StdMutex<Vec<(String, SignalingMessage)>>,
  inbound_tx: mpsc::Sender<InboundMessage>,
  inbound_rx: StdMutex<Option<mpsc::Receiver<InboundMessage>>>,
  failing_bridges: StdMutex<HashSet<String>>,
}

impl MockConnection {
  pub fn new() -> Arc<Self> {
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    Arc::new(Self {
      jid: "focus@auth.example.com/focus".to_owned(),
      sent: StdMutex::new(vec![]),
      requests: StdMutex::new(vec![]),
      inbound_tx,
      inbound_rx: StdMutex::new(Some(inbound_rx)),
      failing_bridges: StdMutex::new(HashSet::new()),
    })
  }

  pub fn fail_allocations_on(&self, bridge: &str) {
    self.failing_bridges.lock().unwrap().insert(bridge.to_owned());
  }

  pub fn sent(&self) -> Vec<(String, SignalingMessage)> {
    self.sent.lock().unwrap().clone()
  }

  pub fn requests(&self) -> Vec<(String, SignalingMessage)> {
    self.requests.lock().unwrap().clone()
  }

  /// Messages of one kind sent to one recipient.
  pub fn sent_to(&self, to: &str, kind: &str) -> Vec<SignalingMessage> {
    self
      .sent()
      .into_iter()
      .filter(|(recipient, message)| recipient == to && message.kind() == kind)
      .map(|(_, message)| message)
      .collect()
  }

  /// Inject an inbound message and await the focus's reply.
  pub async fn inject(&self, from: &str, message: SignalingMessage) -> SignalingMessage {
    let (tx, rx) = oneshot::channel();
    self
      .inbound_tx
      .send(InboundMessage {
        from: from.to_owned(),
        message,
        responder: Some(tx),
      })
      .await
      .expect("focus stopped");
    tokio::time::timeout(Duration::from_secs(5), rx)
      .await
      .expect("no reply from focus")
      .expect("responder dropped")
  }
}

#[async_trait]
impl SignalingConnection for MockConnection {
  fn local_jid(&self) -> &str {
    &self.jid
  }

  async fn send(&self, to: &str, message: SignalingMessage) -> anyhow::Result<()> {
    self.sent.lock().unwrap().push((to.to_owned(), message));
    Ok(())
  }

  async fn request(
    &self,
    to: &str,
    message: SignalingMessage,
    _timeout: Duration,
  ) -> Result<SignalingMessage, RequestError> {
    self
      .requests
      .lock()
      .unwrap()
      .push((to.to_owned(), message.clone()));
    let response = match &message {
      SignalingMessage::ColibriAllocate(request) => {
        if self.failing_bridges.lock().unwrap().contains(to) {
          SignalingMessage::Error {
            condition: "internal-server-error".to_owned(),
          }
        }
        else {
          SignalingMessage::ColibriAllocateResponse(ColibriAllocateResponse {
            session_id: format!("colibri-{}", request.endpoint_id),
            transport: TransportDescription::default(),
            sources: ConferenceSourceMap::new(),
            region: None,
            relay_id: None,
          })
        }
      },
      _ => SignalingMessage::Ack,
    };
    Ok(response)
  }

  async fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
    self
      .inbound_rx
      .lock()
      .unwrap()
      .take()
      .unwrap_or_else(|| mpsc::channel(1).1)
  }
}

pub struct MockChatRoom {
  room: String,
  pub events_tx: mpsc::Sender<ChatRoomEvent>,
  events_rx: StdMutex<Option<mpsc::Receiver<ChatRoomEvent>>>,
  pub left: AtomicBool,
}

impl MockChatRoom {
  pub fn new(room: &str) -> Arc<Self> {
    let (events_tx, events_rx) = mpsc::channel(64);
    Arc::new(Self {
      room: room.to_owned(),
      events_tx,
      events_rx: StdMutex::new(Some(events_rx)),
      left: AtomicBool::new(false),
    })
  }

  pub async fn join_member(&self, member: ChatRoomMember) {
    self
      .events_tx
      .send(ChatRoomEvent::MemberJoined(member))
      .await
      .unwrap();
  }

  pub async fn leave_member(&self, endpoint_id: &str) {
    self
      .events_tx
      .send(ChatRoomEvent::MemberLeft {
        endpoint_id: endpoint_id.to_owned(),
      })
      .await
      .unwrap();
  }
}

#[async_trait]
impl ChatRoom for MockChatRoom {
  fn room_jid(&self) -> &str {
    &self.room
  }

  async fn join(&self) -> anyhow::Result<mpsc::Receiver<ChatRoomEvent>> {
    self
      .events_rx
      .lock()
      .unwrap()
      .take()
      .ok_or_else(|| anyhow::anyhow!("already joined"))
  }

  async fn leave(&self) -> anyhow::Result<()> {
    self.left.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn publish_presence_extension(&self, _name: &str, _value: &str) -> anyhow::Result<()> {
    Ok(())
  }
}

pub struct MockRoomProvider {
  rooms: StdMutex<HashMap<String, Arc<MockChatRoom>>>,
}

impl MockRoomProvider {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      rooms: StdMutex::new(HashMap::new()),
    })
  }

  pub fn add(&self, room: Arc<MockChatRoom>) {
    self
      .rooms
      .lock()
      .unwrap()
      .insert(room.room_jid().to_owned(), room);
  }
}

#[async_trait]
impl ChatRoomProvider for MockRoomProvider {
  async fn room(&self, room_jid: &str) -> anyhow::Result<Arc<dyn ChatRoom>> {
    let room = self
      .rooms
      .lock()
      .unwrap()
      .get(room_jid)
      .cloned()
      .ok_or_else(|| anyhow::anyhow!("unknown room: {room_jid}"))?;
    Ok(room)
  }
}

pub const ROOM: &str = "orange@muc.example.com";

pub fn occupant(endpoint_id: &str) -> String {
  format!("{ROOM}/{endpoint_id}")
}

pub fn member(endpoint_id: &str, region: Option<&str>) -> ChatRoomMember {
  ChatRoomMember {
    occupant_jid: occupant(endpoint_id),
    endpoint_id: endpoint_id.to_owned(),
    role: MemberRole::Participant,
    region: region.map(str::to_owned),
    stats_id: None,
    features: HashSet::new(),
  }
}

pub fn audio_video_set(audio_ssrc: u32, video_ssrc: u32) -> EndpointSourceSet {
  EndpointSourceSet::from_sources([
    Source::new(audio_ssrc, MediaType::Audio).with_msid(format!("m{audio_ssrc}")),
    Source::new(video_ssrc, MediaType::Video).with_msid(format!("m{audio_ssrc}")),
  ])
}

/// Spawn a focus over the mock substrate and report a bridge so invites
/// can proceed.
pub async fn start_focus(
  legacy: HashMap<String, String>,
) -> (Arc<MockConnection>, Arc<MockRoomProvider>, FocusManager) {
  let connection = MockConnection::new();
  let provider = MockRoomProvider::new();
  let config = Arc::new(FocusConfig::load(None, &legacy).unwrap());
  let focus = FocusManager::new(connection.clone(), provider.clone(), config);
  let running = focus.clone();
  tokio::spawn(async move {
    let _ = running.run().await;
  });
  (connection, provider, focus)
}

pub async fn report_bridge(connection: &MockConnection, jid: &str, stress: f64, region: Option<&str>) {
  let report = lib_meet_focus::BridgeStatusReport {
    jid: jid.to_owned(),
    stress,
    region: region.map(str::to_owned),
    version: Some("2.1".to_owned()),
    relay_id: None,
    features: HashSet::new(),
  };
  connection
    .inject(jid, SignalingMessage::BridgeStatusReport(report))
    .await;
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F, what: &str) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  loop {
    if check() {
      return;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {what}");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

pub async fn wait_for_participant_count(conference: &lib_meet_focus::Conference, expected: usize) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  loop {
    if conference.participant_count().await == expected {
      return;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {expected} participants");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

pub async fn wait_for_end(conference: &lib_meet_focus::Conference) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  loop {
    if conference.is_ended().await {
      return;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for the conference to end");
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}
