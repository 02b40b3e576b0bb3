use std::{
  collections::{HashMap, HashSet},
  convert::TryFrom,
  sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lib_meet_focus::{ChatRoom, ChatRoomEvent, ChatRoomMember, ChatRoomProvider, MemberRole};
use tokio::sync::mpsc;
use tracing::debug;
use xmpp_parsers::{
  muc::{
    user::{Affiliation, Role},
    MucUser,
  },
  presence::{self, Presence},
  BareJid, Element, FullJid, Jid,
};

const MUC_NS: &str = "http://jabber.org/protocol/muc";
const MUC_USER_NS: &str = "http://jabber.org/protocol/muc#user";
const DEFAULT_NS: &str = "jabber:client";
const FOCUS_NICK: &str = "focus";

use crate::connection::Connection;

/// One conference MUC, bridged to the library's `ChatRoom` events.
pub(crate) struct XmppChatRoom {
  connection: Connection,
  room: BareJid,
  room_jid: String,
}

impl XmppChatRoom {
  pub(crate) fn new(connection: Connection, room: BareJid) -> Self {
    let room_jid = room.to_string();
    Self {
      connection,
      room,
      room_jid,
    }
  }

  fn occupant_jid(&self) -> FullJid {
    self.room.clone().with_resource(FOCUS_NICK)
  }
}

#[async_trait]
impl ChatRoom for XmppChatRoom {
  fn room_jid(&self) -> &str {
    &self.room_jid
  }

  async fn join(&self) -> Result<mpsc::Receiver<ChatRoomEvent>> {
    let (route_tx, route_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);
    self
      .connection
      .add_presence_route(&self.room_jid, route_tx)
      .await;

    tokio::spawn(presence_loop(route_rx, events_tx));

    let presence = Presence::new(presence::Type::None)
      .with_to(Jid::Full(self.occupant_jid()))
      .with_payloads(vec![Element::builder("x", MUC_NS).build()]);
    self.connection.tx.send(presence.into()).await?;
    debug!(room = %self.room_jid, "joining room");
    Ok(events_rx)
  }

  async fn leave(&self) -> Result<()> {
    let presence =
      Presence::new(presence::Type::Unavailable).with_to(Jid::Full(self.occupant_jid()));
    self.connection.tx.send(presence.into()).await?;
    self.connection.remove_presence_route(&self.room_jid).await;
    Ok(())
  }

  async fn publish_presence_extension(&self, name: &str, value: &str) -> Result<()> {
    let presence = Presence::new(presence::Type::None)
      .with_to(Jid::Full(self.occupant_jid()))
      .with_payloads(vec![Element::builder(name, DEFAULT_NS).append(value).build()]);
    self.connection.tx.send(presence.into()).await?;
    Ok(())
  }
}

/// Translates raw room presence into membership events.
async fn presence_loop(
  mut route: mpsc::Receiver<Element>,
  events: mpsc::Sender<ChatRoomEvent>,
) {
  let mut roles: HashMap<String, MemberRole> = HashMap::new();
  while let Some(element) = route.recv().await {
    let from = match element
      .attr("from")
      .and_then(|from| from.parse::<FullJid>().ok())
    {
      Some(from) => from,
      None => continue,
    };
    if from.resource == FOCUS_NICK {
      continue;
    }
    let endpoint_id = from.resource.clone();
    let unavailable = element.attr("type") == Some("unavailable");

    let muc_user_element = element.get_child("x", MUC_USER_NS);
    if let Some(x) = muc_user_element {
      if x.children().any(|child| child.name() == "destroy") {
        let _ = events.send(ChatRoomEvent::RoomDestroyed).await;
        return;
      }
    }
    let muc_user = muc_user_element.and_then(|x| MucUser::try_from(x.clone()).ok());

    if unavailable {
      if roles.remove(&endpoint_id).is_some() {
        let _ = events
          .send(ChatRoomEvent::MemberLeft { endpoint_id })
          .await;
      }
      continue;
    }

    let role = muc_user
      .as_ref()
      .and_then(|muc_user| muc_user.items.first())
      .map(|item| match (item.affiliation.clone(), item.role.clone()) {
        (Affiliation::Owner, _) => MemberRole::Owner,
        (_, Role::Moderator) => MemberRole::Moderator,
        (_, Role::Participant) => MemberRole::Participant,
        _ => MemberRole::Visitor,
      })
      .unwrap_or(MemberRole::Participant);

    let member = ChatRoomMember {
      occupant_jid: from.to_string(),
      endpoint_id: endpoint_id.clone(),
      role,
      region: child_text(&element, "jitsi_participant_region"),
      stats_id: child_text(&element, "stats-id"),
      features: parse_features(&element),
    };

    match roles.get(&endpoint_id).copied() {
      None => {
        roles.insert(endpoint_id, role);
        let _ = events.send(ChatRoomEvent::MemberJoined(member)).await;
      },
      Some(known_role) if known_role != role => {
        roles.insert(endpoint_id.clone(), role);
        let _ = events
          .send(ChatRoomEvent::MemberRoleChanged { endpoint_id, role })
          .await;
      },
      Some(_) => {
        let _ = events.send(ChatRoomEvent::PresenceUpdated(member)).await;
      },
    }
  }
}

fn child_text(element: &Element, name: &str) -> Option<String> {
  element
    .children()
    .find(|child| child.name() == name)
    .map(|child| child.text())
    .filter(|text| !text.is_empty())
}

fn parse_features(element: &Element) -> HashSet<String> {
  element
    .children()
    .filter(|child| child.name() == "features")
    .flat_map(|features| features.children())
    .filter(|feature| feature.name() == "feature")
    .filter_map(|feature| feature.attr("var"))
    .map(str::to_owned)
    .collect()
}

/// Hands out rooms on the conference MUC domain.
pub(crate) struct XmppRoomProvider {
  connection: Connection,
}

impl XmppRoomProvider {
  pub(crate) fn new(connection: Connection) -> Self {
    Self { connection }
  }
}

#[async_trait]
impl ChatRoomProvider for XmppRoomProvider {
  async fn room(&self, room_jid: &str) -> Result<Arc<dyn ChatRoom>> {
    let room: BareJid = room_jid.parse().context("invalid room jid")?;
    Ok(Arc::new(XmppChatRoom::new(self.connection.clone(), room)))
  }
}
