mod connection;
mod muc;
mod wire;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use lib_meet_focus::{init_tracing, FocusConfig, FocusManager};
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing::info;
use uuid::Uuid;

use crate::{
  connection::{Authentication, Connection},
  muc::XmppRoomProvider,
};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
  name = "meet-focus",
  about = "A signaling focus for multi-user media conferences."
)]
struct Opt {
  #[structopt(long)]
  web_socket_url: String,

  #[structopt(long)]
  xmpp_domain: String,

  #[structopt(
    long,
    help = "If not specified, anonymous auth is used."
  )]
  xmpp_username: Option<String>,

  #[structopt(long)]
  xmpp_password: Option<String>,

  #[structopt(
    long,
    help = "The MUC where bridges report their status, e.g. jvbbrewery@internal.example.com"
  )]
  brewery_jid: String,

  #[structopt(long, help = "Path to the hierarchical JSON configuration file")]
  config: Option<PathBuf>,

  #[structopt(
    long,
    help = "Path to legacy flat properties (key=value per line); these take precedence"
  )]
  legacy_config: Option<PathBuf>,

  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,
}

pub(crate) fn generate_id() -> String {
  Uuid::new_v4().to_string()
}

fn parse_properties(text: &str) -> HashMap<String, String> {
  text
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty() && !line.starts_with('#'))
    .filter_map(|line| {
      line
        .split_once('=')
        .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let json = opt
    .config
    .as_ref()
    .map(std::fs::read_to_string)
    .transpose()
    .context("failed to read configuration file")?;
  let legacy = opt
    .legacy_config
    .as_ref()
    .map(std::fs::read_to_string)
    .transpose()
    .context("failed to read legacy configuration file")?
    .map(|text| parse_properties(&text))
    .unwrap_or_default();
  let config = Arc::new(FocusConfig::load(json.as_deref(), &legacy)?);

  let authentication = match (opt.xmpp_username, opt.xmpp_password) {
    (Some(username), Some(password)) => Authentication::Plain { username, password },
    _ => Authentication::Anonymous,
  };

  let (connection, background) =
    Connection::new(&opt.web_socket_url, &opt.xmpp_domain, authentication).await?;
  tokio::spawn(background);
  connection.connect().await?;
  connection.join_brewery(&opt.brewery_jid).await?;

  let provider = Arc::new(XmppRoomProvider::new(connection.clone()));
  let focus = FocusManager::new(Arc::new(connection), provider, config);

  tokio::select! {
    result = focus.run() => result?,
    _ = ctrl_c() => info!("exiting"),
  }
  Ok(())
}
