//! Mailbox replication engine: a content-addressed, per-mailbox sync
//! protocol (design §1) built on the self-describing `dlist` wire format.

#![allow(clippy::upper_case_acronyms)]

use std::collections::HashMap;
use std::{fs, num, path, time};

pub mod annotation;
pub mod collections;
pub mod descriptor;
pub mod dlist;
pub mod error;
pub mod fsstore;
pub mod guid;
pub mod mailbox;
pub mod model;
pub mod options;
pub mod quota;
pub mod response;
pub mod sieve;
pub mod store;
pub mod stream;
pub mod sync;
pub mod transport;

use fsstore::FsStore;
use stream::Stream;
use transport::Open as _;

#[derive(Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Role {
  /// Dial out and drive replication of the configured mailboxes: `GET`
  /// each one's remote view, diff against the local store, `APPLY` the
  /// result (design §4.E, sender side).
  Send,
  /// Dial out and then answer whatever `APPLY`/`GET`/`SET` commands the
  /// peer sends until it closes the connection (design §4.H, receiver
  /// side).
  Serve,
}

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Execution role: send | serve", hide_possible_values(true))]
  pub role: Role,

  #[arg(long = "address", help = "Peer address")]
  pub address: String,
  #[arg(long = "port", help = "Peer port")]
  pub port: u16,
  #[arg(long = "tls", help = "Enable TLS", default_value_t = true)]
  pub tls: bool,
  #[arg(long = "timeout", help = "TCP timeout (in seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,

  #[arg(long = "store", help = "Local mailbox store root")]
  pub store: path::PathBuf,
  #[arg(
    long = "namespace",
    help = "Log file / config namespace",
    default_value_t = String::from("mbrepl")
  )]
  pub namespace: String,
  #[arg(
    long = "partition",
    help = "Partition name new payloads are reserved under",
    default_value_t = String::from("default")
  )]
  pub partition: String,
  #[arg(long = "min-crc-vers", help = "Lowest SYNC_CRC algorithm version accepted", default_value_t = 1)]
  pub min_crc_vers: u32,
  #[arg(long = "max-crc-vers", help = "Highest SYNC_CRC algorithm version accepted", default_value_t = 1)]
  pub max_crc_vers: u32,
  #[arg(
    long = "local-wins",
    help = "Break annotation write/write conflicts in favour of the local value",
    default_value_t = false
  )]
  pub local_wins: bool,
  #[arg(long = "sieve-dir", help = "Sieve script directory")]
  pub sieve_dir: Option<path::PathBuf>,

  #[arg(long = "mailbox", help = "Mailbox to replicate (role=send, repeatable)")]
  pub mailboxes: Vec<String>,
}

fn staging_root(arguments: &Arguments) -> std::io::Result<path::PathBuf> {
  let root = arguments.store.join("staging");
  fs::create_dir_all(&root)?;
  Ok(root)
}

/// Drive `role=send`: `GET` then `APPLY` every configured mailbox in turn.
fn run_send<RW: std::io::Read + std::io::Write>(
  arguments: &Arguments,
  stream: &mut Stream<RW>,
  store: &FsStore,
  staging_root: &path::Path,
) -> anyhow::Result<()> {
  let crc_vers = store.best_crcvers(arguments.min_crc_vers, arguments.max_crc_vers)?;
  for mailbox in &arguments.mailboxes {
    log::info!("sending {mailbox}");
    let local = store.snapshot(mailbox, &arguments.partition, crc_vers)?;
    let record_count = store.record_count(mailbox)?;
    let remote = sync::request_snapshot(stream, staging_root, mailbox)?;
    let mut reserve = collections::MsgidList::new();
    let mailbox_annotations = store.mailbox_annotations(mailbox)?.to_vec();
    sync::send_mailbox(
      stream,
      staging_root,
      store,
      mailbox,
      &local,
      record_count,
      remote.as_ref(),
      &mut reserve,
      &arguments.partition,
      &mailbox_annotations,
      |uid| store.message_annotations(mailbox, uid).map(<[_]>::to_vec).unwrap_or_default(),
    )?;
  }
  if let Some(sieve_dir) = &arguments.sieve_dir {
    sync::send_sieve(stream, staging_root, sieve_dir)?;
  }
  Ok(())
}

/// Drive `role=serve`: answer commands until the peer disconnects cleanly.
/// Re-snapshots every known mailbox ahead of each command so a `GET` always
/// sees the latest state, without holding an immutable borrow of `store`
/// across the same call's `&mut dyn MailStore` (design §6's contract has no
/// combined read/write borrow of its own).
fn run_serve<RW: std::io::Read + std::io::Write>(
  arguments: &Arguments,
  stream: &mut Stream<RW>,
  store: &mut FsStore,
  staging_root: &path::Path,
) -> anyhow::Result<()> {
  let crc_vers = store.best_crcvers(arguments.min_crc_vers, arguments.max_crc_vers)?;
  let mut exchange = sync::Exchange::new();
  loop {
    let snapshots: HashMap<String, (model::FolderSnapshot, Vec<model::Annotation>)> = store
      .mailbox_names()
      .into_iter()
      .filter_map(|name| {
        let snapshot = store.snapshot(&name, &arguments.partition, crc_vers).ok()?;
        let annotations = store.mailbox_annotations(&name).ok()?.to_vec();
        Some((name, (snapshot, annotations)))
      })
      .collect();
    let more = sync::serve_one(
      stream,
      staging_root,
      store,
      &mut exchange,
      arguments.sieve_dir.as_deref(),
      |name| snapshots.get(name).cloned(),
    )?;
    if !more {
      log::info!("peer closed the connection");
      return Ok(());
    }
  }
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let staging_root = staging_root(arguments)?;
  let mut store = FsStore::open(arguments.store.as_path())?;

  let tcp = transport::Tcp { address: &arguments.address, port: arguments.port, timeout: arguments.timeout };
  if !arguments.tls {
    log::warn!("TLS not enabled, traffic will be sent in clear over the wire");
    let mut stream = Stream::new(tcp.open()?);
    return match arguments.role {
      Role::Send => run_send(arguments, &mut stream, &store, &staging_root),
      Role::Serve => run_serve(arguments, &mut stream, &mut store, &staging_root),
    };
  }
  let tls = transport::Tls(tcp);
  let mut stream = Stream::new(tls.open()?);
  match arguments.role {
    Role::Send => run_send(arguments, &mut stream, &store, &staging_root),
    Role::Serve => run_serve(arguments, &mut stream, &mut store, &staging_root),
  }
}
