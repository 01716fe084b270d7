//! Exchange orchestration (design §4.H, §5): wires the dlist codec,
//! response parser and mailbox diff/apply logic into the three verbs a
//! connection actually exchanges. One `Exchange` owns the connection-scoped
//! state a single replication session accumulates: the GUID→staged-path
//! cache built from every push seen so far (design §4.D, "the receiver side
//! must therefore tolerate a RECORD whose GUID was never attached as a File
//! in its own batch, provided that GUID appeared earlier in the exchange"),
//! mirroring the single-threaded-cooperative-per-connection model of §5.

use crate::dlist::{Dlist, FileValue, Value};
use crate::error::EngineError;
use crate::guid::MessageGuid;
use crate::mailbox;
use crate::model::{Annotation, FolderSnapshot};
use crate::options;
use crate::response;
use crate::store::MailStore;
use crate::stream::Stream;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Per-connection state: no locks, no process-wide statics (design §5,
/// §9 "Connection-scoped BSS scratch buffers").
#[derive(Default)]
pub struct Exchange {
  staged: HashMap<MessageGuid, PathBuf>,
}

impl Exchange {
  pub fn new() -> Exchange {
    Exchange::default()
  }

  fn record_pushes(&mut self, pushes: &[Dlist]) {
    for push in pushes {
      if let Value::File(FileValue::Received { guid, staged_at, .. }) = &push.value {
        self.staged.insert(*guid, staged_at.clone());
      }
    }
  }

  fn resolve(&self, guid: &MessageGuid) -> Option<PathBuf> {
    self.staged.get(guid).cloned()
  }
}

fn decode_annotations(list: &[Dlist]) -> Vec<Annotation> {
  list
    .iter()
    .map(|child| Annotation {
      entry: child.get_atom("ENTRY").unwrap_or_default().to_string(),
      userid: child.get_atom("USERID").unwrap_or_default().to_string(),
      value: child.get_map("VALUE").unwrap_or_default().to_vec(),
    })
    .collect()
}

/// Inverse of `mailbox::write_mailbox_meta`: reconstructs the snapshot a
/// peer advertised, for use as the `remote` input to `mailbox::diff_and_upload`
/// or as the basis for applying an incoming mailbox (design §4.E).
pub fn decode_mailbox_meta(meta: &Dlist) -> Result<(FolderSnapshot, Vec<Annotation>), EngineError> {
  let missing = |key: &str| EngineError::ProtocolBadParameters(format!("mailbox meta missing {key}"));
  let snapshot = FolderSnapshot {
    uniqueid: meta.get_atom("UNIQUEID").ok_or_else(|| missing("UNIQUEID"))?.to_string(),
    name: meta.get_atom("MBOXNAME").ok_or_else(|| missing("MBOXNAME"))?.to_string(),
    mbtype: meta.get_atom("MBOXTYPE").map(str::to_string),
    partition: meta.get_atom("PARTITION").ok_or_else(|| missing("PARTITION"))?.to_string(),
    acl: meta.get_atom("ACL").unwrap_or_default().to_string(),
    options: meta.get_atom("OPTIONS").map(options::parse).unwrap_or_default(),
    uidvalidity: meta.get_num32("UIDVALIDITY").ok_or_else(|| missing("UIDVALIDITY"))?,
    last_uid: meta.get_num32("LAST_UID").ok_or_else(|| missing("LAST_UID"))?,
    highestmodseq: meta.get_num64("HIGHESTMODSEQ").ok_or_else(|| missing("HIGHESTMODSEQ"))?,
    sync_crc: meta.get_num32("SYNC_CRC").unwrap_or(0),
    recentuid: meta.get_num32("RECENTUID").unwrap_or(0),
    recenttime: meta.get_date("RECENTTIME").unwrap_or(0),
    pop3_last_login: meta.get_date("POP3_LAST_LOGIN").unwrap_or(0),
    pop3_show_after: meta.get_date("POP3_SHOW_AFTER").unwrap_or(0),
    quotaroot: meta.get_atom("QUOTAROOT").map(str::to_string),
  };
  let annotations = meta.get_list("ANNOTATIONS").map(decode_annotations).unwrap_or_default();
  Ok((snapshot, annotations))
}

/// Sender side, step one: ask the remote for its current view of `mailbox`
/// with `GET` (design §4.H). `None` means the remote has never heard of it,
/// the same "absent ⇒ receiver has nothing" case `mailbox::diff_and_upload`
/// already treats as a full initial send (design §4.E).
pub fn request_snapshot<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  mailbox: &str,
) -> Result<Option<FolderSnapshot>, EngineError> {
  let mut body = Dlist::new_kvlist(None);
  body.set_atom("MBOXNAME", mailbox.to_string());
  response::send_get(stream, &body)?;
  let pushes = response::parse_response(stream, staging_root)?;
  match pushes.and_then(|p| p.children().first().cloned()) {
    Some(meta) => Ok(Some(decode_mailbox_meta(&meta)?.0)),
    None => {
      log::debug!("remote has never heard of {mailbox}");
      Ok(None)
    }
  }
}

/// Sender side, step two: diff the local mailbox against `remote` (as
/// returned by [`request_snapshot`]) and send the result with `APPLY`
/// (design §4.E).
#[allow(clippy::too_many_arguments)]
pub fn send_mailbox<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  store: &dyn MailStore,
  mailbox: &str,
  local: &FolderSnapshot,
  record_count: u32,
  remote: Option<&FolderSnapshot>,
  reserve: &mut crate::collections::MsgidList,
  partition: &str,
  mailbox_annotations: &[Annotation],
  message_annotations: impl Fn(u32) -> Vec<Annotation>,
) -> Result<(), EngineError> {
  let mut meta = Dlist::new_kvlist(None);
  let mut uploads = Dlist::new_list(None);
  mailbox::diff_and_upload(
    store,
    mailbox,
    local,
    record_count,
    remote,
    reserve,
    partition,
    true,
    mailbox_annotations,
    message_annotations,
    &mut meta,
    Some(&mut uploads),
  )?;

  log::info!("sending {mailbox}: {} upload(s)", uploads.children().len());
  for upload in uploads.children() {
    response::send_push(stream, upload)?;
  }
  response::send_apply(stream, &meta)?;
  response::parse_response(stream, staging_root)?;
  Ok(())
}

/// Receiver side: apply an incoming mailbox `APPLY` body (design §4.E
/// "Receive-side apply"). Creates the mailbox locally on first contact,
/// merges mailbox-level annotations with `local_wins = false`, and applies
/// every `RECORD` in order, resolving each `RECORD`'s payload from whatever
/// was staged earlier in this exchange.
pub fn apply_mailbox(
  store: &mut dyn MailStore,
  exchange: &mut Exchange,
  body: &Dlist,
  pushes: &[Dlist],
) -> Result<(), EngineError> {
  exchange.record_pushes(pushes);
  let (snapshot, mailbox_annotations) = decode_mailbox_meta(body)?;
  let mailbox = snapshot.name.clone();
  log::info!("applying {mailbox} up to last_uid={}", snapshot.last_uid);

  if !mailbox_annotations.is_empty() {
    let mut remote = crate::collections::AnnotList::new();
    for annot in mailbox_annotations {
      remote.add(annot);
    }
    remote.sort();
    let mut state = store.get_annotate_state(&mailbox, 0)?;
    crate::annotation::apply(&mut *state, &crate::collections::AnnotList::new(), &remote, false)?;
    state.commit()?;
  }

  for record in body.get_list("RECORD").unwrap_or_default() {
    let guid =
      record.get_guid("GUID").ok_or_else(|| EngineError::ProtocolBadParameters("RECORD missing GUID".to_string()))?;
    let staged = exchange.resolve(&guid);
    mailbox::apply_record(store, &mailbox, &snapshot.partition, record, staged)?;
  }
  Ok(())
}

/// Builds the inventory `GET {SIEVE Y}` answers with: every script's
/// `(NAME, GUID, LAST_UPDATE, ACTIVE)`, grounded on `sieve::list` (design
/// §4.G).
pub fn sieve_snapshot(sieve_dir: &Path) -> Result<Dlist, EngineError> {
  let mut kl = Dlist::new_kvlist(None);
  let list = kl.new_child_list("SIEVE");
  for script in crate::sieve::list(sieve_dir)? {
    let entry = list.new_child_kvlist(None);
    entry.set_atom("NAME", script.name);
    entry.set_guid("GUID", &script.guid);
    entry.set_date("LAST_UPDATE", script.last_update);
    entry.set_flag("ACTIVE", if script.active { "Y" } else { "N" });
  }
  Ok(kl)
}

fn decode_sieve_entries(list: &[Dlist]) -> Result<Vec<crate::model::SieveScript>, EngineError> {
  list
    .iter()
    .map(|child| {
      let missing = |key: &str| EngineError::ProtocolBadParameters(format!("SIEVE entry missing {key}"));
      Ok(crate::model::SieveScript {
        name: child.get_atom("NAME").ok_or_else(|| missing("NAME"))?.to_string(),
        guid: child.get_guid("GUID").ok_or_else(|| missing("GUID"))?,
        last_update: child.get_date("LAST_UPDATE").unwrap_or(0),
        active: child.get_atom("ACTIVE") == Some("Y"),
      })
    })
    .collect()
}

/// Sender side of sieve sync (design §4.G): `GET {SIEVE Y}` the peer's
/// inventory, diff it against the local directory by GUID, then `SET` the
/// scripts the peer is missing or has stale plus any activation change.
/// Deletions are not propagated by absence; a script the peer no longer has
/// locally is left alone rather than guessed at.
pub fn send_sieve<RW: Read + Write>(stream: &mut Stream<RW>, staging_root: &Path, sieve_dir: &Path) -> Result<(), EngineError> {
  let mut request = Dlist::new_kvlist(None);
  request.set_flag("SIEVE", "Y");
  response::send_get(stream, &request)?;
  let remote = match response::parse_response(stream, staging_root)?.and_then(|p| p.children().first().cloned()) {
    Some(meta) => decode_sieve_entries(meta.get_list("SIEVE").unwrap_or_default())?,
    None => Vec::new(),
  };

  let local = crate::sieve::list(sieve_dir)?;
  let mut ops = Dlist::new_list(Some("SIEVE"));
  let mut uploads = Dlist::new_list(None);
  for script in &local {
    let stale = remote.iter().find(|r| r.name == script.name).map(|r| r.guid != script.guid).unwrap_or(true);
    if stale {
      let size = std::fs::metadata(sieve_dir.join(&script.name))?.len();
      uploads.set_file("SCRIPT", "sieve", script.guid, size, sieve_dir.join(&script.name));
      let op = ops.new_child_kvlist(None);
      op.set_atom("ACTION", "UPLOAD");
      op.set_atom("NAME", script.name.clone());
      op.set_date("LAST_UPDATE", script.last_update);
      op.set_guid("GUID", &script.guid);
    }
  }
  for script in &local {
    let remote_active = remote.iter().find(|r| r.name == script.name).map(|r| r.active).unwrap_or(false);
    if script.active && !remote_active {
      let op = ops.new_child_kvlist(None);
      op.set_atom("ACTION", "ACTIVATE");
      op.set_atom("NAME", script.name.clone());
    }
  }
  if remote.iter().any(|r| r.active) && !local.iter().any(|s| s.active) {
    ops.new_child_kvlist(None).set_atom("ACTION", "DEACTIVATE");
  }

  if ops.children().is_empty() {
    log::debug!("sieve directory already in sync, nothing to send");
    return Ok(());
  }

  log::info!("sending sieve: {} op(s), {} upload(s)", ops.children().len(), uploads.children().len());
  for upload in uploads.children() {
    response::send_push(stream, upload)?;
  }
  let mut body = Dlist::new_kvlist(None);
  body.push_child(ops);
  response::send_set(stream, &body)?;
  response::parse_response(stream, staging_root)?;
  Ok(())
}

/// Receiver side of sieve sync: applies each op in order against
/// `sieve_dir`, resolving an `UPLOAD`'s payload from whatever the exchange
/// staged under its declared `GUID`.
fn apply_sieve_ops(sieve_dir: &Path, exchange: &Exchange, ops: &[Dlist]) -> Result<(), EngineError> {
  for op in ops {
    let missing = |key: &str| EngineError::ProtocolBadParameters(format!("SIEVE op missing {key}"));
    let action = op.get_atom("ACTION").ok_or_else(|| missing("ACTION"))?;
    match action {
      "UPLOAD" => {
        let name = op.get_atom("NAME").ok_or_else(|| missing("NAME"))?;
        let last_update = op.get_date("LAST_UPDATE").unwrap_or(0);
        let guid = op.get_guid("GUID").ok_or_else(|| missing("GUID"))?;
        let staged = exchange
          .resolve(&guid)
          .ok_or_else(|| EngineError::ProtocolBadParameters("SIEVE UPLOAD references an unstaged GUID".to_string()))?;
        let contents = std::fs::read(&staged)?;
        crate::sieve::upload(sieve_dir, name, &contents, last_update)?;
      }
      "ACTIVATE" => crate::sieve::activate(sieve_dir, op.get_atom("NAME").ok_or_else(|| missing("NAME"))?)?,
      "DEACTIVATE" => crate::sieve::deactivate(sieve_dir)?,
      "DELETE" => crate::sieve::delete(sieve_dir, op.get_atom("NAME").ok_or_else(|| missing("NAME"))?)?,
      other => return Err(EngineError::Protocol(format!("unhandled SIEVE op {other}"))),
    }
  }
  Ok(())
}

/// Reads and dispatches exactly one incoming command (design §4.H). Returns
/// `Ok(false)` on a clean end-of-stream so a caller's serve loop knows to
/// stop without treating disconnection as an error. `snapshot_of` answers a
/// `GET` for a mailbox name with whatever view the caller's own mailbox
/// enumeration holds (the `FolderList` in design §3 is built outside the
/// narrow `MailStore` contract, so the lookup is supplied rather than
/// derived from the store trait here). `sieve_dir` is `None` when this
/// replica doesn't replicate sieve scripts at all.
pub fn serve_one<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  store: &mut dyn MailStore,
  exchange: &mut Exchange,
  sieve_dir: Option<&Path>,
  snapshot_of: impl Fn(&str) -> Option<(FolderSnapshot, Vec<Annotation>)>,
) -> Result<bool, EngineError> {
  let (verb, body, pushes) = match response::read_command(stream, staging_root) {
    Ok(parsed) => parsed,
    Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
    Err(e) => return Err(e),
  };

  let result = (|| -> Result<Option<Dlist>, EngineError> {
    match verb.as_str() {
      "APPLY" => {
        apply_mailbox(store, exchange, &body, &pushes)?;
        Ok(None)
      }
      "GET" => {
        if let Some(name) = body.get_atom("MBOXNAME") {
          Ok(snapshot_of(name).map(|(snapshot, annotations)| {
            let mut meta = Dlist::new_kvlist(None);
            mailbox::write_mailbox_meta(&mut meta, &snapshot, &annotations);
            meta
          }))
        } else if body.get_atom("SIEVE").is_some() {
          let sieve_dir = sieve_dir
            .ok_or_else(|| EngineError::ProtocolBadParameters("GET SIEVE but no sieve directory configured".to_string()))?;
          Ok(Some(sieve_snapshot(sieve_dir)?))
        } else {
          Err(EngineError::ProtocolBadParameters("GET missing MBOXNAME".to_string()))
        }
      }
      "SET" => {
        if let Some(ops) = body.get_list("SIEVE") {
          let sieve_dir = sieve_dir
            .ok_or_else(|| EngineError::ProtocolBadParameters("SET SIEVE but no sieve directory configured".to_string()))?;
          exchange.record_pushes(&pushes);
          apply_sieve_ops(sieve_dir, exchange, ops)?;
        }
        Ok(None)
      }
      other => Err(EngineError::Protocol(format!("unhandled verb {other}"))),
    }
  })();

  match result {
    Ok(push) => {
      if let Some(push) = push {
        response::send_push(stream, &push)?;
      }
      response::send_ok(stream)?;
    }
    Err(e) => {
      log::warn!("{verb} failed: {e}");
      response::send_no(stream, &e)?;
    }
  }
  Ok(true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fsstore::FsStore;
  use crate::model::SystemFlags;
  use pretty_assertions::assert_eq;
  use std::io::Cursor;
  use test_log::test;

  fn snapshot(name: &str, last_uid: u32, highestmodseq: u64) -> FolderSnapshot {
    FolderSnapshot {
      uniqueid: format!("{name}-id"),
      name: name.to_string(),
      partition: "default".to_string(),
      acl: String::new(),
      uidvalidity: 1,
      last_uid,
      highestmodseq,
      ..Default::default()
    }
  }

  #[test]
  fn mailbox_meta_round_trips_through_decode() {
    let local = snapshot("INBOX", 7, 42);
    let mut meta = Dlist::new_kvlist(None);
    mailbox::write_mailbox_meta(&mut meta, &local, &[]);
    let (decoded, annots) = decode_mailbox_meta(&meta).unwrap();
    assert_eq!(decoded.name, "INBOX");
    assert_eq!(decoded.last_uid, 7);
    assert_eq!(decoded.highestmodseq, 42);
    assert!(annots.is_empty());
  }

  #[test]
  fn apply_mailbox_creates_records_from_pushes_and_body() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");

    let payload = b"hello world";
    let guid = MessageGuid::from_bytes(payload);
    let staged = dir.path().join("staged-msg");
    std::fs::write(&staged, payload).unwrap();

    let mut body = Dlist::new_kvlist(None);
    let local = snapshot("INBOX", 1, 1);
    mailbox::write_mailbox_meta(&mut body, &local, &[]);
    let records = body.new_child_list("RECORD");
    let mut record = Dlist::new_kvlist(Some("RECORD"));
    record.set_num32("UID", 1);
    record.set_num64("MODSEQ", 1);
    record.set_date("LAST_UPDATED", 0);
    record.new_child_list("FLAGS");
    record.set_date("INTERNALDATE", 0);
    record.set_num32("SIZE", payload.len() as u32);
    record.set_guid("GUID", &guid);
    records.push_child(record);

    let push = Dlist { name: None, value: Value::File(FileValue::Received { partition: "default".to_string(), guid, size: payload.len() as u64, staged_at: staged }) };

    let mut exchange = Exchange::new();
    apply_mailbox(&mut store, &mut exchange, &body, std::slice::from_ref(&push)).unwrap();

    let stored = store.read_index_record("INBOX", 1).unwrap();
    assert_eq!(stored.uid, 1);
    assert_eq!(stored.guid, guid);
    assert!(!stored.system_flags.contains(SystemFlags::UNLINKED));
  }

  #[test]
  fn apply_mailbox_reuses_a_guid_staged_earlier_by_a_different_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");
    store.create_mailbox("Archive");

    let payload = b"shared across two mailboxes";
    let guid = MessageGuid::from_bytes(payload);
    let staged = dir.path().join("staged-msg");
    std::fs::write(&staged, payload).unwrap();
    let push = Dlist {
      name: None,
      value: Value::File(FileValue::Received {
        partition: "default".to_string(),
        guid,
        size: payload.len() as u64,
        staged_at: staged,
      }),
    };

    let record_for = |mailbox: &str| {
      let mut body = Dlist::new_kvlist(None);
      mailbox::write_mailbox_meta(&mut body, &snapshot(mailbox, 1, 1), &[]);
      let records = body.new_child_list("RECORD");
      let mut record = Dlist::new_kvlist(Some("RECORD"));
      record.set_num32("UID", 1);
      record.set_num64("MODSEQ", 1);
      record.set_date("LAST_UPDATED", 0);
      record.new_child_list("FLAGS");
      record.set_date("INTERNALDATE", 0);
      record.set_num32("SIZE", payload.len() as u32);
      record.set_guid("GUID", &guid);
      records.push_child(record);
      body
    };

    let mut exchange = Exchange::new();
    apply_mailbox(&mut store, &mut exchange, &record_for("INBOX"), std::slice::from_ref(&push)).unwrap();
    // Archive's batch carries no File push for this GUID: it relies entirely
    // on INBOX's earlier push still being cached in `exchange`.
    apply_mailbox(&mut store, &mut exchange, &record_for("Archive"), &[]).unwrap();

    assert_eq!(store.read_index_record("INBOX", 1).unwrap().guid, guid);
    assert_eq!(store.read_index_record("Archive", 1).unwrap().guid, guid);
  }

  #[test]
  fn sieve_snapshot_round_trips_through_decode() {
    let dir = tempfile::tempdir().unwrap();
    crate::sieve::upload(dir.path(), "a.sieve", b"keep;", 1_700_000_000).unwrap();
    crate::sieve::activate(dir.path(), "a.sieve").unwrap();

    let meta = sieve_snapshot(dir.path()).unwrap();
    let decoded = decode_sieve_entries(meta.get_list("SIEVE").unwrap()).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].name, "a.sieve");
    assert!(decoded[0].active);
  }

  #[test]
  fn apply_sieve_ops_uploads_and_activates_a_new_script() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"require [\"fileinto\"];";
    let guid = MessageGuid::from_bytes(payload);
    let staged = dir.path().join("staged-script");
    std::fs::write(&staged, payload).unwrap();

    let mut exchange = Exchange::new();
    exchange.record_pushes(std::slice::from_ref(&Dlist {
      name: None,
      value: Value::File(FileValue::Received {
        partition: "sieve".to_string(),
        guid,
        size: payload.len() as u64,
        staged_at: staged,
      }),
    }));

    let mut op = Dlist::new_kvlist(None);
    op.set_atom("ACTION", "UPLOAD");
    op.set_atom("NAME", "a.sieve");
    op.set_date("LAST_UPDATE", 1_700_000_000);
    op.set_guid("GUID", &guid);
    let mut activate = Dlist::new_kvlist(None);
    activate.set_atom("ACTION", "ACTIVATE");
    activate.set_atom("NAME", "a.sieve");

    apply_sieve_ops(dir.path(), &exchange, &[op, activate]).unwrap();

    let scripts = crate::sieve::list(dir.path()).unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].guid, guid);
    assert!(scripts[0].active);
  }

  #[test]
  fn serve_one_returns_false_on_clean_eof() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    let mut stream = Stream::new(Cursor::new(Vec::new()));
    let mut exchange = Exchange::new();
    let more = serve_one(&mut stream, dir.path(), &mut store, &mut exchange, None, |_| None).unwrap();
    assert!(!more);
  }

  #[test]
  fn serve_one_answers_get_with_no_known_mailbox() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    let input = b"GET %(MBOXNAME INBOX)\r\n";
    let mut stream = Stream::new(Cursor::new(input.to_vec()));
    let mut exchange = Exchange::new();
    let more = serve_one(&mut stream, dir.path(), &mut store, &mut exchange, None, |_| None).unwrap();
    assert!(more);
  }
}
