//! Mailbox diff & upload (design §4.E) and its receive-side mirror
//! (design §4.E "Receive-side apply"): the engine's two data-moving halves,
//! grounded on the original's `sync_mailbox` (diff) and
//! `sync_append_copyfile` (apply).

use crate::annotation;
use crate::collections::MsgidList;
use crate::dlist::{Dlist, FileValue};
use crate::error::EngineError;
use crate::guid::MessageGuid;
use crate::model::{Annotation, FolderSnapshot, IndexRecord, SystemFlags};
use crate::options;
use crate::store::{CopyFlags, MailStore};
use std::path::PathBuf;

/// Emit the always-present mailbox metadata fields into `meta` (design
/// §4.E: "Output metadata ... always emitted into `meta` as keyed
/// children").
pub fn write_mailbox_meta(meta: &mut Dlist, local: &FolderSnapshot, mailbox_annotations: &[Annotation]) {
  meta.set_atom("UNIQUEID", local.uniqueid.clone());
  meta.set_atom("MBOXNAME", local.name.clone());
  if let Some(mbtype) = &local.mbtype {
    meta.set_atom("MBOXTYPE", mbtype.clone());
  }
  meta.set_num32("LAST_UID", local.last_uid);
  meta.set_num64("HIGHESTMODSEQ", local.highestmodseq);
  meta.set_num32("RECENTUID", local.recentuid);
  meta.set_date("RECENTTIME", local.recenttime);
  meta.set_date("LAST_APPENDDATE", local.recenttime);
  meta.set_date("POP3_LAST_LOGIN", local.pop3_last_login);
  meta.set_date("POP3_SHOW_AFTER", local.pop3_show_after);
  meta.set_num32("UIDVALIDITY", local.uidvalidity);
  meta.set_atom("PARTITION", local.partition.clone());
  meta.set_atom("ACL", local.acl.clone());
  meta.set_atom("OPTIONS", options::encode(local.options));
  meta.set_num32("SYNC_CRC", local.sync_crc);
  if let Some(quotaroot) = &local.quotaroot {
    meta.set_atom("QUOTAROOT", quotaroot.clone());
  }
  if !mailbox_annotations.is_empty() {
    encode_annotations(meta.new_child_list("ANNOTATIONS"), mailbox_annotations);
  }
}

fn encode_annotations(list: &mut Dlist, annotations: &[Annotation]) {
  for annot in annotations {
    let child = list.new_child_kvlist(None);
    child.set_atom("ENTRY", annot.entry.clone());
    child.set_atom("USERID", annot.userid.clone());
    child.set_map("VALUE", annot.value.clone());
  }
}

fn flags_to_list(list: &mut Dlist, record: &IndexRecord) {
  for atom in record.system_flags.wire_atoms() {
    list.push_child(Dlist { name: None, value: crate::dlist::Value::Atom(atom.to_string()) });
  }
  for name in &record.user_flags {
    list.push_child(Dlist { name: None, value: crate::dlist::Value::Atom(name.clone()) });
  }
}

fn record_to_kvlist(record: &IndexRecord, annotations: &[Annotation]) -> Dlist {
  let mut kl = Dlist::new_kvlist(Some("RECORD"));
  kl.set_num32("UID", record.uid);
  kl.set_num64("MODSEQ", record.modseq);
  kl.set_date("LAST_UPDATED", record.last_updated);
  flags_to_list(kl.new_child_list("FLAGS"), record);
  kl.set_date("INTERNALDATE", record.internaldate);
  kl.set_num32("SIZE", record.size);
  kl.set_guid("GUID", &record.guid);
  if !annotations.is_empty() {
    encode_annotations(kl.new_child_list("ANNOTATIONS"), annotations);
  }
  kl
}

/// The per-record decision tree of design §4.E step 2-4. Returns `None` for
/// records the modseq rule skips entirely.
fn diff_record(
  record: &IndexRecord,
  remote: Option<&FolderSnapshot>,
  uploads_requested: bool,
  reserve: &mut MsgidList,
  store: &dyn MailStore,
  mailbox: &str,
  partition: &str,
) -> Option<(Dlist, Option<FileValue>)> {
  if let Some(remote) = remote {
    if record.modseq <= remote.highestmodseq {
      return None;
    }
  }

  let mut send_file = true;
  if let Some(remote) = remote {
    if record.uid <= remote.last_uid {
      send_file = false;
    }
  }
  if !uploads_requested {
    send_file = false;
  }
  if record.system_flags.contains(SystemFlags::UNLINKED) {
    send_file = false;
  }

  let mut file_value = None;
  if send_file {
    let slot = reserve.insert(record.guid);
    if let Some(idx) = slot {
      if reserve.need_upload(idx) {
        if let Some(path) = store.message_fname(mailbox, record.uid) {
          file_value = Some(FileValue::OnDisk { partition: partition.to_string(), guid: record.guid, size: record.size as u64, path });
          reserve.mark_sent(idx);
        }
      }
    }
  }

  Some((record_to_kvlist(record, &[]), file_value))
}

/// Scan `local`'s index records in `recno` order and emit metadata (always)
/// plus upload requests (when allowed) into `meta`/`uploads`. `annotations`
/// supplies the per-uid annotation list for each record, keyed by uid
/// (design §4.E step 4).
#[allow(clippy::too_many_arguments)]
pub fn diff_and_upload(
  store: &dyn MailStore,
  mailbox: &str,
  local: &FolderSnapshot,
  record_count: u32,
  remote: Option<&FolderSnapshot>,
  reserve: &mut MsgidList,
  partition: &str,
  printrecords: bool,
  mailbox_annotations: &[Annotation],
  message_annotations: impl Fn(u32) -> Vec<Annotation>,
  meta: &mut Dlist,
  mut uploads: Option<&mut Dlist>,
) -> Result<(), EngineError> {
  write_mailbox_meta(meta, local, mailbox_annotations);
  if !printrecords {
    return Ok(());
  }
  log::debug!("diffing {mailbox} against remote last_uid={:?}", remote.map(|r| r.last_uid));

  let records = meta.new_child_list("RECORD");
  let mut prev_uid = 0u32;
  for recno in 1..=record_count {
    let record = store.read_index_record(mailbox, recno)?;
    if record.uid <= prev_uid {
      return Err(EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("non-monotonic uid {} after {} in {mailbox}", record.uid, prev_uid),
      )));
    }
    prev_uid = record.uid;

    let Some((mut record_kl, file_value)) = diff_record(
      &record,
      remote,
      uploads.is_some(),
      reserve,
      store,
      mailbox,
      partition,
    ) else {
      continue;
    };

    let annots = message_annotations(record.uid);
    if !annots.is_empty() {
      encode_annotations(record_kl.new_child_list("ANNOTATIONS"), &annots);
    }
    records.push_child(record_kl);

    if let Some(file_value) = file_value {
      if let (FileValue::OnDisk { partition, guid, size, path }, Some(uploads)) = (file_value, uploads.as_deref_mut()) {
        uploads.set_file("MESSAGE", &partition, guid, size, path);
      }
    }
  }
  Ok(())
}

/// Receive-side mirror of [`diff_and_upload`] (design §4.E "Receive-side
/// apply"), grounded on `sync_append_copyfile`. `staged` is the path a
/// File sentinel for this RECORD's GUID was parsed to, if any record in
/// this batch (or an earlier one in the exchange) carried the payload.
pub fn apply_record(
  store: &mut dyn MailStore,
  mailbox: &str,
  partition: &str,
  record_kl: &Dlist,
  staged: Option<PathBuf>,
) -> Result<(), EngineError> {
  let uid = record_kl
    .get_num32("UID")
    .ok_or_else(|| EngineError::ProtocolBadParameters("RECORD missing UID".to_string()))?;
  let modseq = record_kl.get_num64("MODSEQ").unwrap_or(0);
  let last_updated = record_kl.get_date("LAST_UPDATED").unwrap_or(0);
  let internaldate = record_kl.get_date("INTERNALDATE").unwrap_or(0);
  let size = record_kl.get_num32("SIZE").unwrap_or(0);
  let declared_guid = record_kl
    .get_guid("GUID")
    .ok_or_else(|| EngineError::ProtocolBadParameters("RECORD missing GUID".to_string()))?;

  let mut system_flags = SystemFlags::empty();
  let mut user_flags = Vec::new();
  if let Some(flags) = record_kl.get_list("FLAGS") {
    for flag in flags {
      if let crate::dlist::Value::Atom(atom) = &flag.value {
        match atom.as_str() {
          "\\Seen" => system_flags |= SystemFlags::SEEN,
          "\\Answered" => system_flags |= SystemFlags::ANSWERED,
          "\\Flagged" => system_flags |= SystemFlags::FLAGGED,
          "\\Deleted" => system_flags |= SystemFlags::DELETED,
          "\\Draft" => system_flags |= SystemFlags::DRAFT,
          "\\Expunged" => system_flags |= SystemFlags::EXPUNGED,
          other => user_flags.push(other.to_string()),
        }
      }
    }
  }

  if let Some(staged) = &staged {
    let actual_guid = MessageGuid::from_bytes(&std::fs::read(staged)?);
    if actual_guid != declared_guid {
      return Err(EngineError::Corruption(format!("staged guid {actual_guid} does not match record guid {declared_guid}")));
    }
    let dst = store.reserve_path(partition, &declared_guid);
    if let Err(e) = store.copyfile(staged, &dst, CopyFlags::empty()) {
      if !system_flags.contains(SystemFlags::EXPUNGED) {
        return Err(e);
      }
      system_flags |= SystemFlags::UNLINKED;
    }
  } else if !system_flags.contains(SystemFlags::EXPUNGED) {
    return Err(EngineError::ProtocolBadParameters(format!("no payload available for uid {uid} in {mailbox}")));
  } else {
    system_flags |= SystemFlags::UNLINKED;
  }

  if let Some(annots) = record_kl.get_list("ANNOTATIONS") {
    let mut remote = crate::collections::AnnotList::new();
    for child in annots {
      let entry = child.get_atom("ENTRY").unwrap_or_default().to_string();
      let userid = child.get_atom("USERID").unwrap_or_default().to_string();
      let value = child.get_map("VALUE").unwrap_or_default().to_vec();
      remote.add(Annotation { entry, userid, value });
    }
    remote.sort();
    let mut state = store.get_annotate_state(mailbox, uid)?;
    annotation::apply(&mut *state, &crate::collections::AnnotList::new(), &remote, false)?;
    state.commit()?;
  }

  log::trace!("applying uid={uid} guid={declared_guid} to {mailbox}");
  store.append_index_record(
    mailbox,
    IndexRecord { uid, modseq, last_updated, internaldate, size, guid: declared_guid, system_flags, user_flags },
  )
}
