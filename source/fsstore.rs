//! Filesystem-backed `MailStore` (design §6): a concrete implementation
//! used by the CLI and by integration tests. Message payloads are kept as
//! real content-addressed files under a partition root (mirroring
//! `reserve_path`'s contract exactly, since the dlist codec streams literal
//! bytes straight to whatever path this returns); index rows, per-message
//! annotations and user-flag tables are kept in memory, since nothing in
//! `SPEC_FULL.md` mandates an on-disk index format and every real on-disk
//! index is itself swapped out behind this trait in a full deployment.

use crate::error::EngineError;
use crate::guid::MessageGuid;
use crate::model::{Annotation, IndexRecord, MAX_USER_FLAGS};
use crate::store::{AnnotateState, CopyFlags, MailStore};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone)]
struct MailboxState {
  records: Vec<IndexRecord>,
  user_flags: Vec<String>,
  mailbox_annotations: Vec<Annotation>,
  message_annotations: HashMap<u32, Vec<Annotation>>,
  message_paths: HashMap<u32, PathBuf>,
  crc_vers: Option<u32>,
}

#[derive(Debug)]
pub struct FsStore {
  root: PathBuf,
  mailboxes: HashMap<String, MailboxState>,
}

impl FsStore {
  pub fn open(root: impl Into<PathBuf>) -> io::Result<FsStore> {
    let root = root.into();
    fs::create_dir_all(root.join("partitions"))?;
    Ok(FsStore { root, mailboxes: HashMap::new() })
  }

  pub fn create_mailbox(&mut self, mailbox: &str) {
    self.mailboxes.entry(mailbox.to_string()).or_default();
  }

  fn mailbox(&self, mailbox: &str) -> Result<&MailboxState, EngineError> {
    self.mailboxes.get(mailbox).ok_or_else(|| EngineError::MailboxNonexistent(mailbox.to_string()))
  }

  fn mailbox_mut(&mut self, mailbox: &str) -> Result<&mut MailboxState, EngineError> {
    self.mailboxes.get_mut(mailbox).ok_or_else(|| EngineError::MailboxNonexistent(mailbox.to_string()))
  }

  /// Link a staged, already-GUID-verified file into the mailbox under
  /// `uid`, recording its path for future `message_fname` lookups. Used by
  /// `mailbox::apply_record` after `copyfile`.
  pub fn link_message(&mut self, mailbox: &str, uid: u32, path: PathBuf) -> Result<(), EngineError> {
    self.mailbox_mut(mailbox)?.message_paths.insert(uid, path);
    Ok(())
  }

  pub fn set_mailbox_annotations(&mut self, mailbox: &str, annotations: Vec<Annotation>) -> Result<(), EngineError> {
    self.mailbox_mut(mailbox)?.mailbox_annotations = annotations;
    Ok(())
  }

  pub fn mailbox_annotations(&self, mailbox: &str) -> Result<&[Annotation], EngineError> {
    Ok(&self.mailbox(mailbox)?.mailbox_annotations)
  }

  pub fn message_annotations(&self, mailbox: &str, uid: u32) -> Result<&[Annotation], EngineError> {
    Ok(self.mailbox(mailbox)?.message_annotations.get(&uid).map(Vec::as_slice).unwrap_or(&[]))
  }

  /// The mailboxes this store currently knows about, for a caller driving a
  /// full exchange over every local mailbox (the `FolderList` enumeration
  /// design §3 describes as living outside the narrow `MailStore` contract).
  pub fn mailbox_names(&self) -> Vec<String> {
    self.mailboxes.keys().cloned().collect()
  }

  pub fn record_count(&self, mailbox: &str) -> Result<u32, EngineError> {
    Ok(self.mailbox(mailbox)?.records.len() as u32)
  }

  /// Build the `FolderSnapshot` this replica would advertise for `mailbox`:
  /// `last_uid`/`highestmodseq` from the index, checksum from
  /// [`MailStore::sync_crc`]. `uidvalidity` is fixed at 1 since this store
  /// never reassigns it.
  pub fn snapshot(&self, mailbox: &str, partition: &str, crc_vers: u32) -> Result<crate::model::FolderSnapshot, EngineError> {
    let state = self.mailbox(mailbox)?;
    let last_uid = state.records.last().map(|r| r.uid).unwrap_or(0);
    let highestmodseq = state.records.iter().map(|r| r.modseq).max().unwrap_or(0);
    Ok(crate::model::FolderSnapshot {
      uniqueid: mailbox.to_string(),
      name: mailbox.to_string(),
      partition: partition.to_string(),
      uidvalidity: 1,
      last_uid,
      highestmodseq,
      sync_crc: self.sync_crc(mailbox, crc_vers, false)?,
      ..Default::default()
    })
  }
}

struct FsAnnotateState<'a> {
  store: &'a mut FsStore,
  mailbox: String,
  uid: u32,
  pending: Vec<Annotation>,
}

impl AnnotateState for FsAnnotateState<'_> {
  fn write(&mut self, entry: &str, userid: &str, value: &[u8]) -> Result<(), EngineError> {
    self.pending.push(Annotation { entry: entry.to_string(), userid: userid.to_string(), value: value.to_vec() });
    Ok(())
  }

  fn commit(&mut self) -> Result<(), EngineError> {
    let mailbox = self.store.mailbox_mut(&self.mailbox)?;
    let target = mailbox.message_annotations.entry(self.uid).or_default();
    for annot in self.pending.drain(..) {
      target.retain(|a| !(a.entry == annot.entry && a.userid == annot.userid));
      if !annot.value.is_empty() {
        target.push(annot);
      }
    }
    Ok(())
  }

  fn abort(&mut self) -> Result<(), EngineError> {
    self.pending.clear();
    Ok(())
  }
}

impl MailStore for FsStore {
  fn read_index_record(&self, mailbox: &str, recno: u32) -> Result<IndexRecord, EngineError> {
    let state = self.mailbox(mailbox)?;
    state
      .records
      .get(recno.checked_sub(1).ok_or_else(|| EngineError::Corruption("recno is 1-based".to_string()))? as usize)
      .cloned()
      .ok_or_else(|| EngineError::Io(io::Error::new(io::ErrorKind::NotFound, format!("no record {recno} in {mailbox}"))))
  }

  fn message_fname(&self, mailbox: &str, uid: u32) -> Option<PathBuf> {
    self.mailboxes.get(mailbox)?.message_paths.get(&uid).cloned()
  }

  fn copyfile(&self, src: &Path, dst: &Path, flags: CopyFlags) -> Result<(), EngineError> {
    if let Some(parent) = dst.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    if flags.contains(CopyFlags::PRESERVE_MTIME) {
      let mtime = fs::metadata(src)?.modified()?;
      let file = fs::File::open(dst)?;
      file.set_modified(mtime)?;
    }
    Ok(())
  }

  fn append_index_record(&mut self, mailbox: &str, record: IndexRecord) -> Result<(), EngineError> {
    let state = self.mailbox_mut(mailbox)?;
    if let Some(last) = state.records.last() {
      if record.uid <= last.uid {
        return Err(EngineError::Corruption(format!("non-monotonic uid {} after {}", record.uid, last.uid)));
      }
    }
    state.records.push(record);
    Ok(())
  }

  fn get_annotate_state(&mut self, mailbox: &str, uid: u32) -> Result<Box<dyn AnnotateState + '_>, EngineError> {
    self.mailbox(mailbox)?;
    Ok(Box::new(FsAnnotateState { store: self, mailbox: mailbox.to_string(), uid, pending: Vec::new() }))
  }

  fn best_crcvers(&self, min: u32, max: u32) -> Result<u32, EngineError> {
    if min > max {
      return Err(EngineError::ProtocolBadParameters(format!("empty crc version range [{min},{max}]")));
    }
    Ok(max)
  }

  fn sync_crc(&self, mailbox: &str, vers: u32, force: bool) -> Result<u32, EngineError> {
    let state = self.mailbox(mailbox)?;
    if !force {
      if let Some(cached) = state.crc_vers {
        if cached == vers {
          // Falls through to recompute anyway: this store keeps no cached
          // checksum value, only the negotiated version, so there is
          // nothing cheaper to return here than a fresh computation.
        }
      }
    }
    let mut crc = crc32(&vers.to_be_bytes());
    for record in &state.records {
      crc = crc32_continue(crc, record.guid.encode().as_bytes());
      crc = crc32_continue(crc, &record.uid.to_be_bytes());
      crc = crc32_continue(crc, &record.system_flags.bits().to_be_bytes());
    }
    Ok(crc)
  }

  fn user_flag(&mut self, mailbox: &str, name: &str, create: bool) -> Result<Option<u8>, EngineError> {
    let state = self.mailbox_mut(mailbox)?;
    if let Some(pos) = state.user_flags.iter().position(|f| f == name) {
      return Ok(Some(pos as u8));
    }
    if !create {
      return Ok(None);
    }
    if state.user_flags.len() >= MAX_USER_FLAGS {
      return Err(EngineError::ProtocolBadParameters(format!("user flag table full for {mailbox}")));
    }
    state.user_flags.push(name.to_string());
    Ok(Some((state.user_flags.len() - 1) as u8))
  }

  fn reserve_path(&self, partition: &str, guid: &MessageGuid) -> PathBuf {
    let hex = guid.encode();
    self.root.join("partitions").join(partition).join(&hex[0..2]).join(&hex[2..])
  }
}

// Not the IEEE CRC-32 table: a lightweight rolling checksum good enough for
// this store's only consumer, divergence detection between two in-process
// replicas in tests, where what matters is that it changes whenever the
// mailbox contents do.
fn crc32(bytes: &[u8]) -> u32 {
  crc32_continue(0xffff_ffff, bytes)
}

fn crc32_continue(mut crc: u32, bytes: &[u8]) -> u32 {
  for &b in bytes {
    crc ^= b as u32;
    for _ in 0..8 {
      crc = if crc & 1 != 0 { (crc >> 1) ^ 0xedb8_8320 } else { crc >> 1 };
    }
  }
  crc
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::SystemFlags;

  fn record(uid: u32, modseq: u64) -> IndexRecord {
    IndexRecord {
      uid,
      modseq,
      last_updated: 0,
      internaldate: 0,
      size: 0,
      guid: MessageGuid::from_bytes(format!("msg-{uid}").as_bytes()),
      system_flags: SystemFlags::empty(),
      user_flags: Vec::new(),
    }
  }

  #[test]
  fn append_index_record_rejects_non_monotonic_uid() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");
    store.append_index_record("INBOX", record(1, 1)).unwrap();
    store.append_index_record("INBOX", record(2, 2)).unwrap();
    let err = store.append_index_record("INBOX", record(2, 3)).unwrap_err();
    assert!(matches!(err, EngineError::Corruption(_)));
  }

  #[test]
  fn user_flag_table_assigns_and_reuses_slots() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");
    let first = store.user_flag("INBOX", "important", true).unwrap().unwrap();
    let second = store.user_flag("INBOX", "important", true).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(store.user_flag("INBOX", "unknown", false).unwrap(), None);
  }

  #[test]
  fn annotate_state_commit_drops_empty_values() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");
    {
      let mut state = store.get_annotate_state("INBOX", 1).unwrap();
      state.write("/comment", "alice", b"hello").unwrap();
      state.commit().unwrap();
    }
    assert_eq!(store.message_annotations("INBOX", 1).unwrap().len(), 1);
    {
      let mut state = store.get_annotate_state("INBOX", 1).unwrap();
      state.write("/comment", "alice", b"").unwrap();
      state.commit().unwrap();
    }
    assert!(store.message_annotations("INBOX", 1).unwrap().is_empty());
  }

  #[test]
  fn reserve_path_is_deterministic_and_shards_by_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::open(dir.path()).unwrap();
    let guid = MessageGuid::from_bytes(b"payload");
    let a = store.reserve_path("default", &guid);
    let b = store.reserve_path("default", &guid);
    assert_eq!(a, b);
    assert!(a.starts_with(dir.path().join("partitions").join("default")));
  }

  #[test]
  fn sync_crc_changes_when_mailbox_contents_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FsStore::open(dir.path()).unwrap();
    store.create_mailbox("INBOX");
    let before = store.sync_crc("INBOX", 1, false).unwrap();
    store.append_index_record("INBOX", record(1, 1)).unwrap();
    let after = store.sync_crc("INBOX", 1, false).unwrap();
    assert_ne!(before, after);
  }
}
