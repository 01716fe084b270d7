//! Reconciliation collections (design §4.C, §9): append-only sequences with
//! an auxiliary hash index over stable keys, standing in for the original
//! pointer-linked lists with head/tail/hash chains. Ownership is exclusive;
//! a collection is freed as a whole when dropped.

use crate::guid::MessageGuid;
use crate::model::{Annotation, FolderSnapshot, Quota, SieveScript};
use std::collections::HashMap;

/// One content-addressed payload slot. `need_upload` starts `true` on first
/// insertion and flips to `false` exactly once a sender has attached the
/// payload (design §4.D: the first-GUID-encounter rule).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MsgidEntry {
  pub guid: MessageGuid,
  pub need_upload: bool,
}

#[derive(Debug, Default)]
pub struct MsgidList {
  entries: Vec<MsgidEntry>,
  index: HashMap<MessageGuid, usize>,
  pub toupload: usize,
}

impl MsgidList {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert `guid`, or return its existing entry if already present
  /// (idempotent by GUID, design §8 property 2). The null GUID is silently
  /// ignored. Returns the entry's stable index, for use with
  /// [`MsgidList::mark_sent`].
  pub fn insert(&mut self, guid: MessageGuid) -> Option<usize> {
    if guid.is_null() {
      return None;
    }
    if let Some(&idx) = self.index.get(&guid) {
      return Some(idx);
    }
    let idx = self.entries.len();
    self.entries.push(MsgidEntry { guid, need_upload: true });
    self.index.insert(guid, idx);
    self.toupload += 1;
    Some(idx)
  }

  pub fn lookup(&self, guid: &MessageGuid) -> Option<&MsgidEntry> {
    self.index.get(guid).map(|&idx| &self.entries[idx])
  }

  pub fn need_upload(&self, idx: usize) -> bool {
    self.entries[idx].need_upload
  }

  /// Mark the entry sent: `need_upload` transitions to `false` and
  /// `toupload` decreases by exactly one (design §8 property 3). A no-op
  /// if the entry was already marked sent.
  pub fn mark_sent(&mut self, idx: usize) {
    let entry = &mut self.entries[idx];
    if entry.need_upload {
      entry.need_upload = false;
      self.toupload -= 1;
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Per-partition reservation sets; lazily creates a `MsgidList` the first
/// time a partition is asked for (design §4.C).
#[derive(Debug, Default)]
pub struct ReserveList {
  partitions: Vec<(String, MsgidList)>,
}

impl ReserveList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn partlist(&mut self, partition: &str) -> &mut MsgidList {
    if let Some(pos) = self.partitions.iter().position(|(p, _)| p == partition) {
      return &mut self.partitions[pos].1;
    }
    self.partitions.push((partition.to_string(), MsgidList::new()));
    &mut self.partitions.last_mut().expect("just pushed").1
  }

  pub fn get(&self, partition: &str) -> Option<&MsgidList> {
    self.partitions.iter().find(|(p, _)| p == partition).map(|(_, l)| l)
  }

  pub fn partitions(&self) -> impl Iterator<Item = &str> {
    self.partitions.iter().map(|(p, _)| p.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct FolderEntry {
  pub snapshot: FolderSnapshot,
  pub mark: bool,
}

/// Folders known to one side of the exchange. `mark` lets a caller running a
/// full-tree reconciliation pass record which folders it has accounted for;
/// anything left unmarked after the pass is a folder the other side should
/// no longer have.
#[derive(Debug, Default)]
pub struct FolderList {
  entries: Vec<FolderEntry>,
}

impl FolderList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, snapshot: FolderSnapshot) {
    self.entries.push(FolderEntry { snapshot, mark: false });
  }

  pub fn lookup(&self, name: &str) -> Option<&FolderEntry> {
    self.entries.iter().find(|e| e.snapshot.name == name)
  }

  pub fn lookup_mut(&mut self, name: &str) -> Option<&mut FolderEntry> {
    self.entries.iter_mut().find(|e| e.snapshot.name == name)
  }

  pub fn unmarked(&self) -> impl Iterator<Item = &FolderEntry> {
    self.entries.iter().filter(|e| !e.mark)
  }

  pub fn iter(&self) -> impl Iterator<Item = &FolderEntry> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct RenameEntry {
  pub old_mboxname: String,
  pub new_mboxname: String,
  pub new_partition: String,
  pub done: bool,
}

/// Mailbox renames pending application; `done` lets a retry loop skip
/// renames a prior partial pass already completed.
#[derive(Debug, Default)]
pub struct RenameList {
  entries: Vec<RenameEntry>,
}

impl RenameList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, old_mboxname: String, new_mboxname: String, new_partition: String) {
    self.entries.push(RenameEntry { old_mboxname, new_mboxname, new_partition, done: false });
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RenameEntry> {
    self.entries.iter_mut()
  }

  pub fn pending(&self) -> impl Iterator<Item = &RenameEntry> {
    self.entries.iter().filter(|e| !e.done)
  }
}

#[derive(Debug, Clone)]
pub struct QuotaEntry {
  pub quota: Quota,
  pub done: bool,
}

#[derive(Debug, Default)]
pub struct QuotaList {
  entries: Vec<QuotaEntry>,
}

impl QuotaList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, quota: Quota) {
    self.entries.push(QuotaEntry { quota, done: false });
  }

  pub fn lookup(&self, root: &str) -> Option<&QuotaEntry> {
    self.entries.iter().find(|e| e.quota.root == root)
  }

  pub fn iter(&self) -> impl Iterator<Item = &QuotaEntry> {
    self.entries.iter()
  }
}

#[derive(Debug, Clone)]
pub struct SieveEntry {
  pub script: SieveScript,
  pub mark: bool,
}

#[derive(Debug, Default)]
pub struct SieveList {
  entries: Vec<SieveEntry>,
}

impl SieveList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, script: SieveScript) {
    self.entries.push(SieveEntry { script, mark: false });
  }

  pub fn lookup(&self, name: &str) -> Option<&SieveEntry> {
    self.entries.iter().find(|e| e.script.name == name)
  }

  pub fn lookup_mut(&mut self, name: &str) -> Option<&mut SieveEntry> {
    self.entries.iter_mut().find(|e| e.script.name == name)
  }

  pub fn active(&self) -> Option<&SieveEntry> {
    self.entries.iter().find(|e| e.script.active)
  }

  pub fn iter(&self) -> impl Iterator<Item = &SieveEntry> {
    self.entries.iter()
  }
}

/// Generic deduplicated-by-exact-byte-equality name set (design §4.C),
/// backing both the rename engine's "seen source names" set and the sieve
/// engine's directory inventory cross-checks.
#[derive(Debug, Default)]
pub struct NameList {
  names: Vec<String>,
  index: std::collections::HashSet<String>,
}

impl NameList {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns `true` if `name` was newly added.
  pub fn add(&mut self, name: impl Into<String>) -> bool {
    let name = name.into();
    if self.index.insert(name.clone()) {
      self.names.push(name);
      true
    } else {
      false
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.index.contains(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeenEntry {
  pub uniqueid: String,
  pub seenuids: String,
  pub lastread: u64,
  pub lastchange: u64,
  pub lastuid: u32,
  pub recentuid: u32,
}

/// Per-user \Seen/\Recent state, which in this store is keyed by user
/// rather than by message and so travels independently of `IndexRecord`
/// (design §3.L).
#[derive(Debug, Default)]
pub struct SeenList {
  entries: Vec<SeenEntry>,
}

impl SeenList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, entry: SeenEntry) {
    self.entries.push(entry);
  }

  pub fn lookup(&self, uniqueid: &str) -> Option<&SeenEntry> {
    self.entries.iter().find(|e| e.uniqueid == uniqueid)
  }
}

/// Annotations kept in ascending `(entry, userid)` order, a precondition of
/// the merge algorithm in `annotation.rs` (design §3, §4.F).
#[derive(Debug, Default, Clone)]
pub struct AnnotList {
  entries: Vec<Annotation>,
}

impl AnnotList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, entry: Annotation) {
    self.entries.push(entry);
  }

  /// Sort into the order the merge algorithm requires.
  pub fn sort(&mut self) {
    self.entries.sort_by(|a, b| (a.entry.as_str(), a.userid.as_str()).cmp(&(b.entry.as_str(), b.userid.as_str())));
  }

  pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
    self.entries.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEntry {
  pub name: Option<String>,
  pub user: Option<String>,
  pub active: bool,
}

/// De-duplicated ordered work-item queue (design §4.J). `add` treats `None`
/// as a wildcard that only matches another `None` on the same field, never
/// matching a concrete value.
#[derive(Debug, Default)]
pub struct ActionList {
  entries: Vec<ActionEntry>,
}

impl ActionList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, name: Option<&str>, user: Option<&str>) {
    let matches = self.entries.iter_mut().find(|e| {
      names_match(e.name.as_deref(), name) && names_match(e.user.as_deref(), user)
    });
    if let Some(entry) = matches {
      entry.active = true;
      return;
    }
    self.entries.push(ActionEntry { name: name.map(str::to_string), user: user.map(str::to_string), active: true });
  }

  pub fn iter(&self) -> impl Iterator<Item = &ActionEntry> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

fn names_match(stored: Option<&str>, candidate: Option<&str>) -> bool {
  match (stored, candidate) {
    (None, None) => true,
    (None, Some(_)) | (Some(_), None) => false,
    (Some(a), Some(b)) => a == b,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn msgid_list_insert_is_idempotent() {
    let mut list = MsgidList::new();
    let guid = MessageGuid::from_bytes(b"a");
    let first = list.insert(guid).unwrap();
    let second = list.insert(guid).unwrap();
    assert_eq!(first, second);
    assert_eq!(list.len(), 1);
  }

  #[test]
  fn msgid_list_ignores_null_guid() {
    let mut list = MsgidList::new();
    assert_eq!(list.insert(MessageGuid::NULL), None);
    assert!(list.is_empty());
  }

  #[test]
  fn msgid_list_mark_sent_decrements_toupload_once() {
    let mut list = MsgidList::new();
    let guid = MessageGuid::from_bytes(b"b");
    let idx = list.insert(guid).unwrap();
    assert_eq!(list.toupload, 1);
    list.mark_sent(idx);
    assert!(!list.need_upload(idx));
    assert_eq!(list.toupload, 0);
    list.mark_sent(idx);
    assert_eq!(list.toupload, 0);
  }

  #[test]
  fn reserve_list_lazily_creates_partitions() {
    let mut reserve = ReserveList::new();
    assert!(reserve.get("default").is_none());
    reserve.partlist("default").insert(MessageGuid::from_bytes(b"x"));
    assert_eq!(reserve.get("default").unwrap().len(), 1);
  }

  #[test]
  fn action_list_dedups_on_name_user_pair_with_null_wildcard() {
    let mut actions = ActionList::new();
    actions.add(Some("INBOX"), Some("alice"));
    actions.add(Some("INBOX"), Some("alice"));
    assert_eq!(actions.len(), 1);
    actions.add(None, Some("alice"));
    actions.add(None, Some("alice"));
    assert_eq!(actions.len(), 2);
    actions.add(None, Some("bob"));
    assert_eq!(actions.len(), 3);
  }

  #[test]
  fn name_list_dedups_on_exact_bytes() {
    let mut names = NameList::new();
    assert!(names.add("defaultbc"));
    assert!(!names.add("defaultbc"));
    assert_eq!(names.iter().count(), 1);
  }
}
