//! Annotation merge (design §4.F): an ordered two-way merge between a local
//! and a remote `AnnotList`, committed through the mail-store's annotation
//! transaction with a configurable tie-break policy.

use crate::collections::AnnotList;
use crate::error::EngineError;
use crate::model::Annotation;
use crate::store::AnnotateStore;
use std::cmp::Ordering;

fn compare_key(a: &Annotation, b: &Annotation) -> Ordering {
  (a.entry.as_str(), a.userid.as_str()).cmp(&(b.entry.as_str(), b.userid.as_str()))
}

/// Pure comparison, no writes: the first key where the two streams differ
/// (by key or by value), or `Equal` if both lists are exhausted together.
/// Mirrors the original's separate `diff_annotations` entry point used by
/// callers that only want to know whether two snapshots differ.
pub fn diff(local: &AnnotList, remote: &AnnotList) -> Ordering {
  let mut local = local.iter();
  let mut remote = remote.iter();
  loop {
    match (local.next(), remote.next()) {
      (None, None) => return Ordering::Equal,
      (Some(l), None) => return compare_pair(Some(l), None, true),
      (None, Some(r)) => return compare_pair(None, Some(r), true),
      (Some(l), Some(r)) => {
        let d = compare_pair(Some(l), Some(r), true);
        if d != Ordering::Equal {
          return d;
        }
      }
    }
  }
}

fn compare_pair(a: Option<&Annotation>, b: Option<&Annotation>, diff_value: bool) -> Ordering {
  match (a, b) {
    (None, None) => Ordering::Equal,
    (Some(_), None) => Ordering::Less,
    (None, Some(_)) => Ordering::Greater,
    (Some(a), Some(b)) => {
      let key = compare_key(a, b);
      if key != Ordering::Equal {
        return key;
      }
      if diff_value {
        a.value.cmp(&b.value)
      } else {
        Ordering::Equal
      }
    }
  }
}

/// Merge `local` and `remote` (both precondition-sorted ascending on
/// `(entry, userid)`, design §3) and commit the result through `store`.
/// `local_wins` breaks ties when both sides have a value for the same key:
/// the winner's value is written; the loser's key, if it appears only on
/// the losing side, is written back as empty (design §4.F).
///
/// Any write error aborts the remainder of the merge; already-applied
/// writes are not rolled back here because `store` owns its own commit/
/// abort discipline (design §5: "the struct mailbox manages it for us" for
/// per-message transactions, engine-managed for the mailbox-wide case).
pub fn apply(
  store: &mut dyn AnnotateStore,
  local: &AnnotList,
  remote: &AnnotList,
  local_wins: bool,
) -> Result<(), EngineError> {
  let mut local_iter = local.iter().peekable();
  let mut remote_iter = remote.iter().peekable();

  loop {
    let diff = compare_pair(local_iter.peek().copied(), remote_iter.peek().copied(), false);
    match (local_iter.peek().copied(), remote_iter.peek().copied()) {
      (None, None) => break,
      _ => {}
    }
    match diff {
      Ordering::Less => {
        let l = local_iter.next().unwrap();
        let value: &[u8] = if local_wins { &l.value } else { &[] };
        store.write(&l.entry, &l.userid, value)?;
      }
      Ordering::Greater => {
        let r = remote_iter.next().unwrap();
        let value: &[u8] = if local_wins { &[] } else { &r.value };
        store.write(&r.entry, &r.userid, value)?;
      }
      Ordering::Equal => {
        let l = local_iter.next().unwrap();
        let r = remote_iter.next().unwrap();
        if l.value == r.value {
          continue;
        }
        let (entry, userid, value) = if local_wins { (&l.entry, &l.userid, &l.value) } else { (&r.entry, &r.userid, &r.value) };
        store.write(entry, userid, value)?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct RecordingStore {
    writes: Vec<(String, String, Vec<u8>)>,
  }

  impl AnnotateStore for RecordingStore {
    fn write(&mut self, entry: &str, userid: &str, value: &[u8]) -> Result<(), EngineError> {
      self.writes.push((entry.to_string(), userid.to_string(), value.to_vec()));
      Ok(())
    }
  }

  fn annot(entry: &str, userid: &str, value: &str) -> Annotation {
    Annotation { entry: entry.to_string(), userid: userid.to_string(), value: value.as_bytes().to_vec() }
  }

  #[test]
  fn scenario_s4_annotation_merge_remote_wins() {
    let mut local = AnnotList::new();
    local.add(annot("E1", "U", "a"));
    local.add(annot("E2", "U", "b"));
    let mut remote = AnnotList::new();
    remote.add(annot("E1", "U", "z"));
    remote.add(annot("E3", "U", "c"));

    let mut store = RecordingStore::default();
    apply(&mut store, &local, &remote, false).unwrap();

    assert_eq!(
      store.writes,
      vec![
        ("E1".to_string(), "U".to_string(), b"z".to_vec()),
        ("E2".to_string(), "U".to_string(), b"".to_vec()),
        ("E3".to_string(), "U".to_string(), b"c".to_vec()),
      ]
    );
  }

  #[test]
  fn property_8_bias_follows_local_wins_flag() {
    let mut local = AnnotList::new();
    local.add(annot("E1", "U", "local-value"));
    let mut remote = AnnotList::new();
    remote.add(annot("E1", "U", "remote-value"));

    let mut store = RecordingStore::default();
    apply(&mut store, &local, &remote, true).unwrap();
    assert_eq!(store.writes[0].2, b"local-value");

    let mut store = RecordingStore::default();
    apply(&mut store, &local, &remote, false).unwrap();
    assert_eq!(store.writes[0].2, b"remote-value");
  }

  #[test]
  fn equal_values_produce_no_write() {
    let mut local = AnnotList::new();
    local.add(annot("E1", "U", "same"));
    let mut remote = AnnotList::new();
    remote.add(annot("E1", "U", "same"));

    let mut store = RecordingStore::default();
    apply(&mut store, &local, &remote, true).unwrap();
    assert!(store.writes.is_empty());
  }

  #[test]
  fn property_7_merge_is_idempotent_on_second_application() {
    let mut local = AnnotList::new();
    local.add(annot("E1", "U", "a"));
    let mut remote = AnnotList::new();
    remote.add(annot("E1", "U", "b"));

    // First application: values differ, one write happens, and after a
    // real store commit the two sides would now agree. We simulate that by
    // re-running the merge with the winner's value reflected on both
    // sides, which must produce no further writes.
    let mut store = RecordingStore::default();
    apply(&mut store, &local, &remote, false).unwrap();
    assert_eq!(store.writes.len(), 1);

    let mut converged_local = AnnotList::new();
    converged_local.add(annot("E1", "U", "b"));
    let mut store2 = RecordingStore::default();
    apply(&mut store2, &converged_local, &remote, false).unwrap();
    assert!(store2.writes.is_empty());
  }

  #[test]
  fn diff_detects_value_only_change() {
    let mut a = AnnotList::new();
    a.add(annot("E1", "U", "x"));
    let mut b = AnnotList::new();
    b.add(annot("E1", "U", "y"));
    assert_ne!(diff(&a, &b), Ordering::Equal);
    assert_eq!(diff(&a, &a.clone()), Ordering::Equal);
  }
}
