//! Mail-store contract (design §6): the engine treats the actual mailbox
//! storage as an external collaborator reached through a trait object rather
//! than an FFI binding to a specific C library.

use crate::error::EngineError;
use crate::model::IndexRecord;
use std::path::{Path, PathBuf};

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct CopyFlags: u8 {
    const PRESERVE_MTIME = 0b01;
  }
}

/// Opaque handle to an open annotation-write transaction on one mailbox or
/// one message, depending on how it was obtained (design §4.F, §5).
pub trait AnnotateState {
  fn write(&mut self, entry: &str, userid: &str, value: &[u8]) -> Result<(), EngineError>;
  fn commit(&mut self) -> Result<(), EngineError>;
  fn abort(&mut self) -> Result<(), EngineError>;
}

/// The narrower interface `annotation::apply` actually needs: a single
/// `write`, with the caller responsible for commit/abort around the whole
/// merge. `AnnotateState` implementations satisfy this trivially.
pub trait AnnotateStore {
  fn write(&mut self, entry: &str, userid: &str, value: &[u8]) -> Result<(), EngineError>;
}

impl<T: AnnotateState + ?Sized> AnnotateStore for T {
  fn write(&mut self, entry: &str, userid: &str, value: &[u8]) -> Result<(), EngineError> {
    AnnotateState::write(self, entry, userid, value)
  }
}

/// The mail-store contract required by the engine (design §6). One
/// implementation is expected per deployment target; `fsstore::FsStore` is
/// the filesystem-backed one used by the CLI and by tests.
pub trait MailStore {
  fn read_index_record(&self, mailbox: &str, recno: u32) -> Result<IndexRecord, EngineError>;

  fn message_fname(&self, mailbox: &str, uid: u32) -> Option<PathBuf>;

  fn copyfile(&self, src: &Path, dst: &Path, flags: CopyFlags) -> Result<(), EngineError>;

  fn append_index_record(&mut self, mailbox: &str, record: IndexRecord) -> Result<(), EngineError>;

  fn get_annotate_state(&mut self, mailbox: &str, uid: u32) -> Result<Box<dyn AnnotateState + '_>, EngineError>;

  fn best_crcvers(&self, min: u32, max: u32) -> Result<u32, EngineError>;

  fn sync_crc(&self, mailbox: &str, vers: u32, force: bool) -> Result<u32, EngineError>;

  /// Resolve (creating if `create`) the bit slot for a user-defined flag
  /// name, mirroring the original index's limited user-flag table
  /// (design §3, `MAX_USER_FLAGS`).
  fn user_flag(&mut self, mailbox: &str, name: &str, create: bool) -> Result<Option<u8>, EngineError>;

  fn reserve_path(&self, partition: &str, guid: &crate::guid::MessageGuid) -> PathBuf;
}
