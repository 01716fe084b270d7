//! Typed error taxonomy for the replication engine (design §7).

use std::io;

/// The kinds an exchange can fail with. Every fallible engine call returns
/// `Result<T, EngineError>`; the CLI binary widens this to `anyhow::Result`
/// at the outermost boundary.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
  #[error("protocol error: {0}")]
  Protocol(String),
  #[error("protocol error: bad parameters: {0}")]
  ProtocolBadParameters(String),
  #[error("checksum mismatch: {0}")]
  SyncChecksum(String),
  #[error("invalid user: {0}")]
  InvalidUser(String),
  #[error("mailbox nonexistent: {0}")]
  MailboxNonexistent(String),
  #[error("denied by remote: {0}")]
  RemoteDenied(String),
  #[error("corruption detected: {0}")]
  Corruption(String),
}

impl EngineError {
  /// The wire token this error is reported under when sent back to a peer
  /// as `NO <TOKEN> <message>` (design §4.H / §7).
  pub fn wire_token(&self) -> &'static str {
    match self {
      EngineError::Io(_) => "IOERROR",
      EngineError::Protocol(_) => "IMAP_PROTOCOL_ERROR",
      EngineError::ProtocolBadParameters(_) => "IMAP_PROTOCOL_BAD_PARAMETERS",
      EngineError::SyncChecksum(_) => "IMAP_SYNC_CHECKSUM",
      EngineError::InvalidUser(_) => "IMAP_INVALID_USER",
      EngineError::MailboxNonexistent(_) => "IMAP_MAILBOX_NONEXISTENT",
      EngineError::RemoteDenied(_) => "IMAP_REMOTE_DENIED",
      EngineError::Corruption(_) => "IOERROR",
    }
  }

  /// Render as the line a peer would see after `NO `.
  pub fn to_wire(&self) -> String {
    format!("{} {}", self.wire_token(), self)
  }

  /// Inverse of the table in design §4.H: classify a `NO <errmsg>` line
  /// already stripped of the leading `NO `.
  pub fn from_response(errmsg: &str) -> EngineError {
    const PREFIXES: &[(&str, fn(String) -> EngineError)] = &[
      ("IMAP_INVALID_USER ", |m| EngineError::InvalidUser(m)),
      ("IMAP_MAILBOX_NONEXISTENT ", |m| EngineError::MailboxNonexistent(m)),
      ("IMAP_SYNC_CHECKSUM ", |m| EngineError::SyncChecksum(m)),
      ("IMAP_PROTOCOL_ERROR ", |m| EngineError::Protocol(m)),
      ("IMAP_PROTOCOL_BAD_PARAMETERS ", |m| {
        EngineError::ProtocolBadParameters(m)
      }),
    ];
    for (prefix, build) in PREFIXES {
      if let Some(rest) = errmsg.strip_prefix(prefix) {
        return build(rest.to_string());
      }
    }
    EngineError::RemoteDenied(errmsg.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_known_prefixes() {
    assert!(matches!(
      EngineError::from_response("IMAP_SYNC_CHECKSUM mailbox=INBOX"),
      EngineError::SyncChecksum(m) if m == "mailbox=INBOX"
    ));
    assert!(matches!(
      EngineError::from_response("IMAP_INVALID_USER bob"),
      EngineError::InvalidUser(m) if m == "bob"
    ));
  }

  #[test]
  fn falls_back_to_remote_denied() {
    assert!(matches!(
      EngineError::from_response("disk quota exceeded"),
      EngineError::RemoteDenied(_)
    ));
  }

  #[test]
  fn wire_round_trip_token() {
    let err = EngineError::MailboxNonexistent("INBOX.Foo".to_string());
    let wire = err.to_wire();
    assert!(wire.starts_with("IMAP_MAILBOX_NONEXISTENT "));
  }
}
