//! Shared data-model types (design §3): the projection of a mail store's
//! per-message row the engine diffs, a replica's view of one mailbox, and
//! the small value types (sieve scripts, annotations, quotas) that travel
//! alongside them.

use crate::guid::MessageGuid;
use bitflags::bitflags;

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct SystemFlags: u8 {
    const SEEN     = 0b0000_0001;
    const ANSWERED = 0b0000_0010;
    const FLAGGED  = 0b0000_0100;
    const DELETED  = 0b0000_1000;
    const DRAFT    = 0b0001_0000;
    const EXPUNGED = 0b0010_0000;
    const UNLINKED = 0b0100_0000;
  }
}

impl SystemFlags {
  /// Literal IMAP-style atoms emitted on the wire, in a fixed order
  /// (design §4.E: "system flags become the literal atoms \Seen \Answered
  /// \Flagged \Deleted \Draft \Expunged"). `\Unlinked` is a local-only bit,
  /// never sent.
  pub fn wire_atoms(&self) -> Vec<&'static str> {
    const TABLE: &[(SystemFlags, &str)] = &[
      (SystemFlags::SEEN, "\\Seen"),
      (SystemFlags::ANSWERED, "\\Answered"),
      (SystemFlags::FLAGGED, "\\Flagged"),
      (SystemFlags::DELETED, "\\Deleted"),
      (SystemFlags::DRAFT, "\\Draft"),
      (SystemFlags::EXPUNGED, "\\Expunged"),
    ];
    TABLE.iter().filter(|(bit, _)| self.contains(*bit)).map(|(_, atom)| *atom).collect()
  }
}

pub const MAX_USER_FLAGS: usize = 128;

/// Projection of the mail store's per-message row used by the engine
/// (design §3).
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
  pub uid: u32,
  pub modseq: u64,
  pub last_updated: u64,
  pub internaldate: u64,
  pub size: u32,
  pub guid: MessageGuid,
  pub system_flags: SystemFlags,
  pub user_flags: Vec<String>,
}

/// One replica's view of a single mailbox (design §3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FolderSnapshot {
  pub uniqueid: String,
  pub name: String,
  pub mbtype: Option<String>,
  pub partition: String,
  pub acl: String,
  pub options: MailboxOptions,
  pub uidvalidity: u32,
  pub last_uid: u32,
  pub highestmodseq: u64,
  pub sync_crc: u32,
  pub recentuid: u32,
  pub recenttime: u64,
  pub pop3_last_login: u64,
  pub pop3_show_after: u64,
  pub quotaroot: Option<String>,
}

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct MailboxOptions: u8 {
    const POP3_NEW_UIDL = 0b001;
    const IMAP_SHAREDSEEN = 0b010;
    const IMAP_DUPDELIVER = 0b100;
  }
}

/// Mailbox-type bits used by `addmbox`-equivalent filtering (design §3.M):
/// a mailbox carrying any of these bits is not replication-eligible.
bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct MailboxTypeBits: u8 {
    const RESERVE = 0b001;
    const MOVING  = 0b010;
    const REMOTE  = 0b100;
  }
}

pub fn is_replication_eligible(mbtype: MailboxTypeBits) -> bool {
  (mbtype & (MailboxTypeBits::RESERVE | MailboxTypeBits::MOVING | MailboxTypeBits::REMOTE)).is_empty()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SieveScript {
  pub name: String,
  pub last_update: u64,
  pub guid: MessageGuid,
  pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
  pub entry: String,
  pub userid: String,
  pub value: Vec<u8>,
}

pub const QUOTA_UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuotaResource {
  Storage,
  Message,
  AnnotStorage,
}

impl QuotaResource {
  pub const ALL: [QuotaResource; 3] = [QuotaResource::Storage, QuotaResource::Message, QuotaResource::AnnotStorage];

  pub fn wire_name(&self) -> &'static str {
    match self {
      QuotaResource::Storage => "STORAGE",
      QuotaResource::Message => "MESSAGE",
      QuotaResource::AnnotStorage => "ANNOTSTORAGE",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quota {
  pub root: String,
  pub limits: std::collections::HashMap<QuotaResource, i64>,
}

impl Quota {
  pub fn new(root: impl Into<String>) -> Quota {
    let mut limits = std::collections::HashMap::new();
    for r in QuotaResource::ALL {
      limits.insert(r, QUOTA_UNLIMITED);
    }
    Quota { root: root.into(), limits }
  }

  pub fn limit(&self, r: QuotaResource) -> i64 {
    *self.limits.get(&r).unwrap_or(&QUOTA_UNLIMITED)
  }
}
