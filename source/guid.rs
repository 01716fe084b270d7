//! Content-addressed message identity (design §3, §4.D).

use sha2::Digest as _;
use std::cmp::Ordering;
use std::fmt;

/// A 20-byte content identifier, total-ordered by byte comparison. The
/// all-zero value is the null sentinel ("no identity").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageGuid([u8; 20]);

impl MessageGuid {
  pub const NULL: MessageGuid = MessageGuid([0u8; 20]);

  /// Hash the given bytes into a GUID. Content identity is owned directly
  /// by the engine rather than delegated to the mail store, since the mail
  /// store is reached through an external trait, not an FFI binding.
  pub fn from_bytes(data: &[u8]) -> MessageGuid {
    let digest = sha2::Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    MessageGuid(out)
  }

  pub fn from_array(bytes: [u8; 20]) -> MessageGuid {
    MessageGuid(bytes)
  }

  pub fn is_null(&self) -> bool {
    self.0 == [0u8; 20]
  }

  /// Bucket index for a hash table of size `n` (design §4.C: `hash(n) -> [0,n)`).
  pub fn hash(&self, n: usize) -> usize {
    if n == 0 {
      return 0;
    }
    let mut acc: u64 = 0;
    for byte in self.0 {
      acc = acc.wrapping_mul(31).wrapping_add(byte as u64);
    }
    (acc % n as u64) as usize
  }

  pub fn encode(&self) -> String {
    hex::encode(self.0)
  }

  pub fn decode(s: &str) -> Option<MessageGuid> {
    let mut out = [0u8; 20];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(MessageGuid(out))
  }
}

impl fmt::Debug for MessageGuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "MessageGuid({})", self.encode())
  }
}

impl fmt::Display for MessageGuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.encode())
  }
}

/// Explicit re-export of the ordering so callers needn't import `Ordering`
/// just to compare two GUIDs.
pub fn compare(a: &MessageGuid, b: &MessageGuid) -> Ordering {
  a.cmp(b)
}
