//! Quota limits wire encoding (design §6, §8 scenario S6): always emit the
//! legacy `LIMIT` key (mirroring `STORAGE`) for backward compatibility,
//! plus every resource under its own name.

use crate::dlist::Dlist;
use crate::model::{Quota, QuotaResource, QUOTA_UNLIMITED};

/// Sentinel wire value standing in for [`QUOTA_UNLIMITED`]: a peer that
/// doesn't yet understand a resource still sees a legitimate (very large)
/// number rather than a negative one.
const WIRE_UNLIMITED: u64 = u64::MAX;

fn to_wire(limit: i64) -> u64 {
  if limit == QUOTA_UNLIMITED {
    WIRE_UNLIMITED
  } else {
    limit as u64
  }
}

fn from_wire(value: u64) -> i64 {
  if value == WIRE_UNLIMITED {
    QUOTA_UNLIMITED
  } else {
    value as i64
  }
}

pub fn encode(kl: &mut Dlist, quota: &Quota) {
  kl.set_atom("ROOT", quota.root.clone());
  kl.set_num64("LIMIT", to_wire(quota.limit(QuotaResource::Storage)));
  for resource in QuotaResource::ALL {
    let limit = quota.limit(resource);
    if limit >= 0 {
      kl.set_num64(resource.wire_name(), to_wire(limit));
    }
  }
}

pub fn decode(kl: &Dlist) -> Option<Quota> {
  let root = kl.get_atom("ROOT")?.to_string();
  let mut quota = Quota::new(root);
  if let Some(limit) = kl.get_num64("LIMIT") {
    quota.limits.insert(QuotaResource::Storage, from_wire(limit));
  }
  for resource in QuotaResource::ALL {
    if let Some(limit) = kl.get_num64(resource.wire_name()) {
      quota.limits.insert(resource, from_wire(limit));
    }
  }
  Some(quota)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scenario_s6_quota_backward_compat() {
    let mut quota = Quota::new("user.alice");
    quota.limits.insert(QuotaResource::Storage, QUOTA_UNLIMITED);
    quota.limits.insert(QuotaResource::Message, 1000);

    let mut kl = Dlist::new_kvlist(Some("QUOTA"));
    encode(&mut kl, &quota);

    assert_eq!(kl.get_num64("LIMIT"), Some(WIRE_UNLIMITED));
    assert_eq!(kl.get_num64("MESSAGE"), Some(1000));

    let decoded = decode(&kl).unwrap();
    assert_eq!(decoded.limit(QuotaResource::Storage), QUOTA_UNLIMITED);
    assert_eq!(decoded.limit(QuotaResource::Message), 1000);
  }

  #[test]
  fn property_round_trip_preserves_unlimited() {
    let mut quota = Quota::new("user.bob");
    quota.limits.insert(QuotaResource::Storage, 50_000);
    quota.limits.insert(QuotaResource::AnnotStorage, QUOTA_UNLIMITED);

    let mut kl = Dlist::new_kvlist(Some("QUOTA"));
    encode(&mut kl, &quota);
    let decoded = decode(&kl).unwrap();
    assert_eq!(decoded, quota);
  }
}
