//! Mailbox OPTIONS wire encoding (design §6): a fixed three-letter alphabet,
//! tolerant to unknown letters on decode.

use crate::model::MailboxOptions;

const ALPHABET: &[(MailboxOptions, char)] = &[
  (MailboxOptions::POP3_NEW_UIDL, 'P'),
  (MailboxOptions::IMAP_SHAREDSEEN, 'S'),
  (MailboxOptions::IMAP_DUPDELIVER, 'D'),
];

pub fn encode(options: MailboxOptions) -> String {
  ALPHABET.iter().filter(|(bit, _)| options.contains(*bit)).map(|(_, c)| *c).collect()
}

/// Unknown letters are ignored (design §6: "Parse is tolerant").
pub fn parse(s: &str) -> MailboxOptions {
  let mut out = MailboxOptions::empty();
  for c in s.chars() {
    if let Some((bit, _)) = ALPHABET.iter().find(|(_, letter)| *letter == c) {
      out |= *bit;
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scenario_s1_options_round_trip() {
    let bits = MailboxOptions::POP3_NEW_UIDL | MailboxOptions::IMAP_DUPDELIVER;
    assert_eq!(encode(bits), "PD");
    let parsed = parse("DPS");
    assert_eq!(
      parsed,
      MailboxOptions::POP3_NEW_UIDL | MailboxOptions::IMAP_SHAREDSEEN | MailboxOptions::IMAP_DUPDELIVER
    );
  }

  #[test]
  fn unknown_letters_are_ignored() {
    assert_eq!(parse("PXQS"), MailboxOptions::POP3_NEW_UIDL | MailboxOptions::IMAP_SHAREDSEEN);
  }

  #[test]
  fn property_round_trip_for_every_recognized_bitmask() {
    for bits in 0u8..8 {
      let options = MailboxOptions::from_bits_truncate(bits);
      assert_eq!(parse(&encode(options)), options);
    }
  }
}
