//! Response parser & command dispatch (design §4.H): the three outgoing
//! verbs, untagged pushes, and the incoming word-by-word reader that
//! stitches `* <dlist>` lines into a list before seeing the terminating
//! `OK`/`NO`.

use crate::dlist::{self, Dlist};
use crate::error::EngineError;
use crate::stream::Stream;
use std::io::{Read, Write};
use std::path::Path;

fn send_verb<RW: Read + Write>(stream: &mut Stream<RW>, verb: &str, body: &Dlist) -> Result<(), EngineError> {
  stream.write_all(verb.as_bytes())?;
  stream.write_all(b" ")?;
  body.encode(stream)?;
  stream.write_all(b"\r\n")?;
  stream.flush()?;
  Ok(())
}

pub fn send_apply<RW: Read + Write>(stream: &mut Stream<RW>, body: &Dlist) -> Result<(), EngineError> {
  send_verb(stream, "APPLY", body)
}

pub fn send_get<RW: Read + Write>(stream: &mut Stream<RW>, body: &Dlist) -> Result<(), EngineError> {
  send_verb(stream, "GET", body)
}

pub fn send_set<RW: Read + Write>(stream: &mut Stream<RW>, body: &Dlist) -> Result<(), EngineError> {
  send_verb(stream, "SET", body)
}

/// Write one untagged push without flushing; the caller flushes once after
/// writing a whole batch (design §4.H).
pub fn send_push<RW: Read + Write>(stream: &mut Stream<RW>, body: &Dlist) -> Result<(), EngineError> {
  stream.write_all(b"* ")?;
  body.encode(stream)?;
  stream.write_all(b"\r\n")?;
  Ok(())
}

/// Reply `OK` to a command just processed (design §4.H, receiver side).
pub fn send_ok<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  stream.write_all(b"OK\r\n")?;
  stream.flush()?;
  Ok(())
}

/// Reply `NO <TOKEN> <message>` for an error raised while processing a
/// command (design §4.H, §7).
pub fn send_no<RW: Read + Write>(stream: &mut Stream<RW>, error: &EngineError) -> Result<(), EngineError> {
  stream.write_all(b"NO ")?;
  stream.write_all(error.to_wire().as_bytes())?;
  stream.write_all(b"\r\n")?;
  stream.flush()?;
  Ok(())
}

/// Read one incoming command: zero or more untagged `* <dlist>` pushes
/// (typically message payloads) followed by the verb line itself (design
/// §4.H, receiver side — the mirror of [`parse_response`] for whoever is on
/// the other end of an `APPLY`/`GET`/`SET`).
pub fn read_command<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
) -> Result<(String, Dlist, Vec<Dlist>), EngineError> {
  let mut pushes = Vec::new();
  loop {
    let (word, terminator) = stream.getword()?;
    if word.is_empty() && terminator.is_none() {
      return Err(EngineError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed before a command")));
    }
    let word = dlist::string_from_bytes(word)?;
    match word.as_str() {
      "*" => {
        if terminator != Some(b' ') {
          return Err(EngineError::Protocol(format!("malformed untagged push, word={word:?}")));
        }
        let item = dlist::parse(stream, staging_root)?;
        pushes.push(item);
        expect_crlf_after_value(stream)?;
      }
      verb @ ("APPLY" | "GET" | "SET") => {
        if terminator != Some(b' ') {
          return Err(EngineError::Protocol(format!("malformed {verb} command")));
        }
        let body = dlist::parse(stream, staging_root)?;
        expect_crlf_after_value(stream)?;
        return Ok((verb.to_string(), body, pushes));
      }
      other => {
        let rest = stream.getline().unwrap_or_default();
        return Err(EngineError::Protocol(format!("unexpected command word {other:?}, line={rest:?}")));
      }
    }
  }
}

/// Read a full response: zero or more untagged `* <dlist>` pushes followed
/// by `OK` or `NO <errmsg>`. Returns the pushes stitched into one list (or
/// `None` if there were none) on `OK`, or the classified error on `NO`.
pub fn parse_response<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
) -> Result<Option<Dlist>, EngineError> {
  let mut pushes = Dlist::new_list(None);
  loop {
    let (word, terminator) = stream.getword()?;
    let word = dlist::string_from_bytes(word)?;
    match word.as_str() {
      "*" => {
        if terminator != Some(b' ') {
          return Err(EngineError::Protocol(format!("malformed untagged push, word={word:?}")));
        }
        let item = dlist::parse(stream, staging_root)?;
        pushes.push_child(item);
        expect_crlf_after_value(stream)?;
      }
      "OK" => {
        drain_rest_of_line(stream)?;
        return Ok(if pushes.children().is_empty() { None } else { Some(pushes) });
      }
      "NO" => {
        let rest = stream.getline()?;
        let errmsg = dlist::string_from_bytes(rest)?;
        let errmsg = errmsg.trim_start();
        return Err(EngineError::from_response(errmsg));
      }
      other => {
        let rest = stream.getline().unwrap_or_default();
        return Err(EngineError::Protocol(format!("unexpected response word {other:?}, line={rest:?}")));
      }
    }
  }
}

fn expect_crlf_after_value<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  let rest = stream.getline()?;
  if !rest.iter().all(|&b| b == b' ') {
    return Err(EngineError::Protocol(format!("trailing bytes after pushed value: {rest:?}")));
  }
  Ok(())
}

fn drain_rest_of_line<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  stream.getline()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn harness(input: &[u8]) -> (Stream<Cursor<Vec<u8>>>, tempfile::TempDir) {
    (Stream::new(Cursor::new(input.to_vec())), tempfile::tempdir().unwrap())
  }

  #[test]
  fn scenario_s5_protocol_framing() {
    let input = b"* %(MBOXNAME {5+}\r\nINBOX LAST_UID 7 ) \r\nOK\r\n";
    let (mut stream, dir) = harness(input);
    let parsed = parse_response(&mut stream, dir.path()).unwrap().unwrap();
    let kvlist = &parsed.children()[0];
    assert_eq!(kvlist.get_atom("MBOXNAME"), Some("INBOX"));
    assert_eq!(kvlist.get_num32("LAST_UID"), Some(7));
  }

  #[test]
  fn scenario_s3_sync_checksum_error() {
    let input = b"NO IMAP_SYNC_CHECKSUM mailbox=INBOX\r\n";
    let (mut stream, dir) = harness(input);
    let err = parse_response(&mut stream, dir.path()).unwrap_err();
    assert!(matches!(err, EngineError::SyncChecksum(m) if m == "mailbox=INBOX"));
  }

  #[test]
  fn bare_ok_with_no_pushes_returns_none() {
    let input = b"OK\r\n";
    let (mut stream, dir) = harness(input);
    assert!(parse_response(&mut stream, dir.path()).unwrap().is_none());
  }

  #[test]
  fn unexpected_word_is_protocol_error() {
    let input = b"MAYBE\r\n";
    let (mut stream, dir) = harness(input);
    let err = parse_response(&mut stream, dir.path()).unwrap_err();
    assert!(matches!(err, EngineError::Protocol(_)));
  }

  #[test]
  fn send_apply_writes_verb_body_and_flushes() {
    let (mut stream, _dir) = harness(b"");
    let mut body = Dlist::new_kvlist(None);
    body.set_atom("MBOXNAME", "INBOX");
    send_apply(&mut stream, &body).unwrap();
  }

  #[test]
  fn read_command_collects_pushes_ahead_of_the_verb() {
    let payload = b"body";
    let guid = crate::guid::MessageGuid::from_bytes(payload);
    let mut input =
      format!("* MESSAGE %{{default {} {}}}\r\n{{{}+}}\r\n", guid.encode(), payload.len(), payload.len()).into_bytes();
    input.extend_from_slice(payload);
    input.extend_from_slice(b"\r\nAPPLY %(MBOXNAME INBOX)\r\n");
    let dir = tempfile::tempdir().unwrap();
    let mut stream = Stream::new(Cursor::new(input));
    let (verb, body, pushes) = read_command(&mut stream, dir.path()).unwrap();
    assert_eq!(verb, "APPLY");
    assert_eq!(body.get_atom("MBOXNAME"), Some("INBOX"));
    assert_eq!(pushes.len(), 1);
  }

  #[test]
  fn send_no_renders_the_wire_token() {
    let (mut stream, _dir) = harness(b"");
    send_no(&mut stream, &EngineError::MailboxNonexistent("INBOX.Foo".to_string())).unwrap();
  }
}
