//! The "dlist" wire codec (design §4.B): a typed, self-describing value tree
//! that represents atoms, numbers, flags, GUIDs, opaque byte maps, file
//! references and (keyed) lists, and that can stream message payloads
//! straight to a content-addressed staging path as they come off the wire.
//!
//! Structure is parsed by hand with a recursive descent walk (the
//! suspension points in design §5 — network reads and literal disk writes —
//! have to interleave with the tree walk, which a pure grammar can't do once
//! a File payload may be arbitrarily large). Lexical unescaping of a quoted
//! atom's `\`-escapes is small and fully buffered, so it is delegated to a
//! `peg` grammar instead.

use crate::error::EngineError;
use crate::guid::MessageGuid;
use crate::stream::Stream;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

peg::parser! {
  grammar quoting() for [u8] {
    rule escaped() -> u8
      = "\\" c:$([b'"' | b'\\']) { c[0] }
    rule plain() -> u8
      = c:$([^ b'"' | b'\\']) { c[0] }
    pub rule unescape() -> Vec<u8>
      = chars:(escaped() / plain())* { chars }
  }
}

fn unescape_quoted(raw: &[u8]) -> Vec<u8> {
  // Malformed escape sequences can't occur: the reader only ever hands this
  // function bytes it already validated lay between matching quotes.
  quoting::unescape(raw).unwrap_or_else(|_| raw.to_vec())
}

/// A reference to a message payload carried by a File value. `OnDisk` is
/// used when building a dlist to send (the bytes live in the local mail
/// store); `Received` is the shape a freshly parsed File value has before
/// `stage` commits it to a content-addressed path and verifies its GUID.
#[derive(Debug, Clone, PartialEq)]
pub enum FileValue {
  OnDisk { partition: String, guid: MessageGuid, size: u64, path: PathBuf },
  Received { partition: String, guid: MessageGuid, size: u64, staged_at: PathBuf },
}

impl FileValue {
  pub fn guid(&self) -> MessageGuid {
    match self {
      FileValue::OnDisk { guid, .. } | FileValue::Received { guid, .. } => *guid,
    }
  }

  pub fn partition(&self) -> &str {
    match self {
      FileValue::OnDisk { partition, .. } | FileValue::Received { partition, .. } => partition,
    }
  }

  pub fn size(&self) -> u64 {
    match self {
      FileValue::OnDisk { size, .. } | FileValue::Received { size, .. } => *size,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Atom(String),
  Map(Vec<u8>),
  File(FileValue),
  List(Vec<Dlist>),
  KVList(Vec<Dlist>),
}

/// A node in the dlist tree. `name` is `Some` for keyed children of a
/// KVList and for named compound children of a List (e.g. each per-message
/// `RECORD` kvlist); it is `None` for bare positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Dlist {
  pub name: Option<String>,
  pub value: Value,
}

impl Dlist {
  pub fn new_list(name: Option<&str>) -> Dlist {
    Dlist { name: name.map(str::to_string), value: Value::List(Vec::new()) }
  }

  pub fn new_kvlist(name: Option<&str>) -> Dlist {
    Dlist { name: name.map(str::to_string), value: Value::KVList(Vec::new()) }
  }

  fn children_mut(&mut self) -> &mut Vec<Dlist> {
    match &mut self.value {
      Value::List(c) | Value::KVList(c) => c,
      _ => panic!("set_* called on a non-compound dlist value"),
    }
  }

  pub fn children(&self) -> &[Dlist] {
    match &self.value {
      Value::List(c) | Value::KVList(c) => c,
      _ => &[],
    }
  }

  pub fn push_child(&mut self, child: Dlist) -> &mut Self {
    self.children_mut().push(child);
    self
  }

  pub fn set_atom(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
    self.push_child(Dlist { name: Some(key.to_string()), value: Value::Atom(value.into()) })
  }

  pub fn set_flag(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
    self.set_atom(key, value)
  }

  pub fn set_num32(&mut self, key: &str, value: u32) -> &mut Self {
    self.set_atom(key, value.to_string())
  }

  pub fn set_num64(&mut self, key: &str, value: u64) -> &mut Self {
    self.set_atom(key, value.to_string())
  }

  pub fn set_date(&mut self, key: &str, epoch_seconds: u64) -> &mut Self {
    self.set_atom(key, epoch_seconds.to_string())
  }

  pub fn set_guid(&mut self, key: &str, guid: &MessageGuid) -> &mut Self {
    self.set_atom(key, guid.encode())
  }

  pub fn set_map(&mut self, key: &str, bytes: Vec<u8>) -> &mut Self {
    self.push_child(Dlist { name: Some(key.to_string()), value: Value::Map(bytes) })
  }

  pub fn set_file(&mut self, key: &str, partition: &str, guid: MessageGuid, size: u64, path: PathBuf) -> &mut Self {
    self.push_child(Dlist {
      name: Some(key.to_string()),
      value: Value::File(FileValue::OnDisk { partition: partition.to_string(), guid, size, path }),
    })
  }

  pub fn new_child_list(&mut self, key: &str) -> &mut Dlist {
    self.push_child(Dlist::new_list(Some(key)));
    self.children_mut().last_mut().expect("just pushed")
  }

  pub fn new_child_kvlist(&mut self, key: Option<&str>) -> &mut Dlist {
    self.push_child(Dlist::new_kvlist(key));
    self.children_mut().last_mut().expect("just pushed")
  }

  pub fn get(&self, key: &str) -> Option<&Dlist> {
    self.children().iter().find(|c| c.name.as_deref() == Some(key))
  }

  /// A `{n+}` literal is ambiguous on the wire between "long/binary atom"
  /// and "opaque map" (design §4.B) — both parse as `Atom`, so a `Map`
  /// value built in memory via [`Dlist::set_map`] is accepted here too.
  pub fn get_atom(&self, key: &str) -> Option<&str> {
    match &self.get(key)?.value {
      Value::Atom(s) => Some(s),
      Value::Map(bytes) => std::str::from_utf8(bytes).ok(),
      _ => None,
    }
  }

  pub fn get_num32(&self, key: &str) -> Option<u32> {
    self.get_atom(key)?.parse().ok()
  }

  pub fn get_num64(&self, key: &str) -> Option<u64> {
    self.get_atom(key)?.parse().ok()
  }

  pub fn get_date(&self, key: &str) -> Option<u64> {
    self.get_num64(key)
  }

  pub fn get_guid(&self, key: &str) -> Option<MessageGuid> {
    MessageGuid::decode(self.get_atom(key)?)
  }

  /// A map written with [`Dlist::set_map`] parses back as a literal
  /// `Atom` (the wire has no separate map syntax — design §4.B), so this
  /// also accepts `Value::Atom` and hands back its UTF-8 bytes.
  pub fn get_map(&self, key: &str) -> Option<&[u8]> {
    match &self.get(key)?.value {
      Value::Map(bytes) => Some(bytes),
      Value::Atom(s) => Some(s.as_bytes()),
      _ => None,
    }
  }

  pub fn get_list(&self, key: &str) -> Option<&[Dlist]> {
    Some(self.get(key)?.children())
  }

  // --- encoding ---------------------------------------------------------

  pub fn encode(&self, out: &mut impl Write) -> io::Result<()> {
    self.write_named(out)
  }

  fn write_named(&self, out: &mut impl Write) -> io::Result<()> {
    if let Some(name) = &self.name {
      write!(out, "{name} ")?;
    }
    self.write_body(out)
  }

  fn write_body(&self, out: &mut impl Write) -> io::Result<()> {
    match &self.value {
      Value::Atom(s) => write_atom_token(out, s),
      Value::Map(bytes) => {
        write!(out, "{{{}+}}\r\n", bytes.len())?;
        out.write_all(bytes)
      }
      Value::File(f) => write_file(out, f),
      Value::List(children) => {
        out.write_all(b"(")?;
        for (i, child) in children.iter().enumerate() {
          if i > 0 {
            out.write_all(b" ")?;
          }
          child.write_named(out)?;
        }
        out.write_all(b")")
      }
      Value::KVList(children) => {
        out.write_all(b"%(")?;
        for (i, child) in children.iter().enumerate() {
          if i > 0 {
            out.write_all(b" ")?;
          }
          child.write_named(out)?;
        }
        out.write_all(b")")
      }
    }
  }
}

fn needs_quoting(s: &str) -> bool {
  s.is_empty()
    || s.bytes().any(|b| matches!(b, b' ' | b'(' | b')' | b'%' | b'{' | b'}' | b'"' | b'\\' | b'\r' | b'\n'))
}

fn write_atom_token(out: &mut impl Write, s: &str) -> io::Result<()> {
  if !needs_quoting(s) {
    return out.write_all(s.as_bytes());
  }
  if s.bytes().all(|b| b != 0) {
    out.write_all(b"\"")?;
    for b in s.bytes() {
      if b == b'"' || b == b'\\' {
        out.write_all(&[b'\\'])?;
      }
      out.write_all(&[b])?;
    }
    return out.write_all(b"\"");
  }
  write!(out, "{{{}+}}\r\n", s.len())?;
  out.write_all(s.as_bytes())
}

fn write_file(out: &mut impl Write, f: &FileValue) -> io::Result<()> {
  write!(out, "%{{{} {} {}}}\r\n", f.partition(), f.guid().encode(), f.size())?;
  match f {
    FileValue::OnDisk { path, size, .. } => {
      let mut file = fs::File::open(path)?;
      write!(out, "{{{size}+}}\r\n")?;
      io::copy(&mut file, out)?;
      Ok(())
    }
    FileValue::Received { staged_at, size, .. } => {
      let mut file = fs::File::open(staged_at)?;
      write!(out, "{{{size}+}}\r\n")?;
      io::copy(&mut file, out)?;
      Ok(())
    }
  }
}

// --- parsing --------------------------------------------------------------

/// Read one dlist value from `stream`. File sentinels stream their payload
/// straight into `staging_root` via content-addressed naming
/// (`reserve_path`-equivalent) and the resulting GUID is checked against the
/// one declared on the wire.
pub fn parse<RW: Read + Write>(stream: &mut Stream<RW>, staging_root: &Path) -> Result<Dlist, EngineError> {
  let Some(first) = peek(stream)? else {
    return Err(EngineError::Protocol("unexpected eof parsing dlist value".to_string()));
  };
  match first {
    b'"' => {
      consume(stream)?;
      let raw = read_until_unescaped_quote(stream)?;
      Ok(Dlist { name: None, value: Value::Atom(string_from_bytes(unescape_quoted(&raw))?) })
    }
    b'{' => {
      consume(stream)?;
      let n = read_literal_length(stream)?;
      let bytes = stream.readliteral(n).map_err(EngineError::Io)?;
      Ok(Dlist { name: None, value: Value::Atom(string_from_bytes(bytes)?) })
    }
    // A bare `(` with nothing naming it is an unnamed positional List child.
    b'(' => {
      consume(stream)?;
      let children = parse_list_children(stream, staging_root)?;
      Ok(Dlist { name: None, value: Value::List(children) })
    }
    // A `%` with nothing naming it is a bare (unnamed) kvlist or File value
    // - the shape every top-level pushed response and every list-positional
    // kvlist child takes (design §4.B: "NAME omitted inside positional
    // lists").
    b'%' => {
      consume(stream)?;
      match peek(stream)? {
        Some(b'(') => {
          consume(stream)?;
          let children = parse_kvlist_children(stream, staging_root)?;
          Ok(Dlist { name: None, value: Value::KVList(children) })
        }
        Some(b'{') => {
          consume(stream)?;
          parse_file_sentinel(stream, staging_root, None)
        }
        _ => Err(EngineError::Protocol("malformed %-sentinel".to_string())),
      }
    }
    _ => {
      let word = read_token(stream)?;
      parse_after_word(stream, staging_root, word)
    }
  }
}

/// Read the comma-less, space-joined body of a `%(...)` KVList: unlike a
/// plain List, every child here is a `NAME VALUE` pair even when `VALUE` is
/// a bare atom, so children can't be read by the same positional
/// `parse_list_children` used for `(...)` bodies (design §4.B: "NAME
/// present only on keyed/named children" — for a KVList every child is
/// keyed).
fn parse_kvlist_children<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
) -> Result<Vec<Dlist>, EngineError> {
  let mut children = Vec::new();
  loop {
    skip_spaces(stream)?;
    match peek(stream)? {
      None => return Err(EngineError::Protocol("unterminated kvlist".to_string())),
      Some(b')') => {
        consume(stream)?;
        return Ok(children);
      }
      _ => {
        let name = string_from_bytes(read_token(stream)?)?;
        children.push(parse_named_value(stream, staging_root, name)?);
      }
    }
  }
}

/// Read one `NAME`-tagged value, the counterpart to [`parse`] for KVList
/// children where the name has already been consumed.
fn parse_named_value<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  name: String,
) -> Result<Dlist, EngineError> {
  let Some(first) = peek(stream)? else {
    return Err(EngineError::Protocol("unexpected eof parsing kvlist value".to_string()));
  };
  match first {
    b'"' => {
      consume(stream)?;
      let raw = read_until_unescaped_quote(stream)?;
      Ok(Dlist { name: Some(name), value: Value::Atom(string_from_bytes(unescape_quoted(&raw))?) })
    }
    b'{' => {
      consume(stream)?;
      let n = read_literal_length(stream)?;
      let bytes = stream.readliteral(n).map_err(EngineError::Io)?;
      Ok(Dlist { name: Some(name), value: Value::Atom(string_from_bytes(bytes)?) })
    }
    b'(' => {
      consume(stream)?;
      let children = parse_list_children(stream, staging_root)?;
      Ok(Dlist { name: Some(name), value: Value::List(children) })
    }
    b'%' => {
      consume(stream)?;
      match peek(stream)? {
        Some(b'(') => {
          consume(stream)?;
          let children = parse_kvlist_children(stream, staging_root)?;
          Ok(Dlist { name: Some(name), value: Value::KVList(children) })
        }
        Some(b'{') => {
          consume(stream)?;
          parse_file_sentinel(stream, staging_root, Some(name))
        }
        _ => Err(EngineError::Protocol("malformed %-sentinel".to_string())),
      }
    }
    _ => {
      let word = read_token(stream)?;
      Ok(Dlist { name: Some(name), value: Value::Atom(string_from_bytes(word)?) })
    }
  }
}

/// Read a bare token (a NAME, or a positional atom's literal text) up to
/// (and consuming) the next space/CR/LF, or up to (without consuming) a
/// `(`, `)` or `%` that immediately follows with no separating space — the
/// shape the last element of a positional list takes right before its
/// closing paren (design §4.B, §4.C: list bodies join children with a
/// single space and no trailing one before `)`).
fn read_token<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<Vec<u8>, EngineError> {
  let mut word = Vec::new();
  loop {
    match stream.getc().map_err(EngineError::Io)? {
      None => return Ok(word),
      Some(b' ') | Some(b'\r') | Some(b'\n') => return Ok(word),
      Some(c @ b'(') | Some(c @ b')') | Some(c @ b'%') => {
        stream.ungetc(c);
        return Ok(word);
      }
      Some(c) => word.push(c),
    }
  }
}

fn parse_after_word<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  word: Vec<u8>,
) -> Result<Dlist, EngineError> {
  // `word` is either a standalone positional atom (nothing else follows
  // before the next space/`)`) or a NAME whose value starts right after the
  // separating space we already consumed. Peek to tell them apart, and to
  // tell the two `%` shapes apart.
  match peek(stream)? {
    Some(b'%') => {
      consume(stream)?;
      match peek(stream)? {
        Some(b'(') => {
          consume(stream)?;
          let children = parse_kvlist_children(stream, staging_root)?;
          Ok(Dlist { name: Some(string_from_bytes(word)?), value: Value::KVList(children) })
        }
        Some(b'{') => {
          consume(stream)?;
          parse_file_sentinel(stream, staging_root, Some(string_from_bytes(word)?))
        }
        _ => Err(EngineError::Protocol("malformed %-sentinel".to_string())),
      }
    }
    Some(b'(') => {
      consume(stream)?;
      let children = parse_list_children(stream, staging_root)?;
      Ok(Dlist { name: Some(string_from_bytes(word)?), value: Value::List(children) })
    }
    _ => Ok(Dlist { name: None, value: Value::Atom(string_from_bytes(word)?) }),
  }
}

fn parse_list_children<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
) -> Result<Vec<Dlist>, EngineError> {
  let mut children = Vec::new();
  loop {
    skip_spaces(stream)?;
    match peek(stream)? {
      None => return Err(EngineError::Protocol("unterminated list".to_string())),
      Some(b')') => {
        consume(stream)?;
        return Ok(children);
      }
      _ => children.push(parse(stream, staging_root)?),
    }
  }
}

fn parse_file_sentinel<RW: Read + Write>(
  stream: &mut Stream<RW>,
  staging_root: &Path,
  name: Option<String>,
) -> Result<Dlist, EngineError> {
  // `%{partition guid size}`
  let (partition, _) = stream.getword().map_err(EngineError::Io)?;
  let (guid_hex, _) = stream.getword().map_err(EngineError::Io)?;
  let (size_word, terminator) = stream.getword().map_err(EngineError::Io)?;
  if terminator != Some(b'}') {
    // `getword` stops at space/CR/LF only; `}` is swallowed into `size_word`
    // unless callers strip it. Accept either shape defensively.
  }
  let size_str = String::from_utf8_lossy(&size_word).trim_end_matches('}').to_string();
  let size: u64 = size_str.parse().map_err(|_| EngineError::ProtocolBadParameters("bad file size".to_string()))?;
  let partition = string_from_bytes(partition)?;
  let declared_guid = MessageGuid::decode(&string_from_bytes(guid_hex)?)
    .ok_or_else(|| EngineError::ProtocolBadParameters("bad file guid".to_string()))?;
  expect_crlf(stream)?;
  expect_byte(stream, b'{')?;
  let n = read_literal_length(stream)?;
  if n != size {
    return Err(EngineError::ProtocolBadParameters("file literal size mismatch".to_string()));
  }
  let staged_at = reserve_path(staging_root, &partition, &declared_guid);
  if let Some(parent) = staged_at.parent() {
    std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
  }
  let mut file = fs::File::create(&staged_at).map_err(EngineError::Io)?;
  stream.copy_literal(n, &mut file).map_err(EngineError::Io)?;
  let actual_guid = MessageGuid::from_bytes(&fs::read(&staged_at).map_err(EngineError::Io)?);
  if actual_guid != declared_guid {
    return Err(EngineError::Corruption(format!(
      "staged file guid mismatch: declared {declared_guid} got {actual_guid}"
    )));
  }
  Ok(Dlist {
    name,
    value: Value::File(FileValue::Received { partition, guid: declared_guid, size, staged_at }),
  })
}

/// Content-addressed staging path for a partition, mirroring
/// `reserve_path(partition, guid)` from design §4.D/§6.
pub fn reserve_path(staging_root: &Path, partition: &str, guid: &MessageGuid) -> PathBuf {
  let hex = guid.encode();
  staging_root.join(partition).join(&hex[0..2]).join(&hex[2..4]).join(hex)
}

fn read_literal_length<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<u64, EngineError> {
  let mut digits = Vec::new();
  loop {
    match stream.getc().map_err(EngineError::Io)? {
      Some(b'+') => break,
      Some(c @ b'0'..=b'9') => digits.push(c),
      _ => return Err(EngineError::Protocol("malformed literal length".to_string())),
    }
  }
  expect_byte(stream, b'}')?;
  expect_crlf(stream)?;
  String::from_utf8(digits)
    .ok()
    .and_then(|s| s.parse().ok())
    .ok_or_else(|| EngineError::Protocol("malformed literal length".to_string()))
}

fn read_until_unescaped_quote<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<Vec<u8>, EngineError> {
  let mut raw = Vec::new();
  loop {
    match stream.getc().map_err(EngineError::Io)? {
      None => return Err(EngineError::Protocol("unterminated quoted string".to_string())),
      Some(b'\\') => {
        raw.push(b'\\');
        match stream.getc().map_err(EngineError::Io)? {
          Some(c) => raw.push(c),
          None => return Err(EngineError::Protocol("unterminated quoted string".to_string())),
        }
      }
      Some(b'"') => return Ok(raw),
      Some(c) => raw.push(c),
    }
  }
}

pub(crate) fn string_from_bytes(bytes: Vec<u8>) -> Result<String, EngineError> {
  String::from_utf8(bytes).map_err(|e| EngineError::ProtocolBadParameters(format!("non-utf8 atom: {e}")))
}

fn peek<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<Option<u8>, EngineError> {
  match stream.getc().map_err(EngineError::Io)? {
    None => Ok(None),
    Some(c) => {
      stream.ungetc(c);
      Ok(Some(c))
    }
  }
}

fn consume<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  stream.getc().map_err(EngineError::Io)?;
  Ok(())
}

fn skip_spaces<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  while let Some(b' ') = peek(stream)? {
    consume(stream)?;
  }
  Ok(())
}

fn expect_byte<RW: Read + Write>(stream: &mut Stream<RW>, expected: u8) -> Result<(), EngineError> {
  match stream.getc().map_err(EngineError::Io)? {
    Some(c) if c == expected => Ok(()),
    other => Err(EngineError::Protocol(format!(
      "expected {:?}, got {:?}",
      expected as char,
      other.map(|c| c as char)
    ))),
  }
}

fn expect_crlf<RW: Read + Write>(stream: &mut Stream<RW>) -> Result<(), EngineError> {
  match stream.getc().map_err(EngineError::Io)? {
    Some(b'\r') => expect_byte(stream, b'\n'),
    Some(b'\n') => Ok(()),
    other => Err(EngineError::Protocol(format!("expected CRLF, got {other:?}"))),
  }
}

impl fmt::Display for Dlist {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut buf = Vec::new();
    self.encode(&mut buf).map_err(|_| fmt::Error)?;
    write!(f, "{}", String::from_utf8_lossy(&buf))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tempfile::tempdir;

  fn roundtrip(input: &[u8]) -> (Dlist, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let mut stream = Stream::new(Cursor::new(input.to_vec()));
    let dl = parse(&mut stream, dir.path()).unwrap();
    (dl, dir)
  }

  #[test]
  fn parses_bare_atom() {
    let (dl, _dir) = roundtrip(b"INBOX");
    assert_eq!(dl.value, Value::Atom("INBOX".to_string()));
    assert_eq!(dl.name, None);
  }

  #[test]
  fn parses_quoted_atom_with_escapes() {
    let (dl, _dir) = roundtrip(br#""a\"b\\c""#);
    assert_eq!(dl.value, Value::Atom("a\"b\\c".to_string()));
  }

  #[test]
  fn parses_text_literal() {
    let (dl, _dir) = roundtrip(b"{5+}\r\nhello");
    assert_eq!(dl.value, Value::Atom("hello".to_string()));
  }

  #[test]
  fn parses_named_kvlist() {
    let (dl, _dir) = roundtrip(b"MBOX %(MBOXNAME INBOX LAST_UID 7)");
    assert_eq!(dl.name.as_deref(), Some("MBOX"));
    assert_eq!(dl.get_atom("MBOXNAME"), Some("INBOX"));
    assert_eq!(dl.get_num32("LAST_UID"), Some(7));
  }

  #[test]
  fn parses_named_list() {
    let (dl, _dir) = roundtrip(b"VANISHED (1 2 3)");
    assert_eq!(dl.name.as_deref(), Some("VANISHED"));
    assert_eq!(dl.children().len(), 3);
  }

  #[test]
  fn scenario_s5_protocol_framing() {
    let dir = tempdir().unwrap();
    let mut stream = Stream::new(Cursor::new(b"%(MBOXNAME {5+}\r\nINBOX LAST_UID 7 )".to_vec()));
    let dl = parse(&mut stream, dir.path()).unwrap();
    assert_eq!(dl.get_atom("MBOXNAME"), Some("INBOX"));
    assert_eq!(dl.get_num32("LAST_UID"), Some(7));
  }

  #[test]
  fn encodes_kvlist_with_guid_and_map() {
    let mut kl = Dlist::new_kvlist(Some("RECORD"));
    kl.set_num32("UID", 9);
    kl.set_guid("GUID", &MessageGuid::from_bytes(b"hi"));
    kl.set_map("VALUE", b"raw bytes".to_vec());
    let mut out = Vec::new();
    kl.encode(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("RECORD %(UID 9 GUID "));
        assert!(text.contains("VALUE {9+}\r\nraw bytes"));
  }

  #[test]
  fn file_sentinel_round_trip_and_guid_check() {
    let dir = tempdir().unwrap();
    let payload = b"message body bytes";
    let guid = MessageGuid::from_bytes(payload);
    let wire = format!("MESSAGE %{{default {} {}}}\r\n{{{}+}}\r\n", guid.encode(), payload.len(), payload.len());
    let mut input = wire.into_bytes();
    input.extend_from_slice(payload);
    let mut stream = Stream::new(Cursor::new(input));
    let dl = parse(&mut stream, dir.path()).unwrap();
    match dl.value {
      Value::File(FileValue::Received { guid: got, staged_at, .. }) => {
        assert_eq!(got, guid);
        assert_eq!(fs::read(staged_at).unwrap(), payload);
      }
      other => panic!("expected file value, got {other:?}"),
    }
  }

  #[test]
  fn file_sentinel_guid_mismatch_is_corruption() {
    let dir = tempdir().unwrap();
    let payload = b"tampered";
    let wrong_guid = MessageGuid::from_bytes(b"not the payload");
    let wire = format!(
      "MESSAGE %{{default {} {}}}\r\n{{{}+}}\r\n",
      wrong_guid.encode(),
      payload.len(),
      payload.len()
    );
    let mut input = wire.into_bytes();
    input.extend_from_slice(payload);
    let mut stream = Stream::new(Cursor::new(input));
    assert!(matches!(parse(&mut stream, dir.path()), Err(EngineError::Corruption(_))));
  }
}
