//! Buffered, line-oriented byte stream with literal-length payload mode
//! (design §4.A). Writers emit CRLF; readers accept bare LF and treat CR as
//! optional, matching the wire protocol's newline convention.

use std::io::{self, Read, Write};

/// Overflowing `getline`/`getword` past this many bytes without finding a
/// terminator is fatal: the caller aborts the connection (design §4.A, §7).
pub const DEFAULT_MAX_WORD: usize = 1 << 20;

pub struct Stream<RW> {
  io: RW,
  buffer: Vec<u8>,
  start: usize,
  end: usize,
  pushback: Option<u8>,
  pub max_word: usize,
}

impl<RW: Read + Write> Stream<RW> {
  pub fn new(io: RW) -> Self {
    Stream {
      io,
      buffer: vec![0u8; 16 * 1024],
      start: 0,
      end: 0,
      pushback: None,
      max_word: DEFAULT_MAX_WORD,
    }
  }

  fn fill(&mut self) -> io::Result<bool> {
    if self.start < self.end {
      return Ok(true);
    }
    self.start = 0;
    self.end = self.io.read(&mut self.buffer)?;
    Ok(self.end > 0)
  }

  /// Read one byte, or `None` on clean EOF.
  pub fn getc(&mut self) -> io::Result<Option<u8>> {
    if let Some(c) = self.pushback.take() {
      return Ok(Some(c));
    }
    if !self.fill()? {
      return Ok(None);
    }
    let c = self.buffer[self.start];
    self.start += 1;
    Ok(Some(c))
  }

  /// Push exactly one byte back onto the stream. Only one byte of pushback
  /// is ever required by the grammar in design §4.B.
  pub fn ungetc(&mut self, c: u8) {
    debug_assert!(self.pushback.is_none(), "ungetc does not support more than one byte of pushback");
    self.pushback = Some(c);
  }

  fn overflow(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{what} exceeded max_word"))
  }

  /// Read a word up to (and consuming) a space, CR, LF, or EOF. Returns the
  /// word together with the byte that ended it (`None` on EOF), matching
  /// `getword`'s C counterpart which hands the terminating character back
  /// to the caller for inspection.
  pub fn getword(&mut self) -> io::Result<(Vec<u8>, Option<u8>)> {
    let mut word = Vec::new();
    loop {
      match self.getc()? {
        None => return Ok((word, None)),
        Some(b' ') => return Ok((word, Some(b' '))),
        Some(c @ b'\r') | Some(c @ b'\n') => return Ok((word, Some(c))),
        Some(c) => {
          word.push(c);
          if word.len() > self.max_word {
            return Err(Self::overflow("getword"));
          }
        }
      }
    }
  }

  /// Read one line, terminated by CR, LF, or EOF. A CR is followed by an
  /// optional LF which is consumed as part of the same line terminator.
  pub fn getline(&mut self) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
      match self.getc()? {
        None => return Ok(line),
        Some(b'\r') => {
          match self.getc()? {
            Some(b'\n') => {}
            Some(c) => self.ungetc(c),
            None => {}
          }
          return Ok(line);
        }
        Some(b'\n') => return Ok(line),
        Some(c) => {
          line.push(c);
          if line.len() > self.max_word {
            return Err(Self::overflow("getline"));
          }
        }
      }
    }
  }

  /// Read exactly `n` bytes as an in-memory literal (used for small Map
  /// values and text literals). Large File payloads use
  /// [`Stream::copy_literal`] instead so they never sit fully in memory.
  pub fn readliteral(&mut self, n: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(n.min(1 << 20) as usize);
    let mut remaining = n;
    while remaining > 0 {
      match self.getc()? {
        None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short literal")),
        Some(c) => {
          out.push(c);
          remaining -= 1;
        }
      }
    }
    Ok(out)
  }

  /// Stream exactly `n` bytes straight into `sink`, never buffering the
  /// whole literal in memory. This is how a File sentinel's payload is
  /// written to a content-addressed staging path (design §4.B, §4.D).
  pub fn copy_literal(&mut self, n: u64, sink: &mut impl Write) -> io::Result<()> {
    let mut remaining = n;
    while remaining > 0 {
      if !self.fill()? {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short literal"));
      }
      let available = (self.end - self.start) as u64;
      let take = available.min(remaining) as usize;
      sink.write_all(&self.buffer[self.start..self.start + take])?;
      self.start += take;
      remaining -= take as u64;
    }
    Ok(())
  }

  pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
    self.io.write_all(bytes)
  }

  pub fn write_fmt(&mut self, args: std::fmt::Arguments<'_>) -> io::Result<()> {
    io::Write::write_fmt(&mut self.io, args)
  }

  pub fn flush(&mut self) -> io::Result<()> {
    self.io.flush()
  }
}

/// Lets a `Stream` be handed directly to anything generic over `io::Write`
/// (the dlist encoder, `io::copy`), without every caller needing to reach
/// for the inherent `write_all`/`flush` pair by name.
impl<RW: Read + Write> Write for Stream<RW> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.io.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.io.flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn stream(input: &[u8]) -> Stream<Cursor<Vec<u8>>> {
    Stream::new(Cursor::new(input.to_vec()))
  }

  #[test]
  fn getword_stops_on_space_and_returns_terminator() {
    let mut s = stream(b"FOO BAR\r\n");
    let (w, term) = s.getword().unwrap();
    assert_eq!(w, b"FOO");
    assert_eq!(term, Some(b' '));
  }

  #[test]
  fn getline_eats_bare_lf() {
    let mut s = stream(b"one\ntwo\r\n");
    assert_eq!(s.getline().unwrap(), b"one");
    assert_eq!(s.getline().unwrap(), b"two");
  }

  #[test]
  fn getline_cr_without_lf_does_not_eat_next_char() {
    let mut s = stream(b"abc\rX");
    assert_eq!(s.getline().unwrap(), b"abc");
    assert_eq!(s.getc().unwrap(), Some(b'X'));
  }

  #[test]
  fn ungetc_replays_one_byte() {
    let mut s = stream(b"AB");
    let c = s.getc().unwrap().unwrap();
    s.ungetc(c);
    assert_eq!(s.getc().unwrap(), Some(c));
    assert_eq!(s.getc().unwrap(), Some(b'B'));
  }

  #[test]
  fn readliteral_reads_exact_byte_count() {
    let mut s = stream(b"hello world");
    assert_eq!(s.readliteral(5).unwrap(), b"hello");
    assert_eq!(s.getc().unwrap(), Some(b' '));
  }

  #[test]
  fn copy_literal_streams_into_sink() {
    let mut s = stream(b"0123456789");
    let mut sink = Vec::new();
    s.copy_literal(4, &mut sink).unwrap();
    assert_eq!(sink, b"0123");
  }

  #[test]
  fn getword_overflow_is_fatal() {
    let mut s = stream(&vec![b'a'; 64]);
    s.max_word = 8;
    assert!(s.getword().is_err());
  }
}
