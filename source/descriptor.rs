//! Protocol descriptor table (design §4.I): one static record per wire
//! protocol the transport layer can negotiate over, including the two
//! protocols (IMAP, NNTP) whose capability line needs a custom parser
//! instead of verbatim string matching.

/// Parses a raw capability/greeting line into whatever shape that
/// protocol's negotiation step needs. Function-valued rather than an enum
/// dispatch, per design §9 ("polymorphic over a two-method capability").
pub type MechlistParser = fn(&str) -> Option<String>;
pub type SuccessParser = fn(&str) -> bool;

#[derive(Debug, Clone, Copy)]
pub struct ProtocolDescriptor {
  pub name: &'static str,
  pub capability_probe: Option<&'static str>,
  pub terminator: &'static str,
  pub starttls_cmd: Option<&'static str>,
  pub sasl_prefix: Option<&'static str>,
  pub mechlist_parser: Option<MechlistParser>,
  pub logout_cmd: &'static str,
  pub logout_success: Option<&'static str>,
  pub success_parser: Option<SuccessParser>,
}

/// Scans a raw `CAPABILITY`-style line for every `AUTH=<mechanism>` token
/// and joins them with a single space, in order of appearance (design §4.I,
/// scenario S8).
fn imap_mechlist(line: &str) -> Option<String> {
  const PREFIX: &str = "AUTH=";
  let mechanisms: Vec<&str> = line
    .split_whitespace()
    .filter_map(|token| token.strip_prefix(PREFIX))
    .collect();
  if mechanisms.is_empty() {
    None
  } else {
    Some(mechanisms.join(" "))
  }
}

/// NNTP signals successful STARTTLS/AUTH with a `282 ` status line
/// (design §4.I, scenario S8).
fn nntp_success(line: &str) -> bool {
  line.starts_with("282 ")
}

pub const PROTOCOLS: [ProtocolDescriptor; 5] = [
  ProtocolDescriptor {
    name: "imap",
    capability_probe: Some("C01 CAPABILITY"),
    terminator: "C01 ",
    starttls_cmd: Some("STARTTLS"),
    sasl_prefix: Some("AUTH="),
    mechlist_parser: Some(imap_mechlist),
    logout_cmd: "Q01 LOGOUT",
    logout_success: Some("Q01 "),
    success_parser: None,
  },
  ProtocolDescriptor {
    name: "pop3",
    capability_probe: Some("CAPA"),
    terminator: ".",
    starttls_cmd: Some("STLS"),
    sasl_prefix: Some("SASL "),
    mechlist_parser: None,
    logout_cmd: "QUIT",
    logout_success: None,
    success_parser: None,
  },
  ProtocolDescriptor {
    name: "nntp",
    capability_probe: Some("LIST EXTENSIONS"),
    terminator: ".",
    starttls_cmd: Some("STARTTLS"),
    sasl_prefix: Some("SASL "),
    mechlist_parser: None,
    logout_cmd: "QUIT",
    logout_success: None,
    success_parser: Some(nntp_success),
  },
  ProtocolDescriptor {
    name: "lmtp",
    capability_probe: Some("LHLO murder"),
    terminator: "250 ",
    starttls_cmd: None,
    sasl_prefix: None,
    mechlist_parser: None,
    logout_cmd: "QUIT",
    logout_success: None,
    success_parser: None,
  },
  ProtocolDescriptor {
    name: "mupdate",
    capability_probe: None,
    terminator: "* OK",
    starttls_cmd: None,
    sasl_prefix: Some("* AUTH "),
    mechlist_parser: None,
    logout_cmd: "LOGOUT",
    logout_success: None,
    success_parser: None,
  },
];

pub fn lookup(name: &str) -> Option<&'static ProtocolDescriptor> {
  PROTOCOLS.iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scenario_s8_imap_mechlist_parser() {
    let parser = lookup("imap").unwrap().mechlist_parser.unwrap();
    assert_eq!(parser("* CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN"), Some("PLAIN LOGIN".to_string()));
  }

  #[test]
  fn scenario_s8_nntp_success_parser() {
    let parser = lookup("nntp").unwrap().success_parser.unwrap();
    assert!(parser("282 Hello there"));
    assert!(!parser("281 Hello there"));
  }

  #[test]
  fn lmtp_and_mupdate_have_no_starttls_or_mechlist() {
    let lmtp = lookup("lmtp").unwrap();
    assert!(lmtp.starttls_cmd.is_none());
    assert!(lmtp.mechlist_parser.is_none());

    let mupdate = lookup("mupdate").unwrap();
    assert!(mupdate.starttls_cmd.is_none());
    assert!(mupdate.mechlist_parser.is_none());
    assert!(mupdate.capability_probe.is_none());
  }

  #[test]
  fn all_five_protocols_are_present() {
    let names: Vec<&str> = PROTOCOLS.iter().map(|p| p.name).collect();
    assert_eq!(names, ["imap", "pop3", "nntp", "lmtp", "mupdate"]);
  }
}
