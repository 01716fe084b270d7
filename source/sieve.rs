//! Sieve file-set sync (design §4.G): the user's sieve scripts live as
//! plain files in a per-user directory, with `defaultbc` as a symlink
//! marking which one is active. Uploads land via temp-file + fsync +
//! rename, the same atomicity idiom used for maildir delivery.

use crate::error::EngineError;
use crate::guid::MessageGuid;
use crate::model::SieveScript;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

const DEFAULT_SYMLINK: &str = "defaultbc";

/// Scan `dir` and return every regular script's `(name, mtime, guid,
/// active)`, with `active` set for whichever file `defaultbc` resolves to.
pub fn list(dir: &Path) -> Result<Vec<SieveScript>, EngineError> {
  let active_target = fs::read_link(dir.join(DEFAULT_SYMLINK)).ok().and_then(|target| {
    target.file_name().map(|name| name.to_string_lossy().into_owned())
  });

  let mut scripts = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let name = entry.file_name().to_string_lossy().into_owned();
    if name == DEFAULT_SYMLINK {
      continue;
    }
    let metadata = entry.metadata()?;
    if !metadata.is_file() {
      continue;
    }
    let contents = fs::read(entry.path())?;
    let mtime = metadata.modified()?.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
    scripts.push(SieveScript {
      guid: MessageGuid::from_bytes(&contents),
      last_update: mtime,
      active: active_target.as_deref() == Some(name.as_str()),
      name,
    });
  }
  scripts.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(scripts)
}

/// Write `contents` to `<dir>/<name>` atomically, backdating the result's
/// mtime to `last_update` so a later `list` reports the sender's timestamp
/// rather than the moment of replication.
pub fn upload(dir: &Path, name: &str, contents: &[u8], last_update: u64) -> Result<(), EngineError> {
  let tmp_path = dir.join(format!("sync_tmp-{}", std::process::id()));
  let mut file = fs::File::create(&tmp_path)?;
  file.write_all(contents)?;
  file.sync_all()?;
  drop(file);

  let mtime = UNIX_EPOCH + Duration::from_secs(last_update);
  let file = fs::File::open(&tmp_path)?;
  file.set_modified(mtime)?;
  drop(file);

  fs::rename(&tmp_path, dir.join(name))?;
  Ok(())
}

/// Make `name` the active script: repoint `defaultbc` at it.
pub fn activate(dir: &Path, name: &str) -> Result<(), EngineError> {
  let link = dir.join(DEFAULT_SYMLINK);
  let _ = fs::remove_file(&link);
  symlink(name, &link)?;
  Ok(())
}

pub fn deactivate(dir: &Path) -> Result<(), EngineError> {
  match fs::remove_file(dir.join(DEFAULT_SYMLINK)) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

/// Delete `name`, unlinking `defaultbc` first if it currently points at it.
pub fn delete(dir: &Path, name: &str) -> Result<(), EngineError> {
  let link = dir.join(DEFAULT_SYMLINK);
  if let Ok(target) = fs::read_link(&link) {
    if target.file_name().and_then(|n| n.to_str()) == Some(name) {
      fs::remove_file(&link)?;
    }
  }
  fs::remove_file(dir.join(name))?;
  Ok(())
}
