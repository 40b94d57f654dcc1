//! Per-share baseline listings on disk.
//!
//! The baseline of a share is the full listing of its last successful scan.
//! Its presence lets the next scan ask the scanner for a patch; deleting it
//! forces a full scan. The previous generation is kept as `<name>.old`.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uguu_db::Protocol;

/// `save_dir/<proto>_<host>_<port>`
pub fn save_path(save_dir: &Path, protocol: Protocol, host: &str, port: u16) -> PathBuf {
    save_dir.join(format!("{}_{}_{}", protocol.as_str(), host, port))
}

/// `proto://host[:port]`, for logs.
pub fn share_str(protocol: Protocol, host: &str, port: u16) -> String {
    if port == 0 {
        format!("{}://{}", protocol.as_str(), host)
    } else {
        format!("{}://{}:{}", protocol.as_str(), host, port)
    }
}

/// Path of the previous generation.
pub fn old_path(path: &Path) -> PathBuf {
    with_suffix(path, "old")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Install a freshly spooled listing as the share's baseline.
///
/// The current baseline, if any, becomes `<name>.old`. The spool must live
/// on the same filesystem as `path`.
pub fn install(path: &Path, spool: NamedTempFile) -> io::Result<()> {
    if path.is_file() {
        fs::rename(path, old_path(path))?;
    }
    spool.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), "Baseline saved");
    Ok(())
}

/// Move the baseline and its previous generation out of the way so the
/// next scan of the share runs in full mode.
pub fn quarantine(path: &Path, suffix: i64) -> io::Result<()> {
    let suffix = suffix.to_string();
    for candidate in [path.to_path_buf(), old_path(path)] {
        if candidate.is_file() {
            let target = with_suffix(&candidate, &suffix);
            fs::rename(&candidate, &target)?;
            info!(from = %candidate.display(), to = %target.display(), "Baseline moved aside");
        }
    }
    Ok(())
}

/// Lowercase hex MD5 of a file.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}
