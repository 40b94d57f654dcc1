//! Low-level scanner processes.
//!
//! A scanner is an external binary that crawls one share and prints the
//! line protocol described in [`crate::protocol`] on stdout. This module
//! starts it, enforces the line ceiling and wall-clock timeout, and captures
//! its output:
//!
//! - the patch sentinel and patch records are kept in memory,
//! - the full listing is spooled to a temporary file next to the baselines
//!   and digested as it streams past.
//!
//! Nothing here touches the database.

use crate::error::{Result, SpiderError};
use crate::protocol::{classify, sentinel_digest, LineKind, LineParser, Record, ScanMode};
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uguu_db::Protocol;

// ============================================================================
// Scan commands
// ============================================================================

/// The scanner binaries the spider knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScannerKind {
    SmbScan,
    FtpScan,
    WebDavScan,
}

impl ScannerKind {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::SmbScan => "smbscan",
            Self::FtpScan => "ftpscan",
            Self::WebDavScan => "webdavscan",
        }
    }

    pub fn from_binary(name: &str) -> Option<Self> {
        match name {
            "smbscan" => Some(Self::SmbScan),
            "ftpscan" => Some(Self::FtpScan),
            "webdavscan" => Some(Self::WebDavScan),
            _ => None,
        }
    }

    /// The scanner that handles a protocol.
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Smb => Self::SmbScan,
            Protocol::Ftp => Self::FtpScan,
            Protocol::Http => Self::WebDavScan,
        }
    }
}

/// A parsed `scantypes.scan_command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    pub kind: ScannerKind,
    /// Fixed arguments placed before the per-share ones
    pub args: Vec<String>,
}

impl ScanCommand {
    /// Parse a command such as `smbscan -d` registered for `protocol`.
    pub fn parse(command: &str, protocol: Protocol) -> Result<Self> {
        let mut words = command.split_whitespace();
        let binary = words
            .next()
            .ok_or_else(|| SpiderError::config("empty scan command"))?;
        let kind = ScannerKind::from_binary(binary)
            .ok_or_else(|| SpiderError::config(format!("unknown scanner {:?}", binary)))?;
        if kind != ScannerKind::for_protocol(protocol) {
            return Err(SpiderError::config(format!(
                "scanner {} cannot scan {} shares",
                binary, protocol
            )));
        }
        Ok(Self {
            kind,
            args: words.map(str::to_string).collect(),
        })
    }

    /// Argument vector after the binary:
    /// `<args…> [-p<port>] [-u <baseline>] <address>`.
    pub fn argv(&self, address: IpAddr, port: u16, baseline: Option<&Path>) -> Vec<String> {
        let mut argv = self.args.clone();
        if port != 0 {
            argv.push(format!("-p{}", port));
        }
        if let Some(baseline) = baseline {
            argv.push("-u".to_string());
            argv.push(baseline.display().to_string());
        }
        argv.push(address.to_string());
        argv
    }

    /// Build the process; no shell is involved.
    pub fn command(
        &self,
        scanners_dir: &Path,
        address: IpAddr,
        port: u16,
        baseline: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(scanners_dir.join(self.kind.binary_name()));
        cmd.args(self.argv(address, port, baseline));
        cmd
    }
}

/// Resolve a share's hostname, preferring IPv4 like the scanners do.
pub async fn resolve_host(host: &str) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| {
            debug!(host, error = %e, "Lookup failed");
            SpiderError::Resolve {
                host: host.to_string(),
            }
        })?
        .map(|addr| addr.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SpiderError::Resolve {
            host: host.to_string(),
        })
}

// ============================================================================
// Captured output
// ============================================================================

/// Everything a scanner printed, split by line kind.
#[derive(Debug)]
pub struct CapturedScan {
    /// Digest the scanner says its patch was computed against
    pub sentinel: Option<String>,
    /// `+`, `-` and `*` records in output order
    pub patch_lines: Vec<Vec<u8>>,
    /// The full listing, one record per line
    pub listing: NamedTempFile,
    pub listing_lines: u64,
    /// Lowercase hex MD5 of the listing file contents
    pub digest: String,
    /// Size of the whole share, from the listing's root entry
    pub root_size: Option<i64>,
    pub scan_time: Duration,
}

impl CapturedScan {
    /// Capture output that is already in memory.
    pub fn from_output(output: &[u8], spool_dir: &Path, max_lines: u64) -> Result<Self> {
        let mut sink = CaptureSink::new(spool_dir, max_lines)?;
        for line in output.split(|b| *b == b'\n') {
            sink.push(line)?;
        }
        sink.finish(Duration::ZERO)
    }

    pub fn patch_line_count(&self) -> u64 {
        self.patch_lines.len() as u64
    }

    pub fn listing_path(&self) -> &Path {
        self.listing.path()
    }
}

/// Line-by-line accumulator behind [`CapturedScan`].
pub struct CaptureSink {
    sentinel: Option<String>,
    patch_lines: Vec<Vec<u8>>,
    spool: BufWriter<NamedTempFile>,
    listing_lines: u64,
    total_lines: u64,
    max_lines: u64,
    digest: md5::Context,
    root_size: Option<i64>,
}

impl CaptureSink {
    pub fn new(spool_dir: &Path, max_lines: u64) -> Result<Self> {
        let spool = NamedTempFile::new_in(spool_dir)?;
        Ok(Self {
            sentinel: None,
            patch_lines: Vec::new(),
            spool: BufWriter::new(spool),
            listing_lines: 0,
            total_lines: 0,
            max_lines,
            digest: md5::Context::new(),
            root_size: None,
        })
    }

    /// Record one line (without its newline).
    pub fn push(&mut self, raw: &[u8]) -> Result<()> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let kind = classify(raw);
        if kind == LineKind::Blank {
            return Ok(());
        }

        self.total_lines += 1;
        if self.total_lines > self.max_lines {
            return Err(SpiderError::TooManyLines {
                limit: self.max_lines,
            });
        }

        match kind {
            LineKind::Sentinel if self.sentinel.is_none() && self.patch_lines.is_empty() => {
                self.sentinel = sentinel_digest(raw);
            }
            LineKind::Sentinel | LineKind::Patch => self.patch_lines.push(raw.to_vec()),
            LineKind::Listing => {
                self.spool.write_all(raw)?;
                self.spool.write_all(b"\n")?;
                self.digest.consume(raw);
                self.digest.consume(b"\n");
                self.listing_lines += 1;
                if raw.starts_with(b"1 0 ") {
                    self.observe_root(raw);
                }
            }
            LineKind::Blank => {}
        }
        Ok(())
    }

    fn observe_root(&mut self, raw: &[u8]) {
        match LineParser::new(ScanMode::Full).parse(raw) {
            Ok(Some(Record::RootSizeObserved { size, .. })) => self.root_size = Some(size),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Unreadable root entry"),
        }
    }

    pub fn finish(self, scan_time: Duration) -> Result<CapturedScan> {
        let listing = self.spool.into_inner().map_err(|e| e.into_error())?;
        Ok(CapturedScan {
            sentinel: self.sentinel,
            patch_lines: self.patch_lines,
            listing,
            listing_lines: self.listing_lines,
            digest: format!("{:x}", self.digest.compute()),
            root_size: self.root_size,
            scan_time,
        })
    }
}

// ============================================================================
// Process adapter
// ============================================================================

/// Limits and plumbing for one scanner run.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub scanners_dir: PathBuf,
    /// Temporary listing files are created here
    pub spool_dir: PathBuf,
    pub max_lines: u64,
    pub timeout: Duration,
    pub forward_stderr: bool,
}

/// What to scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub share: String,
    pub command: ScanCommand,
    pub address: IpAddr,
    pub port: u16,
    /// Saved listing to diff against; `None` asks for a full scan
    pub baseline: Option<PathBuf>,
}

/// Run a scanner to completion and capture its output.
///
/// The process is killed when it exceeds the line ceiling or the timeout,
/// and whenever the returned future is dropped.
pub async fn run_scanner(request: &ScanRequest, options: &CaptureOptions) -> Result<CapturedScan> {
    let start = Instant::now();
    let mut cmd = request.command.command(
        &options.scanners_dir,
        request.address,
        request.port,
        request.baseline.as_deref(),
    );
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if options.forward_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SpiderError::ScannerExit(format!(
                "failed to start {}: {}",
                options.scanners_dir.join(request.command.kind.binary_name()).display(),
                e
            ))
        })?;

    info!(
        share = %request.share,
        address = %request.address,
        patch = request.baseline.is_some(),
        "Starting scanner"
    );

    let mut stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_stderr(request.share.clone(), stderr)));

    // The timeout covers the whole run, including a scanner that closes
    // stdout and keeps going.
    let finished = tokio::time::timeout(options.timeout, async {
        let sink = capture(&mut child, options).await?;
        let status = child.wait().await?;
        if let Some(task) = stderr_task.as_mut() {
            let _ = task.await;
        }
        Ok::<_, SpiderError>((sink, status))
    })
    .await;

    let (captured, status) = match finished {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => {
            terminate(&mut child, stderr_task).await;
            return Err(e);
        }
        Err(_) => {
            terminate(&mut child, stderr_task).await;
            return Err(SpiderError::Timeout(options.timeout));
        }
    };
    check_status(status)?;

    let captured = captured.finish(start.elapsed())?;
    debug!(
        share = %request.share,
        listing_lines = captured.listing_lines,
        patch_lines = captured.patch_lines.len(),
        elapsed = ?captured.scan_time,
        "Scanner finished"
    );
    Ok(captured)
}

async fn capture(child: &mut Child, options: &CaptureOptions) -> Result<CaptureSink> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpiderError::ScannerExit("scanner stdout unavailable".to_string()))?;
    let mut reader = BufReader::new(stdout);
    let mut sink = CaptureSink::new(&options.spool_dir, options.max_lines)?;

    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        let raw = line.strip_suffix(b"\n").unwrap_or(&line);
        sink.push(raw)?;
    }
    Ok(sink)
}

async fn terminate(child: &mut Child, stderr_task: Option<JoinHandle<()>>) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill scanner");
    }
    if let Some(task) = stderr_task {
        task.abort();
    }
}

fn check_status(status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(SpiderError::ScannerExit(match status.code() {
            Some(code) => format!("return code {}", code),
            None => status.to_string(),
        }))
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(share: String, stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "uguu_spider::scanner", share = %share, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(share = %share, error = %e, "Scanner stderr closed");
                break;
            }
        }
    }
}
