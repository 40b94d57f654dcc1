//! Scanner line protocol.
//!
//! A scanner writes one record per line. Listing lines describe the
//! complete current state of a share:
//!
//! ```text
//! 0 <path_id> <path>
//! 1 <parent_path_id> <slot> <size> <dir_link_id> <items> <name>
//! ```
//!
//! When asked for a patch against a saved listing, the scanner first writes
//! `* <digest>` (the digest of the saved listing it diffed against), then the
//! same two record shapes prefixed by `+` (add), `-` (delete) or `*`
//! (modify), and finally the new full listing.
//!
//! A file record whose parent path id is `0` is the entry for the share root
//! itself; its size is the size of the whole share.

use std::borrow::Cow;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::warn;

/// Malformed scanner output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ProtocolError {
    pub line: u64,
    pub message: String,
}

impl ProtocolError {
    fn new(line: u64, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Which kind of stream a parser is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Every line is an implicit add
    Full,
    /// Lines carry an explicit `+`, `-` or `*`
    Patch,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Patch => "patch",
        }
    }
}

/// Shape of a raw output line, decided from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Part of the full listing
    Listing,
    /// A `+`, `-` or `*` record
    Patch,
    /// `* <digest>` announcing the baseline a patch applies to
    Sentinel,
    Blank,
}

/// Classify a raw line (without its terminating newline).
pub fn classify(raw: &[u8]) -> LineKind {
    match raw.first() {
        None => LineKind::Blank,
        Some(b'+') | Some(b'-') => LineKind::Patch,
        Some(b'*') => {
            if sentinel_digest(raw).is_some() {
                LineKind::Sentinel
            } else {
                LineKind::Patch
            }
        }
        Some(_) => LineKind::Listing,
    }
}

/// The digest carried by a `* <digest>` line, lowercased.
pub fn sentinel_digest(raw: &[u8]) -> Option<String> {
    let digest = raw.strip_prefix(b"* ")?;
    let digest = digest.strip_suffix(b"\r").unwrap_or(digest);
    if digest.len() >= 32 && digest.iter().all(u8::is_ascii_hexdigit) {
        Some(String::from_utf8_lossy(digest).to_ascii_lowercase())
    } else {
        None
    }
}

/// Decode a raw line, escaping every byte that is not valid UTF-8 as
/// `\0x<hex>`.
///
/// Returns `Cow::Borrowed` when the line was valid.
pub fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(escape_invalid(raw)),
    }
}

fn escape_invalid(mut raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    loop {
        match std::str::from_utf8(raw) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, rest) = raw.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(rest.len());
                for byte in &rest[..bad] {
                    let _ = write!(out, "\\{:#x}", byte);
                }
                raw = &rest[bad..];
            }
        }
    }
}

/// Add, delete or modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Delete,
    Modify,
}

impl Action {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Add),
            '-' => Some(Self::Delete),
            '*' => Some(Self::Modify),
            _ => None,
        }
    }
}

/// A directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub id: i64,
    pub path: String,
}

/// An entry inside a directory. A nonzero `dir_link` names the path this
/// entry stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub parent_id: i64,
    pub slot: i64,
    pub size: i64,
    pub dir_link: i64,
    pub items: i64,
    pub name: String,
}

/// One decoded scanner record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    PathAdd(PathRecord),
    PathDelete(PathRecord),
    PathModify(PathRecord),
    FileAdd(FileRecord),
    FileDelete(FileRecord),
    FileModify(FileRecord),
    /// Entry for the share root; `size` is the size of the whole share
    RootSizeObserved { size: i64, dir_link: i64, items: i64 },
    /// Digest of the baseline a patch was computed against
    DigestSentinel(String),
}

/// Stateful line decoder for one scanner stream.
#[derive(Debug)]
pub struct LineParser {
    mode: ScanMode,
    line_no: u64,
    escaped: u64,
}

impl LineParser {
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            line_no: 0,
            escaped: 0,
        }
    }

    /// Lines that contained bytes which are not UTF-8.
    pub fn escaped_lines(&self) -> u64 {
        self.escaped
    }

    /// Decode one raw line.
    ///
    /// Returns `None` for lines that do not belong to this parser's mode:
    /// patch records and sentinels in full mode, listing lines in patch
    /// mode, and blank lines in either.
    pub fn parse(&mut self, raw: &[u8]) -> Result<Option<Record>, ProtocolError> {
        self.line_no += 1;
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);

        match (self.mode, classify(raw)) {
            (_, LineKind::Blank) => Ok(None),
            (ScanMode::Full, LineKind::Patch | LineKind::Sentinel) => Ok(None),
            (ScanMode::Patch, LineKind::Listing) => Ok(None),
            (ScanMode::Patch, LineKind::Sentinel) => {
                Ok(sentinel_digest(raw).map(Record::DigestSentinel))
            }
            (ScanMode::Patch, LineKind::Patch) => {
                let line = self.decode(raw);
                let mut chars = line.chars();
                let action = chars.next().and_then(Action::from_char).ok_or_else(|| {
                    ProtocolError::new(self.line_no, "missing action character")
                })?;
                let body = chars.as_str().strip_prefix(' ').ok_or_else(|| {
                    ProtocolError::new(self.line_no, "action not followed by a space")
                })?;
                parse_body(self.line_no, action, body).map(Some)
            }
            (ScanMode::Full, LineKind::Listing) => {
                let line = self.decode(raw);
                parse_body(self.line_no, Action::Add, &line).map(Some)
            }
        }
    }

    fn decode<'a>(&mut self, raw: &'a [u8]) -> Cow<'a, str> {
        let line = decode_line(raw);
        if let Cow::Owned(ref escaped) = line {
            self.escaped += 1;
            warn!(line = self.line_no, text = %escaped, "Non utf-8 line from scanner");
        }
        line
    }
}

/// Parse the fields after the action character.
fn parse_body(line_no: u64, action: Action, body: &str) -> Result<Record, ProtocolError> {
    let body = body.strip_suffix('\r').unwrap_or(body);
    let is_path = body.starts_with('0');

    if is_path {
        let mut fields = body.splitn(3, ' ');
        let _kind = fields.next();
        let id = int_field(line_no, "path id", fields.next())?;
        let path = fields.next().unwrap_or("").to_string();
        let record = PathRecord { id, path };
        return Ok(match action {
            Action::Add => Record::PathAdd(record),
            Action::Delete => Record::PathDelete(record),
            Action::Modify => Record::PathModify(record),
        });
    }

    let mut fields = body.splitn(7, ' ');
    let _kind = fields.next();
    let parent_id = int_field(line_no, "parent path id", fields.next())?;
    let slot = int_field(line_no, "slot", fields.next())?;
    let size = int_field(line_no, "size", fields.next())?;
    let dir_link = int_field(line_no, "directory link", fields.next())?;
    let items = int_field(line_no, "item count", fields.next())?;
    let name = fields.next().unwrap_or("").to_string();

    if parent_id == 0 {
        return match action {
            Action::Add | Action::Modify => Ok(Record::RootSizeObserved {
                size,
                dir_link,
                items,
            }),
            Action::Delete => Err(ProtocolError::new(line_no, "share root entry deleted")),
        };
    }

    let record = FileRecord {
        parent_id,
        slot,
        size,
        dir_link,
        items,
        name,
    };
    Ok(match action {
        Action::Add => Record::FileAdd(record),
        Action::Delete => Record::FileDelete(record),
        Action::Modify => Record::FileModify(record),
    })
}

fn int_field(line_no: u64, what: &str, field: Option<&str>) -> Result<i64, ProtocolError> {
    let field = field.ok_or_else(|| ProtocolError::new(line_no, format!("missing {}", what)))?;
    field
        .parse()
        .map_err(|_| ProtocolError::new(line_no, format!("bad {} {:?}", what, field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(line: &str) -> Option<Record> {
        LineParser::new(ScanMode::Full).parse(line.as_bytes()).unwrap()
    }

    fn patch(line: &str) -> Option<Record> {
        LineParser::new(ScanMode::Patch).parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_full_mode_path_and_file_lines() {
        assert_eq!(
            full("0 2 music/old stuff"),
            Some(Record::PathAdd(PathRecord {
                id: 2,
                path: "music/old stuff".into()
            }))
        );
        assert_eq!(
            full("1 2 0 4096 0 0 some song.mp3"),
            Some(Record::FileAdd(FileRecord {
                parent_id: 2,
                slot: 0,
                size: 4096,
                dir_link: 0,
                items: 0,
                name: "some song.mp3".into()
            }))
        );
    }

    #[test]
    fn test_root_entry_is_share_size() {
        assert_eq!(
            full("1 0 0 123456 1 3 "),
            Some(Record::RootSizeObserved {
                size: 123456,
                dir_link: 1,
                items: 3
            })
        );
        let err = LineParser::new(ScanMode::Patch)
            .parse(b"- 1 0 0 10 1 3 ")
            .unwrap_err();
        assert!(err.message.contains("root"));
    }

    #[test]
    fn test_patch_mode_actions() {
        assert!(matches!(patch("+ 0 5 new"), Some(Record::PathAdd(p)) if p.id == 5));
        assert!(matches!(patch("- 0 5"), Some(Record::PathDelete(p)) if p.path.is_empty()));
        assert!(matches!(patch("* 0 5 renamed"), Some(Record::PathModify(p)) if p.path == "renamed"));
        assert!(matches!(patch("- 1 5 2 0 0 0 x"), Some(Record::FileDelete(f)) if f.slot == 2));
        assert!(matches!(patch("* 1 5 2 77 0 0 x"), Some(Record::FileModify(f)) if f.size == 77));
    }

    #[test]
    fn test_sentinel_is_recognised() {
        let digest = "D41D8CD98F00B204E9800998ECF8427E";
        let line = format!("* {}", digest);
        assert_eq!(classify(line.as_bytes()), LineKind::Sentinel);
        assert_eq!(
            patch(&line),
            Some(Record::DigestSentinel(digest.to_ascii_lowercase()))
        );
        // A modified path whose id happens to be hex-looking is not a sentinel
        assert_eq!(classify(b"* 0 12 dir"), LineKind::Patch);
    }

    #[test]
    fn test_mode_filters_foreign_lines() {
        assert_eq!(full("+ 0 5 new"), None);
        assert_eq!(full("* d41d8cd98f00b204e9800998ecf8427e"), None);
        assert_eq!(patch("0 1 "), None);
        assert_eq!(full(""), None);
    }

    #[test]
    fn test_missing_name_is_empty() {
        assert!(matches!(full("1 3 0 10 0 0"), Some(Record::FileAdd(f)) if f.name.is_empty()));
        assert!(matches!(full("0 1"), Some(Record::PathAdd(p)) if p.path.is_empty()));
    }

    #[test]
    fn test_malformed_integer_is_protocol_error() {
        let mut parser = LineParser::new(ScanMode::Full);
        parser.parse(b"0 1 ").unwrap();
        let err = parser.parse(b"1 1 zero 10 0 0 x").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("slot"));

        let err = LineParser::new(ScanMode::Full).parse(b"1 1 0").unwrap_err();
        assert!(err.message.contains("missing size"));
    }

    #[test]
    fn test_non_utf8_bytes_are_escaped() {
        let mut parser = LineParser::new(ScanMode::Full);
        let record = parser.parse(b"1 1 0 10 0 0 caf\xe9.txt").unwrap();
        assert!(matches!(record, Some(Record::FileAdd(f)) if f.name == "caf\\0xe9.txt"));
        assert_eq!(parser.escaped_lines(), 1);

        assert_eq!(decode_line("naïve".as_bytes()), "naïve");
    }
}
