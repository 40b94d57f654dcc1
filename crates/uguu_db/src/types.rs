//! Catalog entity types.
//!
//! These mirror the rows the scanner writes and the search front end reads.
//! Tree-local ids (`treepath_id`, `pathfile_id`) are plain integers; there are
//! no object references between paths and files.

use serde::{Deserialize, Serialize};

// ============================================================================
// Shares
// ============================================================================

/// Network protocol a share is exposed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smb,
    Ftp,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ftp => "ftp",
            Self::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "smb" => Some(Self::Smb),
            "ftp" => Some(Self::Ftp),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Share availability as maintained by the pinger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// A share due for scanning, joined with its scan command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueShare {
    pub share_id: i64,
    pub tree_id: Option<i64>,
    pub scantype_id: i64,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
}

/// Full share row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub share_id: i64,
    pub tree_id: Option<i64>,
    pub scantype_id: i64,
    pub network: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub state: Availability,
    pub size: i64,
    /// Milliseconds since Unix epoch
    pub last_scan: Option<i64>,
    /// Milliseconds since Unix epoch
    pub next_scan: Option<i64>,
}

/// Shares to insert; discovery normally does this.
#[derive(Debug, Clone)]
pub struct NewShare {
    pub scantype_id: i64,
    pub network: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub state: Availability,
}

/// Row of the `scantypes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanType {
    pub scantype_id: i64,
    pub protocol: Protocol,
    pub scan_command: String,
    pub priority: i32,
}

// ============================================================================
// Trees, paths and files
// ============================================================================

/// A content-addressed snapshot of a share's hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub tree_id: i64,
    pub hash: Option<String>,
    pub size: i64,
}

/// Directory node within a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRow {
    pub treepath_id: i64,
    pub parent_id: Option<i64>,
    pub parentfile_id: Option<i64>,
    pub path: String,
    pub items: i64,
    pub size: i64,
}

/// Entry within a directory, addressed by its dense slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub treepath_id: i64,
    pub pathfile_id: i64,
    pub treedir_id: i64,
    pub size: i64,
    pub name: String,
    pub file_type: Option<FileType>,
}

/// File to be written into the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub treepath_id: i64,
    pub pathfile_id: i64,
    pub treedir_id: i64,
    pub size: i64,
    pub name: String,
    pub file_type: Option<FileType>,
    /// Prepared search text of the name
    pub tsname: String,
    /// Prepared search text of the containing path
    pub tspath: String,
}

// ============================================================================
// File types
// ============================================================================

/// Coarse file classification shown by the search front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Dir,
    Video,
    Audio,
    Archive,
    CdImage,
    Exe,
    Lib,
    Script,
    Image,
    Document,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dir => "dir",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Archive => "archive",
            Self::CdImage => "cdimage",
            Self::Exe => "exe",
            Self::Lib => "lib",
            Self::Script => "script",
            Self::Image => "image",
            Self::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dir" => Some(Self::Dir),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "archive" => Some(Self::Archive),
            "cdimage" => Some(Self::CdImage),
            "exe" => Some(Self::Exe),
            "lib" => Some(Self::Lib),
            "script" => Some(Self::Script),
            "image" => Some(Self::Image),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    /// Classify a lowercase suffix (without the dot).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        let file_type = match suffix {
            "mp3" | "ogg" | "vaw" | "flac" | "ape" | "au" | "aiff" | "ra" | "wma" | "mid"
            | "midi" | "mpc" => Self::Audio,
            "mkv" | "avi" | "mp4" | "mov" | "mpeg" | "mpg" | "asf" | "ogm" | "vob" | "m2v"
            | "ts" | "wmv" | "rm" | "qt" | "mpe" | "divx" | "flv" | "m2ts" => Self::Video,
            "bz" | "gz" | "bz2" | "tar" | "tbz" | "tgz" | "zip" | "rar" | "arj" | "ace"
            | "cab" | "z" | "tbz2" | "7z" | "ha" | "jar" | "lzh" | "lzma" | "j" | "deb"
            | "rpm" => Self::Archive,
            "bin" | "iso" | "cue" | "bwt" | "ccd" | "cdi" | "mds" | "nrg" | "vcd" | "vc4"
            | "mdf" | "gho" | "ghs" => Self::CdImage,
            "exe" | "com" | "msi" | "scf" | "swf" => Self::Exe,
            "dll" | "sys" | "vxd" | "bpl" | "cpl" | "ime" | "drv" | "mui" | "so" | "lib" => {
                Self::Lib
            }
            "bat" | "cmd" | "vbs" | "vbe" | "js" | "jse" | "wsf" | "wsh" | "pl" | "py"
            | "php" | "sh" => Self::Script,
            "jpg" | "jpeg" | "gif" | "png" | "bmp" | "tiff" | "pbm" | "pcx" | "pnm" | "ico"
            | "ppm" | "psd" | "tif" | "tga" | "xbm" | "xpm" => Self::Image,
            "txt" | "doc" | "xls" | "rtf" | "docx" | "xlsx" | "pdf" | "ps" | "eps" | "hlp"
            | "djvu" | "djv" | "htm" | "html" | "chm" | "mht" | "shtml" | "log" | "xml"
            | "csv" | "ini" | "cfg" | "conf" | "tex" | "dvi" => Self::Document,
            _ => return None,
        };
        Some(file_type)
    }

    /// Type of a directory entry: `Dir` when it links a directory, otherwise
    /// whatever its suffix says.
    pub fn classify(name: &str, treedir_id: i64) -> Option<Self> {
        if treedir_id != 0 {
            return Some(Self::Dir);
        }
        name.rfind('.')
            .and_then(|dot| Self::from_suffix(&name[dot + 1..].to_lowercase()))
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
