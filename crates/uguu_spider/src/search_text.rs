//! Search text stored next to file and path names.
//!
//! The front end's full-text index tokenizes on whitespace, so punctuation
//! is turned into spaces and episode markers are spelled out in the forms
//! people type them.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W").expect("valid regex"));

static EPISODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([Ss])(\d+)([Ee])(\d+)").expect("valid regex"));

/// Prepare a name or path for indexing.
///
/// `Show.S01E02.mkv` becomes `Show S01E02 S01 E02 01 02  mkv`.
pub fn prepare(text: &str) -> String {
    let relaxed = NON_WORD.replace_all(text, " ");
    EPISODE
        .replace_all(&relaxed, "${1}${2}${3}${4} ${1}${2} ${3}${4} ${2} ${4} ")
        .into_owned()
}
