//! Kernel command line parsing.
//!
//! The kernel command line is a single line of whitespace-separated
//! tokens, each either `key=value` or a bare flag. Keys are folded to
//! lowercase. Recognized bare flags expand to canonical key/value pairs
//! via a fixed translation table; unrecognized bare flags are ignored.
//! Insertion is first-wins, so an earlier option is never overwritten by
//! a later duplicate.

use std::collections::HashMap;

/// Translation table for recognized bare flags.
const FLAG_TRANSLATIONS: &[(&str, (&str, &str))] = &[
    ("ro", ("options", "ro")),
    ("rw", ("options", "rw")),
    ("fastboot", ("fsck.mode", "skip")),
    ("forcefsck", ("fsck.mode", "force")),
];

/// Parse the kernel command line into a boot option map.
pub fn parse_cmdline(text: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();

    for token in text.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                options
                    .entry(key.to_ascii_lowercase())
                    .or_insert_with(|| value.to_string());
            }
            None => {
                let flag = token.to_ascii_lowercase();
                if let Some((_, (key, value))) =
                    FLAG_TRANSLATIONS.iter().find(|(name, _)| *name == flag)
                {
                    options
                        .entry(key.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }
    }

    options
}
