use unicode_normalization::UnicodeNormalization;

/// Unicode NFC normalization + BOM strip + CRLF -> LF.
///
/// Surrounding whitespace is kept: leading indentation can be meaningful in
/// prompts (code blocks, lists).
pub fn clean_text(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t
}

/// True when `s` carries no visible content.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
