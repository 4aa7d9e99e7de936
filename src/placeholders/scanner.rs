#[derive(Clone)]
pub(super) enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    BacktickQuoted,
    BracketQuoted,
    LineComment,
    BlockComment(u32),
}

pub(super) fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Scan a parameter name starting at `start`; returns the end index and the name.
pub(super) fn scan_ident(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    if !bytes.get(start).copied().is_some_and(is_ident_start) {
        return None;
    }
    let mut idx = start + 1;
    while idx < bytes.len() && is_ident_continue(bytes[idx]) {
        idx += 1;
    }
    std::str::from_utf8(&bytes[start..idx])
        .ok()
        .map(|name| (idx, name))
}
