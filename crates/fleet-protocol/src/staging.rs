//! Remote-copy sub-protocol spoken to `scp -t` on the staging channel.
//!
//! Each file is framed as `C<perm> <len> <name>\n`, the raw bytes, then one NUL.
//! The stream ends when the sender closes stdin.

/// Single byte written after every file body.
pub const FILE_TERMINATOR: u8 = 0;

/// Header line announcing one file. Only the permission bits of `mode` are kept.
pub fn file_header(mode: u32, len: u64, name: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o7777, len, name)
}

/// Parses a header produced by [`file_header`]; returns `(mode, len, name)`.
pub fn parse_file_header(line: &str) -> Option<(u32, u64, String)> {
    let rest = line.strip_prefix('C')?.strip_suffix('\n')?;
    let mut parts = rest.splitn(3, ' ');
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let len = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((mode, len, name.to_string()))
}
