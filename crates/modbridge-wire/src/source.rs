//! Source path identity shared by breakpoints and stack frames.

/// Normalize a source path so that different spellings of the same file
/// compare equal.
///
/// - `\` separators become `/`
/// - a Windows drive letter is lowercased (`C:/x` -> `c:/x`)
/// - repeated separators collapse, except a leading `//` (UNC)
/// - `.` segments are dropped
pub fn normalize_source_path(path: &str) -> String {
    let unified = path.replace('\\', "/");

    let (prefix, rest) = if let Some(rest) = unified.strip_prefix("//") {
        ("//", rest)
    } else if let Some(rest) = unified.strip_prefix('/') {
        ("/", rest)
    } else {
        ("", unified.as_str())
    };

    let mut out = String::with_capacity(unified.len());
    out.push_str(prefix);
    let mut first = true;
    for segment in rest.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if !first {
            out.push('/');
        }
        first = false;
        out.push_str(segment);
    }
    if unified.ends_with('/') && !first {
        out.push('/');
    }

    let bytes = out.as_bytes();
    if prefix.is_empty() && bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
    {
        out[..1].make_ascii_lowercase();
    }
    out
}
