//! Content type detection for tuples stored without one.

const DEFAULT: &str = "application/octet-stream";

/// Guesses a content type from a tuple name's extension.
pub fn from_name(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(mime)
}

/// Guesses a content type from the first bytes of a body.
pub fn sniff(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"%PDF-", "application/pdf"),
    ];

    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *mime;
    }

    let head = &data[..data.len().min(512)];
    let text = trim_ascii_start(head);
    if starts_with_ignore_case(text, b"<!doctype html") || starts_with_ignore_case(text, b"<html") {
        return "text/html; charset=utf-8";
    }

    match std::str::from_utf8(head) {
        Ok(s) if !s.contains('\0') => "text/plain; charset=utf-8",
        // a multi-byte character may have been cut at the sniff window
        Err(e) if e.error_len().is_none() && head.len() == 512 => "text/plain; charset=utf-8",
        _ => DEFAULT,
    }
}

/// Content type for a tuple: by name first, then by content.
pub fn guess(name: &str, data: &[u8]) -> &'static str {
    from_name(name).unwrap_or_else(|| sniff(data))
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_wins_over_content() {
        assert_eq!(guess("logo.png", b"plain words"), "image/png");
    }

    #[test]
    fn sniffs_html_and_binary() {
        assert_eq!(sniff(b"  <!DOCTYPE html><p>x"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"\x00\x01\x02"), DEFAULT);
        assert_eq!(sniff(b"hello"), "text/plain; charset=utf-8");
    }
}
