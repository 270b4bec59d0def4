//! Bodies for error responses.

use bytes::Bytes;

use crate::http::response::StatusCode;

/// Produces the body sent with an error status.
pub trait ErrorPages: Send + Sync + 'static {
    fn render(&self, status: StatusCode, detail: Option<&str>) -> Bytes;

    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }
}

/// Minimal HTML page naming the status.
#[derive(Debug, Clone, Default)]
pub struct HtmlErrorPages {
    pub server_name: Option<String>,
}

impl ErrorPages for HtmlErrorPages {
    fn render(&self, status: StatusCode, detail: Option<&str>) -> Bytes {
        let title = format!("{} {}", status.as_u16(), status.reason_phrase());
        let mut page = format!(
            "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n<body><h1>{title}</h1>\n"
        );
        if let Some(detail) = detail {
            page.push_str(&format!("<p>{}</p>\n", escape(detail)));
        }
        if let Some(name) = &self.server_name {
            page.push_str(&format!("<hr><address>{}</address>\n", escape(name)));
        }
        page.push_str("</body></html>\n");
        Bytes::from(page)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_escaped() {
        let pages = HtmlErrorPages::default();
        let body = pages.render(StatusCode::NotFound, Some("<script>"));
        let body = std::str::from_utf8(&body).unwrap();

        assert!(body.contains("404 Not Found"));
        assert!(body.contains("&lt;script&gt;"));
    }
}
