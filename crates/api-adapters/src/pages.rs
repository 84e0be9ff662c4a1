//! Page shells. Content is loaded client-side from the `source.json`
//! endpoint each shell links to; plugins inject fragments into the head.

use askama::Template;
use domains::Statistics;

/// Longest error message shown to a client.
pub const MAX_ERROR_MESSAGE: usize = 500;

#[derive(Template)]
#[template(path = "page.html")]
pub struct PageShell<'a> {
    pub title: String,
    pub prefix: &'a str,
    pub boards: &'a [String],
    /// Relative URL of the JSON document the page renders.
    pub source: String,
    /// Pre-rendered plugin fragments. Not escaped.
    pub injection: String,
    pub stats: Option<Statistics>,
}

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorPage<'a> {
    pub status: u16,
    pub reason: &'a str,
    pub message: String,
}

impl<'a> ErrorPage<'a> {
    pub fn new(status: u16, reason: &'a str, message: &str) -> Self {
        Self { status, reason, message: truncate_message(message) }
    }
}

fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_links_source_and_keeps_injection_raw() {
        let boards = vec!["b".to_string(), "cyb".to_string()];
        let page = PageShell {
            title: "/b/".into(),
            prefix: "/board",
            boards: &boards,
            source: "/board/b/source.json".into(),
            injection: "<script src=\"/captcha.js\"></script>".into(),
            stats: Some(Statistics { post_count: 4, threads: 2 }),
        };
        let html = page.render().unwrap();
        assert!(html.contains("data-source=\"/board/b/source.json\""));
        assert!(html.contains("<script src=\"/captcha.js\"></script>"));
        assert!(html.contains("href=\"/board/cyb/\""));
        assert!(html.contains("4 posts"));
    }

    #[test]
    fn error_page_escapes_and_truncates() {
        let long = "x".repeat(MAX_ERROR_MESSAGE + 20);
        assert_eq!(ErrorPage::new(400, "Bad Request", &long).message.len(), MAX_ERROR_MESSAGE);

        let html = ErrorPage::new(400, "Bad Request", "Invalid email: \"<b>\"").render().unwrap();
        assert!(!html.contains("<b>"));
        assert!(html.contains("&lt;b&gt;"));
    }
}
