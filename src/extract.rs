use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref URL_RE: Regex = Regex::new(r#"https?://[^\s<>"'`|]+"#).unwrap();
}

/// Collects candidate URLs from message text and embed links, de-duplicated in
/// first-seen order.
pub fn find_urls<'a>(content: &str, embed_urls: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let has_host = candidate
            .find("://")
            .is_some_and(|scheme_end| candidate.len() > scheme_end + "://".len());
        if has_host && !urls.iter().any(|u| u == candidate) {
            urls.push(candidate.to_string());
        }
    };

    for found in URL_RE.find_iter(content) {
        push(trim_url(found.as_str()));
    }
    for url in embed_urls {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            push(url);
        }
    }
    urls
}

/// Drops sentence punctuation and closing brackets that are not part of the URL.
fn trim_url(raw: &str) -> &str {
    let mut url = raw;
    loop {
        let Some(last) = url.chars().last() else {
            return url;
        };
        let strip = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '*' | '_' | '~' => true,
            ')' => url.matches('(').count() < url.matches(')').count(),
            ']' => url.matches('[').count() < url.matches(']').count(),
            '}' => url.matches('{').count() < url.matches('}').count(),
            _ => false,
        };
        if !strip {
            return url;
        }
        url = &url[..url.len() - last.len_utf8()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_EMBEDS: [&str; 0] = [];

    #[test]
    fn finds_urls_in_text() {
        let urls = find_urls(
            "look https://example.com/a and http://foo.test/b?x=1, also https://example.com/a",
            NO_EMBEDS,
        );
        assert_eq!(urls, vec!["https://example.com/a", "http://foo.test/b?x=1"]);
    }

    #[test]
    fn trims_trailing_punctuation_and_brackets() {
        let urls = find_urls(
            "(see https://en.wikipedia.org/wiki/Rust_(programming_language)). and <https://x.test/y>!",
            NO_EMBEDS,
        );
        assert_eq!(
            urls,
            vec![
                "https://en.wikipedia.org/wiki/Rust_(programming_language)",
                "https://x.test/y"
            ]
        );
    }

    #[test]
    fn merges_embed_urls_without_duplicates() {
        let urls = find_urls(
            "https://video.test/watch?v=1",
            ["https://video.test/watch?v=1", "https://other.test/", "not a url"],
        );
        assert_eq!(urls, vec!["https://video.test/watch?v=1", "https://other.test/"]);
    }

    #[test]
    fn ignores_bare_schemes() {
        assert!(find_urls("https:// nothing here", NO_EMBEDS).is_empty());
        assert!(find_urls("http:// nothing here", NO_EMBEDS).is_empty());
    }

    #[test]
    fn keeps_short_http_urls() {
        assert_eq!(find_urls("go to http://a now", NO_EMBEDS), vec!["http://a"]);
        assert_eq!(find_urls("", ["http://b"]), vec!["http://b"]);
    }
}
