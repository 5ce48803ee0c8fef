use once_cell::sync::Lazy;
use regex::RegexSet;

/// Tag name and case-insensitive pattern, checked against the full URL.
const URL_PATTERNS: &[(&str, &str)] = &[
    ("xss", r"(q=|s=|search=|id=|query=|keyword=|token=|select=|lang=)"),
    ("sqli", r"(id=|select=|union=|order=|where=|limit=|group=|debug=)"),
    ("lfi", r"(file=|doc=|path=|include=|page=|view=|folder=|root=)"),
    ("ssrf", r"(url=|uri=|link=|dest=|redirect=|source=|proxy=|host=)"),
    ("redirect", r"(return=|return_url=|r=|next=|target=|goto=|out=)"),
    ("secrets", r"(key|secret|token|password|auth|access_key|api_key)"),
    ("login", r"(login|signin|auth|sso|register)"),
    ("admin", r"(admin|dashboard|panel|root)"),
    ("api", r"(/api/|v1|graphql|swagger)"),
    ("upload", r"(upload|import|resume)"),
    ("debug", r"(test|dev|uat|staging)"),
    ("backup", r"(\.bak|\.old|\.zip|\.sql)"),
    ("config", r"(\.xml|\.json|\.yaml|\.conf)"),
    ("docs", r"(\.pdf|\.xls|\.docx)"),
];

static URL_TAGS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(URL_PATTERNS.iter().map(|(_, p)| format!("(?i){p}")))
        .expect("built-in url patterns compile")
});

/// Classifies a URL into interest buckets (`sqli`, `admin`, ...) so later
/// stages can pick candidate URLs. Returned tags are sorted.
pub fn tag_url(url: &str) -> Vec<String> {
    let mut tags: Vec<String> = URL_TAGS
        .matches(url)
        .into_iter()
        .map(|i| URL_PATTERNS[i].0.to_string())
        .collect();
    tags.sort();
    tags
}

#[cfg(test)]
mod tests {
    use super::tag_url;

    #[test]
    fn query_parameters_drive_injection_tags() {
        let tags = tag_url("https://shop.example.com/item?ID=4");
        assert!(tags.contains(&"sqli".to_string()));
        assert!(tags.contains(&"xss".to_string()));
        assert!(!tags.contains(&"lfi".to_string()));
    }

    #[test]
    fn plain_paths_get_structural_tags() {
        assert_eq!(tag_url("https://example.com/backup.zip"), vec!["backup"]);
        assert!(tag_url("https://example.com/").is_empty());
    }
}
