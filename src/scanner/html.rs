use std::sync::LazyLock;

use regex::Regex;

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<table\b([^>]*)>(.*?)</table>"#).expect("valid regex")
});

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bclass\s*=\s*["']([^"']*)["']"#).expect("valid regex")
});

static TBODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<tbody\b[^>]*>(.*?)</tbody>").expect("valid regex")
});

static ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("valid regex")
});

static CELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<td\b[^>]*>(.*?)</td>").expect("valid regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Text cells of every body row of the tables carrying `class_name`
/// (`table.<class_name> tbody tr`). Header rows (`th` only) come back empty
/// and are dropped.
pub fn table_rows(html: &str, class_name: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for table in TABLE_RE.captures_iter(html) {
        let attrs = table.get(1).map_or("", |m| m.as_str());
        let has_class = CLASS_RE
            .captures(attrs)
            .and_then(|c| c.get(1))
            .is_some_and(|classes| classes.as_str().split_whitespace().any(|c| c == class_name));
        if !has_class {
            continue;
        }

        let inner = table.get(2).map_or("", |m| m.as_str());
        for body in TBODY_RE.captures_iter(inner) {
            let body = body.get(1).map_or("", |m| m.as_str());
            for row in ROW_RE.captures_iter(body) {
                let row = row.get(1).map_or("", |m| m.as_str());
                let cells: Vec<String> = CELL_RE
                    .captures_iter(row)
                    .map(|c| cell_text(c.get(1).map_or("", |m| m.as_str())))
                    .collect();
                if !cells.is_empty() {
                    rows.push(cells);
                }
            }
        }
    }
    rows
}

/// Visible text of a cell: tags removed, common entities decoded,
/// whitespace collapsed.
pub fn cell_text(fragment: &str) -> String {
    let text = TAG_RE.replace_all(fragment, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text("  <a href=\"/w/1\">Vice&nbsp;City</a>\n "), "Vice City");
        assert_eq!(cell_text("Rock &amp; Roll &lt;Live&gt;"), "Rock & Roll <Live>");
        assert_eq!(cell_text(""), "");
    }

    #[test]
    fn test_only_matching_table_body() {
        let html = r#"
            <table class="nav"><tbody><tr><td>skip me</td></tr></tbody></table>
            <table class="table results striped">
              <thead><tr><th>Title</th></tr></thead>
              <tbody>
                <tr><td>One</td><td>A</td></tr>
                <tr class="even"><td>Two</td><td>B</td></tr>
              </tbody>
            </table>
            <table class="resultsX"><tbody><tr><td>nope</td></tr></tbody></table>
        "#;
        let rows = table_rows(html, "results");
        assert_eq!(rows, vec![vec!["One", "A"], vec!["Two", "B"]]);
    }

    #[test]
    fn test_no_table() {
        assert!(table_rows("<html><body>No results</body></html>", "results").is_empty());
    }
}
