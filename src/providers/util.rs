use reqwest::Client;
use tracing::debug;

/// GETs `url` and returns the body of a successful response. Transport
/// errors, timeouts and non-success statuses all yield `None`.
pub async fn fetch_text(client: &Client, url: &str) -> Option<String> {
    debug!("Requesting {}", url);
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!("Request to {} failed: {}", url, e);
            return None;
        }
    };
    if !response.status().is_success() {
        debug!("Request to {} returned {}", url, response.status());
        return None;
    }
    match response.text().await {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("Failed reading body from {}: {}", url, e);
            None
        }
    }
}

/// The raw right-hand side of `var <name> = <value>;` in a script, trimmed.
/// The value ends at the first `;` after the assignment.
pub fn extract_js_var<'a>(script: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = script;
    while let Some(pos) = rest.find("var") {
        let after_var = &rest[pos + 3..];
        rest = after_var;
        let declared = after_var.trim_start();
        if declared.len() == after_var.len() {
            // `var` was part of a longer identifier
            continue;
        }
        let Some(tail) = declared.strip_prefix(name) else {
            continue;
        };
        let Some(value) = tail.trim_start().strip_prefix('=') else {
            continue;
        };
        let end = value.find(';')?;
        return Some(value[..end].trim());
    }
    None
}

/// Unquotes a JavaScript string literal in single or double quotes.
pub fn js_string(raw: &str) -> Option<String> {
    let raw = raw.trim();
    ['"', '\'']
        .into_iter()
        .find_map(|quote| raw.strip_prefix(quote)?.strip_suffix(quote))
        .map(|s| s.trim().to_string())
}
