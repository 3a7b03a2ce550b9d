//! Landing document returned by the callback.
//!
//! The session cookie rides on this `200` response. Navigation to the
//! landing page happens afterwards, in a request the browser issues once the
//! cookie is stored.

use url::Url;

/// Delay before the document navigates away.
pub(super) const NAVIGATION_DELAY_MS: u64 = 100;

pub(super) fn landing_document(landing: &Url) -> String {
    let href = escape_html(landing.as_str());
    let target = script_string(landing.as_str());

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex">
<title>Signing in</title>
</head>
<body>
<p>Signing you in&hellip;</p>
<noscript><p><a href="{href}">Continue</a></p></noscript>
<script>
setTimeout(function () {{ window.location.replace({target}); }}, {NAVIGATION_DELAY_MS});
</script>
</body>
</html>
"#
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

// JSON string literal that cannot close the surrounding <script> element.
fn script_string(raw: &str) -> String {
    serde_json::Value::from(raw)
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}
