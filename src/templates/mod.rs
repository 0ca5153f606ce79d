//! HTML rendering seam.
//!
//! Page templating belongs to the surrounding server. The crawler gate asks a
//! [`TemplateRenderer`] for its two pages by name; [`BuiltinTemplates`]
//! provides plain, script-driven versions of both.

use serde_json::Value;

/// Challenge page: needs `challenge` (string) and `difficulty` (number).
pub const NOLLAMAS_CHALLENGE: &str = "nollamas_challenge";

/// Failure page: needs `message` (string).
pub const NOLLAMAS_FAILED: &str = "nollamas_failed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unknown template {0:?}")]
    UnknownTemplate(String),
    #[error("template {template:?} is missing field {field:?}")]
    MissingField {
        template: &'static str,
        field: &'static str,
    },
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, data: &Value) -> Result<String, RenderError>;
}

/// Self-contained pages with no external assets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, name: &str, data: &Value) -> Result<String, RenderError> {
        match name {
            NOLLAMAS_CHALLENGE => {
                let challenge = data
                    .get("challenge")
                    .and_then(Value::as_str)
                    .ok_or(RenderError::MissingField {
                        template: NOLLAMAS_CHALLENGE,
                        field: "challenge",
                    })?;
                let difficulty = data
                    .get("difficulty")
                    .and_then(Value::as_u64)
                    .ok_or(RenderError::MissingField {
                        template: NOLLAMAS_CHALLENGE,
                        field: "difficulty",
                    })?;
                Ok(challenge_page(&escape(challenge), difficulty))
            }
            NOLLAMAS_FAILED => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or(RenderError::MissingField {
                        template: NOLLAMAS_FAILED,
                        field: "message",
                    })?;
                Ok(failed_page(&escape(message)))
            }
            other => Err(RenderError::UnknownTemplate(other.to_string())),
        }
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn challenge_page(challenge: &str, difficulty: u64) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex, nofollow">
<title>Checking your browser</title>
</head>
<body>
<main id="nollamas" data-nollamas-challenge="{challenge}" data-nollamas-difficulty="{difficulty}">
<h1>Checking your browser</h1>
<p>This page needs a short computation before it loads. It should take a few seconds.</p>
<noscript><p>JavaScript is required to pass this check.</p></noscript>
</main>
<script>
(async () => {{
  const el = document.getElementById("nollamas");
  const challenge = el.dataset.nollamasChallenge;
  const prefix = "0".repeat(Number(el.dataset.nollamasDifficulty));
  const enc = new TextEncoder();
  for (let nonce = 0; ; nonce++) {{
    const buf = await crypto.subtle.digest("SHA-256", enc.encode(challenge + nonce));
    const hex = Array.from(new Uint8Array(buf), b => b.toString(16).padStart(2, "0")).join("");
    if (hex.startsWith(prefix)) {{
      await fetch(location.href, {{ headers: {{ "X-NoLLaMas-Solution": String(nonce) }}, credentials: "same-origin" }});
      location.reload();
      return;
    }}
  }}
}})();
</script>
</body>
</html>
"#
    )
}

fn failed_page(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex, nofollow">
<title>Check failed</title>
</head>
<body>
<main>
<h1>Check failed</h1>
<p>{message}</p>
<p><a href="">Reload the page</a> to try again.</p>
</main>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_challenge_page_embeds_values() {
        let html = BuiltinTemplates
            .render(
                NOLLAMAS_CHALLENGE,
                &json!({ "challenge": "abc123", "difficulty": 4 }),
            )
            .unwrap();
        assert!(html.contains(r#"data-nollamas-challenge="abc123""#));
        assert!(html.contains(r#"data-nollamas-difficulty="4""#));
    }

    #[test]
    fn test_values_are_escaped() {
        let html = BuiltinTemplates
            .render(NOLLAMAS_FAILED, &json!({ "message": "<b>nope</b>" }))
            .unwrap();
        assert!(html.contains("&lt;b&gt;nope&lt;/b&gt;"));
    }

    #[test]
    fn test_missing_field_and_unknown_template() {
        assert_eq!(
            BuiltinTemplates.render(NOLLAMAS_CHALLENGE, &json!({ "difficulty": 1 })),
            Err(RenderError::MissingField {
                template: NOLLAMAS_CHALLENGE,
                field: "challenge",
            })
        );
        assert_eq!(
            BuiltinTemplates.render("timeline", &json!({})),
            Err(RenderError::UnknownTemplate("timeline".into()))
        );
    }
}
