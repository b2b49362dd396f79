use base64::Engine;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_TEMPLATE: &str = include_str!("template.pac");

const BASE_MARKER: &str = "__BASE_RULES__";
const USER_MARKER: &str = "__USER_RULES__";
pub const HTTP_PORT_MARKER: &str = "__HTTP__PORT__";
pub const SOCKS_PORT_MARKER: &str = "__SOCKS5__PORT__";

/// Turns a block-list and the user's override rules into a PAC script body.
///
/// The output still carries the port placeholders; [`render_with_ports`] fills them in.
#[derive(Clone, Debug)]
pub struct PacDocumentBuilder {
    template: String,
}

impl Default for PacDocumentBuilder {
    fn default() -> Self {
        Self { template: DEFAULT_TEMPLATE.to_string() }
    }
}

impl PacDocumentBuilder {
    pub fn with_template(template: impl Into<String>) -> CoreResult<Self> {
        let template = template.into();
        for marker in [BASE_MARKER, USER_MARKER] {
            if !template.contains(marker) {
                return Err(CoreError::Pac(format!("PAC template is missing {}", marker)));
            }
        }
        Ok(Self { template })
    }

    pub fn build(&self, base_list_text: &str, user_rules_text: &str) -> CoreResult<String> {
        let decoded = decode_block_list(base_list_text);
        let base = serde_json::to_string_pretty(&block_list_rules(&decoded))?;
        let user = serde_json::to_string_pretty(&user_rule_lines(user_rules_text))?;

        // split rather than replace so rule text can never be mistaken for a marker
        let (head, rest) = self
            .template
            .split_once(BASE_MARKER)
            .ok_or_else(|| CoreError::Pac(format!("PAC template is missing {}", BASE_MARKER)))?;
        let (middle, tail) = rest
            .split_once(USER_MARKER)
            .ok_or_else(|| CoreError::Pac(format!("PAC template is missing {} after {}", USER_MARKER, BASE_MARKER)))?;

        Ok(format!("{head}{base}{middle}{user}{tail}"))
    }
}

pub fn render_with_ports(body: &str, http_port: u16, socks_port: u16) -> String {
    body.replace(HTTP_PORT_MARKER, &http_port.to_string())
        .replace(SOCKS_PORT_MARKER, &socks_port.to_string())
}

/// Upstream block-lists are distributed base64 encoded; plain text passes through untouched.
pub fn decode_block_list(text: &str) -> String {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return String::new();
    }
    match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(decoded) if decoded.contains('\n') || decoded.starts_with('[') => decoded,
            _ => text.to_string(),
        },
        Err(_) => text.to_string(),
    }
}

fn block_list_rules(text: &str) -> Vec<&str> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!') && !line.starts_with('['))
        .collect()
}

fn user_rule_lines(text: &str) -> Vec<&str> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('!'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "[AutoProxy 0.2.9]\n! comment\n||google.com\n|http://example.org\n\n@@||cn.example.com\n";

    fn base_layer(script: &str) -> &str {
        let start = script.find("var baseRules").unwrap();
        let end = script.find("var userRules").unwrap();
        &script[start..end]
    }

    #[test]
    fn build_is_idempotent() {
        let b = PacDocumentBuilder::default();
        let one = b.build(BASE, "||mysite.io").unwrap();
        let two = b.build(BASE, "||mysite.io").unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn user_rules_only_change_override_layer() {
        let b = PacDocumentBuilder::default();
        let first = b.build(BASE, "||a.io").unwrap();
        let second = b.build(BASE, "||b.io\n||c.io").unwrap();
        assert_ne!(first, second);
        assert_eq!(base_layer(&first), base_layer(&second));
        assert!(second.contains("\"||b.io\""));
        assert!(!second.contains("\"||a.io\""));
    }

    #[test]
    fn comments_and_headers_are_dropped() {
        let b = PacDocumentBuilder::default();
        let script = b.build(BASE, "! note\n||mine.dev").unwrap();
        let base = base_layer(&script);
        assert!(base.contains("\"||google.com\""));
        assert!(base.contains("\"@@||cn.example.com\""));
        assert!(!base.contains("AutoProxy"));
        assert!(!script.contains("! comment"));
        assert!(!script.contains("! note"));
    }

    #[test]
    fn base64_block_list_is_decoded() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(BASE);
        let wrapped: String = encoded
            .as_bytes()
            .chunks(20)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(decode_block_list(&wrapped), BASE);
    }

    #[test]
    fn plain_block_list_passes_through() {
        assert_eq!(decode_block_list("||google.com\n"), "||google.com\n");
    }

    #[test]
    fn ports_are_substituted() {
        let script = PacDocumentBuilder::default().build(BASE, "").unwrap();
        assert!(script.contains(HTTP_PORT_MARKER));
        let rendered = render_with_ports(&script, 10871, 10801);
        assert!(rendered.contains("PROXY 127.0.0.1:10871"));
        assert!(rendered.contains("SOCKS5 127.0.0.1:10801"));
        assert!(!rendered.contains(SOCKS_PORT_MARKER));
    }

    #[test]
    fn template_without_markers_is_rejected() {
        assert!(matches!(PacDocumentBuilder::with_template("function FindProxyForURL() {}"), Err(CoreError::Pac(_))));
    }

    #[test]
    fn marker_text_inside_rules_is_kept_literal() {
        let script = PacDocumentBuilder::default().build("||x.com", "__USER_RULES__").unwrap();
        assert!(script.contains("\"__USER_RULES__\""));
    }
}
