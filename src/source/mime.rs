//! MIME part tree and body extraction shared by every message source.

use serde::{Deserialize, Serialize};

/// Separator placed between concatenated text parts.
const PART_SEPARATOR: &str = "\n";

/// One node of a decoded MIME structure.
///
/// `data` holds the already transfer-decoded bytes of a leaf; container
/// parts (`multipart/*`) carry children in `parts` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimePart {
    pub mime_type: String,
    pub data: Option<Vec<u8>>,
    pub parts: Vec<MimePart>,
}

impl MimePart {
    pub fn leaf(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: Some(data.into()),
            parts: Vec::new(),
        }
    }

    pub fn multipart(mime_type: impl Into<String>, parts: Vec<MimePart>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: None,
            parts,
        }
    }

    fn is_text(&self) -> bool {
        let ty = self.mime_type.to_ascii_lowercase();
        ty == "text/plain" || ty == "text/html"
    }

    fn decoded(&self) -> Option<String> {
        self.data
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

/// Extract the readable body of a message.
///
/// A message without parts decodes its single top-level body whatever its
/// type. Otherwise every `text/plain` and `text/html` leaf is concatenated in
/// document order. Alternative renderings of the same content are all kept.
pub fn extract_body(root: &MimePart) -> String {
    if root.parts.is_empty() {
        return root.decoded().unwrap_or_default();
    }
    let mut chunks = Vec::new();
    collect_text_parts(root, &mut chunks);
    chunks.join(PART_SEPARATOR)
}

fn collect_text_parts(part: &MimePart, out: &mut Vec<String>) {
    for child in &part.parts {
        if !child.parts.is_empty() {
            collect_text_parts(child, out);
        } else if child.is_text()
            && let Some(text) = child.decoded()
        {
            out.push(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_message_decodes_top_level_body() {
        let root = MimePart::leaf("text/html", "<p>Hello</p>");
        assert_eq!(extract_body(&root), "<p>Hello</p>");
    }

    #[test]
    fn single_part_of_any_type_is_decoded() {
        let root = MimePart::leaf("application/octet-stream", "raw");
        assert_eq!(extract_body(&root), "raw");
    }

    #[test]
    fn alternative_renderings_are_both_kept() {
        let root = MimePart::multipart(
            "multipart/alternative",
            vec![
                MimePart::leaf("text/plain", "Big news today"),
                MimePart::leaf("text/html", "<p>Big news today</p>"),
            ],
        );
        assert_eq!(
            extract_body(&root),
            "Big news today\n<p>Big news today</p>"
        );
    }

    #[test]
    fn nested_parts_walked_in_document_order() {
        let root = MimePart::multipart(
            "multipart/mixed",
            vec![
                MimePart::multipart(
                    "multipart/alternative",
                    vec![
                        MimePart::leaf("text/plain", "first"),
                        MimePart::leaf("text/html", "<b>second</b>"),
                    ],
                ),
                MimePart::leaf("image/png", vec![0x89, 0x50]),
                MimePart::leaf("TEXT/PLAIN", "third"),
            ],
        );
        assert_eq!(extract_body(&root), "first\n<b>second</b>\nthird");
    }

    #[test]
    fn parts_without_body_contribute_nothing() {
        let root = MimePart::multipart(
            "multipart/alternative",
            vec![
                MimePart {
                    mime_type: "text/plain".into(),
                    data: None,
                    parts: vec![],
                },
                MimePart::leaf("text/html", ""),
                MimePart::leaf("text/html", "<p>kept</p>"),
            ],
        );
        assert_eq!(extract_body(&root), "<p>kept</p>");
    }

    #[test]
    fn invalid_utf8_is_decoded_lossily() {
        let root = MimePart::leaf("text/plain", vec![b'o', b'k', 0xff]);
        assert!(extract_body(&root).starts_with("ok"));
    }
}
