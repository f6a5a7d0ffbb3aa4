//! Stable hash of a chat document's entry list.
//!
//! The serialization mirrors what the server hashes: keys in sorted order,
//! `", "` and `": "` separators, absent optional keys omitted, and floating
//! point fields always printed with three decimals. It exists to catch
//! mistakes applying mutations, not to authenticate anything.

use super::state::{
    EntryItemData, JournalEntryItem, JourneyDetails, TextualPart, TranscriptApi, UiConceptual,
};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the canonical dump of `items`.
pub fn hash_items(items: &[JournalEntryItem]) -> String {
    let dumped = dump_items(items);
    hex::encode(Sha256::digest(dumped.as_bytes()))
}

pub fn dump_items(items: &[JournalEntryItem]) -> String {
    let mut out = String::from("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        dump_item(&mut out, item);
    }
    out.push(']');
    out
}

fn float(out: &mut String, v: f64) {
    out.push_str(&format!("{:.3}", v));
}

fn string(out: &mut String, v: &str) {
    match serde_json::to_string(v) {
        Ok(s) => out.push_str(&s),
        Err(_) => out.push_str("\"\""),
    }
}

fn key(out: &mut String, name: &str) {
    out.push('"');
    out.push_str(name);
    out.push_str("\": ");
}

fn dump_item(out: &mut String, item: &JournalEntryItem) {
    out.push('{');
    key(out, "data");
    dump_data(out, &item.data);
    out.push_str(", ");
    key(out, "display_author");
    string(out, item.display_author.as_str());
    out.push_str(", ");
    key(out, "type");
    string(out, item.kind.as_str());
    out.push('}');
}

fn dump_data(out: &mut String, data: &EntryItemData) {
    match data {
        EntryItemData::Textual { parts } => {
            out.push('{');
            key(out, "parts");
            out.push('[');
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                dump_part(out, part);
            }
            out.push_str("], \"type\": \"textual\"}");
        }
        EntryItemData::Ui { conceptually, flow } => {
            out.push('{');
            key(out, "conceptually");
            match conceptually {
                UiConceptual::UserJourney {
                    journey_uid,
                    user_journey_uid,
                } => {
                    out.push('{');
                    key(out, "journey_uid");
                    string(out, journey_uid);
                    out.push_str(", \"type\": \"user_journey\", ");
                    key(out, "user_journey_uid");
                    string(out, user_journey_uid);
                    out.push('}');
                }
                UiConceptual::Upgrade => out.push_str("{\"type\": \"upgrade\"}"),
            }
            out.push_str(", ");
            key(out, "flow");
            out.push('{');
            key(out, "slug");
            string(out, &flow.slug);
            out.push_str("}, \"type\": \"ui\"}");
        }
        EntryItemData::Summary { tags, title, .. } => {
            out.push('{');
            key(out, "tags");
            out.push('[');
            for (i, tag) in tags.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                string(out, tag);
            }
            out.push_str("], ");
            key(out, "title");
            string(out, title);
            out.push_str(", \"type\": \"summary\", \"version\": \"v1\"}");
        }
    }
}

fn dump_part(out: &mut String, part: &TextualPart) {
    match part {
        TextualPart::Journey { details, uid } => {
            out.push('{');
            key(out, "details");
            dump_journey(out, details);
            out.push_str(", \"type\": \"journey\", ");
            key(out, "uid");
            string(out, uid);
            out.push('}');
        }
        TextualPart::Paragraph { value } => {
            out.push_str("{\"type\": \"paragraph\", ");
            key(out, "value");
            string(out, value);
            out.push('}');
        }
        TextualPart::VoiceNote {
            transcription,
            voice_note_jwt,
            voice_note_uid,
        } => {
            out.push('{');
            key(out, "transcription");
            dump_transcript(out, transcription);
            out.push_str(", \"type\": \"voice_note\", ");
            key(out, "voice_note_jwt");
            string(out, voice_note_jwt);
            out.push_str(", ");
            key(out, "voice_note_uid");
            string(out, voice_note_uid);
            out.push('}');
        }
    }
}

fn dump_journey(out: &mut String, d: &JourneyDetails) {
    out.push('{');
    key(out, "access");
    string(out, d.access.as_str());
    out.push_str(", ");
    key(out, "darkened_background");
    out.push('{');
    key(out, "jwt");
    string(out, &d.darkened_background.jwt);
    out.push_str(", ");
    key(out, "uid");
    string(out, &d.darkened_background.uid);
    out.push_str("}, ");
    key(out, "description");
    string(out, &d.description);
    out.push_str(", ");
    key(out, "duration_seconds");
    float(out, d.duration_seconds);
    out.push_str(", ");
    key(out, "instructor");
    out.push('{');
    if let Some(image) = &d.instructor.image {
        key(out, "image");
        out.push('{');
        key(out, "jwt");
        string(out, &image.jwt);
        out.push_str(", ");
        key(out, "uid");
        string(out, &image.uid);
        out.push_str("}, ");
    }
    key(out, "name");
    string(out, &d.instructor.name);
    out.push('}');
    if let Some(at) = d.last_taken_at {
        out.push_str(", ");
        key(out, "last_taken_at");
        float(out, at);
    }
    if let Some(at) = d.liked_at {
        out.push_str(", ");
        key(out, "liked_at");
        float(out, at);
    }
    out.push_str(", ");
    key(out, "title");
    string(out, &d.title);
    out.push_str(", ");
    key(out, "uid");
    string(out, &d.uid);
    out.push('}');
}

fn dump_transcript(out: &mut String, t: &TranscriptApi) {
    out.push('{');
    key(out, "phrases");
    out.push('[');
    for (i, p) in t.phrases.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('{');
        key(out, "ends_at");
        float(out, p.ends_at);
        out.push_str(", ");
        key(out, "phrase");
        string(out, &p.phrase);
        out.push_str(", ");
        key(out, "starts_at");
        float(out, p.starts_at);
        out.push('}');
    }
    out.push_str("], ");
    key(out, "uid");
    string(out, &t.uid);
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::state::*;

    fn paragraph(author: DisplayAuthor, text: &str) -> JournalEntryItem {
        JournalEntryItem {
            data: EntryItemData::Textual {
                parts: vec![TextualPart::Paragraph { value: text.into() }],
            },
            display_author: author,
            kind: EntryItemKind::Chat,
        }
    }

    #[test]
    fn empty_list_hashes_brackets() {
        assert_eq!(dump_items(&[]), "[]");
        assert_eq!(
            hash_items(&[]),
            "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945"
        );
    }

    #[test]
    fn paragraph_dump_is_sorted_and_spaced() {
        let dumped = dump_items(&[paragraph(DisplayAuthor::Other, "Hi \"there\"")]);
        assert_eq!(
            dumped,
            r#"[{"data": {"parts": [{"type": "paragraph", "value": "Hi \"there\""}], "type": "textual"}, "display_author": "other", "type": "chat"}]"#
        );
    }

    #[test]
    fn floats_have_three_decimals_and_optionals_are_omitted() {
        let journey = JournalEntryItem {
            data: EntryItemData::Textual {
                parts: vec![TextualPart::Journey {
                    uid: "j1".into(),
                    details: JourneyDetails {
                        uid: "j1".into(),
                        title: "Breathe".into(),
                        description: "Slow".into(),
                        darkened_background: ImageRef {
                            uid: "img".into(),
                            jwt: "ij".into(),
                        },
                        duration_seconds: 65.0,
                        instructor: Instructor {
                            name: "Ann".into(),
                            image: None,
                        },
                        last_taken_at: None,
                        liked_at: Some(1.23456),
                        access: JourneyAccess::Free,
                    },
                }],
            },
            display_author: DisplayAuthor::Other,
            kind: EntryItemKind::Chat,
        };
        let dumped = dump_items(&[journey]);
        assert!(dumped.contains(r#""duration_seconds": 65.000, "instructor": {"name": "Ann"}, "liked_at": 1.235, "title""#), "{}", dumped);
        assert!(!dumped.contains("last_taken_at"));
    }

    #[test]
    fn order_matters() {
        let a = paragraph(DisplayAuthor::Myself, "a");
        let b = paragraph(DisplayAuthor::Other, "b");
        assert_ne!(hash_items(&[a.clone(), b.clone()]), hash_items(&[b, a]));
    }

    #[test]
    fn non_ascii_is_kept_verbatim() {
        let dumped = dump_items(&[paragraph(DisplayAuthor::Myself, "café")]);
        assert!(dumped.contains("café"));
    }
}
