use serde::{Deserialize, Serialize};

/// A journal chat document as received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalChatState {
    pub uid: String,
    /// Integrity hash the server computed over `data`.
    pub integrity: String,
    pub data: Vec<JournalEntryItem>,
    #[serde(default)]
    pub transient: Option<TransientHint>,
}

impl JournalChatState {
    /// Empty document for an entry, with its integrity already filled in.
    pub fn empty(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            integrity: super::integrity::hash_items(&[]),
            data: Vec::new(),
            transient: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransientHint {
    ThinkingBar {
        at: f64,
        of: f64,
        message: String,
        #[serde(default)]
        detail: Option<String>,
    },
    ThinkingSpinner {
        message: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryItem {
    pub data: EntryItemData,
    pub display_author: DisplayAuthor,
    #[serde(rename = "type")]
    pub kind: EntryItemKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayAuthor {
    #[serde(rename = "self")]
    Myself,
    Other,
}

impl DisplayAuthor {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayAuthor::Myself => "self",
            DisplayAuthor::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryItemKind {
    Chat,
    ReflectionQuestion,
    ReflectionResponse,
    Ui,
    Summary,
}

impl EntryItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryItemKind::Chat => "chat",
            EntryItemKind::ReflectionQuestion => "reflection-question",
            EntryItemKind::ReflectionResponse => "reflection-response",
            EntryItemKind::Ui => "ui",
            EntryItemKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryItemData {
    Textual {
        parts: Vec<TextualPart>,
    },
    Ui {
        conceptually: UiConceptual,
        flow: UiFlow,
    },
    Summary {
        tags: Vec<String>,
        title: String,
        version: SummaryVersion,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryVersion {
    #[serde(rename = "v1")]
    V1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextualPart {
    Journey {
        details: JourneyDetails,
        uid: String,
    },
    Paragraph {
        value: String,
    },
    VoiceNote {
        transcription: TranscriptApi,
        voice_note_jwt: String,
        voice_note_uid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub uid: String,
    pub jwt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructor {
    pub name: String,
    #[serde(default)]
    pub image: Option<ImageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JourneyAccess {
    Free,
    PaidRequiresUpgrade,
    PaidUnlocked,
}

impl JourneyAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyAccess::Free => "free",
            JourneyAccess::PaidRequiresUpgrade => "paid-requires-upgrade",
            JourneyAccess::PaidUnlocked => "paid-unlocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyDetails {
    pub uid: String,
    pub title: String,
    pub description: String,
    pub darkened_background: ImageRef,
    pub duration_seconds: f64,
    pub instructor: Instructor,
    #[serde(default)]
    pub last_taken_at: Option<f64>,
    #[serde(default)]
    pub liked_at: Option<f64>,
    pub access: JourneyAccess,
}

/// Transcript as it travels inside chat documents and encrypted payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptApi {
    pub uid: String,
    pub phrases: Vec<TranscriptPhraseApi>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptPhraseApi {
    pub starts_at: f64,
    pub ends_at: f64,
    pub phrase: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiConceptual {
    UserJourney {
        journey_uid: String,
        user_journey_uid: String,
    },
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiFlow {
    pub slug: String,
}
