//! Bot API wire types. Only the fields the forwarder reads.

use std::collections::HashMap;

use serde::Deserialize;

use crate::rules::options::MessageKind;

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub channel_post: Option<TgMessage>,
    pub edited_channel_post: Option<TgMessage>,
}

impl Update {
    /// The carried message and whether it is an edit.
    pub fn into_message(self) -> Option<(TgMessage, bool)> {
        if let Some(m) = self.channel_post.or(self.message) {
            return Some((m, false));
        }
        self.edited_channel_post
            .or(self.edited_message)
            .map(|m| (m, true))
    }
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    /// UTF-16 code units.
    pub offset: usize,
    /// UTF-16 code units.
    pub length: usize,
    pub url: Option<String>,
    pub user: Option<EntityUser>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct MediaFile {
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub edit_date: Option<i64>,
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    pub caption: Option<String>,
    #[serde(default)]
    pub caption_entities: Vec<MessageEntity>,
    pub photo: Option<serde_json::Value>,
    pub video: Option<MediaFile>,
    pub document: Option<MediaFile>,
    pub audio: Option<MediaFile>,
    pub voice: Option<MediaFile>,
    pub animation: Option<MediaFile>,
    pub sticker: Option<serde_json::Value>,
    #[serde(flatten)]
    pub rest: HashMap<String, serde_json::Value>,
}

/// Fields whose presence marks a service message.
const SERVICE_FIELDS: &[&str] = &[
    "new_chat_members",
    "left_chat_member",
    "new_chat_title",
    "new_chat_photo",
    "delete_chat_photo",
    "group_chat_created",
    "supergroup_chat_created",
    "channel_chat_created",
    "message_auto_delete_timer_changed",
    "migrate_to_chat_id",
    "migrate_from_chat_id",
    "pinned_message",
    "forum_topic_created",
    "forum_topic_edited",
    "forum_topic_closed",
    "forum_topic_reopened",
    "video_chat_scheduled",
    "video_chat_started",
    "video_chat_ended",
    "video_chat_participants_invited",
    "boost_added",
];

impl TgMessage {
    pub fn is_service(&self) -> bool {
        SERVICE_FIELDS.iter().any(|f| self.rest.contains_key(*f))
    }

    /// Kind and declared MIME type. Animations also carry a `document`, so
    /// they are checked first.
    pub fn kind(&self) -> (MessageKind, Option<&str>) {
        fn mime(f: &Option<MediaFile>) -> Option<&str> {
            f.as_ref().and_then(|m| m.mime_type.as_deref())
        }
        if self.animation.is_some() {
            (MessageKind::Animation, mime(&self.animation))
        } else if self.photo.is_some() {
            (MessageKind::Photo, Some("image/jpeg"))
        } else if self.video.is_some() {
            (MessageKind::Video, mime(&self.video))
        } else if self.audio.is_some() {
            (MessageKind::Audio, mime(&self.audio))
        } else if self.voice.is_some() {
            (MessageKind::Voice, mime(&self.voice))
        } else if self.document.is_some() {
            (MessageKind::Document, mime(&self.document))
        } else if self.sticker.is_some() {
            (MessageKind::Sticker, None)
        } else if self.text.is_some() {
            (MessageKind::Text, None)
        } else {
            (MessageKind::Other, None)
        }
    }

    /// Text or caption, with its entities.
    pub fn body(&self) -> (&str, &[MessageEntity]) {
        match (&self.text, &self.caption) {
            (Some(text), _) => (text, &self.entities),
            (None, Some(caption)) => (caption, &self.caption_entities),
            (None, None) => ("", &[]),
        }
    }
}
