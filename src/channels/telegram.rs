//! Telegram transport: the Bot API over HTTPS.
//!
//! Ingest: a long-poll loop reads `getUpdates`, converts each post into a
//! `MessageView`, keeps it in a bounded recent-message cache and enqueues a
//! forwarding job. `fetch_message` is served from that cache, since the Bot
//! API cannot read arbitrary channel history.
//!
//! Delivery maps an `OutgoingMessage` to one Bot API call per target:
//! - unmodified, nothing to hide → `forwardMessage`
//! - text → `sendMessage` (split at 4096 characters)
//! - media and everything else → `copyMessage`, caption = edited text

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::telegram_entities::{has_styling, render_html};
use crate::channels::telegram_types::{ApiResponse, TgMessage, Update};
use crate::error::{ChannelError, QueueError};
use crate::pipeline::cancel::CancelSignal;
use crate::pipeline::types::{MessageTransport, MessageView, OutgoingMessage, TextFormat};
use crate::rules::options::MessageKind;
use crate::worker::queue::ForwardQueue;

/// Maximum message length for Telegram's sendMessage API.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Bounded map of recently seen messages; oldest entries are evicted first.
struct RecentMessages {
    capacity: usize,
    order: VecDeque<(i64, i64)>,
    messages: HashMap<(i64, i64), MessageView>,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            messages: HashMap::new(),
        }
    }

    /// Insert or overwrite (edits replace the stored view in place).
    fn insert(&mut self, view: MessageView) {
        let key = (view.channel_id, view.message_id);
        if self.messages.insert(key, view).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.messages.remove(&old);
            }
        }
    }

    fn get(&self, channel_id: i64, message_id: i64) -> Option<MessageView> {
        self.messages.get(&(channel_id, message_id)).cloned()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    cache: Mutex<RecentMessages>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString, cache_size: usize) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            cache: Mutex::new(RecentMessages::new(cache_size)),
        }
    }

    /// Point the transport at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token.expose_secret())
    }

    fn cache(&self) -> MutexGuard<'_, RecentMessages> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of messages currently held for `fetch_message`.
    pub fn cached_messages(&self) -> usize {
        self.cache().len()
    }

    /// Record an update's message in the cache. Returns the view when the
    /// update carried a message.
    pub fn ingest(&self, update: Update) -> Option<MessageView> {
        let (message, edited) = update.into_message()?;
        let view = message_view(&message, edited);
        debug!(
            channel_id = view.channel_id,
            message_id = view.message_id,
            kind = %view.kind,
            edited = view.is_edited,
            "Telegram message ingested"
        );
        self.cache().insert(view.clone());
        Some(view)
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value, timeout: Option<Duration>) -> Result<Value, ChannelError> {
        let mut request = self.client.post(self.api_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {}", e.without_url())))?;

        let status = resp.status();
        let parsed: ApiResponse<Value> = resp.json().await.map_err(|e| {
            ChannelError::Http(format!("{method}: unreadable response ({status}): {}", e.without_url()))
        })?;

        if parsed.ok {
            return Ok(parsed.result.unwrap_or(Value::Null));
        }
        if parsed.error_code == Some(429) {
            let retry_after = parsed.parameters.and_then(|p| p.retry_after);
            warn!(method, ?retry_after, "Telegram rate limit hit");
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
            });
        }
        Err(ChannelError::SendFailed {
            name: "telegram".into(),
            reason: format!(
                "{method}: {}",
                parsed.description.unwrap_or_else(|| status.to_string())
            ),
        })
    }

    /// One `getUpdates` long poll. Each entry is the update id and the
    /// update, or `None` when it could not be parsed.
    pub async fn poll_updates(
        &self,
        offset: i64,
        timeout: Duration,
    ) -> Result<Vec<(i64, Option<Update>)>, ChannelError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "edited_message", "channel_post", "edited_channel_post"],
        });
        let result = self
            .call("getUpdates", &body, Some(timeout + Duration::from_secs(10)))
            .await
            .map_err(|e| ChannelError::FetchFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        let Value::Array(raw) = result else {
            return Ok(Vec::new());
        };
        Ok(raw
            .into_iter()
            .filter_map(|value| {
                let update_id = value.get("update_id").and_then(Value::as_i64)?;
                match serde_json::from_value::<Update>(value) {
                    Ok(update) => Some((update_id, Some(update))),
                    Err(e) => {
                        warn!(update_id, error = %e, "Skipping unparseable Telegram update");
                        Some((update_id, None))
                    }
                }
            })
            .collect())
    }
}

#[async_trait]
impl MessageTransport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn fetch_message(&self, channel_id: i64, message_id: i64) -> Result<Option<MessageView>, ChannelError> {
        Ok(self.cache().get(channel_id, message_id))
    }

    async fn send_message(&self, target: i64, message: &OutgoingMessage) -> Result<(), ChannelError> {
        for (method, body) in build_requests(target, message) {
            self.call(method, &body, None).await?;
        }
        Ok(())
    }
}

// ── Conversions ─────────────────────────────────────────────────────

/// Convert a Bot API message into the pipeline's view of it.
pub fn message_view(message: &TgMessage, edited: bool) -> MessageView {
    let (text, entities) = message.body();
    let (kind, mime_type) = message.kind();
    MessageView {
        channel_id: message.chat.id,
        message_id: message.message_id,
        text: text.to_string(),
        html: has_styling(entities).then(|| render_html(text, entities)),
        kind,
        mime_type: mime_type.map(str::to_ascii_lowercase),
        sender_id: message.from.as_ref().map(|u| u.id),
        is_edited: edited || message.edit_date.is_some(),
        is_service_message: message.is_service(),
        received_at: Utc::now(),
    }
}

fn accepts_caption(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Photo
            | MessageKind::Video
            | MessageKind::Document
            | MessageKind::Audio
            | MessageKind::Voice
            | MessageKind::Animation
    )
}

/// The Bot API calls that deliver `message` to `target`, in order.
pub fn build_requests(target: i64, message: &OutgoingMessage) -> Vec<(&'static str, Value)> {
    let flags = message.flags;
    let hides_caption = flags.drop_media_captions && accepts_caption(message.kind);
    let native = !message.modified
        && !flags.remove_source_forward_header
        && !flags.drop_author
        && !hides_caption;

    if native {
        return vec![(
            "forwardMessage",
            json!({
                "chat_id": target,
                "from_chat_id": message.source_channel_id,
                "message_id": message.source_message_id,
                "protect_content": flags.no_forwards,
            }),
        )];
    }

    if message.kind != MessageKind::Text {
        let mut body = json!({
            "chat_id": target,
            "from_chat_id": message.source_channel_id,
            "message_id": message.source_message_id,
            "protect_content": flags.no_forwards,
        });
        if hides_caption {
            body["caption"] = json!("");
        } else if accepts_caption(message.kind) {
            body["caption"] = json!(message.text);
            if message.format == TextFormat::Html {
                body["parse_mode"] = json!("HTML");
            }
        }
        return vec![("copyMessage", body)];
    }

    let (text, format) = if message.format == TextFormat::Html
        && message.text.chars().count() > TELEGRAM_MAX_MESSAGE_LENGTH
    {
        // Split chunks could cut through tags; long HTML bodies go out as plain text.
        (html_to_plain(&message.text), TextFormat::Plain)
    } else {
        (message.text.clone(), message.format)
    };

    split_message(&text, TELEGRAM_MAX_MESSAGE_LENGTH)
        .into_iter()
        .map(|chunk| {
            let mut body = json!({
                "chat_id": target,
                "text": chunk,
                "protect_content": flags.no_forwards,
            });
            if format == TextFormat::Html {
                body["parse_mode"] = json!("HTML");
            }
            ("sendMessage", body)
        })
        .collect()
}

/// Drop tags and decode the entities `escape_html` produces.
fn html_to_plain(html: &str) -> String {
    TAG_RE
        .replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Split a message into chunks of at most `max_chars` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let Some((cut, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..cut];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

// ── Poller ──────────────────────────────────────────────────────────

/// Spawn the `getUpdates` loop. Every ingested message is enqueued for
/// forwarding. Stops on `cancel` or when the queue closes.
pub fn spawn_update_poller(
    transport: Arc<TelegramTransport>,
    queue: ForwardQueue,
    poll_timeout: Duration,
    cancel: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset: i64 = 0;
        info!("Telegram poller listening for updates...");

        loop {
            let batch = tokio::select! {
                r = transport.poll_updates(offset, poll_timeout) => r,
                _ = cancel.cancelled() => break,
            };

            let updates = match batch {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Telegram poll error");
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            for (update_id, update) in updates {
                offset = offset.max(update_id + 1);
                let Some(view) = update.and_then(|u| transport.ingest(u)) else {
                    continue;
                };
                match queue.try_enqueue(view.channel_id, view.message_id) {
                    Ok(job_id) => debug!(%job_id, "Forward job queued from Telegram update"),
                    Err(QueueError::Full) => warn!(
                        channel_id = view.channel_id,
                        message_id = view.message_id,
                        "Job queue full, dropping Telegram update"
                    ),
                    Err(QueueError::Closed) => {
                        info!("Job queue closed, Telegram poller stopping");
                        return;
                    }
                }
            }
        }
        info!("Telegram poller stopped");
    })
}

// ── Tests ───────────────────────────────────────────────────────────
