//! libSQL backend, async `RuleStore` implementation.
//!
//! One row per rule in `forwarding_rules`, text replacements in the ordered
//! child table `text_replacement_rules`. Rows are reassembled into a
//! `RuleDraft` and validated again on the way out, so a rule read back is
//! always a valid `ForwardingRule`.
//!
//! Writes run inside a transaction behind the write half of `gate`; reads
//! hold the read half. A reader therefore sees either the rule set before a
//! write or after it, never a half-written rule.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatabaseError, RuleError};
use crate::rules::codec::{decode_channel_ids, decode_list, encode_channel_ids, encode_list};
use crate::rules::draft::{EditOptionsDraft, FilterOptionsDraft, RuleDraft, TextReplacementDraft};
use crate::rules::model::ForwardingRule;
use crate::rules::options::RegexOptions;
use crate::rules::store::RuleStore;
use crate::store::migrations;

/// Column list for `forwarding_rules` reads. Indices are used by `row_to_draft`.
const RULE_COLUMNS: &str = "rule_name, is_enabled, source_channel_id, target_channel_ids, \
     EditOptions_PrependText, EditOptions_AppendText, EditOptions_RemoveSourceForwardHeader, \
     EditOptions_RemoveLinks, EditOptions_StripFormatting, EditOptions_CustomFooter, \
     EditOptions_DropAuthor, EditOptions_DropMediaCaptions, EditOptions_NoForwards, \
     FilterOptions_AllowedMessageTypes, FilterOptions_AllowedMimeTypes, FilterOptions_ContainsText, \
     FilterOptions_ContainsTextIsRegex, FilterOptions_ContainsTextRegexOptions, \
     FilterOptions_AllowedSenderUserIds, FilterOptions_BlockedSenderUserIds, \
     FilterOptions_IgnoreEditedMessages, FilterOptions_IgnoreServiceMessages, \
     FilterOptions_MinMessageLength, FilterOptions_MaxMessageLength";

/// libSQL-backed rule store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlRuleStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlRuleStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        })
    }

    /// Load rules matching `where_clause`, with their replacements, ordered by name.
    async fn load_rules(
        &self,
        where_clause: &str,
        args: Vec<Value>,
    ) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM forwarding_rules {where_clause} ORDER BY rule_name"),
                libsql::params::Params::Positional(args.clone()),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_rules: {e}")))?;

        let mut drafts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_rules: {e}")))?
        {
            drafts.push(row_to_draft(&row)?);
        }
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut replacements = self.load_replacements(where_clause, args).await?;
        drafts
            .into_iter()
            .map(|mut draft| {
                draft.edit_options.text_replacements =
                    replacements.remove(&draft.rule_name).unwrap_or_default();
                draft_to_rule(draft)
            })
            .collect()
    }

    /// Text replacements of the rules selected by `where_clause`, grouped by
    /// rule, each group in stored order.
    async fn load_replacements(
        &self,
        where_clause: &str,
        args: Vec<Value>,
    ) -> Result<HashMap<String, Vec<TextReplacementDraft>>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT rule_name, find, replace_with, is_regex, regex_options \
                     FROM text_replacement_rules \
                     WHERE rule_name IN (SELECT rule_name FROM forwarding_rules {where_clause}) \
                     ORDER BY rule_name, position"
                ),
                libsql::params::Params::Positional(args),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_replacements: {e}")))?;

        let mut grouped: HashMap<String, Vec<TextReplacementDraft>> = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_replacements: {e}")))?
        {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("load_replacements row parse: {e}"));
            let rule_name: String = row.get(0).map_err(parse)?;
            let draft = TextReplacementDraft {
                find: row.get(1).map_err(parse)?,
                replace_with: row.get(2).map_err(parse)?,
                is_regex: row.get::<i64>(3).map_err(parse)? != 0,
                regex_options: RegexOptions::from_bits(row.get(4).map_err(parse)?),
            };
            grouped.entry(rule_name).or_default().push(draft);
        }
        Ok(grouped)
    }

    async fn rule_exists(conn: &Connection, name: &str) -> Result<bool, DatabaseError> {
        let mut rows = conn
            .query("SELECT 1 FROM forwarding_rules WHERE rule_name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("rule_exists: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("rule_exists: {e}")))?;
        Ok(row.is_some())
    }

    async fn insert_replacements(
        conn: &Connection,
        draft: &RuleDraft,
    ) -> Result<(), DatabaseError> {
        for (position, r) in draft.edit_options.text_replacements.iter().enumerate() {
            conn.execute(
                "INSERT INTO text_replacement_rules \
                 (rule_name, position, find, replace_with, is_regex, regex_options) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.rule_name.as_str(),
                    position as i64,
                    r.find.as_str(),
                    r.replace_with.as_str(),
                    r.is_regex as i64,
                    r.regex_options.to_bits()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_replacement: {e}")))?;
        }
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn integer(value: Option<usize>) -> Value {
    match value {
        Some(n) => Value::Integer(n as i64),
        None => Value::Null,
    }
}

fn flag(value: bool) -> Value {
    Value::Integer(value as i64)
}

/// Values for every rule column after `rule_name`, in `RULE_COLUMNS` order.
fn rule_values(draft: &RuleDraft) -> Vec<Value> {
    let edit = &draft.edit_options;
    let filter = &draft.filter_options;
    vec![
        flag(draft.is_enabled),
        Value::Integer(draft.source_channel_id),
        Value::Text(encode_channel_ids(&draft.target_channel_ids)),
        text(&edit.prepend_text),
        text(&edit.append_text),
        flag(edit.remove_source_forward_header),
        flag(edit.remove_links),
        flag(edit.strip_formatting),
        text(&edit.custom_footer),
        flag(edit.drop_author),
        flag(edit.drop_media_captions),
        flag(edit.no_forwards),
        Value::Text(encode_list(&filter.allowed_message_types)),
        Value::Text(encode_list(&filter.allowed_mime_types)),
        text(&filter.contains_text),
        flag(filter.contains_text_is_regex),
        Value::Integer(filter.contains_text_regex_options.to_bits()),
        Value::Text(encode_list(&filter.allowed_sender_user_ids)),
        Value::Text(encode_list(&filter.blocked_sender_user_ids)),
        flag(filter.ignore_edited_messages),
        flag(filter.ignore_service_messages),
        integer(filter.min_message_length),
        integer(filter.max_message_length),
    ]
}

/// Map a `forwarding_rules` row to a draft without its text replacements.
///
/// Column order matches `RULE_COLUMNS`.
fn row_to_draft(row: &libsql::Row) -> Result<RuleDraft, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("rule row parse: {e}"));
    let get_flag = |i: i32| row.get::<i64>(i).map(|v| v != 0).map_err(parse);
    let get_text = |i: i32| row.get::<String>(i).map_err(parse);
    let get_length = |i: i32| row.get::<i64>(i).ok().map(|v| v.max(0) as usize);

    Ok(RuleDraft {
        rule_name: get_text(0)?,
        is_enabled: get_flag(1)?,
        source_channel_id: row.get(2).map_err(parse)?,
        target_channel_ids: decode_channel_ids(&get_text(3)?)?,
        edit_options: EditOptionsDraft {
            prepend_text: row.get::<String>(4).ok(),
            append_text: row.get::<String>(5).ok(),
            text_replacements: Vec::new(),
            remove_source_forward_header: get_flag(6)?,
            remove_links: get_flag(7)?,
            strip_formatting: get_flag(8)?,
            custom_footer: row.get::<String>(9).ok(),
            drop_author: get_flag(10)?,
            drop_media_captions: get_flag(11)?,
            no_forwards: get_flag(12)?,
        },
        filter_options: FilterOptionsDraft {
            allowed_message_types: decode_list(&get_text(13)?)?,
            allowed_mime_types: decode_list(&get_text(14)?)?,
            contains_text: row.get::<String>(15).ok(),
            contains_text_is_regex: get_flag(16)?,
            contains_text_regex_options: RegexOptions::from_bits(row.get(17).map_err(parse)?),
            allowed_sender_user_ids: decode_list(&get_text(18)?)?,
            blocked_sender_user_ids: decode_list(&get_text(19)?)?,
            ignore_edited_messages: get_flag(20)?,
            ignore_service_messages: get_flag(21)?,
            min_message_length: get_length(22),
            max_message_length: get_length(23),
        },
    })
}

fn draft_to_rule(draft: RuleDraft) -> Result<ForwardingRule, DatabaseError> {
    let name = draft.rule_name.clone();
    draft
        .into_rule()
        .map_err(|e| DatabaseError::Serialization(format!("stored rule {name} is invalid: {e}")))
}

// ── RuleStore impl ──────────────────────────────────────────────────

#[async_trait]
impl RuleStore for LibSqlRuleStore {
    async fn list_rules(&self) -> Result<Vec<ForwardingRule>, RuleError> {
        let _read = self.gate.read().await;
        Ok(self.load_rules("", Vec::new()).await?)
    }

    async fn get_rule(&self, name: &str) -> Result<Option<ForwardingRule>, RuleError> {
        let _read = self.gate.read().await;
        let mut rules = self
            .load_rules("WHERE rule_name = ?1", vec![Value::Text(name.to_string())])
            .await?;
        Ok(rules.pop())
    }

    async fn rules_for_source(&self, source_channel_id: i64) -> Result<Vec<ForwardingRule>, RuleError> {
        let _read = self.gate.read().await;
        Ok(self
            .load_rules("WHERE source_channel_id = ?1", vec![Value::Integer(source_channel_id)])
            .await?)
    }

    async fn create_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError> {
        let _write = self.gate.write().await;
        let draft = RuleDraft::from(rule);
        let now = Utc::now().to_rfc3339();

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_rule begin: {e}")))?;

        if Self::rule_exists(&tx, &draft.rule_name).await? {
            return Err(RuleError::DuplicateName(draft.rule_name));
        }

        let mut values = vec![Value::Text(draft.rule_name.clone())];
        values.extend(rule_values(&draft));
        values.push(Value::Text(now.clone()));
        values.push(Value::Text(now));
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        tx.execute(
            &format!(
                "INSERT INTO forwarding_rules ({RULE_COLUMNS}, created_at, updated_at) VALUES ({})",
                placeholders.join(", ")
            ),
            libsql::params::Params::Positional(values),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_rule: {e}")))?;

        Self::insert_replacements(&tx, &draft).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_rule commit: {e}")))?;

        debug!(rule = %draft.rule_name, "Rule inserted into DB");
        Ok(())
    }

    async fn replace_rule(&self, rule: &ForwardingRule) -> Result<(), RuleError> {
        let _write = self.gate.write().await;
        let draft = RuleDraft::from(rule);

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_rule begin: {e}")))?;

        // Every column after rule_name, in RULE_COLUMNS order.
        let assignments: Vec<String> = RULE_COLUMNS
            .split(',')
            .map(str::trim)
            .skip(1)
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let mut values = rule_values(&draft);
        let updated_at_idx = values.len() + 1;
        values.push(Value::Text(Utc::now().to_rfc3339()));
        values.push(Value::Text(draft.rule_name.clone()));

        let changed = tx
            .execute(
                &format!(
                    "UPDATE forwarding_rules SET {}, updated_at = ?{updated_at_idx} WHERE rule_name = ?{}",
                    assignments.join(", "),
                    updated_at_idx + 1
                ),
                libsql::params::Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_rule: {e}")))?;

        if changed == 0 {
            return Err(RuleError::NotFound(draft.rule_name));
        }

        tx.execute(
            "DELETE FROM text_replacement_rules WHERE rule_name = ?1",
            params![draft.rule_name.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_rule clear replacements: {e}")))?;
        Self::insert_replacements(&tx, &draft).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_rule commit: {e}")))?;

        debug!(rule = %draft.rule_name, "Rule replaced in DB");
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<(), RuleError> {
        let _write = self.gate.write().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule begin: {e}")))?;

        tx.execute(
            "DELETE FROM text_replacement_rules WHERE rule_name = ?1",
            params![name],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_rule replacements: {e}")))?;

        let changed = tx
            .execute("DELETE FROM forwarding_rules WHERE rule_name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;

        if changed == 0 {
            return Err(RuleError::NotFound(name.to_string()));
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule commit: {e}")))?;

        debug!(rule = %name, "Rule deleted from DB");
        Ok(())
    }

    async fn set_enabled(&self, name: &str, is_enabled: bool) -> Result<ForwardingRule, RuleError> {
        let _write = self.gate.write().await;

        let current = self
            .load_rules("WHERE rule_name = ?1", vec![Value::Text(name.to_string())])
            .await?
            .pop()
            .ok_or_else(|| RuleError::NotFound(name.to_string()))?;
        let updated = current.with_enabled(is_enabled)?;

        self.conn
            .execute(
                "UPDATE forwarding_rules SET is_enabled = ?1, updated_at = ?2 WHERE rule_name = ?3",
                params![is_enabled as i64, Utc::now().to_rfc3339(), name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_enabled: {e}")))?;

        debug!(rule = %name, is_enabled, "Rule status updated in DB");
        Ok(updated)
    }
}
