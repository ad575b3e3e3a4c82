// ABOUTME: MongoOplogSource - tails local.oplog.rs with a tailable cursor
// ABOUTME: Decodes raw oplog documents and reopens the cursor after failures

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::StreamExt;
use mongodb::options::CursorType;
use mongodb::{Client, Collection, Cursor};

use super::entry::{ChangeEntry, Namespace, Operation};
use super::source::{ChangeSource, SourceError, StartPosition};
use super::timestamp::OpTimestamp;

const OPLOG_DATABASE: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

const FULL_NAMESPACE_COMMANDS: &[&str] = &["renameCollection"];

/// Connect to MongoDB and verify the connection with a `ping`.
pub async fn connect(url: &str) -> Result<Client> {
    let client = Client::with_uri_str(url)
        .await
        .context("Failed to parse MongoDB URL")?;
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .context("MongoDB ping failed")?;
    Ok(client)
}

/// Open a tailable cursor at `from` (inclusive). The returned future owns the
/// collection handle and must not borrow the source, which is not `Sync`.
async fn open_cursor(
    oplog: Collection<Document>,
    from: OpTimestamp,
) -> mongodb::error::Result<Cursor<Document>> {
    oplog
        .find(doc! { "ts": { "$gte": bson::Timestamp::from(from) } })
        .cursor_type(CursorType::TailableAwait)
        .no_cursor_timeout(true)
        .max_await_time(Duration::from_secs(1))
        .await
}

/// A [`ChangeSource`] backed by the replica set oplog.
pub struct MongoOplogSource {
    oplog: Collection<Document>,
    cursor: Option<Cursor<Document>>,
    /// Lower bound (inclusive) for the next cursor
    read_from: OpTimestamp,
    /// Entries at or below this timestamp have already been seen
    skip_through: Option<OpTimestamp>,
    pending: VecDeque<ChangeEntry>,
    reconnect_delay: Duration,
    failed: bool,
}

impl MongoOplogSource {
    /// Prepare a source reading from `position`. For [`StartPosition::Tail`]
    /// the newest existing oplog entry is looked up now, so nothing written
    /// before this call is replayed.
    pub async fn open(client: &Client, position: StartPosition) -> Result<Self> {
        let oplog = client
            .database(OPLOG_DATABASE)
            .collection::<Document>(OPLOG_COLLECTION);

        let (read_from, skip_through) = match position {
            StartPosition::Resume(ts) => (ts, None),
            StartPosition::Tail => {
                let newest = oplog
                    .find_one(doc! {})
                    .sort(doc! { "$natural": -1 })
                    .await
                    .context("Failed to read newest oplog entry")?;
                let newest = match newest {
                    Some(entry) => OpTimestamp::from(
                        entry
                            .get_timestamp("ts")
                            .context("Newest oplog entry has no ts field")?,
                    ),
                    None => OpTimestamp::new(0, 0),
                };
                // Tailable cursors whose first batch is empty die immediately,
                // so start on the newest entry and discard it locally.
                (newest, Some(newest))
            }
        };

        tracing::info!(
            read_from = %read_from,
            "Opening oplog cursor on {}.{}",
            OPLOG_DATABASE,
            OPLOG_COLLECTION
        );

        Ok(Self {
            oplog,
            cursor: None,
            read_from,
            skip_through,
            pending: VecDeque::new(),
            reconnect_delay: Duration::from_secs(1),
            failed: false,
        })
    }

    fn fail(&mut self, reason: String) -> SourceError {
        self.cursor = None;
        self.failed = true;
        SourceError::Transient(reason)
    }
}

#[async_trait]
impl ChangeSource for MongoOplogSource {
    async fn next_entry(&mut self) -> Result<Option<ChangeEntry>, SourceError> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Ok(Some(entry));
            }

            if self.cursor.is_none() {
                if self.failed {
                    tokio::time::sleep(self.reconnect_delay).await;
                }
                match open_cursor(self.oplog.clone(), self.read_from).await {
                    Ok(cursor) => {
                        self.failed = false;
                        self.cursor = Some(cursor);
                    }
                    Err(e) => return Err(self.fail(format!("failed to open oplog cursor: {}", e))),
                }
            }

            let next = match self.cursor.as_mut() {
                Some(cursor) => cursor.next().await,
                None => continue,
            };

            let raw = match next {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(self.fail(format!("oplog cursor error: {}", e))),
                None => return Err(self.fail("oplog cursor closed by server".to_string())),
            };

            let ts = match raw.get_timestamp("ts") {
                Ok(ts) => OpTimestamp::from(ts),
                Err(e) => {
                    return Err(SourceError::Transient(format!(
                        "oplog entry without timestamp: {}",
                        e
                    )))
                }
            };
            if self.skip_through.is_some_and(|seen| ts <= seen) {
                continue;
            }
            self.read_from = ts;
            self.skip_through = Some(ts);

            let mut entries = Vec::new();
            if let Err(reason) = decode_operation(&raw, ts, &mut entries) {
                return Err(SourceError::Transient(format!(
                    "skipping undecodable oplog entry at {}: {}",
                    ts, reason
                )));
            }
            self.pending.extend(entries);
        }
    }
}

/// Decode one oplog document into zero or more change entries.
///
/// Noops produce nothing, `applyOps` produces one entry per inner operation
/// (all sharing the outer timestamp, numbered in order even when nested), and
/// commands without a collection are skipped.
pub fn decode_operation(
    raw: &Document,
    ts: OpTimestamp,
    out: &mut Vec<ChangeEntry>,
) -> std::result::Result<(), String> {
    let mut next_sequence = 0;
    decode_into(raw, ts, &mut next_sequence, out)
}

fn take_sequence(next_sequence: &mut u32) -> u32 {
    let sequence = *next_sequence;
    *next_sequence += 1;
    sequence
}

fn decode_into(
    raw: &Document,
    ts: OpTimestamp,
    next_sequence: &mut u32,
    out: &mut Vec<ChangeEntry>,
) -> std::result::Result<(), String> {
    let op = raw.get_str("op").map_err(|e| e.to_string())?;
    let ns = raw.get_str("ns").map_err(|e| e.to_string())?;

    match op {
        "n" => Ok(()),
        "i" => {
            let o = raw.get_document("o").map_err(|e| e.to_string())?;
            let mut entry =
                ChangeEntry::new(parse_ns(ns)?, Operation::Insert, ts)
                    .with_sequence(take_sequence(next_sequence));
            entry.document_id = o.get("_id").cloned();
            out.push(entry.with_data(o.clone()));
            Ok(())
        }
        "u" => {
            let o = raw.get_document("o").map_err(|e| e.to_string())?;
            let o2 = raw.get_document("o2").map_err(|e| e.to_string())?;
            let mut entry =
                ChangeEntry::new(parse_ns(ns)?, Operation::Update, ts)
                    .with_sequence(take_sequence(next_sequence));
            entry.document_id = o2.get("_id").cloned();
            out.push(entry.with_data(o.clone()));
            Ok(())
        }
        "d" => {
            let o = raw.get_document("o").map_err(|e| e.to_string())?;
            let mut entry =
                ChangeEntry::new(parse_ns(ns)?, Operation::Delete, ts)
                    .with_sequence(take_sequence(next_sequence));
            entry.document_id = o.get("_id").cloned();
            out.push(entry);
            Ok(())
        }
        "c" => decode_command(raw, ns, ts, next_sequence, out),
        other => Err(format!("unknown oplog op '{}'", other)),
    }
}

fn decode_command(
    raw: &Document,
    ns: &str,
    ts: OpTimestamp,
    next_sequence: &mut u32,
    out: &mut Vec<ChangeEntry>,
) -> std::result::Result<(), String> {
    let o = raw.get_document("o").map_err(|e| e.to_string())?;
    let database = ns.split_once('.').map(|(db, _)| db).unwrap_or(ns);

    let (command, argument) = match o.iter().next() {
        Some(first) => first,
        None => return Err("empty command document".to_string()),
    };

    if command == "applyOps" {
        let ops = o.get_array("applyOps").map_err(|e| e.to_string())?;
        for inner in ops {
            match inner {
                Bson::Document(inner) => {
                    decode_into(inner, ts, next_sequence, out)?;
                }
                _ => return Err("applyOps element is not a document".to_string()),
            }
        }
        return Ok(());
    }

    let collection = match argument {
        Bson::String(collection) => collection,
        _ => {
            tracing::debug!("Skipping {} command on {}: no collection", command, database);
            return Ok(());
        }
    };
    if command == "dropDatabase" {
        return Ok(());
    }

    // renameCollection names its source as a full `db.coll` namespace
    let namespace = if FULL_NAMESPACE_COMMANDS.contains(&command.as_str()) {
        parse_ns(collection)?
    } else {
        Namespace::new(database, collection.as_str())
    };
    let operation = if command == "drop" {
        Operation::Drop
    } else {
        Operation::Other
    };
    out.push(
        ChangeEntry::new(namespace, operation, ts)
            .with_sequence(take_sequence(next_sequence))
            .with_data(o.clone()),
    );
    Ok(())
}

fn parse_ns(ns: &str) -> std::result::Result<Namespace, String> {
    Namespace::parse(ns).map_err(|e| e.to_string())
}
