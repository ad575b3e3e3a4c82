// ABOUTME: ChangeEntry model - one decoded oplog operation
// ABOUTME: Namespaces, operation kinds, document ids and changed-field extraction

use std::fmt;

use anyhow::{bail, Result};
use bson::{Bson, Document};

use super::timestamp::OpTimestamp;

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `db.collection`. Database names cannot contain dots, collection
    /// names can, so only the first dot separates the two.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => bail!("invalid namespace '{}': expected <database>.<collection>", ns),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Drop,
    Other,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Drop => "drop",
            Operation::Other => "other",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change read from the oplog. Immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub namespace: Namespace,
    pub operation: Operation,
    /// Absent for collection-level operations such as drops
    pub document_id: Option<Bson>,
    pub timestamp: OpTimestamp,
    /// Inserted document, update delta, or command body
    pub data: Option<Document>,
    /// Position inside a multi-document transaction; 0 for standalone writes
    pub sequence: u32,
}

impl ChangeEntry {
    pub fn new(namespace: Namespace, operation: Operation, timestamp: OpTimestamp) -> Self {
        Self {
            namespace,
            operation,
            document_id: None,
            timestamp,
            data: None,
            sequence: 0,
        }
    }

    pub fn with_document_id(mut self, id: impl Into<Bson>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: Document) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// The document id rendered for use inside a channel name.
    pub fn document_key(&self) -> Option<String> {
        self.document_id.as_ref().map(document_id_key)
    }

    /// Top-level field names touched by this change, `_id` excluded.
    pub fn changed_fields(&self) -> Vec<String> {
        let data = match &self.data {
            Some(data) => data,
            None => return Vec::new(),
        };
        let mut fields = match self.operation {
            Operation::Insert => data.keys().cloned().collect(),
            Operation::Update => update_fields(data),
            _ => Vec::new(),
        };
        fields.retain(|f| f != "_id");
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Render a document id the way it appears in channel names: strings verbatim,
/// ObjectIds as hex, integers in decimal, anything else as relaxed extended JSON.
pub fn document_id_key(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

fn update_fields(update: &Document) -> Vec<String> {
    // $v: 2 diff format (MongoDB 5.0+)
    if let Ok(diff) = update.get_document("diff") {
        let mut fields = Vec::new();
        for (key, value) in diff {
            match key.as_str() {
                "u" | "i" | "d" => {
                    if let Bson::Document(section) = value {
                        fields.extend(section.keys().cloned());
                    }
                }
                nested if nested.starts_with('s') && nested.len() > 1 => {
                    fields.push(nested[1..].to_string());
                }
                _ => {}
            }
        }
        return fields;
    }

    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        // Full replacement document
        return update.keys().cloned().collect();
    }

    let mut fields = Vec::new();
    for (key, value) in update {
        if !key.starts_with('$') {
            continue;
        }
        if let Bson::Document(operands) = value {
            for path in operands.keys() {
                let top = path.split('.').next().unwrap_or(path);
                fields.push(top.to_string());
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("app.users").unwrap();
        assert_eq!(ns.database, "app");
        assert_eq!(ns.collection, "users");
        assert_eq!(ns.to_string(), "app.users");

        let dotted = Namespace::parse("app.system.profile").unwrap();
        assert_eq!(dotted.collection, "system.profile");

        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".users").is_err());
        assert!(Namespace::parse("app.").is_err());
    }

    #[test]
    fn test_document_id_key() {
        let oid = ObjectId::parse_str("5f1d7a3b9c1e4a2b3c4d5e6f").unwrap();
        assert_eq!(document_id_key(&Bson::ObjectId(oid)), "5f1d7a3b9c1e4a2b3c4d5e6f");
        assert_eq!(document_id_key(&Bson::String("abc".into())), "abc");
        assert_eq!(document_id_key(&Bson::Int32(7)), "7");
        assert_eq!(document_id_key(&Bson::Int64(-9)), "-9");
        assert_eq!(
            document_id_key(&Bson::Document(doc! {"a": 1})),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn test_insert_fields() {
        let entry = ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Insert,
            OpTimestamp::new(1, 0),
        )
        .with_document_id("u1")
        .with_data(doc! {"_id": "u1", "name": "Ada", "age": 36});
        assert_eq!(entry.changed_fields(), vec!["age", "name"]);
    }

    #[test]
    fn test_update_operator_fields() {
        let entry = ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Update,
            OpTimestamp::new(1, 0),
        )
        .with_data(doc! {
            "$set": {"name": "Ada", "address.city": "London"},
            "$unset": {"nickname": ""},
        });
        assert_eq!(entry.changed_fields(), vec!["address", "name", "nickname"]);
    }

    #[test]
    fn test_update_diff_fields() {
        let entry = ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Update,
            OpTimestamp::new(1, 0),
        )
        .with_data(doc! {
            "$v": 2,
            "diff": {
                "u": {"name": "Ada"},
                "i": {"email": "ada@example.com"},
                "d": {"nickname": false},
                "saddress": {"u": {"city": "London"}},
            },
        });
        assert_eq!(
            entry.changed_fields(),
            vec!["address", "email", "name", "nickname"]
        );
    }

    #[test]
    fn test_update_replacement_fields() {
        let entry = ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Update,
            OpTimestamp::new(1, 0),
        )
        .with_data(doc! {"_id": "u1", "name": "Ada"});
        assert_eq!(entry.changed_fields(), vec!["name"]);
    }

    #[test]
    fn test_delete_has_no_fields() {
        let entry = ChangeEntry::new(
            Namespace::new("app", "users"),
            Operation::Delete,
            OpTimestamp::new(1, 0),
        )
        .with_data(doc! {"_id": "u1"});
        assert!(entry.changed_fields().is_empty());
    }
}
