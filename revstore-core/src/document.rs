//! Document model
//!
//! User documents arrive as arbitrary JSON objects. The reserved
//! underscore keys are lifted into typed fields; everything else is kept
//! verbatim as the body.

use crate::error::{Error, Result};
use crate::rev_tree::{ChainLink, RevNode, RevPath, RevStatus, RevTree};
use crate::revision::RevId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const LOCAL_PREFIX: &str = "_local/";
pub const DESIGN_PREFIX: &str = "_design/";

/// Reserved keys accepted on input and dropped before storage.
const IGNORED_KEYS: &[&str] = &["_conflicts", "_revs_info", "_deleted_conflicts", "_local_seq"];

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// Content digest of an attachment body: `sha256-<base64>`.
pub fn attachment_digest(data: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(data)))
}

/// Attachment metadata as stored with a revision body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub revpos: u64,
    /// Inline content carried by a write; never stored in the body.
    #[serde(skip)]
    pub data: Option<Bytes>,
    /// Reference to content that must already exist.
    #[serde(skip)]
    pub stub: bool,
}

impl Attachment {
    pub fn inline(content_type: Option<String>, data: Bytes) -> Self {
        Self {
            content_type,
            digest: attachment_digest(&data),
            length: data.len() as u64,
            revpos: 0,
            data: Some(data),
            stub: false,
        }
    }

    fn parse(name: &str, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedDocument(format!("Attachment {:?} must be an object", name)))?;
        let content_type = match obj.get("content_type") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::MalformedDocument(format!(
                    "Attachment {:?} has a non-string content_type",
                    name
                )))
            }
        };
        if obj.get("stub").and_then(Value::as_bool).unwrap_or(false) {
            let digest = obj
                .get("digest")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedDocument(format!("Stub attachment {:?} has no digest", name)))?;
            return Ok(Self {
                content_type,
                digest: digest.to_string(),
                length: obj.get("length").and_then(Value::as_u64).unwrap_or(0),
                revpos: obj.get("revpos").and_then(Value::as_u64).unwrap_or(0),
                data: None,
                stub: true,
            });
        }
        let encoded = obj
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedDocument(format!("Attachment {:?} has no data", name)))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| Error::MalformedDocument(format!("Attachment {:?} is not valid base64: {}", name, e)))?;
        Ok(Self::inline(content_type, Bytes::from(data)))
    }
}

/// `_revisions` ancestry: `start` is the newest generation, `ids` newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    pub start: u64,
    pub ids: Vec<String>,
}

/// A user document split into reserved fields and body
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<RevId>,
    pub deleted: bool,
    pub attachments: BTreeMap<String, Attachment>,
    pub revisions: Option<Revisions>,
    pub body: Map<String, Value>,
}

impl Document {
    /// Validate and split a JSON document.
    pub fn from_value(value: Value, new_edits: bool) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::MalformedDocument("Document must be a JSON object".into()));
        };
        let mut doc = Document {
            id: String::new(),
            rev: None,
            deleted: false,
            attachments: BTreeMap::new(),
            revisions: None,
            body: Map::new(),
        };
        let mut id = None;
        for (key, value) in map {
            match key.as_str() {
                "_id" => match value {
                    Value::String(s) if !s.is_empty() => id = Some(s),
                    _ => return Err(Error::MalformedDocument("_id must be a non-empty string".into())),
                },
                "_rev" => match value {
                    Value::String(s) => doc.rev = Some(s.parse()?),
                    Value::Null => {}
                    _ => return Err(Error::MalformedDocument("_rev must be a string".into())),
                },
                "_deleted" => doc.deleted = value.as_bool().unwrap_or(false),
                "_attachments" => {
                    let Value::Object(atts) = value else {
                        return Err(Error::MalformedDocument("_attachments must be an object".into()));
                    };
                    for (name, att) in atts.iter() {
                        doc.attachments.insert(name.clone(), Attachment::parse(name, att)?);
                    }
                }
                "_revisions" => {
                    let revs: Revisions = serde_json::from_value(value)
                        .map_err(|e| Error::MalformedDocument(format!("Invalid _revisions: {}", e)))?;
                    doc.revisions = Some(revs);
                }
                k if IGNORED_KEYS.contains(&k) => {}
                k if k.starts_with('_') => {
                    return Err(Error::MalformedDocument(format!(
                        "Bad special document member: {}",
                        k
                    )))
                }
                _ => {
                    doc.body.insert(key, value);
                }
            }
        }
        doc.id = match id {
            Some(id) => {
                if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) && !id.starts_with(LOCAL_PREFIX) {
                    return Err(Error::MalformedDocument(
                        "Only reserved document ids may start with underscore.".into(),
                    ));
                }
                id
            }
            None if new_edits => uuid::Uuid::new_v4().to_string(),
            None => return Err(Error::MalformedDocument("Document is missing _id".into())),
        };
        Ok(doc)
    }

    /// JSON persisted in the revision store: body, attachment metadata and
    /// the tombstone flag. `_id` and `_rev` are re-injected on read.
    pub fn stored_json(&self) -> Value {
        let mut out = self.body.clone();
        if !self.attachments.is_empty() {
            let atts: Map<String, Value> = self
                .attachments
                .iter()
                .map(|(name, att)| (name.clone(), json!(att)))
                .collect();
            out.insert("_attachments".into(), Value::Object(atts));
        }
        if self.deleted {
            out.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(out)
    }

    /// Bytes fingerprinted into a new revision hash.
    fn fingerprint_content(&self) -> Vec<u8> {
        let digests: Vec<(&String, &String)> = self.attachments.iter().map(|(n, a)| (n, &a.digest)).collect();
        json!({ "body": self.body, "attachments": digests })
            .to_string()
            .into_bytes()
    }
}

/// A validated write: the document plus the revision path to graft.
#[derive(Debug, Clone)]
pub struct ParsedDoc {
    pub doc: Document,
    /// Revision this write creates (or replays).
    pub rev: RevId,
    pub path: RevPath,
    new_edits: bool,
}

impl ParsedDoc {
    pub fn new(doc: Document, new_edits: bool) -> Result<Self> {
        if new_edits {
            let parent = doc.rev.clone();
            Self::with_parent(doc, parent)
        } else {
            Self::replicated(doc)
        }
    }

    pub fn from_value(value: Value, new_edits: bool) -> Result<Self> {
        Self::new(Document::from_value(value, new_edits)?, new_edits)
    }

    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn new_edits(&self) -> bool {
        self.new_edits
    }

    /// Declared parent revision, for new edits.
    pub fn parent(&self) -> Option<&RevId> {
        if self.new_edits {
            self.doc.rev.as_ref()
        } else {
            None
        }
    }

    /// Re-derive the new revision as a child of `parent`.
    pub fn rebase(self, parent: RevId) -> Result<Self> {
        Self::with_parent(self.doc, Some(parent))
    }

    /// Tree containing only this write's path.
    pub fn tree(&self) -> RevTree {
        RevTree::from_path(self.path.clone())
    }

    fn with_parent(mut doc: Document, parent: Option<RevId>) -> Result<Self> {
        let rev = RevId::fingerprint(parent.as_ref(), doc.deleted, &doc.fingerprint_content())?;
        let leaf = ChainLink {
            hash: rev.hash.clone(),
            status: RevStatus::Available,
            deleted: doc.deleted,
        };
        let (start, links) = match &parent {
            Some(p) => (
                p.generation,
                vec![
                    ChainLink {
                        hash: p.hash.clone(),
                        status: RevStatus::Missing,
                        deleted: false,
                    },
                    leaf,
                ],
            ),
            None => (1, vec![leaf]),
        };
        for att in doc.attachments.values_mut() {
            if !att.stub || att.revpos == 0 {
                att.revpos = rev.generation;
            }
        }
        doc.rev = parent;
        let path = RevPath {
            pos: start,
            root: linear_root(links),
        };
        Ok(Self {
            doc,
            rev,
            path,
            new_edits: true,
        })
    }

    fn replicated(mut doc: Document) -> Result<Self> {
        let (rev, ancestors) = match (&doc.revisions, &doc.rev) {
            (Some(revs), declared) => {
                let newest = revs
                    .ids
                    .first()
                    .ok_or_else(|| Error::MalformedDocument("_revisions.ids is empty".into()))?;
                if (revs.start as usize) < revs.ids.len() {
                    return Err(Error::MalformedDocument("_revisions.start is below its history".into()));
                }
                let rev = RevId::new(revs.start, newest.clone());
                if declared.as_ref().map(|d| d != &rev).unwrap_or(false) {
                    return Err(Error::MalformedDocument("_rev does not match _revisions".into()));
                }
                (rev, revs.ids[1..].to_vec())
            }
            (None, Some(rev)) => (rev.clone(), Vec::new()),
            (None, None) => {
                return Err(Error::MalformedDocument("new_edits=false requires a _rev".into()));
            }
        };
        let mut links: Vec<ChainLink> = ancestors
            .into_iter()
            .rev()
            .map(|hash| ChainLink {
                hash,
                status: RevStatus::Missing,
                deleted: false,
            })
            .collect();
        let start = rev.generation - links.len() as u64;
        links.push(ChainLink {
            hash: rev.hash.clone(),
            status: RevStatus::Available,
            deleted: doc.deleted,
        });
        for att in doc.attachments.values_mut() {
            if att.revpos == 0 {
                att.revpos = rev.generation;
            }
        }
        doc.rev = Some(rev.clone());
        Ok(Self {
            doc,
            rev,
            path: RevPath {
                pos: start,
                root: linear_root(links),
            },
            new_edits: false,
        })
    }
}

fn linear_root(links: Vec<ChainLink>) -> RevNode {
    // Callers always pass at least the new leaf.
    match RevPath::linear(0, links) {
        Some(p) => p.root,
        None => RevNode::new("", RevStatus::Missing, false),
    }
}

/// Document summary row stored in the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMetadata {
    pub id: String,
    pub rev_tree: RevTree,
    pub winning_rev: RevId,
    pub deleted: bool,
    pub seq: i64,
}

impl DocMetadata {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Rebuild a user-facing document from its stored body.
pub fn inflate(json: &str, id: &str, rev: &RevId) -> Result<Map<String, Value>> {
    let stored: Value = serde_json::from_str(json)?;
    let mut out = Map::new();
    out.insert("_id".into(), Value::String(id.to_string()));
    out.insert("_rev".into(), Value::String(rev.to_string()));
    if let Value::Object(fields) = stored {
        for (k, v) in fields {
            if k != "_id" && k != "_rev" {
                out.insert(k, v);
            }
        }
    }
    Ok(out)
}
