//! Local documents
//!
//! Non-versioned records keyed by id. Each write bumps a `0-N` counter
//! that doubles as the optimistic-concurrency token.

use crate::backend::Executor;
use crate::error::{Error, Result};
use crate::schema::LOCAL_STORE;
use crate::sql_params;
use serde_json::{Map, Value};

/// Revision reported after a local document is removed.
pub const REMOVED_REV: &str = "0-0";

fn next_rev(old: Option<&str>) -> Result<String> {
    let Some(old) = old else {
        return Ok("0-1".to_string());
    };
    let counter: u64 = old
        .strip_prefix("0-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::MalformedDocument(format!("Invalid local rev {:?}", old)))?;
    Ok(format!("0-{}", counter + 1))
}

/// Split a local document into `(id, rev, body)`.
pub fn split(value: Value) -> Result<(String, Option<String>, Map<String, Value>)> {
    let Value::Object(mut map) = value else {
        return Err(Error::MalformedDocument("Document must be a JSON object".into()));
    };
    let id = match map.remove("_id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => return Err(Error::MalformedDocument("_id must be a non-empty string".into())),
    };
    let rev = match map.remove("_rev") {
        Some(Value::String(rev)) => Some(rev),
        None | Some(Value::Null) => None,
        Some(_) => return Err(Error::MalformedDocument("_rev must be a string".into())),
    };
    map.remove("_revisions");
    Ok((id, rev, map))
}

pub async fn get_local(db: &dyn Executor, id: &str) -> Result<Map<String, Value>> {
    let rows = db
        .query(
            &format!("SELECT json, rev FROM {} WHERE id=?", LOCAL_STORE),
            &sql_params![id],
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| Error::MissingDocument(id.to_string()))?;
    let body: Value = serde_json::from_str(row.get_str("json")?)?;
    let mut doc = Map::new();
    doc.insert("_id".into(), Value::String(id.to_string()));
    doc.insert("_rev".into(), Value::String(row.get_string("rev")?));
    if let Value::Object(fields) = body {
        doc.extend(fields);
    }
    Ok(doc)
}

/// Insert or update a local document; returns the new revision.
pub async fn put_local(db: &dyn Executor, id: &str, rev: Option<&str>, body: &Map<String, Value>) -> Result<String> {
    let new_rev = next_rev(rev)?;
    let json = serde_json::to_string(body)?;
    let res = match rev {
        Some(old) => {
            db.execute(
                &format!("UPDATE {} SET rev=?, json=? WHERE id=? AND rev=?", LOCAL_STORE),
                &sql_params![&new_rev, json, id, old],
            )
            .await
        }
        None => {
            db.execute(
                &format!("INSERT INTO {} (id, rev, json) VALUES (?,?,?)", LOCAL_STORE),
                &sql_params![id, &new_rev, json],
            )
            .await
        }
    };
    match res {
        Ok(out) if out.changes > 0 => Ok(new_rev),
        Ok(_) => Err(Error::RevisionConflict(format!("stale revision for {}", id))),
        Err(e) if e.is_constraint_violation() => Err(Error::RevisionConflict(format!("{} already exists", id))),
        Err(e) => Err(e),
    }
}

/// Delete a local document at `rev`; returns [`REMOVED_REV`].
pub async fn remove_local(db: &dyn Executor, id: &str, rev: &str) -> Result<String> {
    let out = db
        .execute(
            &format!("DELETE FROM {} WHERE id=? AND rev=?", LOCAL_STORE),
            &sql_params![id, rev],
        )
        .await?;
    if out.changes == 0 {
        return Err(Error::MissingDocument(id.to_string()));
    }
    Ok(REMOVED_REV.to_string())
}
