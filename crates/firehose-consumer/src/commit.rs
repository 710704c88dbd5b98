//! Turns a decoded commit frame into store-ready record rows and one event
//! row, verifying each operation's content hash along the way.
//!
//! Per-operation failures (missing hash, hash mismatch, empty block,
//! malformed path) are skipped individually and folded into the event row's
//! `error` field; they never abort the rest of the commit.

use atproto_core::{CommitFrame, RepoOp};
use ingest_store::{NewEvent, NewRecord};

pub async fn decode_commit(frame: &CommitFrame) -> (Vec<NewRecord>, NewEvent) {
    if frame.too_big {
        return (
            Vec::new(),
            NewEvent {
                seq: frame.seq,
                repo: frame.repo.clone(),
                kind: "commit".to_string(),
                event_time: Some(frame.time.clone()),
                prev_rev: Some(frame.rev.clone()),
                error: Some("commit too big".to_string()),
            },
        );
    }

    let Some(bytes) = frame.blocks.as_deref() else {
        return (
            Vec::new(),
            NewEvent {
                seq: frame.seq,
                repo: frame.repo.clone(),
                kind: "commit".to_string(),
                event_time: Some(frame.time.clone()),
                prev_rev: Some(frame.rev.clone()),
                error: Some("commit carried no blocks".to_string()),
            },
        );
    };

    let mut errors = Vec::new();
    let blocks = match atproto_core::car::parse_blocks(bytes).await {
        Ok(blocks) => blocks,
        Err(e) => {
            return (
                Vec::new(),
                NewEvent {
                    seq: frame.seq,
                    repo: frame.repo.clone(),
                    kind: "commit".to_string(),
                    event_time: Some(frame.time.clone()),
                    prev_rev: Some(frame.rev.clone()),
                    error: Some(format!("failed to parse CAR blocks: {}", e)),
                },
            );
        }
    };

    let mut records = Vec::new();
    for op in &frame.ops {
        match decode_op(frame, op, &blocks) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    let event = NewEvent {
        seq: frame.seq,
        repo: frame.repo.clone(),
        kind: "commit".to_string(),
        event_time: Some(frame.time.clone()),
        prev_rev: Some(frame.rev.clone()),
        error: if errors.is_empty() { None } else { Some(errors.join("; ")) },
    };

    (records, event)
}

fn decode_op(
    frame: &CommitFrame,
    op: &RepoOp,
    blocks: &std::collections::HashMap<String, Vec<u8>>,
) -> Result<Option<NewRecord>, String> {
    let Some((collection, rkey)) = atproto_core::car::parse_record_path(&op.path) else {
        return Err(format!("malformed path: {}", op.path));
    };

    if op.action == "delete" {
        return Ok(Some(NewRecord {
            seq: frame.seq,
            repo: frame.repo.clone(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            action: op.action.clone(),
            payload: String::new(),
        }));
    }

    let Some(cid) = &op.cid else {
        return Err(format!("missing content hash for {}", op.path));
    };

    let value: serde_json::Value =
        atproto_core::car::decode_block(&op.path, cid, blocks).map_err(|e| e.to_string())?;

    let payload = serde_json::to_string(&value).map_err(|e| e.to_string())?;

    Ok(Some(NewRecord {
        seq: frame.seq,
        repo: frame.repo.clone(),
        collection: collection.to_string(),
        rkey: rkey.to_string(),
        action: op.action.clone(),
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_frame() -> CommitFrame {
        CommitFrame {
            seq: 1,
            repo: "did:plc:abc".to_string(),
            rev: "rev1".to_string(),
            too_big: false,
            ops: Vec::new(),
            blocks: Some(Vec::new()),
            time: "2026-07-28T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_too_big_commit_skips_decode() {
        let mut frame = base_frame();
        frame.too_big = true;
        let (records, event) = decode_commit(&frame).await;
        assert!(records.is_empty());
        assert_eq!(event.error.as_deref(), Some("commit too big"));
    }

    #[tokio::test]
    async fn test_missing_blocks_is_an_error() {
        let mut frame = base_frame();
        frame.blocks = None;
        let (records, event) = decode_commit(&frame).await;
        assert!(records.is_empty());
        assert_eq!(event.error.as_deref(), Some("commit carried no blocks"));
    }

    #[tokio::test]
    async fn test_delete_op_without_blocks_lookup() {
        let mut frame = base_frame();
        frame.ops = vec![RepoOp {
            action: "delete".to_string(),
            path: "app.bsky.feed.post/abc123".to_string(),
            cid: None,
        }];
        let (records, event) = decode_commit(&frame).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "delete");
        assert_eq!(records[0].payload, "");
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn test_malformed_path_is_skipped_with_error() {
        let mut frame = base_frame();
        frame.ops = vec![RepoOp {
            action: "create".to_string(),
            path: "no-slash-here".to_string(),
            cid: None,
        }];
        let (records, event) = decode_commit(&frame).await;
        assert!(records.is_empty());
        assert!(event.error.as_deref().unwrap().contains("malformed path"));
    }

    #[tokio::test]
    async fn test_create_without_cid_is_skipped_with_error() {
        let mut frame = base_frame();
        frame.ops = vec![RepoOp {
            action: "create".to_string(),
            path: "app.bsky.feed.post/abc123".to_string(),
            cid: None,
        }];
        let (records, event) = decode_commit(&frame).await;
        assert!(records.is_empty());
        assert!(event.error.as_deref().unwrap().contains("missing content hash"));
    }
}
