use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use uuid::Uuid;

use crate::credentials;
use crate::git::{authenticated_url, BlameLine, GitCli, GitError, TreeEntry};
use crate::sync::workers::{SyncContext, SyncSummary, SyncWorker};

/// How many leading bytes decide binary-ness: a NUL anywhere in this
/// window marks the file binary. The window size matches the legacy
/// classifier so migration does not change which files get blamed.
const BINARY_PEEK_BYTES: usize = 8000;

/// Staging rows are pushed to the COPY stream in chunks of roughly this
/// many bytes.
const COPY_CHUNK_BYTES: usize = 64 * 1024;

const STAGING_FILE: &str = "git_blame.jsonl";

/// One staged result row. Serialized one-object-per-line into the
/// staging file; keys follow the established staging format.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct BlameRecord {
    #[serde(rename = "AuthorEmail")]
    author_email: Option<String>,
    #[serde(rename = "AuthorName")]
    author_name: Option<String>,
    #[serde(rename = "AuthorWhen")]
    author_when: Option<DateTime<Utc>>,
    #[serde(rename = "CommitHash")]
    commit_hash: Option<String>,
    #[serde(rename = "LineNo")]
    line_no: u32,
    #[serde(rename = "Line")]
    line: Option<String>,
    #[serde(rename = "Path")]
    path: String,
}

impl BlameRecord {
    fn from_blame(path: &str, line: BlameLine) -> Self {
        Self {
            author_email: line.author_email,
            author_name: line.author_name,
            author_when: line.author_when,
            commit_hash: Some(line.commit_hash),
            line_no: line.line_no,
            line: line.line,
            path: path.to_string(),
        }
    }
}

/// The reference sync worker: clone, walk the tree, blame every text
/// blob, stage the rows on disk, and publish the full replacement set in
/// one transaction.
pub struct BlameSync;

#[async_trait]
impl SyncWorker for BlameSync {
    async fn run(&self, ctx: &mut SyncContext<'_>) -> Result<SyncSummary, anyhow::Error> {
        let token = credentials::latest_github_pat(ctx.pool, ctx.encryption_secret).await?;
        if token.is_none() {
            ctx.logger
                .warn("no GITHUB_PAT credential configured, cloning unauthenticated")
                .await;
        }
        let clone_url = match &token {
            Some(token) => authenticated_url(&ctx.job.clone_url, token),
            None => ctx.job.clone_url.clone(),
        };

        ctx.logger.info(format!("cloning {}", ctx.job.clone_url)).await;
        let checkout = ctx.scratch_dir.join("repo");
        let git =
            GitCli::clone_repo(ctx.cancel, &clone_url, ctx.job.git_ref.as_deref(), &checkout)
                .await?;

        let entries = git.ls_tree(ctx.cancel, "HEAD").await?;
        let blobs: Vec<TreeEntry> = entries.into_iter().filter(TreeEntry::is_blob).collect();
        ctx.logger.info(format!("blaming {} files", blobs.len())).await;

        let staging_path = ctx.scratch_dir.join(STAGING_FILE);
        let mut staging = BufWriter::new(tokio::fs::File::create(&staging_path).await?);

        let mut summary = SyncSummary::default();
        for entry in &blobs {
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("blame sync cancelled");
            }

            match is_binary(&checkout.join(&entry.path)).await {
                Ok(true) => {
                    ctx.logger
                        .info(format!("skipping binary file {}", entry.path))
                        .await;
                    summary.files_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    ctx.logger
                        .warn(format!("could not read {}: {}", entry.path, e))
                        .await;
                    summary.files_skipped += 1;
                    continue;
                }
            }

            let lines = match git.blame(ctx.cancel, &entry.path).await {
                Ok(lines) => lines,
                Err(e @ GitError::Cancelled { .. }) => return Err(e.into()),
                Err(e) => {
                    ctx.logger
                        .warn(format!("blame failed for {}: {}", entry.path, e))
                        .await;
                    summary.files_skipped += 1;
                    continue;
                }
            };

            for line in lines {
                let record = BlameRecord::from_blame(&entry.path, line);
                let mut row = serde_json::to_vec(&record)?;
                row.push(b'\n');
                staging.write_all(&row).await?;
                summary.rows_written += 1;
            }
        }
        staging.flush().await?;

        publish(ctx, &staging_path).await?;
        Ok(summary)
    }
}

/// Peek at the first bytes of a working-tree file. The handle is dropped
/// as soon as the window is read.
async fn is_binary(path: &Path) -> std::io::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; BINARY_PEEK_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf[..filled].contains(&0))
}

/// Atomic publish: replace the repo's blame set, bulk-load the staged
/// rows through COPY, and flip the queue row to DONE — all in one
/// transaction. Any failure rolls the whole thing back and the job ends
/// without a terminal status.
async fn publish(ctx: &mut SyncContext<'_>, staging_path: &Path) -> Result<(), anyhow::Error> {
    let mut tx = ctx.pool.begin().await?;

    sqlx::query("DELETE FROM git_blame WHERE repo_id = $1")
        .bind(ctx.job.repo_id)
        .execute(&mut *tx)
        .await?;

    let mut copy = (&mut *tx)
        .copy_in_raw(
            "COPY git_blame (repo_id, path, line_no, line, commit_hash, author_name, author_email, author_when) FROM STDIN WITH (FORMAT csv)",
        )
        .await?;

    let staging = BufReader::new(tokio::fs::File::open(staging_path).await?);
    let mut lines = staging.lines();
    let mut chunk: Vec<u8> = Vec::with_capacity(COPY_CHUNK_BYTES);
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let record: BlameRecord = serde_json::from_str(&line)?;
        encode_copy_row(&mut chunk, ctx.job.repo_id, &record);
        if chunk.len() >= COPY_CHUNK_BYTES {
            copy.send(chunk.as_slice()).await?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        copy.send(chunk.as_slice()).await?;
    }
    let loaded = copy.finish().await?;
    tracing::debug!(queue_id = ctx.job.queue_id, rows = loaded, "blame rows loaded");

    sqlx::query("UPDATE repo_sync_queue SET status = $1, done_at = now() WHERE id = $2")
        .bind(crate::models::status::DONE)
        .bind(ctx.job.queue_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Append one CSV row for COPY. Present values are always quoted; an
/// unquoted empty field is how COPY csv spells NULL.
fn encode_copy_row(out: &mut Vec<u8>, repo_id: Uuid, record: &BlameRecord) {
    let repo_id = repo_id.to_string();
    let line_no = record.line_no.to_string();
    let when = record
        .author_when
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

    let fields: [Option<&str>; 8] = [
        Some(&repo_id),
        Some(&record.path),
        Some(&line_no),
        record.line.as_deref(),
        record.commit_hash.as_deref(),
        record.author_name.as_deref(),
        record.author_email.as_deref(),
        when.as_deref(),
    ];

    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        if let Some(value) = field {
            out.push(b'"');
            for &b in value.as_bytes() {
                if b == b'"' {
                    out.push(b'"');
                }
                out.push(b);
            }
            out.push(b'"');
        }
    }
    out.push(b'\n');
}
