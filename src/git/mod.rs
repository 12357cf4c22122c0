use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Read-buffer size for blame output. Minified or generated sources can
/// carry single lines far past the usual 64 KiB, so run at 30x that.
pub const BLAME_READ_BUFFER: usize = 30 * 64 * 1024;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} failed ({status}): {stderr}")]
    Exit {
        command: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("git {command} cancelled")]
    Cancelled { command: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Tree Entries ─────────────────────────────────────

/// One record of `ls-tree -r -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: String,
    pub path: String,
}

impl TreeEntry {
    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

// ─── Blame Lines ──────────────────────────────────────

/// One line of blame output, attributed to the commit that last touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameLine {
    pub commit_hash: String,
    /// 1-based line number in the file's current form.
    pub line_no: u32,
    /// None when the source bytes are not valid UTF-8.
    pub line: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub author_when: Option<DateTime<Utc>>,
}

// ─── Git CLI Adapter ──────────────────────────────────

/// Thin wrapper over the `git` binary for one on-disk repository.
///
/// Every call races the subprocess against the cancellation token;
/// `kill_on_drop` reaps the child when the token wins.
pub struct GitCli {
    dir: PathBuf,
}

impl GitCli {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Clone `url` into `dest`. Pass `git_ref` to check out a specific
    /// branch or tag; history is always full — blame attribution breaks
    /// across shallow boundaries.
    pub async fn clone_repo(
        cancel: &CancellationToken,
        url: &str,
        git_ref: Option<&str>,
        dest: &Path,
    ) -> Result<GitCli, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if let Some(git_ref) = git_ref {
            cmd.arg("--branch").arg(git_ref);
        }
        cmd.arg(url).arg(dest);
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        run_to_completion(cmd, "clone", cancel).await?;
        Ok(GitCli::new(dest))
    }

    /// Recursively list the tree at `rev`.
    pub async fn ls_tree(
        &self,
        cancel: &CancellationToken,
        rev: &str,
    ) -> Result<Vec<TreeEntry>, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir).args(["ls-tree", "-r", "-z", rev]);

        let stdout = run_to_completion(cmd, "ls-tree", cancel).await?;
        Ok(parse_ls_tree(&stdout))
    }

    /// Per-line blame of `path` at HEAD.
    ///
    /// Output is streamed through the enlarged read buffer rather than
    /// collected via `wait_with_output`, so a pathological file cannot
    /// balloon a single allocation.
    pub async fn blame(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<Vec<BlameLine>, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.dir)
            .args(["blame", "--line-porcelain", "HEAD", "--"])
            .arg(path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("git blame stdout not captured"))?;
        let mut reader = BufReader::with_capacity(BLAME_READ_BUFFER, stdout);

        let mut parser = PorcelainParser::default();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read?,
                _ = cancel.cancelled() => {
                    return Err(GitError::Cancelled { command: "blame" });
                }
            };
            if n == 0 {
                break;
            }
            parser.feed(&buf);
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => {
                return Err(GitError::Cancelled { command: "blame" });
            }
        };
        if !output.status.success() {
            return Err(GitError::Exit {
                command: "blame",
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parser.finish())
    }
}

/// Embed a token into an https clone URL. Non-https URLs and URLs that
/// already carry userinfo pass through untouched.
pub fn authenticated_url(url: &str, token: &str) -> String {
    let Some(rest) = url.strip_prefix("https://") else {
        return url.to_string();
    };
    let host_part = rest.split('/').next().unwrap_or(rest);
    if host_part.contains('@') {
        return url.to_string();
    }
    format!("https://{}@{}", token, rest)
}

/// Run a git subprocess to completion, returning its stdout.
async fn run_to_completion(
    mut cmd: Command,
    command: &'static str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, GitError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let output = tokio::select! {
        out = child.wait_with_output() => out?,
        _ = cancel.cancelled() => {
            return Err(GitError::Cancelled { command });
        }
    };

    if !output.status.success() {
        return Err(GitError::Exit {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

// ─── Parsers ──────────────────────────────────────────

/// `<mode> <type> <sha>\t<path>` records, NUL-separated.
fn parse_ls_tree(raw: &[u8]) -> Vec<TreeEntry> {
    let mut entries = Vec::new();
    for record in raw.split(|&b| b == 0) {
        if record.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(record);
        let Some((meta, path)) = text.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split_whitespace();
        let _mode = fields.next();
        let Some(kind) = fields.next() else { continue };
        entries.push(TreeEntry {
            kind: kind.to_string(),
            path: path.to_string(),
        });
    }
    entries
}

/// Strip the datastore-hostile bits from a content line: non-UTF-8 becomes
/// None, embedded NUL bytes are dropped, one trailing CR (CRLF sources) is
/// trimmed.
fn sanitize_line(content: &[u8]) -> Option<String> {
    let content = content.strip_suffix(b"\r").unwrap_or(content);
    let text = std::str::from_utf8(content).ok()?;
    if text.contains('\u{0000}') {
        Some(text.replace('\u{0000}', ""))
    } else {
        Some(text.to_string())
    }
}

/// Incremental parser for `blame --line-porcelain` output.
///
/// Every content line is preceded by a full header group; the parser keeps
/// the most recent header fields and emits one `BlameLine` per `\t` line.
#[derive(Default)]
struct PorcelainParser {
    lines: Vec<BlameLine>,
    commit_hash: String,
    line_no: u32,
    author_name: Option<String>,
    author_email: Option<String>,
    author_when: Option<DateTime<Utc>>,
}

impl PorcelainParser {
    fn feed(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);

        if let Some(content) = raw.strip_prefix(b"\t") {
            self.lines.push(BlameLine {
                commit_hash: self.commit_hash.clone(),
                line_no: self.line_no,
                line: sanitize_line(content),
                author_name: self.author_name.clone(),
                author_email: self.author_email.clone(),
                author_when: self.author_when,
            });
            return;
        }

        // Header lines; author names can be non-UTF-8, take them lossily.
        let text = String::from_utf8_lossy(raw);
        if let Some(name) = text.strip_prefix("author ") {
            self.author_name = Some(name.to_string());
        } else if let Some(mail) = text.strip_prefix("author-mail ") {
            self.author_email = Some(
                mail.trim_start_matches('<').trim_end_matches('>').to_string(),
            );
        } else if let Some(epoch) = text.strip_prefix("author-time ") {
            self.author_when = epoch
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        } else if let Some((hash, line_no)) = parse_group_header(&text) {
            self.commit_hash = hash;
            self.line_no = line_no;
            self.author_name = None;
            self.author_email = None;
            self.author_when = None;
        }
    }

    fn finish(self) -> Vec<BlameLine> {
        self.lines
    }
}

/// `<sha> <orig-line> <final-line> [<group-size>]`
fn parse_group_header(text: &str) -> Option<(String, u32)> {
    let mut fields = text.split(' ');
    let hash = fields.next()?;
    if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let _orig: u32 = fields.next()?.parse().ok()?;
    let final_no: u32 = fields.next()?.parse().ok()?;
    Some((hash.to_string(), final_no))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "d670460b4b4aece5915caf5c68d12f560a9fe3e4";

    fn porcelain_group(line_no: u32, content: &str) -> String {
        format!(
            "{SHA} {line_no} {line_no} 1\n\
             author Ada Lovelace\n\
             author-mail <ada@example.com>\n\
             author-time 1700000000\n\
             author-tz +0100\n\
             committer Ada Lovelace\n\
             committer-mail <ada@example.com>\n\
             committer-time 1700000000\n\
             committer-tz +0100\n\
             summary first commit\n\
             filename a.txt\n\
             \t{content}\n"
        )
    }

    fn parse(input: &str) -> Vec<BlameLine> {
        let mut parser = PorcelainParser::default();
        for line in input.split_inclusive('\n') {
            parser.feed(line.as_bytes());
        }
        parser.finish()
    }

    #[test]
    fn porcelain_parses_two_line_file() {
        let input = format!("{}{}", porcelain_group(1, "hello"), porcelain_group(2, "world"));
        let lines = parse(&input);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_no, 1);
        assert_eq!(lines[0].line.as_deref(), Some("hello"));
        assert_eq!(lines[0].commit_hash, SHA);
        assert_eq!(lines[0].author_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(lines[0].author_email.as_deref(), Some("ada@example.com"));
        assert_eq!(
            lines[0].author_when,
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        assert_eq!(lines[1].line_no, 2);
        assert_eq!(lines[1].line.as_deref(), Some("world"));
    }

    #[test]
    fn porcelain_strips_embedded_nul() {
        let input = porcelain_group(1, "abc\u{0000}def");
        let lines = parse(&input);
        assert_eq!(lines[0].line.as_deref(), Some("abcdef"));
    }

    #[test]
    fn porcelain_nulls_non_utf8_content() {
        let mut parser = PorcelainParser::default();
        for line in porcelain_group(1, "placeholder").split_inclusive('\n') {
            if line.starts_with('\t') {
                parser.feed(b"\t\xff\xfe broken\n");
            } else {
                parser.feed(line.as_bytes());
            }
        }
        let lines = parser.finish();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, None);
        assert_eq!(lines[0].commit_hash, SHA);
    }

    #[test]
    fn porcelain_trims_trailing_cr() {
        let input = porcelain_group(1, "dos line\r");
        let lines = parse(&input);
        assert_eq!(lines[0].line.as_deref(), Some("dos line"));
    }

    #[test]
    fn group_header_rejects_non_sha_lines() {
        assert!(parse_group_header("summary first commit").is_none());
        assert!(parse_group_header("boundary").is_none());
        assert_eq!(
            parse_group_header(&format!("{SHA} 3 7 1")),
            Some((SHA.to_string(), 7))
        );
    }

    #[test]
    fn ls_tree_keeps_paths_with_spaces_and_skips_non_blobs() {
        let raw = format!(
            "100644 blob {SHA}\ta.txt\0040000 tree {SHA}\tsrc\0100644 blob {SHA}\tdocs/read me.md\0"
        );
        let entries = parse_ls_tree(raw.as_bytes());

        assert_eq!(entries.len(), 3);
        let blobs: Vec<_> = entries.iter().filter(|e| e.is_blob()).collect();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].path, "a.txt");
        assert_eq!(blobs[1].path, "docs/read me.md");
    }

    #[test]
    fn authenticated_url_embeds_token_for_https_only() {
        assert_eq!(
            authenticated_url("https://github.com/acme/widgets", "tok123"),
            "https://tok123@github.com/acme/widgets"
        );
        assert_eq!(
            authenticated_url("https://user@github.com/acme/widgets", "tok123"),
            "https://user@github.com/acme/widgets"
        );
        assert_eq!(
            authenticated_url("git@github.com:acme/widgets.git", "tok123"),
            "git@github.com:acme/widgets.git"
        );
    }

    // End-to-end fixtures against the real git binary.

    async fn fixture_repo(dir: &Path) {
        let run = |args: Vec<String>| {
            let dir = dir.to_path_buf();
            async move {
                let status = Command::new("git")
                    .arg("-C")
                    .arg(&dir)
                    .args([
                        "-c",
                        "user.name=Test Author",
                        "-c",
                        "user.email=author@example.com",
                    ])
                    .args(&args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .unwrap();
                assert!(status.success(), "git {:?} failed", args);
            }
        };

        tokio::fs::write(dir.join("a.txt"), "hello\nworld\n").await.unwrap();
        run(vec!["init".into()]).await;
        run(vec!["add".into(), ".".into()]).await;
        run(vec!["commit".into(), "-m".into(), "first".into()]).await;
    }

    #[tokio::test]
    async fn ls_tree_and_blame_against_real_repo() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_repo(tmp.path()).await;

        let cancel = CancellationToken::new();
        let git = GitCli::new(tmp.path());

        let entries = git.ls_tree(&cancel, "HEAD").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a.txt");
        assert!(entries[0].is_blob());

        let lines = git.blame(&cancel, "a.txt").await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line.as_deref(), Some("hello"));
        assert_eq!(lines[1].line.as_deref(), Some("world"));
        assert_eq!(lines[0].author_email.as_deref(), Some("author@example.com"));
        assert!(lines[0].author_when.is_some());
    }

    #[tokio::test]
    async fn clone_from_local_path() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dst");
        tokio::fs::create_dir(&src).await.unwrap();
        fixture_repo(&src).await;

        let cancel = CancellationToken::new();
        let git = GitCli::clone_repo(&cancel, src.to_str().unwrap(), None, &dest)
            .await
            .unwrap();

        let entries = git.ls_tree(&cancel, "HEAD").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        fixture_repo(tmp.path()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let git = GitCli::new(tmp.path());
        match git.ls_tree(&cancel, "HEAD").await {
            Err(GitError::Cancelled { command }) => assert_eq!(command, "ls-tree"),
            // The child can still win the race on a fast machine.
            Ok(_) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
