//! Search Adapter (component I): shells out to an `rg`-compatible
//! binary and parses its line-oriented JSON protocol (spec §4.9).

use crate::error::WikiError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub context: usize,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub line: String,
    pub line_number: u64,
    pub column: u64,
    pub matched_text: String,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

/// Returns `Ok(())` if an `rg`-compatible binary is reachable. Called
/// once at startup; spec §6 requires service construction to fail fast
/// if the search binary is absent.
pub fn check_binary_available() -> Result<(), WikiError> {
    std::process::Command::new("rg")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| WikiError::io("locate search binary", "rg", e))
        .and_then(|status| {
            if status.success() {
                Ok(())
            } else {
                Err(WikiError::ServiceUnavailable)
            }
        })
}

/// Runs a search, killing the underlying `rg` process if `cancel` fires
/// (request disconnected or superseded) or the internal timeout elapses
/// first (spec §5: "in-flight searches receive kill on context expiry").
pub async fn search(
    root: &Path,
    query: &str,
    options: &SearchOptions,
    cancel: CancellationToken,
) -> Result<Vec<SearchResult>, WikiError> {
    if query.trim().is_empty() {
        return Err(WikiError::InvalidPayload("query is required".to_string()));
    }

    let mut args = vec![
        "--json".to_string(),
        "--line-number".to_string(),
        "--color".to_string(),
        "never".to_string(),
        "--no-heading".to_string(),
    ];

    if options.case_sensitive {
        args.push("--case-sensitive".to_string());
    } else {
        args.push("--smart-case".to_string());
    }

    if options.context > 0 {
        args.push("-C".to_string());
        args.push(options.context.to_string());
    }

    if options.hidden {
        args.push("--hidden".to_string());
    }

    let globs = if options.include_globs.is_empty() && options.exclude_globs.is_empty() {
        vec!["*.md".to_string(), "*.markdown".to_string()]
    } else {
        let mut globs = options.include_globs.clone();
        globs.extend(options.exclude_globs.iter().map(|g| format!("!{g}")));
        globs
    };
    for glob in globs {
        args.push("--glob".to_string());
        args.push(glob);
    }

    args.push("--".to_string());
    args.push(query.to_string());
    args.push("./".to_string());

    let mut child = Command::new("rg")
        .args(&args)
        .current_dir(root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Belt-and-braces: if this future itself is dropped (the
        // request's own future was cancelled by a connection close or
        // the outer request timeout) without reaching either branch
        // below, tokio kills the child rather than leaving it running.
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WikiError::io("spawn search process", root, e))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    // `read_messages` only owns `lines`, never `child`, so the
    // cancellation/timeout branches below remain free to kill and wait
    // on `child` without conflicting with this future's borrow.
    let read_messages = async {
        let mut messages = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(msg) = serde_json::from_str::<RgMessage>(&line) {
                messages.push(msg);
            }
        }
        messages
    };

    let messages = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(WikiError::Internal("search cancelled".to_string()));
        }
        result = tokio::time::timeout(SEARCH_TIMEOUT, read_messages) => {
            match result {
                Ok(messages) => messages,
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(WikiError::Internal("search timed out".to_string()));
                }
            }
        }
    };

    let status = child
        .wait()
        .await
        .map_err(|e| WikiError::io("wait on search process", root, e))?;

    // Exit code 1 means "ran fine, no matches" for ripgrep.
    if !status.success() && status.code() != Some(1) {
        return Err(WikiError::Internal("search process failed".to_string()));
    }

    Ok(collate(messages, options.context))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RgMessage {
    Match { data: RgMatchData },
    Context { data: RgMatchData },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RgMatchData {
    path: RgText,
    lines: RgText,
    line_number: Option<u64>,
    #[serde(default)]
    submatches: Vec<RgSubmatch>,
}

#[derive(Debug, Deserialize)]
struct RgText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RgSubmatch {
    #[serde(rename = "match")]
    matched: RgText,
    start: u64,
}

/// ripgrep streams `context` messages both before and after a `match`
/// message for the same path, in file order. A single linear pass keeps
/// a bounded trailing window for `before` and, once a match is seen,
/// drains the next `context` same-path context lines straight into that
/// match's `after` as they arrive.
fn collate(messages: Vec<RgMessage>, context: usize) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = Vec::new();
    let mut before_window: Vec<(String, String)> = Vec::new();
    let mut awaiting_after: Option<(usize, String, usize)> = None;

    for message in messages {
        match message {
            RgMessage::Context { data } => {
                let path = data.path.text.clone();
                let line = strip_newline(&data.lines.text);

                if let Some((idx, ref awaited_path, remaining)) = awaiting_after {
                    if remaining > 0 && *awaited_path == path {
                        results[idx].after.push(line.clone());
                        awaiting_after = Some((idx, path.clone(), remaining - 1));
                    } else {
                        awaiting_after = None;
                    }
                }

                before_window.push((path, line));
                if before_window.len() > context.max(1) {
                    before_window.remove(0);
                }
            }
            RgMessage::Match { data } => {
                let first = data.submatches.first();
                let column = first.map(|s| s.start + 1).unwrap_or(1);
                let matched_text = first.map(|s| s.matched.text.clone()).unwrap_or_default();

                let before: Vec<String> = before_window
                    .iter()
                    .filter(|(path, _)| *path == data.path.text)
                    .take(context)
                    .map(|(_, line)| line.clone())
                    .collect();

                results.push(SearchResult {
                    path: data.path.text.clone(),
                    line: strip_newline(&data.lines.text),
                    line_number: data.line_number.unwrap_or(0),
                    column,
                    matched_text,
                    before,
                    after: Vec::new(),
                });
                before_window.clear();
                awaiting_after = Some((results.len() - 1, data.path.text, context));
            }
            RgMessage::Other => {}
        }
    }

    results
}

fn strip_newline(line: &str) -> String {
    line.trim_end_matches('\n').trim_end_matches('\r').to_string()
}
