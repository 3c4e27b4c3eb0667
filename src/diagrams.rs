//! D2 diagram compilation, invoked from the renderer for `d2`-language
//! fenced code blocks. An external collaborator (spec §6); absence of the
//! `d2` binary degrades to an error stub rather than failing the render.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const D2_COMPILE_TIMEOUT: Duration = Duration::from_secs(12);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Compiles D2 source to an SVG string. On any failure (binary missing,
/// non-zero exit, timeout) returns an error message suitable for display
/// in an error stub; it never panics the render. On timeout the `d2`
/// process is killed rather than left to finish in the background.
pub fn compile_d2(source: &str) -> Result<String, String> {
    let mut child = Command::new("d2")
        .args(["-", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("d2 binary unavailable: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(source.as_bytes());
    }

    // Drain stdout/stderr on their own threads so a full pipe buffer can
    // never deadlock the `try_wait` poll loop below.
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        let _ = stdout_tx.send(buf);
    });
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    let deadline = Instant::now() + D2_COMPILE_TIMEOUT;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err("d2 compile timed out".to_string());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => break Err(format!("d2 process error: {e}")),
        }
    }?;

    let stdout_buf = stdout_rx.recv().unwrap_or_default();
    let stderr_buf = stderr_rx.recv().unwrap_or_default();

    if status.success() {
        String::from_utf8(stdout_buf).map_err(|e| format!("d2 produced non-utf8 output: {e}"))
    } else {
        Err(format!(
            "d2 compile failed: {}",
            String::from_utf8_lossy(&stderr_buf)
        ))
    }
}

/// Wraps a compile result into the HTML fragment the renderer embeds in
/// place of the fenced code block.
pub fn render_d2_block(source: &str) -> String {
    match compile_d2(source) {
        Ok(svg) => format!("<div class=\"d2-diagram\">{svg}</div>"),
        Err(message) => format!(
            "<div class=\"d2-diagram d2-error\">diagram compile failed: {}</div>",
            html_escape(&message)
        ),
    }
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
