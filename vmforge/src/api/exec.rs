//! `/exec` (C10): streams a guest command's output as Server-Sent Events.
//!
//! One SSH session per request, executed over the same tunnel the readiness
//! probe uses. Stdout/stderr are delivered on a single SSH channel
//! (`ChannelMsg::Data` / `ChannelMsg::ExtendedData`), so events already
//! arrive in wire order — we only need to split each stream into
//! line-buffered chunks before turning them into `out`/`error` events.
//!
//! The generator owns the SSH channel directly (rather than handing it to a
//! detached task) so that dropping the SSE response future — which axum
//! does when the client disconnects — drops the channel too, and its guard
//! sends the configured signal (default `SIGTERM`) to the remote process
//! (§4.10, §5 "Cancellation semantics").

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use serde::Deserialize;
use vmforge_types::VmConfig;

use crate::net::ssh::SshSession;

/// Largest line this server will buffer before flushing it as a (possibly
/// truncated) event, per §4.10.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct ExecState {
    pub config: Arc<VmConfig>,
}

/// Sends `SIGTERM` to the remote process when dropped before an exit status
/// was observed — the path taken both on normal completion (harmless, the
/// process has already exited) and on client disconnect (the path this
/// exists for).
struct TerminateOnDrop {
    channel: Option<Channel<Msg>>,
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            tokio::spawn(async move {
                let _ = channel.signal(Sig::TERM).await;
            });
        }
    }
}

pub async fn exec(
    State(state): State<ExecState>,
    Json(request): Json<ExecRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let body = stream! {
        let session = SshSession::connect(
            state.config.ssh.host_port,
            &state.config.ssh.user,
            &state.config.ssh.private_key_path,
        )
        .await;

        let mut session = match session {
            Ok(s) => s,
            Err(e) => {
                yield Ok(Event::default().event("error").data(e.to_string()));
                yield Ok(Event::default().event("done").data("-1"));
                return;
            }
        };

        let command = build_command_line(&request);
        let channel = match session.open_exec(&command).await {
            Ok(c) => c,
            Err(e) => {
                yield Ok(Event::default().event("error").data(e.to_string()));
                yield Ok(Event::default().event("done").data("-1"));
                return;
            }
        };

        let mut guard = TerminateOnDrop { channel: Some(channel) };
        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut exit_status: Option<i32> = None;

        loop {
            let channel = guard.channel.as_mut().expect("channel taken only on drop");
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    for line in split_lines(&mut stdout_buf, &data) {
                        yield Ok(Event::default().event("out").data(line));
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    for line in split_lines(&mut stderr_buf, &data) {
                        yield Ok(Event::default().event("error").data(line));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status as i32);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        if !stdout_buf.is_empty() {
            yield Ok(Event::default().event("out").data(String::from_utf8_lossy(&stdout_buf).to_string()));
        }
        if !stderr_buf.is_empty() {
            yield Ok(Event::default().event("error").data(String::from_utf8_lossy(&stderr_buf).to_string()));
        }

        // Exit status observed: the remote process is already done, so the
        // drop guard's signal below is a harmless no-op.
        drop(guard);
        session.disconnect().await;
        yield Ok(Event::default().event("done").data(exit_status.unwrap_or(-1).to_string()));
    };

    Sse::new(body).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Drains complete `\n`-terminated lines out of `buf`, returning them as
/// owned strings; a line that grows past `MAX_LINE_BYTES` without a
/// newline is flushed early (truncated) rather than buffered forever.
pub(crate) fn split_lines(buf: &mut Vec<u8>, data: &[u8]) -> Vec<String> {
    buf.extend_from_slice(data);
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim_end_matches('\n').to_string());
    }
    if buf.len() > MAX_LINE_BYTES {
        let overflow: Vec<u8> = buf.drain(..MAX_LINE_BYTES).collect();
        lines.push(String::from_utf8_lossy(&overflow).to_string());
    }
    lines
}

pub(crate) fn build_command_line(request: &ExecRequest) -> String {
    let mut parts = Vec::with_capacity(request.env.len() + 1 + request.args.len());
    for (k, v) in &request.env {
        parts.push(format!("{k}={}", shell_quote(v)));
    }
    parts.push(shell_quote(&request.bin));
    for arg in &request.args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `exec()`'s loop calls `split_lines` once per `ChannelMsg` in the order
    /// `channel.wait()` yields them, so the `out,out,out,error,done` property
    /// (§4.10) reduces to: does `split_lines` preserve arrival order and
    /// split correctly across chunk boundaries? Exercised here directly,
    /// since driving the real `russh` channel would need a live SSH server.
    #[test]
    fn split_lines_emits_complete_lines_in_arrival_order() {
        let mut buf = Vec::new();

        let first = split_lines(&mut buf, b"hel");
        assert!(first.is_empty());

        let second = split_lines(&mut buf, b"lo\nworld\npartial");
        assert_eq!(second, vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(buf, b"partial");
    }

    #[test]
    fn split_lines_handles_empty_lines_and_multiple_newlines_in_one_chunk() {
        let mut buf = Vec::new();
        let lines = split_lines(&mut buf, b"a\n\nb\n");
        assert_eq!(lines, vec!["a".to_string(), "".to_string(), "b".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_lines_truncates_at_max_line_bytes_without_a_newline() {
        let mut buf = Vec::new();
        let oversized = vec![b'x'; MAX_LINE_BYTES + 500];

        let lines = split_lines(&mut buf, &oversized);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(buf.len(), 500);

        // The remainder is still buffered and flushes normally once terminated.
        let rest = split_lines(&mut buf, b"\n");
        assert_eq!(rest, vec!["x".repeat(500)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_lines_does_not_truncate_a_line_exactly_at_the_boundary() {
        let mut buf = Vec::new();
        let exact = vec![b'y'; MAX_LINE_BYTES];

        let lines = split_lines(&mut buf, &exact);
        assert!(lines.is_empty());
        assert_eq!(buf.len(), MAX_LINE_BYTES);
    }

    #[test]
    fn build_command_line_quotes_bin_args_and_env_in_order() {
        let request = ExecRequest {
            bin: "echo".to_string(),
            args: vec!["hello world".to_string(), "plain".to_string()],
            env: vec![("FOO".to_string(), "bar baz".to_string())],
        };
        assert_eq!(build_command_line(&request), "FOO='bar baz' echo 'hello world' plain");
    }

    #[test]
    fn shell_quote_leaves_safe_tokens_bare() {
        assert_eq!(shell_quote("plain-token_1.2:3="), "plain-token_1.2:3=");
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's here"), "'it'\\''s here'");
    }

    #[test]
    fn shell_quote_wraps_empty_string() {
        assert_eq!(shell_quote(""), "''");
    }
}
