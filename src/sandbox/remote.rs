// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP sandbox backend.
//!
//! Talks to a sandbox host exposing:
//!
//! | Method | Path                         | Body                       |
//! |--------|------------------------------|----------------------------|
//! | POST   | `/sandboxes`                 | `{template, timeoutMs}`    |
//! | GET    | `/sandboxes/{id}`            |                            |
//! | POST   | `/sandboxes/{id}/timeout`    | `{timeoutMs}`              |
//! | POST   | `/sandboxes/{id}/commands`   | `{cmd, timeoutMs}`         |
//! | PUT    | `/sandboxes/{id}/files?path` | raw file content           |
//! | GET    | `/sandboxes/{id}/files?path` |                            |
//!
//! Command output is streamed back as newline-delimited JSON frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(feature = "telemetry")]
use tracing::debug;

use super::{normalize_path, CommandOutput, OutputChunk, Sandbox, SandboxProvider};
use crate::error::SandboxError;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Extra time allowed past a command's own timeout before the HTTP call gives up.
const COMMAND_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    template: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutRequest {
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    cmd: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    sandbox_id: String,
    domain: String,
}

/// One frame of a command stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CommandFrame {
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error {
        message: String,
        #[serde(default, rename = "timedOut")]
        timed_out: bool,
    },
}

struct RemoteApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteApi {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send and map non-success statuses. `not_found` builds the error for 404.
    async fn send(
        &self,
        builder: RequestBuilder,
        not_found: impl FnOnce() -> SandboxError,
    ) -> Result<Response, SandboxError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(not_found());
        }

        let message = response
            .text()
            .await
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| status.to_string());
        Err(SandboxError::Api {
            message,
            status_code: Some(status.as_u16()),
        })
    }
}

/// Sandbox provider backed by a remote sandbox host.
pub struct RemoteSandboxProvider {
    api: Arc<RemoteApi>,
}

impl RemoteSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api: Arc::new(RemoteApi {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key,
            }),
        }
    }
}

#[async_trait]
impl SandboxProvider for RemoteSandboxProvider {
    async fn create(&self, template: &str, idle_timeout: Duration) -> Result<String, SandboxError> {
        let body = CreateRequest {
            template,
            timeout_ms: idle_timeout.as_millis() as u64,
        };
        let response = self
            .api
            .send(self.api.request(Method::POST, "/sandboxes").json(&body), || {
                SandboxError::Unavailable("sandbox host does not serve /sandboxes".to_string())
            })
            .await?;
        let info: SandboxInfo = response.json().await?;

        #[cfg(feature = "telemetry")]
        debug!(sandbox_id = %info.sandbox_id, template, "Created remote sandbox");

        Ok(info.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let path = format!("/sandboxes/{}", sandbox_id);
        let response = self
            .api
            .send(self.api.request(Method::GET, &path), || {
                SandboxError::Unavailable(format!("sandbox {} not found", sandbox_id))
            })
            .await?;
        let info: SandboxInfo = response.json().await?;

        Ok(Arc::new(RemoteSandbox {
            api: Arc::clone(&self.api),
            id: info.sandbox_id,
            domain: info.domain,
        }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let path = format!("/sandboxes/{}", sandbox_id);
        match self
            .api
            .send(self.api.request(Method::DELETE, &path), || SandboxError::Api {
                message: format!("sandbox {} not found", sandbox_id),
                status_code: Some(404),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(SandboxError::Api {
                status_code: Some(404),
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A connected remote sandbox.
pub struct RemoteSandbox {
    api: Arc<RemoteApi>,
    id: String,
    domain: String,
}

impl RemoteSandbox {
    fn path(&self, suffix: &str) -> String {
        format!("/sandboxes/{}{}", self.id, suffix)
    }

    fn gone(&self) -> SandboxError {
        SandboxError::Unavailable(format!("sandbox {} not found", self.id))
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        output: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<CommandOutput, SandboxError> {
        let timeout_ms = timeout.as_millis() as u64;
        let body = CommandRequest {
            cmd: command,
            timeout_ms,
        };
        let request = self
            .api
            .request(Method::POST, &self.path("/commands"))
            .timeout(timeout + COMMAND_GRACE)
            .json(&body);

        let mut response = self
            .api
            .send(request, || self.gone())
            .await
            .map_err(|e| timed_out(e, timeout_ms))?;

        let mut decoder = LineDecoder::default();
        let mut collected = CommandOutput::default();
        let mut exit_code = None;

        while let Some(bytes) = response.chunk().await.map_err(|e| timed_out(e.into(), timeout_ms))? {
            for line in decoder.push(&bytes) {
                let frame: CommandFrame = serde_json::from_str(&line).map_err(|e| SandboxError::Api {
                    message: format!("malformed command frame: {}", e),
                    status_code: None,
                })?;
                match frame {
                    CommandFrame::Stdout { data } => {
                        collected.stdout.push_str(&data);
                        if let Some(ref tx) = output {
                            let _ = tx.send(OutputChunk::Stdout(data));
                        }
                    }
                    CommandFrame::Stderr { data } => {
                        collected.stderr.push_str(&data);
                        if let Some(ref tx) = output {
                            let _ = tx.send(OutputChunk::Stderr(data));
                        }
                    }
                    CommandFrame::Exit { exit_code: code } => exit_code = Some(code),
                    CommandFrame::Error { message, timed_out } => {
                        return Err(if timed_out {
                            SandboxError::Timeout(timeout_ms)
                        } else {
                            SandboxError::CommandFailed(message)
                        });
                    }
                }
            }
        }

        collected.exit_code = exit_code.ok_or_else(|| SandboxError::Api {
            message: "command stream ended without an exit frame".to_string(),
            status_code: None,
        })?;
        Ok(collected)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let path = normalize_path(path)?;
        let request = self
            .api
            .request(Method::PUT, &self.path("/files"))
            .query(&[("path", path.as_str())])
            .body(content.to_string());
        self.api.send(request, || self.gone()).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let normalized = normalize_path(path)?;
        let request = self
            .api
            .request(Method::GET, &self.path("/files"))
            .query(&[("path", normalized.as_str())]);
        let response = self
            .api
            .send(request, || SandboxError::FileNotFound(path.to_string()))
            .await?;
        Ok(response.text().await?)
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let body = TimeoutRequest {
            timeout_ms: timeout.as_millis() as u64,
        };
        let request = self.api.request(Method::POST, &self.path("/timeout")).json(&body);
        self.api.send(request, || self.gone()).await?;
        Ok(())
    }

    fn host(&self, port: u16) -> String {
        format!("{}-{}.{}", port, self.id, self.domain)
    }
}

fn timed_out(err: SandboxError, timeout_ms: u64) -> SandboxError {
    match err {
        SandboxError::Timeout(_) => SandboxError::Timeout(timeout_ms),
        other => other,
    }
}

/// Splits a byte stream into non-empty lines.
#[derive(Debug, Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a random port.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn sandbox(base_url: String) -> RemoteSandbox {
        RemoteSandbox {
            api: Arc::new(RemoteApi {
                client: Client::new(),
                base_url,
                api_key: None,
            }),
            id: "sbx1".to_string(),
            domain: "sandbox.test".to_string(),
        }
    }

    #[test]
    fn test_line_decoder_handles_split_frames() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(br#"{"type":"std"#).is_empty());
        let lines = decoder.push(b"out\",\"data\":\"hi\"}\n\n{\"type\":\"exit\",\"exitCode\":0}\n");
        assert_eq!(lines.len(), 2);
        assert!(matches!(
            serde_json::from_str::<CommandFrame>(&lines[1]).unwrap(),
            CommandFrame::Exit { exit_code: 0 }
        ));
    }

    #[test]
    fn test_host_format() {
        let sandbox = sandbox("http://unused".to_string());
        assert_eq!(sandbox.host(3000), "3000-sbx1.sandbox.test");
    }

    #[tokio::test]
    async fn test_execute_collects_stream() {
        let body = [
            r#"{"type":"stdout","data":"added 1 package\n"}"#,
            r#"{"type":"stderr","data":"warn\n"}"#,
            r#"{"type":"exit","exitCode":0}"#,
        ]
        .join("\n");
        let base = serve_once("200 OK", body).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = sandbox(base)
            .execute("npm install", Duration::from_secs(5), Some(tx))
            .await
            .unwrap();

        assert_eq!(out.stdout, "added 1 package\n");
        assert_eq!(out.stderr, "warn\n");
        assert_eq!(out.exit_code, 0);
        assert_eq!(rx.recv().await, Some(OutputChunk::Stdout("added 1 package\n".to_string())));
    }

    #[tokio::test]
    async fn test_execute_error_frame_timeout() {
        let body = r#"{"type":"error","message":"deadline exceeded","timedOut":true}"#.to_string();
        let base = serve_once("200 OK", body).await;

        let err = sandbox(base)
            .execute("npm run build", Duration::from_millis(1500), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(1500)));
    }

    #[tokio::test]
    async fn test_missing_sandbox_is_unavailable() {
        let base = serve_once("404 Not Found", String::new()).await;
        let provider = RemoteSandboxProvider::new(base, None);

        let err = provider.connect("sbx-gone").await.err().unwrap();
        assert!(matches!(err, SandboxError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_destroy_treats_missing_sandbox_as_gone() {
        let base = serve_once("404 Not Found", String::new()).await;
        let provider = RemoteSandboxProvider::new(base, None);
        provider.destroy("sbx-gone").await.unwrap();

        let base = serve_once("500 Internal Server Error", "boom".to_string()).await;
        let provider = RemoteSandboxProvider::new(base, None);
        assert!(provider.destroy("sbx-1").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = RemoteSandboxProvider::new(format!("http://{}", addr), None);
        let err = provider.create("nextjs", Duration::from_secs(60)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_server_error_is_not_fatal() {
        let base = serve_once("500 Internal Server Error", "boom".to_string()).await;

        let err = sandbox(base).write_file("app/page.tsx", "x").await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Api {
                status_code: Some(500),
                ..
            }
        ));
        assert!(!err.is_fatal());
    }
}
