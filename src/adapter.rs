// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The assistant adapter contract (§6) and the built-in echo adapter used
//! when the host passes no adapter of its own.

use async_trait::async_trait;

/// Result of one adapter invocation. A bare string result from the host is
/// treated as `{exit_code: 0, output: string}`.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub exit_code: i32,
    pub output: String,
}

impl AdapterResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { exit_code: 0, output: output.into() }
    }
}

/// A sink for streaming output chunks, passed to `execute_with_tui`.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn write_output(&self, chunk: &str);
}

/// The assistant adapter: the one external collaborator the dispatcher
/// drives per user conversation (§6). Hosts implement this over whatever
/// backs their assistant; the core only ever sees this trait.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Whether this adapter supports the streaming path. The dispatcher only
    /// takes the streaming branch when this is `true`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Run to completion and return the full output (§4.6 step 6).
    async fn execute(&self, prompt: &str) -> anyhow::Result<AdapterResult>;

    /// Run with incremental output delivered to `sink` as it is produced.
    /// Only called when `supports_streaming()` is `true`.
    async fn execute_with_tui(&self, prompt: &str, sink: &dyn ChunkSink) -> anyhow::Result<AdapterResult> {
        let _ = sink;
        self.execute(prompt).await
    }
}

/// The built-in default adapter: echoes the last `User:` line back verbatim.
/// Used in tests and when no host adapter is configured.
pub struct EchoAdapter;

#[async_trait]
impl Adapter for EchoAdapter {
    fn supports_streaming(&self) -> bool {
        false
    }

    async fn execute(&self, prompt: &str) -> anyhow::Result<AdapterResult> {
        let last_user_line = prompt
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("User: "))
            .unwrap_or("");
        Ok(AdapterResult::ok(format!("echo: {last_user_line}")))
    }
}

#[cfg(test)]
mod adapter_tests {
    use super::*;

    #[tokio::test]
    async fn echo_adapter_reflects_last_user_line() {
        let adapter = EchoAdapter;
        let result = adapter
            .execute("User: hi\nAssistant: hello\nUser: how are you")
            .await
            .unwrap_or_else(|e| panic!("execute: {e}"));
        assert_eq!(result.output, "echo: how are you");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn non_streaming_adapter_falls_back_from_execute_with_tui() {
        struct NonStreaming;
        #[async_trait]
        impl Adapter for NonStreaming {
            async fn execute(&self, _prompt: &str) -> anyhow::Result<AdapterResult> {
                Ok(AdapterResult::ok("done"))
            }
        }
        struct NullSink;
        #[async_trait]
        impl ChunkSink for NullSink {
            async fn write_output(&self, _chunk: &str) {}
        }

        let adapter = NonStreaming;
        let result = adapter
            .execute_with_tui("prompt", &NullSink)
            .await
            .unwrap_or_else(|e| panic!("execute: {e}"));
        assert_eq!(result.output, "done");
    }
}
