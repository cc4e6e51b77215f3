//! Helper process execution
//!
//! Platform work the daemon does not do itself (packet filter, DNS, key
//! generation, KEM) is delegated to helper executables. A helper gets its
//! arguments on the command line and optional JSON on stdin, and answers on
//! stdout. Any non-zero exit is an error carrying the helper's stderr.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Run a helper and collect its stdout
pub async fn run(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
    log::debug!("Running helper: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Helper(format!("failed to execute {}: {}", program, e)))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Helper(format!("failed to wait for {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        log::error!(
            "Helper {} {} failed with exit code {}: {}",
            program,
            args.first().copied().unwrap_or_default(),
            exit_code,
            stderr.trim()
        );

        return Err(Error::Helper(format!(
            "{} exited with code {}: {}",
            program,
            exit_code,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Run a helper and return its trimmed stdout as text
pub async fn run_text(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
    let out = run(program, args, stdin).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// Run a helper with JSON input and parse its JSON answer
///
/// Empty output parses as `null`, so `()` and `Option<T>` work as answer types.
pub async fn run_json<T: DeserializeOwned>(
    program: &str,
    args: &[&str],
    input: Option<&Value>,
) -> Result<T> {
    let body = match input {
        Some(value) => Some(serde_json::to_vec(value)?),
        None => None,
    };
    let out = run(program, args, body.as_deref()).await?;
    let text = String::from_utf8_lossy(&out);
    let text = text.trim();
    let parsed = if text.is_empty() {
        serde_json::from_value(Value::Null)?
    } else {
        serde_json::from_str(text)?
    };
    Ok(parsed)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_echo() {
        let out = run_text("/bin/sh", &["-c", "echo hello"], None).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_run_passes_stdin() {
        let out = run_text("/bin/sh", &["-c", "cat"], Some(b"piped input"))
            .await
            .unwrap();
        assert_eq!(out, "piped input");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let err = run("/bin/sh", &["-c", "echo broken >&2; exit 3"], None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("/nonexistent/warden-helper", &[], None).await.unwrap_err();
        assert!(matches!(err, Error::Helper(_)));
    }

    #[tokio::test]
    async fn test_run_json_round_trip() {
        let value: Value = run_json("/bin/sh", &["-c", "cat"], Some(&json!({"enabled": true})))
            .await
            .unwrap();
        assert_eq!(value["enabled"], true);

        let unit: () = run_json("/bin/sh", &["-c", "true"], None).await.unwrap();
        assert_eq!(unit, ());
    }
}
