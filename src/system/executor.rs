// src/system/executor.rs

use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("no command specified to run")]
    EmptyCommand,
    #[error("command `{0}` could not be executed: {1}")]
    Spawn(String, std::io::Error),
    #[error("could not exchange data with `{0}`: {1}")]
    Io(String, std::io::Error),
    #[error("the concurrency throttle was closed")]
    ThrottleClosed,
}

/// Where the child's standard input comes from.
pub enum Stdin<'a> {
    Inherit,
    /// Piped bytes, typically a resolved variable value.
    Bytes(&'a [u8]),
    /// An open file shared across a sequence of spawns.
    File(&'a std::fs::File),
}

/// Where the child's standard output goes.
pub enum Stdout<'a> {
    Inherit,
    /// Captured and returned, to become a variable value.
    Capture,
    /// An open file shared across a sequence of spawns.
    File(&'a std::fs::File),
}

pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<i32>,
}

/// Spawns one subprocess with explicit argv (no shell interpretation) and
/// waits for it, optionally gated by a global concurrency throttle. Standard
/// error is always captured so the caller can log it. A non-zero exit status
/// is reported, not treated as an error here; whether the task achieved its
/// goals is decided by the caller.
pub async fn execute(
    argv: &[String],
    stdin: Stdin<'_>,
    stdout: Stdout<'_>,
    throttle: Option<&Semaphore>,
) -> Result<ProcessOutput, ExecutionError> {
    let _permit = match throttle {
        Some(semaphore) => Some(
            semaphore
                .acquire()
                .await
                .map_err(|_| ExecutionError::ThrottleClosed)?,
        ),
        None => None,
    };

    let (program, args) = argv.split_first().ok_or(ExecutionError::EmptyCommand)?;
    let display = argv.join(" ");

    let mut command = Command::new(program);
    command.args(args).stderr(Stdio::piped());

    match &stdin {
        Stdin::Inherit => command.stdin(Stdio::inherit()),
        Stdin::Bytes(_) => command.stdin(Stdio::piped()),
        Stdin::File(file) => command.stdin(Stdio::from(
            file.try_clone()
                .map_err(|e| ExecutionError::Io(display.clone(), e))?,
        )),
    };
    match &stdout {
        Stdout::Inherit => command.stdout(Stdio::inherit()),
        Stdout::Capture => command.stdout(Stdio::piped()),
        Stdout::File(file) => command.stdout(Stdio::from(
            file.try_clone()
                .map_err(|e| ExecutionError::Io(display.clone(), e))?,
        )),
    };

    let mut child = command
        .spawn()
        .map_err(|e| ExecutionError::Spawn(display.clone(), e))?;

    // Feed piped input concurrently with the wait, so a child filling its
    // output pipe cannot deadlock against us filling its input pipe.
    let stdin_pipe = child.stdin.take();
    let feed = async {
        if let (Stdin::Bytes(data), Some(mut pipe)) = (&stdin, stdin_pipe) {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    fed.map_err(|e| ExecutionError::Io(display.clone(), e))?;
    let output = output.map_err(|e| ExecutionError::Io(display.clone(), e))?;

    log::debug!("`{display}` exited with {:?}", output.status.code());
    Ok(ProcessOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_standard_output() {
        let output = execute(&argv(&["echo", "hello"]), Stdin::Inherit, Stdout::Capture, None)
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(output.status, Some(0));
    }

    #[tokio::test]
    async fn test_pipes_bytes_through_stdin() {
        let output = execute(
            &argv(&["cat"]),
            Stdin::Bytes(b"from a variable"),
            Stdout::Capture,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "from a variable"
        );
    }

    #[tokio::test]
    async fn test_redirects_into_a_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let file = std::fs::File::create(&path).unwrap();

        // Two spawns sharing the same sink append in order.
        for word in ["one", "two"] {
            execute(&argv(&["echo", word]), Stdin::Inherit, Stdout::File(&file), None)
                .await
                .unwrap();
        }

        let mut text = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let result = execute(
            &argv(&["definitely-not-a-command-9f3b"]),
            Stdin::Inherit,
            Stdout::Capture,
            None,
        )
        .await;
        assert!(matches!(result, Err(ExecutionError::Spawn(_, _))));
    }

    #[tokio::test]
    async fn test_throttle_bounds_concurrency() {
        let throttle = Semaphore::new(1);
        let output = execute(
            &argv(&["echo", "gated"]),
            Stdin::Inherit,
            Stdout::Capture,
            Some(&throttle),
        )
        .await
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "gated");
        assert_eq!(throttle.available_permits(), 1);
    }
}
