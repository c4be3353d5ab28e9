use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lines of output kept per stream for the error message of a failed command.
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("could not start '{program}'; {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}; last output:\n{output}")]
    Failed {
        program: String,
        status: ExitStatus,
        output: String,
    },

    #[error("could not wait for '{program}'; {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' was cancelled")]
    Cancelled(String),
}

/// Runs the command to completion, logging stdout and stderr line by line as they are produced.
///
/// The child is killed if `cancel` fires first.
pub async fn run_and_log(
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .to_string();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    debug!(program, pid = child.id(), "Started command");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let (stdout_tail, stderr_tail) = tokio::join!(
            log_lines(stdout, &program, "stdout"),
            log_lines(stderr, &program, "stderr")
        );
        let status = child.wait().await;
        (status, stdout_tail, stderr_tail)
    };

    let (status, stdout_tail, stderr_tail) = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(CommandError::Cancelled(program.clone())),
        result = run => result,
    };

    let status = status.map_err(|source| CommandError::Wait {
        program: program.clone(),
        source,
    })?;

    if !status.success() {
        let output = stdout_tail
            .into_iter()
            .chain(stderr_tail)
            .collect::<Vec<_>>()
            .join("\n");

        return Err(CommandError::Failed {
            program,
            status,
            output,
        });
    }

    Ok(())
}

async fn log_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    program: &str,
    stream: &'static str,
) -> Vec<String> {
    let Some(reader) = reader else {
        return vec![];
    };

    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(program, stream, "{line}");

        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail.into()
}
