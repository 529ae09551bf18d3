use crate::error::{LockError, UsageError};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Run `argv` with the caller's stdin/stdout/stderr and wait for it.
///
/// Returns the command's own exit code, whatever its value. A command that
/// cannot be started or that ends without an exit code (killed by a signal)
/// is an error.
pub async fn run(argv: &[String]) -> Result<i32, LockError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(UsageError::MissingCommand.into());
    };

    debug!(program, ?args, "running protected command");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| LockError::CommandSpawn {
            program: program.clone(),
            source,
        })?;

    let code = exit_code(program, status)?;
    debug!(program, code, "protected command exited");
    Ok(code)
}

fn exit_code(program: &str, status: ExitStatus) -> Result<i32, LockError> {
    status.code().ok_or_else(|| LockError::CommandSignaled {
        program: program.to_string(),
        signal: termination_signal(status),
    })
}

#[cfg(unix)]
fn termination_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn termination_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn passes_exit_code_through() -> anyhow::Result<()> {
        assert_eq!(run(&sh("exit 7")).await?, 7);
        assert_eq!(run(&sh("true")).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let argv = vec!["/nonexistent/distlock-test-binary".to_string()];
        let err = run(&argv).await.err();
        assert!(
            matches!(err, Some(LockError::CommandSpawn { .. })),
            "unexpected result: {err:?}"
        );
    }

    #[tokio::test]
    async fn killed_command_is_abnormal() {
        let err = run(&sh("kill -9 $$")).await.err();
        assert!(
            matches!(err, Some(LockError::CommandSignaled { signal: Some(9), .. })),
            "unexpected result: {err:?}"
        );
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let err = run(&[]).await.err();
        assert!(matches!(
            err,
            Some(LockError::Usage(UsageError::MissingCommand))
        ));
    }
}
