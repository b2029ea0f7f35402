//! Account producer backed by external commands
//!
//! Registration and login are delegated to operator-supplied programs. The
//! create command prints one JSON account object as its last non-empty line
//! of stdout; anything before it (progress output) is ignored. The login
//! command receives the credentials in `ACCOUNT_EMAIL` / `ACCOUNT_PASSWORD`
//! and prints the token.

use std::process::Output;

use account_pool::{AccountProducer, BoxFuture, Error, ProducedAccount, Result};
use tokio::process::Command;
use tracing::{debug, info};

pub struct CommandProducer {
    create_command: Vec<String>,
    login_command: Option<Vec<String>>,
}

impl CommandProducer {
    pub fn new(create_command: Vec<String>, login_command: Option<Vec<String>>) -> Self {
        Self {
            create_command,
            login_command,
        }
    }
}

/// Run `argv` to completion, failing on spawn errors and non-zero exit.
async fn run(argv: &[String], env: &[(&str, &str)]) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Producer("no command configured".into()))?;

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let output = command
        .output()
        .await
        .map_err(|e| Error::Producer(format!("spawning {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Producer(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}

fn parse_created(stdout: &[u8]) -> Result<ProducedAccount> {
    let stdout = String::from_utf8_lossy(stdout);
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| Error::Producer("create command printed nothing".into()))?;
    serde_json::from_str(line)
        .map_err(|e| Error::Producer(format!("create command output is not an account: {e}")))
}

impl AccountProducer for CommandProducer {
    fn create(&self) -> BoxFuture<'_, Result<ProducedAccount>> {
        Box::pin(async move {
            let output = run(&self.create_command, &[]).await?;
            let produced = parse_created(&output.stdout)?;
            info!(email = %produced.email, "create command produced account");
            Ok(produced)
        })
    }

    fn login<'a>(
        &'a self,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let Some(argv) = &self.login_command else {
                debug!(email, "no login command configured");
                return Ok(None);
            };
            let output = run(
                argv,
                &[("ACCOUNT_EMAIL", email), ("ACCOUNT_PASSWORD", password)],
            )
            .await?;
            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok((!token.is_empty()).then_some(token))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn create_parses_last_line() {
        let producer = CommandProducer::new(
            sh(r#"echo "registering..."; echo '{"email":"a@x.test","password":"pw","first_name":"Ada"}'; echo"#),
            None,
        );
        let produced = producer.create().await.unwrap();
        assert_eq!(produced.email, "a@x.test");
        assert_eq!(produced.password, "pw");
        assert_eq!(produced.first_name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn create_fails_on_nonzero_exit() {
        let producer = CommandProducer::new(sh("echo 'captcha failed' >&2; exit 3"), None);
        let err = producer.create().await.unwrap_err();
        let Error::Producer(msg) = err else {
            panic!("expected producer error, got {err:?}");
        };
        assert!(msg.contains("captcha failed"), "got: {msg}");
    }

    #[tokio::test]
    async fn create_fails_on_garbage() {
        let producer = CommandProducer::new(sh("echo 'done'"), None);
        assert!(matches!(
            producer.create().await,
            Err(Error::Producer(_))
        ));

        let silent = CommandProducer::new(sh("true"), None);
        assert!(matches!(silent.create().await, Err(Error::Producer(_))));
    }

    #[tokio::test]
    async fn create_without_command_fails() {
        let producer = CommandProducer::new(Vec::new(), None);
        assert!(matches!(
            producer.create().await,
            Err(Error::Producer(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_producer_error() {
        let producer =
            CommandProducer::new(vec!["/nonexistent/register-account".into()], None);
        assert!(matches!(
            producer.create().await,
            Err(Error::Producer(_))
        ));
    }

    #[tokio::test]
    async fn login_passes_credentials_in_env() {
        let producer = CommandProducer::new(
            Vec::new(),
            Some(sh(r#"printf 'tok-%s-%s\n' "$ACCOUNT_EMAIL" "$ACCOUNT_PASSWORD""#)),
        );
        let token = producer.login("a@x.test", "pw").await.unwrap();
        assert_eq!(token.as_deref(), Some("tok-a@x.test-pw"));
    }

    #[tokio::test]
    async fn login_with_empty_output_is_none() {
        let producer = CommandProducer::new(Vec::new(), Some(sh("echo '   '")));
        assert!(producer.login("a@x.test", "pw").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_without_command_is_none() {
        let producer = CommandProducer::new(Vec::new(), None);
        assert!(producer.login("a@x.test", "pw").await.unwrap().is_none());
    }
}
