//! Remote port negotiation.
//!
//! The configured command binds an ephemeral socket on the remote side and
//! prints `<address> <port>`. The address may differ from the host we
//! connected to (e.g. a compute node IP behind a login node).

use std::time::Duration;

use crate::error::{SpawnError, SpawnResult};
use crate::ssh::{execute_with_timeout, CommandOutput, Payload, SshExecutor, SshTarget};

/// Where the launched process will listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// Parse negotiation output: exactly two whitespace-separated tokens.
///
/// Empty output is a [`SpawnError::CommandFailure`] carrying stderr and exit
/// status; any other shape is a [`SpawnError::Protocol`].
pub fn parse_endpoint(output: &CommandOutput) -> SpawnResult<Endpoint> {
    let tokens: Vec<&str> = output.stdout.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Err(SpawnError::CommandFailure {
            exit_status: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        }),
        [address, port] => {
            let port: u16 = port
                .parse()
                .map_err(|_| SpawnError::Protocol(format!("non-numeric port {port:?}")))?;
            Ok(Endpoint {
                address: (*address).to_string(),
                port,
            })
        }
        other => Err(SpawnError::Protocol(format!(
            "expected `<address> <port>`, got {} tokens: {:?}",
            other.len(),
            output.stdout.trim()
        ))),
    }
}

/// Run the negotiation command on `target`. Not retried.
#[tracing::instrument(skip(executor, target), name = "negotiate", fields(host = %target.host))]
pub async fn negotiate(
    executor: &dyn SshExecutor,
    target: &SshTarget,
    command: &str,
    timeout: Duration,
) -> SpawnResult<Endpoint> {
    let output =
        execute_with_timeout(executor, target, &Payload::Command(command.to_string()), timeout)
            .await?;
    match parse_endpoint(&output) {
        Ok(endpoint) => {
            tracing::debug!(address = %endpoint.address, port = endpoint.port, "negotiated endpoint");
            Ok(endpoint)
        }
        Err(e) => {
            tracing::error!("failed to get a remote port: {}", e);
            tracing::debug!(exit_status = ?output.exit_status, "negotiation exit status");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(stdout: &str, stderr: &str, status: u32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status: Some(status),
        }
    }

    #[test]
    fn test_parse_address_and_port() {
        let ep = parse_endpoint(&out("10.0.0.5 37281\n", "", 0)).unwrap();
        assert_eq!(ep, Endpoint { address: "10.0.0.5".into(), port: 37281 });
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        let ep = parse_endpoint(&out("  node7\t\t4000  \n", "", 0)).unwrap();
        assert_eq!(ep.address, "node7");
        assert_eq!(ep.port, 4000);
    }

    #[test]
    fn test_empty_stdout_carries_stderr() {
        let err = parse_endpoint(&out("", "bind: address in use\n", 1)).unwrap_err();
        match err {
            SpawnError::CommandFailure { exit_status, stderr } => {
                assert_eq!(exit_status, Some(1));
                assert_eq!(stderr, "bind: address in use");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_port_is_protocol_violation() {
        assert!(matches!(
            parse_endpoint(&out("10.0.0.5 http", "", 0)),
            Err(SpawnError::Protocol(_))
        ));
        assert!(matches!(
            parse_endpoint(&out("10.0.0.5 70000", "", 0)),
            Err(SpawnError::Protocol(_))
        ));
    }

    #[test]
    fn test_wrong_token_count_is_protocol_violation() {
        assert!(matches!(parse_endpoint(&out("37281", "", 0)), Err(SpawnError::Protocol(_))));
        assert!(matches!(
            parse_endpoint(&out("a 1 b", "", 0)),
            Err(SpawnError::Protocol(_))
        ));
    }
}
