//! Collaborators backed by external commands, configured in [`crate::operator_config::Commands`].
use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::{Output, Stdio},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use snafu::{OptionExt, ResultExt};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    config::ConfigArtifact,
    external::{
        write_file, CommandFailedSnafu, Error, IoSnafu, NoCommandSnafu, ParseOutputSnafu,
        ProcessHealth, ProcessSupervisor, RebalanceMode, RebalancePlan, RebalanceStatus,
        Rebalancer, SerializationSnafu, SpawnCommandSnafu,
    },
    model::MemberId,
    operator_config::Commands,
};

const SENSITIVE_FILE_MODE: u32 = 0o600;
const PUBLIC_FILE_MODE: u32 = 0o644;
const SCRIPT_FILE_MODE: u32 = 0o700;

/// Drives the local Kafka process through the configured commands.
#[derive(Clone, Debug)]
pub struct CommandSupervisor {
    commands: Commands,
    config_dir: PathBuf,
}

impl CommandSupervisor {
    pub fn new(commands: Commands, config_dir: PathBuf) -> Self {
        Self {
            commands,
            config_dir,
        }
    }
}

#[async_trait]
impl ProcessSupervisor for CommandSupervisor {
    async fn write_config(&self, artifact: &ConfigArtifact) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .context(IoSnafu {
                path: &self.config_dir,
            })?;

        for (name, file) in &artifact.files {
            let mode = if name.ends_with(".sh") {
                SCRIPT_FILE_MODE
            } else if file.sensitive {
                SENSITIVE_FILE_MODE
            } else {
                PUBLIC_FILE_MODE
            };
            write_file(&self.config_dir.join(name), &file.contents, mode).await?;
        }

        tracing::debug!(
            config_dir = %self.config_dir.display(),
            files = artifact.files.len(),
            "wrote config artifact"
        );
        Ok(())
    }

    async fn restart(&self) -> Result<(), Error> {
        run_checked(required(&self.commands.restart, "restart")?, &[], None).await?;
        Ok(())
    }

    async fn health(&self) -> Result<ProcessHealth, Error> {
        let argv = required(&self.commands.health, "health")?;
        let output = run(argv, &[], None).await?;
        if !output.status.success() {
            return Ok(ProcessHealth::Unhealthy {
                reason: describe_failure(&output),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(match stdout.trim() {
            "starting" => ProcessHealth::Starting,
            _ => ProcessHealth::Healthy,
        })
    }

    async fn upgrade(&self, version: &str) -> Result<(), Error> {
        run_checked(required(&self.commands.upgrade, "upgrade")?, &[version], None).await?;
        Ok(())
    }

    async fn update_credentials(&self, users: &BTreeMap<String, String>) -> Result<(), Error> {
        let stdin = users
            .iter()
            .map(|(user, password)| format!("{user}={password}\n"))
            .collect::<String>();
        run_checked(
            required(&self.commands.update_credentials, "update-credentials")?,
            &[],
            Some(&stdin),
        )
        .await?;
        Ok(())
    }

    async fn delete_credentials(&self, users: &[String]) -> Result<(), Error> {
        let users: Vec<&str> = users.iter().map(String::as_str).collect();
        run_checked(
            required(&self.commands.delete_credentials, "delete-credentials")?,
            &users,
            None,
        )
        .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        run_checked(required(&self.commands.stop, "stop")?, &[], None).await?;
        Ok(())
    }
}

/// Talks to a Cruise-Control-like rebalancer through a command that answers in JSON.
#[derive(Clone, Debug)]
pub struct CommandRebalancer {
    command: Vec<String>,
}

#[derive(Deserialize)]
struct StatusOutput {
    status: RebalanceStatus,
}

#[derive(Deserialize)]
struct PartitionsOutput {
    partitions: u64,
}

impl CommandRebalancer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<T, Error> {
        let argv = required(&self.command, "rebalancer")?;
        let stdout = run_checked(argv, args, stdin).await?;
        serde_json::from_str(&stdout).context(ParseOutputSnafu {
            command: display_command(argv, args),
        })
    }
}

#[async_trait]
impl Rebalancer for CommandRebalancer {
    async fn propose(&self, mode: RebalanceMode, target: MemberId) -> Result<RebalancePlan, Error> {
        self.query(&["propose", &mode.to_string(), &target.to_string()], None)
            .await
    }

    async fn execute(&self, plan: &RebalancePlan) -> Result<(), Error> {
        let plan = serde_json::to_string(plan).context(SerializationSnafu {
            what: "rebalance plan",
        })?;
        let argv = required(&self.command, "rebalancer")?;
        run_checked(argv, &["execute"], Some(&plan)).await?;
        Ok(())
    }

    async fn status(&self) -> Result<RebalanceStatus, Error> {
        let output: StatusOutput = self.query(&["status"], None).await?;
        Ok(output.status)
    }

    async fn partitions_on(&self, member: MemberId) -> Result<u64, Error> {
        let output: PartitionsOutput = self
            .query(&["partitions", &member.to_string()], None)
            .await?;
        Ok(output.partitions)
    }
}

fn required<'a>(argv: &'a [String], operation: &str) -> Result<&'a [String], Error> {
    (!argv.is_empty())
        .then_some(argv)
        .context(NoCommandSnafu { operation })
}

fn display_command(argv: &[String], args: &[&str]) -> String {
    argv.iter()
        .map(String::as_str)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

async fn run(argv: &[String], args: &[&str], stdin: Option<&str>) -> Result<Output, Error> {
    let command = display_command(argv, args);
    let (program, base_args) = argv.split_first().context(NoCommandSnafu {
        operation: command.clone(),
    })?;

    let mut child = Command::new(program)
        .args(base_args)
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
        .context(SpawnCommandSnafu { command: &command })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .context(SpawnCommandSnafu { command: &command })?;
        pipe.shutdown()
            .await
            .context(SpawnCommandSnafu { command: &command })?;
    }

    let output = child
        .wait_with_output()
        .await
        .context(SpawnCommandSnafu { command: &command })?;
    tracing::trace!(command = %command, status = %output.status, "command finished");
    Ok(output)
}

/// Run a command and return its stdout, failing on a non-zero exit status.
async fn run_checked(argv: &[String], args: &[&str], stdin: Option<&str>) -> Result<String, Error> {
    let output = run(argv, args, stdin).await?;
    if !output.status.success() {
        return CommandFailedSnafu {
            command: display_command(argv, args),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .fail();
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::ConfigFile;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_write_config_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CommandSupervisor::new(Commands::default(), dir.path().join("conf"));
        let artifact = ConfigArtifact {
            files: BTreeMap::from([
                (
                    "server.properties".to_string(),
                    ConfigFile {
                        contents: "node.id=1\n".to_string(),
                        sensitive: true,
                    },
                ),
                (
                    "log4j.properties".to_string(),
                    ConfigFile {
                        contents: "log4j.rootLogger=INFO\n".to_string(),
                        sensitive: false,
                    },
                ),
            ]),
        };

        supervisor.write_config(&artifact).await.unwrap();

        let server = dir.path().join("conf/server.properties");
        assert_eq!(std::fs::read_to_string(&server).unwrap(), "node.id=1\n");
        let mode = std::fs::metadata(&server).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let mode = std::fs::metadata(dir.path().join("conf/log4j.properties"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[tokio::test]
    async fn test_health_maps_exit_status() {
        let supervisor = |script: &str| {
            CommandSupervisor::new(
                Commands {
                    health: sh(script),
                    ..Commands::default()
                },
                PathBuf::from("/nonexistent"),
            )
        };

        assert_eq!(
            supervisor("echo ok").health().await.unwrap(),
            ProcessHealth::Healthy
        );
        assert_eq!(
            supervisor("echo starting").health().await.unwrap(),
            ProcessHealth::Starting
        );
        assert_eq!(
            supervisor("echo 'broker not registered' >&2; exit 1")
                .health()
                .await
                .unwrap(),
            ProcessHealth::Unhealthy {
                reason: "broker not registered".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_command() {
        let supervisor = CommandSupervisor::new(Commands::default(), PathBuf::from("/nonexistent"));
        assert!(matches!(
            supervisor.restart().await,
            Err(Error::NoCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_credentials_pipes_users() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("users");
        let supervisor = CommandSupervisor::new(
            Commands {
                update_credentials: sh(&format!("cat > {}", sink.display())),
                ..Commands::default()
            },
            dir.path().to_path_buf(),
        );

        supervisor
            .update_credentials(&BTreeMap::from([
                ("admin".to_string(), "pw2".to_string()),
                ("sync".to_string(), "pw1".to_string()),
            ]))
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(sink).unwrap(),
            "admin=pw2\nsync=pw1\n"
        );
    }

    #[tokio::test]
    async fn test_delete_credentials_passes_users_as_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("deleted");
        let supervisor = CommandSupervisor::new(
            Commands {
                delete_credentials: sh(&format!("echo \"$0 $1\" > {}", sink.display())),
                ..Commands::default()
            },
            dir.path().to_path_buf(),
        );

        supervisor
            .delete_credentials(&["sync".to_string(), "admin".to_string()])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(sink).unwrap(), "sync admin\n");
    }

    #[tokio::test]
    async fn test_rebalancer_parses_json() {
        let rebalancer = CommandRebalancer::new(sh(indoc::indoc! {r#"
            case "$0" in
              propose) echo "{\"id\": \"plan-$2\", \"mode\": \"$1\", \"target\": $2, \"partitionMoves\": 4}" ;;
              status) echo '{"status": "COMPLETED"}' ;;
              partitions) echo '{"partitions": 0}' ;;
              *) cat > /dev/null; exit 3 ;;
            esac
        "#}));

        let plan = rebalancer
            .propose(RebalanceMode::Remove, MemberId(2))
            .await
            .unwrap();
        assert_eq!(
            plan,
            RebalancePlan {
                id: "plan-2".to_string(),
                mode: RebalanceMode::Remove,
                target: MemberId(2),
                partition_moves: 4,
            }
        );
        assert_eq!(
            rebalancer.status().await.unwrap(),
            RebalanceStatus::Completed
        );
        assert_eq!(rebalancer.partitions_on(MemberId(2)).await.unwrap(), 0);
        assert!(matches!(
            rebalancer.execute(&plan).await,
            Err(Error::CommandFailed { .. })
        ));
    }
}
