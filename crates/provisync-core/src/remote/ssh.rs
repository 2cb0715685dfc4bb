//! ---
//! ps_section: "05-networking-external-interfaces"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Collaborator interfaces for fetch, remote exec, and transfer."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use provisync_common::{render_command, AppConfig, FetchMode, TargetConfig};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{basename, CommandRunner, ConfigApplier, InstructionSource, RemoteExec, RemoteTransfer, TransferDirection};
use crate::error::{ReconcileError, Result};

/// ssh/scp/rsync backed collaborator for every configured target.
pub struct SshGateway {
    config: Arc<AppConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl SshGateway {
    pub fn new(config: Arc<AppConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn target(&self, target_id: &str) -> Result<&TargetConfig> {
        self.config
            .target(target_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown target '{target_id}'")))
    }

    fn identity(&self, target: &TargetConfig) -> Result<Option<PathBuf>> {
        let Some(identity) = &target.identity_file else {
            return Ok(None);
        };
        let resolved = match (&self.config.root, identity.is_relative()) {
            (Some(root), true) => root.join(identity),
            _ => identity.clone(),
        };
        if !resolved.is_file() {
            return Err(ReconcileError::CredentialMissing(format!(
                "identity file {} not found",
                resolved.display()
            )));
        }
        Ok(Some(resolved))
    }

    /// Options shared by ssh, scp and the rsync remote shell. `port_flag` is
    /// `-p` for ssh and `-P` for scp.
    fn connection_options(&self, target: &TargetConfig, port_flag: &str) -> Result<Vec<String>> {
        let mut options = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)),
            port_flag.to_owned(),
            target.port.to_string(),
        ];
        if let Some(identity) = self.identity(target)? {
            options.push("-i".to_owned());
            options.push(identity.display().to_string());
        }
        if let Some(bastion_id) = &target.bastion {
            let bastion = self.target(bastion_id)?;
            options.push("-J".to_owned());
            options.push(format!("{}:{}", bastion.destination(), bastion.port));
        }
        Ok(options)
    }

    /// Full ssh argument vector for running `command` on `target_id`.
    pub fn ssh_args(&self, target_id: &str, command: &str) -> Result<Vec<String>> {
        let target = self.target(target_id)?;
        let mut args = self.connection_options(target, "-p")?;
        args.push(target.destination());
        args.push(command.to_owned());
        Ok(args)
    }

    fn run(&self, target_id: &str, program: &str, args: &[String]) -> Result<String> {
        self.runner
            .run(program, args)
            .map_err(|detail| ReconcileError::connection(target_id, detail))
    }

    fn verify_upload(&self, target_id: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        let expected = hex::encode(Sha256::digest(fs::read(local_path)?));
        let args = self.ssh_args(target_id, &format!("sha256sum {remote_path}"))?;
        let output = self.run(target_id, "ssh", &args)?;
        let reported = output.split_whitespace().next().unwrap_or_default();
        if !reported.eq_ignore_ascii_case(&expected) {
            return Err(ReconcileError::connection(
                target_id,
                format!("checksum mismatch for {remote_path}: local {expected}, remote {reported}"),
            ));
        }
        debug!(device = target_id, remote_path, "upload checksum verified");
        Ok(())
    }
}

impl RemoteExec for SshGateway {
    fn exec(&self, target_id: &str, command: &str, output_sink: Option<&Path>) -> Result<()> {
        let args = self.ssh_args(target_id, command)?;
        let output = self.run(target_id, "ssh", &args)?;
        if let Some(sink) = output_sink {
            if let Some(parent) = sink.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(sink, output)?;
        }
        info!(device = target_id, command, "remote command completed");
        Ok(())
    }
}

impl RemoteTransfer for SshGateway {
    fn transfer(&self, target_id: &str, direction: TransferDirection, local_path: &Path) -> Result<()> {
        let target = self.target(target_id)?;
        let remote_path = target.remote_path(basename(local_path)?);
        let remote = format!("{}:{}", target.destination(), remote_path);
        let local = local_path.display().to_string();

        let mut args = self.connection_options(target, "-P")?;
        match direction {
            TransferDirection::Upload => {
                args.push(local);
                args.push(remote);
            }
            TransferDirection::Download => {
                if let Some(parent) = local_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                args.push(remote);
                args.push(local);
            }
        }
        self.run(target_id, "scp", &args)?;
        if direction == TransferDirection::Upload && target.verify_checksum {
            self.verify_upload(target_id, local_path, &remote_path)?;
        }
        info!(device = target_id, %direction, remote_path = %remote_path, "transfer completed");
        Ok(())
    }
}

impl ConfigApplier for SshGateway {
    fn apply_config(&self, target_id: &str, file_path: &Path) -> Result<()> {
        let template = self
            .config
            .shaper
            .as_ref()
            .map(|shaper| shaper.apply_command.as_str())
            .ok_or_else(|| ReconcileError::ConfigMissing("no [shaper] section configured".into()))?;
        let target = self.target(target_id)?;
        let command = render_command(template, &target.remote_path(basename(file_path)?));
        self.exec(target_id, &command, None)
    }
}

impl InstructionSource for SshGateway {
    fn fetch(&self, source_id: &str, dest_dir: &Path, mode: FetchMode, pattern: &str) -> Result<()> {
        let source = self
            .config
            .source(source_id)
            .ok_or_else(|| ReconcileError::ConfigMissing(format!("unknown source '{source_id}'")))?;
        let target_id = source.target.as_deref().ok_or_else(|| {
            ReconcileError::ConfigMissing(format!("rsync source '{source_id}' has no target"))
        })?;
        let target = self.target(target_id)?;
        fs::create_dir_all(dest_dir)?;

        let remote_shell = std::iter::once("ssh".to_owned())
            .chain(self.connection_options(target, "-p")?)
            .collect::<Vec<_>>()
            .join(" ");
        let mut args = vec![
            "-a".to_owned(),
            "-e".to_owned(),
            remote_shell,
            "--itemize-changes".to_owned(),
        ];
        if let Some(limit) = source.bandwidth_limit_kbps {
            args.push(format!("--bwlimit={limit}"));
        }
        if mode == FetchMode::Sync {
            args.push("--delete".to_owned());
        }
        args.push(format!("--include={pattern}"));
        args.push("--exclude=*".to_owned());
        args.push(format!(
            "{}:{}/",
            target.destination(),
            source.path.display().to_string().trim_end_matches('/')
        ));
        args.push(format!("{}/", dest_dir.display()));

        let output = self.run(target_id, "rsync", &args)?;
        let changes = ItemizedChanges::parse(&output);
        for file in &changes.received {
            info!(source = source_id, file = %file, "instruction file downloaded");
        }
        for file in &changes.deleted {
            info!(source = source_id, file = %file, "instruction file withdrawn");
        }
        info!(
            source = source_id,
            mode = mode.as_str(),
            pattern,
            downloaded = changes.received.len(),
            withdrawn = changes.deleted.len(),
            "instruction files fetched"
        );
        Ok(())
    }
}

/// Files named in rsync `--itemize-changes` output.
#[derive(Debug, Default, PartialEq, Eq)]
struct ItemizedChanges<'a> {
    received: Vec<&'a str>,
    deleted: Vec<&'a str>,
}

impl<'a> ItemizedChanges<'a> {
    /// `>f<flags> name` is a file transferred to us, `*deleting name` one
    /// removed by `--delete`. Directory and attribute-only lines are ignored.
    fn parse(output: &'a str) -> Self {
        let mut changes = Self::default();
        for line in output.lines() {
            let Some((code, name)) = line.split_once(' ') else {
                continue;
            };
            let name = name.trim_start();
            if name.is_empty() {
                continue;
            }
            if code.starts_with(">f") {
                changes.received.push(name);
            } else if code == "*deleting" {
                changes.deleted.push(name);
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRunner;
    use provisync_common::{SourceConfig, SourceKind};
    use tempfile::tempdir;

    fn gateway(runner: Arc<MockRunner>, root: &Path) -> SshGateway {
        let mut config = AppConfig::default().with_root(root);
        let mut jump = TargetConfig::new("jump.example.net");
        jump.user = Some("ops".into());
        jump.port = 2222;
        config.targets.insert("jump".into(), jump);
        let mut device = TargetConfig::new("10.0.0.1");
        device.user = Some("admin".into());
        device.bastion = Some("jump".into());
        device.remote_dir = "/flash/provisync/".into();
        config.targets.insert("edge".into(), device);
        config.sources.insert(
            "central".into(),
            SourceConfig {
                kind: SourceKind::Rsync,
                target: Some("jump".into()),
                path: PathBuf::from("/srv/instructions/"),
                bandwidth_limit_kbps: Some(512),
            },
        );
        SshGateway::new(Arc::new(config), runner)
    }

    #[test]
    fn exec_chains_through_bastion_and_writes_sink() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Ok("saved\n".into())]));
        let gw = gateway(runner.clone(), dir.path());
        let sink = dir.path().join("work/subscriber/save.out");

        gw.exec("edge", "flow save /flash/provisync/current_flows.txt", Some(&sink))
            .unwrap();

        let call = &runner.invocations()[0];
        assert_eq!(call.program, "ssh");
        assert_eq!(
            call.args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-p",
                "22",
                "-J",
                "ops@jump.example.net:2222",
                "admin@10.0.0.1",
                "flow save /flash/provisync/current_flows.txt",
            ]
        );
        assert_eq!(fs::read_to_string(sink).unwrap(), "saved\n");
    }

    #[test]
    fn download_targets_remote_basename() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let gw = gateway(runner.clone(), dir.path());
        let local = dir.path().join("work/subscriber/current_flows.txt");

        gw.transfer("edge", TransferDirection::Download, &local).unwrap();

        let call = &runner.invocations()[0];
        assert_eq!(call.program, "scp");
        assert!(call.args.contains(&"-P".to_owned()));
        let n = call.args.len();
        assert_eq!(call.args[n - 2], "admin@10.0.0.1:/flash/provisync/current_flows.txt");
        assert_eq!(call.args[n - 1], local.display().to_string());
    }

    #[test]
    fn failures_map_onto_taxonomy() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Err("exit status 255".into())]));
        let gw = gateway(runner, dir.path());
        assert_eq!(gw.exec("edge", "show version", None).unwrap_err().kind(), "connection_failure");
        assert_eq!(gw.exec("nope", "show version", None).unwrap_err().kind(), "config_missing");
    }

    #[test]
    fn missing_identity_is_a_credential_error() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default().with_root(dir.path());
        let mut target = TargetConfig::new("10.0.0.1");
        target.identity_file = Some(PathBuf::from("keys/id_ed25519"));
        config.targets.insert("edge".into(), target);
        let runner = Arc::new(MockRunner::new());
        let gw = SshGateway::new(Arc::new(config), runner.clone());

        let err = gw.exec("edge", "show version", None).unwrap_err();
        assert_eq!(err.kind(), "credential_missing");
        assert!(runner.invocations().is_empty());

        fs::create_dir_all(dir.path().join("keys")).unwrap();
        fs::write(dir.path().join("keys/id_ed25519"), "key").unwrap();
        gw.exec("edge", "show version", None).unwrap();
        let args = &runner.invocations()[0].args;
        let at = args.iter().position(|arg| arg == "-i").unwrap();
        assert!(args[at + 1].ends_with("keys/id_ed25519"));
    }

    #[test]
    fn checksum_mismatch_fails_upload() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("add_flows.txt");
        fs::write(&file, "flow a\n").unwrap();
        let good = hex::encode(Sha256::digest(b"flow a\n"));

        let mut config = AppConfig::default().with_root(dir.path());
        let mut target = TargetConfig::new("10.0.0.1");
        target.verify_checksum = true;
        config.targets.insert("edge".into(), target);
        let config = Arc::new(config);

        let runner = Arc::new(MockRunner::with_responses(vec![
            Ok(String::new()),
            Ok(format!("{}  ./add_flows.txt\n", good.to_uppercase())),
        ]));
        SshGateway::new(config.clone(), runner.clone())
            .transfer("edge", TransferDirection::Upload, &file)
            .unwrap();
        assert_eq!(runner.invocations()[1].args.last().unwrap(), "sha256sum ./add_flows.txt");

        let runner = Arc::new(MockRunner::with_responses(vec![
            Ok(String::new()),
            Ok("deadbeef  ./add_flows.txt\n".into()),
        ]));
        let err = SshGateway::new(config, runner)
            .transfer("edge", TransferDirection::Upload, &file)
            .unwrap_err();
        assert_eq!(err.kind(), "connection_failure");
    }

    #[test]
    fn rsync_fetch_honours_mode_and_bandwidth() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let gw = gateway(runner.clone(), dir.path());
        let dest = dir.path().join("raw");

        gw.fetch("central", &dest, FetchMode::Sync, "*.txt*").unwrap();
        gw.fetch("central", &dest, FetchMode::Copy, "*.txt*").unwrap();

        let calls = runner.invocations();
        let sync = &calls[0].args;
        assert_eq!(calls[0].program, "rsync");
        assert!(sync.contains(&"--bwlimit=512".to_owned()));
        assert!(sync.contains(&"--delete".to_owned()));
        assert!(sync.contains(&"--include=*.txt*".to_owned()));
        assert!(sync.contains(&"ops@jump.example.net:/srv/instructions/".to_owned()));
        assert!(sync[2].starts_with("ssh -o BatchMode=yes"));
        assert_eq!(sync[3], "--itemize-changes");
        assert!(!calls[1].args.contains(&"--delete".to_owned()));
    }

    #[test]
    fn itemized_output_names_downloaded_and_withdrawn_files() {
        let output = "\
cd+++++++++ ./
>f+++++++++ east_add.txt
>f.st...... west_add.txt.gz
.f....og... unchanged_del.txt
*deleting   stale_add.txt
";
        let changes = ItemizedChanges::parse(output);
        assert_eq!(changes.received, ["east_add.txt", "west_add.txt.gz"]);
        assert_eq!(changes.deleted, ["stale_add.txt"]);
        assert_eq!(ItemizedChanges::parse(""), ItemizedChanges::default());
    }

    #[test]
    fn fetch_accepts_itemized_report() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(
            ">f+++++++++ flows_add.txt\n*deleting   flows_del.txt\n".into(),
        )]));
        let gw = gateway(runner.clone(), dir.path());
        gw.fetch("central", &dir.path().join("raw"), FetchMode::Sync, "*.txt")
            .unwrap();
        assert_eq!(runner.invocations().len(), 1);
    }
}
