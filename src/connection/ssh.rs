//! SSH connection variant.
//!
//! Owns one lazily established SSH session (optionally tunneled through a
//! gateway) and implements the full [`Connection`] surface on top of it:
//! streamed command execution with sudo and pty handling, file transfer
//! with a privileged staging dance for sudo, and the reconnect policy that
//! tears the session down whenever the host identity, the resolved
//! credential, or the gateway drifts from what the session was built with.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::gateway::GatewayConnection;
use super::retry::with_retries;
use super::{assemble_command, probe, Connection, PoolContext, Protocol, RunOptions, TransferOptions};
use crate::credential::{Credential, SecretSet};
use crate::error::{Error, Result};
use crate::result::ExecResult;
use crate::transport::{ChannelEvent, Keepalive, SshOpenParams, SshSession};

/// Marker sudo prints when the injected password is rejected.
const SUDO_REJECTION_MARKER: &str = "incorrect password";

/// A live session plus everything it was built with, kept for the
/// reconnect staleness comparison.
struct LiveSession {
    session: Box<dyn SshSession>,
    host: String,
    user: String,
    secrets: SecretSet,
    gateway: Option<GatewayConnection>,
}

/// SSH implementation of [`Connection`].
pub struct SshConnection {
    ctx: Arc<PoolContext>,
    /// Distinguishes this connection's staging files from its siblings'.
    instance_id: String,
    session: Mutex<Option<LiveSession>>,
}

impl SshConnection {
    /// Create an unconnected instance; the session is established on
    /// first use.
    pub fn new(ctx: Arc<PoolContext>) -> Self {
        let mut instance_id = Uuid::new_v4().simple().to_string();
        instance_id.truncate(8);
        Self {
            ctx,
            instance_id,
            session: Mutex::new(None),
        }
    }

    /// Run the reconnect check and make sure a current session exists in
    /// the slot.
    async fn ensure_session(&self, slot: &mut Option<LiveSession>) -> Result<()> {
        let credential = self.ctx.auth.resolve(&self.ctx.host).await?;
        let secrets = credential.secret_set()?;
        let wanted_gateway = self.ctx.gateway();

        let stale = match slot.as_ref() {
            None => false,
            Some(live) => {
                self.is_stale(live, &credential, &secrets, wanted_gateway.as_ref())
                    .await?
            }
        };
        if stale {
            debug!(host = %self.ctx.host, "Session stale, rebuilding");
            Self::teardown(slot).await;
        }

        if slot.is_none() {
            *slot = Some(self.build_session(&credential, secrets, wanted_gateway).await?);
        }
        Ok(())
    }

    /// Closed stream, host identity drift, credential drift, or gateway
    /// drift all force a rebuild.
    async fn is_stale(
        &self,
        live: &LiveSession,
        credential: &Credential,
        secrets: &SecretSet,
        wanted_gateway: Option<&super::gateway::GatewayConfig>,
    ) -> Result<bool> {
        if !live.session.is_open()
            || live.host != self.ctx.host
            || live.user != credential.user()
            || !live.secrets.matches(secrets)
        {
            return Ok(true);
        }
        match (wanted_gateway, &live.gateway) {
            (None, None) => Ok(false),
            (Some(config), Some(gateway)) => {
                let gateway_credential = self.ctx.auth.resolve(&config.host).await?;
                Ok(!gateway.is_current(
                    config,
                    gateway_credential.user(),
                    &gateway_credential.secret_set()?,
                ))
            }
            // Gateway added to or removed from the pool metadata.
            _ => Ok(true),
        }
    }

    async fn build_session(
        &self,
        credential: &Credential,
        secrets: SecretSet,
        gateway_config: Option<super::gateway::GatewayConfig>,
    ) -> Result<LiveSession> {
        let params = SshOpenParams {
            host: self.ctx.host.clone(),
            port: self.ctx.port,
            user: credential.user().to_string(),
            secrets: secrets.clone(),
            keepalive: Keepalive::default(),
        };

        let (session, gateway) = match gateway_config {
            Some(config) => {
                let gateway =
                    GatewayConnection::open(config, &self.ctx.auth, &self.ctx.transports).await?;
                let session = gateway.tunnel(&params).await?;
                (session, Some(gateway))
            }
            None => (self.ctx.transports.ssh.open(&params).await?, None),
        };

        debug!(
            host = %self.ctx.host,
            port = %self.ctx.port,
            user = %params.user,
            gateway = %gateway.is_some(),
            "SSH session established"
        );

        Ok(LiveSession {
            session,
            host: self.ctx.host.clone(),
            user: params.user,
            secrets,
            gateway,
        })
    }

    /// Close the target session first, then the gateway. Gateway failures
    /// stay here; the session is gone either way.
    async fn teardown(slot: &mut Option<LiveSession>) {
        if let Some(live) = slot.take() {
            if let Err(err) = live.session.close().await {
                warn!(host = %live.host, error = %err, "Session close failed");
            }
            if let Some(gateway) = live.gateway {
                gateway.close().await;
            }
        }
    }

    async fn teardown_now(&self) {
        let mut slot = self.session.lock().await;
        Self::teardown(&mut slot).await;
    }

    /// One attempt at one command: no retry, callbacks fired inline as
    /// output arrives.
    async fn run_attempt(&self, command: &str, options: &RunOptions) -> Result<ExecResult> {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot).await?;
        let live = slot
            .as_mut()
            .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;

        let (wire_command, injected_password) = if options.sudo {
            let password = live
                .secrets
                .password
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| Error::MissingSudoPassword {
                    target: self.ctx.host.clone(),
                })?;
            (sudo_wrap(command), Some(password))
        } else {
            (command.to_string(), None)
        };

        let mut channel = live.session.execute(&wire_command, options.pty).await?;
        if let Some(password) = &injected_password {
            channel.send_input(format!("{}\n", password).as_bytes()).await?;
        }
        if let Some(input) = &options.input {
            channel.send_input(input.as_bytes()).await?;
        }

        let mut result =
            ExecResult::new(command).with_accepted_exit_codes(options.accepted());
        // Under a pty the first chunk echoes the injected secret; it is
        // dropped before callbacks and accumulation.
        let mut discard_next = options.sudo && options.pty;

        while let Some(event) = channel.next_event().await? {
            match event {
                ChannelEvent::Stdout(data) => {
                    if std::mem::take(&mut discard_next) {
                        continue;
                    }
                    let chunk = String::from_utf8_lossy(&data);
                    if let Some(callback) = &options.on_stdout {
                        callback(&chunk);
                    }
                    if let Some(callback) = &options.on_output {
                        callback(&chunk);
                    }
                    result.push_stdout(&chunk);
                }
                ChannelEvent::Stderr(data) => {
                    if std::mem::take(&mut discard_next) {
                        continue;
                    }
                    let chunk = String::from_utf8_lossy(&data);
                    if let Some(callback) = &options.on_stderr {
                        callback(&chunk);
                    }
                    if let Some(callback) = &options.on_output {
                        callback(&chunk);
                    }
                    result.push_stderr(&chunk);
                }
                ChannelEvent::ExitStatus(code) => result.exit_code = code,
                ChannelEvent::Eof => {}
                ChannelEvent::Closed => break,
            }
        }
        drop(slot);

        if options.sudo && !result.success() && result.output.contains(SUDO_REJECTION_MARKER) {
            return Err(Error::authentication(
                &self.ctx.host,
                "sudo rejected the password",
            ));
        }

        if result.success() {
            if let Some(callback) = &options.on_success {
                callback(&result);
            }
        } else if let Some(callback) = &options.on_error {
            callback(&result);
        }
        if let Some(callback) = &options.on_complete {
            callback(&result);
        }
        Ok(result)
    }

    async fn upload_attempt(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf> {
        if options.sudo {
            return self.upload_sudo(local, remote, options).await;
        }

        {
            let mut slot = self.session.lock().await;
            self.ensure_session(&mut slot).await?;
            let live = slot
                .as_mut()
                .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
            live.session.upload(local, remote).await?;
        }

        if let Some(script) = permission_script(remote, options) {
            self.run_attempt(&script, &RunOptions::new()).await?.error()?;
        }
        Ok(remote.to_path_buf())
    }

    /// Stage through a dot-file the unprivileged account can write, then
    /// apply ownership and mode atomically with a privileged move.
    async fn upload_sudo(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf> {
        let staging = self.staging_path(remote);
        {
            let mut slot = self.session.lock().await;
            self.ensure_session(&mut slot).await?;
            let live = slot
                .as_mut()
                .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
            live.session.upload(local, &staging).await?;
        }

        let mut steps = Vec::new();
        if let Some(script) = permission_script(&staging, options) {
            steps.push(script);
        }
        steps.push(format!(
            "mv -f {} {}",
            quote_path(&staging),
            quote_path(remote)
        ));
        let finalize = self
            .run_attempt(&steps.join(" && "), &RunOptions::new().sudo())
            .await;

        match finalize {
            Ok(result) if result.success() => Ok(remote.to_path_buf()),
            outcome => {
                // The move or the permission change failed: remove the
                // staging file before the error propagates.
                let cleanup = format!("rm -f {}", quote_path(&staging));
                if let Err(err) = self.run_attempt(&cleanup, &RunOptions::new().sudo()).await {
                    warn!(
                        host = %self.ctx.host,
                        staging = %staging.display(),
                        error = %err,
                        "Staging cleanup failed"
                    );
                }
                match outcome {
                    Ok(result) => {
                        result.error()?;
                        Ok(remote.to_path_buf())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn download_attempt(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf> {
        if options.sudo {
            return self.download_sudo(remote, local).await;
        }

        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot).await?;
        let live = slot
            .as_mut()
            .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
        live.session.download(remote, local).await?;
        Ok(local.to_path_buf())
    }

    /// Privileged copy-and-chown into a staging path the session user can
    /// read, plain download of that path, then privileged removal. The
    /// removal runs no matter how the body fared.
    async fn download_sudo(&self, remote: &Path, local: &Path) -> Result<PathBuf> {
        let staging = self.staging_path(remote);

        let body = async {
            let user = {
                let mut slot = self.session.lock().await;
                self.ensure_session(&mut slot).await?;
                slot.as_ref()
                    .map(|live| live.user.clone())
                    .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?
            };
            let stage = format!(
                "cp -f {} {} && chown {} {}",
                quote_path(remote),
                quote_path(&staging),
                shell_words::quote(&user),
                quote_path(&staging)
            );
            self.run_attempt(&stage, &RunOptions::new().sudo())
                .await?
                .error()?;

            let mut slot = self.session.lock().await;
            self.ensure_session(&mut slot).await?;
            let live = slot
                .as_mut()
                .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
            live.session.download(&staging, local).await?;
            Ok(local.to_path_buf())
        };
        let outcome = body.await;

        let cleanup = format!("rm -f {}", quote_path(&staging));
        if let Err(err) = self.run_attempt(&cleanup, &RunOptions::new().sudo()).await {
            warn!(
                host = %self.ctx.host,
                staging = %staging.display(),
                error = %err,
                "Staging cleanup failed"
            );
        }
        outcome
    }

    /// Dot-prefixed staging name: destination base name, current time,
    /// instance identifier, random entropy.
    fn staging_path(&self, remote: &Path) -> PathBuf {
        let base = remote
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let entropy: u32 = rand::random();
        PathBuf::from("/tmp").join(format!(
            ".{}.{}.{}.{:08x}",
            base, timestamp, self.instance_id, entropy
        ))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn host(&self) -> &str {
        &self.ctx.host
    }

    fn port(&self) -> u16 {
        self.ctx.port
    }

    async fn port_open(&self) -> bool {
        probe::port_open(&self.ctx.host, self.ctx.port, probe::DEFAULT_PROBE_TIMEOUT).await
    }

    async fn run(
        &self,
        command: &str,
        args: &[&str],
        options: &RunOptions,
    ) -> Result<ExecResult> {
        let full = assemble_command(command, args);
        with_retries(
            &self.ctx.host,
            &self.ctx.auth,
            options.retry_budget(),
            || self.run_attempt(&full, options).boxed(),
            || self.teardown_now().boxed(),
        )
        .await
    }

    async fn run_script(
        &self,
        local: &Path,
        remote: &Path,
        args: &[&str],
        options: &RunOptions,
    ) -> Result<ExecResult> {
        let transfer = TransferOptions {
            sudo: options.sudo,
            retries: options.retries,
            ..Default::default()
        };
        self.upload(local, remote, &transfer).await?;

        let chmod = format!("chmod +x {}", quote_path(remote));
        self.run(&chmod, &[], options).await?.error()?;

        let script_command = remote.to_string_lossy().into_owned();
        self.run(&script_command, args, options).await
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf> {
        with_retries(
            &self.ctx.host,
            &self.ctx.auth,
            options.retry_budget(),
            || self.upload_attempt(local, remote, options).boxed(),
            || self.teardown_now().boxed(),
        )
        .await
    }

    async fn download(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<PathBuf> {
        with_retries(
            &self.ctx.host,
            &self.ctx.auth,
            options.retry_budget(),
            || self.download_attempt(remote, local, options).boxed(),
            || self.teardown_now().boxed(),
        )
        .await
    }

    async fn file_exists(&self, path: &Path, options: &RunOptions) -> Result<bool> {
        let probe_command = format!("test -e {}", quote_path(path));
        // Exit 1 means "absent", not failure.
        let mut options = options.clone();
        options.accepted_exit_codes = Some(vec![0, 1]);
        let result = self.run(&probe_command, &[], &options).await?;
        Ok(result.exit_code == 0)
    }

    async fn close(&self) -> Result<()> {
        self.teardown_now().await;
        Ok(())
    }
}

/// Escalation prefix: password on stdin, prompt disabled.
fn sudo_wrap(command: &str) -> String {
    format!("sudo -S -p '' -- sh -c {}", shell_words::quote(command))
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

/// Chown/chmod steps for the requested ownership and mode, if any.
fn permission_script(path: &Path, options: &TransferOptions) -> Option<String> {
    let mut steps = Vec::new();
    let owner_group = match (&options.owner, &options.group) {
        (Some(owner), Some(group)) => Some(format!("{}:{}", owner, group)),
        (Some(owner), None) => Some(owner.clone()),
        (None, Some(group)) => Some(format!(":{}", group)),
        (None, None) => None,
    };
    if let Some(owner_group) = owner_group {
        steps.push(format!("chown {} {}", owner_group, quote_path(path)));
    }
    if let Some(mode) = options.mode {
        steps.push(format!("chmod {:o} {}", mode, quote_path(path)));
    }
    if steps.is_empty() {
        None
    } else {
        Some(steps.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_wrap_disables_prompt_and_quotes() {
        let wrapped = sudo_wrap("systemctl restart 'my app'");
        assert!(wrapped.starts_with("sudo -S -p '' -- sh -c "));
        assert!(wrapped.contains("systemctl restart"));
    }

    #[test]
    fn test_permission_script_combinations() {
        let path = Path::new("/etc/app.conf");
        assert_eq!(permission_script(path, &TransferOptions::new()), None);

        let options = TransferOptions::new().owner("app").group("app").mode(0o640);
        let script = permission_script(path, &options).unwrap();
        assert_eq!(script, "chown app:app /etc/app.conf && chmod 640 /etc/app.conf");

        let options = TransferOptions::new().group("wheel");
        let script = permission_script(path, &options).unwrap();
        assert_eq!(script, "chown :wheel /etc/app.conf");
    }

    #[test]
    fn test_staging_path_shape() {
        let ctx = Arc::new(PoolContext {
            host: "web01".into(),
            port: 22,
            protocol: Protocol::Ssh,
            metadata: Default::default(),
            auth: Arc::new(crate::auth::Auth::new()),
            transports: crate::transport::Transports::new(
                Arc::new(crate::transport::mock::MockSshTransport::new()),
                Arc::new(crate::transport::mock::MockWinRmTransport::new()),
            ),
        });
        let connection = SshConnection::new(ctx);
        let staging = connection.staging_path(Path::new("/etc/nginx/nginx.conf"));
        let name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".nginx.conf."));
        assert!(staging.starts_with("/tmp"));
        // base name, timestamp, instance id, entropy
        assert_eq!(name.split('.').count(), 6);
    }
}
