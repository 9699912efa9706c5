//! WinRM connection variant.
//!
//! Speaks to Windows hosts through the WinRM transport's shell and
//! file-manager surfaces. Elevation selects the elevated PowerShell shell
//! variant instead of wrapping the command line; transfers stage through a
//! temp file moved into place by an elevated shell when `sudo` is set.
//! WinRM output arrives in one piece rather than as a stream, so chunk
//! callbacks fire once per stream before the classification callbacks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::retry::with_retries;
use super::{assemble_command, probe, Connection, PoolContext, Protocol, RunOptions, TransferOptions};
use crate::error::{Error, Result};
use crate::result::ExecResult;
use crate::transport::{ShellKind, WinRmSession};

/// Remote directory used for staging elevated transfers.
const STAGING_DIR: &str = "C:/Windows/Temp";

struct LiveWinRm {
    session: Box<dyn WinRmSession>,
    endpoint: String,
    user: String,
    password: Option<String>,
}

/// WinRM implementation of [`Connection`].
pub struct WinRmConnection {
    ctx: Arc<PoolContext>,
    instance_id: String,
    session: Mutex<Option<LiveWinRm>>,
}

impl WinRmConnection {
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

    fn endpoint(&self) -> String {
        format!("http://{}:{}/wsman", self.ctx.host, self.ctx.port)
    }

    async fn ensure_session(&self, slot: &mut Option<LiveWinRm>) -> Result<()> {
        let credential = self.ctx.auth.resolve(&self.ctx.host).await?;
        let password = credential.password()?;
        let endpoint = self.endpoint();

        let stale = match slot.as_ref() {
            None => false,
            Some(live) => {
                !live.session.is_open()
                    || live.endpoint != endpoint
                    || live.user != credential.user()
                    || live.password != password
            }
        };
        if stale {
            debug!(host = %self.ctx.host, "WinRM session stale, rebuilding");
            Self::teardown(slot).await;
        }

        if slot.is_none() {
            let session = self
                .ctx
                .transports
                .winrm
                .open(&endpoint, credential.user(), password.as_deref())
                .await?;
            debug!(endpoint = %endpoint, user = %credential.user(), "WinRM session established");
            *slot = Some(LiveWinRm {
                session,
                endpoint,
                user: credential.user().to_string(),
                password,
            });
        }
        Ok(())
    }

    async fn teardown(slot: &mut Option<LiveWinRm>) {
        if let Some(live) = slot.take() {
            if let Err(err) = live.session.close().await {
                warn!(endpoint = %live.endpoint, error = %err, "Session close failed");
            }
        }
    }

    async fn teardown_now(&self) {
        let mut slot = self.session.lock().await;
        Self::teardown(&mut slot).await;
    }

    async fn run_attempt(&self, command: &str, options: &RunOptions) -> Result<ExecResult> {
        if options.pty {
            return Err(Error::Pty(
                "pseudo-terminal allocation is not supported over WinRM".into(),
            ));
        }
        if options.input.is_some() {
            debug!(host = %self.ctx.host, "WinRM shells take no stdin; input option ignored");
        }

        let shell = if options.sudo {
            ShellKind::ElevatedPowerShell
        } else {
            ShellKind::PowerShell
        };

        let output = {
            let mut slot = self.session.lock().await;
            self.ensure_session(&mut slot).await?;
            let live = slot
                .as_mut()
                .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
            live.session.run(shell, command).await?
        };

        let mut result =
            ExecResult::new(command).with_accepted_exit_codes(options.accepted());
        if !output.stdout.is_empty() {
            if let Some(callback) = &options.on_stdout {
                callback(&output.stdout);
            }
            if let Some(callback) = &options.on_output {
                callback(&output.stdout);
            }
            result.push_stdout(&output.stdout);
        }
        if !output.stderr.is_empty() {
            if let Some(callback) = &options.on_stderr {
                callback(&output.stderr);
            }
            if let Some(callback) = &options.on_output {
                callback(&output.stderr);
            }
            result.push_stderr(&output.stderr);
        }
        result.exit_code = output.exit_code;

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
            return self.upload_sudo(local, remote).await;
        }
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot).await?;
        let live = slot
            .as_mut()
            .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
        live.session.upload(local, remote).await?;
        Ok(remote.to_path_buf())
    }

    /// Stage in the temp directory, then move into place from an elevated
    /// shell. POSIX ownership and mode controls do not map to Windows and
    /// are not applied here.
    async fn upload_sudo(&self, local: &Path, remote: &Path) -> Result<PathBuf> {
        let staging = self.staging_path(remote);
        {
            let mut slot = self.session.lock().await;
            self.ensure_session(&mut slot).await?;
            let live = slot
                .as_mut()
                .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
            live.session.upload(local, &staging).await?;
        }

        let finalize = format!(
            "Move-Item -Force '{}' '{}'",
            staging.display(),
            remote.display()
        );
        let outcome = self
            .run_attempt(&finalize, &RunOptions::new().sudo())
            .await;

        match outcome {
            Ok(result) if result.success() => Ok(remote.to_path_buf()),
            outcome => {
                let cleanup = format!("Remove-Item -Force '{}'", staging.display());
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

    /// Elevated copy into the temp directory, plain download, elevated
    /// removal. The removal runs no matter how the body fared.
    async fn download_sudo(&self, remote: &Path, local: &Path) -> Result<PathBuf> {
        let staging = self.staging_path(remote);

        let body = async {
            let stage = format!(
                "Copy-Item -Force '{}' '{}'",
                remote.display(),
                staging.display()
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

        let cleanup = format!("Remove-Item -Force '{}'", staging.display());
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
        PathBuf::from(STAGING_DIR).join(format!(
            ".{}.{}.{}.{:08x}",
            base, timestamp, self.instance_id, entropy
        ))
    }
}

#[async_trait]
impl Connection for WinRmConnection {
    fn protocol(&self) -> Protocol {
        Protocol::Winrm
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
        // No executable bit on Windows; upload then invoke.
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
        let _ = options;
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot).await?;
        let live = slot
            .as_mut()
            .ok_or_else(|| Error::Transport("no live session after rebuild".into()))?;
        live.session.exists(path).await
    }

    async fn close(&self) -> Result<()> {
        self.teardown_now().await;
        Ok(())
    }
}
