//! External proxy issuance through `myproxy-logon`
//!
//! When no local CA exchange is available, proxies are fetched from a MyProxy server. The
//! passphrase protecting the stored credential is written to the child's stdin (`-S`) and never
//! appears on the command line.

use crate::error::{ProxyError, Result};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Name of the MyProxy client binary
pub const MYPROXY_LOGON: &str = "myproxy-logon";
/// Requested proxy lifetime when none is configured (one week)
pub const DEFAULT_LIFETIME_HOURS: u32 = 168;

/// Runs external commands
pub trait CommandRunner {
    /// Run `command` with `args`, an environment overlay and optional stdin; return stdout
    fn execute(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<String>;
}

/// [`CommandRunner`] backed by `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn execute(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProxyError::Issuance(format!("Failed to start {}: {}", command, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .map_err(|e| ProxyError::Issuance(format!("Failed to feed {}: {}", command, e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ProxyError::Issuance(format!("Failed to wait for {}: {}", command, e)))?;
        if !output.status.success() {
            return Err(ProxyError::Issuance(format!(
                "{} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Everything needed to ask a MyProxy server for a proxy
#[derive(Debug)]
pub struct MyproxyRequest {
    pub host: String,
    /// Login name on the MyProxy server
    pub identity: String,
    /// Name of the stored credential (`-k`)
    pub credential_name: String,
    pub passphrase: SecretString,
    pub lifetime_hours: u32,
    pub output: PathBuf,
    /// Variables added to the child environment (e.g. `X509_CERT_DIR`)
    pub env: HashMap<String, String>,
}

impl MyproxyRequest {
    fn args(&self) -> Vec<String> {
        vec![
            "-s".to_string(),
            self.host.clone(),
            "-l".to_string(),
            self.identity.clone(),
            "-k".to_string(),
            self.credential_name.clone(),
            "-t".to_string(),
            self.lifetime_hours.to_string(),
            "-o".to_string(),
            self.output.display().to_string(),
            "-S".to_string(),
        ]
    }
}

/// Issues proxies from an external service
pub trait ProxyIssuer {
    /// Write a fresh proxy to `request.output`
    fn issue(&self, request: &MyproxyRequest) -> Result<()>;
}

/// [`ProxyIssuer`] invoking `myproxy-logon`
#[derive(Debug, Clone, Default)]
pub struct MyproxyLogon<R = SystemCommandRunner> {
    runner: R,
}

impl<R: CommandRunner> MyproxyLogon<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ProxyIssuer for MyproxyLogon<R> {
    fn issue(&self, request: &MyproxyRequest) -> Result<()> {
        tracing::info!(
            host = %request.host,
            identity = %request.identity,
            output = %request.output.display(),
            "Requesting proxy from MyProxy"
        );
        let mut stdin = request.passphrase.expose_secret().as_bytes().to_vec();
        stdin.push(b'\n');
        self.runner
            .execute(MYPROXY_LOGON, &request.args(), &request.env, Some(&stdin))?;
        Ok(())
    }
}
