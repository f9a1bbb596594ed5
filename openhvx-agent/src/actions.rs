//! Action invoker
//!
//! Actions are external PowerShell scripts driving the hypervisor. The agent
//! treats them as black boxes with a fixed contract:
//! - input arrives twice, as the inline `-Payload <json>` argument and as
//!   `{action, data}` on stdin (scripts read whichever they were written for)
//! - output is JSON on stdout; exit 0 means success
//!
//! Both input channels are contractual. Older scripts declare no `-Payload`
//! parameter at all, which PowerShell reports on stderr; those get one retry
//! without the inline argument.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Name of the inline payload parameter scripts may declare.
const INLINE_PARAM: &str = "Payload";

/// What came back from a script that could at least be started.
#[derive(Debug)]
pub struct ActionOutput {
    pub stdout: Vec<u8>,
    /// `None` on success. The pipeline still forwards `stdout` when set.
    pub error: Option<String>,
}

impl ActionOutput {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The `{ok, result, error}` envelope well-behaved scripts print.
#[derive(Debug, Default, Deserialize)]
pub struct ActionEnvelope {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: String,
}

impl ActionEnvelope {
    /// Parse stdout as a success envelope; `None` when it is anything else.
    pub fn parse_success(stdout: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<ActionEnvelope>(stdout) {
            Ok(env) if env.ok => Some(env),
            _ => None,
        }
    }
}

/// Runs actions by name against a configured script root.
#[derive(Debug, Clone)]
pub struct ActionInvoker {
    script_root: String,
}

impl ActionInvoker {
    pub fn new(script_root: &str) -> Self {
        Self {
            script_root: script_root.to_string(),
        }
    }

    /// Run `actions/<action>.ps1` with `data` as its payload and return its
    /// stdout. Errors from this function mean the script could not be run at
    /// all; a script that ran and failed comes back as an [`ActionOutput`]
    /// with `error` set.
    pub async fn run(&self, action: &str, data: &Value) -> Result<ActionOutput> {
        let shell = find_shell().await?;
        let script = self.resolve_script(action)?;

        let inline = serde_json::to_string(data).context("serialize payload")?;
        let envelope = serde_json::to_vec(&serde_json::json!({
            "action": action,
            "data": data,
        }))
        .context("serialize stdin envelope")?;

        let output = run_script(&shell, &script, Some(&inline), &envelope).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        let output = if !output.status.success() && rejects_inline_param(&stderr) {
            debug!(action, "script has no -{INLINE_PARAM} parameter, retrying on stdin only");
            run_script(&shell, &script, None, &envelope).await?
        } else {
            output
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            if output.stdout.is_empty() {
                return Ok(ActionOutput {
                    stdout: Vec::new(),
                    error: Some("empty action output".to_string()),
                });
            }
            return Ok(ActionOutput {
                stdout: output.stdout,
                error: None,
            });
        }
        if output.stdout.is_empty() {
            // Crash with nothing on stdout: the stderr tail is all we have.
            return Ok(ActionOutput {
                stdout: Vec::new(),
                error: Some(stderr),
            });
        }
        // Failed but still printed JSON; keep it so a structured result can
        // be published alongside the failure.
        Ok(ActionOutput {
            stdout: output.stdout,
            error: Some("action script failed".to_string()),
        })
    }

    /// `<scriptRoot>/actions/<safe>.ps1`, resolved against the executable
    /// directory first, then the working directory.
    fn resolve_script(&self, action: &str) -> Result<PathBuf> {
        let rel = Path::new(&self.script_root)
            .join("actions")
            .join(format!("{}.ps1", sanitize_action(action)));

        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let full = dir.join(&rel);
                if full.is_file() {
                    return Ok(full);
                }
            }
        }
        if let Ok(cwd) = std::env::current_dir() {
            let alt = cwd.join(&rel);
            if alt.is_file() {
                return Ok(alt);
            }
        }
        bail!("script not found: {}", rel.display())
    }
}

async fn run_script(
    shell: &str,
    script: &Path,
    inline: Option<&str>,
    stdin_payload: &[u8],
) -> Result<std::process::Output> {
    let mut cmd = Command::new(shell);
    cmd.arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-ExecutionPolicy")
        .arg("Bypass")
        .arg("-File")
        .arg(script);
    if let Some(json) = inline {
        cmd.arg(format!("-{INLINE_PARAM}")).arg(json);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {shell} {}", script.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_payload)
            .await
            .context("write script stdin")?;
        // Dropping closes the pipe so stdin-reading scripts see EOF.
    }

    child
        .wait_with_output()
        .await
        .with_context(|| format!("wait for {}", script.display()))
}

/// PowerShell's complaint when a script declares no `-Payload` parameter.
fn rejects_inline_param(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("parameter cannot be found that matches parameter name")
        && lower.contains(&format!("'{}'", INLINE_PARAM.to_lowercase()))
}

/// Action identifier to file-name-safe form: lowercase, anything outside
/// `[a-z0-9._-]` becomes `-`.
pub fn sanitize_action(action: &str) -> String {
    action
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Prefer PowerShell 7+ (`pwsh`); fall back to Windows PowerShell where the
/// host has nothing newer.
async fn find_shell() -> Result<String> {
    for candidate in shell_candidates() {
        if command_exists(candidate).await {
            return Ok(candidate.to_string());
        }
    }
    bail!("neither 'pwsh' nor 'powershell' found in PATH")
}

fn shell_candidates() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &["pwsh", "powershell.exe"]
    } else {
        &["pwsh", "powershell"]
    }
}

async fn command_exists(command: &str) -> bool {
    let probe = if cfg!(target_os = "windows") {
        "where"
    } else {
        "which"
    };
    match Command::new(probe).arg(command).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
