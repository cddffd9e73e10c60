//! Built-in executor for `bash` transformations
//!
//! Runs inside the worker process. Every input pin becomes a file named
//! after the pin in a scratch directory, the `code` pin runs under
//! `bash -c` in that directory, and the result is the `RESULT` file when
//! the script writes one, otherwise its standard output.

use super::worker::{truncate_middle, LogStream, WorkerMessage, WorkerRequest};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio::time::Instant;
use uuid::Uuid;

pub const CODE_PIN: &str = "code";
pub const RESULT_FILE: &str = "RESULT";

/// Small text pins without a dot in their name are also exported as variables
const MAX_ENV_VALUE: usize = 1000;

const BASH_HEADER: &str = "set -u -e\n";

/// Scratch directory removed when dropped
struct Scratch(PathBuf);

impl Scratch {
    async fn create() -> std::io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("commune-bash-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).await?;
        Ok(Self(dir))
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Run one request and describe the outcome as worker messages
pub async fn execute(request: &WorkerRequest) -> Vec<WorkerMessage> {
    match run(request).await {
        Ok(messages) => messages,
        Err(message) => vec![WorkerMessage::Error { message }],
    }
}

async fn run(request: &WorkerRequest) -> Result<Vec<WorkerMessage>, String> {
    match request.language.as_deref() {
        None | Some("bash") => {}
        Some(other) => return Err(format!("unsupported language '{}'", other)),
    }

    let mut code = None;
    let mut files = Vec::new();
    for (pin, value) in &request.pins {
        let bytes = value.bytes().map_err(|e| e.to_string())?;
        let name = request
            .as_map
            .as_ref()
            .and_then(|renames| renames.get(pin))
            .unwrap_or(pin);
        if name == CODE_PIN {
            code = Some(String::from_utf8(bytes).map_err(|_| "code pin is not UTF-8".to_string())?);
        } else {
            files.push((name.clone(), bytes));
        }
    }
    let code = code.ok_or_else(|| format!("bash transformation has no '{}' pin", CODE_PIN))?;

    let scratch = Scratch::create()
        .await
        .map_err(|e| format!("cannot create scratch directory: {}", e))?;
    let mut command = Command::new("bash");
    for (name, bytes) in &files {
        let path = pin_path(&scratch.0, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("pin {}: {}", name, e))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| format!("pin {}: {}", name, e))?;
        if let Some(value) = env_value(name, bytes) {
            command.env(name, value);
        }
    }

    let started = Instant::now();
    let output = command
        .arg("-c")
        .arg(format!("{}{}", BASH_HEADER, code))
        .current_dir(&scratch.0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("cannot start bash: {}", e))?;
    let elapsed = started.elapsed().as_secs_f64();

    let mut messages = Vec::new();
    let stdout = truncate_middle(&String::from_utf8_lossy(&output.stdout));
    let stderr = truncate_middle(&String::from_utf8_lossy(&output.stderr));
    if !stderr.is_empty() {
        messages.push(WorkerMessage::Log {
            stream: LogStream::Stderr,
            content: stderr,
        });
    }
    messages.push(WorkerMessage::ExecutionTime { seconds: elapsed });

    if !output.status.success() {
        if !stdout.is_empty() {
            messages.push(WorkerMessage::Log {
                stream: LogStream::Stdout,
                content: stdout,
            });
        }
        messages.push(WorkerMessage::Error {
            message: format!("bash transformation exited with {}", output.status),
        });
        return Ok(messages);
    }

    let result = match fs::read(scratch.0.join(RESULT_FILE)).await {
        Ok(result) => {
            if !stdout.is_empty() {
                messages.push(WorkerMessage::Log {
                    stream: LogStream::Stdout,
                    content: stdout,
                });
            }
            result
        }
        Err(_) => output.stdout,
    };
    messages.push(WorkerMessage::Result {
        buffer: hex::encode(result),
    });
    Ok(messages)
}

/// Pin names are relative paths inside the scratch directory
fn pin_path(root: &Path, name: &str) -> Result<PathBuf, String> {
    let relative = Path::new(name);
    let valid = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(format!("pin '{}': only relative paths are allowed", name));
    }
    Ok(root.join(relative))
}

fn env_value(name: &str, bytes: &[u8]) -> Option<String> {
    if name.contains('.') || name.contains('/') || bytes.len() > MAX_ENV_VALUE {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    Some(text.trim_end_matches('\n').to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::job::worker::WorkerPin;
    use crate::transformation::OutputPin;
    use std::collections::BTreeMap;

    fn request(code: &str, inputs: &[(&str, &str)]) -> WorkerRequest {
        let mut pins = BTreeMap::new();
        pins.insert(CODE_PIN.to_string(), pin(code));
        for (name, value) in inputs {
            pins.insert(name.to_string(), pin(value));
        }
        WorkerRequest {
            transformation: Checksum::digest(code.as_bytes()),
            language: Some("bash".to_string()),
            output: OutputPin::new("result", "text"),
            meta: None,
            env: None,
            as_map: None,
            pins,
        }
    }

    fn pin(value: &str) -> WorkerPin {
        WorkerPin {
            celltype: "text".to_string(),
            subcelltype: None,
            buffer: hex::encode(value),
        }
    }

    fn result(messages: &[WorkerMessage]) -> Option<Vec<u8>> {
        messages.iter().find_map(|m| match m {
            WorkerMessage::Result { buffer } => hex::decode(buffer).ok(),
            _ => None,
        })
    }

    #[tokio::test]
    async fn stdout_is_the_result() {
        let messages = execute(&request("cat a; echo -n world", &[("a", "hello ")])).await;
        assert_eq!(result(&messages), Some(b"hello world".to_vec()));
    }

    #[tokio::test]
    async fn result_file_wins_over_stdout() {
        let messages = execute(&request("echo noise; echo -n $a > RESULT", &[("a", "7\n")])).await;
        assert_eq!(result(&messages), Some(b"7".to_vec()));
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::Log { stream: LogStream::Stdout, content } if content == "noise\n"
        )));
    }

    #[tokio::test]
    async fn failing_script_reports_error() {
        let messages = execute(&request("echo bad >&2; false", &[])).await;
        assert!(result(&messages).is_none());
        assert!(messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::Error { .. })));
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::Log { stream: LogStream::Stderr, content } if content.contains("bad")
        )));
    }

    #[tokio::test]
    async fn missing_code_pin() {
        let mut req = request("true", &[]);
        req.pins.remove(CODE_PIN);
        let messages = execute(&req).await;
        assert!(matches!(
            &messages[..],
            [WorkerMessage::Error { message }] if message.contains("code")
        ));
    }

    #[tokio::test]
    async fn escaping_pin_names_are_refused() {
        let messages = execute(&request("true", &[("../evil", "x")])).await;
        assert!(matches!(&messages[..], [WorkerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn other_languages_are_refused() {
        let mut req = request("print(1)", &[]);
        req.language = Some("python".to_string());
        let messages = execute(&req).await;
        assert!(matches!(
            &messages[..],
            [WorkerMessage::Error { message }] if message.contains("python")
        ));
    }
}
