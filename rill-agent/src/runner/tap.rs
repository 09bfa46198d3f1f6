//! Remote command execution helper: streams a command's stdout onto the bus.

use crate::bus::{BusSettings, Message, Publisher};
use crate::envelope::StreamChunk;
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 64 * 1024;
const SSH_KEEPALIVE_SECS: u32 = 15;

#[derive(Debug, Clone)]
pub struct TapOptions {
    pub host: String,
    pub command: String,
    pub username: String,
    pub password: String,
    pub bind: String,
    /// Run the command on this machine instead of over ssh.
    pub local: bool,
    /// How long to wait for subscribers to drain after the command ended.
    pub linger: Duration,
}

impl TapOptions {
    fn build_command(&self) -> Command {
        if self.local {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&self.command);
            return command;
        }

        let mut command = if self.password.is_empty() {
            let mut ssh = Command::new("ssh");
            ssh.args(["-o", "BatchMode=yes"]);
            ssh
        } else {
            let mut sshpass = Command::new("sshpass");
            sshpass.arg("-e").arg("ssh").env("SSHPASS", &self.password);
            sshpass
        };
        command
            .args(["-o", &format!("ServerAliveInterval={SSH_KEEPALIVE_SECS}")])
            .args(["-o", "StrictHostKeyChecking=accept-new"]);
        if !self.username.is_empty() {
            command.arg("-l").arg(&self.username);
        }
        command.arg(&self.host).arg(&self.command);
        command
    }
}

/// Decodes UTF-8 across read boundaries, holding back a split multi-byte sequence.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    carry: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.carry.len());
        let mut rest: &[u8] = &self.carry;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let held = rest.to_vec();
        self.carry = held;
        text
    }

    /// Whatever is still held back, decoded lossily.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

/// Returns the command's exit code.
pub async fn run(options: TapOptions, settings: BusSettings, cancel_token: CancellationToken) -> Result<i32> {
    let publisher = Publisher::bind(&options.bind, settings, &cancel_token).await?;

    let mut child = options
        .build_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start command for {}", options.host))?;
    let mut stdout = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let session = Uuid::new_v4().to_string();
    info!(
        host = %options.host,
        local = options.local,
        bind = %options.bind,
        session = %session,
        "tap started"
    );

    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    let mut decoder = Utf8Carry::default();
    let mut bytes_read: u64 = 0;
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("tap cancelled; stopping command");
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "failed to stop command");
                }
                break;
            }
            read = stdout.read(&mut buffer) => read.context("failed to read command output")?,
        };
        if read == 0 {
            break;
        }
        bytes_read += read as u64;
        let text = decoder.decode(&buffer[..read]);
        if !text.is_empty() {
            publish_chunk(&publisher, StreamChunk::data(text).in_session(&session)).await?;
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        publish_chunk(&publisher, StreamChunk::data(rest).in_session(&session)).await?;
    }
    publish_chunk(&publisher, StreamChunk::end().in_session(&session)).await?;

    let status = child.wait().await.context("failed to wait for command")?;
    let code = status.code().unwrap_or(1);
    info!(host = %options.host, exit_code = code, bytes_read, "command finished");

    publisher.drain(options.linger).await;
    Ok(code)
}

async fn publish_chunk(publisher: &Publisher, chunk: StreamChunk) -> Result<()> {
    let payload = chunk.encode().context("failed to encode stream chunk")?;
    publisher.publish(&Message::single(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscriber;

    #[test]
    fn split_multibyte_sequences_are_carried_over() {
        let bytes = "naïve café\n".as_bytes();
        let split = 3; // inside the two-byte 'ï'
        let mut decoder = Utf8Carry::default();
        let first = decoder.decode(&bytes[..split]);
        let second = decoder.decode(&bytes[split..]);
        assert_eq!(first, "na");
        assert_eq!(format!("{first}{second}"), "naïve café\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn remote_command_uses_ssh_with_credentials() {
        let options = TapOptions {
            host: "jabbah2".to_string(),
            command: "tail -f /var/log/messages".to_string(),
            username: "ops".to_string(),
            password: String::new(),
            bind: "tcp://127.0.0.1:0".to_string(),
            local: false,
            linger: Duration::from_millis(10),
        };
        let command = options.build_command();
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "ssh");
        let args: Vec<_> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(&args[args.len() - 4..], ["-l", "ops", "jabbah2", "tail -f /var/log/messages"]);
    }

    #[tokio::test]
    async fn local_command_output_is_published_then_end_of_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        let addr = reserved.local_addr().expect("addr").to_string();
        drop(reserved);

        let cancel = CancellationToken::new();
        let mut subscriber = Subscriber::connect(&addr, Vec::new(), 64, &cancel).expect("connect");
        let options = TapOptions {
            host: "localhost".to_string(),
            command: "printf 'one\\ntwo\\nthr'; exit 3".to_string(),
            username: String::new(),
            password: String::new(),
            bind: addr,
            local: true,
            linger: Duration::from_secs(5),
        };
        let settings = BusSettings {
            high_water_mark: 16,
            spill_dir: dir.path().to_path_buf(),
            max_spill_bytes: 1 << 20,
        };
        let code = run(options, settings, cancel.clone()).await.expect("tap runs");
        assert_eq!(code, 3);

        let mut contents = String::new();
        let mut sessions = std::collections::BTreeSet::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
                .await
                .expect("message in time")
                .expect("message");
            let chunk = StreamChunk::decode(message.payload()).expect("chunk");
            sessions.insert(chunk.session.clone().expect("tagged with the tap session"));
            if chunk.end_of_stream {
                break;
            }
            contents.push_str(chunk.contents());
        }
        assert_eq!(contents, "one\ntwo\nthr");
        assert_eq!(sessions.len(), 1);
        cancel.cancel();
    }
}
