//! Remux driver: spawns the external media tool, parses its progress status
//! lines, and terminates it gracefully so trailing containers (`moov` atom)
//! flush correctly.

use std::path::Path;
use std::process::Stdio;

use process_utils::tokio_command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};

/// One parsed ffmpeg progress line (`frame=… fps=… q=… size=… time=… bitrate=… speed=…`).
#[derive(Debug, Default, Clone)]
pub struct RemuxStatus {
    pub frame: Option<String>,
    pub fps: Option<String>,
    pub q: Option<String>,
    pub size: Option<String>,
    pub time: Option<String>,
    pub bitrate: Option<String>,
    pub speed: Option<String>,
}

/// Parse one ffmpeg stderr status line into its known fields.
///
/// ffmpeg sometimes emits a bare `key=` with the value on the next
/// whitespace-delimited token (when the value itself contains no spaces but
/// is logged oddly); such tokens are joined with the following token before
/// splitting on `=`.
pub fn parse_status_line(line: &str) -> RemuxStatus {
    let raw_tokens: Vec<&str> = line.split_whitespace().collect();
    let mut tokens: Vec<String> = Vec::with_capacity(raw_tokens.len());
    let mut i = 0;
    while i < raw_tokens.len() {
        let tok = raw_tokens[i];
        if tok.ends_with('=') && i + 1 < raw_tokens.len() {
            tokens.push(format!("{}{}", tok, raw_tokens[i + 1]));
            i += 2;
        } else {
            tokens.push(tok.to_string());
            i += 1;
        }
    }

    let mut status = RemuxStatus::default();
    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            let value = value.to_string();
            match key {
                "frame" => status.frame = Some(value),
                "fps" => status.fps = Some(value),
                "q" => status.q = Some(value),
                "size" => status.size = Some(value),
                "time" => status.time = Some(value),
                "bitrate" => status.bitrate = Some(value),
                "speed" => status.speed = Some(value),
                _ => {}
            }
        }
    }
    status
}

/// A running ffmpeg remux process. Dropping (or calling [`Remuxer::shutdown`])
/// sends an interrupt signal and waits for the child to exit so the output
/// container is finalized.
pub struct Remuxer {
    child: Child,
}

impl Remuxer {
    /// Spawn `ffmpeg -y -hide_banner -loglevel fatal -stats -i <input> [extra_flags] -c copy -movflags faststart <output>`.
    pub fn spawn(input: &Path, output: &Path, extra_flags: &[&str]) -> std::io::Result<Self> {
        let mut cmd = tokio_command("ffmpeg");
        cmd.arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("fatal")
            .arg("-stats")
            .arg("-i")
            .arg(input)
            .args(extra_flags)
            .arg("-c")
            .arg("copy")
            .arg("-movflags")
            .arg("faststart")
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = cmd.spawn()?;
        Ok(Self { child })
    }

    /// Drain stderr status lines, invoking `on_status` for each parsed line,
    /// until the child exits.
    pub async fn run_to_completion<F: FnMut(RemuxStatus)>(
        mut self,
        mut on_status: F,
    ) -> std::io::Result<std::process::ExitStatus> {
        if let Some(stderr) = self.child.stderr.take() {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                // ffmpeg writes progress with `\r`, not `\n`.
                let n = read_until_any(&mut reader, b'\r', b'\n', &mut buf).await?;
                if n == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    on_status(parse_status_line(line));
                }
            }
        }
        self.child.wait().await
    }

    /// Send an interrupt signal and await exit, without draining stderr.
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        send_interrupt(&self.child);
        self.child.wait().await?;
        Ok(())
    }
}

async fn read_until_any<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    delim_a: u8,
    delim_b: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    let mut total = 0;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if byte[0] == delim_a || byte[0] == delim_b {
            return Ok(total);
        }
        buf.push(byte[0]);
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!(error = %e, "failed to signal ffmpeg");
            }
        }
        None => warn!("cannot signal ffmpeg: no pid"),
    }
}

#[cfg(windows)]
fn send_interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        // Best-effort: ffmpeg on Windows honours CTRL_BREAK_EVENT when spawned
        // in its own process group (see process-utils::NoWindowExt for the
        // companion CREATE_NO_WINDOW flag applied at spawn time).
        unsafe {
            windows_generate_ctrl_event(pid);
        }
    } else {
        warn!("cannot signal ffmpeg: no pid");
    }
}

#[cfg(windows)]
unsafe fn windows_generate_ctrl_event(pid: u32) {
    unsafe extern "system" {
        fn GenerateConsoleCtrlEvent(dwCtrlEvent: u32, dwProcessGroupId: u32) -> i32;
    }
    let _ = GenerateConsoleCtrlEvent(1 /* CTRL_BREAK_EVENT */, pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_status_line() {
        let line = "frame=  123 fps=30 q=-1.0 size=    1024kB time=00:00:04.10 bitrate=2048.0kbits/s speed=1.0x";
        let status = parse_status_line(line);
        assert_eq!(status.frame.as_deref(), Some("123"));
        assert_eq!(status.fps.as_deref(), Some("30"));
        assert_eq!(status.time.as_deref(), Some("00:00:04.10"));
        assert_eq!(status.speed.as_deref(), Some("1.0x"));
    }

    #[test]
    fn joins_bare_key_with_next_token() {
        let line = "frame= 123 fps= 30 time=00:00:01.00";
        let status = parse_status_line(line);
        assert_eq!(status.frame.as_deref(), Some("123"));
        assert_eq!(status.fps.as_deref(), Some("30"));
    }
}
