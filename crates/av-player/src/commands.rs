//! Line-oriented transport commands read from stdin.
//!
//! ```text
//! play | p          start or resume
//! pause             pause
//! <empty line>      toggle play/pause
//! stop | s          stop (play restarts from the beginning)
//! seek 42.5         jump to 42.5 s
//! +10 / -10         jump relative to the current position (seconds)
//! status | i        print a status line
//! quit | q          close and exit
//! ```

use anyhow::{Result, anyhow, bail};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UserCommand {
    Play,
    Pause,
    Toggle,
    Stop,
    Seek(SeekTarget),
    Status,
    Quit,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SeekTarget {
    Absolute(u64),
    Forward(u64),
    Back(u64),
}

impl SeekTarget {
    /// Absolute target in milliseconds given the current position.
    pub fn resolve(self, position_ms: u64) -> u64 {
        match self {
            SeekTarget::Absolute(ms) => ms,
            SeekTarget::Forward(ms) => position_ms.saturating_add(ms),
            SeekTarget::Back(ms) => position_ms.saturating_sub(ms),
        }
    }
}

pub fn parse_command(line: &str) -> Result<UserCommand> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(UserCommand::Toggle);
    }
    if let Some(rest) = line.strip_prefix('+') {
        return Ok(UserCommand::Seek(SeekTarget::Forward(parse_seconds(rest)?)));
    }
    if let Some(rest) = line.strip_prefix('-') {
        return Ok(UserCommand::Seek(SeekTarget::Back(parse_seconds(rest)?)));
    }

    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_lowercase();
    let cmd = match verb.as_str() {
        "play" | "p" => UserCommand::Play,
        "pause" => UserCommand::Pause,
        "stop" | "s" => UserCommand::Stop,
        "status" | "i" => UserCommand::Status,
        "quit" | "q" | "exit" => UserCommand::Quit,
        "seek" => {
            let arg = parts.next().ok_or_else(|| anyhow!("seek needs a position in seconds"))?;
            UserCommand::Seek(SeekTarget::Absolute(parse_seconds(arg)?))
        }
        other => bail!("unknown command: {other}"),
    };
    if parts.next().is_some() {
        bail!("unexpected arguments after {verb}");
    }
    Ok(cmd)
}

fn parse_seconds(s: &str) -> Result<u64> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| anyhow!("not a number of seconds: {s:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("seconds must be a non-negative number: {s:?}");
    }
    Ok((secs * 1000.0).round() as u64)
}
