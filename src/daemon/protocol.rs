//! Control protocol: commands, reply tokens and socket framing.
//!
//! A request is the flat string sequence `[COMMAND, pluginName]`; the reply is
//! a single-element sequence holding `OK`, `NOTRUNNING` or an `Error: ...`
//! string. On the wire each sequence is a [`ControlMessage`] serialized with
//! rkyv behind a 4-byte length prefix.

use crate::error::{Result, SupervisorError};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const REPLY_OK: &str = "OK";
pub const REPLY_NOT_RUNNING: &str = "NOTRUNNING";
pub const REPLY_PLUGIN_NOT_FOUND: &str = "Error: Plugin not found";
pub const REPLY_WRONG_ARGUMENT_COUNT: &str = "Error: Wrong number of arguments";
pub const REPLY_UNKNOWN_COMMAND: &str = "Error: Unknown command";

/// Upper bound on a single frame; control messages are a handful of names.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Remove,
    IsRunning,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Start => "START",
            ControlCommand::Stop => "STOP",
            ControlCommand::Remove => "REMOVE",
            ControlCommand::IsRunning => "ISRUNNING",
        }
    }
}

impl FromStr for ControlCommand {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "START" => Ok(ControlCommand::Start),
            "STOP" => Ok(ControlCommand::Stop),
            "REMOVE" => Ok(ControlCommand::Remove),
            "ISRUNNING" => Ok(ControlCommand::IsRunning),
            other => Err(SupervisorError::Protocol(format!("unknown command '{}'", other))),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    NotRunning,
    Error(String),
}

impl ControlReply {
    pub fn plugin_not_found() -> Self {
        ControlReply::Error(REPLY_PLUGIN_NOT_FOUND.to_string())
    }

    pub fn wrong_argument_count() -> Self {
        ControlReply::Error(REPLY_WRONG_ARGUMENT_COUNT.to_string())
    }

    pub fn unknown_command() -> Self {
        ControlReply::Error(REPLY_UNKNOWN_COMMAND.to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControlReply::Error(_))
    }

    pub fn to_wire(&self) -> String {
        match self {
            ControlReply::Ok => REPLY_OK.to_string(),
            ControlReply::NotRunning => REPLY_NOT_RUNNING.to_string(),
            ControlReply::Error(message) => message.clone(),
        }
    }

    pub fn from_wire(frames: &[String]) -> Self {
        match frames {
            [reply] if reply == REPLY_OK => ControlReply::Ok,
            [reply] if reply == REPLY_NOT_RUNNING => ControlReply::NotRunning,
            [reply] => ControlReply::Error(reply.clone()),
            _ => ControlReply::Error(format!("Error: Malformed reply {:?}", frames)),
        }
    }
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// One request or reply on the control socket.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct ControlMessage {
    pub frames: Vec<String>,
}

impl ControlMessage {
    pub fn new<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(|s| s.into()).collect(),
        }
    }
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode(message: &ControlMessage) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Read length prefix, rejecting frames larger than [`MAX_FRAME_LEN`].
    pub fn read_length(buf: &[u8; 4]) -> Result<usize> {
        let len = u32::from_le_bytes(*buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SupervisorError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }
        Ok(len)
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<ControlMessage> {
        // rkyv needs the archive aligned; socket buffers are not.
        let mut aligned = AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);
        let message = rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&aligned)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands_only() {
        assert_eq!("START".parse::<ControlCommand>().unwrap(), ControlCommand::Start);
        assert_eq!("ISRUNNING".parse::<ControlCommand>().unwrap(), ControlCommand::IsRunning);
        assert!("start".parse::<ControlCommand>().is_err());
        assert!("RESTART".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn replies_map_to_wire_tokens() {
        assert_eq!(ControlReply::Ok.to_wire(), "OK");
        assert_eq!(ControlReply::NotRunning.to_wire(), "NOTRUNNING");
        assert_eq!(ControlReply::plugin_not_found().to_wire(), "Error: Plugin not found");
        assert_eq!(ControlReply::from_wire(&["NOTRUNNING".to_string()]), ControlReply::NotRunning);
        assert!(ControlReply::from_wire(&[]).is_error());
    }

    #[test]
    fn frame_carries_length_prefix() {
        let message = ControlMessage::new(["STOP", "scanner"]);
        let bytes = MessageFrame::encode(&message).unwrap();

        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[..4]);
        assert_eq!(MessageFrame::read_length(&len).unwrap(), bytes.len() - 4);
        assert_eq!(MessageFrame::decode(&bytes[4..]).unwrap(), message);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let len = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(MessageFrame::read_length(&len).is_err());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(MessageFrame::decode(&[0xff; 3]).is_err());
    }
}
