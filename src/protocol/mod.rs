//! Command grammar, response classification, and wire framing.

use thiserror::Error;

/// A validated interactive command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play(Option<u32>),
    List,
    Info(u32),
    Stop,
    Exit,
}

/// How the server answers a given command. The wire format carries no
/// length or type tag, so the shape is implied by the request alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Finite text payload, drained until the line goes quiet.
    Bounded,
    /// Open-ended audio byte stream, consumed until cancel or end of song.
    Stream,
    /// Handled entirely client-side; no exchange is opened.
    Local,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid track index: {0}")]
    InvalidIndex(String),
    #[error("{0} does not take an argument")]
    UnexpectedArgument(&'static str),
    #[error("info requires a track index")]
    MissingIndex,
}

impl Command {
    /// Parse one line of user input. Returns `None` for blank lines.
    ///
    /// All validation happens here, before any network I/O; the rule for
    /// which commands carry an integer argument lives in this one place.
    pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
        let mut tokens = line.split_whitespace();
        let Some(word) = tokens.next() else {
            return Ok(None);
        };
        let argument = tokens.next();
        if tokens.next().is_some() {
            return Err(ParseError::UnknownCommand(line.trim().to_string()));
        }

        let command = match word {
            "play" => Command::Play(argument.map(parse_index).transpose()?),
            "list" => reject_argument("list", argument, Command::List)?,
            "info" => match argument {
                Some(raw) => Command::Info(parse_index(raw)?),
                None => return Err(ParseError::MissingIndex),
            },
            "stop" => reject_argument("stop", argument, Command::Stop)?,
            "exit" => reject_argument("exit", argument, Command::Exit)?,
            _ => return Err(ParseError::UnknownCommand(line.trim().to_string())),
        };

        Ok(Some(command))
    }

    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::List | Command::Info(_) => ResponseKind::Bounded,
            Command::Play(_) => ResponseKind::Stream,
            Command::Stop | Command::Exit => ResponseKind::Local,
        }
    }

    /// The string sent over the wire. Local commands have none.
    pub fn wire_text(&self) -> Option<String> {
        match self {
            Command::Play(None) => Some("play".to_string()),
            Command::Play(Some(index)) => Some(format!("play {index}")),
            Command::List => Some("list".to_string()),
            Command::Info(index) => Some(format!("info {index}")),
            Command::Stop | Command::Exit => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Play(_) => "play",
            Command::List => "list",
            Command::Info(_) => "info",
            Command::Stop => "stop",
            Command::Exit => "exit",
        }
    }
}

fn parse_index(raw: &str) -> Result<u32, ParseError> {
    raw.parse::<u32>()
        .map_err(|_| ParseError::InvalidIndex(raw.to_string()))
}

fn reject_argument(
    command: &'static str,
    argument: Option<&str>,
    parsed: Command,
) -> Result<Command, ParseError> {
    match argument {
        Some(_) => Err(ParseError::UnexpectedArgument(command)),
        None => Ok(parsed),
    }
}

/// Frame a command string for the wire: big-endian `u16` byte length
/// followed by the UTF-8 bytes, one frame per exchange.
pub fn encode_frame(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
