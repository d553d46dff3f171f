use crate::connection::PeerHandle;
use crate::sensor::{PacketError, SensorPacket};
use std::time::Duration;
use tokio::sync::oneshot;

/// Which end of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Handheld side: selects the peer, drives sessions, consumes samples
    Controller,
    /// Wearable side: owns the sensors and streams packets
    Producer,
}

/// Topic-free discriminant of [`Message`], used as the dispatcher key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TestConnection,
    TestConnectionResponse,
    StartCapture,
    CaptureStarted,
    SensorData,
    MoreSensorData,
    StopCapture,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::TestConnection,
        MessageKind::TestConnectionResponse,
        MessageKind::StartCapture,
        MessageKind::CaptureStarted,
        MessageKind::SensorData,
        MessageKind::MoreSensorData,
        MessageKind::StopCapture,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            MessageKind::TestConnection => "/test_connection",
            MessageKind::TestConnectionResponse => "/test_connection_response",
            MessageKind::StartCapture => "/start_capture",
            MessageKind::CaptureStarted => "/sensor_capture_started",
            MessageKind::SensorData => "/sensor_data",
            MessageKind::MoreSensorData => "/more_sensor_data",
            MessageKind::StopCapture => "/stop_capture",
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == topic)
    }

    /// The only role allowed to originate this message
    pub fn sender(self) -> Role {
        match self {
            MessageKind::TestConnection
            | MessageKind::StartCapture
            | MessageKind::MoreSensorData
            | MessageKind::StopCapture => Role::Controller,
            MessageKind::TestConnectionResponse
            | MessageKind::CaptureStarted
            | MessageKind::SensorData => Role::Producer,
        }
    }
}

/// Decoded wire message. Decoding happens once, at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    TestConnection,
    TestConnectionResponse(String),
    StartCapture { samples_per_packet: usize },
    CaptureStarted,
    SensorData(SensorPacket),
    MoreSensorData,
    StopCapture,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("invalid samples per packet: {0:?}")]
    InvalidSamplesPerPacket(String),

    #[error("malformed sensor packet: {0}")]
    Packet(#[from] PacketError),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::TestConnection => MessageKind::TestConnection,
            Message::TestConnectionResponse(_) => MessageKind::TestConnectionResponse,
            Message::StartCapture { .. } => MessageKind::StartCapture,
            Message::CaptureStarted => MessageKind::CaptureStarted,
            Message::SensorData(_) => MessageKind::SensorData,
            Message::MoreSensorData => MessageKind::MoreSensorData,
            Message::StopCapture => MessageKind::StopCapture,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind().topic()
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::TestConnectionResponse(text) => text.as_bytes().to_vec(),
            Message::StartCapture { samples_per_packet } => {
                samples_per_packet.to_string().into_bytes()
            }
            Message::SensorData(packet) => packet.encode().into_bytes(),
            Message::TestConnection
            | Message::CaptureStarted
            | Message::MoreSensorData
            | Message::StopCapture => Vec::new(),
        }
    }

    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let kind =
            MessageKind::from_topic(topic).ok_or_else(|| DecodeError::UnknownTopic(topic.into()))?;
        let text = String::from_utf8_lossy(payload);

        let message = match kind {
            MessageKind::TestConnection => Message::TestConnection,
            MessageKind::TestConnectionResponse => {
                Message::TestConnectionResponse(text.into_owned())
            }
            MessageKind::StartCapture => {
                let samples_per_packet = text
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| DecodeError::InvalidSamplesPerPacket(text.to_string()))?;
                Message::StartCapture { samples_per_packet }
            }
            MessageKind::CaptureStarted => Message::CaptureStarted,
            MessageKind::SensorData => Message::SensorData(SensorPacket::parse(&text)?),
            MessageKind::MoreSensorData => Message::MoreSensorData,
            MessageKind::StopCapture => Message::StopCapture,
        };

        Ok(message)
    }
}

/// Which controller flow a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Training,
    Recognition,
}

/// Controller-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    DelayedStart { remaining: Duration },
    Waiting,
    Receiving,
}

impl ControllerState {
    /// States in which the peer may be streaming on our behalf
    pub fn is_capturing(&self) -> bool {
        matches!(self, ControllerState::Waiting | ControllerState::Receiving)
    }
}

/// Why a controller session went back to `Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ManualStop,
    StopAfterSampleCount,
    NoResponseFromPeer,
    NoPeerSelected,
    /// Another session on the same link is still capturing
    CaptureInUse,
    CsvFileNotCreated,
    CsvFileAlreadyExists,
    CsvWriteFailed,
    ModelNotCompatible,
    RecognitionError,
}

/// Snapshot published on the session status channel
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub kind: SessionKind,
    pub state: ControllerState,
    pub stop_reason: Option<StopReason>,
    pub samples_captured: u64,
    pub packets_received: u64,
}

impl SessionStatus {
    pub fn idle(kind: SessionKind) -> Self {
        Self {
            kind,
            state: ControllerState::Idle,
            stop_reason: None,
            samples_captured: 0,
            packets_received: 0,
        }
    }
}

/// Commands for a controller session
pub enum SessionCommand {
    Start,
    /// Stops (or cancels a countdown) and replies with the samples captured
    Stop(oneshot::Sender<u64>),
}

/// Producer-side service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Stopped,
    Listening,
    Running,
    NotConnected,
    PermissionDenied,
}

/// Commands for the producer service
pub enum ProducerCommand {
    Stop,
}

/// Everything the producer reacts to from the link
#[derive(Debug, Clone)]
pub enum ProducerInput {
    Message(Message),
    PeersChanged(Vec<PeerHandle>),
}
