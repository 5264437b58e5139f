//! Realtime engine over WebSocket
//!
//! JSON text frames. The client opens with a `setup` message and waits for
//! `setupComplete`; audio travels as base64 PCM inside `realtimeInput`
//! upstream and `serverContent.modelTurn` downstream.
//!
//! Turn taking is client-driven: setup disables the engine's own activity
//! detection, and every utterance is bracketed by `activityStart` and
//! `activityEnd`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{AudioUplink, EventDownlink, ServerEvent, Transport};
use crate::config::EngineConfig;
use crate::voice::{AudioChunk, AudioFrame, SAMPLE_RATE};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// -- Upstream messages -------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    realtime_input_config: RealtimeInputConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputConfig {
    automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Serialize)]
struct AutomaticActivityDetection {
    disabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity_start: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity_end: Option<Empty>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    data: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

fn setup_message(config: &EngineConfig) -> Result<String> {
    let voice = config.voice_name.as_deref().filter(|v| !v.is_empty());
    let instruction = config
        .system_instruction
        .as_deref()
        .filter(|s| !s.is_empty());

    let message = SetupMessage {
        setup: Setup {
            model: &config.model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: voice.map(|voice_name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice { voice_name },
                    },
                }),
            },
            system_instruction: instruction.map(|text| Content {
                parts: [TextPart { text }],
            }),
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection { disabled: true },
            },
        },
    };
    Ok(serde_json::to_string(&message)?)
}

fn realtime_input(input: RealtimeInput) -> Result<String> {
    Ok(serde_json::to_string(&RealtimeInputMessage {
        realtime_input: input,
    })?)
}

fn activity_start_message() -> Result<String> {
    realtime_input(RealtimeInput {
        activity_start: Some(Empty {}),
        ..RealtimeInput::default()
    })
}

fn activity_end_message() -> Result<String> {
    realtime_input(RealtimeInput {
        activity_end: Some(Empty {}),
        ..RealtimeInput::default()
    })
}

fn audio_message(frame: &AudioFrame) -> Result<String> {
    realtime_input(RealtimeInput {
        audio: Some(Blob {
            data: BASE64.encode(frame.to_le_bytes()),
            mime_type: format!("audio/pcm;rate={SAMPLE_RATE}"),
        }),
        ..RealtimeInput::default()
    })
}

// -- Downstream messages -----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Decode one downstream JSON message into engine events
///
/// Setup acknowledgements and non-audio parts produce no events.
///
/// # Errors
///
/// Returns `Error::Protocol` for malformed JSON, non-PCM audio or bad base64
pub fn decode_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad message: {e}")))?;

    let mut events = Vec::new();

    if let Some(error) = message.error {
        events.push(ServerEvent::Error(error.message));
        return Ok(events);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|p| p.inline_data) {
            if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/pcm") {
                return Err(Error::Protocol(format!(
                    "unsupported audio type: {}",
                    inline.mime_type
                )));
            }
            let bytes = BASE64
                .decode(inline.data.as_bytes())
                .map_err(|e| Error::Protocol(format!("bad audio payload: {e}")))?;
            events.push(ServerEvent::Audio(AudioChunk::from_le_bytes(&bytes)));
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    Ok(events)
}

fn is_setup_complete(text: &str) -> Result<bool> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad message: {e}")))?;
    if let Some(error) = message.error {
        return Err(Error::Connect(error.message));
    }
    Ok(message.setup_complete.is_some())
}

fn message_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

// -- Transport ---------------------------------------------------------------

/// Connects to the realtime engine over WebSocket
#[derive(Debug)]
pub struct WebSocketTransport {
    config: EngineConfig,
    setup_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport for the configured engine
    ///
    /// # Errors
    ///
    /// Returns error if the engine URL is invalid
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Url::parse(&config.url).map_err(|e| Error::Config(format!("invalid engine url: {e}")))?;
        Ok(Self {
            config: config.clone(),
            setup_timeout: Duration::from_millis(config.setup_timeout_ms),
        })
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| Error::Config(format!("invalid engine url: {e}")))?;
        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair("key", key.expose_secret());
        }
        Ok(url)
    }

    async fn handshake(&self, ws: &mut WsStream) -> Result<()> {
        ws.send(Message::text(setup_message(&self.config)?))
            .await
            .map_err(|e| Error::Connect(format!("setup send failed: {e}")))?;

        while let Some(message) = ws.next().await {
            let message = message.map_err(|e| Error::Connect(e.to_string()))?;
            if let Message::Close(frame) = &message {
                let reason = frame
                    .as_ref()
                    .map_or_else(String::new, |f| f.reason.to_string());
                return Err(Error::Connect(format!("engine closed during setup: {reason}")));
            }
            if let Some(text) = message_text(&message) {
                if is_setup_complete(text)? {
                    return Ok(());
                }
            }
        }
        Err(Error::Connect("engine closed during setup".to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(Box<dyn AudioUplink>, Box<dyn EventDownlink>)> {
        let url = self.endpoint()?;
        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            model = %self.config.model,
            "connecting to engine"
        );

        let (mut ws, _) = tokio::time::timeout(self.setup_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Connect("connect timed out".to_string()))?
            .map_err(|e| Error::Connect(e.to_string()))?;

        tokio::time::timeout(self.setup_timeout, self.handshake(&mut ws))
            .await
            .map_err(|_| Error::Connect("setup timed out".to_string()))??;

        let (sink, stream) = ws.split();
        Ok((
            Box::new(WsUplink {
                sink,
                in_activity: false,
            }),
            Box::new(WsDownlink {
                stream,
                backlog: VecDeque::new(),
            }),
        ))
    }
}

struct WsUplink {
    sink: SplitSink<WsStream, Message>,
    in_activity: bool,
}

impl WsUplink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }
}

#[async_trait]
impl AudioUplink for WsUplink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        if !self.in_activity {
            self.send_text(activity_start_message()?).await?;
            self.in_activity = true;
        }
        self.send_text(audio_message(frame)?).await
    }

    async fn end_utterance(&mut self) -> Result<()> {
        if !self.in_activity {
            return Ok(());
        }
        self.in_activity = false;
        self.send_text(activity_end_message()?).await
    }

    async fn reset_turn(&mut self) -> Result<()> {
        // a new activity interrupts the answer in progress
        self.send_text(activity_start_message()?).await?;
        self.in_activity = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(Error::from)
    }
}

struct WsDownlink {
    stream: SplitStream<WsStream>,
    backlog: VecDeque<ServerEvent>,
}

#[async_trait]
impl EventDownlink for WsDownlink {
    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Ok(Some(event));
            }

            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            let message = message.map_err(|e| Error::Receive(e.to_string()))?;

            if let Message::Close(frame) = &message {
                tracing::debug!(?frame, "engine closed the stream");
                return Ok(None);
            }
            if let Some(text) = message_text(&message) {
                self.backlog.extend(decode_server_message(text)?);
            }
        }
    }
}
