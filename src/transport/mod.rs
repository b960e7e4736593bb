//! Telephony transport seam.
//!
//! A transport is a room-based media session with SIP dial-out and transfer.
//! The call core consumes the [`Transport`] trait: audio in and out as
//! pipeline processors, REST-style call control, and lifecycle events
//! delivered over a broadcast channel that the orchestrator folds into its
//! session bus.

pub mod room;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::Result;
use crate::frames::{AudioFrame, Frame, FrameDirection, KeypadEntry};
use crate::pipeline::processor::{Processor, ProcessorContext, SourceEvent};

/// Capacity of the transport event fan-out.
pub const EVENT_CHANNEL_SIZE: usize = 32;

/// Transport lifecycle events observed by the orchestrator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The bot joined the room.
    Joined,
    /// First remote participant joined (dial-in answer).
    FirstParticipantJoined {
        /// Vendor participant id.
        participant_id: String,
    },
    /// The remote client disconnected.
    ClientDisconnected,
    /// Dial-in setup failed.
    DialinError {
        /// Vendor error detail.
        message: String,
    },
    /// A dial-out (initial or transfer) was answered.
    DialoutAnswered {
        /// Vendor participant id, when provided.
        participant_id: Option<String>,
    },
    /// The dial-out leg stopped.
    DialoutStopped,
    /// A dial-out attempt failed.
    DialoutError {
        /// Vendor error detail.
        message: String,
    },
    /// A participant left the room.
    ParticipantLeft {
        /// Vendor participant id.
        participant_id: String,
    },
}

/// A room-based telephony transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The audio source processor. Callable once per call.
    fn input(&self) -> Box<dyn Processor>;

    /// The audio sink processor. Callable once per call.
    fn output(&self) -> Box<dyn Processor>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Start a dial-out to an E.164 number. Completion is reported through
    /// [`TransportEvent::DialoutAnswered`] / [`TransportEvent::DialoutError`].
    async fn start_dialout(&self, phone_number: &str) -> Result<()>;

    /// Cold-transfer the call to a SIP endpoint.
    async fn sip_call_transfer(&self, to_end_point: &str) -> Result<()>;

    /// Enable transcription capture for a participant.
    async fn capture_participant_transcription(&self, participant_id: &str) -> Result<()>;

    /// Delete any media recordings at the vendor (PHI compliance).
    async fn delete_recordings(&self) -> Result<()>;

    /// Send one DTMF tone on the active call.
    async fn send_dtmf(&self, key: KeypadEntry) -> Result<()>;
}

/// Audio source stage: reads the transport's inbound media channel and
/// emits [`Frame::AudioRaw`] downstream.
pub struct TransportInput {
    audio_rx: Option<mpsc::Receiver<AudioFrame>>,
}

impl TransportInput {
    /// Wrap an inbound media channel.
    pub fn new(audio_rx: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            audio_rx: Some(audio_rx),
        }
    }
}

#[async_trait]
impl Processor for TransportInput {
    fn name(&self) -> &'static str {
        "transport_input"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        ctx.push_frame(frame, direction).await
    }

    async fn source_event(&mut self) -> Option<SourceEvent> {
        match self.audio_rx.as_mut() {
            Some(rx) => rx.recv().await.map(SourceEvent::Audio),
            None => None,
        }
    }

    async fn on_source_event(&mut self, event: SourceEvent, ctx: &ProcessorContext) -> Result<()> {
        if let SourceEvent::Audio(frame) = event {
            ctx.push_frame(Frame::AudioRaw(frame), FrameDirection::Downstream)
                .await?;
        }
        Ok(())
    }
}

/// Sink side: forwards synthesized audio to the outbound media channel and
/// urgent DTMF to a dedicated tone channel so keypresses overtake queued
/// audio.
pub struct TransportOutput {
    audio_tx: mpsc::Sender<AudioFrame>,
    dtmf_tx: mpsc::UnboundedSender<KeypadEntry>,
}

impl TransportOutput {
    /// Wrap the outbound media and tone channels.
    pub fn new(
        audio_tx: mpsc::Sender<AudioFrame>,
        dtmf_tx: mpsc::UnboundedSender<KeypadEntry>,
    ) -> Self {
        Self { audio_tx, dtmf_tx }
    }
}

#[async_trait]
impl Processor for TransportOutput {
    fn name(&self) -> &'static str {
        "transport_output"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if direction == FrameDirection::Upstream {
            return ctx.push_frame(frame, direction).await;
        }
        match frame {
            Frame::AudioRaw(audio) => {
                if self.audio_tx.send(audio).await.is_err() {
                    warn!("outbound media channel closed");
                }
                Ok(())
            }
            Frame::DtmfUrgent(key) => {
                if self.dtmf_tx.send(key).is_err() {
                    warn!("DTMF channel closed");
                }
                Ok(())
            }
            other => ctx.push_frame(other, direction).await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::pipeline::Pipeline;

    #[tokio::test]
    async fn input_converts_media_to_frames() {
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let input = TransportInput::new(audio_rx);
        let pipeline = Pipeline::new(vec![Box::new(input)]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);

        audio_tx
            .send(AudioFrame::mono(vec![1, 2, 3, 4], 16_000))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.queue_frames(vec![Frame::End]).unwrap();
        task.run().await.unwrap();
    }

    #[tokio::test]
    async fn output_routes_dtmf_to_tone_channel() {
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let (dtmf_tx, mut dtmf_rx) = mpsc::unbounded_channel();
        let mut output = TransportOutput::new(audio_tx, dtmf_tx);

        let (down_tx, _down_rx) = mpsc::channel(8);
        let (up_tx, _up_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let ctx = ProcessorContext::new(
            "test",
            down_tx,
            up_tx,
            events_tx,
            std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            tokio_util::sync::CancellationToken::new(),
        );

        output
            .process(
                Frame::DtmfUrgent(KeypadEntry::Digit(1)),
                FrameDirection::Downstream,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(dtmf_rx.try_recv().unwrap(), KeypadEntry::Digit(1));

        output
            .process(
                Frame::AudioRaw(AudioFrame::mono(vec![0; 4], 24_000)),
                FrameDirection::Downstream,
                &ctx,
            )
            .await
            .unwrap();
        assert!(audio_rx.try_recv().is_ok());
    }
}
