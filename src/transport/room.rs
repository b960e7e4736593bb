//! REST adapter for the room-based telephony vendor.
//!
//! Call control (dial-out, SIP transfer, DTMF, recording deletion) goes over
//! the vendor's REST API; media rides the vendor SDK outside this crate and
//! is bridged through the [`RoomMedia`] channel pair. Vendor webhooks feed
//! [`RoomTransport::emit`].

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::TransportServiceConfig;
use crate::error::{CallError, Result};
use crate::frames::{AudioFrame, KeypadEntry};
use crate::pipeline::processor::Processor;
use crate::transport::{
    EVENT_CHANNEL_SIZE, Transport, TransportEvent, TransportInput, TransportOutput,
};

/// Media channel capacity; roughly one second of 20 ms frames.
const MEDIA_CHANNEL_SIZE: usize = 50;

/// The host-side ends of the media bridge.
pub struct RoomMedia {
    /// Push inbound call audio here.
    pub audio_in_tx: mpsc::Sender<AudioFrame>,
    /// Outbound synthesized audio arrives here.
    pub audio_out_rx: mpsc::Receiver<AudioFrame>,
}

/// Room transport over the vendor REST API.
pub struct RoomTransport {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    room_name: String,
    phone_number_id: Option<String>,
    events_tx: broadcast::Sender<TransportEvent>,
    audio_in_rx: Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    audio_out_tx: mpsc::Sender<AudioFrame>,
}

impl RoomTransport {
    /// Build the transport and its media bridge.
    pub fn new(config: &TransportServiceConfig, room_name: &str) -> (Arc<Self>, RoomMedia) {
        let (audio_in_tx, audio_in_rx) = mpsc::channel(MEDIA_CHANNEL_SIZE);
        let (audio_out_tx, audio_out_rx) = mpsc::channel(MEDIA_CHANNEL_SIZE);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let transport = Arc::new(Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            room_name: room_name.to_owned(),
            phone_number_id: config.phone_number_id.clone(),
            events_tx,
            audio_in_rx: Mutex::new(Some(audio_in_rx)),
            audio_out_tx,
        });
        (
            transport,
            RoomMedia {
                audio_in_tx,
                audio_out_rx,
            },
        )
    }

    /// Inject a lifecycle event (vendor webhook / SDK callback).
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn require_api(&self) -> Result<&str> {
        if self.api_base.is_empty() {
            return Err(CallError::Transport(
                "transport api_base not configured".into(),
            ));
        }
        Ok(&self.api_base)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let base = self.require_api()?;
        let response = self
            .client
            .post(format!("{base}{path}"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::Transport(format!(
                "HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        response
            .json()
            .await
            .or(Ok(serde_json::Value::Null))
    }
}

#[async_trait]
impl Transport for RoomTransport {
    fn input(&self) -> Box<dyn Processor> {
        let rx = self
            .audio_in_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        match rx {
            Some(rx) => Box::new(TransportInput::new(rx)),
            None => {
                warn!("transport input requested twice");
                let (_tx, rx) = mpsc::channel(1);
                Box::new(TransportInput::new(rx))
            }
        }
    }

    fn output(&self) -> Box<dyn Processor> {
        // Tones drain through their own task so the sink never blocks on
        // the vendor REST call.
        let (dtmf_tx, mut dtmf_rx) = mpsc::unbounded_channel::<KeypadEntry>();
        let client = self.client.clone();
        let api_base = self.api_base.clone();
        let api_key = self.api_key.clone();
        let room_name = self.room_name.clone();
        tokio::spawn(async move {
            while let Some(key) = dtmf_rx.recv().await {
                if api_base.is_empty() {
                    warn!("dropping DTMF tone, transport api_base not configured");
                    continue;
                }
                let result = client
                    .post(format!("{api_base}/rooms/{room_name}/sendDTMF"))
                    .bearer_auth(&api_key)
                    .json(&serde_json::json!({ "tones": key.as_str() }))
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(status = %response.status(), "DTMF send rejected");
                    }
                    Err(e) => warn!(error = %e, "DTMF send failed"),
                }
            }
        });
        Box::new(TransportOutput::new(self.audio_out_tx.clone(), dtmf_tx))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn start_dialout(&self, phone_number: &str) -> Result<()> {
        info!(room = %self.room_name, "starting dial-out");
        let mut body = serde_json::json!({ "phoneNumber": phone_number });
        if let Some(id) = &self.phone_number_id {
            body["phoneNumberId"] = serde_json::json!(id);
        }
        self.post(&format!("/rooms/{}/dialOut/start", self.room_name), body)
            .await?;
        Ok(())
    }

    async fn sip_call_transfer(&self, to_end_point: &str) -> Result<()> {
        info!(room = %self.room_name, "initiating SIP transfer");
        self.post(
            &format!("/rooms/{}/sipCallTransfer", self.room_name),
            serde_json::json!({ "toEndPoint": to_end_point }),
        )
        .await?;
        Ok(())
    }

    async fn capture_participant_transcription(&self, participant_id: &str) -> Result<()> {
        self.post(
            &format!("/rooms/{}/transcription/start", self.room_name),
            serde_json::json!({ "participantId": participant_id }),
        )
        .await?;
        Ok(())
    }

    async fn delete_recordings(&self) -> Result<()> {
        let base = self.require_api()?;
        let response = self
            .client
            .get(format!("{base}/recordings"))
            .query(&[("room_name", self.room_name.as_str())])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CallError::Transport(format!("recording list failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CallError::Transport(format!(
                "recording list HTTP {}",
                response.status()
            )));
        }
        let listing: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("recording list decode: {e}")))?;

        let ids: Vec<String> = listing["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| r["id"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        for id in ids {
            let status = self
                .client
                .delete(format!("{base}/recordings/{id}"))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| CallError::Transport(format!("recording delete failed: {e}")))?
                .status();
            if status.is_success() {
                info!(recording = %id, "call recording deleted");
            } else {
                warn!(recording = %id, %status, "failed to delete recording");
            }
        }
        Ok(())
    }

    async fn send_dtmf(&self, key: KeypadEntry) -> Result<()> {
        self.post(
            &format!("/rooms/{}/sendDTMF", self.room_name),
            serde_json::json!({ "tones": key.as_str() }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_base: String) -> TransportServiceConfig {
        TransportServiceConfig {
            api_key: "key".into(),
            phone_number_id: Some("pn-1".into()),
            api_base,
        }
    }

    #[tokio::test]
    async fn dialout_posts_to_vendor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rooms/call_s1/dialOut/start"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, _media) = RoomTransport::new(&config(server.uri()), "call_s1");
        transport.start_dialout("+15551234567").await.unwrap();
    }

    #[tokio::test]
    async fn transfer_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rooms/call_s1/sipCallTransfer"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let (transport, _media) = RoomTransport::new(&config(server.uri()), "call_s1");
        let err = transport
            .sip_call_transfer("sip:staff@clinic.example")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn recordings_are_listed_and_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recordings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "id": "rec-1" }, { "id": "rec-2" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/recordings/rec-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/recordings/rec-2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, _media) = RoomTransport::new(&config(server.uri()), "call_s1");
        transport.delete_recordings().await.unwrap();
    }

    #[tokio::test]
    async fn missing_api_base_is_a_config_error() {
        let (transport, _media) = RoomTransport::new(&config(String::new()), "call_s1");
        assert!(transport.start_dialout("+15551234567").await.is_err());
    }
}
