//! Local development host: the bot start endpoint.
//!
//! Mirrors the managed platform's start contract so workflows run unchanged
//! against a local process: `POST /start` with a session body, `GET /health`
//! for probes. Sessions run as background tasks; their outcome lands in the
//! session store either way.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use crate::config::{CallType, ServicesConfig};
use crate::error::{CallError, Result};
use crate::services::ServiceFactory;
use crate::session::{CallSession, CallSessionParams};
use crate::store::{PatientStore, SessionStore};
use crate::transport::room::RoomTransport;
use crate::util::{mask_id, mask_phone};

/// Default port of the local host.
pub const DEFAULT_BOT_PORT: u16 = 7860;

/// Dial-in routing details from the carrier webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct DialinSettings {
    /// Carrier call id.
    pub call_id: String,
    /// Carrier domain.
    pub call_domain: String,
    /// Caller phone number.
    pub from: String,
    /// Called phone number.
    pub to: String,
}

/// One dial-out target.
#[derive(Debug, Clone, Deserialize)]
pub struct DialoutTarget {
    /// E.164 phone number.
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
}

fn default_workflow() -> String {
    "eligibility_verification".to_owned()
}

/// The bot start request body.
#[derive(Debug, Deserialize)]
pub struct BotStartRequest {
    /// Session id allocated by the caller.
    pub session_id: String,
    /// Patient id; absent for dial-in.
    #[serde(default)]
    pub patient_id: Option<String>,
    /// Opaque patient/context fields.
    pub call_data: serde_json::Value,
    /// Workflow name.
    #[serde(default = "default_workflow")]
    pub client_name: String,
    /// Owning organization id.
    pub organization_id: String,
    /// Organization slug for config loading.
    pub organization_slug: String,
    /// Dial-in routing; exactly one of this and `dialout_targets`.
    #[serde(default)]
    pub dialin_settings: Option<DialinSettings>,
    /// Dial-out targets; exactly one of this and `dialin_settings`.
    #[serde(default)]
    pub dialout_targets: Option<Vec<DialoutTarget>>,
    /// Per-call transfer endpoint overrides.
    #[serde(default)]
    pub transfer_config: Option<crate::config::ColdTransferConfig>,
    /// Local-mode room URL.
    #[serde(default)]
    pub room_url: Option<String>,
    /// Local-mode room token.
    #[serde(default)]
    pub token: Option<String>,
}

impl BotStartRequest {
    /// Derive call type and phone number, enforcing that exactly one of
    /// `dialin_settings` / `dialout_targets` is present.
    pub fn call_target(&self) -> Result<(CallType, String)> {
        match (&self.dialin_settings, &self.dialout_targets) {
            (Some(dialin), None) => Ok((CallType::DialIn, dialin.from.clone())),
            (None, Some(targets)) => {
                let first = targets.first().ok_or_else(|| {
                    CallError::Config("dialout_targets must not be empty".into())
                })?;
                Ok((CallType::DialOut, first.phone_number.clone()))
            }
            _ => Err(CallError::Config(
                "exactly one of dialin_settings or dialout_targets is required".into(),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.session_id.is_empty()
            || self.organization_id.is_empty()
            || self.organization_slug.is_empty()
            || self.call_data.is_null()
        {
            return Err(CallError::Config(
                "missing required: session_id, call_data, organization_id, organization_slug"
                    .into(),
            ));
        }
        self.call_target().map(|_| ())
    }
}

/// Shared host state.
pub struct HostState {
    /// Root directory of per-workflow configuration.
    pub workflows_root: PathBuf,
    /// Session store.
    pub sessions: Arc<dyn SessionStore>,
    /// Patient store.
    pub patients: Arc<dyn PatientStore>,
}

/// Build the host router.
pub fn router(state: Arc<HostState>) -> Router {
    Router::new()
        .route("/start", post(start_bot))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn start_bot(
    State(state): State<Arc<HostState>>,
    Json(request): Json<BotStartRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, String)> {
    if let Err(e) = request.validate() {
        return Err((StatusCode::BAD_REQUEST, e.to_string()));
    }
    let (call_type, phone_number) = request
        .call_target()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(
        session = %mask_id(&request.session_id),
        workflow = %request.client_name,
        call_type = call_type.as_str(),
        phone = %mask_phone(&phone_number),
        "local bot start"
    );

    let mut config = ServicesConfig::load(
        &state.workflows_root,
        &request.organization_slug,
        &request.client_name,
    )
    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if config.call_type != call_type {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "workflow {} is configured for {} calls",
                request.client_name,
                config.call_type.as_str()
            ),
        ));
    }
    if let Some(overrides) = request.transfer_config {
        config.cold_transfer = Some(overrides);
    }

    let services = ServiceFactory::build(&config)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let room_name = format!("call_{}", request.session_id);
    let (transport, _media) = RoomTransport::new(&config.services.transport, &room_name);

    let _ = state
        .sessions
        .update_session(
            &request.session_id,
            serde_json::json!({
                "status": "starting",
                "created_at": chrono::Utc::now().to_rfc3339(),
                "room_url": request.room_url,
            }),
            &request.organization_id,
        )
        .await;

    let params = CallSessionParams {
        workflow: request.client_name,
        session_id: request.session_id.clone(),
        patient_id: request.patient_id,
        call_data: request.call_data,
        phone_number,
        organization_id: request.organization_id,
        organization_slug: request.organization_slug,
        call_type,
    };
    let mut session = CallSession::new(
        params,
        config,
        services,
        transport,
        Arc::clone(&state.sessions),
        Arc::clone(&state.patients),
    );

    let session_id = request.session_id;
    let response_id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = session.run().await {
            error!(session = %mask_id(&session_id), error = %e, "bot error");
        }
    });

    Ok(Json(serde_json::json!({
        "status": "started",
        "session_id": response_id,
    })))
}

/// Serve the host on the given port until the process exits.
pub async fn serve(state: Arc<HostState>, port: u16) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(CallError::Io)?;
    info!(port, "local bot server listening");
    axum::serve(listener, app).await.map_err(CallError::Io)
}
