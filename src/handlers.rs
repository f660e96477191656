use std::{path::Path, time::Instant};

use axum::{
    extract::{Extension, Json, Multipart, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::extract_bearer_token,
    cleanup::TempFile,
    error::ApiError,
    identity::{AuthenticatedUser, Identity},
    plans::{self, Operation},
    processor::{
        sanitize_base_name, sanitize_filename_for_header, ModelType, OutputFormat, ResizeParams,
        Scale, UpscaleParams,
    },
    quota::{OperationUsage, QuotaGate},
    state::AppState,
    upload::save_image_from_multipart,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GuestUsageQuery {
    pub fingerprint: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let python = match tokio::process::Command::new(&state.config.python_bin)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            // Some interpreters print the version banner to stderr.
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                stdout
            }
        }
        Ok(output) => format!("unavailable (exit status {})", output.status),
        Err(error) => format!("unavailable ({error})"),
    };

    let database = if state.ledger.ping().await {
        "ok"
    } else {
        "unavailable"
    };

    Json(json!({
        "status": if database == "ok" { "ok" } else { "degraded" },
        "python": python,
        "database": database,
        "availableJobSlots": state.processing_semaphore.available_permits(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Reports the pixel dimensions of an uploaded image. Free to call, no
/// quota involved; the upload is deleted as soon as the probe finishes.
pub async fn get_dimensions(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let request = save_image_from_multipart(
        multipart,
        &state.config.upload_dir,
        state.config.max_upload_bytes,
    )
    .await?;

    let dimensions = state
        .processor
        .probe_dimensions(request.image.file.path())
        .await
        .map_err(|error| {
            tracing::warn!(error = %error, "failed to probe image dimensions");
            ApiError::Validation("Invalid or corrupted image file".to_string())
        })?;

    request.image.file.remove().await;

    Ok(Json(json!({
        "width": dimensions.width,
        "height": dimensions.height,
    }))
    .into_response())
}

pub async fn resize_image(
    State(state): State<AppState>,
    user: Option<Extension<AuthenticatedUser>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let total_started = Instant::now();

    let request = save_image_from_multipart(
        multipart,
        &state.config.upload_dir,
        state.config.max_upload_bytes,
    )
    .await?;

    let identity = Identity::resolve(
        user.map(|Extension(user)| user),
        request.fields.fingerprint.clone(),
    );
    let tier = QuotaGate::tier_for(&identity);
    enforce_upload_cap(request.image.size_bytes, tier)?;

    let params = ResizeParams::from_fields(&request.fields).map_err(ApiError::Validation)?;
    let format = OutputFormat::parse(request.fields.format.as_deref());

    let clearance = state.quota.clear(&identity, Operation::Resize).await?;

    let output_path = state
        .config
        .processed_dir
        .join(format!("resize-{}.{}", Uuid::new_v4(), format.extension()));
    let output_guard = TempFile::new(output_path.clone());

    let run_started = Instant::now();
    let result = state
        .run_processing_job("resize", || async {
            state
                .processor
                .run(request.image.file.path(), &output_path, "resize", &params)
                .await
        })
        .await;
    maybe_log_processing_timing(state.config.log_processing_timings, "resize-run", run_started);

    if let Err(error) = result {
        state.quota.settle_failure(&clearance).await;
        tracing::error!(error = %error, "resize job failed");
        return Err(ApiError::Processing);
    }
    state.quota.settle_success(&clearance).await;

    let bytes = read_output(&output_path).await?;
    request.image.file.remove().await;
    output_guard.remove().await;

    maybe_log_processing_timing(
        state.config.log_processing_timings,
        "resize-total",
        total_started,
    );

    let name = download_name("resized", &request.image.original_name, format);
    Ok(file_response(bytes, format.content_type(), &name))
}

pub async fn upscale_image(
    State(state): State<AppState>,
    user: Option<Extension<AuthenticatedUser>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let total_started = Instant::now();

    let request = save_image_from_multipart(
        multipart,
        &state.config.upload_dir,
        state.config.max_upload_bytes,
    )
    .await?;

    let identity = Identity::resolve(
        user.map(|Extension(user)| user),
        request.fields.fingerprint.clone(),
    );
    let tier = QuotaGate::tier_for(&identity);
    enforce_upload_cap(request.image.size_bytes, tier)?;

    let scale = Scale::parse(request.fields.scale.as_deref());
    let model_type = ModelType::parse(request.fields.model_type.as_deref());
    if model_type.requires_pro() && !plans::pro_model_allowed(tier) {
        return Err(ApiError::ModelNotAllowed {
            model: model_type.as_str().to_string(),
        });
    }

    // The dimension cap is enforced only when the probe succeeds; a probe
    // failure is not fatal, the processor gives the image its final verdict.
    match state
        .processor
        .probe_dimensions(request.image.file.path())
        .await
    {
        Ok(dimensions) => {
            let longest = dimensions.width.max(dimensions.height);
            if longest > scale.max_input_dimension() {
                return Err(ApiError::Validation(format!(
                    "Image too large for {} upscaling. Maximum dimension is {}px, got {}px.",
                    scale.label(),
                    scale.max_input_dimension(),
                    longest
                )));
            }
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to probe image dimensions, proceeding");
        }
    }

    let format = OutputFormat::parse(request.fields.format.as_deref());
    let params = UpscaleParams::new(scale, model_type, tier);

    let clearance = state.quota.clear(&identity, scale.operation()).await?;

    let output_path = state
        .config
        .processed_dir
        .join(format!("upscale-{}.{}", Uuid::new_v4(), format.extension()));
    let output_guard = TempFile::new(output_path.clone());

    let run_started = Instant::now();
    let result = state
        .run_processing_job("upscale", || async {
            state
                .processor
                .run(request.image.file.path(), &output_path, "upscale", &params)
                .await
        })
        .await;
    maybe_log_processing_timing(
        state.config.log_processing_timings,
        "upscale-run",
        run_started,
    );

    if let Err(error) = result {
        state.quota.settle_failure(&clearance).await;
        tracing::error!(error = %error, scale = %scale.label(), "upscale job failed");
        return Err(ApiError::Processing);
    }
    state.quota.settle_success(&clearance).await;

    let bytes = read_output(&output_path).await?;
    request.image.file.remove().await;
    output_guard.remove().await;

    maybe_log_processing_timing(
        state.config.log_processing_timings,
        "upscale-total",
        total_started,
    );

    let name = download_name(
        &format!("upscaled_{}_{}", model_type.as_str(), scale.label()),
        &request.image.original_name,
        format,
    );
    Ok(file_response(bytes, format.content_type(), &name))
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let email = require_field(body.email, "email")?;
    let username = require_field(body.username, "username")?;
    let password = require_field(body.password, "password")?;

    let (user, token) = state.auth.register(&email, &username, &password).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Account created successfully",
            "user": user_json(&user),
            "token": token,
        })),
    )
        .into_response())
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let identifier = require_field(body.email.or(body.username), "email")?;
    let password = require_field(body.password, "password")?;

    let (user, token) = state.auth.login(&identifier, &password).await?;

    Ok(Json(json!({
        "message": "Logged in successfully",
        "user": user_json(&user),
        "token": token,
    }))
    .into_response())
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        state.auth.logout(token).await?;
    }

    Ok(Json(json!({ "message": "Logged out successfully" })).into_response())
}

pub async fn me(Extension(user): Extension<AuthenticatedUser>) -> Response {
    Json(json!({ "user": user_json(&user) })).into_response()
}

pub async fn profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Response, ApiError> {
    let identity = Identity::User(user.clone());
    let report = state.quota.usage_report(&identity).await?;

    Ok(Json(json!({
        "user": user_json(&user),
        "usage": usage_json(&report),
    }))
    .into_response())
}

/// Usage for an anonymous caller, keyed by fingerprint. The fingerprint is
/// client-generated and unverifiable; this endpoint only ever reveals the
/// caller's own guest counters, so spoofing one buys nothing.
pub async fn guest_usage(
    State(state): State<AppState>,
    Query(query): Query<GuestUsageQuery>,
) -> Result<Response, ApiError> {
    let identity = Identity::resolve(None, query.fingerprint);
    if matches!(identity, Identity::Untracked) {
        return Err(ApiError::Validation("Missing fingerprint".to_string()));
    }

    let report = state.quota.usage_report(&identity).await?;

    Ok(Json(json!({
        "tier": "guest",
        "usage": usage_json(&report),
    }))
    .into_response())
}

fn enforce_upload_cap(size_bytes: usize, tier: plans::Tier) -> Result<(), ApiError> {
    let max_bytes = plans::max_upload_bytes(tier);
    if size_bytes > max_bytes {
        return Err(ApiError::FileTooLarge { max_bytes, tier });
    }
    Ok(())
}

fn require_field(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("Missing required field: {name}")))
}

async fn read_output(path: &Path) -> Result<Vec<u8>, ApiError> {
    tokio::fs::read(path).await.map_err(|error| {
        tracing::error!(error = %error, path = %path.display(), "failed to read processed output");
        ApiError::Processing
    })
}

fn file_response(bytes: Vec<u8>, content_type: &'static str, download_name: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(content_disposition) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        sanitize_filename_for_header(download_name)
    )) {
        headers.insert(CONTENT_DISPOSITION, content_disposition);
    }

    (StatusCode::OK, headers, bytes).into_response()
}

fn download_name(prefix: &str, original_name: &str, format: OutputFormat) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("image");
    format!(
        "{prefix}_{}.{}",
        sanitize_base_name(stem),
        format.extension()
    )
}

fn user_json(user: &AuthenticatedUser) -> serde_json::Value {
    json!({
        "id": user.id,
        "email": user.email,
        "username": user.username,
        "tier": user.tier.as_str(),
    })
}

fn usage_json(report: &[(Operation, OperationUsage)]) -> serde_json::Value {
    let mut usage = serde_json::Map::new();
    for (operation, entry) in report {
        usage.insert(
            operation.as_str().to_string(),
            json!({
                "used": entry.used,
                "limit": entry.limit,
                "unlimited": entry.unlimited,
            }),
        );
    }
    serde_json::Value::Object(usage)
}

fn maybe_log_processing_timing(enabled: bool, stage: &str, started_at: Instant) {
    if !enabled {
        return;
    }
    let duration_ms = Instant::now().duration_since(started_at).as_millis();
    tracing::info!(stage = stage, duration_ms, "processing timing");
}
