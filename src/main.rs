mod auth;
mod cleanup;
mod config;
mod db;
mod error;
mod handlers;
mod identity;
mod ledger;
mod middleware;
mod plans;
mod processor;
mod quota;
mod rate_limit;
mod state;
mod upload;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    for dir in [&config.upload_dir, &config.processed_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let pool = db::connect(&config.database_path).await?;
    tracing::info!(path = %config.database_path.display(), "Database ready");

    let state = AppState::new(config.clone(), pool);

    cleanup::spawn_sweeper(
        vec![config.upload_dir.clone(), config.processed_dir.clone()],
        config.sweep_max_age,
        config.sweep_interval,
        state.ledger.clone(),
    );

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes + 1024 * 1024;

    // route_layer runs outermost-last: the rate limit wraps optional auth.
    let process_router = Router::new()
        .route("/resize", post(handlers::resize_image))
        .route("/upscale", post(handlers::upscale_image))
        .route("/get-dimensions", post(handlers::get_dimensions))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::optional_auth,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::process_rate_limit,
        ));

    let session_router = Router::new()
        .route("/me", get(handlers::me))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let auth_router = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_rate_limit,
        ))
        .route("/logout", post(handlers::logout))
        .route("/usage/guest", get(handlers::guest_usage))
        .merge(session_router);

    let users_router = Router::new()
        .route("/profile", get(handlers::profile))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let api_router = Router::new()
        .nest("/auth", auth_router)
        .nest("/users", users_router)
        .route("/health", get(handlers::health))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::global_rate_limit,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .merge(process_router)
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> Router {
        build_router(state::test_state().await)
    }

    async fn app_with_failing_processor() -> Router {
        let mut config = config::tests::test_config();
        config.python_bin = "false".to_string();
        let pool = db::test_pool().await;
        build_router(AppState::new(config, pool))
    }

    fn multipart_upscale_request(fingerprint: &str) -> Request<Body> {
        let boundary = "router-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"fingerprint\"\r\n\r\n\
             {fingerprint}\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"image\"; filename=\"cat.png\"\r\n\
             Content-Type: image/png\r\n\r\n\
             not-a-real-png\r\n\
             --{boundary}--\r\n"
        );

        Request::builder()
            .method("POST")
            .uri("/upscale")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn unknown_routes_return_404() {
        let response = app()
            .await
            .oneshot(get_request("/definitely-not-a-route", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_login_me_logout_flow() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/auth/register",
                json!({
                    "email": "alice@example.com",
                    "username": "alice",
                    "password": "hunter2hunter2",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["user"]["email"], "alice@example.com");
        assert_eq!(body["user"]["tier"], "free");
        let token = body["token"].as_str().expect("token").to_string();

        let response = app
            .clone()
            .oneshot(get_request("/api/auth/me", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user"]["username"], "alice");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(get_request("/api/auth/me", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_and_profile_require_a_token() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(get_request("/api/auth/me", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(get_request("/api/users/profile", Some("garbage")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn weak_registrations_are_rejected() {
        let response = app()
            .await
            .oneshot(json_request(
                "POST",
                "/api/auth/register",
                json!({
                    "email": "alice@example.com",
                    "username": "alice",
                    "password": "short",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn guest_usage_reports_guest_limits() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(get_request("/api/auth/usage/guest", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get_request("/api/auth/usage/guest?fingerprint=fp_abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tier"], "guest");
        assert_eq!(body["usage"]["upscale_2x"]["limit"], 3);
        assert_eq!(body["usage"]["upscale_4x"]["limit"], 1);
        assert_eq!(body["usage"]["resize"]["unlimited"], true);
    }

    #[tokio::test]
    async fn pro_model_is_rejected_for_guests() {
        let boundary = "router-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"modelType\"\r\n\r\n\
             realesrgan\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"fingerprint\"\r\n\r\n\
             fp_test\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"image\"; filename=\"cat.png\"\r\n\
             Content-Type: image/png\r\n\r\n\
             not-a-real-png\r\n\
             --{boundary}--\r\n"
        );

        let request = Request::builder()
            .method("POST")
            .uri("/upscale")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["upgradeUrl"], "/pricing");
    }

    #[tokio::test]
    async fn failed_processing_returns_500_and_consumes_no_quota() {
        let app = app_with_failing_processor().await;

        let response = app
            .clone()
            .oneshot(multipart_upscale_request("fp_flaky"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Image processing failed.");

        // The released reservation leaves the guest budget untouched.
        let response = app
            .oneshot(get_request("/api/auth/usage/guest?fingerprint=fp_flaky", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["usage"]["upscale_2x"]["used"], 0);
        assert_eq!(body["usage"]["upscale_4x"]["used"], 0);
    }

    #[tokio::test]
    async fn missing_upload_is_a_400() {
        let boundary = "router-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"fingerprint\"\r\n\r\n\
             fp_test\r\n\
             --{boundary}--\r\n"
        );

        let request = Request::builder()
            .method("POST")
            .uri("/resize")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app().await.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "No file uploaded.");
    }
}
