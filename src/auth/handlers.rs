use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower_sessions::Session;
use tracing::{error, instrument};

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, RegisterRequest,
            UserResponse,
        },
        repo_types::User,
        services,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/change-password", post(change_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

#[instrument(skip(state, session, payload))]
pub async fn register(
    State(state): State<AppState>,
    session: Session,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, (StatusCode, String)> {
    services::register(&state, &session, payload)
        .await
        .map(Json)
        .map_err(internal)
}

#[instrument(skip(state, session, payload))]
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<UserResponse>, (StatusCode, String)> {
    services::login(&state, &session, payload)
        .await
        .map(Json)
        .map_err(internal)
}

#[instrument(skip(session))]
pub async fn logout(session: Session) -> Json<bool> {
    Json(services::logout(&session).await)
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Json<bool> {
    Json(services::forgot_password(&state, payload).await)
}

#[instrument(skip(state, session, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    session: Session,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<UserResponse>, (StatusCode, String)> {
    services::change_password(&state, &session, payload)
        .await
        .map(Json)
        .map_err(internal)
}

#[instrument(skip(state, session))]
pub async fn get_me(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Option<User>>, (StatusCode, String)> {
    services::me(&state, &session)
        .await
        .map(Json)
        .map_err(internal)
}
