use super::OAuthService;
use super::account::{EmailRequest, ResetPasswordRequest, VerifyOutcome};
use super::authorization_code::LoginRequest;
use super::error::AuthError;
use super::middleware::{access_token_middleware, basic_credentials};
use super::registration::{
    RegisterClientRequest, RegisterUserRequest, RegisteredClient, UserView,
};
use super::traits::{Claims, TokenResponse};
use axum::{
    Extension, Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Combined OAuth state for all handlers
#[derive(Clone)]
pub struct OAuthAppState {
    pub oauth_service: Arc<OAuthService>,
}

#[derive(Debug, Serialize)]
pub struct CodeResponse {
    pub code: String,
}

/// Token exchange body. The client itself authenticates with HTTP Basic.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub code: String,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Serialize)]
pub struct ClientProfile {
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

fn message(message: &'static str) -> Json<MessageResponse> {
    Json(MessageResponse { message })
}

/// Endpoints that take user or client credentials; these get the stricter
/// rate limit.
pub fn credential_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/login", post(login_handler))
        .route("/oauth/token", post(oauth_token_handler))
        .route("/oauth/refresh", post(oauth_refresh_handler))
        .route("/logout", post(logout_handler))
        .route("/user/register", post(register_handler))
        .route("/user/verify", post(verify_email_handler))
        .route("/user/verify/resend", post(resend_verification_handler))
        .route("/user/password/forgot", post(forgot_password_handler))
        .route("/user/password/reset", post(reset_password_handler))
        .route("/client/register", post(register_client_handler))
        .with_state(state)
}

pub fn resource_routes(state: OAuthAppState) -> Router {
    let protected = Router::new()
        .route("/user/me", get(user_me_handler))
        .layer(middleware::from_fn_with_state(
            state.oauth_service.clone(),
            access_token_middleware,
        ));

    Router::new()
        .route("/client/me", get(client_me_handler))
        .route("/health", get(health_handler))
        .merge(protected)
        .with_state(state)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        tracing::debug!("rejected request body: {}", rejection);
        AuthError::InvalidRequest("Invalid JSON")
    })
}

/// Handler for POST /login
pub async fn login_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<CodeResponse>, AuthError> {
    let req = json_body(payload)?;
    let code = state.oauth_service.login(&req).await?;
    Ok(Json(CodeResponse { code }))
}

/// Handler for POST /oauth/token
pub async fn oauth_token_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    // client auth comes first; a bad client never gets near the code store
    let (client_id, client_secret) =
        basic_credentials(&headers).ok_or(AuthError::Unauthorized)?;
    let req = json_body(payload)?;

    let tokens = state
        .oauth_service
        .exchange_code(
            &client_id,
            &client_secret,
            &req.code,
            req.code_verifier.as_deref(),
        )
        .await?;
    Ok(Json(tokens))
}

/// Handler for POST /oauth/refresh
pub async fn oauth_refresh_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let req = json_body(payload)?;
    let tokens = state.oauth_service.refresh(&req.refresh_token).await?;
    Ok(Json(tokens))
}

/// Handler for POST /logout
pub async fn logout_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<StatusCode, AuthError> {
    let req = json_body(payload)?;
    state.oauth_service.logout(&req.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST /user/register
pub async fn register_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<RegisterUserRequest>, JsonRejection>,
) -> Result<Response, AuthError> {
    let req = json_body(payload)?;
    let user = state.oauth_service.register_user(req).await?;
    Ok((StatusCode::CREATED, Json(UserView::from(&user))).into_response())
}

/// Handler for POST /user/verify?code=...
pub async fn verify_email_handler(
    State(state): State<OAuthAppState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Result<Json<MessageResponse>, AuthError> {
    let Query(query) = query.map_err(|rejection| {
        tracing::debug!("rejected query: {}", rejection);
        AuthError::InvalidRequest("Missing verification code")
    })?;
    match state.oauth_service.verify_email(&query.code).await? {
        VerifyOutcome::Verified => Ok(message("Email verified successfully")),
        VerifyOutcome::AlreadyVerified => Ok(message("Email already verified")),
    }
}

/// Handler for POST /user/verify/resend
pub async fn resend_verification_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AuthError> {
    let req = json_body(payload)?;
    state.oauth_service.resend_verification(&req).await?;
    Ok(message(
        "If the email exists and is unverified, a new verification code has been sent",
    ))
}

/// Handler for POST /user/password/forgot
pub async fn forgot_password_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AuthError> {
    let req = json_body(payload)?;
    state.oauth_service.forgot_password(&req).await?;
    Ok(message(
        "If the email exists, a password reset link has been sent",
    ))
}

/// Handler for POST /user/password/reset
pub async fn reset_password_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AuthError> {
    let req = json_body(payload)?;
    state.oauth_service.reset_password(&req).await?;
    Ok(message("Password reset successfully"))
}

/// Handler for POST /client/register. The response is the only place the
/// plaintext secret ever appears.
pub async fn register_client_handler(
    State(state): State<OAuthAppState>,
    payload: Result<Json<RegisterClientRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisteredClient>), AuthError> {
    let req = json_body(payload)?;
    let client = state.oauth_service.register_client(req).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

/// Handler for GET /user/me, behind the access token middleware
pub async fn user_me_handler(
    State(state): State<OAuthAppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UserProfile>, AuthError> {
    let user = state.oauth_service.user_for_claims(&claims).await?;
    Ok(Json(UserProfile {
        name: format!("{} {}", user.first_name, user.last_name),
        email: user.email,
        first_name: user.first_name,
        last_name: user.last_name,
    }))
}

/// Handler for GET /client/me, lets a client fetch its own public key
pub async fn client_me_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
) -> Result<Json<ClientProfile>, AuthError> {
    let (client_id, client_secret) =
        basic_credentials(&headers).ok_or(AuthError::Unauthorized)?;
    let client = state
        .oauth_service
        .authenticate_client(&client_id, &client_secret)
        .await?;
    Ok(Json(ClientProfile {
        name: client.name,
        public_key: client.public_key,
    }))
}

pub async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::middleware::TRACE_ID_HEADER;
    use crate::auth::pkce::s256_challenge;
    use crate::auth::testing::{CLIENT_A, CLIENT_A_SECRET, CLIENT_B, CLIENT_B_SECRET, Harness};
    use axum::body::Body;
    use axum::http::{Request, header};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const VERIFIER: &str = "handler-test-verifier-with-plenty-of-entropy-0123456789";

    async fn app() -> (Router, Harness) {
        let h = Harness::new().await;
        let state = OAuthAppState {
            oauth_service: h.service.clone(),
        };
        let app = credential_routes(state.clone())
            .merge(resource_routes(state))
            .layer(middleware::from_fn(
                crate::auth::middleware::trace_id_middleware,
            ));
        (app, h)
    }

    fn basic(id: &str, secret: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", id, secret)))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn login(app: &Router, client_id: &str) -> String {
        let (status, _, body) = send(
            app,
            post_json(
                "/login",
                json!({
                    "client_id": client_id,
                    "email": Harness::EMAIL,
                    "password": Harness::PASSWORD,
                    "code_challenge": s256_challenge(VERIFIER),
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["code"].as_str().unwrap().to_string()
    }

    fn token_request(code: &str, id: &str, secret: &str) -> Request<Body> {
        Request::post("/oauth/token")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, basic(id, secret))
            .body(Body::from(
                json!({ "code": code, "code_verifier": VERIFIER }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_lifecycle() {
        let (app, h) = app().await;
        let code = login(&app, CLIENT_A).await;

        let (status, headers, tokens) =
            send(&app, token_request(&code, CLIENT_A, CLIENT_A_SECRET)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.contains_key(TRACE_ID_HEADER));
        assert_eq!(tokens["token_type"], "Bearer");
        assert_eq!(tokens["expires_in"], 900);
        let access = tokens["access_token"].as_str().unwrap().to_string();
        let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

        let me = Request::get("/user/me")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .body(Body::empty())
            .unwrap();
        let (status, _, profile) = send(&app, me).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["email"], Harness::EMAIL);
        assert_eq!(profile["name"], "Ada Lovelace");

        h.clock.advance(chrono::Duration::seconds(2));
        let (status, _, refreshed) = send(
            &app,
            post_json("/oauth/refresh", json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(refreshed.get("refresh_token").is_none());

        let (status, _, _) =
            send(&app, post_json("/logout", json!({ "refresh_token": refresh }))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, body) = send(
            &app,
            post_json("/oauth/refresh", json!({ "refresh_token": refresh })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn test_code_replay_over_http() {
        let (app, _) = app().await;
        let code = login(&app, CLIENT_A).await;

        let (first, _, _) = send(&app, token_request(&code, CLIENT_A, CLIENT_A_SECRET)).await;
        let (second, _, body) = send(&app, token_request(&code, CLIENT_A, CLIENT_A_SECRET)).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn test_login_failures_look_the_same() {
        let (app, _) = app().await;

        let (s1, _, unknown_client) = send(
            &app,
            post_json(
                "/login",
                json!({ "client_id": "ghost", "email": Harness::EMAIL, "password": Harness::PASSWORD }),
            ),
        )
        .await;
        let (s2, _, bad_password) = send(
            &app,
            post_json(
                "/login",
                json!({ "client_id": CLIENT_A, "email": Harness::EMAIL, "password": "nope" }),
            ),
        )
        .await;

        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s1, s2);
        assert_eq!(unknown_client["error"], bad_password["error"]);
        assert_eq!(
            unknown_client["error_description"],
            bad_password["error_description"]
        );
    }

    #[tokio::test]
    async fn test_token_endpoint_requires_basic_auth() {
        let (app, h) = app().await;
        let code = login(&app, CLIENT_A).await;

        let no_auth = post_json("/oauth/token", json!({ "code": code, "code_verifier": VERIFIER }));
        let (status, _, _) = send(&app, no_auth).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(&app, token_request(&code, CLIENT_B, CLIENT_A_SECRET)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // neither attempt touched the code
        assert_eq!(h.code_store.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let (app, _) = app().await;
        let req = Request::post("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_user_me_requires_valid_token() {
        let (app, _) = app().await;

        let req = Request::get("/user/me").body(Body::empty()).unwrap();
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(headers.contains_key(header::WWW_AUTHENTICATE));

        let req = Request::get("/user/me")
            .header(header::AUTHORIZATION, "Bearer not.a.jwt")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_token");
    }

    #[tokio::test]
    async fn test_client_me_returns_public_key() {
        let (app, _) = app().await;

        let req = Request::get("/client/me")
            .header(header::AUTHORIZATION, basic(CLIENT_B, CLIENT_B_SECRET))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "client-b app");
        assert!(body["public_key"].as_str().unwrap().contains("PUBLIC KEY"));
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (app, _) = app().await;

        let (status, _, user) = send(
            &app,
            post_json(
                "/user/register",
                json!({
                    "first_name": "Grace",
                    "last_name": "Hopper",
                    "email": "grace@navy.mil",
                    "password": "C0bol&Friends",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user["email"], "grace@navy.mil");
        assert!(user.get("password_hash").is_none());

        let (status, _, body) = send(
            &app,
            post_json(
                "/login",
                json!({ "client_id": CLIENT_A, "email": "grace@navy.mil", "password": "C0bol&Friends" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["code"].is_string());

        let (status, _, body) = send(
            &app,
            post_json("/user/register", json!({ "email": "grace@navy.mil", "password": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["fields"]["first_name"].is_array());
    }

    #[tokio::test]
    async fn test_register_client_over_http() {
        let (app, _) = app().await;

        let (status, _, client) =
            send(&app, post_json("/client/register", json!({ "name": "dashboard" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = client["id"].as_str().unwrap();
        let secret = client["secret"].as_str().unwrap();
        assert!(client.get("secret_hash").is_none());
        assert!(client.get("private_key").is_none());

        let req = Request::get("/client/me")
            .header(header::AUTHORIZATION, basic(id, secret))
            .body(Body::empty())
            .unwrap();
        let (status, _, profile) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["name"], "dashboard");
        assert_eq!(profile["public_key"], client["public_key"]);

        let (status, _, body) =
            send(&app, post_json("/client/register", json!({ "name": "dashboard" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["fields"]["name"].is_array());
    }

    #[tokio::test]
    async fn test_verify_email_over_http() {
        let (app, h) = app().await;

        let (status, _, _) = send(
            &app,
            post_json(
                "/user/register",
                json!({
                    "first_name": "Grace",
                    "last_name": "Hopper",
                    "email": "grace@navy.mil",
                    "password": "C0bol&Friends",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let code = h.email.last_verification_code("grace@navy.mil").unwrap();

        let verify = |code: &str| {
            Request::post(format!("/user/verify?code={}", code))
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, body) = send(&app, verify(&code)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Email verified successfully");

        let (status, _, body) = send(&app, verify(&code)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_description"], "Invalid or expired verification code");

        let (status, _, body) = send(
            &app,
            Request::post("/user/verify").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _, body) = send(
            &app,
            post_json("/user/verify/resend", json!({ "email": "grace@navy.mil" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_password_reset_over_http() {
        let (app, h) = app().await;

        let (status, _, known) = send(
            &app,
            post_json("/user/password/forgot", json!({ "email": Harness::EMAIL })),
        )
        .await;
        let (_, _, unknown) = send(
            &app,
            post_json("/user/password/forgot", json!({ "email": "nobody@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(known, unknown);

        let code = h.email.last_reset_code(Harness::EMAIL).unwrap();
        let reset = |code: &str, password: &str| {
            post_json(
                "/user/password/reset",
                json!({ "email": Harness::EMAIL, "code": code, "new_password": password }),
            )
        };

        let (status, _, body) = send(&app, reset(&code, "short")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["fields"]["new_password"].is_array());

        let (status, _, body) = send(&app, reset(&code, "Difference#Engine2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Password reset successfully");

        let (status, _, _) = send(
            &app,
            post_json(
                "/login",
                json!({ "client_id": CLIENT_A, "email": Harness::EMAIL, "password": "Difference#Engine2" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&app, reset(&code, "Difference#Engine3")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
    }
}
