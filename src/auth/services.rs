use tower_sessions::Session;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, RegisterRequest,
            UserResponse,
        },
        password::{hash_password, verify_password},
        repo::RepoError,
        repo_types::{NewUser, User},
        tokens,
        validation::{validate_new_password, validate_register},
    },
    session::{current_user_id, sign_in},
    state::AppState,
};

pub(crate) const USERNAME_TAKEN: &str = "username already taken";
pub(crate) const TRY_AGAIN: &str = "Something went horribly wrong, please try again";
pub(crate) const UNKNOWN_USER: &str = "That username doesn't exist";
pub(crate) const INCORRECT_PASSWORD: &str = "Incorrect password";
pub(crate) const TOKEN_EXPIRED: &str = "token expired";
pub(crate) const USER_GONE: &str = "user no longer exists";

pub fn reset_link(frontend_url: &str, token: &str) -> String {
    format!("{}/change-password/{}", frontend_url.trim_end_matches('/'), token)
}

/// Create the account and sign the caller in.
pub async fn register(
    state: &AppState,
    session: &Session,
    input: RegisterRequest,
) -> anyhow::Result<UserResponse> {
    if let Some(err) = validate_register(&input) {
        warn!(field = %err.field, "registration rejected");
        return Ok(err.into());
    }

    let hash = hash_password(&input.password).await?;
    let created = state
        .users
        .create(NewUser {
            username: &input.username,
            email: &input.email,
            password_hash: &hash,
        })
        .await;

    let user = match created {
        Ok(u) => u,
        // reported on username even when the email collided
        Err(RepoError::Conflict(constraint)) => {
            warn!(%constraint, username = %input.username, "registration conflict");
            return Ok(UserResponse::error("username", USERNAME_TAKEN));
        }
        Err(RepoError::Unknown(e)) => {
            error!(error = %e, "create user failed");
            return Ok(UserResponse::error("username", TRY_AGAIN));
        }
    };

    sign_in(session, user.id).await?;
    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(UserResponse::user(user))
}

pub async fn login(
    state: &AppState,
    session: &Session,
    input: LoginRequest,
) -> anyhow::Result<UserResponse> {
    let ident = input.username_or_email.as_str();
    let found = if ident.contains('@') {
        state.users.find_by_email(ident).await?
    } else {
        state.users.find_by_username(ident).await?
    };

    let Some(user) = found else {
        warn!(%ident, "login unknown user");
        return Ok(UserResponse::error("usernameOrEmail", UNKNOWN_USER));
    };

    if !verify_password(&input.password, &user.password_hash).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Ok(UserResponse::error("password", INCORRECT_PASSWORD));
    }

    sign_in(session, user.id).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(UserResponse::user(user))
}

/// Destroy the caller's session. Store failures are logged and reported as `false`.
///
/// The stored record is removed before the in-memory session is touched; on
/// failure the session is left unmodified and the cookie is not rewritten.
pub async fn logout(session: &Session) -> bool {
    if let Err(e) = session.delete().await {
        error!(error = %e, "session destroy failed");
        return false;
    }
    match session.flush().await {
        Ok(()) => {
            debug!("session destroyed");
            true
        }
        Err(e) => {
            error!(error = %e, "session flush failed");
            false
        }
    }
}

/// Always `true`, so callers cannot probe which emails are registered.
///
/// Token issue and mail dispatch run in a background task, so a known email
/// answers as fast as an unknown one.
pub async fn forgot_password(state: &AppState, input: ForgotPasswordRequest) -> bool {
    let user = match state.users.find_by_email(&input.email).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            debug!("password reset requested for unknown email");
            return true;
        }
        Err(e) => {
            error!(error = %e, "find_by_email failed");
            return true;
        }
    };

    tokio::spawn(send_reset_mail(state.clone(), user).in_current_span());
    true
}

async fn send_reset_mail(state: AppState, user: User) {
    let token = match tokens::issue(state.kv.as_ref(), user.id).await {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, user_id = %user.id, "storing reset token failed");
            return;
        }
    };

    let link = reset_link(&state.config.mail.frontend_url, &token);
    let body = format!(r#"<a href="{link}">reset password</a>"#);
    match state.mailer.send(&user.email, "Reset your password", &body).await {
        Ok(()) => info!(user_id = %user.id, "reset email dispatched"),
        Err(e) => error!(error = %e, user_id = %user.id, "reset email dispatch failed"),
    }
}

/// Consume a reset token, set the new password and sign the caller in.
pub async fn change_password(
    state: &AppState,
    session: &Session,
    input: ChangePasswordRequest,
) -> anyhow::Result<UserResponse> {
    if let Some(err) = validate_new_password(&input.new_password) {
        return Ok(err.into());
    }

    let Some(user_id) = tokens::resolve(state.kv.as_ref(), &input.token).await? else {
        warn!("change_password with unknown or expired token");
        return Ok(UserResponse::error("token", TOKEN_EXPIRED));
    };

    let Some(user) = state.users.find_by_id(user_id).await? else {
        warn!(%user_id, "reset token for deleted user");
        return Ok(UserResponse::error("token", USER_GONE));
    };

    let hash = hash_password(&input.new_password).await?;
    state.users.update_password(user.id, &hash).await?;

    // the password is already changed; a leftover token expires on its own
    if let Err(e) = tokens::revoke(state.kv.as_ref(), &input.token).await {
        error!(error = %e, user_id = %user.id, "reset token revoke failed");
    }

    sign_in(session, user.id).await?;
    info!(user_id = %user.id, "password changed");

    let user = state.users.find_by_id(user.id).await?.unwrap_or(user);
    Ok(UserResponse::user(user))
}

/// The signed-in user, if any. Never creates a session.
pub async fn me(state: &AppState, session: &Session) -> anyhow::Result<Option<User>> {
    let Some(user_id) = current_user_id(session).await? else {
        return Ok(None);
    };
    Ok(state.users.find_by_id(user_id).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        auth::repo::memory::MemoryUserStore,
        mail::recording::RecordingMailer,
        session::detached_session,
        state::test_config,
        storage::{
            memory::{DeleteFailsKvStore, MemoryKvStore},
            KvStore,
        },
    };

    struct Harness {
        state: AppState,
        users: Arc<MemoryUserStore>,
        mailer: Arc<RecordingMailer>,
    }

    impl Harness {
        fn with(users: MemoryUserStore, kv: Arc<dyn KvStore>, mailer: RecordingMailer) -> Self {
            let users = Arc::new(users);
            let mailer = Arc::new(mailer);
            let state = AppState::from_parts(
                Arc::new(test_config()),
                users.clone(),
                kv,
                mailer.clone(),
            );
            Self {
                state,
                users,
                mailer,
            }
        }

        fn new() -> Self {
            Self::with(
                MemoryUserStore::default(),
                Arc::new(MemoryKvStore::default()),
                RecordingMailer::default(),
            )
        }

        fn session(&self) -> Session {
            detached_session(self.state.kv.clone())
        }

        async fn register(&self, username: &str, email: &str, password: &str) -> UserResponse {
            register(
                &self.state,
                &self.session(),
                RegisterRequest {
                    username: username.into(),
                    email: email.into(),
                    password: password.into(),
                },
            )
            .await
            .unwrap()
        }

        async fn login(&self, session: &Session, ident: &str, password: &str) -> UserResponse {
            login(
                &self.state,
                session,
                LoginRequest {
                    username_or_email: ident.into(),
                    password: password.into(),
                },
            )
            .await
            .unwrap()
        }

        async fn change_password(&self, session: &Session, token: &str, pw: &str) -> UserResponse {
            change_password(
                &self.state,
                session,
                ChangePasswordRequest {
                    token: token.into(),
                    new_password: pw.into(),
                },
            )
            .await
            .unwrap()
        }

        /// Let the spawned reset dispatch run, then report how many mails went out.
        async fn mails_sent(&self) -> usize {
            for _ in 0..64 {
                tokio::task::yield_now().await;
            }
            self.mailer.sent.lock().await.len()
        }

        async fn last_reset_token(&self) -> String {
            self.mails_sent().await;
            let sent = self.mailer.sent.lock().await;
            let html = &sent.last().expect("a reset mail").html;
            let marker = "/change-password/";
            let start = html.find(marker).expect("reset link") + marker.len();
            html[start..].split('"').next().unwrap().to_string()
        }
    }

    fn forgot(email: &str) -> ForgotPasswordRequest {
        ForgotPasswordRequest {
            email: email.into(),
        }
    }

    #[tokio::test]
    async fn register_signs_in_new_user() {
        let h = Harness::new();
        let session = h.session();
        let res = register(
            &h.state,
            &session,
            RegisterRequest {
                username: "alice".into(),
                email: "alice@x.com".into(),
                password: "password1".into(),
            },
        )
        .await
        .unwrap();

        let user = res.user.expect("user returned");
        assert!(res.errors.is_none());
        assert_ne!(user.password_hash, "password1");
        assert_eq!(current_user_id(&session).await.unwrap(), Some(user.id));
        assert_eq!(me(&h.state, &session).await.unwrap().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn invalid_registration_returns_single_error_and_no_session() {
        let h = Harness::new();
        let session = h.session();
        let res = register(
            &h.state,
            &session,
            RegisterRequest {
                username: "al".into(),
                email: "alice@x.com".into(),
                password: "password1".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(res.errors().len(), 1);
        assert_eq!(res.errors()[0].field, "username");
        assert!(res.user.is_none());
        assert_eq!(current_user_id(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_username_is_reported_and_first_user_kept() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;

        let res = h.register("alice", "other@x.com", "password2").await;
        assert_eq!(res.errors()[0].field, "username");
        assert_eq!(res.errors()[0].message, USERNAME_TAKEN);

        let first = h.state.users.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(first.email, "alice@x.com");
        assert!(verify_password("password1", &first.password_hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_is_reported_on_username() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;
        let res = h.register("alicia", "alice@x.com", "password1").await;
        assert_eq!(res.errors()[0].field, "username");
        assert_eq!(res.errors()[0].message, USERNAME_TAKEN);
    }

    #[tokio::test]
    async fn unclassified_store_failure_becomes_generic_error() {
        let h = Harness::with(
            MemoryUserStore::broken(),
            Arc::new(MemoryKvStore::default()),
            RecordingMailer::default(),
        );
        let res = h.register("alice", "alice@x.com", "password1").await;
        assert_eq!(res.errors()[0].field, "username");
        assert_eq!(res.errors()[0].message, TRY_AGAIN);
    }

    #[tokio::test]
    async fn login_by_username_or_email() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;

        let session = h.session();
        let res = h.login(&session, "alice", "password1").await;
        assert_eq!(res.user.unwrap().username, "alice");

        let session = h.session();
        let res = h.login(&session, "alice@x.com", "password1").await;
        let user = res.user.unwrap();
        assert_eq!(current_user_id(&session).await.unwrap(), Some(user.id));
    }

    #[tokio::test]
    async fn login_with_wrong_password_does_not_sign_in() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;

        let session = h.session();
        let res = h.login(&session, "alice", "wrong-password").await;
        assert_eq!(res.errors()[0].field, "password");
        assert_eq!(res.errors()[0].message, INCORRECT_PASSWORD);
        assert!(me(&h.state, &session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_with_unknown_identifier() {
        let h = Harness::new();
        let res = h.login(&h.session(), "nobody", "password1").await;
        assert_eq!(res.errors()[0].field, "usernameOrEmail");
        assert_eq!(res.errors()[0].message, UNKNOWN_USER);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;
        let session = h.session();
        h.login(&session, "alice", "password1").await;
        session.save().await.unwrap();

        assert!(logout(&session).await);
        assert!(me(&h.state, &session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_reports_false_when_store_fails() {
        let h = Harness::with(
            MemoryUserStore::default(),
            Arc::new(DeleteFailsKvStore::default()),
            RecordingMailer::default(),
        );
        h.register("alice", "alice@x.com", "password1").await;
        let session = h.session();
        h.login(&session, "alice", "password1").await;
        session.save().await.unwrap();

        assert!(!logout(&session).await);
        // nothing was cleared, so the caller is still signed in
        assert!(session.id().is_some());
        assert!(!session.is_modified());
        assert!(me(&h.state, &session).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn forgot_password_is_true_for_known_and_unknown_emails() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;

        assert!(forgot_password(&h.state, forgot("nobody@x.com")).await);
        assert_eq!(h.mails_sent().await, 0);

        assert!(forgot_password(&h.state, forgot("alice@x.com")).await);
        assert_eq!(h.mails_sent().await, 1);
        let sent = h.mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@x.com");
        assert!(sent[0].html.contains("http://localhost:3000/change-password/"));
    }

    #[tokio::test]
    async fn forgot_password_survives_mail_failure() {
        let h = Harness::with(
            MemoryUserStore::default(),
            Arc::new(MemoryKvStore::default()),
            RecordingMailer {
                fail: true,
                ..Default::default()
            },
        );
        h.register("alice", "alice@x.com", "password1").await;
        assert!(forgot_password(&h.state, forgot("alice@x.com")).await);
        assert_eq!(h.mails_sent().await, 0);
    }

    #[tokio::test]
    async fn reset_token_is_single_use() {
        let h = Harness::new();
        h.register("alice", "alice@x.com", "password1").await;
        forgot_password(&h.state, forgot("alice@x.com")).await;
        let token = h.last_reset_token().await;

        let session = h.session();
        let res = h.change_password(&session, &token, "new-password").await;
        let user = res.user.expect("password changed");
        assert_eq!(current_user_id(&session).await.unwrap(), Some(user.id));

        let again = h.change_password(&h.session(), &token, "another-password").await;
        assert_eq!(again.errors()[0].field, "token");
        assert_eq!(again.errors()[0].message, TOKEN_EXPIRED);

        let old = h.login(&h.session(), "alice", "password1").await;
        assert_eq!(old.errors()[0].message, INCORRECT_PASSWORD);
        let new = h.login(&h.session(), "alice", "new-password").await;
        assert!(new.user.is_some());
    }

    #[tokio::test]
    async fn change_password_checks_length_before_token() {
        let h = Harness::new();
        let res = h.change_password(&h.session(), "whatever", "abc").await;
        assert_eq!(res.errors().len(), 1);
        assert_eq!(res.errors()[0].field, "newPassword");
    }

    #[tokio::test]
    async fn change_password_for_deleted_user() {
        let h = Harness::new();
        let user = h.register("alice", "alice@x.com", "password1").await.user.unwrap();
        forgot_password(&h.state, forgot("alice@x.com")).await;
        let token = h.last_reset_token().await;
        h.users.remove(user.id).await;

        let res = h.change_password(&h.session(), &token, "new-password").await;
        assert_eq!(res.errors()[0].field, "token");
        assert_eq!(res.errors()[0].message, USER_GONE);
    }

    #[test]
    fn reset_link_joins_base_and_token() {
        assert_eq!(
            reset_link("http://localhost:3000/", "abc"),
            "http://localhost:3000/change-password/abc"
        );
    }
}
