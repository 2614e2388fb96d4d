//! Thin wrappers around the hosted auth service.
//!
//! The service owns users, passwords and tokens. This module only forwards
//! the calls and keeps the resulting session on the [`ClientHandle`] so that
//! later repository calls are sent with the user's access token.

use api_types::auth::{AuthUser, PasswordCredentials, Session, SignUp, SignUpResponse, UserMetadata};
use chrono::Utc;
use reqwest::{Method, Response, StatusCode};

use crate::{
    client::{ClientHandle, error_message},
    error::{AuthError, Error, Result},
};

impl ClientHandle {
    /// Registers a new account.
    ///
    /// When the service returns a session right away (no email confirmation
    /// pending) the handle is signed in as the new user.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<AuthUser> {
        check_credentials(email, password)?;

        let body = SignUp {
            email: email.to_string(),
            password: password.to_string(),
            data: UserMetadata {
                full_name: Some(display_name.to_string()).filter(|name| !name.is_empty()),
            },
        };
        let response = self
            .request(Method::POST, self.auth_url("signup")?)
            .json(&body)
            .send()
            .await?;
        let response = auth_success(response).await?;

        match response.json::<SignUpResponse>().await? {
            SignUpResponse::Session(session) => {
                let user = session.user.clone();
                tracing::info!(user_id = %user.id, "signed up and signed in");
                self.set_session(Some(session));
                Ok(user)
            }
            SignUpResponse::User(user) => {
                tracing::info!(user_id = %user.id, "signed up, confirmation pending");
                Ok(user)
            }
        }
    }

    /// Password sign-in. Replaces any previous session on success.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        check_credentials(email, password)?;

        let mut url = self.auth_url("token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");

        let response = self
            .request(Method::POST, url)
            .json(&PasswordCredentials {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let response = auth_success(response).await?;
        let session = response.json::<Session>().await?;

        tracing::info!(user_id = %session.user.id, "signed in");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Ends the session locally and on the service.
    ///
    /// Signing out without a session is a no-op. The local session is
    /// dropped even when the service call fails.
    pub async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.session() else {
            return Ok(());
        };
        self.set_session(None);

        let response = self
            .request_as(Method::POST, self.auth_url("logout")?, &session.access_token)
            .send()
            .await?;
        let status = response.status();
        // An expired token is already signed out as far as the service cares.
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            tracing::info!(user_id = %session.user.id, "signed out");
            return Ok(());
        }
        let message = error_message(response).await;
        Err(AuthError::Rejected { status, message }.into())
    }

    /// The session if one exists and has not expired.
    pub fn current_session(&self) -> Option<Session> {
        self.session()
            .filter(|session| !session.is_expired_at(Utc::now()))
    }

    /// Precondition of calls on policy-protected collections.
    pub fn require_session(&self) -> Result<Session> {
        self.current_session()
            .ok_or_else(|| AuthError::NoSession.into())
    }
}

fn check_credentials(email: &str, password: &str) -> Result<()> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(Error::Validation(format!("invalid email {email:?}")));
    }
    if password.is_empty() {
        return Err(Error::Validation("password is empty".to_string()));
    }
    Ok(())
}

async fn auth_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    tracing::debug!(%status, %message, "auth call failed");

    let err = match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
            AuthError::InvalidCredentials(message)
        }
        _ => AuthError::Rejected { status, message },
    };
    Err(err.into())
}
