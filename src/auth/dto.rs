use serde::{Deserialize, Serialize};

use crate::auth::repo_types::User;

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Request body for login. The identifier is an email when it contains `@`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub token: String,
    pub new_password: String,
}

/// A validation or conflict failure attributed to one input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Either the user or the field errors, never both.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl UserResponse {
    pub fn user(user: User) -> Self {
        Self {
            errors: None,
            user: Some(user),
        }
    }

    pub fn error(field: &str, message: &str) -> Self {
        Self {
            errors: Some(vec![FieldError::new(field, message)]),
            user: None,
        }
    }

    #[cfg(test)]
    pub fn errors(&self) -> &[FieldError] {
        self.errors.as_deref().unwrap_or_default()
    }
}

impl From<FieldError> for UserResponse {
    fn from(err: FieldError) -> Self {
        Self {
            errors: Some(vec![err]),
            user: None,
        }
    }
}
